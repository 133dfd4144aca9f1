use std::{collections::HashMap, sync::Arc};

use tracing::debug;

use crate::record::Record;

use super::{
    CommandValueProcessor, ConfigError, DefaultAlarmProcessor, EnumValueProcessor,
    LinkedValueProcessor, MemoryValueProcessor, OnDemandValueProcessor, Processor,
    ProcessorConfig, ValueProvider,
};
use crate::dbr::DbrBasicType;

/// Builds a processor from its configuration
pub type ProcessorFactory = Arc<
    dyn Fn(&ProcessorConfig, &ProcessorRegistry) -> Result<Processor, ConfigError> + Send + Sync,
>;

/// Maps configuration tags to processor constructors
///
/// The built-in tags are `memory`, `linked`, `alarm`, `command`, `enum` and
/// `ondemand`. The `ondemand` processor names its value source with the
/// `provider` property, looked up among the registered providers.
pub struct ProcessorRegistry {
    factories: HashMap<String, ProcessorFactory>,
    providers: HashMap<String, ValueProvider>,
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        let mut registry = ProcessorRegistry {
            factories: HashMap::new(),
            providers: HashMap::new(),
        };
        registry.register("memory", |config, _| {
            Ok(Processor::Memory(MemoryValueProcessor::configure(
                config,
                DbrBasicType::Double,
                &[],
            )?))
        });
        registry.register("linked", |config, _| {
            Ok(Processor::Linked(LinkedValueProcessor::configure(config)?))
        });
        registry.register("alarm", |config, _| {
            Ok(Processor::Alarm(DefaultAlarmProcessor::configure(config)?))
        });
        registry.register("command", |config, _| {
            Ok(Processor::Command(CommandValueProcessor::configure(config)?))
        });
        registry.register("enum", |config, _| {
            Ok(Processor::Enum(EnumValueProcessor::configure(config)?))
        });
        registry.register("ondemand", |config, registry| {
            let name = config.require("provider")?;
            let provider = registry
                .provider(name)
                .ok_or_else(|| ConfigError::UnknownProvider(name.to_string()))?;
            Ok(Processor::OnDemand(OnDemandValueProcessor::new(
                MemoryValueProcessor::configure(config, DbrBasicType::Double, &[])?,
                provider,
                config.millis("max_age_ms")?.unwrap_or_default(),
            )))
        });
        registry
    }
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the constructor for `tag`
    pub fn register<F>(&mut self, tag: &str, factory: F)
    where
        F: Fn(&ProcessorConfig, &ProcessorRegistry) -> Result<Processor, ConfigError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(tag.to_lowercase(), Arc::new(factory));
    }

    pub fn register_provider(&mut self, name: &str, provider: ValueProvider) {
        self.providers.insert(name.to_string(), provider);
    }

    pub fn provider(&self, name: &str) -> Option<ValueProvider> {
        self.providers.get(name).cloned()
    }

    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.factories.keys().cloned().collect();
        tags.sort();
        tags
    }

    pub fn create(&self, tag: &str, config: &ProcessorConfig) -> Result<Processor, ConfigError> {
        let factory = self
            .factories
            .get(&tag.trim().to_lowercase())
            .ok_or_else(|| ConfigError::UnknownProcessor(tag.to_string()))?;
        factory(config, self)
    }

    /// Build a complete record from its properties
    ///
    /// `processor` selects the tag (default `memory`); `description`, `units`,
    /// `precision`, `persistent` and `writable` describe the record itself. All
    /// other properties go to the processor.
    pub fn build_record(
        &self,
        name: &str,
        config: &ProcessorConfig,
    ) -> Result<Arc<Record>, ConfigError> {
        let tag = config.get("processor").unwrap_or("memory");
        let processor = self.create(tag, config)?;
        debug!("Configured {name} as {tag}");
        let mut builder = Record::builder(name)
            .persistent(config.flag("persistent", false)?)
            .writable(config.flag("writable_record", true)?)
            .processor(processor);
        if let Some(description) = config.get("description") {
            builder = builder.description(description);
        }
        if let Some(units) = config.get("units") {
            builder = builder.units(units);
        }
        if let Some(precision) = config.parse("precision")? {
            builder = builder.precision(precision);
        }
        Ok(builder.build())
    }
}
