//! Value processors: the strategies that store or derive a record's value.
//!
//! The set of processors is closed. Each variant embeds a
//! [`MemoryValueProcessor`] holding the value and adds its own behaviour around
//! it:
//!
//! - [`Processor::Memory`]: a plain stored value.
//! - [`Processor::Linked`]: mirrors, combines or writes through to other PVs.
//! - [`Processor::Alarm`]: a gated alarm flag with noise suppression.
//! - [`Processor::Command`]: a pulse that resets itself after a timeout.
//! - [`Processor::Enum`]: a labelled enumeration.
//! - [`Processor::OnDemand`]: a value fetched from a provider when read.
//!
//! Processors never hold a reference to their record. Every call that needs the
//! record is handed it; deferred work keeps a weak handle.

use std::{collections::BTreeMap, str::FromStr, time::Duration};

use thiserror::Error;

use crate::{
    alarm::Alarm,
    database::Database,
    dbr::{ConversionError, DbrBasicType, DbrValue},
    links::ValueLinks,
    record::{Record, RecordError},
    utils::split_escaped,
};

mod alarm;
mod command;
mod enumerated;
mod linked;
mod memory;
mod on_demand;
mod registry;
mod transform;

pub use alarm::DefaultAlarmProcessor;
pub use command::CommandValueProcessor;
pub use enumerated::EnumValueProcessor;
pub use linked::LinkedValueProcessor;
pub use memory::MemoryValueProcessor;
pub use on_demand::{OnDemandValueProcessor, ValueProvider};
pub use registry::{ProcessorFactory, ProcessorRegistry};
pub use transform::{Combine, Transform};

/// Persisted field holding the value
const VALUE_FIELD: &str = "value";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown processor type '{0}'")]
    UnknownProcessor(String),
    #[error("missing property '{0}'")]
    MissingProperty(String),
    #[error("invalid value '{value}' for property '{key}'")]
    InvalidProperty { key: String, value: String },
    #[error("no value provider registered as '{0}'")]
    UnknownProvider(String),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
}

/// String properties describing one processor or record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessorConfig {
    properties: BTreeMap<String, String>,
}

impl ProcessorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.properties.insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> Result<&str, ConfigError> {
        self.get(key)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingProperty(key.to_string()))
    }

    pub fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        self.get(key)
            .map(|value| {
                value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidProperty {
                        key: key.to_string(),
                        value: value.to_string(),
                    })
            })
            .transpose()
    }

    pub fn flag(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        let Some(value) = self.get(key) else {
            return Ok(default);
        };
        match value.trim().to_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(true),
            "false" | "no" | "off" | "0" => Ok(false),
            _ => Err(ConfigError::InvalidProperty {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// A duration given in milliseconds
    pub fn millis(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }

    /// A comma-separated list, empty entries dropped
    pub fn list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                split_escaped(v)
                    .into_iter()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ProcessorConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        ProcessorConfig {
            properties: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl MemoryValueProcessor {
    /// Build from `type`, `count`, `initial`, `fixed` and `trigger_ms`
    ///
    /// `default_type` applies when no `type` is given.
    pub fn configure(
        config: &ProcessorConfig,
        default_type: DbrBasicType,
        labels: &[String],
    ) -> Result<Self, ConfigError> {
        let basic_type = config.parse("type")?.unwrap_or(default_type);
        let count = config.parse("count")?.unwrap_or(1usize);
        let processor = match config.get("initial") {
            Some(text) => {
                let value = DbrValue::from_display_string(text, basic_type, labels)?;
                MemoryValueProcessor::with_initial(value.coerce(basic_type, count)?)
            }
            None => MemoryValueProcessor::new(basic_type, count),
        };
        Ok(processor
            .fixed(config.flag("fixed", false)?)
            .trigger(config.millis("trigger_ms")?))
    }
}

#[derive(Debug)]
pub enum Processor {
    Memory(MemoryValueProcessor),
    Linked(LinkedValueProcessor),
    Alarm(DefaultAlarmProcessor),
    Command(CommandValueProcessor),
    Enum(EnumValueProcessor),
    OnDemand(OnDemandValueProcessor),
}

impl Processor {
    /// The embedded value store
    pub fn memory(&self) -> &MemoryValueProcessor {
        match self {
            Processor::Memory(p) => p,
            Processor::Linked(p) => &p.memory,
            Processor::Alarm(p) => &p.memory,
            Processor::Command(p) => &p.memory,
            Processor::Enum(p) => &p.memory,
            Processor::OnDemand(p) => &p.memory,
        }
    }

    pub fn enum_labels(&self) -> Option<Vec<String>> {
        match self {
            Processor::Enum(p) => Some(p.labels().to_vec()),
            _ => None,
        }
    }

    pub fn get_value(&self, record: &Record) -> DbrValue {
        match self {
            Processor::OnDemand(p) => p.get_value(record),
            _ => self.memory().value(),
        }
    }

    /// Apply a value to `record`. Returns whether the stored value was updated.
    pub fn set_value(
        &self,
        record: &Record,
        value: DbrValue,
        alarm: Option<Alarm>,
        notify: bool,
        force: bool,
    ) -> bool {
        match self {
            Processor::Linked(p) => p.set_value(record, value),
            Processor::Command(p) => p.set_value(record, value, notify),
            Processor::Enum(p) => p.set_value(record, value, alarm, notify, force),
            _ => self.memory().set_value(record, value, alarm, notify, force),
        }
    }

    pub fn activate(&self, record: &Record, database: &Database) {
        match self {
            Processor::Memory(p) if p.is_fixed() => {
                record.update_alarm(Alarm::NONE, true);
            }
            Processor::Linked(p) => p.activate(record, database),
            Processor::Alarm(p) => p.activate(record, database),
            Processor::Command(p) => p.activate(record, database),
            _ => (),
        }
    }

    pub fn deactivate(&self) {
        match self {
            Processor::Linked(p) => p.deactivate(),
            Processor::Alarm(p) => p.deactivate(),
            Processor::Command(p) => p.deactivate(),
            _ => (),
        }
    }

    pub fn trigger(&self) -> Option<Duration> {
        self.memory().trigger_period()
    }

    /// Periodic re-evaluation
    pub fn process(&self, record: &Record) {
        match self {
            Processor::Linked(p) => p.reevaluate(record),
            Processor::Alarm(p) => p.update_alarm_status(record),
            Processor::OnDemand(p) => p.refresh(record),
            _ => (),
        }
    }

    /// Settled update from a set of links owned by this processor
    pub(crate) fn on_links_update(&self, record: &Record, links: &ValueLinks) {
        match self {
            Processor::Linked(p) => p.on_links_update(record, links),
            Processor::Alarm(p) => p.on_links_update(record, links),
            _ => (),
        }
    }

    pub fn stored_field_names(&self) -> &'static [&'static str] {
        match self {
            Processor::Command(_) | Processor::OnDemand(_) => &[],
            _ => &[VALUE_FIELD],
        }
    }

    /// Persisted fields as `(field, text)` pairs
    pub fn store_fields(&self, _record: &Record) -> Vec<(String, String)> {
        self.stored_field_names()
            .iter()
            .map(|field| {
                (
                    field.to_string(),
                    self.memory().value().to_display_string(None, &[]),
                )
            })
            .collect()
    }

    pub fn restore_field(
        &self,
        record: &Record,
        field: &str,
        text: &str,
    ) -> Result<(), RecordError> {
        if field != VALUE_FIELD {
            return Ok(());
        }
        let memory = self.memory();
        let value =
            DbrValue::from_display_string(text, memory.basic_type(), &record.enum_labels())?;
        memory.set_value(record, value, Some(Alarm::NONE), true, true);
        Ok(())
    }
}

/// Hand a settled link update to whatever processor `record` currently has
pub(crate) fn link_listener(record: &Record) -> crate::links::LinkListener {
    let weak = record.handle();
    std::sync::Arc::new(move |links: &ValueLinks| {
        if let Some(record) = weak.upgrade() {
            record.processor().on_links_update(&record, links);
        }
    })
}
