use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use tracing::{debug, warn};

use crate::{
    alarm::{Alarm, AlarmStatus, Severity},
    database::Database,
    dbr::{DbrBasicType, DbrValue, Limits},
    links::ValueLinks,
    record::Record,
};

use super::{
    ConfigError, MemoryValueProcessor, ProcessorConfig, link_listener,
    transform::{Combine, Transform},
};

/// Binds a record to one or more other PVs
///
/// Link updates flow in through the forward transform; local writes flow out
/// through its inverse when the processor is writable.
#[derive(Debug)]
pub struct LinkedValueProcessor {
    pub(crate) memory: MemoryValueProcessor,
    link_names: Mutex<Vec<String>>,
    links: Mutex<Option<Arc<ValueLinks>>>,
    transform: Option<Transform>,
    combine: Combine,
    writable: bool,
    metadata_copied: AtomicBool,
}

impl LinkedValueProcessor {
    pub fn new(memory: MemoryValueProcessor, link_names: Vec<String>) -> Self {
        LinkedValueProcessor {
            memory,
            link_names: Mutex::new(link_names),
            links: Mutex::new(None),
            transform: None,
            combine: Combine::First,
            writable: false,
            metadata_copied: AtomicBool::new(false),
        }
    }

    pub fn transform(mut self, transform: Transform) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn combine(mut self, combine: Combine) -> Self {
        self.combine = combine;
        self
    }

    /// Push local writes out to the links
    pub fn writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    pub fn configure(config: &ProcessorConfig) -> Result<Self, ConfigError> {
        let names = config.list("links");
        if names.is_empty() {
            return Err(ConfigError::MissingProperty("links".to_string()));
        }
        let combine: Combine = config.parse("combine")?.unwrap_or_default();
        let default_type = match combine {
            Combine::First => DbrBasicType::Double,
            Combine::Bits => DbrBasicType::Long,
            Combine::And | Combine::Or | Combine::Bit(_) => DbrBasicType::Enum,
        };
        let memory = MemoryValueProcessor::configure(config, default_type, &[])?;
        let mut processor = LinkedValueProcessor::new(memory, names)
            .combine(combine)
            .writable(config.flag("writable", false)?);
        if let Some(transform) = config.parse::<Transform>("transform")? {
            processor = processor.transform(transform);
        }
        Ok(processor)
    }

    pub fn link_names(&self) -> Vec<String> {
        self.link_names.lock().unwrap().clone()
    }

    /// The live links, if activated
    pub fn links(&self) -> Option<Arc<ValueLinks>> {
        self.links.lock().unwrap().clone()
    }

    pub(crate) fn activate(&self, record: &Record, database: &Database) {
        let links = ValueLinks::new(record.name(), self.link_names(), link_listener(record));
        if let Some(previous) = self.links.lock().unwrap().replace(links.clone()) {
            previous.deactivate();
        }
        self.metadata_copied.store(false, Ordering::SeqCst);
        links.activate(database);
    }

    pub(crate) fn deactivate(&self) {
        if let Some(links) = self.links.lock().unwrap().take() {
            links.deactivate();
        }
    }

    /// Point at a new set of names, replacing any live links
    pub fn reconnect(&self, record: &Record, names: Vec<String>) {
        debug!("{}: reconnecting to {names:?}", record.name());
        *self.link_names.lock().unwrap() = names;
        self.deactivate();
        if record.is_activated()
            && let Some(database) = record.database()
        {
            self.activate(record, &database);
        }
    }

    /// Local write: always refreshes the value, then pushes it out if writable
    pub(crate) fn set_value(&self, record: &Record, value: DbrValue) -> bool {
        let updated = self.memory.set_value(record, value.clone(), None, true, true);
        if !self.writable {
            return updated;
        }
        let outgoing = match &self.transform {
            Some(transform) => match transform.inverse_value(&value) {
                Some(v) => v,
                None => {
                    warn!("{}: no inverse for {value:?}", record.name());
                    record.update_alarm(Alarm::new(Severity::Major, AlarmStatus::Calc), true);
                    return updated;
                }
            },
            None => value,
        };
        if let Some(links) = self.links()
            && let Err(e) = links.set_value_to_all(outgoing)
        {
            warn!("{}: write through links failed: {e}", record.name());
            record.update_alarm(Alarm::new(Severity::Major, AlarmStatus::Link), true);
        }
        updated
    }

    pub(crate) fn on_links_update(&self, record: &Record, links: &ValueLinks) {
        if links.is_invalid() {
            record.update_alarm(Alarm::LINK_INVALID, true);
            return;
        }
        if !links.is_ready() {
            return;
        }
        let holders = links.consume();
        let alarm = links.last_alarm();
        let Some(value) = self.combine.combine(&holders) else {
            return;
        };
        let value = match &self.transform {
            Some(transform) => transform.forward_value(&value),
            None => value,
        };
        self.copy_metadata_once(record, links);
        self.memory.set_value(record, value, Some(alarm), true, false);
    }

    /// Re-read the links without waiting for an update
    pub(crate) fn reevaluate(&self, record: &Record) {
        if let Some(links) = self.links() {
            self.on_links_update(record, &links);
        }
    }

    /// Fill in units, limits and precision the record does not set itself
    fn copy_metadata_once(&self, record: &Record, links: &ValueLinks) {
        if self.metadata_copied.load(Ordering::SeqCst) {
            return;
        }
        let Some(source) = links.first_metadata() else {
            return;
        };
        if self.metadata_copied.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut metadata = record.metadata();
        if metadata.units.is_empty() {
            metadata.units = source.units;
        }
        if metadata.limits == Limits::default() {
            metadata.limits = source.limits;
        }
        if metadata.precision.is_none() {
            metadata.precision = source.precision;
        }
        if metadata.enum_labels.is_empty() {
            metadata.enum_labels = source.enum_labels;
        }
        record.set_metadata(metadata);
    }
}
