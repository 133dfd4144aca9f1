use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tracing::{trace, warn};

use crate::{
    alarm::{Alarm, AlarmStatus, Severity},
    database::Database,
    dbr::{DbrBasicType, DbrValue},
    links::ValueLinks,
    record::Record,
};

use super::{ConfigError, MemoryValueProcessor, Processor, ProcessorConfig, link_listener};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// A momentary flag: writing true raises it, and it drops back after the timeout
///
/// Each raise can also be forwarded to a set of links. A new raise while the flag
/// is up restarts the timeout.
#[derive(Debug)]
pub struct CommandValueProcessor {
    pub(crate) memory: MemoryValueProcessor,
    timeout: Duration,
    forward_names: Vec<String>,
    links: Mutex<Option<Arc<ValueLinks>>>,
    pulse: AtomicU64,
}

impl CommandValueProcessor {
    pub fn new(timeout: Duration) -> Self {
        CommandValueProcessor {
            memory: MemoryValueProcessor::new(DbrBasicType::Enum, 1),
            timeout,
            forward_names: Vec::new(),
            links: Mutex::new(None),
            pulse: AtomicU64::new(0),
        }
    }

    /// Also write each raise to these links
    pub fn forward(mut self, names: Vec<String>) -> Self {
        self.forward_names = names;
        self
    }

    pub fn configure(config: &ProcessorConfig) -> Result<Self, ConfigError> {
        Ok(
            CommandValueProcessor::new(config.millis("timeout_ms")?.unwrap_or(DEFAULT_TIMEOUT))
                .forward(config.list("forward")),
        )
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn activate(&self, record: &Record, database: &Database) {
        if self.forward_names.is_empty() {
            return;
        }
        let links = ValueLinks::new(
            record.name(),
            self.forward_names.clone(),
            link_listener(record),
        );
        if let Some(previous) = self.links.lock().unwrap().replace(links.clone()) {
            previous.deactivate();
        }
        links.activate(database);
    }

    pub(crate) fn deactivate(&self) {
        if let Some(links) = self.links.lock().unwrap().take() {
            links.deactivate();
        }
    }

    pub(crate) fn set_value(&self, record: &Record, value: DbrValue, notify: bool) -> bool {
        if !value.as_bool() {
            self.pulse.fetch_add(1, Ordering::SeqCst);
            return self
                .memory
                .set_value(record, DbrValue::from(false), None, notify, false);
        }
        let pulse = self.pulse.fetch_add(1, Ordering::SeqCst) + 1;
        let updated = self
            .memory
            .set_value(record, DbrValue::from(true), None, notify, true);

        let links = self.links.lock().unwrap().clone();
        if let Some(links) = links {
            match links.set_value_to_all(value) {
                Ok(()) if record.alarm_status() == AlarmStatus::Link => {
                    record.update_alarm(Alarm::NONE, true);
                }
                Ok(()) => (),
                Err(e) => {
                    warn!("{}: forwarding command failed: {e}", record.name());
                    record.update_alarm(Alarm::new(Severity::Major, AlarmStatus::Link), true);
                }
            }
        }
        self.schedule_reset(record, pulse);
        updated
    }

    fn schedule_reset(&self, record: &Record, pulse: u64) {
        let Some(database) = record.database() else {
            warn!("{}: no database to schedule the reset on", record.name());
            return;
        };
        let weak = record.handle();
        database.scheduler().schedule(
            move || {
                let Some(record) = weak.upgrade() else {
                    return;
                };
                if let Processor::Command(processor) = &*record.processor() {
                    processor.reset(&record, pulse);
                }
            },
            self.timeout,
        );
    }

    /// Drop the flag, unless a newer raise has happened since `pulse`
    fn reset(&self, record: &Record, pulse: u64) {
        if self.pulse.load(Ordering::SeqCst) != pulse {
            trace!("{}: superseded reset", record.name());
            return;
        }
        self.memory
            .set_value(record, DbrValue::from(false), None, true, false);
    }
}
