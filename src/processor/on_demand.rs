use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use crate::{
    alarm::{Alarm, AlarmStatus, Severity},
    dbr::DbrValue,
    record::Record,
};

use super::MemoryValueProcessor;

/// Supplies a fresh value for a record, or `None` if it cannot be read
pub type ValueProvider = Arc<dyn Fn(&Record) -> Option<DbrValue> + Send + Sync>;

/// Fetches its value from a provider when read, at most once per `max_age`
pub struct OnDemandValueProcessor {
    pub(crate) memory: MemoryValueProcessor,
    provider: ValueProvider,
    max_age: Duration,
    fetched: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for OnDemandValueProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnDemandValueProcessor")
            .field("memory", &self.memory)
            .field("max_age", &self.max_age)
            .finish_non_exhaustive()
    }
}

impl OnDemandValueProcessor {
    pub fn new(memory: MemoryValueProcessor, provider: ValueProvider, max_age: Duration) -> Self {
        OnDemandValueProcessor {
            memory,
            provider,
            max_age,
            fetched: Mutex::new(None),
        }
    }

    fn is_stale(&self) -> bool {
        self.fetched
            .lock()
            .unwrap()
            .is_none_or(|at| at.elapsed() >= self.max_age)
    }

    pub(crate) fn get_value(&self, record: &Record) -> DbrValue {
        if self.is_stale() {
            self.refresh(record);
        }
        self.memory.value()
    }

    /// Ask the provider now, whatever the age of the current value
    pub(crate) fn refresh(&self, record: &Record) {
        // Stamp first, so a provider that reads the record does not recurse
        *self.fetched.lock().unwrap() = Some(Instant::now());
        match (self.provider)(record) {
            Some(value) => {
                self.memory
                    .set_value(record, value, Some(Alarm::NONE), true, false);
            }
            None => {
                record.update_alarm(Alarm::new(Severity::Invalid, AlarmStatus::Read), true);
            }
        }
    }
}
