use std::{
    sync::Mutex,
    time::{Duration, SystemTime},
};

use tracing::warn;

use crate::{
    alarm::Alarm,
    dbr::{DbrBasicType, DbrValue},
    record::Record,
};

#[derive(Debug)]
struct MemoryState {
    value: DbrValue,
    timestamp: SystemTime,
}

/// Stored value with change detection
///
/// Every processor variant embeds one of these, and it alone owns the value and
/// timestamp that the record reports.
#[derive(Debug)]
pub struct MemoryValueProcessor {
    basic_type: DbrBasicType,
    count: usize,
    fixed: bool,
    trigger: Option<Duration>,
    state: Mutex<MemoryState>,
}

impl MemoryValueProcessor {
    /// A zeroed value of the given type and element count
    pub fn new(basic_type: DbrBasicType, count: usize) -> Self {
        Self::with_initial(DbrValue::default_for(basic_type, count.max(1)))
    }

    /// Take type and count from an initial value
    pub fn with_initial(value: DbrValue) -> Self {
        MemoryValueProcessor {
            basic_type: value.get_type(),
            count: value.get_count(),
            fixed: false,
            trigger: None,
            state: Mutex::new(MemoryState {
                value,
                timestamp: SystemTime::now(),
            }),
        }
    }

    /// A fixed value ignores every update
    pub fn fixed(mut self, fixed: bool) -> Self {
        self.fixed = fixed;
        self
    }

    pub fn trigger(mut self, trigger: Option<Duration>) -> Self {
        self.trigger = trigger.filter(|t| !t.is_zero());
        self
    }

    pub fn basic_type(&self) -> DbrBasicType {
        self.basic_type
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    pub fn trigger_period(&self) -> Option<Duration> {
        self.trigger
    }

    pub fn value(&self) -> DbrValue {
        self.state.lock().unwrap().value.clone()
    }

    pub fn timestamp(&self) -> SystemTime {
        self.state.lock().unwrap().timestamp
    }

    /// Store a new value on behalf of `record`
    ///
    /// The value is coerced to this processor's type and shape. It is stored when
    /// `force` is set or it differs from the current value; otherwise only `alarm`
    /// (if given) is applied. A record whose value was never confirmed always takes
    /// the update, and its alarm is cleared unless one was supplied.
    ///
    /// Returns whether the stored value was updated.
    pub fn set_value(
        &self,
        record: &Record,
        raw: DbrValue,
        alarm: Option<Alarm>,
        notify: bool,
        force: bool,
    ) -> bool {
        if self.fixed {
            return false;
        }
        let value = match raw.coerce(self.basic_type, self.count) {
            Ok(value) => value,
            Err(e) => {
                warn!("{}: dropping value {raw:?}: {e}", record.name());
                return false;
            }
        };
        let (force, alarm) = if record.is_undefined() {
            (true, alarm.or(Some(Alarm::NONE)))
        } else {
            (force, alarm)
        };

        let updated = {
            let mut state = self.state.lock().unwrap();
            if force || !state.value.same_as(&value) {
                state.value = value;
                state.timestamp = SystemTime::now();
                true
            } else {
                false
            }
        };

        if updated {
            if notify {
                if let Some(alarm) = alarm {
                    record.update_alarm(alarm, false);
                }
                record.fire_value_changed();
            }
        } else if let Some(alarm) = alarm {
            record.update_alarm(alarm, true);
        }
        updated
    }
}
