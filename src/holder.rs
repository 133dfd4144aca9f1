use std::time::SystemTime;

use crate::{
    alarm::{Alarm, AlarmStatus, Severity},
    dbr::{DbrBasicType, DbrValue},
};

/// Immutable snapshot of a PV, as delivered by a subscription update
///
/// A `failed` holder stands for "no data yet" or "link down", and is distinct from
/// any legitimate value: it carries no value and reports INVALID/LINK.
#[derive(Clone, Debug, PartialEq)]
pub struct ValueHolder {
    pub name: String,
    pub value: Option<DbrValue>,
    pub severity: Severity,
    pub status: AlarmStatus,
    pub basic_type: Option<DbrBasicType>,
    pub timestamp: SystemTime,
    pub failed: bool,
}

impl ValueHolder {
    pub fn new(name: &str, value: DbrValue, alarm: Alarm, timestamp: SystemTime) -> Self {
        ValueHolder {
            name: name.to_string(),
            basic_type: Some(value.get_type()),
            value: Some(value),
            severity: alarm.severity,
            status: alarm.status,
            timestamp,
            failed: false,
        }
    }

    pub fn failed(name: &str) -> Self {
        ValueHolder {
            name: name.to_string(),
            value: None,
            severity: Severity::Invalid,
            status: AlarmStatus::Link,
            basic_type: None,
            timestamp: SystemTime::now(),
            failed: true,
        }
    }

    pub fn alarm(&self) -> Alarm {
        Alarm::new(self.severity, self.status)
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.value.as_ref().and_then(DbrValue::as_f64)
    }

    pub fn as_bool(&self) -> bool {
        self.value.as_ref().is_some_and(DbrValue::as_bool)
    }
}
