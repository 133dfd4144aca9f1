//! Alarm classification: a [`Severity`] with a total order, and a [`AlarmStatus`]
//! giving the reason. Codes follow the EPICS `menuAlarmSevr`/`menuAlarmStat` tables.

use std::fmt::Display;

/// How bad an alarm is. Ordered so that `max` picks the worst.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    #[default]
    NoAlarm = 0,
    Minor = 1,
    Major = 2,
    Invalid = 3,
}

impl TryFrom<i16> for Severity {
    type Error = ();
    fn try_from(value: i16) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Severity::NoAlarm,
            1 => Severity::Minor,
            2 => Severity::Major,
            3 => Severity::Invalid,
            _ => return Err(()),
        })
    }
}

impl Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Severity::NoAlarm => "NO_ALARM",
            Severity::Minor => "MINOR",
            Severity::Major => "MAJOR",
            Severity::Invalid => "INVALID",
        };
        write!(f, "{name}")
    }
}

/// The reason for an alarm
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AlarmStatus {
    #[default]
    NoAlarm = 0,
    Read = 1,
    Write = 2,
    HiHi = 3,
    High = 4,
    LoLo = 5,
    Low = 6,
    State = 7,
    Cos = 8,
    Comm = 9,
    Timeout = 10,
    HwLimit = 11,
    Calc = 12,
    Scan = 13,
    Link = 14,
    Soft = 15,
    BadSub = 16,
    /// Value has never been defined
    Udf = 17,
    Disable = 18,
    Simm = 19,
    ReadAccess = 20,
    WriteAccess = 21,
}

impl TryFrom<i16> for AlarmStatus {
    type Error = ();
    fn try_from(value: i16) -> Result<Self, Self::Error> {
        use AlarmStatus::*;
        const ALL: [AlarmStatus; 22] = [
            NoAlarm, Read, Write, HiHi, High, LoLo, Low, State, Cos, Comm, Timeout, HwLimit,
            Calc, Scan, Link, Soft, BadSub, Udf, Disable, Simm, ReadAccess, WriteAccess,
        ];
        usize::try_from(value)
            .ok()
            .and_then(|i| ALL.get(i).copied())
            .ok_or(())
    }
}

/// A severity/status pair, as carried by a record
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Alarm {
    pub severity: Severity,
    pub status: AlarmStatus,
}

impl Alarm {
    pub const NONE: Alarm = Alarm::new(Severity::NoAlarm, AlarmStatus::NoAlarm);
    /// State of a record whose value was never confirmed
    pub const UNDEFINED: Alarm = Alarm::new(Severity::Invalid, AlarmStatus::Udf);
    /// Reported for a link that cannot be read
    pub const LINK_INVALID: Alarm = Alarm::new(Severity::Invalid, AlarmStatus::Link);

    pub const fn new(severity: Severity, status: AlarmStatus) -> Self {
        Self { severity, status }
    }

    pub fn is_alarm(&self) -> bool {
        self.severity != Severity::NoAlarm
    }

    /// Keep the worse of two alarms. Ties keep `self`.
    pub fn worst(self, other: Alarm) -> Alarm {
        if other.severity > self.severity {
            other
        } else {
            self
        }
    }

    /// Fold many alarms into the worst one, keeping the first status seen at the
    /// winning severity. Returns [`Alarm::NONE`] for an empty input.
    pub fn worst_of<I: IntoIterator<Item = Alarm>>(alarms: I) -> Alarm {
        let mut alarms = alarms.into_iter();
        let Some(first) = alarms.next() else {
            return Alarm::NONE;
        };
        alarms.fold(first, Alarm::worst)
    }
}

impl Display for Alarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{:?}", self.severity, self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_order() {
        assert!(Severity::Invalid > Severity::Major);
        assert!(Severity::Major > Severity::Minor);
        assert!(Severity::Minor > Severity::NoAlarm);
        assert_eq!(Severity::try_from(2), Ok(Severity::Major));
        assert_eq!(AlarmStatus::try_from(14), Ok(AlarmStatus::Link));
        assert!(AlarmStatus::try_from(99).is_err());
    }

    #[test]
    fn worst_keeps_first_status_on_tie() {
        let a = Alarm::new(Severity::Major, AlarmStatus::HiHi);
        let b = Alarm::new(Severity::Major, AlarmStatus::LoLo);
        let c = Alarm::new(Severity::Minor, AlarmStatus::High);
        assert_eq!(Alarm::worst_of([c, a, b]), a);
        assert_eq!(Alarm::worst_of([c, b, a]), b);
        assert_eq!(Alarm::worst_of([]), Alarm::NONE);
    }
}
