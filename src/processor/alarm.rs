use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tokio::{select, sync::Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    alarm::Alarm,
    database::Database,
    dbr::{DbrBasicType, DbrValue},
    links::ValueLinks,
    record::Record,
};

use super::{ConfigError, MemoryValueProcessor, Processor, ProcessorConfig, link_listener};

#[derive(Debug)]
struct AlarmState {
    raw: Alarm,
    gate_open: bool,
    gate_invalid: bool,
    gate_alarm: Alarm,
    armed: Option<Instant>,
    updater_running: bool,
    last_commit: Option<(bool, Alarm)>,
}

/// A boolean alarm flag driven by a raw alarm, a gate, and a suppression window
///
/// The raw alarm comes from [`DefaultAlarmProcessor::set_raw_alarm`] or from the
/// worst alarm of the input links. A gate link, tested against a bitmask, decides
/// whether the raw alarm counts at all. With a suppression window, an alarm has to
/// persist for the whole window before it reaches the record; the first occurrence
/// only arms the window, so a lone blip is never reported.
#[derive(Debug)]
pub struct DefaultAlarmProcessor {
    pub(crate) memory: MemoryValueProcessor,
    gate_names: Vec<String>,
    gate_mask: i64,
    input_names: Vec<String>,
    suppress: Duration,
    gate: Mutex<Option<Arc<ValueLinks>>>,
    input: Mutex<Option<Arc<ValueLinks>>>,
    state: Mutex<AlarmState>,
    wake: Arc<Notify>,
    updater: Mutex<Option<CancellationToken>>,
}

impl DefaultAlarmProcessor {
    pub fn new(suppress: Duration) -> Self {
        DefaultAlarmProcessor {
            memory: MemoryValueProcessor::new(DbrBasicType::Enum, 1),
            gate_names: Vec::new(),
            gate_mask: -1,
            input_names: Vec::new(),
            suppress,
            gate: Mutex::new(None),
            input: Mutex::new(None),
            state: Mutex::new(AlarmState {
                raw: Alarm::NONE,
                gate_open: true,
                gate_invalid: false,
                gate_alarm: Alarm::NONE,
                armed: None,
                updater_running: false,
                last_commit: None,
            }),
            wake: Arc::new(Notify::new()),
            updater: Mutex::new(None),
        }
    }

    /// Only let the raw alarm through while `gate & mask` is non-zero
    pub fn gate(mut self, names: Vec<String>, mask: i64) -> Self {
        let gated = !names.is_empty();
        self.gate_names = names;
        self.gate_mask = mask;
        let state = self.state.get_mut().unwrap();
        state.gate_open = !gated;
        state.gate_invalid = gated;
        self
    }

    /// Take the raw alarm from the worst alarm of these links
    pub fn input(mut self, names: Vec<String>) -> Self {
        self.input_names = names;
        self
    }

    pub fn configure(config: &ProcessorConfig) -> Result<Self, ConfigError> {
        let suppress = config.millis("suppress_ms")?.unwrap_or_default();
        let mask = config.parse::<i64>("gate_mask")?.unwrap_or(-1);
        Ok(DefaultAlarmProcessor::new(suppress)
            .gate(config.list("gate"), mask)
            .input(config.list("links")))
    }

    pub fn suppression(&self) -> Duration {
        self.suppress
    }

    pub fn is_armed(&self) -> bool {
        self.state.lock().unwrap().armed.is_some()
    }

    pub fn is_gate_open(&self) -> bool {
        self.state.lock().unwrap().gate_open
    }

    pub(crate) fn activate(&self, record: &Record, database: &Database) {
        self.start_updater(record, database);
        if !self.gate_names.is_empty() {
            let links = ValueLinks::new(
                &format!("{}.gate", record.name()),
                self.gate_names.clone(),
                link_listener(record),
            );
            *self.gate.lock().unwrap() = Some(links.clone());
            links.activate(database);
        }
        if !self.input_names.is_empty() {
            let links = ValueLinks::new(
                &format!("{}.input", record.name()),
                self.input_names.clone(),
                link_listener(record),
            );
            *self.input.lock().unwrap() = Some(links.clone());
            links.activate(database);
        }
        self.update_alarm_status(record);
    }

    pub(crate) fn deactivate(&self) {
        if let Some(token) = self.updater.lock().unwrap().take() {
            token.cancel();
        }
        for links in [&self.gate, &self.input] {
            if let Some(links) = links.lock().unwrap().take() {
                links.deactivate();
            }
        }
        let mut state = self.state.lock().unwrap();
        state.updater_running = false;
        state.armed = None;
        state.last_commit = None;
    }

    /// Re-check on a timer while armed, so a commit never waits on new input
    fn start_updater(&self, record: &Record, database: &Database) {
        if self.suppress.is_zero() {
            return;
        }
        let token = database.scheduler().child_token();
        let loop_token = token.clone();
        let weak = record.handle();
        let wake = self.wake.clone();
        let idle = self.suppress;
        self.state.lock().unwrap().updater_running = true;
        let spawned = database.scheduler().spawn(async move {
            loop {
                let wait = {
                    let Some(record) = weak.upgrade() else { break };
                    let processor = record.processor();
                    let Processor::Alarm(processor) = processor.as_ref() else {
                        break;
                    };
                    processor
                        .recheck_at()
                        .map(|at| at.saturating_duration_since(Instant::now()))
                        .unwrap_or(idle)
                };
                select! {
                    _ = loop_token.cancelled() => break,
                    _ = wake.notified() => continue,
                    _ = tokio::time::sleep(wait) => (),
                }
                let Some(record) = weak.upgrade() else { break };
                if let Processor::Alarm(processor) = &*record.processor()
                    && processor.is_armed()
                    && record.is_activated()
                {
                    trace!("{}: suppression re-check", record.name());
                    processor.update_alarm_status(&record);
                }
            }
        });
        if spawned.is_none() {
            self.state.lock().unwrap().updater_running = false;
            return;
        }
        if let Some(previous) = self.updater.lock().unwrap().replace(token) {
            previous.cancel();
        }
    }

    fn recheck_at(&self) -> Option<Instant> {
        self.state
            .lock()
            .unwrap()
            .armed
            .map(|armed| armed + self.suppress)
    }

    /// Feed a new raw alarm
    pub fn set_raw_alarm(&self, record: &Record, raw: Alarm) {
        self.update_or_suppress(record, raw);
    }

    /// Re-evaluate the gate, then the alarm
    pub fn update_alarm_status(&self, record: &Record) {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            self.refresh_gate(&gate);
        }
        let raw = self.state.lock().unwrap().raw;
        self.update_or_suppress(record, raw);
    }

    fn refresh_gate(&self, gate: &ValueLinks) {
        let invalid = gate.is_invalid() || !gate.is_ready();
        let holders = gate.consume();
        let open = holders
            .first()
            .and_then(|h| h.as_ref())
            .and_then(|h| h.value.as_ref())
            .and_then(DbrValue::as_i64)
            .is_some_and(|v| v & self.gate_mask != 0);
        let gate_alarm = if invalid { Alarm::NONE } else { gate.last_alarm() };
        let mut state = self.state.lock().unwrap();
        state.gate_invalid = invalid;
        state.gate_open = open;
        state.gate_alarm = gate_alarm;
    }

    pub(crate) fn on_links_update(&self, record: &Record, links: &ValueLinks) {
        let is_gate = self
            .gate
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|g| std::ptr::eq(g.as_ref(), links));
        if is_gate {
            self.refresh_gate(links);
            let raw = self.state.lock().unwrap().raw;
            self.update_or_suppress(record, raw);
            return;
        }
        let raw = if links.is_invalid() {
            Alarm::LINK_INVALID
        } else if links.is_ready() {
            links.consume();
            links.last_alarm()
        } else {
            return;
        };
        self.update_or_suppress(record, raw);
    }

    /// Decide whether `raw` reaches the record now, later, or never
    pub fn update_or_suppress(&self, record: &Record, raw: Alarm) {
        let (alarm, effective) = {
            let mut state = self.state.lock().unwrap();
            state.raw = raw;
            let mut effective = if state.gate_invalid {
                Alarm::LINK_INVALID
            } else if state.gate_open {
                raw
            } else {
                Alarm::NONE
            };
            if state.gate_alarm.severity > effective.severity {
                effective = state.gate_alarm;
            }
            let alarm = effective.is_alarm();

            if alarm && !self.suppress.is_zero() && state.updater_running {
                match state.armed {
                    None => {
                        debug!("{}: armed by {effective}", record.name());
                        state.armed = Some(Instant::now());
                        self.wake.notify_one();
                        return;
                    }
                    Some(armed) if armed.elapsed() < self.suppress => return,
                    Some(_) => (),
                }
            } else if state.armed.take().is_some() {
                debug!("{}: disarmed", record.name());
            }

            if state.last_commit == Some((alarm, effective)) {
                return;
            }
            state.last_commit = Some((alarm, effective));
            (alarm, effective)
        };
        debug!("{}: committing alarm={alarm} {effective}", record.name());
        self.memory
            .set_value(record, DbrValue::from(alarm), Some(effective), true, false);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
    };

    use super::*;
    use crate::{
        alarm::{AlarmStatus, Severity},
        config::DatabaseBuilder,
        events::{RecordChannel, RecordEvent},
    };

    const MAJOR: Alarm = Alarm::new(Severity::Major, AlarmStatus::HiHi);

    fn wait_for(condition: impl Fn() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn with_processor<F: FnOnce(&DefaultAlarmProcessor)>(record: &Record, f: F) {
        let processor = record.processor();
        let Processor::Alarm(p) = &*processor else {
            panic!("not an alarm processor")
        };
        f(p)
    }

    /// Count value notifications that raised the flag
    fn count_raised(record: &Record) -> Arc<AtomicUsize> {
        let raised = Arc::new(AtomicUsize::new(0));
        let r = raised.clone();
        record.add_listener(
            RecordChannel::Value,
            Arc::new(move |event: &RecordEvent| {
                if event.holder.as_bool() {
                    r.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );
        raised
    }

    #[test]
    fn commits_immediately_without_suppression() {
        let db = DatabaseBuilder::new("alarm").build();
        let record = Record::builder("ALM")
            .processor(Processor::Alarm(DefaultAlarmProcessor::new(Duration::ZERO)))
            .build();
        db.add_record(record.clone());
        db.activate();
        assert_eq!(record.alarm(), Alarm::NONE);
        assert!(!record.get_value().as_bool());
        with_processor(&record, |p| p.set_raw_alarm(&record, MAJOR));
        assert!(record.get_value().as_bool());
        assert_eq!(record.alarm(), MAJOR);
        with_processor(&record, |p| p.set_raw_alarm(&record, Alarm::NONE));
        assert!(!record.get_value().as_bool());
        db.shutdown();
    }

    #[test]
    fn single_blip_is_never_reported() {
        let db = DatabaseBuilder::new("alarm").build();
        let record = Record::builder("ALM")
            .processor(Processor::Alarm(DefaultAlarmProcessor::new(
                Duration::from_millis(150),
            )))
            .build();
        db.add_record(record.clone());
        db.activate();
        let raised = count_raised(&record);
        with_processor(&record, |p| p.set_raw_alarm(&record, MAJOR));
        with_processor(&record, |p| assert!(p.is_armed()));
        thread::sleep(Duration::from_millis(30));
        with_processor(&record, |p| p.set_raw_alarm(&record, Alarm::NONE));
        thread::sleep(Duration::from_millis(300));
        assert_eq!(raised.load(Ordering::SeqCst), 0);
        assert_eq!(record.alarm(), Alarm::NONE);
        with_processor(&record, |p| assert!(!p.is_armed()));
        db.shutdown();
    }

    #[test]
    fn held_alarm_commits_exactly_once() {
        let db = DatabaseBuilder::new("alarm").build();
        let record = Record::builder("ALM")
            .processor(Processor::Alarm(DefaultAlarmProcessor::new(
                Duration::from_millis(100),
            )))
            .build();
        db.add_record(record.clone());
        db.activate();
        let raised = count_raised(&record);
        let start = Instant::now();
        with_processor(&record, |p| p.set_raw_alarm(&record, MAJOR));
        // Committed by the background re-check, with no further input
        assert!(wait_for(|| record.get_value().as_bool(), Duration::from_secs(2)));
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(record.alarm(), MAJOR);
        for _ in 0..5 {
            with_processor(&record, |p| p.set_raw_alarm(&record, MAJOR));
            thread::sleep(Duration::from_millis(20));
        }
        thread::sleep(Duration::from_millis(200));
        assert_eq!(raised.load(Ordering::SeqCst), 1);
        db.shutdown();
    }

    #[test]
    fn gate_controls_alarm() {
        let db = DatabaseBuilder::new("alarm").build();
        let gate = Record::builder("GATE")
            .processor(Processor::Memory(MemoryValueProcessor::with_initial(
                DbrValue::Long(vec![0]),
            )))
            .build();
        let record = Record::builder("ALM")
            .processor(Processor::Alarm(
                DefaultAlarmProcessor::new(Duration::ZERO).gate(vec!["GATE".into()], 0b10),
            ))
            .build();
        db.add_all([gate.clone(), record.clone()]);
        db.activate();
        gate.set_value(1i32);
        assert!(wait_for(
            || {
                let mut closed = false;
                with_processor(&record, |p| closed = !p.is_gate_open());
                closed && record.alarm() == Alarm::NONE
            },
            Duration::from_secs(2)
        ));
        with_processor(&record, |p| p.set_raw_alarm(&record, MAJOR));
        assert!(!record.get_value().as_bool());

        // Bit 1 opens the gate; the held raw alarm then goes through
        gate.set_value(2i32);
        assert!(wait_for(|| record.alarm() == MAJOR, Duration::from_secs(2)));
        assert!(record.get_value().as_bool());
        db.shutdown();
    }

    #[test]
    fn unresolved_gate_is_link_invalid() {
        let db = DatabaseBuilder::new("alarm").build();
        let record = Record::builder("ALM")
            .processor(Processor::Alarm(
                DefaultAlarmProcessor::new(Duration::ZERO).gate(vec!["MISSING".into()], -1),
            ))
            .build();
        db.add_record(record.clone());
        db.activate();
        assert_eq!(record.alarm(), Alarm::LINK_INVALID);
        assert!(record.get_value().as_bool());
        db.shutdown();
    }
}
