//! The named PV entity.
//!
//! A [`Record`] owns exactly one [`Processor`], which holds the authoritative value
//! and timestamp. The record carries everything around the value: metadata and
//! limits, the current alarm, the persistence and writable flags, and the three
//! observation channels (value, alarm, write).
//!
//! Records are always handled through an `Arc`; they keep a weak reference to
//! themselves so that processors can schedule work against them later.

use std::{
    sync::{
        Arc, Mutex, RwLock, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime},
};

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, debug_span, warn};

use crate::{
    alarm::{Alarm, AlarmStatus, Severity},
    database::{Application, Database, WeakDatabase},
    dbr::{ConversionError, DbrBasicType, DbrValue, Limits, Metadata},
    events::{Callback, ListenerId, Listeners, RecordChannel, RecordEvent},
    holder::ValueHolder,
    persist::{PersistenceStore, store_key},
    processor::{MemoryValueProcessor, Processor},
};

/// Capacity of the per-record monitor channel
const MONITOR_CAPACITY: usize = 16;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record '{0}' is not writable")]
    NotWritable(String),
    #[error("record '{0}' has a fixed value")]
    Fixed(String),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
}

pub struct Record {
    name: String,
    self_ref: Weak<Record>,
    metadata: RwLock<Metadata>,
    alarm: Mutex<Alarm>,
    persistent: bool,
    writable: bool,
    activated: AtomicBool,
    processor: RwLock<Arc<Processor>>,
    application: Option<Weak<dyn Application>>,
    database: RwLock<Option<WeakDatabase>>,
    listeners: Listeners<RecordChannel, RecordEvent>,
    monitor: broadcast::Sender<ValueHolder>,
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record")
            .field("name", &self.name)
            .field("type", &self.basic_type())
            .field("alarm", &self.alarm())
            .field("activated", &self.is_activated())
            .finish()
    }
}

/// Builds a [`Record`]. Type and count come from the processor.
pub struct RecordBuilder {
    name: String,
    metadata: Metadata,
    persistent: bool,
    writable: bool,
    processor: Option<Processor>,
    application: Option<Weak<dyn Application>>,
}

impl RecordBuilder {
    pub fn new(name: &str) -> Self {
        RecordBuilder {
            name: name.to_string(),
            metadata: Metadata::default(),
            persistent: false,
            writable: true,
            processor: None,
            application: None,
        }
    }
    pub fn description(mut self, description: &str) -> Self {
        self.metadata.description = description.to_string();
        self
    }
    pub fn units(mut self, units: &str) -> Self {
        self.metadata.units = units.to_string();
        self
    }
    pub fn precision(mut self, precision: usize) -> Self {
        self.metadata.precision = Some(precision);
        self
    }
    pub fn limits(mut self, limits: Limits) -> Self {
        self.metadata.limits = limits;
        self
    }
    pub fn enum_labels(mut self, labels: Vec<String>) -> Self {
        self.metadata.enum_labels = labels;
        self
    }
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }
    pub fn writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }
    pub fn processor(mut self, processor: Processor) -> Self {
        self.processor = Some(processor);
        self
    }
    pub fn application(mut self, application: &Arc<dyn Application>) -> Self {
        self.application = Some(Arc::downgrade(application));
        self
    }
    pub fn build(self) -> Arc<Record> {
        let processor = self.processor.unwrap_or_else(|| {
            Processor::Memory(MemoryValueProcessor::new(DbrBasicType::Double, 1))
        });
        let mut metadata = self.metadata;
        if let Some(labels) = processor.enum_labels()
            && metadata.enum_labels.is_empty()
        {
            metadata.enum_labels = labels;
        }
        Arc::new_cyclic(|self_ref| Record {
            name: self.name,
            self_ref: self_ref.clone(),
            metadata: RwLock::new(metadata),
            alarm: Mutex::new(Alarm::UNDEFINED),
            persistent: self.persistent,
            writable: self.writable,
            activated: AtomicBool::new(false),
            processor: RwLock::new(Arc::new(processor)),
            application: self.application,
            database: RwLock::new(None),
            listeners: Listeners::new(),
            monitor: broadcast::Sender::new(MONITOR_CAPACITY),
        })
    }
}

impl Record {
    pub fn builder(name: &str) -> RecordBuilder {
        RecordBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A weak handle to this record, for deferred work
    pub fn handle(&self) -> Weak<Record> {
        self.self_ref.clone()
    }

    pub fn processor(&self) -> Arc<Processor> {
        self.processor.read().unwrap().clone()
    }

    /// Replace the processor, re-typing the record to match it
    ///
    /// If the record is live, the old processor is deactivated and the new one
    /// activated in its place.
    pub fn set_processor(&self, processor: Processor) {
        if let Some(labels) = processor.enum_labels() {
            self.metadata.write().unwrap().enum_labels = labels;
        }
        let old = std::mem::replace(
            &mut *self.processor.write().unwrap(),
            Arc::new(processor),
        );
        if self.is_activated() {
            old.deactivate();
            if let Some(database) = self.database() {
                self.processor().activate(self, &database);
            }
        }
    }

    pub fn basic_type(&self) -> DbrBasicType {
        self.processor().memory().basic_type()
    }

    pub fn count(&self) -> usize {
        self.processor().memory().count()
    }

    pub fn metadata(&self) -> Metadata {
        self.metadata.read().unwrap().clone()
    }

    pub fn set_metadata(&self, metadata: Metadata) {
        *self.metadata.write().unwrap() = metadata;
    }

    pub fn description(&self) -> String {
        self.metadata.read().unwrap().description.clone()
    }

    pub fn units(&self) -> String {
        self.metadata.read().unwrap().units.clone()
    }

    pub fn limits(&self) -> Limits {
        self.metadata.read().unwrap().limits.clone()
    }

    pub fn precision(&self) -> Option<usize> {
        self.metadata.read().unwrap().precision
    }

    pub fn enum_labels(&self) -> Vec<String> {
        self.metadata.read().unwrap().enum_labels.clone()
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_activated(&self) -> bool {
        self.activated.load(Ordering::SeqCst)
    }

    pub fn application(&self) -> Option<Arc<dyn Application>> {
        self.application.as_ref().and_then(Weak::upgrade)
    }

    pub fn database(&self) -> Option<Database> {
        self.database
            .read()
            .unwrap()
            .as_ref()
            .and_then(WeakDatabase::upgrade)
    }

    pub fn alarm(&self) -> Alarm {
        *self.alarm.lock().unwrap()
    }

    pub fn alarm_severity(&self) -> Severity {
        self.alarm().severity
    }

    pub fn alarm_status(&self) -> AlarmStatus {
        self.alarm().status
    }

    /// Has the value never been confirmed
    pub fn is_undefined(&self) -> bool {
        self.alarm().status == AlarmStatus::Udf
    }

    /// Set the alarm. Returns true, and notifies if asked, only on change.
    pub fn update_alarm(&self, alarm: Alarm, notify: bool) -> bool {
        {
            let mut current = self.alarm.lock().unwrap();
            if *current == alarm {
                return false;
            }
            *current = alarm;
        }
        if notify {
            self.fire(RecordChannel::Alarm);
        }
        true
    }

    pub fn get_value(&self) -> DbrValue {
        self.processor().get_value(self)
    }

    pub fn timestamp(&self) -> SystemTime {
        self.processor().memory().timestamp()
    }

    /// Snapshot of the current value and alarm, without triggering any pull
    pub fn value_holder(&self) -> ValueHolder {
        let processor = self.processor();
        let memory = processor.memory();
        ValueHolder::new(&self.name, memory.value(), self.alarm(), memory.timestamp())
    }

    /// Set the value, notifying value listeners only if it changed
    ///
    /// Returns whether the stored value was updated.
    pub fn set_value<V: Into<DbrValue>>(&self, value: V) -> bool {
        self.processor()
            .set_value(self, value.into(), None, true, false)
    }

    /// Set the value together with an alarm
    pub fn set_value_with_alarm<V: Into<DbrValue>>(&self, value: V, alarm: Alarm) -> bool {
        self.processor()
            .set_value(self, value.into(), Some(alarm), true, false)
    }

    /// Write on behalf of a client
    ///
    /// Unlike [`Record::set_value`], this always raises a write notification even
    /// when the value is unchanged.
    pub fn write<V: Into<DbrValue>>(&self, value: V) -> Result<bool, RecordError> {
        if !self.writable {
            return Err(RecordError::NotWritable(self.name.clone()));
        }
        let processor = self.processor();
        if processor.memory().is_fixed() {
            return Err(RecordError::Fixed(self.name.clone()));
        }
        let value = value.into();
        // Reject unrepresentable values up front rather than dropping them
        let memory = processor.memory();
        let checked = match memory.basic_type() {
            DbrBasicType::Enum => value.parse_into(DbrBasicType::Enum, &self.enum_labels())?,
            _ => value.clone(),
        };
        checked.coerce(memory.basic_type(), memory.count())?;
        let changed = processor.set_value(self, value, None, true, false);
        self.fire(RecordChannel::Write);
        Ok(changed)
    }

    pub fn get_value_as_string(&self) -> String {
        let metadata = self.metadata.read().unwrap().clone();
        self.get_value()
            .to_display_string(metadata.precision, &metadata.enum_labels)
    }

    /// Parse text into the record's type and set it
    pub fn set_value_as_string(&self, text: &str) -> Result<bool, RecordError> {
        let labels = self.enum_labels();
        let value = DbrValue::from_display_string(text, self.basic_type(), &labels)?;
        Ok(self.set_value(value))
    }

    /// Parse text into the record's type and write it as a client would
    pub fn write_as_string(&self, text: &str) -> Result<bool, RecordError> {
        let labels = self.enum_labels();
        let value = DbrValue::from_display_string(text, self.basic_type(), &labels)?;
        self.write(value)
    }

    pub fn add_listener(
        &self,
        channel: RecordChannel,
        callback: Callback<RecordEvent>,
    ) -> ListenerId {
        self.listeners.add(channel, callback)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Receive a snapshot every time the value changes
    pub fn subscribe(&self) -> broadcast::Receiver<ValueHolder> {
        self.monitor.subscribe()
    }

    /// Tell listeners the value changed. Also saves the value if persistent.
    pub(crate) fn fire_value_changed(&self) {
        if self.persistent
            && let Some(store) = self.database().and_then(|db| db.store())
        {
            self.store(store.as_ref());
        }
        let holder = self.fire(RecordChannel::Value);
        let _ = self.monitor.send(holder);
    }

    fn fire(&self, channel: RecordChannel) -> ValueHolder {
        let event = RecordEvent {
            channel,
            holder: self.value_holder(),
        };
        self.listeners.dispatch(channel, &event);
        event.holder
    }

    /// Wire the record to its database and restore any persisted state
    pub fn initialize(&self, database: &Database) {
        *self.database.write().unwrap() = Some(database.downgrade());
        if self.persistent
            && let Some(store) = database.store()
            && self.restore(store.as_ref())
        {
            debug!("Restored persisted value for {}", self.name);
        }
    }

    /// Mark the record live and start its processor
    pub fn activate(&self, database: &Database) {
        let _span = debug_span!("activate", record = self.name).entered();
        if self.activated.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.database.read().unwrap().is_none() {
            self.initialize(database);
        }
        debug!("Activating record");
        self.processor().activate(self, database);
    }

    pub fn deactivate(&self) {
        if self.activated.swap(false, Ordering::SeqCst) {
            debug!("Deactivating record {}", self.name);
            self.processor().deactivate();
        }
    }

    /// The processor's requested periodic re-evaluation interval
    pub fn trigger(&self) -> Option<Duration> {
        self.processor().trigger()
    }

    /// Periodic re-evaluation, driven by the database scheduler
    pub fn process(&self) {
        self.processor().process(self);
    }

    /// Save persistent fields to a store
    pub fn store(&self, sink: &dyn PersistenceStore) {
        if !self.persistent {
            return;
        }
        for (field, value) in self.processor().store_fields(self) {
            sink.save(&store_key(&self.name, &field), &value);
        }
    }

    /// Load persistent fields from a store. Returns true if anything was restored.
    pub fn restore(&self, source: &dyn PersistenceStore) -> bool {
        if !self.persistent {
            return false;
        }
        let processor = self.processor();
        let mut restored = false;
        for field in processor.stored_field_names() {
            let Some(text) = source.load(&store_key(&self.name, field)) else {
                continue;
            };
            match processor.restore_field(self, field, &text) {
                Ok(()) => restored = true,
                Err(e) => warn!("Could not restore {}::{field} from '{text}': {e}", self.name),
            }
        }
        restored
    }
}
