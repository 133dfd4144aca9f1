//! The container that owns records and drives their lifecycle.
//!
//! A [`Database`] maps names to records, owns the [`Scheduler`] every processor and
//! link uses, and optionally a [`PersistenceStore`] and a [`RemoteConnector`].
//! Activation is paced through an [`ActivationTimer`]; records added after the
//! database is live are activated immediately.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock, Weak},
    time::Duration,
};

use tracing::{debug, info, info_span, warn};

use crate::{
    activation::ActivationTimer,
    config::DatabaseConfig,
    events::{Callback, ListenerId, Listeners},
    persist::PersistenceStore,
    processor::ConfigError,
    record::Record,
    remote::RemoteConnector,
    scheduler::{Scheduler, TaskHandle},
};

/// A group of records that belong together
///
/// Applications are registered with the database the first time one of their
/// records is added, and follow the database through activation.
pub trait Application: Send + Sync {
    fn name(&self) -> &str;

    fn initialize(&self, _database: &Database) -> Result<(), ConfigError> {
        Ok(())
    }
    fn activate(&self, _database: &Database) {}
    fn deactivate(&self) {}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DatabaseChannel {
    RecordAdded,
    Activated,
    Deactivated,
}

#[derive(Clone)]
pub struct DatabaseEvent {
    pub channel: DatabaseChannel,
    /// The added record, for [`DatabaseChannel::RecordAdded`]
    pub record: Option<Arc<Record>>,
}

#[derive(Default)]
struct Registry {
    records: HashMap<String, Arc<Record>>,
    /// Names in the order they were added
    order: Vec<String>,
    applications: Vec<Arc<dyn Application>>,
}

struct DatabaseInner {
    name: String,
    config: DatabaseConfig,
    scheduler: Arc<Scheduler>,
    activation: ActivationTimer,
    store: Option<Arc<dyn PersistenceStore>>,
    connector: Arc<dyn RemoteConnector>,
    registry: RwLock<Registry>,
    triggers: Mutex<Vec<TaskHandle>>,
    listeners: Listeners<DatabaseChannel, DatabaseEvent>,
}

/// A cheaply clonable handle to a database
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

/// Does not keep the database alive
#[derive(Clone)]
pub struct WeakDatabase {
    inner: Weak<DatabaseInner>,
}

impl WeakDatabase {
    pub fn upgrade(&self) -> Option<Database> {
        self.inner.upgrade().map(|inner| Database { inner })
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.inner.name)
            .field("records", &self.count())
            .field("active", &self.is_active())
            .finish()
    }
}

impl std::fmt::Debug for WeakDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WeakDatabase")
    }
}

impl Database {
    /// Use [`DatabaseBuilder`](crate::config::DatabaseBuilder) for anything but the defaults
    pub fn new(
        name: &str,
        config: DatabaseConfig,
        store: Option<Arc<dyn PersistenceStore>>,
        connector: Arc<dyn RemoteConnector>,
    ) -> Self {
        let scheduler = Arc::new(Scheduler::new(
            config.worker_threads,
            config.max_blocking_threads,
        ));
        let activation = ActivationTimer::new(config.activation_spacing, config.activation_delay);
        Database {
            inner: Arc::new(DatabaseInner {
                name: name.to_string(),
                config,
                scheduler,
                activation,
                store,
                connector,
                registry: RwLock::new(Registry::default()),
                triggers: Mutex::new(Vec::new()),
                listeners: Listeners::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }
    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.inner.scheduler
    }
    pub fn store(&self) -> Option<Arc<dyn PersistenceStore>> {
        self.inner.store.clone()
    }
    pub fn connector(&self) -> Arc<dyn RemoteConnector> {
        self.inner.connector.clone()
    }
    pub fn downgrade(&self) -> WeakDatabase {
        WeakDatabase {
            inner: Arc::downgrade(&self.inner),
        }
    }
    pub fn is_active(&self) -> bool {
        self.inner.scheduler.is_active()
    }

    /// Register a record under its name
    ///
    /// Returns false, leaving the existing record in place, if the name is taken.
    /// On a live database the record is activated once its paced slot comes up:
    /// inline from ordinary threads, or as a scheduled task when called from
    /// inside an async runtime so that no worker is put to sleep.
    pub fn add_record(&self, record: Arc<Record>) -> bool {
        {
            let mut registry = self.inner.registry.write().unwrap();
            if registry.records.contains_key(record.name()) {
                warn!(
                    "Database {}: record {} already exists, ignoring",
                    self.inner.name,
                    record.name()
                );
                return false;
            }
            registry
                .records
                .insert(record.name().to_string(), record.clone());
            registry.order.push(record.name().to_string());
        }
        debug!("Added record {} to {}", record.name(), self.inner.name);
        record.initialize(self);

        if let Some(application) = record.application() {
            self.add_application(application);
        }

        self.inner.listeners.dispatch(
            DatabaseChannel::RecordAdded,
            &DatabaseEvent {
                channel: DatabaseChannel::RecordAdded,
                record: Some(record.clone()),
            },
        );

        if !self.is_active() {
            return true;
        }
        if tokio::runtime::Handle::try_current().is_ok() {
            // Called from a runtime worker: take the paced slot on the scheduler
            let delay = self.inner.activation.reserve();
            let weak = self.downgrade();
            self.inner.scheduler.schedule(
                move || {
                    if let Some(database) = weak.upgrade()
                        && database.is_active()
                    {
                        database.activate_added(&record);
                    }
                },
                delay,
            );
        } else {
            self.inner.activation.check_and_delay();
            self.activate_added(&record);
        }
        true
    }

    fn activate_added(&self, record: &Arc<Record>) {
        record.activate(self);
        if let Some(handle) = self.start_trigger(record) {
            self.inner.triggers.lock().unwrap().push(handle);
        }
    }

    /// Add several records, returning how many were accepted
    pub fn add_all(&self, records: impl IntoIterator<Item = Arc<Record>>) -> usize {
        records
            .into_iter()
            .map(|r| self.add_record(r))
            .filter(|added| *added)
            .count()
    }

    /// Register an application, unless one with the same name already is
    pub fn add_application(&self, application: Arc<dyn Application>) -> bool {
        {
            let mut registry = self.inner.registry.write().unwrap();
            if registry
                .applications
                .iter()
                .any(|a| a.name() == application.name())
            {
                return false;
            }
            registry.applications.push(application.clone());
        }
        if let Err(e) = application.initialize(self) {
            warn!("Application {} failed to initialize: {e}", application.name());
        }
        if self.is_active() {
            application.activate(self);
        }
        true
    }

    pub fn get_application(&self, name: &str) -> Option<Arc<dyn Application>> {
        self.inner
            .registry
            .read()
            .unwrap()
            .applications
            .iter()
            .find(|a| a.name() == name)
            .cloned()
    }

    pub fn count(&self) -> usize {
        self.inner.registry.read().unwrap().records.len()
    }

    pub fn get_record(&self, name: &str) -> Option<Arc<Record>> {
        self.inner.registry.read().unwrap().records.get(name).cloned()
    }

    /// All records, in the order they were added
    pub fn records(&self) -> Vec<Arc<Record>> {
        let registry = self.inner.registry.read().unwrap();
        registry
            .order
            .iter()
            .filter_map(|name| registry.records.get(name).cloned())
            .collect()
    }

    pub fn add_listener(
        &self,
        channel: DatabaseChannel,
        callback: Callback<DatabaseEvent>,
    ) -> ListenerId {
        self.inner.listeners.add(channel, callback)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Run `task` on the database scheduler after `delay`
    pub fn schedule<F>(&self, task: F, delay: Duration) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.scheduler.schedule(task, delay)
    }

    pub fn schedule_periodic(
        &self,
        task: Arc<dyn Fn() + Send + Sync>,
        delay: Duration,
        period: Duration,
    ) -> TaskHandle {
        self.inner.scheduler.schedule_periodic(task, delay, period)
    }

    fn start_trigger(&self, record: &Arc<Record>) -> Option<TaskHandle> {
        let period = record.trigger()?;
        let weak = Arc::downgrade(record);
        debug!("Triggering {} every {period:?}", record.name());
        Some(self.inner.scheduler.schedule_periodic(
            Arc::new(move || {
                if let Some(record) = weak.upgrade() {
                    record.process();
                }
            }),
            self.inner.config.first_trigger_delay,
            period,
        ))
    }

    /// Bring every record and application live, in the order they were added
    pub fn activate(&self) {
        if self.is_active() {
            return;
        }
        let _span = info_span!("activate", database = self.inner.name).entered();
        self.inner.scheduler.set_active(true);
        let records = self.records();
        info!("Activating {} records", records.len());
        for record in &records {
            self.inner.activation.check_and_delay();
            record.activate(self);
        }
        let applications = self.inner.registry.read().unwrap().applications.clone();
        for application in &applications {
            self.inner.activation.check_and_delay();
            application.activate(self);
        }
        let handles: Vec<TaskHandle> = records
            .iter()
            .filter_map(|r| self.start_trigger(r))
            .collect();
        self.inner.triggers.lock().unwrap().extend(handles);

        self.inner.listeners.dispatch(
            DatabaseChannel::Activated,
            &DatabaseEvent {
                channel: DatabaseChannel::Activated,
                record: None,
            },
        );
    }

    /// Stop all timers and links, and flush persistent state
    pub fn deactivate(&self) {
        if !self.is_active() {
            return;
        }
        let _span = info_span!("deactivate", database = self.inner.name).entered();
        self.inner.scheduler.set_active(false);
        for handle in self.inner.triggers.lock().unwrap().drain(..) {
            handle.cancel();
        }
        for record in self.records() {
            record.deactivate();
        }
        let applications = self.inner.registry.read().unwrap().applications.clone();
        for application in &applications {
            application.deactivate();
        }
        if let Some(store) = &self.inner.store
            && let Err(e) = store.flush()
        {
            warn!("Could not flush persisted values: {e}");
        }
        info!("Deactivated");
        self.inner.listeners.dispatch(
            DatabaseChannel::Deactivated,
            &DatabaseEvent {
                channel: DatabaseChannel::Deactivated,
                record: None,
            },
        );
    }

    /// Deactivate and tear down the scheduler. The database cannot be activated again.
    pub fn shutdown(&self) {
        self.deactivate();
        self.inner.scheduler.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        config::DatabaseBuilder,
        dbr::DbrValue,
        processor::{MemoryValueProcessor, Processor},
    };

    struct Counter {
        activations: AtomicUsize,
        deactivations: AtomicUsize,
    }

    impl Application for Counter {
        fn name(&self) -> &str {
            "counter"
        }
        fn activate(&self, _database: &Database) {
            self.activations.fetch_add(1, Ordering::SeqCst);
        }
        fn deactivate(&self) {
            self.deactivations.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let db = DatabaseBuilder::new("db").build();
        let first = Record::builder("X").build();
        first.set_value(1.0f64);
        assert!(db.add_record(first));
        assert!(!db.add_record(Record::builder("X").build()));
        assert_eq!(db.count(), 1);
        assert_eq!(db.get_record("X").unwrap().get_value(), DbrValue::Double(vec![1.0]));
    }

    #[test]
    fn records_keep_insertion_order() {
        let db = DatabaseBuilder::new("db").build();
        assert_eq!(
            db.add_all(["C", "A", "B", "A"].map(|n| Record::builder(n).build())),
            3
        );
        let names: Vec<String> = db.records().iter().map(|r| r.name().to_string()).collect();
        assert_eq!(names, vec!["C", "A", "B"]);
    }

    #[test]
    fn lifecycle_reaches_records_and_applications() {
        let db = DatabaseBuilder::new("db").build();
        let counter = Arc::new(Counter {
            activations: AtomicUsize::new(0),
            deactivations: AtomicUsize::new(0),
        });
        let app: Arc<dyn Application> = counter.clone();
        let record = Record::builder("R").application(&app).build();
        db.add_record(record.clone());
        assert!(db.get_application("counter").is_some());

        let events = Arc::new(AtomicUsize::new(0));
        let e = events.clone();
        db.add_listener(
            DatabaseChannel::Activated,
            Arc::new(move |_: &DatabaseEvent| {
                e.fetch_add(1, Ordering::SeqCst);
            }),
        );
        db.activate();
        db.activate();
        assert!(record.is_activated());
        assert_eq!(counter.activations.load(Ordering::SeqCst), 1);
        assert_eq!(events.load(Ordering::SeqCst), 1);

        db.deactivate();
        assert!(!record.is_activated());
        assert_eq!(counter.deactivations.load(Ordering::SeqCst), 1);
        db.shutdown();
    }

    #[test]
    fn late_records_are_activated() {
        let db = DatabaseBuilder::new("db").build();
        db.activate();
        let added = Arc::new(AtomicUsize::new(0));
        let a = added.clone();
        db.add_listener(
            DatabaseChannel::RecordAdded,
            Arc::new(move |event: &DatabaseEvent| {
                assert!(event.record.is_some());
                a.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let record = Record::builder("LATE").build();
        db.add_record(record.clone());
        assert!(record.is_activated());
        assert_eq!(added.load(Ordering::SeqCst), 1);
        db.shutdown();
    }

    #[test]
    fn scheduled_registration_does_not_block_the_worker() {
        let db = DatabaseBuilder::new("db")
            .activation_spacing(Duration::from_millis(300))
            .build();
        db.add_record(Record::builder("FIRST").build());
        db.activate();

        let record = Record::builder("LATE").build();
        let held = Arc::new(Mutex::new(None));
        let (d, r, h) = (db.clone(), record.clone(), held.clone());
        db.schedule(
            move || {
                let started = std::time::Instant::now();
                assert!(d.add_record(r));
                *h.lock().unwrap() = Some(started.elapsed());
            },
            Duration::ZERO,
        );
        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while !record.is_activated() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(record.is_activated());
        let held = held.lock().unwrap().expect("registration task ran");
        assert!(held < Duration::from_millis(150), "worker held for {held:?}");
        db.shutdown();
    }

    #[test]
    fn periodic_triggers_follow_activation() {
        let db = DatabaseBuilder::new("db")
            .first_trigger_delay(Duration::from_millis(10))
            .build();
        let record = Record::builder("T")
            .processor(Processor::Memory(
                MemoryValueProcessor::new(crate::dbr::DbrBasicType::Double, 1)
                    .trigger(Some(Duration::from_millis(20))),
            ))
            .build();
        db.add_record(record.clone());
        db.add_record(Record::builder("UNTRIGGERED").build());
        db.activate();
        assert_eq!(db.inner.triggers.lock().unwrap().len(), 1);
        db.deactivate();
        assert!(db.inner.triggers.lock().unwrap().is_empty());
        db.shutdown();
    }
}
