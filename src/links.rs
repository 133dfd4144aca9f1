//! Aggregated subscriptions to a fixed list of named PVs.
//!
//! [`ValueLinks`] resolves each name against the local database first and the
//! remote connector second, keeps the latest [`ValueHolder`] for every slot, and
//! tells its owner about changes. Bursts of endpoint updates are coalesced: the
//! owner hears at most one notification per minimum update interval, always
//! reflecting the full current snapshot.

use std::{
    sync::{Arc, Mutex, Weak},
    time::{Duration, Instant},
};

use tracing::{debug, debug_span, trace, warn};

use crate::{
    alarm::{Alarm, AlarmStatus, Severity},
    database::{Database, WeakDatabase},
    dbr::{DbrValue, Metadata},
    events::{Callback, ListenerId, RecordChannel, RecordEvent},
    holder::ValueHolder,
    record::Record,
    remote::{LinkError, RemoteCallback, RemoteChannel},
    scheduler::{Scheduler, TaskHandle},
};

/// Called, on a scheduler worker, after endpoint updates have settled
pub type LinkListener = Arc<dyn Fn(&ValueLinks) + Send + Sync>;

/// One resolved (or not) link target, read the same way whatever its source
enum Endpoint {
    Unresolved,
    Local {
        record: Arc<Record>,
        listeners: Vec<ListenerId>,
    },
    Remote(Box<dyn RemoteChannel>),
}

impl Endpoint {
    fn is_resolved(&self) -> bool {
        !matches!(self, Endpoint::Unresolved)
    }

    fn is_connected(&self) -> bool {
        match self {
            Endpoint::Unresolved => false,
            Endpoint::Local { .. } => true,
            Endpoint::Remote(channel) => channel.is_connected(),
        }
    }

    fn snapshot(&self) -> Option<ValueHolder> {
        match self {
            Endpoint::Unresolved => None,
            Endpoint::Local { record, .. } => Some(record.value_holder()),
            Endpoint::Remote(channel) => Some(channel.latest()),
        }
    }

    fn metadata(&self) -> Option<Metadata> {
        match self {
            Endpoint::Unresolved => None,
            Endpoint::Local { record, .. } => Some(record.metadata()),
            Endpoint::Remote(channel) => channel.metadata(),
        }
    }

    fn put(&self, name: &str, value: DbrValue) -> Result<(), LinkError> {
        match self {
            Endpoint::Unresolved => Err(LinkError::Unresolved(name.to_string())),
            Endpoint::Local { record, .. } => {
                record
                    .write(value)
                    .map(|_| ())
                    .map_err(|e| LinkError::PutRejected {
                        name: name.to_string(),
                        reason: e.to_string(),
                    })
            }
            Endpoint::Remote(channel) => channel.put(value),
        }
    }

    fn detach(&self) {
        match self {
            Endpoint::Unresolved => (),
            Endpoint::Local { record, listeners } => {
                for id in listeners {
                    record.remove_listener(*id);
                }
            }
            Endpoint::Remote(channel) => channel.close(),
        }
    }
}

struct LinksState {
    active: bool,
    /// Bumped on every (de)activation so that stale callbacks are ignored
    generation: u64,
    endpoints: Vec<Arc<Endpoint>>,
    holders: Vec<Option<ValueHolder>>,
    seen: Vec<bool>,
    ready: bool,
    changed: bool,
    pending_fire: bool,
    last_fire: Option<Instant>,
    min_interval: Duration,
    scheduler: Option<Arc<Scheduler>>,
    database: Option<WeakDatabase>,
    retry: Option<TaskHandle>,
}

impl LinksState {
    fn store(&mut self, index: usize, holder: ValueHolder) {
        if !holder.failed {
            self.seen[index] = true;
        }
        self.holders[index] = Some(holder);
        self.changed = true;
        if !self.ready && self.seen.iter().all(|s| *s) {
            self.ready = true;
        }
    }
}

pub struct ValueLinks {
    owner: String,
    names: Vec<String>,
    listener: LinkListener,
    self_ref: Weak<ValueLinks>,
    state: Mutex<LinksState>,
}

impl std::fmt::Debug for ValueLinks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueLinks")
            .field("owner", &self.owner)
            .field("names", &self.names)
            .finish()
    }
}

impl ValueLinks {
    /// Links for `owner` (used in logs) over a fixed list of names
    pub fn new(owner: &str, names: Vec<String>, listener: LinkListener) -> Arc<Self> {
        let count = names.len();
        Arc::new_cyclic(|self_ref| ValueLinks {
            owner: owner.to_string(),
            names,
            listener,
            self_ref: self_ref.clone(),
            state: Mutex::new(LinksState {
                active: false,
                generation: 0,
                endpoints: Vec::new(),
                holders: vec![None; count],
                seen: vec![false; count],
                ready: false,
                changed: false,
                pending_fire: false,
                last_fire: None,
                min_interval: Duration::ZERO,
                scheduler: None,
                database: None,
                retry: None,
            }),
        })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().unwrap().active
    }

    /// Resolve every name and start listening
    ///
    /// A name that cannot be resolved is logged and left empty; it is retried
    /// periodically for as long as the links stay active.
    pub fn activate(&self, database: &Database) {
        let _span = debug_span!("links", owner = self.owner).entered();
        let generation = {
            let mut state = self.state.lock().unwrap();
            if state.active {
                return;
            }
            state.active = true;
            state.generation += 1;
            state.pending_fire = false;
            state.last_fire = None;
            state.changed = false;
            state.ready = false;
            state.holders = vec![None; self.names.len()];
            state.seen = vec![false; self.names.len()];
            state.min_interval = database.config().link_update_interval;
            state.scheduler = Some(database.scheduler().clone());
            state.database = Some(database.downgrade());
            state.generation
        };

        let endpoints: Vec<Arc<Endpoint>> = self
            .names
            .iter()
            .enumerate()
            .map(|(index, name)| Arc::new(self.resolve(database, index, name, generation)))
            .collect();

        let unresolved = {
            let mut state = self.state.lock().unwrap();
            if !state.active || state.generation != generation {
                drop(state);
                endpoints.iter().for_each(|e| e.detach());
                return;
            }
            for (index, endpoint) in endpoints.iter().enumerate() {
                if state.holders[index].is_none()
                    && let Some(holder) = endpoint.snapshot()
                {
                    state.store(index, holder);
                }
            }
            state.endpoints = endpoints;
            self.names
                .iter()
                .zip(&state.endpoints)
                .filter(|(_, e)| !e.is_resolved())
                .map(|(name, _)| name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        if !unresolved.is_empty() {
            warn!("{}: could not resolve {unresolved}, will retry", self.owner);
            self.start_retry(database);
        }
        self.update();
    }

    /// Detach every subscription. No notification is delivered after this returns.
    pub fn deactivate(&self) {
        let (endpoints, retry) = {
            let mut state = self.state.lock().unwrap();
            if !state.active {
                return;
            }
            state.active = false;
            state.generation += 1;
            state.pending_fire = false;
            state.ready = false;
            state.changed = false;
            state.holders = vec![None; self.names.len()];
            state.seen = vec![false; self.names.len()];
            (std::mem::take(&mut state.endpoints), state.retry.take())
        };
        if let Some(retry) = retry {
            retry.cancel();
        }
        for endpoint in endpoints {
            endpoint.detach();
        }
        debug!("{}: links deactivated", self.owner);
    }

    fn resolve(&self, database: &Database, index: usize, name: &str, generation: u64) -> Endpoint {
        if let Some(record) = database.get_record(name) {
            let weak = self.self_ref.clone();
            let callback: Callback<RecordEvent> = Arc::new(move |event: &RecordEvent| {
                if let Some(links) = weak.upgrade() {
                    links.on_endpoint_update(index, generation, event.holder.clone());
                }
            });
            let listeners = vec![
                record.add_listener(RecordChannel::Value, callback.clone()),
                record.add_listener(RecordChannel::Alarm, callback),
            ];
            trace!("{}: resolved {name} locally", self.owner);
            return Endpoint::Local { record, listeners };
        }
        let weak = self.self_ref.clone();
        let callback: RemoteCallback = Arc::new(move |holder: ValueHolder| {
            if let Some(links) = weak.upgrade() {
                links.on_endpoint_update(index, generation, holder);
            }
        });
        match database.connector().connect(name, callback) {
            Ok(channel) => {
                trace!("{}: connected {name} remotely", self.owner);
                Endpoint::Remote(channel)
            }
            Err(e) => {
                debug!("{}: {e}", self.owner);
                Endpoint::Unresolved
            }
        }
    }

    fn start_retry(&self, database: &Database) {
        let period = database.config().link_retry_period;
        let weak = self.self_ref.clone();
        let handle = database.scheduler().schedule_periodic(
            Arc::new(move || {
                if let Some(links) = weak.upgrade() {
                    links.retry_unresolved();
                }
            }),
            period,
            period,
        );
        if let Some(previous) = self.state.lock().unwrap().retry.replace(handle) {
            previous.cancel();
        }
    }

    fn retry_unresolved(&self) {
        let (database, generation, missing) = {
            let state = self.state.lock().unwrap();
            if !state.active {
                return;
            }
            let Some(database) = state.database.as_ref().and_then(WeakDatabase::upgrade) else {
                return;
            };
            let missing: Vec<usize> = (0..state.endpoints.len())
                .filter(|i| !state.endpoints[*i].is_resolved())
                .collect();
            (database, state.generation, missing)
        };

        let mut found = false;
        for index in missing.iter().copied() {
            let endpoint = self.resolve(&database, index, &self.names[index], generation);
            if !endpoint.is_resolved() {
                continue;
            }
            let mut state = self.state.lock().unwrap();
            if !state.active
                || state.generation != generation
                || state.endpoints[index].is_resolved()
            {
                drop(state);
                endpoint.detach();
                continue;
            }
            debug!("{}: link {} appeared", self.owner, self.names[index]);
            if let Some(holder) = endpoint.snapshot() {
                state.store(index, holder);
            }
            state.endpoints[index] = Arc::new(endpoint);
            found = true;
        }

        let mut state = self.state.lock().unwrap();
        if state.generation == generation && state.endpoints.iter().all(|e| e.is_resolved())
            && let Some(retry) = state.retry.take()
        {
            retry.cancel();
        }
        drop(state);
        if found {
            self.update();
        }
    }

    fn on_endpoint_update(&self, index: usize, generation: u64, holder: ValueHolder) {
        {
            let mut state = self.state.lock().unwrap();
            if !state.active || state.generation != generation {
                return;
            }
            state.store(index, holder);
        }
        self.update();
    }

    /// Ask for a coalesced notification of the current snapshot
    ///
    /// Does nothing if one is already pending; otherwise it is scheduled for when
    /// the minimum update interval since the previous one has passed.
    pub fn update(&self) {
        let (scheduler, delay, generation) = {
            let mut state = self.state.lock().unwrap();
            if !state.active || state.pending_fire {
                return;
            }
            let Some(scheduler) = state.scheduler.clone() else {
                return;
            };
            let delay = state
                .last_fire
                .map(|last| state.min_interval.saturating_sub(last.elapsed()))
                .unwrap_or_default();
            state.pending_fire = true;
            (scheduler, delay, state.generation)
        };
        let weak = self.self_ref.clone();
        let scheduled = scheduler.schedule(
            move || {
                if let Some(links) = weak.upgrade() {
                    links.fire_update(generation);
                }
            },
            delay,
        );
        if !scheduled {
            let mut state = self.state.lock().unwrap();
            if state.generation == generation {
                state.pending_fire = false;
            }
        }
    }

    /// A fire scheduled before a (re)activation belongs to an older generation
    /// and is dropped without touching the current one.
    fn fire_update(&self, generation: u64) {
        {
            let mut state = self.state.lock().unwrap();
            if state.generation != generation {
                return;
            }
            state.pending_fire = false;
            if !state.active {
                return;
            }
            state.last_fire = Some(Instant::now());
        }
        trace!("{}: firing link update", self.owner);
        (self.listener)(self);
    }

    /// Copy of the latest snapshot per slot. Clears the changed flag.
    pub fn consume(&self) -> Vec<Option<ValueHolder>> {
        let mut state = self.state.lock().unwrap();
        state.changed = false;
        state.holders.clone()
    }

    /// Has anything arrived since the last [`ValueLinks::consume`]
    pub fn has_changed(&self) -> bool {
        self.state.lock().unwrap().changed
    }

    /// Latched once every slot has delivered a good value
    pub fn is_ready(&self) -> bool {
        self.state.lock().unwrap().ready
    }

    /// Is any slot unresolved, disconnected, or failed
    pub fn is_invalid(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.endpoints.len() != self.names.len()
            || state.endpoints.iter().any(|e| !e.is_connected())
            || state
                .holders
                .iter()
                .any(|h| h.as_ref().is_some_and(|h| h.failed))
    }

    /// Names of every slot that is unresolved or disconnected
    pub fn get_not_connected(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        self.names
            .iter()
            .enumerate()
            .filter(|(i, _)| !state.endpoints.get(*i).is_some_and(|e| e.is_connected()))
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Worst alarm across all slots, or undefined while any slot is empty
    pub fn last_alarm(&self) -> Alarm {
        let state = self.state.lock().unwrap();
        if state.holders.iter().any(Option::is_none) {
            return Alarm::UNDEFINED;
        }
        Alarm::worst_of(state.holders.iter().flatten().map(ValueHolder::alarm))
    }

    pub fn get_last_severity(&self) -> Severity {
        self.last_alarm().severity
    }

    pub fn get_last_status(&self) -> AlarmStatus {
        self.last_alarm().status
    }

    pub fn metadata(&self, index: usize) -> Option<Metadata> {
        let endpoint = self.state.lock().unwrap().endpoints.get(index).cloned()?;
        endpoint.metadata()
    }

    /// Metadata of the first connected slot
    pub fn first_metadata(&self) -> Option<Metadata> {
        let endpoints = self.state.lock().unwrap().endpoints.clone();
        endpoints
            .iter()
            .filter(|e| e.is_connected())
            .find_map(|e| e.metadata())
    }

    /// Write to one slot
    pub fn set_value(&self, index: usize, value: DbrValue) -> Result<(), LinkError> {
        let endpoint = self
            .state
            .lock()
            .unwrap()
            .endpoints
            .get(index)
            .cloned()
            .ok_or(LinkError::NoSuchLink(index))?;
        endpoint.put(&self.names[index], value)
    }

    /// Write to every slot
    pub fn set_value_to_all(&self, value: DbrValue) -> Result<(), LinkError> {
        self.set_value_to_selected(value, &vec![true; self.names.len()])
    }

    /// Write to the slots whose flag is set
    ///
    /// Every selected slot is attempted; the first failure is returned.
    pub fn set_value_to_selected(
        &self,
        value: DbrValue,
        selected: &[bool],
    ) -> Result<(), LinkError> {
        let endpoints = self.state.lock().unwrap().endpoints.clone();
        if endpoints.len() != self.names.len() {
            return match self.names.first() {
                Some(name) => Err(LinkError::Unresolved(name.clone())),
                None => Ok(()),
            };
        }
        let mut result = Ok(());
        for ((endpoint, name), _) in endpoints
            .iter()
            .zip(&self.names)
            .zip(selected)
            .filter(|(_, selected)| **selected)
        {
            if let Err(e) = endpoint.put(name, value.clone()) {
                warn!("{}: write to {name} failed: {e}", self.owner);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}
