//! Typed observation channels.
//!
//! Each entity keeps a table of `(channel, callback)` entries. Dispatch snapshots
//! the matching callbacks and calls them on the dispatching thread, after any lock
//! on the table has been released, so a callback may freely add or remove listeners.

use std::{
    fmt::Debug,
    sync::{Arc, Mutex},
};

use crate::{holder::ValueHolder, utils::wrapping_inplace_add};

/// The named observation channels of a [`Record`](crate::record::Record)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RecordChannel {
    /// The value changed (or was forced)
    Value,
    /// Severity or status changed
    Alarm,
    /// A client wrote to the record, whether or not the value changed
    Write,
}

/// Delivered to record listeners
#[derive(Clone, Debug)]
pub struct RecordEvent {
    pub channel: RecordChannel,
    pub holder: ValueHolder,
}

/// Handle returned on registration, used to detach again
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Entry<C, E> {
    id: ListenerId,
    channel: C,
    callback: Callback<E>,
}

struct ListenerTable<C, E> {
    next_id: u64,
    entries: Vec<Entry<C, E>>,
}

/// Dispatch table mapping channels to subscribed callbacks
pub struct Listeners<C, E> {
    table: Mutex<ListenerTable<C, E>>,
}

impl<C, E> Default for Listeners<C, E> {
    fn default() -> Self {
        Self {
            table: Mutex::new(ListenerTable {
                next_id: 1,
                entries: Vec::new(),
            }),
        }
    }
}

impl<C: Copy + PartialEq, E> Listeners<C, E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, channel: C, callback: Callback<E>) -> ListenerId {
        let mut table = self.table.lock().unwrap();
        let id = ListenerId(wrapping_inplace_add(&mut table.next_id));
        table.entries.push(Entry {
            id,
            channel,
            callback,
        });
        id
    }

    /// Detach a listener. Returns false if it was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut table = self.table.lock().unwrap();
        let before = table.entries.len();
        table.entries.retain(|e| e.id != id);
        table.entries.len() != before
    }

    /// Call every listener on `channel`, returning how many were called
    pub fn dispatch(&self, channel: C, event: &E) -> usize {
        let targets: Vec<Callback<E>> = self
            .table
            .lock()
            .unwrap()
            .entries
            .iter()
            .filter(|e| e.channel == channel)
            .map(|e| e.callback.clone())
            .collect();
        for callback in &targets {
            callback(event);
        }
        targets.len()
    }

    pub fn len(&self) -> usize {
        self.table.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<C, E> Debug for Listeners<C, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.table.lock().map(|t| t.entries.len()).unwrap_or(0);
        f.debug_struct("Listeners").field("count", &count).finish()
    }
}
