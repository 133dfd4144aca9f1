//! The seam to PVs that do not live in the local database.
//!
//! A [`RemoteConnector`] opens [`RemoteChannel`]s by name. The protocol client is an
//! external collaborator; this module provides the traits it implements plus two
//! connectors: [`NullConnector`], which resolves nothing, and [`PeerConnector`],
//! which resolves names against other [`Database`]s running in the same process.

use std::sync::{
    Arc, RwLock,
    atomic::{AtomicBool, Ordering},
};

use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    database::{Database, DatabaseChannel, DatabaseEvent, WeakDatabase},
    dbr::{ConversionError, DbrValue, Metadata},
    events::{ListenerId, RecordChannel, RecordEvent},
    holder::ValueHolder,
    record::Record,
};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link '{0}' could not be resolved")]
    Unresolved(String),
    #[error("link '{0}' is not connected")]
    Disconnected(String),
    #[error("write to '{name}' was rejected: {reason}")]
    PutRejected { name: String, reason: String },
    #[error("no link at index {0}")]
    NoSuchLink(usize),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
}

/// Receives every update on a remote channel, including failures
pub type RemoteCallback = Arc<dyn Fn(ValueHolder) + Send + Sync>;

/// An open connection to one remote PV
pub trait RemoteChannel: Send + Sync {
    fn name(&self) -> &str;
    fn is_connected(&self) -> bool;
    /// The most recent snapshot, or a failed holder while disconnected
    fn latest(&self) -> ValueHolder;
    fn metadata(&self) -> Option<Metadata>;
    fn put(&self, value: DbrValue) -> Result<(), LinkError>;
    /// Stop delivering updates. No callback runs after this returns.
    fn close(&self);
}

/// Opens remote channels by PV name
pub trait RemoteConnector: Send + Sync {
    fn connect(&self, name: &str, on_update: RemoteCallback)
    -> Result<Box<dyn RemoteChannel>, LinkError>;
}

/// Resolves nothing
#[derive(Debug, Default)]
pub struct NullConnector;

impl RemoteConnector for NullConnector {
    fn connect(
        &self,
        name: &str,
        _on_update: RemoteCallback,
    ) -> Result<Box<dyn RemoteChannel>, LinkError> {
        Err(LinkError::Unresolved(name.to_string()))
    }
}

/// Connects to records held by other databases in this process
///
/// A peer that deactivates looks like a dropped connection to everyone linked to
/// it, and reconnects when it activates again.
#[derive(Default)]
pub struct PeerConnector {
    peers: RwLock<Vec<WeakDatabase>>,
}

impl PeerConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peer(&self, peer: &Database) {
        self.peers.write().unwrap().push(peer.downgrade());
    }

    fn find(&self, name: &str) -> Option<(Database, Arc<Record>)> {
        self.peers
            .read()
            .unwrap()
            .iter()
            .filter_map(WeakDatabase::upgrade)
            .find_map(|db| db.get_record(name).map(|r| (db, r)))
    }
}

impl RemoteConnector for PeerConnector {
    fn connect(
        &self,
        name: &str,
        on_update: RemoteCallback,
    ) -> Result<Box<dyn RemoteChannel>, LinkError> {
        let (peer, record) = self
            .find(name)
            .ok_or_else(|| LinkError::Unresolved(name.to_string()))?;
        debug!("Connected {name} to peer database {}", peer.name());
        let connected = Arc::new(AtomicBool::new(peer.is_active()));
        let closed = Arc::new(AtomicBool::new(false));

        let record_listeners = [RecordChannel::Value, RecordChannel::Alarm]
            .into_iter()
            .map(|channel| {
                let (connected, closed, cb) =
                    (connected.clone(), closed.clone(), on_update.clone());
                record.add_listener(
                    channel,
                    Arc::new(move |event: &RecordEvent| {
                        if connected.load(Ordering::SeqCst) && !closed.load(Ordering::SeqCst) {
                            cb(event.holder.clone());
                        }
                    }),
                )
            })
            .collect();

        let peer_listeners = [DatabaseChannel::Activated, DatabaseChannel::Deactivated]
            .into_iter()
            .map(|channel| {
                let (connected, closed, cb) =
                    (connected.clone(), closed.clone(), on_update.clone());
                let weak_record = record.handle();
                let name = name.to_string();
                peer.add_listener(
                    channel,
                    Arc::new(move |_: &DatabaseEvent| {
                        if closed.load(Ordering::SeqCst) {
                            return;
                        }
                        let up = channel == DatabaseChannel::Activated;
                        connected.store(up, Ordering::SeqCst);
                        trace!("Peer channel {name} connected: {up}");
                        match weak_record.upgrade() {
                            Some(record) if up => cb(record.value_holder()),
                            _ => cb(ValueHolder::failed(&name)),
                        }
                    }),
                )
            })
            .collect();

        Ok(Box::new(PeerChannel {
            name: name.to_string(),
            record,
            peer: peer.downgrade(),
            connected,
            closed,
            record_listeners,
            peer_listeners,
        }))
    }
}

struct PeerChannel {
    name: String,
    record: Arc<Record>,
    peer: WeakDatabase,
    connected: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    record_listeners: Vec<ListenerId>,
    peer_listeners: Vec<ListenerId>,
}

impl RemoteChannel for PeerChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    fn latest(&self) -> ValueHolder {
        if self.is_connected() {
            self.record.value_holder()
        } else {
            ValueHolder::failed(&self.name)
        }
    }

    fn metadata(&self) -> Option<Metadata> {
        self.is_connected().then(|| self.record.metadata())
    }

    fn put(&self, value: DbrValue) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::Disconnected(self.name.clone()));
        }
        self.record
            .write(value)
            .map(|_| ())
            .map_err(|e| LinkError::PutRejected {
                name: self.name.clone(),
                reason: e.to_string(),
            })
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for id in &self.record_listeners {
            self.record.remove_listener(*id);
        }
        if let Some(peer) = self.peer.upgrade() {
            for id in &self.peer_listeners {
                peer.remove_listener(*id);
            }
        }
    }
}

impl Drop for PeerChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{config::DatabaseBuilder, processor::MemoryValueProcessor, processor::Processor};

    fn collecting() -> (RemoteCallback, Arc<Mutex<Vec<ValueHolder>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        (Arc::new(move |h: ValueHolder| s.lock().unwrap().push(h)), seen)
    }

    #[test]
    fn null_connector_resolves_nothing() {
        let (cb, _) = collecting();
        assert!(matches!(
            NullConnector.connect("X", cb),
            Err(LinkError::Unresolved(name)) if name == "X"
        ));
    }

    #[test]
    fn peer_channel_follows_peer_state() {
        let peer = DatabaseBuilder::new("peer").build();
        peer.add_record(
            Record::builder("REMOTE:A")
                .processor(Processor::Memory(MemoryValueProcessor::with_initial(
                    1.0f64.into(),
                )))
                .build(),
        );
        let connector = PeerConnector::new();
        connector.add_peer(&peer);
        let (cb, seen) = collecting();
        assert!(connector.connect("MISSING", cb.clone()).is_err());

        let channel = connector.connect("REMOTE:A", cb).unwrap();
        assert!(!channel.is_connected());
        assert!(channel.latest().failed);
        assert!(matches!(
            channel.put(2.0f64.into()),
            Err(LinkError::Disconnected(_))
        ));

        peer.activate();
        assert!(channel.is_connected());
        channel.put(2.0f64.into()).unwrap();
        let record = peer.get_record("REMOTE:A").unwrap();
        assert_eq!(record.get_value(), DbrValue::Double(vec![2.0]));
        assert!(seen.lock().unwrap().iter().any(|h| !h.failed));

        peer.deactivate();
        assert!(!channel.is_connected());
        assert!(seen.lock().unwrap().last().unwrap().failed);

        channel.close();
        let before = seen.lock().unwrap().len();
        peer.activate();
        record.set_value(3.0);
        assert_eq!(seen.lock().unwrap().len(), before);
        peer.shutdown();
    }
}
