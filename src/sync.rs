//! Cross-instance synchronization channel.
//!
//! Each store owns a [`SyncBridge`]. After a local commit the store
//! publishes its full snapshot tagged with its instance id; inbound
//! messages are drained by [`Store::tick`](crate::Store::tick) and applied
//! as full replacements when they come from another instance and differ
//! from the local state.

use crate::error::{Result, StoreError};
use crate::types::Value;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A full-snapshot update from one instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncMessage {
    /// Instance id of the publisher.
    pub origin: String,
    pub snapshot: Value,
}

type Peers = Arc<Mutex<HubPeers>>;

#[derive(Default)]
struct HubPeers {
    next_id: u64,
    senders: Vec<(u64, Sender<SyncMessage>)>,
}

enum Outbound {
    Hub { id: u64, peers: Peers },
    Channel(Sender<SyncMessage>),
}

/// One instance's connection to the sync transport.
pub struct SyncBridge {
    outbound: Outbound,
    inbound: Receiver<SyncMessage>,
}

impl SyncBridge {
    /// Wrap an arbitrary transport: outgoing messages go to `outbound`,
    /// incoming ones are read from `inbound`.
    pub fn from_channels(outbound: Sender<SyncMessage>, inbound: Receiver<SyncMessage>) -> Self {
        Self {
            outbound: Outbound::Channel(outbound),
            inbound,
        }
    }

    /// Send a message to every other connected peer.
    pub fn publish(&self, message: SyncMessage) -> Result<()> {
        match &self.outbound {
            Outbound::Channel(sender) => sender
                .send(message)
                .map_err(|_| StoreError::Sync("sync transport disconnected".to_string())),
            Outbound::Hub { id, peers } => {
                // Peers whose receiving side is gone are dropped.
                peers.lock().senders.retain(|(peer, sender)| {
                    *peer == *id || sender.send(message.clone()).is_ok()
                });
                Ok(())
            }
        }
    }

    /// Take every message received so far.
    pub fn drain(&self) -> Vec<SyncMessage> {
        self.inbound.try_iter().collect()
    }
}

/// In-process broadcast hub connecting several stores.
#[derive(Clone, Default)]
pub struct SyncHub {
    peers: Peers,
}

impl SyncHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bridge for a new peer.
    pub fn connect(&self) -> SyncBridge {
        let (sender, receiver) = unbounded();
        let id = {
            let mut peers = self.peers.lock();
            let id = peers.next_id;
            peers.next_id += 1;
            peers.senders.push((id, sender));
            id
        };
        SyncBridge {
            outbound: Outbound::Hub {
                id,
                peers: Arc::clone(&self.peers),
            },
            inbound: receiver,
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().senders.len()
    }
}
