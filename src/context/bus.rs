//! In-process fan-out bus: named broadcast channels with sender exclusion.
//!
//! Each execution context holds one [`BusHandle`] per channel. A handle's
//! own publishes are never delivered back to subscriptions created from
//! that handle (the no-loopback property). Callers that publish are
//! expected to update their own state directly (the store notifies its own
//! subscribers, the dispatcher shows its own notice); the bus exists only
//! to reach the *other* contexts. Double delivery in the originating
//! context would double-fire its observers.
//!
//! Frames are fire-and-forget JSON: no acknowledgment, no ordering
//! guarantee beyond send order within a single sender, and a lagging
//! subscriber drops the oldest frames. The durable slot remains the
//! authoritative record.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

/// Channel carrying just-merged context records between contexts.
pub const CONTEXT_CHANNEL: &str = "ctx";

/// Channel relaying fired notifications between contexts.
pub const NOTICE_CHANNEL: &str = "notices";

/// Frames buffered per channel before a slow subscriber starts lagging.
const CHANNEL_CAPACITY: usize = 64;

/// One broadcast frame: the sender's identity plus a JSON body.
#[derive(Debug, Clone)]
struct Frame {
    sender: Uuid,
    body: String,
}

/// Process-wide hub of named broadcast channels.
///
/// Contexts that share a `LocalBus` (and use the same channel names) see
/// each other; a context holding a handle to a differently-named channel
/// is simply invisible to the rest.
#[derive(Default)]
pub struct LocalBus {
    channels: Mutex<HashMap<String, broadcast::Sender<Frame>>>,
}

impl LocalBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Obtain a fresh handle (a new sender identity) on a named channel.
    pub fn handle(&self, channel: &str) -> BusHandle {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let tx = channels
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();
        BusHandle {
            id: Uuid::new_v4(),
            tx,
        }
    }
}

/// A context's endpoint on one bus channel.
#[derive(Clone)]
pub struct BusHandle {
    id: Uuid,
    tx: broadcast::Sender<Frame>,
}

impl BusHandle {
    /// Publish a message to every *other* context on this channel.
    /// Best-effort: serialization failures are logged, a channel with no
    /// subscribers is not an error.
    pub fn publish<T: Serialize>(&self, message: &T) {
        let body = match serde_json::to_string(message) {
            Ok(body) => body,
            Err(e) => {
                warn!("cannot serialize bus frame: {e}");
                return;
            }
        };
        let _ = self.tx.send(Frame {
            sender: self.id,
            body,
        });
    }

    /// Subscribe to frames from other senders on this channel. Frames
    /// published through this same handle are filtered out.
    pub fn subscribe(&self) -> BusSubscription {
        BusSubscription {
            exclude: self.id,
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving side of a [`BusHandle`].
pub struct BusSubscription {
    exclude: Uuid,
    rx: broadcast::Receiver<Frame>,
}

impl BusSubscription {
    /// Next message from a foreign sender, or `None` once the channel is
    /// gone. Undecodable frames are skipped with a warning; lagged frames
    /// are dropped.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Option<T> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => {
                    if frame.sender == self.exclude {
                        continue;
                    }
                    match serde_json::from_str(&frame.body) {
                        Ok(message) => return Some(message),
                        Err(e) => {
                            warn!("skipping undecodable bus frame: {e}");
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!("bus subscriber lagged, dropped {count} frames");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
