//! Notification dispatch: one reusable surface per context plus a
//! cross-context relay with windowed de-duplication.
//!
//! Every context runs the same timers, so the same announcement fires
//! once per context. The dispatcher shows its own copy unconditionally
//! (the bus never loops a frame back to its sender) and relays to other
//! contexts only when the message's one-second dedupe key is fresh, so a
//! burst of identical firings in the same second floods nobody.

use crate::clock::ZonedClock;
use crate::context::bus::BusHandle;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Where fired notifications are rendered. One surface per context; the
/// dispatcher never stacks a second surface, it re-uses this one and
/// resets its dismissal timer.
pub trait NoticeSurface: Send + Sync {
    /// Render the message, replacing whatever is currently shown.
    fn show(&self, text: &str);
    /// Hide the surface after the display window elapses.
    fn dismiss(&self);
}

/// Default surface: structured log lines.
#[derive(Debug, Default)]
pub struct TracingSurface;

impl NoticeSurface for TracingSurface {
    fn show(&self, text: &str) {
        info!(notice = text, "notice shown");
    }

    fn dismiss(&self) {
        debug!("notice dismissed");
    }
}

/// Buffering surface for tests and headless hosts: records every shown
/// message and counts dismissals.
#[derive(Debug, Default)]
pub struct MemorySurface {
    shown: Mutex<Vec<String>>,
    dismissals: Mutex<usize>,
}

impl MemorySurface {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every message shown so far, oldest first.
    pub fn shown(&self) -> Vec<String> {
        self.shown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn dismissals(&self) -> usize {
        *self.dismissals.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl NoticeSurface for MemorySurface {
    fn show(&self, text: &str) {
        self.shown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(text.to_owned());
    }

    fn dismiss(&self) {
        *self.dismissals.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }
}

/// Relay frame for the notice bus channel. The dedupe key is computed
/// independently by each observer and never transmitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoticeMessage {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Per-context notification dispatcher.
pub struct NoticeDispatcher {
    surface: Arc<dyn NoticeSurface>,
    bus: BusHandle,
    clock: ZonedClock,
    default_duration: Duration,
    last_key: Mutex<String>,
    hide_timer: Mutex<Option<JoinHandle<()>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl NoticeDispatcher {
    /// Build the dispatcher and start its inbound bus listener. A tokio
    /// runtime must be current.
    pub fn start(
        surface: Arc<dyn NoticeSurface>,
        bus: BusHandle,
        clock: ZonedClock,
        default_duration: Duration,
    ) -> Arc<Self> {
        let dispatcher = Arc::new(Self {
            surface,
            bus,
            clock,
            default_duration,
            last_key: Mutex::new(String::new()),
            hide_timer: Mutex::new(None),
            listener: Mutex::new(None),
        });

        let mut subscription = dispatcher.bus.subscribe();
        let weak = Arc::downgrade(&dispatcher);
        let handle = tokio::spawn(async move {
            while let Some(message) = subscription.recv::<NoticeMessage>().await {
                let Some(dispatcher) = weak.upgrade() else {
                    break;
                };
                dispatcher.on_relayed(&message);
            }
        });
        *dispatcher
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        dispatcher
    }

    /// Show a message on this context's surface for `duration` (the
    /// default when `None`). A message already on the surface is replaced
    /// and its dismissal timer restarted.
    pub fn show(&self, text: &str, duration: Option<Duration>) {
        self.surface.show(text);

        let duration = duration.unwrap_or(self.default_duration);
        let surface = Arc::clone(&self.surface);
        let mut guard = self
            .hide_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = guard.take() {
            previous.abort();
        }
        *guard = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            surface.dismiss();
        }));
    }

    /// Show locally and relay to other contexts, suppressing relay when
    /// the one-second dedupe key matches the last one processed here.
    /// The local show is unconditional.
    pub fn broadcast(&self, text: &str, duration: Option<Duration>) {
        self.show(text, duration);

        let key = self.dedupe_key(text);
        if !self.mark_key(&key) {
            return;
        }
        self.bus.publish(&NoticeMessage {
            text: text.to_owned(),
            duration_ms: duration.map(|d| d.as_millis() as u64),
        });
    }

    fn on_relayed(&self, message: &NoticeMessage) {
        // Same one-second rule on the receiving side: if this context
        // just showed an identical message, the relay is a duplicate.
        let key = self.dedupe_key(&message.text);
        if !self.mark_key(&key) {
            return;
        }
        self.show(
            &message.text,
            message.duration_ms.map(Duration::from_millis),
        );
    }

    fn dedupe_key(&self, text: &str) -> String {
        format!("{text}|{}", self.clock.epoch_secs())
    }

    /// Record `key` as processed. Returns `false` when it matches the
    /// previous key (a duplicate within the window).
    fn mark_key(&self, key: &str) -> bool {
        let mut last = self.last_key.lock().unwrap_or_else(PoisonError::into_inner);
        if *last == key {
            return false;
        }
        *last = key.to_owned();
        true
    }
}

impl Drop for NoticeDispatcher {
    fn drop(&mut self) {
        if let Some(handle) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        if let Some(handle) = self
            .hide_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}
