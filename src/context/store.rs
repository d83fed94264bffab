//! Replicated record store: durable slot, merge, and subscriber fan-out.
//!
//! One store per execution context. All contexts at the same slot path
//! share the durable record; there is no locking across contexts, and
//! last-writer-wins races are accepted behavior. Within a context,
//! merges are serialized behind a mutex.

use crate::clock::ZonedClock;
use crate::context::bus::BusHandle;
use crate::context::record::{ContextRecord, Provenance};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Slot file name for the canonical unified record.
pub const SLOT_FILE: &str = "context_v2.json";

/// Slot file name of the legacy game-only record variant. Reserved so the
/// two variants can never collide; migrations between them are out of
/// scope and no legacy code path exists.
pub const LEGACY_SLOT_FILE: &str = "game_context_v1.json";

/// Observer invoked with the record after every local or remote change.
pub type Observer = Arc<dyn Fn(&ContextRecord) + Send + Sync>;

/// Hook invoked with the merged record after every local-provenance merge.
/// Installed by the remote sync adapter to feed its push debouncer.
pub type PushHook = Arc<dyn Fn(ContextRecord) + Send + Sync>;

/// Token returned by [`ContextStore::subscribe`]; pass to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

#[derive(Default)]
struct StoreInner {
    observers: Vec<(SubscriberId, Observer)>,
    next_subscriber: u64,
    push_hook: Option<PushHook>,
}

/// One execution context's view of the shared record.
pub struct ContextStore {
    slot_path: PathBuf,
    clock: ZonedClock,
    bus: BusHandle,
    /// Serializes read-modify-write cycles within this context.
    merge_lock: Mutex<()>,
    inner: Mutex<StoreInner>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ContextStore {
    /// Open a store on a slot path and attach it to the fan-out bus.
    /// Spawns the bus listener task, so a tokio runtime must be current.
    pub fn open(slot_path: impl Into<PathBuf>, bus: BusHandle, clock: ZonedClock) -> Arc<Self> {
        let store = Arc::new(Self {
            slot_path: slot_path.into(),
            clock,
            bus,
            merge_lock: Mutex::new(()),
            inner: Mutex::new(StoreInner::default()),
            listener: Mutex::new(None),
        });

        let mut subscription = store.bus.subscribe();
        let weak = Arc::downgrade(&store);
        let handle = tokio::spawn(async move {
            while let Some(record) = subscription.recv::<ContextRecord>().await {
                match weak.upgrade() {
                    Some(store) => store.notify(&record),
                    None => break,
                }
            }
        });
        *store.lock_listener() = Some(handle);

        store
    }

    /// Default slot path: `<config dir>/sideline/context_v2.json`.
    pub fn default_slot_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("sideline")
            .join(SLOT_FILE)
    }

    /// Current durable record. A missing, unreadable, or unparsable slot
    /// is an empty record, never an error.
    pub fn read(&self) -> ContextRecord {
        read_slot(&self.slot_path)
    }

    /// Merge a partial record into the durable slot and fan the result out.
    ///
    /// Partial's present fields overlay the current record and win on
    /// conflict; aliased pairs end equal; `updated_at` is stamped non-decreasing for
    /// local provenance and kept as supplied for server provenance. The
    /// new record is written to the slot, published to the bus for other
    /// contexts, and delivered to every subscriber in this context
    /// including the writer's own.
    pub fn merge(&self, partial: &ContextRecord, provenance: Provenance) -> ContextRecord {
        let next = {
            let _guard = self
                .merge_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            let current = self.read();
            let mut patch = partial.clone();
            patch.mirror_aliases();

            let mut next = current.clone();
            next.apply(&patch);
            next.fill_missing_aliases();

            match provenance {
                Provenance::Local => {
                    let floor = current.updated_at.unwrap_or(0);
                    next.updated_at = Some(self.clock.epoch_millis().max(floor));
                }
                Provenance::Server => {
                    // Server merges carry the authority's timestamp; stamp
                    // only when the caller supplied none.
                    if partial.updated_at.is_none() {
                        next.updated_at = Some(self.clock.epoch_millis());
                    }
                }
            }

            write_slot(&self.slot_path, &next);
            next
        };

        self.bus.publish(&next);
        self.notify(&next);

        if provenance == Provenance::Local {
            let hook = self.lock_inner().push_hook.clone();
            if let Some(hook) = hook {
                (hook.as_ref())(next.clone());
            }
        }

        next
    }

    /// Reset every known field to the empty string.
    pub fn clear(&self) -> ContextRecord {
        self.merge(&ContextRecord::cleared(), Provenance::Local)
    }

    /// Register an observer. It is invoked immediately with the current
    /// record and again on every subsequent change. Observer panics are
    /// isolated: they are logged and do not stop the fan-out.
    pub fn subscribe(&self, observer: Observer) -> SubscriberId {
        let id = {
            let mut inner = self.lock_inner();
            let id = SubscriberId(inner.next_subscriber);
            inner.next_subscriber += 1;
            inner.observers.push((id, observer.clone()));
            id
        };
        invoke_observer(&observer, &self.read());
        id
    }

    /// Deregister an observer. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.lock_inner().observers.retain(|(known, _)| *known != id);
    }

    /// Install the local-merge push hook. Replaces any previous hook.
    pub fn set_push_hook(&self, hook: PushHook) {
        self.lock_inner().push_hook = Some(hook);
    }

    // Single-field setters mirroring the surface-level edit operations.
    // Each trims its input and runs a local-provenance merge.

    pub fn set_game(&self, id: &str) -> ContextRecord {
        self.set_field(|r, v| r.game_id = Some(v), id)
    }

    pub fn set_drive(&self, id: &str) -> ContextRecord {
        self.set_field(|r, v| r.drive_id = Some(v), id)
    }

    pub fn set_play(&self, id: &str) -> ContextRecord {
        self.set_field(|r, v| r.play_id = Some(v), id)
    }

    pub fn set_tryout(&self, id: &str) -> ContextRecord {
        self.set_field(|r, v| r.tryout_id = Some(v), id)
    }

    pub fn set_station(&self, id: &str) -> ContextRecord {
        self.set_field(|r, v| r.station_id = Some(v), id)
    }

    pub fn set_rep(&self, id: &str) -> ContextRecord {
        self.set_field(|r, v| r.rep_id = Some(v), id)
    }

    pub fn set_group(&self, code: &str) -> ContextRecord {
        self.set_field(|r, v| r.group_code = Some(v), code)
    }

    pub fn set_period(&self, code: &str) -> ContextRecord {
        self.set_field(|r, v| r.period_code = Some(v), code)
    }

    fn set_field(
        &self,
        assign: impl FnOnce(&mut ContextRecord, String),
        value: &str,
    ) -> ContextRecord {
        let mut patch = ContextRecord::default();
        assign(&mut patch, value.trim().to_owned());
        self.merge(&patch, Provenance::Local)
    }

    /// Deliver a record to every observer, isolating panics per observer.
    fn notify(&self, record: &ContextRecord) {
        let observers: Vec<Observer> = self
            .lock_inner()
            .observers
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for observer in observers {
            invoke_observer(&observer, record);
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_listener(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ContextStore {
    fn drop(&mut self) {
        if let Some(handle) = self.lock_listener().take() {
            handle.abort();
        }
    }
}

fn invoke_observer(observer: &Observer, record: &ContextRecord) {
    if catch_unwind(AssertUnwindSafe(|| (observer.as_ref())(record))).is_err() {
        warn!("context observer panicked; continuing fan-out");
    }
}

fn read_slot(path: &Path) -> ContextRecord {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            warn!("slot at {} is unparsable, treating as empty: {e}", path.display());
            ContextRecord::default()
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => ContextRecord::default(),
        Err(e) => {
            warn!("cannot read slot at {}: {e}", path.display());
            ContextRecord::default()
        }
    }
}

/// Write the record to the slot. Failures are logged and the in-memory
/// fan-out proceeds; the slot heals on the next successful write.
fn write_slot(path: &Path, record: &ContextRecord) {
    if let Some(parent) = path.parent()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        warn!("cannot create slot dir {}: {e}", parent.display());
        return;
    }
    match serde_json::to_string_pretty(record) {
        Ok(json) => {
            if let Err(e) = std::fs::write(path, json) {
                warn!("cannot write slot at {}: {e}", path.display());
            } else {
                debug!("slot updated at {}", path.display());
            }
        }
        Err(e) => warn!("cannot serialize slot record: {e}"),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::context::bus::{CONTEXT_CHANNEL, LocalBus};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn test_clock() -> ZonedClock {
        ZonedClock::system(chrono_tz::America::New_York)
    }

    fn open_store(dir: &tempfile::TempDir, bus: &Arc<LocalBus>) -> Arc<ContextStore> {
        ContextStore::open(
            dir.path().join(SLOT_FILE),
            bus.handle(CONTEXT_CHANNEL),
            test_clock(),
        )
    }

    #[tokio::test]
    async fn merge_keeps_aliased_pairs_equal() {
        let dir = tempfile::tempdir().unwrap();
        let bus = LocalBus::new();
        let store = open_store(&dir, &bus);

        store.set_tryout("T-24");
        store.set_drive("D-3");
        let record = store.read();

        assert_eq!(record.game_id.as_deref(), Some("T-24"));
        assert_eq!(record.tryout_id.as_deref(), Some("T-24"));
        assert_eq!(record.station_id.as_deref(), Some("D-3"));
        assert!(record.aliases_consistent());
    }

    #[tokio::test]
    async fn sequential_merges_never_decrease_updated_at() {
        let dir = tempfile::tempdir().unwrap();
        let bus = LocalBus::new();
        let store = open_store(&dir, &bus);

        let first = store.set_game("G1").updated_at.unwrap();
        let second = store.set_play("P1").updated_at.unwrap();
        assert!(second >= first);
    }

    #[tokio::test]
    async fn server_merge_keeps_supplied_timestamp_even_when_smaller() {
        let dir = tempfile::tempdir().unwrap();
        let bus = LocalBus::new();
        let store = open_store(&dir, &bus);

        store.set_game("G1");
        let mut server = ContextRecord::default();
        server.game_id = Some("G2".into());
        server.updated_at = Some(42);

        let merged = store.merge(&server, Provenance::Server);
        assert_eq!(merged.updated_at, Some(42));
        assert_eq!(merged.game_id.as_deref(), Some("G2"));
    }

    #[tokio::test]
    async fn server_merges_do_not_trigger_the_push_hook() {
        let dir = tempfile::tempdir().unwrap();
        let bus = LocalBus::new();
        let store = open_store(&dir, &bus);

        let pushes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pushes);
        store.set_push_hook(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        store.merge(&ContextRecord::default(), Provenance::Server);
        assert_eq!(pushes.load(Ordering::SeqCst), 0);

        store.set_game("G1");
        assert_eq!(pushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn clear_resets_every_field_to_empty_strings() {
        let dir = tempfile::tempdir().unwrap();
        let bus = LocalBus::new();
        let store = open_store(&dir, &bus);

        store.set_tryout("T1");
        store.set_group("A");
        store.clear();

        let record = store.read();
        assert_eq!(record.game_id.as_deref(), Some(""));
        assert_eq!(record.tryout_id.as_deref(), Some(""));
        assert_eq!(record.group_code.as_deref(), Some(""));
        assert!(record.aliases_consistent());
    }

    #[tokio::test]
    async fn corrupt_slot_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let bus = LocalBus::new();
        let path = dir.path().join(SLOT_FILE);
        std::fs::write(&path, "not json at all {{{").unwrap();

        let store = ContextStore::open(path, bus.handle(CONTEXT_CHANNEL), test_clock());
        assert!(store.read().is_empty());
    }

    #[tokio::test]
    async fn observer_panic_does_not_stop_fanout() {
        let dir = tempfile::tempdir().unwrap();
        let bus = LocalBus::new();
        let store = open_store(&dir, &bus);

        store.subscribe(Arc::new(|_| panic!("observer bug")));
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        store.subscribe(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        // initial delivery + one merge
        store.set_game("G1");
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unsubscribe_stops_deliveries() {
        let dir = tempfile::tempdir().unwrap();
        let bus = LocalBus::new();
        let store = open_store(&dir, &bus);

        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        let id = store.subscribe(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        store.unsubscribe(id);
        store.set_game("G1");
        assert_eq!(delivered.load(Ordering::SeqCst), 1, "only the initial delivery");
    }

    #[tokio::test]
    async fn merge_in_one_context_reaches_subscribers_in_another() {
        let dir = tempfile::tempdir().unwrap();
        let bus = LocalBus::new();
        let writer = open_store(&dir, &bus);
        let reader = open_store(&dir, &bus);

        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        reader.subscribe(Arc::new(move |record: &ContextRecord| {
            let _ = seen_tx.send(record.clone());
        }));
        // drain the immediate initial delivery
        let initial = seen_rx.recv().await.unwrap();
        assert!(initial.is_empty());

        writer.set_station("S-1");

        let seen = tokio::time::timeout(Duration::from_secs(1), seen_rx.recv())
            .await
            .expect("bus delivery")
            .unwrap();
        assert_eq!(seen.station_id.as_deref(), Some("S-1"));
        assert_eq!(seen.drive_id.as_deref(), Some("S-1"));

        // and the shared durable slot agrees
        assert_eq!(reader.read().station_id.as_deref(), Some("S-1"));
    }

    #[test]
    fn slot_variants_never_collide() {
        assert_ne!(SLOT_FILE, LEGACY_SLOT_FILE);
    }
}
