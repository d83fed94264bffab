//! Engine lifecycle: wires the store, bus, sync, scheduler, and
//! dispatcher into one instance with explicit start/shutdown.
//!
//! There are no process-wide singletons; several runtimes can coexist in
//! one process (each is one "execution context"), and runtimes sharing a
//! [`LocalBus`] and a slot path replicate to each other.

use crate::clock::{Clock, SystemClock, ZonedClock};
use crate::config::SidelineConfig;
use crate::context::bus::{CONTEXT_CHANNEL, LocalBus, NOTICE_CHANNEL};
use crate::context::store::ContextStore;
use crate::context::sync::RemoteSync;
use crate::notify::{NoticeDispatcher, NoticeSurface, TracingSurface};
use crate::periods::dictionary::HttpPeriodSource;
use crate::periods::scheduler::PeriodScheduler;
use crate::periods::PeriodSource;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Debounce window for dictionary refreshes driven by tryout changes.
const TRYOUT_REFRESH_DEBOUNCE: Duration = Duration::from_millis(200);

/// One running engine instance.
pub struct Runtime {
    config: SidelineConfig,
    store: Arc<ContextStore>,
    dispatcher: Arc<NoticeDispatcher>,
    scheduler: Arc<PeriodScheduler>,
    sync: Option<Arc<RemoteSync>>,
    source: Option<Arc<dyn PeriodSource>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Build a runtime with production defaults: its own bus, the system
    /// clock, and the logging notice surface.
    pub fn new(config: SidelineConfig) -> crate::Result<Self> {
        Self::with_parts(
            config,
            &LocalBus::new(),
            Arc::new(SystemClock),
            Arc::new(TracingSurface),
            None,
        )
    }

    /// Build a runtime from explicit parts. Runtimes given the same bus
    /// and slot path act as peer contexts; tests inject a fixed clock, a
    /// recording surface, or a static period source here.
    pub fn with_parts(
        config: SidelineConfig,
        bus: &Arc<LocalBus>,
        clock: Arc<dyn Clock>,
        surface: Arc<dyn NoticeSurface>,
        period_source: Option<Arc<dyn PeriodSource>>,
    ) -> crate::Result<Self> {
        let zoned = ZonedClock::new(clock, config.periods.resolved_timezone());
        let slot_path = config
            .storage
            .slot_path
            .clone()
            .unwrap_or_else(ContextStore::default_slot_path);

        let store = ContextStore::open(slot_path, bus.handle(CONTEXT_CHANNEL), zoned.clone());
        let dispatcher = NoticeDispatcher::start(
            surface,
            bus.handle(NOTICE_CHANNEL),
            zoned.clone(),
            Duration::from_millis(config.notices.duration_ms),
        );
        let scheduler = PeriodScheduler::new(zoned, Arc::clone(&dispatcher), &config.periods);

        let sync = if config.sync.enabled && !config.sync.api_base.trim().is_empty() {
            Some(RemoteSync::connect(&config.sync, Arc::clone(&store))?)
        } else {
            None
        };

        let source: Option<Arc<dyn PeriodSource>> = match period_source {
            Some(source) => Some(source),
            None if !config.sync.api_base.trim().is_empty() => {
                Some(Arc::new(HttpPeriodSource::new(&config.sync)?))
            }
            None => None,
        };

        Ok(Self {
            config,
            store,
            dispatcher,
            scheduler,
            sync,
            source,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the background loops: authority polling (when sync is
    /// enabled), the transition check heartbeat, the dictionary refresh
    /// cadence, and the tryout-change refresh debounce.
    pub fn start(&self) {
        if let Some(sync) = &self.sync {
            sync.start_polling(self.config.sync.poll_interval_ms);
        }

        let mut tasks = self.lock_tasks();
        tasks.push(self.scheduler.run(self.cancel.child_token()));

        if let Some(source) = &self.source {
            tasks.push(self.spawn_refresh_cadence(source));
            tasks.push(self.spawn_tryout_refresh(source));
        }

        info!(
            sync = self.sync.is_some(),
            dictionary = self.source.is_some(),
            "sideline runtime started"
        );
    }

    /// Fetch the dictionary and rebuild the scheduling pass immediately.
    /// No-op without a period source. Hosts with an external "became
    /// visible" signal call this on regain.
    pub async fn refresh_now(&self) {
        if let Some(source) = &self.source {
            refresh(source, &self.store, &self.scheduler).await;
        }
    }

    /// Stop polling, cancel the background loops, and disarm all timers.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(sync) = &self.sync {
            sync.stop_polling();
        }
        self.scheduler.clear_timers();
        for handle in self.lock_tasks().drain(..) {
            handle.abort();
        }
        info!("sideline runtime stopped");
    }

    pub fn store(&self) -> &Arc<ContextStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<NoticeDispatcher> {
        &self.dispatcher
    }

    pub fn scheduler(&self) -> &Arc<PeriodScheduler> {
        &self.scheduler
    }

    pub fn sync(&self) -> Option<&Arc<RemoteSync>> {
        self.sync.as_ref()
    }

    fn spawn_refresh_cadence(&self, source: &Arc<dyn PeriodSource>) -> JoinHandle<()> {
        let cancel = self.cancel.child_token();
        let source = Arc::clone(source);
        let store = Arc::clone(&self.store);
        let scheduler = Arc::clone(&self.scheduler);
        let interval_secs = self.config.periods.refresh_interval_secs.max(1);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                refresh(&source, &store, &scheduler).await;
            }
        })
    }

    /// Refresh the dictionary shortly after the record's tryout changes,
    /// so a context switched to another tryout picks up that tryout's
    /// periods without waiting out the cadence.
    fn spawn_tryout_refresh(&self, source: &Arc<dyn PeriodSource>) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        self.store.subscribe(Arc::new(move |record| {
            if let Some(tryout) = &record.tryout_id {
                let _ = tx.send(tryout.clone());
            }
        }));

        let cancel = self.cancel.child_token();
        let source = Arc::clone(source);
        let store = Arc::clone(&self.store);
        let scheduler = Arc::clone(&self.scheduler);
        tokio::spawn(async move {
            let mut last_refreshed: Option<String> = None;
            loop {
                let first = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = rx.recv() => received,
                };
                let Some(mut latest) = first else { break };
                loop {
                    match tokio::time::timeout(TRYOUT_REFRESH_DEBOUNCE, rx.recv()).await {
                        Ok(Some(newer)) => latest = newer,
                        Ok(None) | Err(_) => break,
                    }
                }
                if last_refreshed.as_deref() == Some(latest.as_str()) {
                    continue;
                }
                last_refreshed = Some(latest);
                refresh(&source, &store, &scheduler).await;
            }
        })
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Fetch the period list scoped to the current tryout, replace the
/// scheduling pass, and silently record the already-active period so it
/// is not re-announced.
async fn refresh(
    source: &Arc<dyn PeriodSource>,
    store: &Arc<ContextStore>,
    scheduler: &Arc<PeriodScheduler>,
) {
    let tryout = store.read().tryout_id.filter(|id| !id.is_empty());
    let periods = source.fetch(tryout.as_deref()).await;
    scheduler.schedule(periods);
    scheduler.mark_active_silently();
}
