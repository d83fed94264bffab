//! Remote authority synchronization.
//!
//! Pulls the authority's record on an interval and pushes local changes
//! after a short debounce. Two mechanisms keep the loop from oscillating:
//! the merge provenance tag (server-applied merges never schedule a push)
//! and a monotonic watermark of the last applied server timestamp (stale
//! or out-of-order reads never clobber newer local state).

use crate::config::SyncConfig;
use crate::context::record::{ContextRecord, Provenance};
use crate::context::store::ContextStore;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

/// Floor for the polling interval; smaller configured values are clamped.
pub const MIN_POLL_INTERVAL_MS: u64 = 300;

/// The authority's copy of the record. The schema predates the
/// group/period extensions, so it carries only the three identifiers
/// plus the server-assigned timestamp.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerContext {
    #[serde(default)]
    pub game_id: Option<String>,
    #[serde(default)]
    pub drive_id: Option<String>,
    #[serde(default)]
    pub play_id: Option<String>,
    /// Server-assigned timestamp, milliseconds.
    #[serde(default)]
    pub ts: u64,
}

#[derive(Debug, Deserialize)]
struct CtxGetResponse {
    #[serde(default)]
    ok: bool,
    ctx: Option<ServerContext>,
}

#[derive(Debug, Serialize)]
struct CtxSetRequest<'a> {
    action: &'static str,
    game_id: &'a str,
    drive_id: &'a str,
    play_id: &'a str,
}

/// Authority write acknowledgment.
#[derive(Debug, Clone, Deserialize)]
pub struct Ack {
    #[serde(default)]
    pub ok: bool,
}

/// Optional collaborator of [`ContextStore`] that mirrors the record to
/// and from the remote authority.
pub struct RemoteSync {
    client: reqwest::Client,
    api_base: Url,
    store: Arc<ContextStore>,
    /// Highest server `ts` already applied locally.
    watermark: AtomicU64,
    poll_cancel: Mutex<Option<CancellationToken>>,
    debounce_cancel: CancellationToken,
}

impl RemoteSync {
    /// Build the adapter, install the push hook on the store, and start
    /// the push debouncer. Polling starts separately via
    /// [`RemoteSync::start_polling`].
    pub fn connect(config: &SyncConfig, store: Arc<ContextStore>) -> crate::Result<Arc<Self>> {
        if config.api_base.trim().is_empty() {
            return Err(crate::SidelineError::Config(
                "sync.api_base is not set".to_owned(),
            ));
        }
        let api_base = Url::parse(config.api_base.trim())
            .map_err(|e| crate::SidelineError::Config(format!("invalid sync.api_base: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| crate::SidelineError::Transport(format!("cannot build client: {e}")))?;

        let sync = Arc::new(Self {
            client,
            api_base,
            store: Arc::clone(&store),
            watermark: AtomicU64::new(0),
            poll_cancel: Mutex::new(None),
            debounce_cancel: CancellationToken::new(),
        });

        let (push_tx, push_rx) = mpsc::unbounded_channel();
        store.set_push_hook(Arc::new(move |record| {
            let _ = push_tx.send(record);
        }));
        spawn_push_debouncer(
            Arc::downgrade(&sync),
            push_rx,
            Duration::from_millis(config.push_debounce_ms),
            sync.debounce_cancel.clone(),
        );

        Ok(sync)
    }

    /// Read the authority's record. Any transport, status, or parse
    /// failure yields `None`; nothing propagates to the caller.
    pub async fn pull(&self) -> Option<ServerContext> {
        let mut url = self.api_base.clone();
        url.query_pairs_mut().append_pair("action", "ctx_get");

        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!("context pull failed: {e}");
                return None;
            }
        };
        if !response.status().is_success() {
            debug!("context pull returned {}", response.status());
            return None;
        }
        match response.json::<CtxGetResponse>().await {
            Ok(body) if body.ok => body.ctx,
            Ok(_) => None,
            Err(e) => {
                debug!("context pull body unparsable: {e}");
                None
            }
        }
    }

    /// Write the three identifier fields to the authority. The body is
    /// JSON in a plain-text envelope (the authority predates CORS
    /// preflight support). `None` on any failure.
    pub async fn push(&self, record: &ContextRecord) -> Option<Ack> {
        let payload = set_payload(record);
        let body = match serde_json::to_string(&payload) {
            Ok(body) => body,
            Err(e) => {
                warn!("cannot serialize context push: {e}");
                return None;
            }
        };

        let response = match self
            .client
            .post(self.api_base.clone())
            .header(reqwest::header::CONTENT_TYPE, "text/plain;charset=utf-8")
            .body(body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                debug!("context push failed: {e}");
                return None;
            }
        };
        if !response.status().is_success() {
            debug!("context push returned {}", response.status());
            return None;
        }
        match response.json::<Ack>().await {
            Ok(ack) => Some(ack),
            Err(e) => {
                debug!("context push ack unparsable: {e}");
                None
            }
        }
    }

    /// One pull/apply cycle. Applies the server record only when its `ts`
    /// is strictly newer than the watermark, advancing the watermark;
    /// anything else is a no-op.
    pub async fn poll_once(&self) {
        let Some(ctx) = self.pull().await else {
            return;
        };
        let previous = self.watermark.fetch_max(ctx.ts, Ordering::AcqRel);
        if ctx.ts <= previous {
            return;
        }

        let session = ctx.game_id.unwrap_or_default();
        let sub = ctx.drive_id.unwrap_or_default();
        let unit = ctx.play_id.unwrap_or_default();
        let patch = ContextRecord {
            game_id: Some(session.clone()),
            drive_id: Some(sub.clone()),
            play_id: Some(unit.clone()),
            tryout_id: Some(session),
            station_id: Some(sub),
            rep_id: Some(unit),
            updated_at: Some(ctx.ts),
            ..ContextRecord::default()
        };
        debug!("applying server context with ts {}", ctx.ts);
        self.store.merge(&patch, Provenance::Server);
    }

    /// Arm the recurring poll loop with an immediate first call.
    /// Re-arming replaces the previous loop.
    pub fn start_polling(self: &Arc<Self>, interval_ms: u64) {
        let interval_ms = if interval_ms < MIN_POLL_INTERVAL_MS {
            warn!(
                "poll interval {interval_ms}ms below floor, clamping to {MIN_POLL_INTERVAL_MS}ms"
            );
            MIN_POLL_INTERVAL_MS
        } else {
            interval_ms
        };

        let token = CancellationToken::new();
        if let Some(previous) = self
            .lock_poll_cancel()
            .replace(token.clone())
        {
            previous.cancel();
        }

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(sync) = weak.upgrade() else { break };
                        // An in-flight pull is never cancelled mid-call;
                        // cancellation takes effect on the next tick.
                        sync.poll_once().await;
                    }
                }
            }
        });
    }

    /// Disarm the poll loop. An already-dispatched pull still completes.
    pub fn stop_polling(&self) {
        if let Some(token) = self.lock_poll_cancel().take() {
            token.cancel();
        }
    }

    /// Highest server timestamp applied so far.
    pub fn watermark(&self) -> u64 {
        self.watermark.load(Ordering::Acquire)
    }

    fn lock_poll_cancel(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.poll_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for RemoteSync {
    fn drop(&mut self) {
        self.stop_polling();
        self.debounce_cancel.cancel();
    }
}

/// Outbound payload: the three identifiers only, scheme-B values
/// preferred when non-empty (matching what the authority's own pages
/// would have written).
fn set_payload(record: &ContextRecord) -> CtxSetRequest<'_> {
    fn pick<'a>(preferred: &'a Option<String>, fallback: &'a Option<String>) -> &'a str {
        preferred
            .as_deref()
            .filter(|value| !value.is_empty())
            .or(fallback.as_deref())
            .unwrap_or("")
    }
    CtxSetRequest {
        action: "ctx_set",
        game_id: pick(&record.tryout_id, &record.game_id),
        drive_id: pick(&record.station_id, &record.drive_id),
        play_id: pick(&record.rep_id, &record.play_id),
    }
}

/// Debounce task: coalesce bursts of local merges into one outbound push
/// of the latest record once the burst quiets down.
fn spawn_push_debouncer(
    sync: Weak<RemoteSync>,
    mut rx: mpsc::UnboundedReceiver<ContextRecord>,
    window: Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let first = tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => received,
            };
            let Some(mut latest) = first else { break };

            // Keep absorbing until the window passes with no newer record.
            loop {
                match tokio::time::timeout(window, rx.recv()).await {
                    Ok(Some(newer)) => latest = newer,
                    Ok(None) => break,
                    Err(_) => break,
                }
            }

            let Some(sync) = sync.upgrade() else { break };
            if sync.push(&latest).await.is_none() {
                debug!("debounced context push did not land");
            }
        }
    });
}
