//! Remote Authority Contract Tests
//!
//! Verify exact HTTP format compliance for the context sync adapter:
//! - GET reads use `action=ctx_get` and tolerate every failure shape
//! - POST writes carry only the three identifier fields in a plain-text
//!   JSON envelope
//! - the server-timestamp watermark gates which pulls are applied
//! - rapid local edits coalesce into one debounced push

use sideline::clock::ZonedClock;
use sideline::config::SyncConfig;
use sideline::context::bus::{CONTEXT_CHANNEL, LocalBus};
use sideline::context::store::ContextStore;
use sideline::context::sync::RemoteSync;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sync_config(server: &MockServer) -> SyncConfig {
    SyncConfig {
        api_base: server.uri(),
        enabled: true,
        poll_interval_ms: 1000,
        push_debounce_ms: 50,
        request_timeout_secs: 2,
    }
}

fn open_store(dir: &tempfile::TempDir) -> Arc<ContextStore> {
    let bus = LocalBus::new();
    ContextStore::open(
        dir.path().join("context_v2.json"),
        bus.handle(CONTEXT_CHANNEL),
        ZonedClock::system(chrono_tz::America::New_York),
    )
}

fn ctx_body(game: &str, drive: &str, play: &str, ts: u64) -> serde_json::Value {
    serde_json::json!({
        "ok": true,
        "ctx": {"game_id": game, "drive_id": drive, "play_id": play, "ts": ts}
    })
}

#[tokio::test]
async fn pull_sends_ctx_get_and_parses_the_record() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(query_param("action", "ctx_get"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ctx_body("G7", "D2", "P9", 1111)))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let sync = RemoteSync::connect(&sync_config(&server), open_store(&dir)).expect("connect");

    let ctx = sync.pull().await.expect("server context");
    assert_eq!(ctx.game_id.as_deref(), Some("G7"));
    assert_eq!(ctx.drive_id.as_deref(), Some("D2"));
    assert_eq!(ctx.play_id.as_deref(), Some("P9"));
    assert_eq!(ctx.ts, 1111);
}

#[tokio::test]
async fn pull_degrades_to_none_on_every_failure_shape() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let sync = RemoteSync::connect(&sync_config(&server), open_store(&dir)).expect("connect");

    // Non-2xx status.
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    assert!(sync.pull().await.is_none());

    // Non-JSON body.
    server.reset().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>not json</html>"))
        .mount(&server)
        .await;
    assert!(sync.pull().await.is_none());

    // ok: false.
    server.reset().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": false})),
        )
        .mount(&server)
        .await;
    assert!(sync.pull().await.is_none());
}

#[tokio::test]
async fn push_writes_only_the_three_identifiers_as_plain_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("content-type", "text/plain;charset=utf-8"))
        .and(body_partial_json(serde_json::json!({
            "action": "ctx_set",
            "game_id": "T1",
            "drive_id": "S1",
            "play_id": "R1"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let sync = RemoteSync::connect(&sync_config(&server), open_store(&dir)).expect("connect");

    // Scheme-B values take precedence in the outbound payload, and the
    // group/period extensions never leave the process.
    let record = sideline::ContextRecord {
        game_id: Some("stale".to_owned()),
        tryout_id: Some("T1".to_owned()),
        station_id: Some("S1".to_owned()),
        rep_id: Some("R1".to_owned()),
        group_code: Some("alpha".to_owned()),
        ..sideline::ContextRecord::default()
    };

    let ack = sync.push(&record).await.expect("ack");
    assert!(ack.ok);

    let requests = server.received_requests().await.expect("requests");
    let post = requests
        .iter()
        .find(|r| r.method.as_str() == "POST")
        .expect("one post");
    let body: serde_json::Value = serde_json::from_slice(&post.body).expect("json body");
    let fields = body.as_object().expect("object");
    assert_eq!(fields.len(), 4, "action plus exactly three identifiers");
    assert!(fields.get("group_code").is_none());
}

#[tokio::test]
async fn poll_once_applies_only_strictly_newer_timestamps() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir);
    let sync = RemoteSync::connect(&sync_config(&server), Arc::clone(&store)).expect("connect");

    // First pull: ts 100 applies and advances the watermark.
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ctx_body("G1", "", "", 100)))
        .mount(&server)
        .await;
    sync.poll_once().await;
    assert_eq!(sync.watermark(), 100);
    let applied = store.read();
    assert_eq!(applied.game_id.as_deref(), Some("G1"));
    assert_eq!(applied.tryout_id.as_deref(), Some("G1"), "server fields mirror to both schemes");
    assert_eq!(applied.updated_at, Some(100), "server merge carries ts as updated_at");

    // Stale pull: ts 40 must not clobber anything.
    server.reset().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ctx_body("OLD", "", "", 40)))
        .mount(&server)
        .await;
    sync.poll_once().await;
    assert_eq!(sync.watermark(), 100);
    assert_eq!(store.read().game_id.as_deref(), Some("G1"));

    // Replayed pull: ts equal to the watermark is a no-op too.
    server.reset().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ctx_body("REPLAY", "", "", 100)))
        .mount(&server)
        .await;
    sync.poll_once().await;
    assert_eq!(store.read().game_id.as_deref(), Some("G1"));

    // Newer pull always applies and advances the watermark.
    server.reset().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ctx_body("G2", "D9", "", 250)))
        .mount(&server)
        .await;
    sync.poll_once().await;
    assert_eq!(sync.watermark(), 250);
    let latest = store.read();
    assert_eq!(latest.game_id.as_deref(), Some("G2"));
    assert_eq!(latest.station_id.as_deref(), Some("D9"));
}

#[tokio::test]
async fn polling_loop_issues_an_immediate_first_pull() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(query_param("action", "ctx_get"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ctx_body("LIVE", "", "", 7)))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir);
    let sync = RemoteSync::connect(&sync_config(&server), Arc::clone(&store)).expect("connect");

    sync.start_polling(1000);
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if store.read().game_id.as_deref() == Some("LIVE") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("first pull should land without waiting out the interval");

    sync.stop_polling();
}

#[tokio::test]
async fn rapid_local_edits_coalesce_into_one_push() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(serde_json::json!({"game_id": "G3"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir);
    let _sync = RemoteSync::connect(&sync_config(&server), Arc::clone(&store)).expect("connect");

    // Keystroke-speed edits: only the final state goes out.
    store.set_game("G");
    store.set_game("G3");

    tokio::time::sleep(Duration::from_millis(400)).await;
    let posts = server
        .received_requests()
        .await
        .expect("requests")
        .iter()
        .filter(|r| r.method.as_str() == "POST")
        .count();
    assert_eq!(posts, 1, "debounce coalesces a burst into one push");
}

#[tokio::test]
async fn server_applied_merges_never_push_back() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ctx_body("G1", "", "", 10)))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir);
    let sync = RemoteSync::connect(&sync_config(&server), Arc::clone(&store)).expect("connect");

    sync.poll_once().await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let posts = server
        .received_requests()
        .await
        .expect("requests")
        .iter()
        .filter(|r| r.method.as_str() == "POST")
        .count();
    assert_eq!(posts, 0, "a poll-applied merge must not re-trigger a push");
}
