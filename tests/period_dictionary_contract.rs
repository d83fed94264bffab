//! Period Dictionary Contract Tests
//!
//! Verify the dictionary client's request shape and its tolerance for
//! the row-name variants the dictionary has shipped over time.

use sideline::config::SyncConfig;
use sideline::periods::dictionary::HttpPeriodSource;
use sideline::periods::PeriodSource;
use wiremock::matchers::{method, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn source_for(server: &MockServer) -> HttpPeriodSource {
    HttpPeriodSource::new(&SyncConfig {
        api_base: server.uri(),
        request_timeout_secs: 2,
        ..SyncConfig::default()
    })
    .expect("source")
}

#[tokio::test]
async fn fetch_requests_tryout_periods_with_the_tryout_scope() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(query_param("action", "tryout_periods"))
        .and(query_param("tryout_id", "T-24"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ok": true,
            "periods": [
                {"period_code": "P1", "period_label": "Warmups", "start_time": "9:00", "end_time": "9:30"}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let periods = source_for(&server).fetch(Some("T-24")).await;
    assert_eq!(periods.len(), 1);
    assert_eq!(periods[0].code, "P1");
    assert_eq!(periods[0].label, "Warmups");
    assert_eq!(periods[0].start, "9:00");
    assert_eq!(periods[0].end, "9:30");
}

#[tokio::test]
async fn fetch_omits_the_tryout_scope_when_unknown() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(query_param("action", "tryout_periods"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "rows": [
                {"code": "P2", "label": "Drills", "start": "9:30 AM", "end": "10:15 AM"}
            ]
        })))
        .mount(&server)
        .await;

    let periods = source_for(&server).fetch(None).await;
    assert_eq!(periods.len(), 1);
    assert_eq!(periods[0].code, "P2");

    let requests = server.received_requests().await.expect("requests");
    assert!(
        !requests[0].url.query().unwrap_or("").contains("tryout_id"),
        "no tryout scope without a tryout"
    );
}

#[tokio::test]
async fn fetch_degrades_to_an_empty_list_on_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    assert!(source_for(&server).fetch(None).await.is_empty());

    server.reset().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;
    assert!(source_for(&server).fetch(None).await.is_empty());
}

#[tokio::test]
async fn incomplete_rows_are_dropped_not_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "rows": [
                {"label": "No code", "start": "9:00"},
                {"code": "P3", "start": "11:00"},
                {"code": "P4"}
            ]
        })))
        .mount(&server)
        .await;

    let periods = source_for(&server).fetch(None).await;
    assert_eq!(periods.len(), 1);
    assert_eq!(periods[0].code, "P3");
    assert_eq!(periods[0].label, "P3");
}
