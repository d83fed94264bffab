//! Period dictionary client (boundary collaborator).
//!
//! The dictionary endpoint serves the day's period list. Row field names
//! vary across dictionary versions, so the row type tolerates both
//! spellings of every column. The fetched list fully replaces the
//! scheduler's cached list; nothing is merged.

use crate::config::SyncConfig;
use crate::periods::Period;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;
use url::Url;

/// Source of the current period list.
#[async_trait]
pub trait PeriodSource: Send + Sync {
    /// Fetch the period list, scoped to a tryout when one is known.
    /// Failures degrade to an empty list; implementations never error.
    async fn fetch(&self, tryout_id: Option<&str>) -> Vec<Period>;
}

/// One dictionary row. Older dictionary exports use the long column
/// names, newer ones the short names.
#[derive(Debug, Deserialize)]
struct PeriodRow {
    #[serde(default, alias = "period_code")]
    code: Option<String>,
    #[serde(default, alias = "period_label")]
    label: Option<String>,
    #[serde(default, alias = "start_time", alias = "start_local")]
    start: Option<String>,
    #[serde(default, alias = "end_time", alias = "end_local")]
    end: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PeriodsResponse {
    #[serde(default)]
    periods: Option<Vec<PeriodRow>>,
    #[serde(default)]
    rows: Option<Vec<PeriodRow>>,
}

/// HTTP dictionary client against the authority endpoint.
pub struct HttpPeriodSource {
    client: reqwest::Client,
    api_base: Url,
}

impl HttpPeriodSource {
    pub fn new(config: &SyncConfig) -> crate::Result<Self> {
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
        Ok(Self { client, api_base })
    }
}

#[async_trait]
impl PeriodSource for HttpPeriodSource {
    async fn fetch(&self, tryout_id: Option<&str>) -> Vec<Period> {
        let mut url = self.api_base.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("action", "tryout_periods");
            if let Some(tryout_id) = tryout_id.filter(|id| !id.is_empty()) {
                query.append_pair("tryout_id", tryout_id);
            }
        }

        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("period dictionary fetch failed: {e}");
                return Vec::new();
            }
        };
        if !response.status().is_success() {
            warn!("period dictionary returned {}", response.status());
            return Vec::new();
        }
        match response.json::<PeriodsResponse>().await {
            Ok(body) => rows_to_periods(body.periods.or(body.rows).unwrap_or_default()),
            Err(e) => {
                warn!("period dictionary body unparsable: {e}");
                Vec::new()
            }
        }
    }
}

/// Fixed period list, for tests and hosts with their own dictionary.
#[derive(Debug, Clone, Default)]
pub struct StaticPeriodSource {
    periods: Vec<Period>,
}

impl StaticPeriodSource {
    pub fn new(periods: Vec<Period>) -> Self {
        Self { periods }
    }
}

#[async_trait]
impl PeriodSource for StaticPeriodSource {
    async fn fetch(&self, _tryout_id: Option<&str>) -> Vec<Period> {
        self.periods.clone()
    }
}

/// Rows without a code or a start time are dropped; a missing label
/// falls back to the code.
fn rows_to_periods(rows: Vec<PeriodRow>) -> Vec<Period> {
    rows.into_iter()
        .filter_map(|row| {
            let code = row.code.filter(|code| !code.is_empty())?;
            let start = row.start.filter(|start| !start.is_empty())?;
            let label = row
                .label
                .filter(|label| !label.is_empty())
                .unwrap_or_else(|| code.clone());
            Some(Period {
                code,
                label,
                start,
                end: row.end.unwrap_or_default(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn rows_tolerate_both_column_spellings() {
        let body = r#"{
            "rows": [
                {"period_code": "P1", "period_label": "Warmups", "start_time": "9:00", "end_time": "9:30"},
                {"code": "P2", "label": "Drills", "start": "9:30", "end": "10:15"}
            ]
        }"#;
        let parsed: PeriodsResponse = serde_json::from_str(body).unwrap();
        let periods = rows_to_periods(parsed.periods.or(parsed.rows).unwrap_or_default());

        assert_eq!(periods.len(), 2);
        assert_eq!(periods[0].code, "P1");
        assert_eq!(periods[0].label, "Warmups");
        assert_eq!(periods[1].start, "9:30");
    }

    #[test]
    fn rows_without_code_or_start_are_dropped() {
        let rows = vec![
            PeriodRow {
                code: Some("P1".into()),
                label: None,
                start: None,
                end: Some("10:00".into()),
            },
            PeriodRow {
                code: None,
                label: Some("Orphan".into()),
                start: Some("9:00".into()),
                end: None,
            },
            PeriodRow {
                code: Some("P3".into()),
                label: None,
                start: Some("11:00".into()),
                end: None,
            },
        ];
        let periods = rows_to_periods(rows);
        assert_eq!(periods.len(), 1);
        assert_eq!(periods[0].code, "P3");
        assert_eq!(periods[0].label, "P3", "label falls back to code");
        assert_eq!(periods[0].end, "");
    }

    #[test]
    fn periods_key_takes_precedence_over_rows() {
        let body = r#"{
            "periods": [{"code": "A", "start": "8:00", "end": "9:00"}],
            "rows": [{"code": "B", "start": "9:00", "end": "10:00"}]
        }"#;
        let parsed: PeriodsResponse = serde_json::from_str(body).unwrap();
        let periods = rows_to_periods(parsed.periods.or(parsed.rows).unwrap_or_default());
        assert_eq!(periods.len(), 1);
        assert_eq!(periods[0].code, "A");
    }
}
