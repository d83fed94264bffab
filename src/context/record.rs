//! The replicated context record and its field-aliasing rules.
//!
//! One record, two parallel naming schemes that always carry the same
//! logical values: `game_id`/`tryout_id`, `drive_id`/`station_id`,
//! `play_id`/`rep_id`. `period_code` and `group_code` exist only in the
//! tryout scheme. A record is also the patch type: absent fields mean
//! "leave unchanged" when applied.

use serde::{Deserialize, Serialize};

/// Where a merge originated. Server-provenance merges carry the authority's
/// timestamp and never trigger a push back upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Written by this context (UI edit, clear, host command).
    Local,
    /// Applied from the remote authority's record.
    Server,
}

/// The shared "current focus" record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextRecord {
    /// Top-level session identifier, scheme A.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game_id: Option<String>,
    /// Sub-session identifier, scheme A.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drive_id: Option<String>,
    /// Unit-of-work identifier, scheme A.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub play_id: Option<String>,
    /// Top-level session identifier, scheme B.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tryout_id: Option<String>,
    /// Sub-session identifier, scheme B.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub station_id: Option<String>,
    /// Unit-of-work identifier, scheme B.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rep_id: Option<String>,
    /// Active period code. Scheme B only, no alias.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period_code: Option<String>,
    /// Active group code. Scheme B only, no alias.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_code: Option<String>,
    /// Local logical clock, milliseconds since epoch, monotonic per writer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<u64>,
}

/// The three aliased field pairs as accessor fns (scheme A, scheme B).
type PairAccess = (
    fn(&mut ContextRecord) -> &mut Option<String>,
    fn(&mut ContextRecord) -> &mut Option<String>,
);

const ALIASED_PAIRS: [PairAccess; 3] = [
    (|r| &mut r.game_id, |r| &mut r.tryout_id),
    (|r| &mut r.drive_id, |r| &mut r.station_id),
    (|r| &mut r.play_id, |r| &mut r.rep_id),
];

impl ContextRecord {
    /// A patch that resets every known field to the empty string.
    pub fn cleared() -> Self {
        let empty = Some(String::new());
        Self {
            game_id: empty.clone(),
            drive_id: empty.clone(),
            play_id: empty.clone(),
            tryout_id: empty.clone(),
            station_id: empty.clone(),
            rep_id: empty.clone(),
            period_code: empty.clone(),
            group_code: empty,
            updated_at: None,
        }
    }

    /// True when no field is present at all.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Overlay `patch`'s present fields onto this record.
    pub fn apply(&mut self, patch: &ContextRecord) {
        fn overlay(dst: &mut Option<String>, src: &Option<String>) {
            if let Some(value) = src {
                *dst = Some(value.clone());
            }
        }
        overlay(&mut self.game_id, &patch.game_id);
        overlay(&mut self.drive_id, &patch.drive_id);
        overlay(&mut self.play_id, &patch.play_id);
        overlay(&mut self.tryout_id, &patch.tryout_id);
        overlay(&mut self.station_id, &patch.station_id);
        overlay(&mut self.rep_id, &patch.rep_id);
        overlay(&mut self.period_code, &patch.period_code);
        overlay(&mut self.group_code, &patch.group_code);
        if patch.updated_at.is_some() {
            self.updated_at = patch.updated_at;
        }
    }

    /// Propagate present aliases within a patch so each written pair ends
    /// equal. When a patch carries both sides of a pair with different
    /// values the scheme-B side wins.
    pub fn mirror_aliases(&mut self) {
        for (scheme_a, scheme_b) in ALIASED_PAIRS {
            let a_value = scheme_a(self).clone();
            let b_value = scheme_b(self).clone();
            if let Some(value) = b_value {
                *scheme_a(self) = Some(value);
            } else if let Some(value) = a_value {
                *scheme_b(self) = Some(value);
            }
        }
    }

    /// Fill any absent side of a pair from its present partner. Used on
    /// full records (e.g. a legacy slot that only carried one scheme);
    /// never overwrites a present value.
    pub fn fill_missing_aliases(&mut self) {
        for (scheme_a, scheme_b) in ALIASED_PAIRS {
            let a_value = scheme_a(self).clone();
            let b_value = scheme_b(self).clone();
            match (a_value, b_value) {
                (None, Some(value)) => *scheme_a(self) = Some(value),
                (Some(value), None) => *scheme_b(self) = Some(value),
                _ => {}
            }
        }
    }

    /// True when every aliased pair carries equal values (absent counts as
    /// equal only to absent).
    pub fn aliases_consistent(&self) -> bool {
        self.game_id == self.tryout_id
            && self.drive_id == self.station_id
            && self.play_id == self.rep_id
    }
}
