//! Named time-of-day periods and their announcement scheduling.

pub mod dictionary;
pub mod scheduler;

pub use dictionary::{HttpPeriodSource, PeriodSource, StaticPeriodSource};
pub use scheduler::PeriodScheduler;

use serde::{Deserialize, Serialize};

/// A named recurring time-of-day interval, date-independent.
///
/// `start` and `end` are time-of-day strings in the reference timezone.
/// An interval whose end precedes its start in minutes-of-day crosses
/// midnight. A period with an unparsable start or end is skipped for both
/// scheduling and active-detection; it never fails a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    /// Stable period code (e.g. `P1`).
    pub code: String,
    /// Display label; falls back to the code upstream when absent.
    pub label: String,
    /// Start time-of-day string.
    pub start: String,
    /// End time-of-day string.
    pub end: String,
}

impl Period {
    pub fn new(
        code: impl Into<String>,
        label: impl Into<String>,
        start: impl Into<String>,
        end: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            label: label.into(),
            start: start.into(),
            end: end.into(),
        }
    }
}
