//! Reference-timezone clock adapter.
//!
//! All period math runs in one fixed reference timezone regardless of the
//! host's local timezone. Times of day are integer minutes since midnight;
//! absolute instants are only materialized when arming timers.

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::sync::{Arc, Mutex};

/// Injectable "now" source so timer math is testable.
pub trait Clock: Send + Sync {
    /// Current instant in UTC.
    fn now_utc(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation used outside tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Deterministic clock for tests and replay: returns a settable instant.
#[derive(Clone)]
pub struct FixedClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl FixedClock {
    /// Create a clock pinned at the given instant.
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    /// Move the clock to a new instant.
    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    /// Advance the clock by a duration.
    pub fn advance(&self, by: Duration) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += by;
        }
    }
}

impl Clock for FixedClock {
    fn now_utc(&self) -> DateTime<Utc> {
        self.now.lock().map(|g| *g).unwrap_or_else(|_| Utc::now())
    }
}

/// A [`Clock`] paired with the reference timezone.
///
/// Cheap to clone; shared by the store, scheduler, and dispatcher so every
/// component sees the same notion of "now".
#[derive(Clone)]
pub struct ZonedClock {
    clock: Arc<dyn Clock>,
    tz: Tz,
}

impl ZonedClock {
    /// Wrap a clock with the given reference timezone.
    pub fn new(clock: Arc<dyn Clock>, tz: Tz) -> Self {
        Self { clock, tz }
    }

    /// System wall clock in the given reference timezone.
    pub fn system(tz: Tz) -> Self {
        Self::new(Arc::new(SystemClock), tz)
    }

    /// The reference timezone.
    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Current instant in the reference timezone.
    pub fn now(&self) -> DateTime<Tz> {
        self.clock.now_utc().with_timezone(&self.tz)
    }

    /// Milliseconds since the Unix epoch.
    pub fn epoch_millis(&self) -> u64 {
        self.clock.now_utc().timestamp_millis().max(0) as u64
    }

    /// Seconds since the Unix epoch.
    pub fn epoch_secs(&self) -> u64 {
        self.clock.now_utc().timestamp().max(0) as u64
    }

    /// Minutes since midnight in the reference timezone.
    pub fn minute_of_day(&self) -> u32 {
        let now = self.now();
        now.hour() * 60 + now.minute()
    }

    /// Next future instant whose local time-of-day equals `minutes_of_day`:
    /// today if that time has not yet passed, otherwise tomorrow.
    ///
    /// Returns `None` only when the time-of-day does not exist in the
    /// reference timezone for the next two days (DST gap).
    pub fn next_occurrence(&self, minutes_of_day: u32) -> Option<DateTime<Tz>> {
        let now = self.now();
        for day_offset in 0..=2 {
            let date = now.date_naive() + Duration::days(day_offset);
            let naive = date.and_hms_opt(minutes_of_day / 60, minutes_of_day % 60, 0)?;
            let Some(candidate) = resolve_local(&self.tz, naive) else {
                continue;
            };
            if candidate > now {
                return Some(candidate);
            }
        }
        None
    }

    /// The next local midnight plus `margin_secs`, used to rearm the
    /// scheduler for the following day's occurrences.
    pub fn next_midnight(&self, margin_secs: u64) -> Option<DateTime<Tz>> {
        let now = self.now();
        for day_offset in 1..=2 {
            let date = now.date_naive() + Duration::days(day_offset);
            let naive = date.and_hms_opt(0, 0, 0)?;
            if let Some(midnight) = resolve_local(&self.tz, naive) {
                return Some(midnight + Duration::seconds(margin_secs as i64));
            }
        }
        None
    }

    /// Time remaining until `instant`, or `None` if it already passed.
    pub fn until(&self, instant: DateTime<Tz>) -> Option<std::time::Duration> {
        (instant - self.now()).to_std().ok()
    }
}

/// Resolve a naive local datetime in `tz`, taking the earlier instant when
/// DST makes the local time ambiguous.
fn resolve_local(tz: &Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    tz.from_local_datetime(&naive).earliest()
}

/// Parse a time-of-day string into minutes since midnight.
///
/// Accepts `H:MM`, `HH:MM`, an optional `:SS` component (validated then
/// ignored), and an optional trailing am/pm marker in any case. Returns
/// `None` for anything else; callers skip the offending entry.
pub fn parse_time_of_day(raw: &str) -> Option<u32> {
    let lower = raw.trim().to_ascii_lowercase();
    if lower.is_empty() {
        return None;
    }

    let (body, meridiem) = if let Some(stripped) = lower.strip_suffix("am") {
        (stripped.trim_end(), Some(Meridiem::Am))
    } else if let Some(stripped) = lower.strip_suffix("pm") {
        (stripped.trim_end(), Some(Meridiem::Pm))
    } else {
        (lower.as_str(), None)
    };

    let mut parts = body.split(':');
    let mut hours: u32 = parts.next()?.trim().parse().ok()?;
    let minutes: u32 = parts.next()?.trim().parse().ok()?;
    if let Some(seconds) = parts.next() {
        let seconds: u32 = seconds.trim().parse().ok()?;
        if seconds > 59 {
            return None;
        }
    }
    if parts.next().is_some() {
        return None;
    }

    match meridiem {
        Some(Meridiem::Pm) if hours < 12 => hours += 12,
        Some(Meridiem::Am) if hours == 12 => hours = 0,
        _ => {}
    }

    if hours > 23 || minutes > 59 {
        return None;
    }
    Some(hours * 60 + minutes)
}

#[derive(Clone, Copy)]
enum Meridiem {
    Am,
    Pm,
}
