//! Period announcement scheduling and transition detection.
//!
//! One scheduling pass per day: every period gets timers at five minutes
//! before start, one minute before start, and start itself; offsets
//! already in the past are skipped, not fired late. A rearm timer just
//! past local midnight rebuilds the pass for the following day. All
//! timers of a pass are cancelled atomically before a rebuild so an old
//! pass can never double-fire.

use crate::clock::{ZonedClock, parse_time_of_day};
use crate::config::PeriodConfig;
use crate::notify::NoticeDispatcher;
use crate::periods::Period;
use chrono::Timelike;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Offset class of one armed firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    FiveMinuteWarning,
    OneMinuteWarning,
    Start,
}

impl Stage {
    const ALL: [Stage; 3] = [
        Stage::FiveMinuteWarning,
        Stage::OneMinuteWarning,
        Stage::Start,
    ];

    fn offset(self) -> chrono::Duration {
        match self {
            Stage::FiveMinuteWarning => chrono::Duration::minutes(5),
            Stage::OneMinuteWarning => chrono::Duration::minutes(1),
            Stage::Start => chrono::Duration::zero(),
        }
    }

    fn message(self, period: &Period) -> String {
        match self {
            Stage::FiveMinuteWarning => {
                format!("{} - {} starts in 5 minutes", period.code, period.label)
            }
            Stage::OneMinuteWarning => {
                format!("{} - {} starts in 1 minute", period.code, period.label)
            }
            Stage::Start => format!("Now entering {} - {}", period.code, period.label),
        }
    }
}

struct SchedulerInner {
    /// Armed firings of the current pass.
    period_timers: Vec<JoinHandle<()>>,
    /// Midnight rebuild timer for the current pass.
    rearm_timer: Option<JoinHandle<()>>,
    /// Current period list, fully replaced on every `schedule`.
    periods: Vec<Period>,
    /// Code of the period last announced as active.
    last_active: Option<String>,
    /// Minute-of-day guard so overlapping check cadences stay cheap.
    last_checked_minute: Option<u32>,
}

/// Arms and runs the day's period announcements for one context.
pub struct PeriodScheduler {
    clock: ZonedClock,
    dispatcher: Arc<NoticeDispatcher>,
    rearm_margin_secs: u64,
    transition_check_secs: u64,
    inner: Mutex<SchedulerInner>,
}

impl PeriodScheduler {
    pub fn new(
        clock: ZonedClock,
        dispatcher: Arc<NoticeDispatcher>,
        config: &PeriodConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            clock,
            dispatcher,
            rearm_margin_secs: config.rearm_margin_secs,
            transition_check_secs: config.transition_check_secs.max(1),
            inner: Mutex::new(SchedulerInner {
                period_timers: Vec::new(),
                rearm_timer: None,
                periods: Vec::new(),
                last_active: None,
                last_checked_minute: None,
            }),
        })
    }

    /// Rebuild the scheduling pass for `periods`.
    ///
    /// Cancels every previously armed handle first, then arms the warning
    /// and start timers for each period's next occurrence plus one rearm
    /// timer at the next local midnight. Periods with an unparsable start
    /// or end are skipped; the pass proceeds without them.
    pub fn schedule(self: &Arc<Self>, periods: Vec<Period>) {
        let mut inner = self.lock_inner();
        cancel_pass(&mut inner);
        inner.periods = periods.clone();

        for period in &periods {
            let Some(start_minutes) = parse_time_of_day(&period.start) else {
                debug!("period {} has unparsable start, skipping", period.code);
                continue;
            };
            if parse_time_of_day(&period.end).is_none() {
                debug!("period {} has unparsable end, skipping", period.code);
                continue;
            }
            let Some(start_at) = self.clock.next_occurrence(start_minutes) else {
                continue;
            };

            for stage in Stage::ALL {
                let fire_at = start_at - stage.offset();
                // An offset already behind us is skipped, never fired late.
                let Some(delay) = self.clock.until(fire_at) else {
                    continue;
                };
                let dispatcher = Arc::clone(&self.dispatcher);
                let text = stage.message(period);
                let code = period.code.clone();
                let scheduler = Arc::downgrade(self);
                inner.period_timers.push(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    dispatcher.broadcast(&text, None);
                    if stage == Stage::Start
                        && let Some(scheduler) = scheduler.upgrade()
                    {
                        scheduler.lock_inner().last_active = Some(code);
                    }
                }));
            }
        }

        if let Some(midnight) = self.clock.next_midnight(self.rearm_margin_secs)
            && let Some(delay) = self.clock.until(midnight)
        {
            let scheduler = Arc::downgrade(self);
            inner.rearm_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(scheduler) = scheduler.upgrade() {
                    debug!("rearming period timers for the new day");
                    scheduler.schedule(periods);
                }
            }));
        }

        info!(
            timers = inner.period_timers.len(),
            periods = inner.periods.len(),
            "period pass armed"
        );
    }

    /// Cancel every armed handle without rebuilding.
    pub fn clear_timers(&self) {
        cancel_pass(&mut self.lock_inner());
    }

    /// Announce a transition when the active period's code changed since
    /// the last check. Entering "no active period" clears the recorded
    /// state without an announcement. Guarded per minute-of-day, so the
    /// overlapping check cadences cost one detection per minute.
    pub fn check_transition(&self) {
        let minute = self.clock.minute_of_day();
        let announcement = {
            let mut inner = self.lock_inner();
            if inner.last_checked_minute == Some(minute) {
                return;
            }
            inner.last_checked_minute = Some(minute);

            match detect_active(&inner.periods, minute) {
                Some(period) if inner.last_active.as_deref() != Some(period.code.as_str()) => {
                    let code = period.code.clone();
                    let label = period.label.clone();
                    inner.last_active = Some(code.clone());
                    Some(format!("Now in {} - {}", code, label))
                }
                Some(_) => None,
                None => {
                    inner.last_active = None;
                    None
                }
            }
        };
        if let Some(text) = announcement {
            self.dispatcher.broadcast(&text, None);
        }
    }

    /// Record the currently active period without announcing it. Called
    /// after a dictionary refresh so a period that is already underway is
    /// not re-announced to everyone.
    pub fn mark_active_silently(&self) {
        let minute = self.clock.minute_of_day();
        let mut inner = self.lock_inner();
        inner.last_active = detect_active(&inner.periods, minute).map(|p| p.code.clone());
    }

    /// Code of the period last recorded as active.
    pub fn last_active(&self) -> Option<String> {
        self.lock_inner().last_active.clone()
    }

    /// The current period list.
    pub fn periods(&self) -> Vec<Period> {
        self.lock_inner().periods.clone()
    }

    /// Number of armed period firings in the current pass (excludes the
    /// midnight rearm timer).
    pub fn armed_period_timers(&self) -> usize {
        self.lock_inner().period_timers.len()
    }

    /// Whether the midnight rearm timer is armed.
    pub fn rearm_armed(&self) -> bool {
        self.lock_inner().rearm_timer.is_some()
    }

    /// Run the transition check loop: a one-second heartbeat that checks
    /// on the configured cadence and resyncs at the top of every minute
    /// to correct drift.
    pub fn run(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let scheduler = Arc::downgrade(self);
        let check_secs = self.transition_check_secs;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut ticks: u64 = 0;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Some(scheduler) = scheduler.upgrade() else {
                    break;
                };
                let at_minute_top = scheduler.clock.now().second() == 0;
                if at_minute_top || ticks % check_secs == 0 {
                    scheduler.check_transition();
                }
                ticks += 1;
            }
        })
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, SchedulerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PeriodScheduler {
    fn drop(&mut self) {
        cancel_pass(&mut self.lock_inner());
    }
}

fn cancel_pass(inner: &mut SchedulerInner) {
    for handle in inner.period_timers.drain(..) {
        handle.abort();
    }
    if let Some(handle) = inner.rearm_timer.take() {
        handle.abort();
    }
}

/// The period whose interval contains `minute_of_day`, if any.
/// First-in-list wins on overlap. Intervals are inclusive at both ends;
/// `end < start` means the interval crosses midnight.
pub fn detect_active(periods: &[Period], minute_of_day: u32) -> Option<&Period> {
    for period in periods {
        let (Some(start), Some(end)) = (
            parse_time_of_day(&period.start),
            parse_time_of_day(&period.end),
        ) else {
            continue;
        };
        let active = if end < start {
            minute_of_day >= start || minute_of_day <= end
        } else {
            minute_of_day >= start && minute_of_day <= end
        };
        if active {
            return Some(period);
        }
    }
    None
}
