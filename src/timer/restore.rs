use tracing::{debug, info};

use crate::timer::model::{Timer, TimerKind, clamp_remaining};
use crate::timer::store::TimerStore;

/// A close this recent means the ring most likely happened just before it.
const RECENT_CLOSE_MS: i64 = 60_000;
const RECENT_CLOSE_LEAD_MS: i64 = 2_000;
const RINGING_ESTIMATE_CAP_MS: i64 = 5 * 60_000;
const AT_REST_ESTIMATE_CAP_MS: i64 = 30 * 60_000;
const AT_REST_UNKNOWN_VISIT_MS: i64 = 60_000;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RangAtSource {
    TargetTime,
    LastTriggered,
    Estimated,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RestoreCase {
    /// Was ringing at close and nobody acknowledged it.
    RingingAtClose { rang_at: i64, source: RangAtSource },
    /// The deadline passed while the app was closed.
    ExpiredWhileClosed { rang_at: i64 },
    /// Still counting; ticking resumes after restoration.
    Resumed { remaining_ms: u64 },
    /// Stopped at zero with no record of when it rang.
    AtRestAtZero { rang_at: i64 },
    /// A count-to-date target passed, or it was ringing at close.
    DateReached { rang_at: i64 },
}

impl RestoreCase {
    pub fn label(self) -> &'static str {
        match self {
            RestoreCase::RingingAtClose { .. } => "ringing-at-close",
            RestoreCase::ExpiredWhileClosed { .. } => "expired-while-closed",
            RestoreCase::Resumed { .. } => "resumed",
            RestoreCase::AtRestAtZero { .. } => "at-rest-at-zero",
            RestoreCase::DateReached { .. } => "date-reached",
        }
    }

    /// When the timer rang, for every case that records one.
    pub fn rang_at(self) -> Option<i64> {
        match self {
            RestoreCase::RingingAtClose { rang_at, .. }
            | RestoreCase::ExpiredWhileClosed { rang_at }
            | RestoreCase::AtRestAtZero { rang_at }
            | RestoreCase::DateReached { rang_at } => Some(rang_at),
            RestoreCase::Resumed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RestoredTimer {
    pub id: String,
    pub case: RestoreCase,
}

#[derive(Debug, Clone, Default)]
pub struct RestoreReport {
    pub restored: Vec<RestoredTimer>,
    pub ticking: usize,
}

impl RestoreReport {
    pub fn case_for(&self, id: &str) -> Option<RestoreCase> {
        self.restored
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.case)
    }
}

impl TimerStore {
    /// Reconciles persisted timers with the time that passed while the app
    /// was closed. Every record is resolved and persisted before any tick is
    /// scheduled. Running it twice at the same instant changes nothing.
    pub fn restore(&mut self, last_visit_ms: Option<i64>) -> RestoreReport {
        let now = self.now();
        let mut report = RestoreReport::default();

        for timer in self.timers_mut() {
            if let Some(case) = resolve_timer(timer, now, last_visit_ms) {
                info!(timer = %timer.id, case = case.label(), "restored timer");
                report.restored.push(RestoredTimer {
                    id: timer.id.clone(),
                    case,
                });
            }
        }

        self.ensure_single_pin();
        self.persist_or_warn();
        report.ticking = self.schedule_running();
        debug!(
            "timer restoration resolved {} records, {} ticking",
            report.restored.len(),
            report.ticking
        );
        report
    }
}

/// Resolves one record in place. Returns `None` when the record needed no
/// restoration.
pub fn resolve_timer(
    timer: &mut Timer,
    now_ms: i64,
    last_visit_ms: Option<i64>,
) -> Option<RestoreCase> {
    match timer.kind {
        TimerKind::Countdown => resolve_countdown(timer, now_ms, last_visit_ms),
        TimerKind::CountToDate => resolve_count_to_date(timer, now_ms),
    }
}

fn resolve_countdown(
    timer: &mut Timer,
    now_ms: i64,
    last_visit_ms: Option<i64>,
) -> Option<RestoreCase> {
    if timer.is_ringing {
        let (rang_at, source) = match (timer.target_time, timer.last_triggered) {
            (Some(target), _) => (target, RangAtSource::TargetTime),
            (None, Some(triggered)) => (triggered, RangAtSource::LastTriggered),
            (None, None) => (
                estimate_ring_time(
                    now_ms,
                    last_visit_ms,
                    RINGING_ESTIMATE_CAP_MS,
                    RINGING_ESTIMATE_CAP_MS,
                ),
                RangAtSource::Estimated,
            ),
        };
        timer.clean_reset();
        timer.rang_at = Some(rang_at);
        return Some(RestoreCase::RingingAtClose { rang_at, source });
    }

    if timer.is_running {
        let target = match timer.target_time {
            Some(target) => target,
            None => {
                let target = now_ms
                    .saturating_add(i64::try_from(timer.remaining).unwrap_or(i64::MAX));
                timer.target_time = Some(target);
                target
            }
        };
        if target <= now_ms {
            timer.clean_reset();
            timer.rang_at = Some(target);
            return Some(RestoreCase::ExpiredWhileClosed { rang_at: target });
        }
        timer.remaining = clamp_remaining(target - now_ms);
        timer.last_triggered = None;
        return Some(RestoreCase::Resumed {
            remaining_ms: timer.remaining,
        });
    }

    if timer.remaining == 0 && timer.rang_at.is_none() {
        let rang_at = estimate_ring_time(
            now_ms,
            last_visit_ms,
            AT_REST_ESTIMATE_CAP_MS,
            AT_REST_UNKNOWN_VISIT_MS,
        );
        timer.clean_reset();
        timer.rang_at = Some(rang_at);
        return Some(RestoreCase::AtRestAtZero { rang_at });
    }

    timer.last_triggered = None;
    None
}

fn resolve_count_to_date(timer: &mut Timer, now_ms: i64) -> Option<RestoreCase> {
    if timer.is_ringing {
        let rang_at = timer
            .target_time
            .or(timer.last_triggered)
            .unwrap_or(now_ms)
            .min(now_ms);
        finish_count_to_date(timer, rang_at);
        return Some(RestoreCase::DateReached { rang_at });
    }

    if !timer.is_running {
        timer.last_triggered = None;
        return None;
    }

    match timer.target_time {
        Some(target) if target <= now_ms => {
            finish_count_to_date(timer, target);
            Some(RestoreCase::DateReached { rang_at: target })
        }
        Some(target) => {
            timer.remaining = clamp_remaining(target - now_ms);
            Some(RestoreCase::Resumed {
                remaining_ms: timer.remaining,
            })
        }
        None => {
            timer.is_running = false;
            None
        }
    }
}

fn finish_count_to_date(timer: &mut Timer, rang_at: i64) {
    timer.remaining = 0;
    timer.is_running = false;
    timer.is_ringing = false;
    timer.last_triggered = None;
    timer.rang_at = Some(rang_at);
}

/// Best guess at when an unacknowledged ring happened. Never later than now.
fn estimate_ring_time(
    now_ms: i64,
    last_visit_ms: Option<i64>,
    cap_ms: i64,
    unknown_visit_ms: i64,
) -> i64 {
    let estimate = match last_visit_ms {
        Some(last) if now_ms - last < RECENT_CLOSE_MS => last - RECENT_CLOSE_LEAD_MS,
        Some(last) => last.max(now_ms - cap_ms),
        None => now_ms - unknown_visit_ms,
    };
    estimate.min(now_ms)
}
