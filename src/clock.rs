use std::cell::Cell;
use std::rc::Rc;

use chrono::{DateTime, LocalResult, NaiveDateTime, TimeZone, Utc};

/// Wall-clock source for the timing core. Everything that needs "now" goes
/// through this trait so restoration and ticking can be replayed in tests.
pub trait Clock {
    fn now_ms(&self) -> i64;
    fn label(&self) -> &'static str;
}

/// Epoch-millisecond wall clock. Output never runs backwards within one
/// process, so a clock step back cannot make a running timer gain time.
pub struct SystemClock {
    last_output_ms: Cell<i64>,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            last_output_ms: Cell::new(i64::MIN),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        let proposed = Utc::now().timestamp_millis();
        let last = self.last_output_ms.get();
        if proposed < last {
            return last;
        }
        self.last_output_ms.set(proposed);
        proposed
    }

    fn label(&self) -> &'static str {
        "SYSTEM_WALL"
    }
}

/// Settable clock. Used by tests and by `--now-ms` to pin an invocation to a
/// fixed instant.
#[derive(Debug)]
pub struct ManualClock {
    now_ms: Cell<i64>,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: Cell::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.set(now_ms);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now_ms.set(self.now_ms.get().saturating_add(delta_ms));
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.get()
    }

    fn label(&self) -> &'static str {
        "MANUAL"
    }
}

pub fn select_clock(fixed_now_ms: Option<i64>) -> Rc<dyn Clock> {
    match fixed_now_ms {
        Some(now_ms) => Rc::new(ManualClock::new(now_ms)),
        None => Rc::new(SystemClock::new()),
    }
}

/// Wall time to instant. A repeated hour (fall back) picks the first
/// instance; a skipped hour (spring forward) has no instant.
pub(crate) fn resolve_local_datetime<Tz>(
    timezone: &Tz,
    naive: NaiveDateTime,
) -> Option<DateTime<Tz>>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    match timezone.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt),
        LocalResult::Ambiguous(first, _second) => Some(first),
        LocalResult::None => None,
    }
}

/// Milliseconds until the next wall-clock second boundary, in `1..=1000`.
pub fn delay_to_next_second(now_ms: i64) -> i64 {
    1_000 - now_ms.rem_euclid(1_000)
}
