use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::alerts::{DEFAULT_SOUND, is_known_sound};
use crate::clock::resolve_local_datetime;

pub const DEFAULT_COUNTDOWN_MS: u64 = 5 * 60_000;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    Countdown,
    CountToDate,
}

impl TimerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TimerKind::Countdown => "countdown",
            TimerKind::CountToDate => "count_to_date",
        }
    }
}

/// One timer record in its persisted shape. Field names follow the stored
/// JSON (`initialDuration`, `isRunning`, ...) so existing data loads as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timer {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TimerKind,
    pub title: String,
    #[serde(default = "default_sound")]
    pub sound: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_opt_duration_ms"
    )]
    pub initial_duration: Option<u64>,
    #[serde(default, deserialize_with = "de_clamped_ms")]
    pub remaining: u64,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_opt_epoch_ms"
    )]
    pub target_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_date: Option<String>,
    #[serde(default)]
    pub is_running: bool,
    #[serde(default)]
    pub is_ringing: bool,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_opt_epoch_ms"
    )]
    pub rang_at: Option<i64>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_opt_epoch_ms"
    )]
    pub last_triggered: Option<i64>,
}

impl Timer {
    pub fn countdown(id: String, title: String, duration_ms: u64, sound: String) -> Self {
        Self {
            id,
            kind: TimerKind::Countdown,
            title,
            sound,
            initial_duration: Some(duration_ms),
            remaining: duration_ms,
            target_time: None,
            target_date: None,
            is_running: false,
            is_ringing: false,
            is_pinned: false,
            rang_at: None,
            last_triggered: None,
        }
    }

    /// Count-to-date timers start counting as soon as they exist.
    pub fn count_to_date(
        id: String,
        title: String,
        target_date: String,
        target_ms: i64,
        now_ms: i64,
        sound: String,
    ) -> Self {
        Self {
            id,
            kind: TimerKind::CountToDate,
            title,
            sound,
            initial_duration: None,
            remaining: clamp_remaining(target_ms - now_ms),
            target_time: Some(target_ms),
            target_date: Some(target_date),
            is_running: true,
            is_ringing: false,
            is_pinned: false,
            rang_at: None,
            last_triggered: None,
        }
    }

    pub fn is_countdown(&self) -> bool {
        self.kind == TimerKind::Countdown
    }

    pub fn is_default(&self) -> bool {
        self.id.starts_with("default-timer-")
    }

    pub fn initial_duration_ms(&self) -> u64 {
        self.initial_duration.unwrap_or(DEFAULT_COUNTDOWN_MS)
    }

    /// Unclamped time left against `targetTime`; `None` when not running.
    pub fn raw_remaining_at(&self, now_ms: i64) -> Option<i64> {
        if !self.is_running {
            return None;
        }
        self.target_time.map(|target| target.saturating_sub(now_ms))
    }

    /// What a display should show at `now_ms`. Never negative.
    pub fn remaining_at(&self, now_ms: i64) -> u64 {
        match self.raw_remaining_at(now_ms) {
            Some(raw) => clamp_remaining(raw),
            None => self.remaining,
        }
    }

    /// Back to a full, stopped countdown with no ring state left over.
    pub fn clean_reset(&mut self) {
        self.remaining = self.initial_duration_ms();
        self.is_running = false;
        self.is_ringing = false;
        self.target_time = None;
        self.rang_at = None;
        self.last_triggered = None;
    }

    /// Repairs a freshly loaded record so the kind invariants hold and the
    /// sound resolves. Returns true when anything changed and the record
    /// should be written back.
    pub fn normalize(&mut self) -> bool {
        let mut changed = false;

        if !is_known_sound(&self.sound) {
            warn!(
                "timer '{}' references missing sound '{}', using {DEFAULT_SOUND}",
                self.id, self.sound
            );
            self.sound = DEFAULT_SOUND.to_string();
            changed = true;
        }

        match self.kind {
            TimerKind::Countdown => {
                if self.target_date.take().is_some() {
                    changed = true;
                }
                if self.initial_duration.is_none_or(|duration| duration == 0) {
                    let fallback = if self.remaining > 0 {
                        self.remaining
                    } else {
                        DEFAULT_COUNTDOWN_MS
                    };
                    self.initial_duration = Some(fallback);
                    changed = true;
                }
            }
            TimerKind::CountToDate => {
                if self.initial_duration.take().is_some() {
                    changed = true;
                }
                let parsed = self.target_date.as_deref().and_then(parse_target_date);
                match parsed {
                    Some(target_ms) => {
                        if self.target_time != Some(target_ms) {
                            self.target_time = Some(target_ms);
                            changed = true;
                        }
                    }
                    None => {
                        warn!(
                            "count-to-date timer '{}' has unusable target date {:?}; stopping it",
                            self.id, self.target_date
                        );
                        if self.is_running || self.target_time.is_some() {
                            self.is_running = false;
                            self.target_time = None;
                            changed = true;
                        }
                    }
                }
            }
        }

        changed
    }
}

#[derive(Debug, Clone, Default)]
pub struct TimerEdit {
    pub title: Option<String>,
    pub sound: Option<String>,
    pub duration_ms: Option<u64>,
    pub target_date: Option<String>,
}

pub fn clamp_remaining(raw_ms: i64) -> u64 {
    u64::try_from(raw_ms.max(0)).unwrap_or(0)
}

pub fn user_timer_id(now_ms: i64) -> String {
    format!("timer-{now_ms}")
}

pub fn builtin_default_timers() -> Vec<Timer> {
    [
        ("default-timer-1", "timer_pomodoro", 25 * 60_000, "classic_beep"),
        ("default-timer-2", "timer_short_break", 5 * 60_000, "gentle_chime"),
        ("default-timer-3", "timer_long_break", 15 * 60_000, "peaceful_tone"),
        ("default-timer-4", "timer_tea", 3 * 60_000, "digital_alarm"),
    ]
    .into_iter()
    .map(|(id, title, duration, sound)| {
        Timer::countdown(id.to_string(), title.to_string(), duration, sound.to_string())
    })
    .collect()
}

pub fn parse_target_date(input: &str) -> Option<i64> {
    parse_target_date_in_tz(input, &Local)
}

/// Accepts RFC 3339, local `YYYY-MM-DDTHH:MM[:SS[.f]]` (`T` or space) and a
/// bare `YYYY-MM-DD`, which means local midnight.
pub(crate) fn parse_target_date_in_tz<Tz>(input: &str, timezone: &Tz) -> Option<i64>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    let input = input.trim();
    if let Ok(absolute) = DateTime::parse_from_rfc3339(input) {
        return Some(absolute.timestamp_millis());
    }

    let naive = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
    ]
    .iter()
    .find_map(|format| NaiveDateTime::parse_from_str(input, format).ok())
    .or_else(|| {
        NaiveDate::parse_from_str(input, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
    })?;

    resolve_local_datetime(timezone, naive).map(|dt| dt.timestamp_millis())
}

fn default_sound() -> String {
    DEFAULT_SOUND.to_string()
}

fn de_clamped_ms<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<f64>::deserialize(deserializer)?;
    Ok(value
        .filter(|ms| ms.is_finite() && *ms > 0.0)
        .map(|ms| ms as u64)
        .unwrap_or(0))
}

fn de_opt_duration_ms<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<f64>::deserialize(deserializer)?;
    Ok(value
        .filter(|ms| ms.is_finite() && *ms > 0.0)
        .map(|ms| ms as u64))
}

/// Epochs before 1970 or outside chrono's range load as absent.
pub(crate) fn de_opt_epoch_ms<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<f64>::deserialize(deserializer)?;
    Ok(value
        .filter(|ms| ms.is_finite() && *ms >= 0.0 && *ms < i64::MAX as f64)
        .map(|ms| ms as i64)
        .filter(|ms| Utc.timestamp_millis_opt(*ms).single().is_some()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn persisted_shape_uses_camel_case_field_names() {
        let mut timer = Timer::countdown(
            "timer-1".to_string(),
            "Eggs".to_string(),
            5_000,
            "classic_beep".to_string(),
        );
        timer.is_running = true;
        timer.target_time = Some(1_700_000_005_000);
        let value = serde_json::to_value(&timer).expect("serialize");
        assert_eq!(value["type"], "countdown");
        assert_eq!(value["initialDuration"], 5_000);
        assert_eq!(value["targetTime"], 1_700_000_005_000_i64);
        assert_eq!(value["isRunning"], true);
        assert!(value.get("targetDate").is_none());
        assert!(value.get("rangAt").is_none());
    }

    #[test]
    fn negative_and_fractional_remaining_is_clamped_on_load() {
        let timer: Timer = serde_json::from_value(json!({
            "id": "timer-9",
            "type": "countdown",
            "title": "x",
            "sound": "classic_beep",
            "initialDuration": 1000,
            "remaining": -250.5,
            "isRunning": false
        }))
        .expect("deserialize");
        assert_eq!(timer.remaining, 0);

        let timer: Timer = serde_json::from_value(json!({
            "id": "timer-10",
            "type": "countdown",
            "title": "x",
            "remaining": 1500.7
        }))
        .expect("deserialize");
        assert_eq!(timer.remaining, 1_500);
        assert_eq!(timer.sound, DEFAULT_SOUND);
    }

    #[test]
    fn out_of_range_epochs_load_as_absent() {
        let timer: Timer = serde_json::from_value(json!({
            "id": "timer-11",
            "type": "countdown",
            "title": "x",
            "initialDuration": 5000,
            "remaining": 5000,
            "isRunning": true,
            "targetTime": -1e300,
            "rangAt": 1e300,
            "lastTriggered": -5
        }))
        .expect("deserialize");
        assert_eq!(timer.target_time, None);
        assert_eq!(timer.rang_at, None);
        assert_eq!(timer.last_triggered, None);

        let timer: Timer = serde_json::from_value(json!({
            "id": "timer-12",
            "type": "countdown",
            "title": "x",
            "targetTime": 1_700_000_005_000_i64
        }))
        .expect("deserialize");
        assert_eq!(timer.target_time, Some(1_700_000_005_000));
    }

    #[test]
    fn remaining_at_never_goes_negative() {
        let mut timer = Timer::countdown(
            "timer-1".to_string(),
            "t".to_string(),
            5_000,
            DEFAULT_SOUND.to_string(),
        );
        timer.is_running = true;
        timer.target_time = Some(10_000);
        for now in [0, 9_999, 10_000, 10_001, 1_000_000] {
            let shown = timer.remaining_at(now);
            assert!(shown <= 10_000);
        }
        assert_eq!(timer.remaining_at(12_000), 0);
        assert_eq!(timer.raw_remaining_at(12_000), Some(-2_000));
    }

    #[test]
    fn normalize_substitutes_missing_sound() {
        let mut timer = Timer::countdown(
            "timer-1".to_string(),
            "t".to_string(),
            5_000,
            "my-upload.mp3".to_string(),
        );
        assert!(timer.normalize());
        assert_eq!(timer.sound, DEFAULT_SOUND);
        assert!(!timer.normalize());
    }

    #[test]
    fn normalize_enforces_kind_exclusive_fields() {
        let mut countdown = Timer::countdown(
            "timer-1".to_string(),
            "t".to_string(),
            5_000,
            DEFAULT_SOUND.to_string(),
        );
        countdown.target_date = Some("2030-01-01".to_string());
        countdown.initial_duration = None;
        countdown.remaining = 0;
        assert!(countdown.normalize());
        assert!(countdown.target_date.is_none());
        assert_eq!(countdown.initial_duration, Some(DEFAULT_COUNTDOWN_MS));

        let mut dated = Timer::count_to_date(
            "timer-2".to_string(),
            "launch".to_string(),
            "2030-01-01T00:00:00Z".to_string(),
            0,
            0,
            DEFAULT_SOUND.to_string(),
        );
        dated.initial_duration = Some(1_000);
        assert!(dated.normalize());
        assert!(dated.initial_duration.is_none());
        assert_eq!(
            dated.target_time,
            Some(
                Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0)
                    .single()
                    .expect("valid")
                    .timestamp_millis()
            )
        );
    }

    #[test]
    fn unparsable_target_date_stops_count_to_date_timer() {
        let mut dated = Timer::count_to_date(
            "timer-2".to_string(),
            "launch".to_string(),
            "someday".to_string(),
            5_000,
            0,
            DEFAULT_SOUND.to_string(),
        );
        assert!(dated.normalize());
        assert!(!dated.is_running);
        assert!(dated.target_time.is_none());
    }

    #[test]
    fn target_date_formats_resolve_in_timezone() {
        let midnight = Utc
            .with_ymd_and_hms(2030, 6, 1, 0, 0, 0)
            .single()
            .expect("valid")
            .timestamp_millis();
        assert_eq!(parse_target_date_in_tz("2030-06-01", &Utc), Some(midnight));
        assert_eq!(
            parse_target_date_in_tz("2030-06-01T00:00", &Utc),
            Some(midnight)
        );
        assert_eq!(
            parse_target_date_in_tz("2030-06-01 00:00:00", &Utc),
            Some(midnight)
        );
        assert_eq!(
            parse_target_date_in_tz("2030-06-01T02:00:00+02:00", &Utc),
            Some(midnight)
        );
        assert_eq!(parse_target_date_in_tz("June first", &Utc), None);
    }

    #[test]
    fn builtin_defaults_are_countdowns_with_prefixed_ids() {
        let defaults = builtin_default_timers();
        assert_eq!(defaults.len(), 4);
        assert!(defaults.iter().all(Timer::is_default));
        assert!(defaults.iter().all(Timer::is_countdown));
        assert!(defaults.iter().all(|timer| is_known_sound(&timer.sound)));
    }
}
