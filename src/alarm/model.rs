use chrono::{NaiveTime, TimeZone, Timelike};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::alerts::{DEFAULT_SOUND, is_known_sound};
use crate::clock::resolve_local_datetime;
use crate::error::{CoreError, CoreResult};
use crate::timer::model::de_opt_epoch_ms;

/// Bounds the backwards walk over calendar days; a skipped local time can
/// push the latest real occurrence back by one extra day.
const MAX_LOOKBACK_DAYS: usize = 3;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmKind {
    User,
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alarm {
    pub id: String,
    pub title: String,
    pub hour: u32,
    pub minute: u32,
    #[serde(default = "default_sound")]
    pub sound: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: AlarmKind,
    #[serde(default)]
    pub is_ringing: bool,
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
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_opt_epoch_ms"
    )]
    pub created: Option<i64>,
}

impl Alarm {
    pub fn user(
        id: String,
        title: String,
        hour: u32,
        minute: u32,
        sound: String,
        created_ms: i64,
    ) -> Self {
        Self {
            id,
            title,
            hour,
            minute,
            sound,
            enabled: true,
            kind: AlarmKind::User,
            is_ringing: false,
            rang_at: None,
            last_triggered: None,
            created: Some(created_ms),
        }
    }

    pub fn is_default(&self) -> bool {
        self.kind == AlarmKind::Default
    }

    pub fn time(&self) -> Option<NaiveTime> {
        NaiveTime::from_hms_opt(self.hour, self.minute, 0)
    }

    pub fn time_label(&self) -> String {
        format!("{:02}:{:02}", self.hour, self.minute)
    }

    /// When the alarm came into existence. Older user records carry it only
    /// in their `alarm-<ms>` id; built-in alarms have no creation bound.
    pub fn created_at(&self) -> Option<i64> {
        if self.is_default() {
            return None;
        }
        self.created.or_else(|| {
            self.id
                .strip_prefix("alarm-")
                .and_then(|stamp| stamp.parse::<i64>().ok())
        })
    }

    /// Repairs a loaded record. Returns true when it should be written back.
    pub fn normalize(&mut self) -> bool {
        let mut changed = false;
        if !is_known_sound(&self.sound) {
            warn!(
                "alarm '{}' references missing sound '{}', using {DEFAULT_SOUND}",
                self.id, self.sound
            );
            self.sound = DEFAULT_SOUND.to_string();
            changed = true;
        }
        let expected = if self.id.starts_with("default-alarm-") {
            AlarmKind::Default
        } else {
            AlarmKind::User
        };
        if self.kind != expected {
            self.kind = expected;
            changed = true;
        }
        if self.is_ringing && self.rang_at.take().is_some() {
            changed = true;
        }
        changed
    }
}

#[derive(Debug, Clone, Default)]
pub struct AlarmEdit {
    pub title: Option<String>,
    pub time: Option<(u32, u32)>,
    pub sound: Option<String>,
}

pub fn user_alarm_id(now_ms: i64) -> String {
    format!("alarm-{now_ms}")
}

pub fn validate_time(hour: u32, minute: u32) -> CoreResult<()> {
    if hour > 23 || minute > 59 {
        return Err(CoreError::InvalidAlarmTime { hour, minute });
    }
    Ok(())
}

/// Parses `HH:MM` (24-hour). Seconds are accepted and must be zero.
pub fn parse_alarm_time(input: &str) -> Option<(u32, u32)> {
    let input = input.trim();
    let time = NaiveTime::parse_from_str(input, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(input, "%H:%M:%S"))
        .ok()?;
    (time.second() == 0).then_some((time.hour(), time.minute()))
}

pub fn builtin_default_alarms() -> Vec<Alarm> {
    [
        ("default-alarm-1", "alarm_wake_up", 7, 0, "classic_beep"),
        ("default-alarm-2", "alarm_lunch", 12, 30, "gentle_chime"),
        ("default-alarm-3", "alarm_wind_down", 22, 0, "peaceful_tone"),
    ]
    .into_iter()
    .map(|(id, title, hour, minute, sound)| Alarm {
        id: id.to_string(),
        title: title.to_string(),
        hour,
        minute,
        sound: sound.to_string(),
        enabled: false,
        kind: AlarmKind::Default,
        is_ringing: false,
        rang_at: None,
        last_triggered: None,
        created: None,
    })
    .collect()
}

/// `(hour, minute, second)` of an instant in the given zone.
pub(crate) fn wall_time_in_tz<Tz>(epoch_ms: i64, timezone: &Tz) -> Option<(u32, u32, u32)>
where
    Tz: TimeZone,
{
    let local = timezone.timestamp_millis_opt(epoch_ms).single()?;
    Some((local.hour(), local.minute(), local.second()))
}

/// The most recent instant at or before `at_ms` whose local wall time is
/// `time`. Days where `time` does not exist are skipped.
pub(crate) fn latest_occurrence_at_or_before<Tz>(
    time: NaiveTime,
    at_ms: i64,
    timezone: &Tz,
) -> Option<i64>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    let at = timezone.timestamp_millis_opt(at_ms).single()?;
    let mut date = at.date_naive();
    for _ in 0..MAX_LOOKBACK_DAYS {
        if let Some(candidate) = resolve_local_datetime(timezone, date.and_time(time))
            && candidate.timestamp_millis() <= at_ms
        {
            return Some(candidate.timestamp_millis());
        }
        date = date.pred_opt()?;
    }
    None
}

fn default_sound() -> String {
    DEFAULT_SOUND.to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_kind() -> AlarmKind {
    AlarmKind::User
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use chrono_tz::America::New_York;
    use serde_json::json;

    use super::*;

    fn utc_ms(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> i64 {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0)
            .single()
            .expect("valid")
            .timestamp_millis()
    }

    #[test]
    fn persisted_shape_round_trips_with_type_field() {
        let alarm: Alarm = serde_json::from_value(json!({
            "id": "alarm-1700000000000",
            "title": "Standup",
            "hour": 9,
            "minute": 15,
            "sound": "gentle_chime",
            "enabled": true,
            "type": "user",
            "isRinging": false
        }))
        .expect("deserialize");
        assert_eq!(alarm.time_label(), "09:15");
        assert_eq!(alarm.created_at(), Some(1_700_000_000_000));

        let value = serde_json::to_value(&alarm).expect("serialize");
        assert_eq!(value["type"], "user");
        assert_eq!(value["isRinging"], false);
        assert!(value.get("rangAt").is_none());
    }

    #[test]
    fn builtin_alarms_have_no_creation_bound() {
        let defaults = builtin_default_alarms();
        assert_eq!(defaults.len(), 3);
        assert!(defaults.iter().all(|alarm| alarm.created_at().is_none()));
        assert!(defaults.iter().all(|alarm| !alarm.enabled));
    }

    #[test]
    fn normalize_fixes_sound_and_kind() {
        let mut alarm = Alarm::user(
            "default-alarm-9".to_string(),
            "x".to_string(),
            6,
            0,
            "gone.mp3".to_string(),
            0,
        );
        assert!(alarm.normalize());
        assert_eq!(alarm.sound, DEFAULT_SOUND);
        assert!(alarm.is_default());
        assert!(!alarm.normalize());
    }

    #[test]
    fn alarm_time_parsing_and_validation() {
        assert_eq!(parse_alarm_time("07:05"), Some((7, 5)));
        assert_eq!(parse_alarm_time(" 23:59:00 "), Some((23, 59)));
        assert_eq!(parse_alarm_time("23:59:30"), None);
        assert_eq!(parse_alarm_time("24:00"), None);
        assert_eq!(parse_alarm_time("7am"), None);
        assert!(validate_time(23, 59).is_ok());
        assert_eq!(
            validate_time(24, 0),
            Err(CoreError::InvalidAlarmTime {
                hour: 24,
                minute: 0
            })
        );
    }

    #[test]
    fn latest_occurrence_is_today_or_yesterday() {
        let seven = NaiveTime::from_hms_opt(7, 0, 0).expect("valid");
        assert_eq!(
            latest_occurrence_at_or_before(seven, utc_ms(2026, 3, 2, 7, 30), &Utc),
            Some(utc_ms(2026, 3, 2, 7, 0))
        );
        assert_eq!(
            latest_occurrence_at_or_before(seven, utc_ms(2026, 3, 2, 6, 30), &Utc),
            Some(utc_ms(2026, 3, 1, 7, 0))
        );
        assert_eq!(
            latest_occurrence_at_or_before(seven, utc_ms(2026, 3, 2, 7, 0), &Utc),
            Some(utc_ms(2026, 3, 2, 7, 0))
        );
    }

    #[test]
    fn skipped_local_time_falls_back_a_day() {
        let half_past_two = NaiveTime::from_hms_opt(2, 30, 0).expect("valid");
        let after_jump = New_York
            .with_ymd_and_hms(2026, 3, 8, 4, 0, 0)
            .single()
            .expect("valid")
            .timestamp_millis();
        let expected = New_York
            .with_ymd_and_hms(2026, 3, 7, 2, 30, 0)
            .single()
            .expect("valid")
            .timestamp_millis();
        assert_eq!(
            latest_occurrence_at_or_before(half_past_two, after_jump, &New_York),
            Some(expected)
        );
    }

    #[test]
    fn wall_time_uses_the_zone() {
        let instant = utc_ms(2026, 7, 1, 12, 0);
        assert_eq!(wall_time_in_tz(instant, &Utc), Some((12, 0, 0)));
        assert_eq!(wall_time_in_tz(instant, &New_York), Some((8, 0, 0)));
    }
}
