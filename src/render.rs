use std::fmt::Write as _;

use crate::alarm::model::Alarm;
use crate::error::{CoreError, CoreResult};
use crate::runtime::Snapshot;
use crate::timer::model::Timer;

pub fn format_duration_hms(duration_ms: u64) -> String {
    let total_secs = duration_ms / 1000;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// Parses `90`, `90s`, `500ms`, `5m`, `1h` and compounds such as `1h30m`.
/// A bare number is seconds. Zero is rejected.
pub fn parse_duration(input: &str) -> CoreResult<u64> {
    let token = input.trim();
    let invalid = || CoreError::InvalidDuration(format!("'{}'", input.trim()));
    if token.is_empty() {
        return Err(invalid());
    }
    if let Ok(secs) = token.parse::<u64>() {
        return secs
            .checked_mul(1000)
            .filter(|ms| *ms > 0)
            .ok_or_else(invalid);
    }

    let mut total: u64 = 0;
    let mut rest = token;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits == 0 {
            return Err(invalid());
        }
        let value: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let (unit_ms, unit_len) = if rest.starts_with("ms") {
            (1, 2)
        } else if rest.starts_with('h') {
            (3_600_000, 1)
        } else if rest.starts_with('m') {
            (60_000, 1)
        } else if rest.starts_with('s') {
            (1_000, 1)
        } else {
            return Err(invalid());
        };
        rest = &rest[unit_len..];
        total = value
            .checked_mul(unit_ms)
            .and_then(|ms| total.checked_add(ms))
            .ok_or_else(invalid)?;
    }

    if total == 0 { Err(invalid()) } else { Ok(total) }
}

pub fn rang_ago_label(rang_at_ms: i64, now_ms: i64) -> String {
    let minutes = now_ms.saturating_sub(rang_at_ms).max(0) / 60_000;
    match minutes {
        0 => "rang just now".to_string(),
        1 => "rang 1 minute ago".to_string(),
        2..=59 => format!("rang {minutes} minutes ago"),
        60..=119 => "rang 1 hour ago".to_string(),
        120..=2879 => format!("rang {} hours ago", minutes / 60),
        _ => format!("rang {} days ago", minutes / 1440),
    }
}

pub fn timer_line(timer: &Timer, now_ms: i64) -> String {
    let pin = if timer.is_pinned { '*' } else { ' ' };
    let state = if timer.is_ringing {
        "RINGING"
    } else if timer.is_running {
        "running"
    } else if timer.remaining == 0 {
        "done"
    } else {
        "stopped"
    };
    let mut line = format!(
        "{pin} {:<24} {:<13} {} {:<8} {}",
        timer.id,
        timer.kind.as_str(),
        format_duration_hms(timer.remaining_at(now_ms)),
        state,
        timer.title
    );
    if let Some(target) = &timer.target_date {
        let _ = write!(line, " (until {target})");
    }
    if let Some(rang_at) = timer.rang_at {
        let _ = write!(line, " [{}]", rang_ago_label(rang_at, now_ms));
    }
    line
}

pub fn alarm_line(alarm: &Alarm, now_ms: i64) -> String {
    let state = if alarm.is_ringing {
        "RINGING"
    } else if alarm.enabled {
        "on"
    } else {
        "off"
    };
    let mut line = format!(
        "  {:<24} {} {:<8} {}",
        alarm.id,
        alarm.time_label(),
        state,
        alarm.title
    );
    if let Some(rang_at) = alarm.rang_at {
        let _ = write!(line, " [{}]", rang_ago_label(rang_at, now_ms));
    }
    line
}

pub fn render_status(snapshot: &Snapshot) -> String {
    let mut out = String::from("Timers\n");
    for timer in &snapshot.timers {
        out.push_str(&timer_line(timer, snapshot.now_ms));
        out.push('\n');
    }
    out.push_str("Alarms\n");
    for alarm in &snapshot.alarms {
        out.push_str(&alarm_line(alarm, snapshot.now_ms));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::DEFAULT_SOUND;

    #[test]
    fn durations_format_with_two_digit_hours() {
        assert_eq!(format_duration_hms(0), "00:00:00");
        assert_eq!(format_duration_hms(9_999), "00:00:09");
        assert_eq!(format_duration_hms(25 * 60_000), "00:25:00");
        assert_eq!(format_duration_hms(101 * 3_600_000), "101:00:00");
    }

    #[test]
    fn duration_tokens_parse() {
        assert_eq!(parse_duration("90"), Ok(90_000));
        assert_eq!(parse_duration("90s"), Ok(90_000));
        assert_eq!(parse_duration("500ms"), Ok(500));
        assert_eq!(parse_duration("5m"), Ok(300_000));
        assert_eq!(parse_duration("1h30m"), Ok(5_400_000));
        assert_eq!(parse_duration(" 2m10s "), Ok(130_000));
    }

    #[test]
    fn bad_duration_tokens_are_rejected() {
        for token in ["", "0", "0s", "m", "5x", "1.5m", "-3s", "h1"] {
            assert!(
                matches!(parse_duration(token), Err(CoreError::InvalidDuration(_))),
                "{token} should be rejected"
            );
        }
    }

    #[test]
    fn rang_labels_scale_with_elapsed_time() {
        let now = 1_000_000_000;
        assert_eq!(rang_ago_label(now - 10_000, now), "rang just now");
        assert_eq!(rang_ago_label(now - 60_000, now), "rang 1 minute ago");
        assert_eq!(rang_ago_label(now - 12 * 60_000, now), "rang 12 minutes ago");
        assert_eq!(rang_ago_label(now - 90 * 60_000, now), "rang 1 hour ago");
        assert_eq!(rang_ago_label(now - 5 * 3_600_000, now), "rang 5 hours ago");
        assert_eq!(rang_ago_label(now - 3 * 86_400_000, now), "rang 3 days ago");
        assert_eq!(rang_ago_label(now + 5_000, now), "rang just now");
        assert_eq!(rang_ago_label(i64::MAX, i64::MIN), "rang just now");
        assert!(rang_ago_label(i64::MIN, now).ends_with("days ago"));
    }

    #[test]
    fn timer_line_shows_pin_state_and_ring_tag() {
        let mut timer = Timer::countdown(
            "timer-1".to_string(),
            "eggs".to_string(),
            10_000,
            DEFAULT_SOUND.to_string(),
        );
        timer.is_pinned = true;
        timer.rang_at = Some(0);
        let line = timer_line(&timer, 5 * 60_000);
        assert!(line.starts_with("* timer-1"));
        assert!(line.contains("00:00:10"));
        assert!(line.contains("stopped"));
        assert!(line.ends_with("[rang 5 minutes ago]"));
    }

    #[test]
    fn status_lists_both_sections() {
        let snapshot = Snapshot {
            alarms: vec![Alarm::user(
                "alarm-1".to_string(),
                "Wake".to_string(),
                7,
                5,
                DEFAULT_SOUND.to_string(),
                0,
            )],
            ..Snapshot::default()
        };
        let text = render_status(&snapshot);
        assert!(text.starts_with("Timers\nAlarms\n"));
        assert!(text.contains("07:05 on"));
    }
}
