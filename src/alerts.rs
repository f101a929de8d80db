use std::io::Write;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

pub const DEFAULT_SOUND: &str = "classic_beep";

pub const BUILTIN_SOUNDS: &[&str] = &[
    "classic_beep",
    "gentle_chime",
    "digital_alarm",
    "peaceful_tone",
    "urgent_beep",
];

pub fn is_known_sound(sound_id: &str) -> bool {
    BUILTIN_SOUNDS.contains(&sound_id)
}

/// Picks the sound for a new or edited record; unknown ids fall back to the
/// default sound.
pub fn resolve_sound(requested: Option<&str>) -> String {
    match requested {
        Some(sound) if is_known_sound(sound) => sound.to_string(),
        Some(sound) => {
            warn!("sound '{sound}' is not available, using {DEFAULT_SOUND}");
            DEFAULT_SOUND.to_string()
        }
        None => DEFAULT_SOUND.to_string(),
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Timer,
    Alarm,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Timer => "timer",
            Category::Alarm => "alarm",
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Ringing,
    LimitReached,
}

/// What acknowledging a notification should resolve. The runtime routes this
/// back to the owning store's dismiss operation.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum DismissTarget {
    Timer(String),
    Alarm(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub category: Category,
    pub event: EventKind,
    pub message_key: &'static str,
    pub data: Value,
    pub dismiss: Option<DismissTarget>,
}

/// Sound player and notification surface. Fire-and-forget: nothing here can
/// fail back into the timing core.
pub trait AlertSink {
    fn play_sound(&mut self, sound_id: &str);
    fn stop_sound(&mut self);
    fn show_notification(&mut self, notification: Notification);
}

/// Writes alerts to stdout and rings the terminal bell.
#[derive(Debug, Default)]
pub struct TerminalAlerts {
    playing: Option<String>,
}

impl TerminalAlerts {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AlertSink for TerminalAlerts {
    fn play_sound(&mut self, sound_id: &str) {
        debug!("playing sound {sound_id}");
        self.playing = Some(sound_id.to_string());
        let mut stdout = std::io::stdout();
        let _ = write!(stdout, "\x07");
        let _ = stdout.flush();
    }

    fn stop_sound(&mut self) {
        if let Some(sound) = self.playing.take() {
            debug!("stopped sound {sound}");
        }
    }

    fn show_notification(&mut self, notification: Notification) {
        info!(
            category = notification.category.as_str(),
            message = notification.message_key,
            "notification"
        );
        let title = notification
            .data
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("");
        let line = match (&notification.event, &notification.dismiss) {
            (EventKind::Ringing, Some(DismissTarget::Timer(id))) => {
                format!("** timer '{title}' is ringing ** (dismiss {id})")
            }
            (EventKind::Ringing, Some(DismissTarget::Alarm(id))) => {
                format!("** alarm '{title}' is ringing ** (dismiss {id})")
            }
            (EventKind::Ringing, None) => format!("** '{title}' is ringing **"),
            (EventKind::LimitReached, _) => {
                let limit = notification
                    .data
                    .get("limit")
                    .and_then(Value::as_u64)
                    .unwrap_or_default();
                format!(
                    "cannot add {}: limit of {limit} reached",
                    notification.category.as_str()
                )
            }
        };
        println!("{line}");
    }
}

#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingAlerts {
    pub played: Vec<String>,
    pub stops: usize,
    pub notifications: Vec<Notification>,
}

#[cfg(test)]
impl AlertSink for RecordingAlerts {
    fn play_sound(&mut self, sound_id: &str) {
        self.played.push(sound_id.to_string());
    }

    fn stop_sound(&mut self) {
        self.stops += 1;
    }

    fn show_notification(&mut self, notification: Notification) {
        self.notifications.push(notification);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn builtin_catalog_contains_default_sound() {
        assert!(is_known_sound(DEFAULT_SOUND));
        assert!(!is_known_sound("custom-upload-17"));
        assert_eq!(resolve_sound(Some("custom-upload-17")), DEFAULT_SOUND);
        assert_eq!(resolve_sound(Some("gentle_chime")), "gentle_chime");
        assert_eq!(resolve_sound(None), DEFAULT_SOUND);
    }

    #[test]
    fn dismiss_target_serializes_with_kind_and_id() {
        let value = serde_json::to_value(DismissTarget::Timer("timer-1".to_string()))
            .expect("serialize");
        assert_eq!(value, json!({"kind": "timer", "id": "timer-1"}));
    }

    #[test]
    fn terminal_alerts_track_current_sound() {
        let mut alerts = TerminalAlerts::new();
        alerts.play_sound("gentle_chime");
        assert_eq!(alerts.playing.as_deref(), Some("gentle_chime"));
        alerts.stop_sound();
        assert!(alerts.playing.is_none());
    }
}
