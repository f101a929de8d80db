use std::collections::HashSet;

use chrono::{Local, TimeZone};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::alarm::model::{
    Alarm, AlarmEdit, builtin_default_alarms, user_alarm_id, validate_time, wall_time_in_tz,
};
use crate::alerts::{Category, DismissTarget, EventKind, Notification, resolve_sound};
use crate::error::{CoreError, CoreResult};
use crate::runtime::Services;
use crate::storage::{ALARMS_KEY, DEFAULT_ALARMS_KEY, load_records, save_records};

pub const DEFAULT_MAX_USER_ALARMS: usize = 25;

/// A matching minute fires once; another check within this window is a
/// repeat of the same minute.
const TRIGGER_DEBOUNCE_MS: i64 = 59_000;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AlarmStatus {
    Disabled,
    Armed,
    Ringing,
    RangWhileAway,
}

/// User alarms followed by the built-in set, mirrored to storage after each
/// mutation. Firing is driven by `check_triggers` once per second.
pub struct AlarmStore {
    pub(super) user: Vec<Alarm>,
    pub(super) defaults: Vec<Alarm>,
    pub(super) services: Services,
    max_user_alarms: usize,
}

impl AlarmStore {
    pub fn load(services: Services, max_user_alarms: usize) -> Self {
        let (mut user, stored_defaults) = {
            let storage = services.storage.borrow();
            (
                load_records::<Alarm>(&*storage, ALARMS_KEY).unwrap_or_default(),
                load_records::<Alarm>(&*storage, DEFAULT_ALARMS_KEY),
            )
        };

        let mut dirty = false;
        let mut defaults = match stored_defaults {
            Some(list) if !list.is_empty() => list,
            _ => {
                dirty = true;
                builtin_default_alarms()
            }
        };

        let mut seen = HashSet::new();
        let mut keep_valid = |alarm: &Alarm, list: &str| {
            if let Err(err) = validate_time(alarm.hour, alarm.minute) {
                warn!("dropping alarm '{}' from {list}: {err}", alarm.id);
                return false;
            }
            if !seen.insert(alarm.id.clone()) {
                warn!("dropping duplicate alarm '{}' from {list}", alarm.id);
                return false;
            }
            true
        };
        let before = (defaults.len(), user.len());
        defaults.retain(|alarm| keep_valid(alarm, DEFAULT_ALARMS_KEY));
        user.retain(|alarm| keep_valid(alarm, ALARMS_KEY));
        dirty |= before != (defaults.len(), user.len());

        for builtin in builtin_default_alarms() {
            if !defaults.iter().chain(user.iter()).any(|alarm| alarm.id == builtin.id) {
                debug!("restoring missing built-in alarm {}", builtin.id);
                defaults.push(builtin);
                dirty = true;
            }
        }

        for alarm in user.iter_mut().chain(defaults.iter_mut()) {
            dirty |= alarm.normalize();
        }

        let store = Self {
            user,
            defaults,
            services,
            max_user_alarms,
        };
        if dirty {
            store.persist_or_warn();
        }
        store
    }

    pub fn list(&self) -> impl Iterator<Item = &Alarm> {
        self.user.iter().chain(self.defaults.iter())
    }

    pub fn user_alarms(&self) -> &[Alarm] {
        &self.user
    }

    pub fn default_alarms(&self) -> &[Alarm] {
        &self.defaults
    }

    pub fn get(&self, id: &str) -> Option<&Alarm> {
        self.list().find(|alarm| alarm.id == id)
    }

    pub fn status(&self, id: &str) -> Option<AlarmStatus> {
        self.get(id).map(|alarm| {
            if alarm.is_ringing {
                AlarmStatus::Ringing
            } else if alarm.rang_at.is_some() {
                AlarmStatus::RangWhileAway
            } else if alarm.enabled {
                AlarmStatus::Armed
            } else {
                AlarmStatus::Disabled
            }
        })
    }

    pub fn add(
        &mut self,
        title: &str,
        hour: u32,
        minute: u32,
        sound: Option<&str>,
    ) -> CoreResult<String> {
        validate_time(hour, minute)?;
        self.check_limit()?;

        let now = self.now();
        let mut stamp = now;
        let id = loop {
            let id = user_alarm_id(stamp);
            if self.get(&id).is_none() {
                break id;
            }
            stamp += 1;
        };
        self.user.push(Alarm::user(
            id.clone(),
            title.trim().to_string(),
            hour,
            minute,
            resolve_sound(sound),
            now,
        ));
        self.persist_or_warn();
        info!("created alarm {id} at {hour:02}:{minute:02}");
        Ok(id)
    }

    /// Changing the time or sound clears any pending ring bookkeeping so the
    /// edited alarm starts fresh.
    pub fn edit(&mut self, id: &str, edit: AlarmEdit) -> CoreResult<()> {
        if let Some((hour, minute)) = edit.time {
            validate_time(hour, minute)?;
        }
        let sound = edit.sound.as_deref().map(|sound| resolve_sound(Some(sound)));

        let was_ringing = {
            let alarm = self.get_mut(id)?;
            let was_ringing = alarm.is_ringing;
            if let Some(title) = edit.title {
                alarm.title = title.trim().to_string();
            }
            if let Some((hour, minute)) = edit.time {
                alarm.hour = hour;
                alarm.minute = minute;
            }
            if let Some(sound) = sound {
                alarm.sound = sound;
            }
            alarm.is_ringing = false;
            alarm.rang_at = None;
            alarm.last_triggered = None;
            was_ringing
        };

        if was_ringing {
            self.services.alerts.borrow_mut().stop_sound();
        }
        self.persist_or_warn();
        debug!("edited alarm {id}");
        Ok(())
    }

    /// Enabling acknowledges any "rang while away" tag; disabling silences
    /// a ringing alarm.
    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> CoreResult<()> {
        let was_ringing = {
            let alarm = self.get_mut(id)?;
            let was_ringing = alarm.is_ringing;
            alarm.enabled = enabled;
            if enabled {
                alarm.rang_at = None;
            } else {
                alarm.is_ringing = false;
            }
            was_ringing && !alarm.is_ringing
        };
        if was_ringing {
            self.services.alerts.borrow_mut().stop_sound();
        }
        self.persist_or_warn();
        info!(
            "alarm {id} {}",
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> CoreResult<Alarm> {
        let Some(index) = self.user.iter().position(|alarm| alarm.id == id) else {
            if self.defaults.iter().any(|alarm| alarm.id == id) {
                return Err(CoreError::DefaultNotDeletable(id.to_string()));
            }
            return Err(CoreError::UnknownAlarm(id.to_string()));
        };
        let removed = self.user.remove(index);
        if removed.is_ringing {
            self.services.alerts.borrow_mut().stop_sound();
        }
        self.persist_or_warn();
        info!("deleted alarm {id}");
        Ok(removed)
    }

    /// Fires every enabled alarm whose hour:minute matches the local wall
    /// clock. Only evaluated on second zero of each minute.
    pub fn check_triggers(&mut self) -> Vec<String> {
        self.check_triggers_in_tz(&Local)
    }

    pub fn check_triggers_in_tz<Tz>(&mut self, timezone: &Tz) -> Vec<String>
    where
        Tz: TimeZone,
    {
        let now = self.now();
        let Some((hour, minute, second)) = wall_time_in_tz(now, timezone) else {
            return Vec::new();
        };
        if second != 0 {
            return Vec::new();
        }

        let due = self
            .list()
            .filter(|alarm| {
                alarm.enabled
                    && !alarm.is_ringing
                    && alarm.hour == hour
                    && alarm.minute == minute
                    && alarm
                        .last_triggered
                        .is_none_or(|last| now - last >= TRIGGER_DEBOUNCE_MS)
            })
            .map(|alarm| alarm.id.clone())
            .collect::<Vec<_>>();

        for id in &due {
            if let Err(err) = self.fire(id) {
                warn!("alarm {id} could not fire: {err}");
            }
        }
        due
    }

    /// Starts ringing: sound plus a notification that dismisses this alarm.
    pub fn fire(&mut self, id: &str) -> CoreResult<()> {
        let now = self.now();
        let (title, sound, time) = {
            let alarm = self.get_mut(id)?;
            alarm.is_ringing = true;
            alarm.last_triggered = Some(now);
            alarm.rang_at = None;
            (alarm.title.clone(), alarm.sound.clone(), alarm.time_label())
        };
        self.persist_or_warn();
        info!("alarm {id} ringing ({time})");

        let mut alerts = self.services.alerts.borrow_mut();
        alerts.play_sound(&sound);
        alerts.show_notification(Notification {
            category: Category::Alarm,
            event: EventKind::Ringing,
            message_key: "alarm_ringing",
            data: json!({ "id": id, "title": title, "time": time }),
            dismiss: Some(DismissTarget::Alarm(id.to_string())),
        });
        Ok(())
    }

    /// Silences a ringing alarm. It stays enabled for the next day.
    pub fn dismiss_alarm(&mut self, id: &str) -> CoreResult<bool> {
        {
            let alarm = self.get_mut(id)?;
            if !alarm.is_ringing {
                return Ok(false);
            }
            alarm.is_ringing = false;
            alarm.rang_at = None;
        }
        self.services.alerts.borrow_mut().stop_sound();
        self.persist_or_warn();
        info!("dismissed alarm {id}");
        Ok(true)
    }

    pub fn persist(&self) -> CoreResult<()> {
        let mut storage = self.services.storage.borrow_mut();
        save_records(&mut *storage, ALARMS_KEY, &self.user)
            .and_then(|()| save_records(&mut *storage, DEFAULT_ALARMS_KEY, &self.defaults))
            .map_err(|err| CoreError::Storage(format!("{err:#}")))
    }

    pub(super) fn persist_or_warn(&self) {
        if let Err(err) = self.persist() {
            error!("unable to persist alarms: {err}");
        }
    }

    pub(super) fn now(&self) -> i64 {
        self.services.clock.now_ms()
    }

    pub(super) fn alarms_mut(&mut self) -> impl Iterator<Item = &mut Alarm> {
        self.user.iter_mut().chain(self.defaults.iter_mut())
    }

    fn get_mut(&mut self, id: &str) -> CoreResult<&mut Alarm> {
        self.alarms_mut()
            .find(|alarm| alarm.id == id)
            .ok_or_else(|| CoreError::UnknownAlarm(id.to_string()))
    }

    fn check_limit(&mut self) -> CoreResult<()> {
        let limit = self.max_user_alarms;
        if self.user.len() < limit {
            return Ok(());
        }
        warn!("alarm limit of {limit} reached");
        self.services
            .alerts
            .borrow_mut()
            .show_notification(Notification {
                category: Category::Alarm,
                event: EventKind::LimitReached,
                message_key: "alarm_limit_reached",
                data: json!({ "limit": limit }),
                dismiss: None,
            });
        Err(CoreError::LimitExceeded {
            kind: "alarm",
            limit,
        })
    }
}
