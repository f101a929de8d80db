use std::collections::HashSet;

use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::alerts::{Category, DismissTarget, EventKind, Notification, resolve_sound};
use crate::error::{CoreError, CoreResult};
use crate::runtime::Services;
use crate::storage::{DEFAULT_TIMERS_KEY, TIMERS_KEY, load_records, save_records};
use crate::timer::model::{
    Timer, TimerEdit, TimerKind, builtin_default_timers, clamp_remaining, parse_target_date,
    user_timer_id,
};
use crate::timer::scheduler::{TaskHandle, TickScheduler};

pub const DEFAULT_MAX_USER_TIMERS: usize = 25;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TickOutcome {
    /// The timer is gone or was paused before the tick fired; nothing changed.
    Skipped,
    Counting { remaining_ms: u64 },
    Finished,
}

/// Owns every timer (user timers first, then the built-in set), the per-timer
/// tick handles, and mirrors both lists to storage after each mutation.
pub struct TimerStore {
    pub(super) user: Vec<Timer>,
    pub(super) defaults: Vec<Timer>,
    pub(super) ticks: TickScheduler,
    pub(super) services: Services,
    max_user_timers: usize,
}

impl TimerStore {
    /// Loads both lists. Malformed user data becomes an empty list, malformed
    /// defaults become the built-in set, and missing built-ins are appended.
    pub fn load(services: Services, max_user_timers: usize) -> Self {
        let (mut user, stored_defaults) = {
            let storage = services.storage.borrow();
            (
                load_records::<Timer>(&*storage, TIMERS_KEY).unwrap_or_default(),
                load_records::<Timer>(&*storage, DEFAULT_TIMERS_KEY),
            )
        };

        let mut dirty = false;
        let mut defaults = match stored_defaults {
            Some(list) if !list.is_empty() => list,
            _ => {
                dirty = true;
                builtin_default_timers()
            }
        };

        let mut seen = HashSet::new();
        defaults.retain(|timer| {
            let keep = timer.is_default() && seen.insert(timer.id.clone());
            if !keep {
                warn!("dropping stray entry '{}' from {DEFAULT_TIMERS_KEY}", timer.id);
                dirty = true;
            }
            keep
        });
        for builtin in builtin_default_timers() {
            if seen.insert(builtin.id.clone()) {
                debug!("restoring missing built-in timer {}", builtin.id);
                defaults.push(builtin);
                dirty = true;
            }
        }
        user.retain(|timer| {
            let keep = !timer.is_default() && seen.insert(timer.id.clone());
            if !keep {
                warn!("dropping duplicate timer '{}' from {TIMERS_KEY}", timer.id);
                dirty = true;
            }
            keep
        });

        for timer in user.iter_mut().chain(defaults.iter_mut()) {
            dirty |= timer.normalize();
        }

        let mut store = Self {
            user,
            defaults,
            ticks: TickScheduler::new(),
            services,
            max_user_timers,
        };
        dirty |= store.ensure_single_pin();
        debug!(
            "loaded {} user timers and {} built-in timers",
            store.user.len(),
            store.defaults.len()
        );
        if dirty {
            store.persist_or_warn();
        }
        store
    }

    pub fn list(&self) -> impl Iterator<Item = &Timer> {
        self.user.iter().chain(self.defaults.iter())
    }

    pub fn user_timers(&self) -> &[Timer] {
        &self.user
    }

    pub fn default_timers(&self) -> &[Timer] {
        &self.defaults
    }

    pub fn get(&self, id: &str) -> Option<&Timer> {
        self.list().find(|timer| timer.id == id)
    }

    pub fn pinned(&self) -> Option<&Timer> {
        self.list().find(|timer| timer.is_pinned)
    }

    pub fn tick_handle(&self, id: &str) -> Option<TaskHandle> {
        self.ticks.handle_for(id)
    }

    pub fn next_tick_at(&self) -> Option<i64> {
        self.ticks.next_deadline()
    }

    /// Inserts or replaces a record by id. New user records count against the
    /// limit; the tick entry follows the record's running flag.
    pub fn upsert(&mut self, mut timer: Timer) -> CoreResult<()> {
        timer.normalize();
        let id = timer.id.clone();
        let pinned = timer.is_pinned;

        if self.get(&id).is_some() {
            *self.get_mut(&id)? = timer;
        } else if timer.is_default() {
            self.defaults.push(timer);
        } else {
            self.check_limit()?;
            self.user.push(timer);
        }

        if pinned {
            self.pin_only(&id);
        }
        self.ensure_single_pin();
        self.sync_tick(&id);
        self.persist_or_warn();
        Ok(())
    }

    /// Deletes a user timer. Built-in timers can only be reset.
    pub fn remove(&mut self, id: &str) -> CoreResult<Timer> {
        let Some(index) = self.user.iter().position(|timer| timer.id == id) else {
            if self.defaults.iter().any(|timer| timer.id == id) {
                return Err(CoreError::DefaultNotDeletable(id.to_string()));
            }
            return Err(CoreError::UnknownTimer(id.to_string()));
        };

        self.ticks.cancel_timer(id);
        let removed = self.user.remove(index);
        if removed.is_ringing {
            self.services.alerts.borrow_mut().stop_sound();
        }
        self.ensure_single_pin();
        self.persist_or_warn();
        info!("deleted timer {id}");
        Ok(removed)
    }

    pub fn set_pinned(&mut self, id: &str) -> CoreResult<()> {
        if self.get(id).is_none() {
            return Err(CoreError::UnknownTimer(id.to_string()));
        }
        self.pin_only(id);
        self.persist_or_warn();
        Ok(())
    }

    /// Keeps exactly one pinned timer: the first pinned one survives, or the
    /// first timer overall is pinned when none is. Returns true on change.
    pub fn ensure_single_pin(&mut self) -> bool {
        let pinned_count = self.list().filter(|timer| timer.is_pinned).count();
        if pinned_count == 1 {
            return false;
        }
        let keep = self
            .pinned()
            .or_else(|| self.list().next())
            .map(|timer| timer.id.clone());
        let Some(keep) = keep else {
            return false;
        };
        debug!("repairing pin state ({pinned_count} pinned), keeping {keep}");
        self.pin_only(&keep);
        true
    }

    pub fn add_countdown(
        &mut self,
        title: &str,
        duration_ms: u64,
        sound: Option<&str>,
    ) -> CoreResult<String> {
        if duration_ms == 0 {
            return Err(CoreError::InvalidDuration(
                "duration must be greater than zero".to_string(),
            ));
        }
        self.check_limit()?;

        let id = self.fresh_id();
        let timer = Timer::countdown(
            id.clone(),
            title.trim().to_string(),
            duration_ms,
            resolve_sound(sound),
        );
        self.user.push(timer);
        self.ensure_single_pin();
        self.persist_or_warn();
        info!("created countdown {id} ({duration_ms} ms)");
        Ok(id)
    }

    /// Count-to-date timers start running immediately and must target a
    /// moment in the future.
    pub fn add_count_to_date(
        &mut self,
        title: &str,
        target_date: &str,
        sound: Option<&str>,
    ) -> CoreResult<String> {
        let now = self.now();
        let target_date = target_date.trim();
        let target_ms = parse_target_date(target_date)
            .filter(|target| *target > now)
            .ok_or_else(|| CoreError::InvalidTargetDate(target_date.to_string()))?;
        self.check_limit()?;

        let id = self.fresh_id();
        let timer = Timer::count_to_date(
            id.clone(),
            title.trim().to_string(),
            target_date.to_string(),
            target_ms,
            now,
            resolve_sound(sound),
        );
        self.user.push(timer);
        self.ensure_single_pin();
        self.ticks.start(&id, now);
        self.persist_or_warn();
        info!("created count-to-date timer {id} for {target_date}");
        Ok(id)
    }

    /// Applies an edit after validating all of it. A new duration resets the
    /// countdown; a new target date recomputes the count-to-date state.
    pub fn edit(&mut self, id: &str, edit: TimerEdit) -> CoreResult<()> {
        let now = self.now();
        let kind = self
            .get(id)
            .ok_or_else(|| CoreError::UnknownTimer(id.to_string()))?
            .kind;

        if edit.duration_ms.is_some() && kind != TimerKind::Countdown {
            return Err(CoreError::WrongTimerKind {
                id: id.to_string(),
                expected: TimerKind::Countdown.as_str(),
            });
        }
        if edit.target_date.is_some() && kind != TimerKind::CountToDate {
            return Err(CoreError::WrongTimerKind {
                id: id.to_string(),
                expected: TimerKind::CountToDate.as_str(),
            });
        }
        if edit.duration_ms == Some(0) {
            return Err(CoreError::InvalidDuration(
                "duration must be greater than zero".to_string(),
            ));
        }
        let target = match edit.target_date.as_deref().map(str::trim) {
            Some(date) => Some((
                date.to_string(),
                parse_target_date(date)
                    .filter(|target| *target > now)
                    .ok_or_else(|| CoreError::InvalidTargetDate(date.to_string()))?,
            )),
            None => None,
        };
        let sound = edit.sound.as_deref().map(|sound| resolve_sound(Some(sound)));

        let was_ringing = {
            let timer = self.get_mut(id)?;
            let was_ringing = timer.is_ringing;
            if let Some(title) = edit.title {
                timer.title = title.trim().to_string();
            }
            if let Some(sound) = sound {
                timer.sound = sound;
            }
            if let Some(duration_ms) = edit.duration_ms {
                timer.initial_duration = Some(duration_ms);
                timer.clean_reset();
            }
            if let Some((date, target_ms)) = target {
                timer.target_date = Some(date);
                timer.target_time = Some(target_ms);
                timer.remaining = clamp_remaining(target_ms - now);
                timer.is_running = target_ms > now;
                timer.is_ringing = false;
                timer.rang_at = None;
                timer.last_triggered = None;
            }
            was_ringing && !timer.is_ringing
        };

        if was_ringing {
            self.services.alerts.borrow_mut().stop_sound();
        }
        self.sync_tick(id);
        self.persist_or_warn();
        debug!("edited timer {id}");
        Ok(())
    }

    /// Starting is idempotent: a running timer keeps its deadline and only
    /// gets a fresh tick handle. A ringing countdown is silenced and restarts
    /// from its full duration.
    pub fn start(&mut self, id: &str) -> CoreResult<()> {
        let now = self.now();
        let was_ringing = self
            .get(id)
            .ok_or_else(|| CoreError::UnknownTimer(id.to_string()))?
            .is_ringing;

        {
            let timer = self.get_mut(id)?;
            match timer.kind {
                TimerKind::Countdown => {
                    if timer.is_ringing {
                        timer.clean_reset();
                    }
                    if !timer.is_running {
                        if timer.remaining == 0 {
                            timer.remaining = timer.initial_duration_ms();
                        }
                        timer.target_time = Some(deadline(now, timer.remaining));
                        timer.is_running = true;
                    }
                    timer.rang_at = None;
                    timer.last_triggered = None;
                }
                TimerKind::CountToDate => {
                    let target = timer
                        .target_time
                        .filter(|target| *target > now)
                        .ok_or_else(|| {
                            CoreError::InvalidTargetDate(
                                timer.target_date.clone().unwrap_or_default(),
                            )
                        })?;
                    timer.remaining = clamp_remaining(target - now);
                    timer.is_running = true;
                    timer.is_ringing = false;
                    timer.rang_at = None;
                }
            }
        }

        if was_ringing {
            self.services.alerts.borrow_mut().stop_sound();
        }
        self.ticks.start(id, now);
        self.persist_or_warn();
        info!("started timer {id}");
        Ok(())
    }

    pub fn pause(&mut self, id: &str) -> CoreResult<()> {
        let now = self.now();
        {
            let timer = self.get_mut(id)?;
            if !timer.is_running {
                return Ok(());
            }
            timer.remaining = timer.remaining_at(now);
            timer.is_running = false;
            if timer.is_countdown() {
                timer.target_time = None;
            }
        }
        self.ticks.cancel_timer(id);
        self.persist_or_warn();
        info!("paused timer {id}");
        Ok(())
    }

    pub fn reset(&mut self, id: &str) -> CoreResult<()> {
        let now = self.now();
        let was_ringing = {
            let timer = self.get_mut(id)?;
            let was_ringing = timer.is_ringing;
            match timer.kind {
                TimerKind::Countdown => timer.clean_reset(),
                TimerKind::CountToDate => {
                    timer.is_ringing = false;
                    timer.rang_at = None;
                    timer.last_triggered = None;
                    match timer.target_time {
                        Some(target) if target > now => {
                            timer.remaining = clamp_remaining(target - now);
                            timer.is_running = true;
                        }
                        _ => {
                            timer.remaining = 0;
                            timer.is_running = false;
                        }
                    }
                }
            }
            was_ringing
        };

        if was_ringing {
            self.services.alerts.borrow_mut().stop_sound();
        }
        self.sync_tick(id);
        self.persist_or_warn();
        info!("reset timer {id}");
        Ok(())
    }

    /// One tick: recompute from the absolute deadline, finish when the raw
    /// remaining time reaches zero, otherwise schedule the next tick. A timer
    /// that stopped running since the tick was scheduled is left untouched.
    pub fn tick(&mut self, id: &str) -> TickOutcome {
        let now = self.now();
        if !self.get(id).is_some_and(|timer| timer.is_running) {
            self.ticks.cancel_timer(id);
            return TickOutcome::Skipped;
        }

        let raw = {
            let Some(timer) = self.find_mut(id) else {
                return TickOutcome::Skipped;
            };
            if timer.target_time.is_none() {
                timer.target_time = Some(deadline(now, timer.remaining));
            }
            let raw = timer.raw_remaining_at(now).unwrap_or(0);
            if raw > 0 {
                timer.remaining = clamp_remaining(raw);
            }
            raw
        };

        if raw <= 0 {
            if let Err(err) = self.handle_timer_end(id) {
                warn!("timer {id} could not finish: {err}");
            }
            return TickOutcome::Finished;
        }
        self.ticks.start(id, now);
        TickOutcome::Counting {
            remaining_ms: clamp_remaining(raw),
        }
    }

    pub fn fire_due_ticks(&mut self) -> Vec<(String, TickOutcome)> {
        let now = self.now();
        self.ticks
            .take_due(now)
            .into_iter()
            .map(|id| {
                let outcome = self.tick(&id);
                (id, outcome)
            })
            .collect()
    }

    /// Moves a timer into the ringing state exactly once. Returns false when
    /// it was already ringing.
    pub fn handle_timer_end(&mut self, id: &str) -> CoreResult<bool> {
        let now = self.now();
        self.ticks.cancel_timer(id);
        let (title, sound, kind) = {
            let timer = self.get_mut(id)?;
            if timer.is_ringing && !timer.is_running {
                return Ok(false);
            }
            timer.remaining = 0;
            timer.is_running = false;
            timer.rang_at = None;
            timer.is_ringing = true;
            timer.last_triggered = Some(now);
            (timer.title.clone(), timer.sound.clone(), timer.kind)
        };
        self.persist_or_warn();
        info!("timer {id} finished");

        let mut alerts = self.services.alerts.borrow_mut();
        alerts.play_sound(&sound);
        alerts.show_notification(Notification {
            category: Category::Timer,
            event: EventKind::Ringing,
            message_key: "timer_finished",
            data: json!({ "id": id, "title": title, "type": kind.as_str() }),
            dismiss: Some(DismissTarget::Timer(id.to_string())),
        });
        Ok(true)
    }

    /// Acknowledges a ringing timer. Countdowns get a clean reset; count-to-
    /// date timers only stop ringing. Returns false when nothing was ringing.
    pub fn dismiss_timer(&mut self, id: &str) -> CoreResult<bool> {
        {
            let timer = self.get_mut(id)?;
            if !timer.is_ringing {
                return Ok(false);
            }
            match timer.kind {
                TimerKind::Countdown => timer.clean_reset(),
                TimerKind::CountToDate => {
                    timer.is_ringing = false;
                    timer.last_triggered = None;
                }
            }
        }
        self.services.alerts.borrow_mut().stop_sound();
        self.ticks.cancel_timer(id);
        self.persist_or_warn();
        info!("dismissed timer {id}");
        Ok(true)
    }

    pub fn persist(&self) -> CoreResult<()> {
        let mut storage = self.services.storage.borrow_mut();
        save_records(&mut *storage, TIMERS_KEY, &self.user)
            .and_then(|()| save_records(&mut *storage, DEFAULT_TIMERS_KEY, &self.defaults))
            .map_err(|err| CoreError::Storage(format!("{err:#}")))
    }

    pub(super) fn persist_or_warn(&self) {
        if let Err(err) = self.persist() {
            error!("unable to persist timers: {err}");
        }
    }

    /// Gives every running timer a tick handle. Used once restoration has
    /// resolved and persisted all records.
    pub(super) fn schedule_running(&mut self) -> usize {
        let now = self.now();
        let running = self
            .list()
            .filter(|timer| timer.is_running)
            .map(|timer| timer.id.clone())
            .collect::<Vec<_>>();
        for id in &running {
            self.ticks.start(id, now);
        }
        running.len()
    }

    pub(super) fn now(&self) -> i64 {
        self.services.clock.now_ms()
    }

    pub(super) fn timers_mut(&mut self) -> impl Iterator<Item = &mut Timer> {
        self.user.iter_mut().chain(self.defaults.iter_mut())
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut Timer> {
        self.timers_mut().find(|timer| timer.id == id)
    }

    fn get_mut(&mut self, id: &str) -> CoreResult<&mut Timer> {
        self.find_mut(id)
            .ok_or_else(|| CoreError::UnknownTimer(id.to_string()))
    }

    fn pin_only(&mut self, id: &str) {
        for timer in self.timers_mut() {
            timer.is_pinned = timer.id == id;
        }
    }

    fn sync_tick(&mut self, id: &str) {
        let now = self.now();
        if self.get(id).is_some_and(|timer| timer.is_running) {
            self.ticks.start(id, now);
        } else {
            self.ticks.cancel_timer(id);
        }
    }

    fn check_limit(&mut self) -> CoreResult<()> {
        let limit = self.max_user_timers;
        if self.user.len() < limit {
            return Ok(());
        }
        warn!("timer limit of {limit} reached");
        self.services
            .alerts
            .borrow_mut()
            .show_notification(Notification {
                category: Category::Timer,
                event: EventKind::LimitReached,
                message_key: "timer_limit_reached",
                data: json!({ "limit": limit }),
                dismiss: None,
            });
        Err(CoreError::LimitExceeded {
            kind: "timer",
            limit,
        })
    }

    fn fresh_id(&self) -> String {
        let mut stamp = self.now();
        loop {
            let id = user_timer_id(stamp);
            if self.get(&id).is_none() {
                return id;
            }
            stamp += 1;
        }
    }
}

fn deadline(now_ms: i64, remaining_ms: u64) -> i64 {
    now_ms.saturating_add(i64::try_from(remaining_ms).unwrap_or(i64::MAX))
}
