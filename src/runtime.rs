use std::cell::RefCell;
use std::io::BufRead;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::{debug, info, warn};

use crate::alarm::model::Alarm;
use crate::alarm::restore::AlarmRestoreReport;
use crate::alarm::scheduler::{AlarmStore, DEFAULT_MAX_USER_ALARMS};
use crate::alerts::{AlertSink, DismissTarget};
use crate::clock::{Clock, delay_to_next_second};
use crate::error::{CoreError, CoreResult};
use crate::storage::{SharedStore, read_last_visit, write_last_visit};
use crate::timer::model::Timer;
use crate::timer::restore::RestoreReport;
use crate::timer::store::{DEFAULT_MAX_USER_TIMERS, TickOutcome, TimerStore};

pub const DEFAULT_HEARTBEAT_MS: i64 = 15_000;

/// Collaborators shared by both stores. Everything runs on one thread, so
/// plain `Rc`/`RefCell` sharing is enough.
#[derive(Clone)]
pub struct Services {
    pub clock: Rc<dyn Clock>,
    pub storage: SharedStore,
    pub alerts: Rc<RefCell<dyn AlertSink>>,
}

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_user_timers: usize,
    pub max_user_alarms: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_user_timers: DEFAULT_MAX_USER_TIMERS,
            max_user_alarms: DEFAULT_MAX_USER_ALARMS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenReport {
    pub last_visit_ms: Option<i64>,
    pub timers: RestoreReport,
    pub alarms: AlarmRestoreReport,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutcome {
    pub finished_timers: Vec<String>,
    pub fired_alarms: Vec<String>,
    pub heartbeat: bool,
}

/// Read-only view handed to presentation: the text renderer and the HTTP
/// snapshot endpoint.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub now_ms: i64,
    pub clock: String,
    pub pinned_timer: Option<String>,
    pub timers: Vec<Timer>,
    pub alarms: Vec<Alarm>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RunCommand {
    Dismiss(String),
    Start(String),
    Pause(String),
    Reset(String),
    Quit,
}

/// One visit: open restores persisted state, `step` drives ticks, alarm
/// checks and the heartbeat, `close` records the visit end.
pub struct Runtime {
    services: Services,
    pub timers: TimerStore,
    pub alarms: AlarmStore,
    heartbeat_ms: i64,
    last_heartbeat_ms: i64,
    last_alarm_check_second: Option<i64>,
}

impl Runtime {
    pub fn open(services: Services, limits: Limits) -> (Self, OpenReport) {
        let last_visit_ms = read_last_visit(&*services.storage.borrow());
        let mut timers = TimerStore::load(services.clone(), limits.max_user_timers);
        let mut alarms = AlarmStore::load(services.clone(), limits.max_user_alarms);

        let timer_report = timers.restore(last_visit_ms);
        let alarm_report = alarms.restore(last_visit_ms);
        debug!(
            "opened with last visit {:?} using {} clock",
            last_visit_ms,
            services.clock.label()
        );

        let now = services.clock.now_ms();
        let runtime = Self {
            services,
            timers,
            alarms,
            heartbeat_ms: DEFAULT_HEARTBEAT_MS,
            last_heartbeat_ms: now,
            last_alarm_check_second: None,
        };
        let report = OpenReport {
            last_visit_ms,
            timers: timer_report,
            alarms: alarm_report,
        };
        (runtime, report)
    }

    /// Heartbeats closer than one second apart are not useful; shorter
    /// intervals are raised to one second.
    pub fn set_heartbeat(&mut self, heartbeat: Duration) {
        self.heartbeat_ms = i64::try_from(heartbeat.as_millis())
            .unwrap_or(DEFAULT_HEARTBEAT_MS)
            .max(1_000);
    }

    pub fn now_ms(&self) -> i64 {
        self.services.clock.now_ms()
    }

    /// Fires due timer ticks, runs the alarm check once per wall-clock
    /// second and refreshes the last-visit heartbeat when it is due.
    pub fn step(&mut self) -> StepOutcome {
        let now = self.now_ms();
        let finished_timers = self
            .timers
            .fire_due_ticks()
            .into_iter()
            .filter(|(_, outcome)| *outcome == TickOutcome::Finished)
            .map(|(id, _)| id)
            .collect();

        let second = now.div_euclid(1_000);
        let fired_alarms = if self.last_alarm_check_second == Some(second) {
            Vec::new()
        } else {
            self.last_alarm_check_second = Some(second);
            self.alarms.check_triggers()
        };

        let heartbeat = now - self.last_heartbeat_ms >= self.heartbeat_ms;
        if heartbeat && let Err(err) = self.write_heartbeat() {
            warn!("heartbeat failed: {err}");
        }

        StepOutcome {
            finished_timers,
            fired_alarms,
            heartbeat,
        }
    }

    /// Earliest instant the loop has work: a timer tick or the next second
    /// boundary for the alarm check.
    pub fn next_wakeup_ms(&self) -> i64 {
        let now = self.now_ms();
        let next_second = now + delay_to_next_second(now);
        self.timers
            .next_tick_at()
            .map_or(next_second, |tick| tick.min(next_second))
            .max(now)
    }

    pub fn dismiss(&mut self, target: &DismissTarget) -> CoreResult<bool> {
        match target {
            DismissTarget::Timer(id) => self.timers.dismiss_timer(id),
            DismissTarget::Alarm(id) => self.alarms.dismiss_alarm(id),
        }
    }

    /// Resolves a bare id to whichever store owns it.
    pub fn dismiss_id(&mut self, id: &str) -> CoreResult<bool> {
        if self.timers.get(id).is_some() {
            return self.dismiss(&DismissTarget::Timer(id.to_string()));
        }
        if self.alarms.get(id).is_some() {
            return self.dismiss(&DismissTarget::Alarm(id.to_string()));
        }
        Err(CoreError::UnknownTimer(id.to_string()))
    }

    pub fn apply(&mut self, command: RunCommand) -> CoreResult<()> {
        match command {
            RunCommand::Dismiss(id) => self.dismiss_id(&id).map(|_| ()),
            RunCommand::Start(id) => self.timers.start(&id),
            RunCommand::Pause(id) => self.timers.pause(&id),
            RunCommand::Reset(id) => self.timers.reset(&id),
            RunCommand::Quit => Ok(()),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let now = self.now_ms();
        let timers = self
            .timers
            .list()
            .map(|timer| {
                let mut view = timer.clone();
                view.remaining = timer.remaining_at(now);
                view
            })
            .collect();
        Snapshot {
            now_ms: now,
            clock: self.services.clock.label().to_string(),
            pinned_timer: self.timers.pinned().map(|timer| timer.id.clone()),
            timers,
            alarms: self.alarms.list().cloned().collect(),
        }
    }

    /// Ends the visit: flushes both stores and records the last-visit time
    /// the next open restores against.
    pub fn close(&mut self) -> CoreResult<()> {
        self.timers.persist()?;
        self.alarms.persist()?;
        self.write_heartbeat()
    }

    fn write_heartbeat(&mut self) -> CoreResult<()> {
        let now = self.now_ms();
        write_last_visit(&mut *self.services.storage.borrow_mut(), now)
            .map_err(|err| CoreError::Storage(format!("{err:#}")))?;
        self.last_heartbeat_ms = now;
        debug!("recorded last visit {now}");
        Ok(())
    }
}

pub fn parse_run_command(line: &str) -> Option<RunCommand> {
    let mut parts = line.split_whitespace();
    let verb = parts.next()?;
    let id = parts.next().map(str::to_string);
    if parts.next().is_some() {
        return None;
    }
    match (verb, id) {
        ("dismiss" | "d", Some(id)) => Some(RunCommand::Dismiss(id)),
        ("start", Some(id)) => Some(RunCommand::Start(id)),
        ("pause", Some(id)) => Some(RunCommand::Pause(id)),
        ("reset", Some(id)) => Some(RunCommand::Reset(id)),
        ("quit" | "q", None) => Some(RunCommand::Quit),
        _ => None,
    }
}

/// Forwards parsed stdin lines to the run loop. The reader thread ends at
/// EOF or once the loop drops the receiver.
pub fn spawn_stdin_commands() -> Receiver<RunCommand> {
    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            match parse_run_command(&line) {
                Some(command) => {
                    if sender.send(command).is_err() {
                        break;
                    }
                }
                None => warn!("unrecognized command '{}'", line.trim()),
            }
        }
    });
    receiver
}

pub struct RunOptions {
    pub run_for: Option<Duration>,
    pub commands: Option<Receiver<RunCommand>>,
    pub api_state: Option<Arc<Mutex<Snapshot>>>,
}

pub fn run_loop(runtime: &mut Runtime, options: RunOptions) -> Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&stop))
        .context("failed to register SIGINT handler")?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&stop))
        .context("failed to register SIGTERM handler")?;

    let until = options.run_for.map(|limit| Instant::now() + limit);
    info!("running; Ctrl-C to stop");
    loop {
        if stop.load(Ordering::Relaxed) {
            info!("stop requested");
            break;
        }
        if until.is_some_and(|until| Instant::now() >= until) {
            debug!("run duration elapsed");
            break;
        }

        let outcome = runtime.step();
        if !outcome.finished_timers.is_empty() || !outcome.fired_alarms.is_empty() {
            debug!(?outcome, "step");
        }

        if let Some(commands) = &options.commands {
            loop {
                match commands.try_recv() {
                    Ok(RunCommand::Quit) => stop.store(true, Ordering::Relaxed),
                    Ok(command) => {
                        if let Err(err) = runtime.apply(command) {
                            warn!("{err}");
                        }
                    }
                    Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
                }
            }
        }

        if let Some(shared) = &options.api_state {
            match shared.lock() {
                Ok(mut guard) => *guard = runtime.snapshot(),
                Err(_) => warn!("snapshot lock poisoned; API state is stale"),
            }
        }

        let wait_ms = (runtime.next_wakeup_ms() - runtime.now_ms()).clamp(1, 1_000);
        let mut wake_at = Instant::now() + Duration::from_millis(wait_ms.unsigned_abs());
        if let Some(until) = until {
            wake_at = wake_at.min(until);
        }
        sleep_until(wake_at);
    }

    runtime.close().context("failed to record end of visit")?;
    Ok(())
}

fn sleep_until(deadline: Instant) {
    let now = Instant::now();
    if now < deadline {
        thread::sleep(deadline.saturating_duration_since(now));
    }
}

#[cfg(test)]
pub(crate) mod testkit {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::Services;
    use crate::alerts::RecordingAlerts;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStore;

    pub struct Harness {
        pub clock: Rc<ManualClock>,
        pub storage: Rc<RefCell<MemoryStore>>,
        pub alerts: Rc<RefCell<RecordingAlerts>>,
    }

    impl Harness {
        pub fn new(now_ms: i64) -> Self {
            Self {
                clock: Rc::new(ManualClock::new(now_ms)),
                storage: Rc::new(RefCell::new(MemoryStore::new())),
                alerts: Rc::new(RefCell::new(RecordingAlerts::default())),
            }
        }

        pub fn services(&self) -> Services {
            Services {
                clock: self.clock.clone(),
                storage: self.storage.clone(),
                alerts: self.alerts.clone(),
            }
        }
    }
}
