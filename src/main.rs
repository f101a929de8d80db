use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use nocturne::alarm::model::{AlarmEdit, parse_alarm_time};
use nocturne::alarm::scheduler::DEFAULT_MAX_USER_ALARMS;
use nocturne::alerts::TerminalAlerts;
use nocturne::api::{ApiServer, ApiServerConfig, DEFAULT_API_PORT};
use nocturne::clock::select_clock;
use nocturne::render::{parse_duration, rang_ago_label, render_status};
use nocturne::runtime::{
    Limits, OpenReport, RunOptions, Runtime, Services, run_loop, spawn_stdin_commands,
};
use nocturne::storage::{FileStore, SharedStore};
use nocturne::timer::model::TimerEdit;
use nocturne::timer::store::DEFAULT_MAX_USER_TIMERS;

#[derive(Parser, Debug)]
#[command(
    name = "nocturne",
    version,
    about = "Countdown timers and daily alarms that survive being closed"
)]
struct Cli {
    #[arg(long, global = true, default_value = "nocturne.json")]
    data: PathBuf,

    #[arg(long, global = true, default_value_t = DEFAULT_MAX_USER_TIMERS)]
    max_timers: usize,

    #[arg(long, global = true, default_value_t = DEFAULT_MAX_USER_ALARMS)]
    max_alarms: usize,

    /// Pin the clock to a fixed epoch-millisecond instant.
    #[arg(long, global = true, hide = true)]
    now_ms: Option<i64>,

    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List timers and alarms.
    Status {
        #[arg(long)]
        json: bool,
    },
    #[command(subcommand)]
    Timer(TimerCommand),
    #[command(subcommand)]
    Alarm(AlarmCommand),
    /// Keep running: tick timers, ring alarms, serve the snapshot API.
    Run(RunArgs),
}

#[derive(Subcommand, Debug)]
enum TimerCommand {
    /// Create a countdown, e.g. `--duration 1h30m`.
    Add {
        #[arg(long)]
        title: String,
        #[arg(long, value_parser = parse_duration)]
        duration: u64,
        #[arg(long)]
        sound: Option<String>,
    },
    /// Create a timer counting down to a date; it starts immediately.
    AddDate {
        #[arg(long)]
        title: String,
        #[arg(long)]
        date: String,
        #[arg(long)]
        sound: Option<String>,
    },
    Start {
        id: String,
    },
    Pause {
        id: String,
    },
    Reset {
        id: String,
    },
    Dismiss {
        id: String,
    },
    Delete {
        id: String,
    },
    Pin {
        id: String,
    },
    Edit {
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long, value_parser = parse_duration)]
        duration: Option<u64>,
        #[arg(long)]
        date: Option<String>,
        #[arg(long)]
        sound: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum AlarmCommand {
    /// Create a daily alarm at `HH:MM` local time.
    Add {
        #[arg(long)]
        title: String,
        #[arg(long, value_parser = alarm_time_arg)]
        time: (u32, u32),
        #[arg(long)]
        sound: Option<String>,
    },
    Enable {
        id: String,
    },
    Disable {
        id: String,
    },
    Dismiss {
        id: String,
    },
    Delete {
        id: String,
    },
    Edit {
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long, value_parser = alarm_time_arg)]
        time: Option<(u32, u32)>,
        #[arg(long)]
        sound: Option<String>,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Stop on its own after this many seconds.
    #[arg(long)]
    for_secs: Option<u64>,

    #[arg(long, default_value_t = 15)]
    heartbeat_secs: u64,

    #[arg(long, default_value = "127.0.0.1")]
    api_bind: String,

    #[arg(long, default_value_t = DEFAULT_API_PORT)]
    api_port: u16,

    #[arg(long)]
    no_api: bool,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let store = FileStore::open(&cli.data)
        .with_context(|| format!("failed to open {}", cli.data.display()))?;
    debug!("using data file {}", store.path().display());
    let storage: SharedStore = Rc::new(RefCell::new(store));
    let services = Services {
        clock: select_clock(cli.now_ms),
        storage,
        alerts: Rc::new(RefCell::new(TerminalAlerts::new())),
    };
    let limits = Limits {
        max_user_timers: cli.max_timers,
        max_user_alarms: cli.max_alarms,
    };

    let (mut runtime, report) = Runtime::open(services, limits);
    let command = cli.command.unwrap_or(Command::Status { json: false });
    if !matches!(command, Command::Status { json: true }) {
        print_restoration(&report, runtime.now_ms());
    }

    let outcome = dispatch(&mut runtime, command);
    runtime.close().context("failed to record end of visit")?;
    outcome
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("nocturne={level}")));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn dispatch(runtime: &mut Runtime, command: Command) -> Result<()> {
    match command {
        Command::Status { json } => {
            let snapshot = runtime.snapshot();
            if json {
                println!("{}", serde_json::to_string(&snapshot)?);
            } else {
                print!("{}", render_status(&snapshot));
            }
        }
        Command::Timer(command) => dispatch_timer(runtime, command)?,
        Command::Alarm(command) => dispatch_alarm(runtime, command)?,
        Command::Run(args) => run_foreground(runtime, args)?,
    }
    Ok(())
}

fn dispatch_timer(runtime: &mut Runtime, command: TimerCommand) -> Result<()> {
    let timers = &mut runtime.timers;
    match command {
        TimerCommand::Add {
            title,
            duration,
            sound,
        } => println!("{}", timers.add_countdown(&title, duration, sound.as_deref())?),
        TimerCommand::AddDate { title, date, sound } => {
            println!("{}", timers.add_count_to_date(&title, &date, sound.as_deref())?)
        }
        TimerCommand::Start { id } => {
            timers.start(&id)?;
            println!("started {id}");
        }
        TimerCommand::Pause { id } => {
            timers.pause(&id)?;
            println!("paused {id}");
        }
        TimerCommand::Reset { id } => {
            timers.reset(&id)?;
            println!("reset {id}");
        }
        TimerCommand::Dismiss { id } => {
            let was_ringing = timers.dismiss_timer(&id)?;
            println!("{}", if was_ringing { "dismissed" } else { "not ringing" });
        }
        TimerCommand::Delete { id } => {
            timers.remove(&id)?;
            println!("deleted {id}");
        }
        TimerCommand::Pin { id } => {
            timers.set_pinned(&id)?;
            println!("pinned {id}");
        }
        TimerCommand::Edit {
            id,
            title,
            duration,
            date,
            sound,
        } => {
            timers.edit(
                &id,
                TimerEdit {
                    title,
                    sound,
                    duration_ms: duration,
                    target_date: date,
                },
            )?;
            println!("updated {id}");
        }
    }
    Ok(())
}

fn dispatch_alarm(runtime: &mut Runtime, command: AlarmCommand) -> Result<()> {
    let alarms = &mut runtime.alarms;
    match command {
        AlarmCommand::Add {
            title,
            time: (hour, minute),
            sound,
        } => println!("{}", alarms.add(&title, hour, minute, sound.as_deref())?),
        AlarmCommand::Enable { id } => {
            alarms.set_enabled(&id, true)?;
            println!("enabled {id}");
        }
        AlarmCommand::Disable { id } => {
            alarms.set_enabled(&id, false)?;
            println!("disabled {id}");
        }
        AlarmCommand::Dismiss { id } => {
            let was_ringing = alarms.dismiss_alarm(&id)?;
            println!("{}", if was_ringing { "dismissed" } else { "not ringing" });
        }
        AlarmCommand::Delete { id } => {
            alarms.remove(&id)?;
            println!("deleted {id}");
        }
        AlarmCommand::Edit {
            id,
            title,
            time,
            sound,
        } => {
            alarms.edit(&id, AlarmEdit { title, time, sound })?;
            println!("updated {id}");
        }
    }
    Ok(())
}

fn run_foreground(runtime: &mut Runtime, args: RunArgs) -> Result<()> {
    let api_server = if args.no_api {
        None
    } else {
        let server = ApiServer::start(
            ApiServerConfig {
                bind_addr: args.api_bind.clone(),
                port: args.api_port,
            },
            runtime.snapshot(),
        )
        .with_context(|| {
            format!(
                "failed to start local API at {}:{}",
                args.api_bind, args.api_port
            )
        })?;
        Some(server)
    };

    let options = RunOptions {
        run_for: args.for_secs.map(Duration::from_secs),
        commands: Some(spawn_stdin_commands()),
        api_state: api_server.as_ref().map(|server| Arc::clone(&server.state)),
    };
    runtime.set_heartbeat(Duration::from_secs(args.heartbeat_secs));
    run_loop(runtime, options)
}

fn print_restoration(report: &OpenReport, now_ms: i64) {
    for restored in &report.timers.restored {
        if let Some(rang_at) = restored.case.rang_at() {
            println!(
                "timer {} {}: {}",
                restored.id,
                restored.case.label(),
                rang_ago_label(rang_at, now_ms)
            );
        }
    }
    for (id, case) in &report.alarms.restored {
        println!("alarm {id} {}", rang_ago_label(case.rang_at(), now_ms));
    }
}

fn alarm_time_arg(input: &str) -> Result<(u32, u32), String> {
    parse_alarm_time(input).ok_or_else(|| format!("expected HH:MM (24-hour), got '{input}'"))
}
