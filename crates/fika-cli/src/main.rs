use anyhow::Result;
use clap::{Parser, Subcommand};
use std::{env, fs, io, path::Path, process::Command, thread::sleep, time};
use sysinfo::{Pid, System};
use tabled::{Table, Tabled};

use fika_core::{
    config::get_data_dir,
    ipc::{IpcClient, IpcRequest, IpcResponse, SiteStatus},
    Daemon, DEFAULT_TICK_SECONDS,
};
use fika_storage::{Database, SessionKind, TimerState, TimerStatus, UserSettings};

#[derive(Parser)]
#[command(name = "fika")]
#[command(about = "Focus timer and site budget daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the background daemon
    Start,
    /// (Internal) Run the daemon process
    #[command(hide = true)]
    DaemonInternalStart,
    /// Stop the background daemon
    Stop,
    /// Show daemon, timer, and site budget status
    Status,
    /// Focus/break timer commands
    Timer {
        #[command(subcommand)]
        action: TimerAction,
    },
    /// Tracked-site budget commands
    Site {
        #[command(subcommand)]
        action: SiteAction,
    },
    /// Settings commands
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Subcommand, Debug)]
enum TimerAction {
    /// Start a session (focus by default)
    Start {
        /// Session length in minutes (defaults to the configured duration)
        #[arg(short, long)]
        minutes: Option<u32>,
        /// Session kind: focus, short-break, or long-break
        #[arg(short, long)]
        kind: Option<SessionKind>,
    },
    /// Stop the current session
    Stop,
}

#[derive(Subcommand, Debug)]
enum SiteAction {
    /// Start tracking a domain with a daily minute budget
    Add {
        /// Domain to track (e.g. reddit.com)
        domain: String,
        /// Daily limit in minutes
        minutes: i64,
    },
    /// Change the daily limit of an already-tracked domain
    Limit {
        /// Tracked domain
        domain: String,
        /// New daily limit in minutes
        minutes: i64,
    },
    /// List tracked domains and today's usage
    List,
}

#[derive(Subcommand, Debug)]
enum SettingsAction {
    /// Show all settings
    Show,
    /// Set a settings value (e.g. `fika settings set focus_duration 50`)
    Set {
        /// One of: daily_reset_hour, sound_enabled, focus_duration,
        /// short_break_duration, long_break_duration, auto_start_focus
        key: String,
        value: String,
    },
}

#[derive(Tabled)]
struct SiteRow {
    #[tabled(rename = "Domain")]
    domain: String,
    #[tabled(rename = "Used (min)")]
    used: u32,
    #[tabled(rename = "Limit (min)")]
    limit: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if !matches!(cli.command, Commands::DaemonInternalStart) {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_secs()
            .init();
    }

    let data_dir = get_data_dir()?;

    match cli.command {
        Commands::Start => start_daemon(&data_dir),
        Commands::DaemonInternalStart => run_daemon_process().await,
        Commands::Stop => stop_daemon(&data_dir).await,
        Commands::Status => show_status(&data_dir).await,
        Commands::Timer { action } => handle_timer(&data_dir, action).await,
        Commands::Site { action } => handle_site(&data_dir, action).await,
        Commands::Settings { action } => handle_settings(&data_dir, action).await,
    }
}

async fn send(data_dir: &Path, request: IpcRequest) -> Result<IpcResponse> {
    let sock_path = data_dir.join("fika.sock");
    if !sock_path.exists() {
        anyhow::bail!("Daemon is not running. Start it with: fika start");
    }
    IpcClient::new(&sock_path).send_command(request).await
}

fn print_outcome(response: &IpcResponse, done: &str) {
    match response {
        IpcResponse::Ack => println!("{done}"),
        IpcResponse::Rejected { reason } => println!("Rejected: {reason}"),
        other => println!("Unexpected response from daemon: {other:?}"),
    }
}

async fn handle_timer(data_dir: &Path, action: TimerAction) -> Result<()> {
    match action {
        TimerAction::Start { minutes, kind } => {
            let response = send(
                data_dir,
                IpcRequest::StartTimer {
                    duration: minutes,
                    kind,
                },
            )
            .await?;
            print_outcome(&response, "Timer started.");
        }
        TimerAction::Stop => {
            let response = send(data_dir, IpcRequest::StopTimer).await?;
            print_outcome(&response, "Timer stopped.");
        }
    }
    Ok(())
}

async fn handle_site(data_dir: &Path, action: SiteAction) -> Result<()> {
    match action {
        SiteAction::Add { domain, minutes } => {
            let response = send(
                data_dir,
                IpcRequest::AddSite {
                    domain: domain.clone(),
                    daily_limit_minutes: minutes,
                },
            )
            .await?;
            print_outcome(&response, &format!("Tracking {domain} ({minutes}m/day)."));
        }
        SiteAction::Limit { domain, minutes } => {
            let response = send(
                data_dir,
                IpcRequest::SetSiteLimit {
                    domain: domain.clone(),
                    daily_limit_minutes: minutes,
                },
            )
            .await?;
            print_outcome(&response, &format!("Limit for {domain} set to {minutes}m."));
        }
        SiteAction::List => {
            let response = send(data_dir, IpcRequest::Status).await?;
            match response {
                IpcResponse::Status { sites, .. } => print_sites(&sites),
                other => println!("Unexpected response from daemon: {other:?}"),
            }
        }
    }
    Ok(())
}

async fn handle_settings(data_dir: &Path, action: SettingsAction) -> Result<()> {
    match action {
        SettingsAction::Show => {
            let response = send(data_dir, IpcRequest::Status).await?;
            match response {
                IpcResponse::Status { settings, .. } => print_settings(&settings),
                other => println!("Unexpected response from daemon: {other:?}"),
            }
        }
        SettingsAction::Set { key, value } => {
            let response = send(data_dir, IpcRequest::Status).await?;
            let IpcResponse::Status { mut settings, .. } = response else {
                anyhow::bail!("Unexpected response from daemon");
            };

            apply_setting(&mut settings, &key, &value)?;

            let response = send(data_dir, IpcRequest::UpdateSettings { settings }).await?;
            print_outcome(&response, &format!("Set {key} = {value}"));
        }
    }
    Ok(())
}

fn apply_setting(settings: &mut UserSettings, key: &str, value: &str) -> Result<()> {
    match key {
        "daily_reset_hour" => {
            let hour: u8 = value.parse().map_err(|_| anyhow::anyhow!("Invalid hour"))?;
            if hour > 23 {
                anyhow::bail!("Hour must be between 0 and 23");
            }
            settings.daily_reset_hour = hour;
        }
        "sound_enabled" => settings.sound_enabled = parse_bool(value)?,
        "auto_start_focus" => settings.auto_start_focus = parse_bool(value)?,
        "focus_duration" => settings.focus_duration = parse_minutes(value)?,
        "short_break_duration" => settings.short_break_duration = parse_minutes(value)?,
        "long_break_duration" => settings.long_break_duration = parse_minutes(value)?,
        _ => anyhow::bail!(
            "Unknown key: {key}. Valid keys: daily_reset_hour, sound_enabled, \
             focus_duration, short_break_duration, long_break_duration, auto_start_focus"
        ),
    }
    Ok(())
}

fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => anyhow::bail!("Expected true or false"),
    }
}

fn parse_minutes(value: &str) -> Result<u32> {
    let minutes: u32 = value
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid number of minutes"))?;
    if minutes == 0 {
        anyhow::bail!("Minutes must be positive");
    }
    Ok(minutes)
}

fn print_settings(settings: &UserSettings) {
    println!("Settings");
    println!("\u{2550}\u{2550}\u{2550}\u{2550}\u{2550}\u{2550}\u{2550}\u{2550}\u{2550}\u{2550}\u{2550}\u{2550}\u{2550}\u{2550}");
    println!("  daily_reset_hour = {}", settings.daily_reset_hour);
    println!("  sound_enabled = {}", settings.sound_enabled);
    println!("  focus_duration = {}m", settings.focus_duration);
    println!("  short_break_duration = {}m", settings.short_break_duration);
    println!("  long_break_duration = {}m", settings.long_break_duration);
    println!("  auto_start_focus = {}", settings.auto_start_focus);
}

fn print_sites(sites: &[SiteStatus]) {
    if sites.is_empty() {
        println!("No tracked sites yet. Add one with: fika site add <domain> <minutes>");
        return;
    }

    let rows: Vec<SiteRow> = sites
        .iter()
        .map(|site| SiteRow {
            domain: site.domain.clone(),
            used: site.minutes_used_today,
            limit: site.daily_limit_minutes,
        })
        .collect();

    println!("{}", Table::new(rows));
}

fn describe_timer(timer: &TimerState, remaining_seconds: Option<i64>) -> String {
    let label = match timer.status {
        TimerStatus::Idle => return "idle".to_string(),
        TimerStatus::Focus => "focus",
        TimerStatus::ShortBreak => "short break",
        TimerStatus::LongBreak => "long break",
    };

    let remaining = remaining_seconds.unwrap_or(0);
    format!(
        "{label}, {:02}:{:02} remaining",
        remaining / 60,
        remaining % 60
    )
}

async fn show_status(data_dir: &Path) -> Result<()> {
    let sock_path = data_dir.join("fika.sock");

    if !sock_path.exists() {
        println!("Daemon Status: Not running");
        return Ok(());
    }

    let client = IpcClient::new(&sock_path);
    match client.send_command(IpcRequest::Status).await {
        Ok(IpcResponse::Status {
            running,
            timer,
            remaining_seconds,
            sites,
            ..
        }) => {
            println!(
                "Daemon Status: {}",
                if running { "Running" } else { "Stopped" }
            );
            println!("\nTimer: {}", describe_timer(&timer, remaining_seconds));
            println!("Pomodoros completed: {}", timer.pomodoros_completed);

            println!("\nTracked sites:");
            print_sites(&sites);
        }
        Ok(_) => anyhow::bail!("Unexpected response from daemon"),
        Err(e) => {
            log::error!("Failed to get status: {e}");
            println!("Daemon Status: Not running (or not responding)");
        }
    }
    Ok(())
}

fn start_daemon(data_dir: &Path) -> Result<()> {
    let pid_file_path = data_dir.join("fika.pid");
    let sock_path = data_dir.join("fika.sock");

    // 1. Check if daemon is already running
    if pid_file_path.exists() {
        if let Ok(pid_str) = fs::read_to_string(&pid_file_path) {
            if let Ok(pid) = pid_str.trim().parse::<usize>() {
                let mut sys = System::new();
                if sys.refresh_process(Pid::from(pid)) {
                    log::info!("Daemon is already running (PID: {pid}).");
                    return Ok(());
                }
            }
        }
        // If pid file is stale, remove it
        log::warn!("Removing stale PID file.");
        let _ = fs::remove_file(&pid_file_path);
    }

    // 2. Clean up old socket if it exists
    if sock_path.exists() {
        log::warn!("Removing stale socket file.");
        fs::remove_file(&sock_path)?;
    }

    log::info!("Starting fika daemon...");

    // 3. Spawn a new process for the daemon
    let current_exe = env::current_exe()?;
    let current_dir = env::current_dir()?;
    let child = Command::new(current_exe)
        .arg("daemon-internal-start")
        .current_dir(current_dir)
        .spawn()?;

    // 4. In parent process, write PID and exit
    log::info!("Daemon process started with PID: {}", child.id());
    fs::write(&pid_file_path, child.id().to_string())?;

    Ok(())
}

async fn run_daemon_process() -> Result<()> {
    // This is the detached daemon process; it needs its own logging.
    if let Err(e) = setup_daemon_logging() {
        // If logging fails, we have no way to report errors. Panicking is the only option.
        panic!("Failed to set up daemon logging: {e}");
    }
    log::info!("Daemon process started internally.");

    if let Err(e) = daemon_main_logic().await {
        log::error!("Daemon main logic exited with a fatal error: {e:#}");
        return Err(e);
    }

    Ok(())
}

async fn daemon_main_logic() -> Result<()> {
    let db = Database::new(None)?;
    let mut daemon = Daemon::new(db, DEFAULT_TICK_SECONDS)?;
    daemon.run_with_signals().await
}

async fn stop_daemon(data_dir: &Path) -> Result<()> {
    let pid_file_path = data_dir.join("fika.pid");
    let sock_path = data_dir.join("fika.sock");

    if !pid_file_path.exists() {
        log::info!("Daemon is not running (no PID file).");
        if sock_path.exists() {
            fs::remove_file(&sock_path)?;
        }
        return Ok(());
    }

    let pid_str = fs::read_to_string(&pid_file_path)?;
    let pid = pid_str
        .trim()
        .parse::<usize>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    log::info!("Stopping fika daemon (PID: {pid})...");
    let client = IpcClient::new(&sock_path);

    match client.send_command(IpcRequest::Shutdown).await {
        Ok(IpcResponse::Shutdown) => {
            log::info!("Daemon shutdown signal sent. Waiting for process to exit...");
            sleep(time::Duration::from_secs(2));

            let mut sys = System::new();
            if sys.refresh_process(Pid::from(pid)) {
                log::warn!("Daemon did not stop gracefully. Force killing...");
                if let Some(process) = sys.process(Pid::from(pid)) {
                    process.kill();
                }
            } else {
                log::info!("Daemon stopped successfully.");
            }
        }
        Ok(resp) => log::error!("Received unexpected response from daemon: {resp:?}"),
        Err(e) => {
            log::error!("Failed to send shutdown command: {e}. Forcing cleanup.");
            let mut sys = System::new();
            if sys.refresh_process(Pid::from(pid)) {
                if let Some(process) = sys.process(Pid::from(pid)) {
                    process.kill();
                    log::info!("Process killed.");
                }
            }
        }
    }

    // Cleanup
    fs::remove_file(&pid_file_path)?;
    if sock_path.exists() {
        fs::remove_file(&sock_path)?;
    }

    Ok(())
}

fn setup_daemon_logging() -> Result<()> {
    use std::fs::{create_dir_all, OpenOptions};

    let log_path = get_data_dir()?.join("fika.log");

    if let Some(parent) = log_path.parent() {
        create_dir_all(parent)?;
    }

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .filter_level(log::LevelFilter::Info)
        .init();

    Ok(())
}
