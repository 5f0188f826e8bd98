use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, Instant};

use fika_storage::{local_date_string, Database, TimerState};

use crate::audio::ChimePlayer;
use crate::config::get_data_dir;
use crate::controller::Controller;
use crate::error::CommandError;
use crate::ipc::{self, IpcCommand, IpcRequest, IpcResponse, SiteStatus};
use crate::signals::PendingSignals;

/// Budget accrual granularity: one tick charges one minute.
pub const DEFAULT_TICK_SECONDS: u64 = 60;

/// The background coordinator. Owns the controller and consumes all triggers
/// (periodic tick, one-shot expiry, IPC commands, ctrl-c) from a single
/// `select!` loop, so no two controller operations ever interleave.
pub struct Daemon {
    controller: Controller,
    signals: Arc<PendingSignals>,
    commands_tx: mpsc::Sender<IpcCommand>,
    commands_rx: mpsc::Receiver<IpcCommand>,
    /// Last page announced by the page companion; charged at tick time.
    current_page: Option<String>,
    /// Replaceable one-shot expiry deadline. Replacing or clearing it is how
    /// a new session or a stop "cancels" the previous trigger.
    expiry_deadline: Option<Instant>,
    shutdown: bool,
    tick_interval_seconds: u64,
}

impl Daemon {
    /// # Errors
    ///
    /// Returns an error if first-run defaults cannot be written.
    pub fn new(db: Database, tick_interval_seconds: u64) -> Result<Self> {
        db.ensure_defaults()?;

        let signals = Arc::new(PendingSignals::new());
        let controller = Controller::new(db, signals.clone(), Arc::new(ChimePlayer::new()));
        let (commands_tx, commands_rx) = mpsc::channel(32);

        Ok(Self {
            controller,
            signals,
            commands_tx,
            commands_rx,
            current_page: None,
            expiry_deadline: None,
            shutdown: false,
            tick_interval_seconds,
        })
    }

    /// Run until shutdown is requested over IPC or ctrl-c.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory cannot be resolved or initial
    /// state cannot be read.
    pub async fn run_with_signals(&mut self) -> Result<()> {
        let sock_path = get_data_dir()?.join("fika.sock");
        let commands = self.commands_tx.clone();

        tokio::spawn(async move {
            if let Err(e) = ipc::listen(commands, &sock_path).await {
                log::error!("IPC listener failed: {e}");
            }
        });

        // A session persisted by a previous run still has to expire; an
        // already-passed end fires on the first loop turn.
        let state = self.controller.timer_state()?;
        if state.is_running() {
            self.arm_from(&state);
            log::info!("Re-armed expiry from persisted session");
        }

        let mut ticker = interval(Duration::from_secs(self.tick_interval_seconds));
        log::info!("Daemon started with signal handling and IPC");

        loop {
            let deadline = self.expiry_deadline;

            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick() {
                        log::error!("Daemon tick failed: {e}");
                    }
                }
                () = maybe_sleep(deadline), if deadline.is_some() => {
                    self.expiry_deadline = None;
                    if let Err(e) = self.handle_expiry() {
                        log::error!("Expiry handling failed: {e}");
                    }
                }
                Some(command) = self.commands_rx.recv() => {
                    self.handle_command(command);
                }
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Received Ctrl-C, shutting down...");
                    self.shutdown = true;
                }
            }

            if self.shutdown {
                break;
            }
        }

        log::info!("Daemon shut down gracefully.");
        Ok(())
    }

    fn tick(&self) -> Result<()> {
        let today = local_date_string();
        self.controller.reset_expired_budgets(&today)?;

        if let Some(url) = self.current_page.as_deref() {
            self.controller.track_active_page(url)?;
        }
        Ok(())
    }

    fn handle_expiry(&mut self) -> Result<()> {
        let state = self.controller.on_expiry(Utc::now())?;
        self.arm_from(&state);
        Ok(())
    }

    fn handle_command(&mut self, command: IpcCommand) {
        let IpcCommand { request, reply } = command;

        let response = match request {
            IpcRequest::Status => self.status_response(),
            IpcRequest::Shutdown => {
                self.shutdown = true;
                IpcResponse::Shutdown
            }
            IpcRequest::StartTimer { duration, kind } => {
                match self.controller.start_timer(duration, kind, Utc::now()) {
                    Ok(state) => {
                        self.arm_from(&state);
                        IpcResponse::Ack
                    }
                    Err(e) => rejection(&e),
                }
            }
            IpcRequest::StopTimer => match self.controller.stop_timer() {
                Ok(_) => {
                    self.expiry_deadline = None;
                    IpcResponse::Ack
                }
                Err(e) => rejection(&e),
            },
            IpcRequest::AddSite {
                domain,
                daily_limit_minutes,
            } => command_response(self.controller.add_site(
                &domain,
                daily_limit_minutes,
                &local_date_string(),
                Utc::now(),
            )),
            IpcRequest::SetSiteLimit {
                domain,
                daily_limit_minutes,
            } => command_response(self.controller.set_site_limit(&domain, daily_limit_minutes)),
            IpcRequest::UpdateSettings { settings } => {
                command_response(self.controller.update_settings(&settings))
            }
            IpcRequest::ReportPage { url } => {
                self.current_page = if url.is_empty() { None } else { Some(url) };
                IpcResponse::Ack
            }
            IpcRequest::PollSignal { domain } => IpcResponse::Signal {
                signal: self.signals.take(&domain),
            },
        };

        if reply.send(response).is_err() {
            log::debug!("IPC caller went away before the reply");
        }
    }

    fn status_response(&self) -> IpcResponse {
        match self.build_status() {
            Ok(response) => response,
            Err(e) => {
                log::error!("Status read failed: {e:#}");
                IpcResponse::Rejected {
                    reason: "internal error".to_string(),
                }
            }
        }
    }

    fn build_status(&self) -> Result<IpcResponse> {
        let timer = self.controller.timer_state()?;
        let settings = self.controller.settings()?;

        let mut sites: Vec<SiteStatus> = self
            .controller
            .sites()?
            .into_iter()
            .map(|(domain, usage)| SiteStatus {
                domain,
                minutes_used_today: usage.minutes_used_today,
                daily_limit_minutes: usage.daily_limit_minutes,
            })
            .collect();
        sites.sort_by(|a, b| a.domain.cmp(&b.domain));

        let remaining_seconds = timer.remaining_seconds(Utc::now());

        Ok(IpcResponse::Status {
            running: true,
            timer,
            remaining_seconds,
            settings,
            sites,
        })
    }

    fn arm_from(&mut self, state: &TimerState) {
        self.expiry_deadline = state.end_timestamp.map(deadline_instant);
    }
}

async fn maybe_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn deadline_instant(end: DateTime<Utc>) -> Instant {
    // A persisted end in the past converts to "now": fire immediately.
    let delta = (end - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    Instant::now() + delta
}

fn rejection(e: &anyhow::Error) -> IpcResponse {
    match e.downcast_ref::<CommandError>() {
        Some(command_error) => IpcResponse::Rejected {
            reason: command_error.to_string(),
        },
        None => {
            log::error!("Command failed: {e:#}");
            IpcResponse::Rejected {
                reason: "internal error".to_string(),
            }
        }
    }
}

fn command_response(result: Result<()>) -> IpcResponse {
    match result {
        Ok(()) => IpcResponse::Ack,
        Err(e) => rejection(&e),
    }
}
