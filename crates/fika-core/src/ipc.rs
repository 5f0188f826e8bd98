use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixListener, UnixStream},
    sync::{mpsc, oneshot},
};

use fika_storage::{SessionKind, TimerState, UserSettings};

use crate::signals::PageSignal;

/// IPC request from the CLI or the page companion to the daemon.
#[derive(Serialize, Deserialize, Debug)]
pub enum IpcRequest {
    Status,
    Shutdown,
    StartTimer {
        duration: Option<u32>,
        kind: Option<SessionKind>,
    },
    StopTimer,
    AddSite {
        domain: String,
        daily_limit_minutes: i64,
    },
    SetSiteLimit {
        domain: String,
        daily_limit_minutes: i64,
    },
    UpdateSettings {
        settings: UserSettings,
    },
    /// The page companion announces the currently focused page; the next
    /// tick charges whichever page is current then.
    ReportPage {
        url: String,
    },
    /// The page companion retrieves (and clears) its pending directive.
    PollSignal {
        domain: String,
    },
}

/// Per-site usage as reported in `Status`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SiteStatus {
    pub domain: String,
    pub minutes_used_today: u32,
    pub daily_limit_minutes: u32,
}

/// IPC response from the daemon.
#[derive(Serialize, Deserialize, Debug)]
pub enum IpcResponse {
    Status {
        running: bool,
        timer: TimerState,
        remaining_seconds: Option<i64>,
        settings: UserSettings,
        sites: Vec<SiteStatus>,
    },
    Ack,
    /// The command carried invalid user input; nothing was changed.
    Rejected {
        reason: String,
    },
    Signal {
        signal: Option<PageSignal>,
    },
    Shutdown,
}

/// A decoded request paired with its reply slot, queued for the daemon's
/// single-consumer loop. IPC tasks never touch the store themselves.
pub struct IpcCommand {
    pub request: IpcRequest,
    pub reply: oneshot::Sender<IpcResponse>,
}

#[derive(Debug)]
pub struct IpcClient {
    sock_path: PathBuf,
}

impl IpcClient {
    #[must_use]
    pub fn new(sock_path: &Path) -> Self {
        Self {
            sock_path: sock_path.to_path_buf(),
        }
    }

    /// Send one request and wait for the daemon's response.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket is unreachable or the exchange fails
    /// to encode/decode.
    pub async fn send_command(&self, request: IpcRequest) -> Result<IpcResponse> {
        let mut stream = UnixStream::connect(&self.sock_path).await?;

        let encoded = bincode::serialize(&request)?;
        stream.write_all(&encoded).await?;
        stream.shutdown().await?;

        let mut buffer = Vec::new();
        stream.read_to_end(&mut buffer).await?;
        let response: IpcResponse = bincode::deserialize(&buffer)?;

        Ok(response)
    }
}

/// Accept connections and forward each decoded request into the daemon's
/// command queue, writing the loop's reply back to the caller.
///
/// # Errors
///
/// Returns an error if the socket cannot be bound.
pub async fn listen(commands: mpsc::Sender<IpcCommand>, sock_path: &Path) -> io::Result<()> {
    if sock_path.exists() {
        fs::remove_file(sock_path)?;
    }
    let listener = UnixListener::bind(sock_path)?;

    loop {
        match listener.accept().await {
            Ok((mut stream, _)) => {
                let commands = commands.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0; 4096];
                    match stream.read(&mut buf).await {
                        Ok(n) if n > 0 => match bincode::deserialize::<IpcRequest>(&buf[..n]) {
                            Ok(request) => {
                                if let Err(e) = dispatch(&commands, request, &mut stream).await {
                                    log::error!("IPC dispatch error: {e}");
                                }
                            }
                            Err(e) => {
                                log::error!("IPC deserialize error: {e}");
                            }
                        },
                        Ok(_) => {} // Connection closed
                        Err(e) => {
                            log::error!("IPC read error: {e}");
                        }
                    }
                });
            }
            Err(e) => {
                log::error!("IPC accept error: {e}");
            }
        }
    }
}

async fn dispatch(
    commands: &mpsc::Sender<IpcCommand>,
    request: IpcRequest,
    stream: &mut UnixStream,
) -> Result<()> {
    let (reply_tx, reply_rx) = oneshot::channel();
    commands
        .send(IpcCommand {
            request,
            reply: reply_tx,
        })
        .await
        .map_err(|_| anyhow::anyhow!("daemon command queue is closed"))?;

    let response = reply_rx
        .await
        .map_err(|_| anyhow::anyhow!("daemon dropped the reply"))?;

    let encoded = bincode::serialize(&response)?;
    stream.write_all(&encoded).await?;
    Ok(())
}
