//! Connector backed by an external protocol bridge process.
//!
//! Each connection spawns the configured bridge and talks to it over
//! JSON Lines on stdio. Message-retrieval requests from the bridge are
//! answered here from the message cache and never reach the supervisor.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use linkkeeper_protocol::{
    BridgeEvent, ConnectionCommand, ConnectionEvent, DisconnectReason, Failure, RetrieveRequest,
};

use crate::cache::MessageCache;
use crate::config::ConnectorConfig;

use super::{CHANNEL_CAPACITY, ConnectError, ConnectRequest, Connection, Connector};

/// How long a bridge gets to exit on its own before it is killed.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Spawns one bridge process per connection.
#[derive(Debug, Clone)]
pub struct SubprocessConnector {
    config: ConnectorConfig,
}

impl SubprocessConnector {
    pub fn new(config: ConnectorConfig) -> Self {
        Self { config }
    }

    fn spawn_child(&self) -> std::io::Result<Child> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        // On Linux, make sure the bridge dies with us
        #[cfg(target_os = "linux")]
        unsafe {
            cmd.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        cmd.spawn()
    }
}

#[async_trait]
impl Connector for SubprocessConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<Connection, ConnectError> {
        if self.config.command.is_empty() {
            return Err(ConnectError::Rejected(
                "no bridge command configured".to_string(),
            ));
        }

        info!(
            session_id = %request.session_id,
            command = %self.config.command,
            "Spawning protocol bridge"
        );
        let mut child = self.spawn_child().map_err(ConnectError::Spawn)?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(ConnectError::Spawn(std::io::Error::other(
                "bridge stdio is not piped",
            )));
        };

        let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (evt_tx, evt_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let start = ConnectionCommand::Start {
            session_id: request.session_id.clone(),
            credentials: request.credentials.map(|c| c.into_value()),
            options: request.options,
        };
        let bridge = Bridge {
            session_id: request.session_id,
            messages: request.messages,
            stdin,
            evt_tx,
        };
        tokio::spawn(bridge.run(child, stdout, start, cmd_rx));

        Ok(Connection {
            commands: cmd_tx,
            events: evt_rx,
        })
    }
}

// ============================================================================
// Bridge I/O
// ============================================================================

struct Bridge {
    session_id: String,
    messages: MessageCache,
    stdin: ChildStdin,
    evt_tx: mpsc::Sender<ConnectionEvent>,
}

impl Bridge {
    async fn run(
        mut self,
        mut child: Child,
        stdout: ChildStdout,
        start: ConnectionCommand,
        mut cmd_rx: mpsc::Receiver<ConnectionCommand>,
    ) {
        let mut lines = BufReader::new(stdout).lines();
        let mut closed = false;

        if let Err(e) = self.write(&start).await {
            error!(session_id = %self.session_id, error = %e, "Failed to start protocol bridge");
        } else {
            loop {
                tokio::select! {
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(line)) => {
                                match self.handle_line(&line).await {
                                    LineOutcome::Continue => {}
                                    LineOutcome::Closed => {
                                        closed = true;
                                        break;
                                    }
                                    LineOutcome::Stop => break,
                                }
                            }
                            Ok(None) => {
                                debug!(session_id = %self.session_id, "Bridge stdout closed");
                                break;
                            }
                            Err(e) => {
                                error!(session_id = %self.session_id, error = %e, "Error reading bridge stdout");
                                break;
                            }
                        }
                    }

                    cmd = cmd_rx.recv() => {
                        match cmd {
                            Some(command) => {
                                if let Err(e) = self.write(&command).await {
                                    error!(session_id = %self.session_id, error = %e, "Failed to write to bridge stdin");
                                    break;
                                }
                            }
                            None => {
                                debug!(session_id = %self.session_id, "Command channel closed");
                                break;
                            }
                        }
                    }
                }
            }
        }

        if !closed {
            let failure = Failure::protocol(DisconnectReason::ConnectionLost)
                .with_message("protocol bridge stopped without a close event");
            let _ = self.evt_tx.send(ConnectionEvent::Close { failure }).await;
        }

        drop(self.stdin);
        match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                info!(session_id = %self.session_id, status = %status, "Protocol bridge exited");
            }
            Ok(Err(e)) => {
                error!(session_id = %self.session_id, error = %e, "Error waiting for protocol bridge");
            }
            Err(_) => {
                warn!(session_id = %self.session_id, "Protocol bridge did not exit, killing it");
                let _ = child.kill().await;
            }
        }
    }

    async fn handle_line(&mut self, line: &str) -> LineOutcome {
        let line = line.trim();
        if line.is_empty() {
            return LineOutcome::Continue;
        }

        let event = match serde_json::from_str::<BridgeEvent>(line) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    session_id = %self.session_id,
                    line = %line,
                    error = %e,
                    "Failed to parse bridge event"
                );
                return LineOutcome::Continue;
            }
        };

        match event.into_connection_event() {
            Ok(event) => {
                let is_close = matches!(event, ConnectionEvent::Close { .. });
                if self.evt_tx.send(event).await.is_err() {
                    debug!(session_id = %self.session_id, "Event channel closed");
                    return LineOutcome::Stop;
                }
                if is_close {
                    LineOutcome::Closed
                } else {
                    LineOutcome::Continue
                }
            }
            Err(request) => match self.answer_retrieval(request).await {
                Ok(()) => LineOutcome::Continue,
                Err(e) => {
                    error!(session_id = %self.session_id, error = %e, "Failed to answer message retrieval");
                    LineOutcome::Stop
                }
            },
        }
    }

    async fn answer_retrieval(&mut self, request: RetrieveRequest) -> std::io::Result<()> {
        let payload = self
            .messages
            .get_json::<serde_json::Value>(&request.message_id)
            .await;
        debug!(
            session_id = %self.session_id,
            message_id = %request.message_id,
            hit = payload.is_some(),
            "Answering message retrieval"
        );

        self.write(&ConnectionCommand::RetrieveResult {
            request_id: request.request_id,
            message_id: request.message_id,
            payload,
        })
        .await
    }

    async fn write(&mut self, command: &ConnectionCommand) -> std::io::Result<()> {
        let mut line = serde_json::to_string(command).map_err(std::io::Error::other)?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await
    }
}

enum LineOutcome {
    Continue,
    /// The bridge reported a close; the event stream ends here.
    Closed,
    Stop,
}
