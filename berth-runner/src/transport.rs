//! Control-channel transport
//!
//! The remoting container's stdio is the build's control channel. Once the
//! container is started attached, the process handle is handed to a
//! `ChannelTransport`, which owns it for the rest of the build.

use anyhow::Result;
use async_trait::async_trait;
use berth_core::domain::container::short_id;
use std::sync::{Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncWrite, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::driver::AttachedProcess;

/// Receiver of the attached remoting process
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Takes ownership of the attached process and starts using it
    async fn connect(&self, process: AttachedProcess) -> Result<()>;
}

/// What the channel saw by the time it was closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSummary {
    pub lines: usize,
    pub exit_code: i32,
}

struct Connection {
    stdin: Box<dyn AsyncWrite + Send + Unpin>,
    reader: JoinHandle<ChannelSummary>,
}

/// Transport keeping the agent's stdin open and forwarding its output to the log
#[derive(Default)]
pub struct StdioChannel {
    connection: Mutex<Option<Connection>>,
}

impl StdioChannel {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Closes the agent's stdin and waits for the attached process to exit
    ///
    /// Returns `None` if the channel was never connected.
    pub async fn disconnect(&self) -> Option<ChannelSummary> {
        let connection = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;

        // EOF on stdin ends the agent
        drop(connection.stdin);

        match connection.reader.await {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!("Control channel reader failed: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl ChannelTransport for StdioChannel {
    async fn connect(&self, process: AttachedProcess) -> Result<()> {
        let mut slot = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            anyhow::bail!("Control channel is already connected");
        }

        let (stdin, stdout, mut exit) = process.into_parts();
        let container = short_id(&exit.container_id).to_string();
        info!("Control channel connected to remoting container {}", container);

        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut count = 0;

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        count += 1;
                        debug!("[agent {}] {}", container, line);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Control channel read error for {}: {}", container, e);
                        break;
                    }
                }
            }

            let exit_code = match exit.wait().await {
                Ok(code) => code,
                Err(e) => {
                    warn!("Failed to wait for remoting container {}: {}", container, e);
                    -1
                }
            };
            info!(
                "Control channel to {} closed (exit code {})",
                container, exit_code
            );

            ChannelSummary {
                lines: count,
                exit_code,
            }
        });

        *slot = Some(Connection { stdin, reader });
        Ok(())
    }
}
