//! Container runtime driver
//!
//! Translates container lifecycle intents into invocations of an external
//! container runtime and returns structured results. A driver keeps no state
//! beyond how to reach the runtime; it never retries on its own.
//!
//! - `cli`: drives a docker-compatible CLI (`docker`, `podman`)
//! - `command`: argument list builder with secret redaction

mod cli;
mod command;
#[cfg(test)]
pub mod fake;

pub use cli::{CliDriverSettings, CliRuntimeDriver};
pub use command::RuntimeCommand;

use async_trait::async_trait;
use berth_core::domain::container::ContainerInstance;
use berth_core::domain::process::{ContainerExit, ProcStart};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors raised while talking to the container runtime
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime process could not be launched at all
    #[error("Container runtime unavailable, failed to launch '{command}': {source}")]
    Unavailable {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The runtime exited with a non-zero status
    #[error("'{command}' failed with exit code {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// A bounded command did not complete in time
    #[error("'{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// Streaming data to or from the runtime process failed
    #[error("I/O error while running '{command}': {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Driver for one container runtime endpoint
///
/// All operations complete when the underlying runtime command has exited (or
/// its output stream has been fully consumed).
#[async_trait]
pub trait RuntimeDriver: Send + Sync {
    /// Checks whether a container exists
    ///
    /// Any non-zero exit of the inspect command reads as "does not exist"; only
    /// a runtime that cannot be launched at all is reported as an error.
    async fn exists(&self, container_id: &str) -> Result<bool>;

    /// Checks whether an image is present in the local image store
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Pulls an image from its registry
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Creates the interactive remoting container running the agent
    async fn create_remoting_container(&self, image: &str) -> Result<ContainerInstance>;

    /// Creates a side container sharing the remoting container's namespaces
    async fn create_side_container(
        &self,
        image: &str,
        remoting_container_id: &str,
    ) -> Result<ContainerInstance>;

    /// Creates a build container running `proc` in the remoting container's
    /// network namespace, with its volumes mounted
    async fn create_build_container(
        &self,
        image: &str,
        remoting_container_id: &str,
        proc: &ProcStart,
    ) -> Result<ContainerInstance>;

    /// Starts a container detached and returns the runtime's exit status
    async fn start(&self, container_id: &str) -> Result<i32>;

    /// Starts a container attached and waits for its main process to exit
    ///
    /// The container's output is copied into `output` while it runs.
    async fn start_attached(
        &self,
        container_id: &str,
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<ContainerExit>;

    /// Starts a container with stdin and stdout attached
    ///
    /// The returned process stays alive as long as the container's main
    /// process runs; its stdio is the container's stdio.
    async fn start_interactive_attached(&self, container_id: &str) -> Result<AttachedProcess>;

    /// Streams a tar archive into a container's filesystem at `path`
    async fn copy_in(
        &self,
        container_id: &str,
        path: &str,
        archive: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<()>;

    /// Streams `path` out of a container as a tar archive, returning the
    /// number of bytes written to `sink`
    async fn copy_out(
        &self,
        container_id: &str,
        path: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64>;

    /// Removes a container and returns the runtime's exit status
    async fn remove(&self, container_id: &str) -> Result<i32>;

    /// Releases anything held for the runtime endpoint
    async fn close(&self) {}
}

/// A container started with stdin and stdout attached
pub struct AttachedProcess {
    pub container_id: String,
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    child: Option<Child>,
}

impl AttachedProcess {
    /// Wraps a spawned runtime process whose stdin and stdout are piped
    pub fn from_child(container_id: impl Into<String>, mut child: Child) -> std::io::Result<Self> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("attached process has no stdin pipe"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("attached process has no stdout pipe"))?;

        Ok(Self {
            container_id: container_id.into(),
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            child: Some(child),
        })
    }

    /// Wraps already connected streams with no process behind them
    #[cfg(test)]
    pub fn from_streams(
        container_id: impl Into<String>,
        stdin: Box<dyn AsyncWrite + Send + Unpin>,
        stdout: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Self {
        Self {
            container_id: container_id.into(),
            stdin,
            stdout,
            child: None,
        }
    }

    /// Splits off the streams, keeping the process handle for `wait`
    pub fn into_parts(
        self,
    ) -> (
        Box<dyn AsyncWrite + Send + Unpin>,
        Box<dyn AsyncRead + Send + Unpin>,
        AttachedExit,
    ) {
        (
            self.stdin,
            self.stdout,
            AttachedExit {
                container_id: self.container_id,
                child: self.child,
            },
        )
    }
}

/// Process half of an `AttachedProcess` once its streams were taken
pub struct AttachedExit {
    pub container_id: String,
    child: Option<Child>,
}

impl AttachedExit {
    /// Waits for the attached runtime process to exit
    pub async fn wait(&mut self) -> std::io::Result<i32> {
        match self.child.as_mut() {
            Some(child) => Ok(child.wait().await?.code().unwrap_or(-1)),
            None => Ok(0),
        }
    }
}
