//! CLI container runtime driver
//!
//! Drives any docker-compatible command line (`docker`, `podman`):
//! - Inspecting containers and images
//! - Creating remoting, side and build containers
//! - Starting containers detached, attached or interactively attached
//! - Streaming archives in and out with `cp`
//! - Removing containers

use async_trait::async_trait;
use berth_core::domain::container::{ContainerInstance, short_id};
use berth_core::domain::process::{ContainerExit, ProcStart};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tracing::{debug, info, warn};

use super::{AttachedProcess, Result, RuntimeCommand, RuntimeDriver, RuntimeError};

/// Settings for the CLI driver
#[derive(Debug, Clone)]
pub struct CliDriverSettings {
    /// Runtime binary (e.g., "docker" or "podman")
    pub binary: String,

    /// Runtime endpoint, exported to the binary as DOCKER_HOST/CONTAINER_HOST
    pub host: Option<String>,

    /// Upper bound for short commands (inspect, create, start, rm)
    pub command_timeout: Option<Duration>,

    /// `UID:GID` build containers run as
    pub build_user: String,

    /// Entry command of the remoting container
    pub remoting_command: Vec<String>,
}

/// Captured result of a runtime invocation
#[derive(Debug)]
struct CommandOutput {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

impl CommandOutput {
    fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runtime driver shelling out to a docker-compatible CLI
pub struct CliRuntimeDriver {
    settings: CliDriverSettings,
}

impl CliRuntimeDriver {
    pub fn new(settings: CliDriverSettings) -> Self {
        Self { settings }
    }

    /// Checks that the runtime binary can be launched and reports its version
    pub async fn check_available(&self) -> Result<String> {
        let output = self
            .run_checked(self.command().arg("--version"), self.settings.command_timeout)
            .await?;
        let version = output.stdout.trim().to_string();
        info!("Container runtime is available: {}", version);
        Ok(version)
    }

    fn command(&self) -> RuntimeCommand {
        RuntimeCommand::new(&self.settings.binary, self.settings.host.clone())
    }

    /// Runs a command to completion, capturing its output
    async fn run(&self, command: RuntimeCommand, timeout: Option<Duration>) -> Result<CommandOutput> {
        debug!("Running: {}", command);

        let mut process = command.to_command();
        process.stdout(Stdio::piped()).stderr(Stdio::piped());

        let child = process.spawn().map_err(|source| RuntimeError::Unavailable {
            command: command.to_string(),
            source,
        })?;

        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| RuntimeError::Timeout {
                    command: command.to_string(),
                    timeout: limit,
                })?,
            None => child.wait_with_output().await,
        }
        .map_err(|source| RuntimeError::Io {
            command: command.to_string(),
            source,
        })?;

        let output = CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };

        if !output.stdout.trim().is_empty() {
            debug!("{} stdout: {}", command.subcommand(), output.stdout.trim());
        }
        if !output.stderr.trim().is_empty() {
            debug!("{} stderr: {}", command.subcommand(), output.stderr.trim());
        }

        Ok(output)
    }

    /// Runs a command and turns a non-zero exit into `CommandFailed`
    async fn run_checked(
        &self,
        command: RuntimeCommand,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput> {
        let rendered = command.to_string();
        let output = self.run(command, timeout).await?;

        if !output.success() {
            return Err(RuntimeError::CommandFailed {
                command: rendered,
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        Ok(output)
    }

    /// Runs a create command and reads the new container's identifier
    async fn create(&self, command: RuntimeCommand, image: &str) -> Result<ContainerInstance> {
        let rendered = command.to_string();
        let output = self
            .run_checked(command, self.settings.command_timeout)
            .await?;

        let id = output.stdout.trim();
        if id.is_empty() {
            return Err(RuntimeError::CommandFailed {
                command: rendered,
                exit_code: output.exit_code,
                stderr: "runtime returned no container id".to_string(),
            });
        }

        info!("Created container {} from image {}", short_id(id), image);
        Ok(ContainerInstance::created(id, image))
    }

    /// Spawns a command whose output is streamed rather than captured
    ///
    /// stdout and stderr are piped, stdin only when `with_stdin` is set.
    fn spawn_streaming(command: &RuntimeCommand, with_stdin: bool) -> Result<Child> {
        debug!("Running: {}", command);

        let mut process = command.to_command();
        process.stdout(Stdio::piped()).stderr(Stdio::piped());
        if with_stdin {
            process.stdin(Stdio::piped());
        }

        process.spawn().map_err(|source| RuntimeError::Unavailable {
            command: command.to_string(),
            source,
        })
    }

    /// Arguments sharing the remoting container's network and volumes
    fn shared_namespace_args(remoting_container_id: &str) -> [String; 3] {
        [
            "--volumes-from".to_string(),
            remoting_container_id.to_string(),
            format!("--net=container:{}", remoting_container_id),
        ]
    }

    fn remoting_create_command(&self, image: &str) -> RuntimeCommand {
        let command = self
            .command()
            .args(["create", "--interactive"])
            // stdout is the control channel, the runtime must not capture it
            .arg("--log-driver=none");

        // The agent command replaces the image's own entrypoint
        match self.settings.remoting_command.split_first() {
            Some((entrypoint, args)) => command
                .args(["--entrypoint", entrypoint.as_str()])
                .arg(image)
                .args(args.iter().cloned()),
            None => command.arg(image),
        }
    }

    fn build_create_command(
        &self,
        image: &str,
        remoting_container_id: &str,
        proc: &ProcStart,
    ) -> RuntimeCommand {
        self.command()
            .args(["create", "--tty"])
            .args(["--workdir", proc.workdir.as_str()])
            .args(Self::shared_namespace_args(remoting_container_id))
            .args(["--user", self.settings.build_user.as_str()])
            .arg(image)
            .command_args(&proc.args)
    }

    /// Side containers are still running at teardown, hence `--force`
    fn remove_command(&self, container_id: &str) -> RuntimeCommand {
        self.command().args(["rm", "--force", container_id])
    }
}

#[async_trait]
impl RuntimeDriver for CliRuntimeDriver {
    async fn exists(&self, container_id: &str) -> Result<bool> {
        let command = self
            .command()
            .args(["inspect", "-f", "{{.Id}}", container_id]);
        let output = self.run(command, self.settings.command_timeout).await?;

        if !output.success() {
            debug!(
                "Container {} not found (inspect exit code {})",
                short_id(container_id),
                output.exit_code
            );
        }
        Ok(output.success())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        let command = self
            .command()
            .args(["inspect", "--type=image", "-f", "{{.Id}}", image]);
        let output = self.run(command, self.settings.command_timeout).await?;
        Ok(output.success())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!("Pulling image {}", image);
        self.run_checked(self.command().args(["pull", image]), None)
            .await?;
        Ok(())
    }

    async fn create_remoting_container(&self, image: &str) -> Result<ContainerInstance> {
        self.create(self.remoting_create_command(image), image).await
    }

    async fn create_side_container(
        &self,
        image: &str,
        remoting_container_id: &str,
    ) -> Result<ContainerInstance> {
        let command = self
            .command()
            .arg("create")
            .args(Self::shared_namespace_args(remoting_container_id))
            .arg(image);

        self.create(command, image).await
    }

    async fn create_build_container(
        &self,
        image: &str,
        remoting_container_id: &str,
        proc: &ProcStart,
    ) -> Result<ContainerInstance> {
        let command = self.build_create_command(image, remoting_container_id, proc);
        self.create(command, image).await
    }

    async fn start(&self, container_id: &str) -> Result<i32> {
        let output = self
            .run(
                self.command().args(["start", container_id]),
                self.settings.command_timeout,
            )
            .await?;
        Ok(output.exit_code)
    }

    async fn start_attached(
        &self,
        container_id: &str,
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<ContainerExit> {
        // Build steps may run for hours: no timeout here
        let command = self.command().args(["start", "--attach", container_id]);
        let rendered = command.to_string();
        let mut child = Self::spawn_streaming(&command, false)?;

        let io_error = |source| RuntimeError::Io {
            command: rendered.clone(),
            source,
        };

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| io_error(std::io::Error::other("start process has no stdout pipe")))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| io_error(std::io::Error::other("start process has no stderr pipe")))?;

        let mut errors = Vec::new();
        let (streamed, _) = tokio::join!(
            tokio::io::copy(&mut stdout, &mut *output),
            stderr.read_to_end(&mut errors)
        );
        let status = child.wait().await.map_err(io_error)?;
        let streamed = streamed.map_err(io_error)?;
        output.flush().await.map_err(io_error)?;

        let exit_code = status.code().unwrap_or(-1);
        if !errors.is_empty() {
            warn!(
                "start {} stderr: {}",
                short_id(container_id),
                String::from_utf8_lossy(&errors).trim()
            );
        }
        debug!(
            "Container {} exited with code {} after {} bytes of output",
            short_id(container_id),
            exit_code,
            streamed
        );

        Ok(ContainerExit { exit_code })
    }

    async fn start_interactive_attached(&self, container_id: &str) -> Result<AttachedProcess> {
        let command = self.command().args(["start", "-ia", container_id]);
        debug!("Running: {}", command);

        let mut process = command.to_command();
        process
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let child = process.spawn().map_err(|source| RuntimeError::Unavailable {
            command: command.to_string(),
            source,
        })?;

        AttachedProcess::from_child(container_id, child).map_err(|source| RuntimeError::Io {
            command: command.to_string(),
            source,
        })
    }

    async fn copy_in(
        &self,
        container_id: &str,
        path: &str,
        mut archive: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<()> {
        let command = self
            .command()
            .args(["cp".to_string(), "-".to_string(), format!("{}:{}", container_id, path)]);
        let rendered = command.to_string();
        let mut child = Self::spawn_streaming(&command, true)?;

        let io_error = |source| RuntimeError::Io {
            command: rendered.clone(),
            source,
        };

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| io_error(std::io::Error::other("cp process has no stdin pipe")))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| io_error(std::io::Error::other("cp process has no stdout pipe")))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| io_error(std::io::Error::other("cp process has no stderr pipe")))?;

        // Both output pipes are drained while the archive is written
        let mut messages = Vec::new();
        let mut errors = Vec::new();
        let (copied, _, _) = tokio::join!(
            async move {
                let copied = tokio::io::copy(&mut archive, &mut stdin).await;
                // EOF on stdin ends the archive
                drop(stdin);
                copied
            },
            stdout.read_to_end(&mut messages),
            stderr.read_to_end(&mut errors)
        );
        let status = child.wait().await.map_err(io_error)?;

        if !status.success() {
            return Err(RuntimeError::CommandFailed {
                command: rendered.clone(),
                exit_code: status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&errors).trim().to_string(),
            });
        }

        let bytes = copied.map_err(io_error)?;
        debug!(
            "Copied {} bytes into {}:{}",
            bytes,
            short_id(container_id),
            path
        );
        Ok(())
    }

    async fn copy_out(
        &self,
        container_id: &str,
        path: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64> {
        let command = self
            .command()
            .args(["cp".to_string(), format!("{}:{}", container_id, path), "-".to_string()]);
        let rendered = command.to_string();
        let mut child = Self::spawn_streaming(&command, false)?;

        let io_error = |source| RuntimeError::Io {
            command: rendered.clone(),
            source,
        };

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| io_error(std::io::Error::other("cp process has no stdout pipe")))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| io_error(std::io::Error::other("cp process has no stderr pipe")))?;

        let mut errors = Vec::new();
        let (copied, _) = tokio::join!(
            tokio::io::copy(&mut stdout, sink),
            stderr.read_to_end(&mut errors)
        );
        let status = child.wait().await.map_err(io_error)?;

        if !status.success() {
            return Err(RuntimeError::CommandFailed {
                command: rendered.clone(),
                exit_code: status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&errors).trim().to_string(),
            });
        }

        copied.map_err(io_error)
    }

    async fn remove(&self, container_id: &str) -> Result<i32> {
        let output = self
            .run(self.remove_command(container_id), self.settings.command_timeout)
            .await?;

        if output.success() {
            debug!("Container {} removed", short_id(container_id));
        } else {
            warn!(
                "Failed to remove container {}: {}",
                short_id(container_id),
                output.stderr.trim()
            );
        }
        Ok(output.exit_code)
    }

    async fn close(&self) {
        debug!("Closing runtime driver for {}", self.settings.binary);
    }
}
