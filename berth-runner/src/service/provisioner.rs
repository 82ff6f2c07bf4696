//! Build containers provisioner
//!
//! Owns the container topology of one build:
//! - Reuses the remoting container of the previous build when it still exists,
//!   creates a fresh one otherwise
//! - Waits for a capacity slot before starting the remoting container
//! - Creates side containers once, on the first command after checkout
//! - Creates a new build container for every command, sharing the remoting
//!   container's network and volumes
//! - Removes side and build containers at the end of the build and frees the
//!   capacity slot; the remoting container is kept for the next build

use berth_core::domain::container::{ContainerInstance, short_id};
use berth_core::domain::context::BuildContainersContext;
use berth_core::domain::job::JobContainersSpec;
use berth_core::domain::process::{ContainerExit, ProcStart};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::driver::{RuntimeDriver, RuntimeError};
use crate::service::capacity::{AdmissionError, CapacityGate};
use crate::service::resolver::{self, ResolveError};
use crate::transport::ChannelTransport;

/// Errors that fail the build
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    ImageResolution(#[from] ResolveError),

    #[error("Build aborted: {0}")]
    Aborted(#[from] AdmissionError),

    #[error("Remoting container has not been prepared")]
    RemotingNotPrepared,

    #[error("Control channel failed: {0:#}")]
    Transport(anyhow::Error),

    /// A local file of a workspace transfer could not be opened or created
    #[error("Workspace transfer failed for {}: {source}", .path.display())]
    WorkspaceIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Images of the containers every build gets
#[derive(Debug, Clone)]
pub struct ProvisionerImages {
    /// Image of the remoting container
    pub remoting: String,
    /// Image build containers run from until checkout completed
    pub scm: String,
}

/// Outcome of tearing a build's containers down
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub removed: usize,
    pub failed: Vec<String>,
}

/// Container orchestrator for one build
pub struct ContainersProvisioner {
    driver: Arc<dyn RuntimeDriver>,
    gate: Arc<CapacityGate>,
    spec: JobContainersSpec,
    images: ProvisionerImages,
    context: BuildContainersContext,

    /// Build-host image, resolved on the first command after checkout
    build_image: Option<String>,

    /// Whether this build holds a capacity slot
    slot_held: bool,
}

impl ContainersProvisioner {
    /// Creates the provisioner of a new build
    ///
    /// # Arguments
    /// * `previous` - Context of the job's previous build, if any; its remoting
    ///   container becomes a reuse candidate
    pub fn new(
        driver: Arc<dyn RuntimeDriver>,
        gate: Arc<CapacityGate>,
        spec: JobContainersSpec,
        images: ProvisionerImages,
        build_id: Uuid,
        previous: Option<&BuildContainersContext>,
    ) -> Self {
        let constraint = spec
            .effective_constraint(gate.default_constraint())
            .to_string();
        let context = BuildContainersContext::continued_from(build_id, constraint, previous);

        Self {
            driver,
            gate,
            spec,
            images,
            context,
            build_image: None,
            slot_held: false,
        }
    }

    pub fn context(&self) -> &BuildContainersContext {
        &self.context
    }

    /// Records that source checkout completed
    pub fn on_scm_completed(&mut self) {
        if self.context.is_pre_scm() {
            info!("Checkout completed for build {}", self.context.build_id);
        }
        self.context.mark_scm_completed();
    }

    /// Decides the remoting container's identity: reuse or create
    ///
    /// Does not need a capacity slot.
    pub async fn prepare_remoting_container(&mut self) -> Result<ContainerInstance, ProvisionError> {
        if let Some(existing) = self.context.remoting_container().cloned() {
            if self.driver.exists(existing.id()).await? {
                info!("Reusing remoting container {}", existing);
                return Ok(existing);
            }
            info!(
                "Remoting container {} is gone, creating a new one",
                short_id(existing.id())
            );
        }

        let container = self
            .driver
            .create_remoting_container(&self.images.remoting)
            .await?;
        info!("Created remoting container {}", container);
        self.context.set_remoting_container(container.clone());

        Ok(container)
    }

    /// Waits for a capacity slot, then starts the remoting container attached
    /// and hands it to the control-channel transport
    pub async fn launch_remoting_container(
        &mut self,
        transport: &dyn ChannelTransport,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        let remoting_id = self.remoting_id()?;

        if !self.slot_held {
            self.gate.admit(self.context.constraint(), cancel).await?;
            self.slot_held = true;
        }

        let process = self.driver.start_interactive_attached(&remoting_id).await?;
        transport
            .connect(process)
            .await
            .map_err(ProvisionError::Transport)?;

        info!("Remoting container {} launched", short_id(&remoting_id));
        Ok(())
    }

    /// Creates the build container for the next command
    ///
    /// The first call after checkout also creates the job's side containers.
    pub async fn create_build_container(
        &mut self,
        proc: &ProcStart,
    ) -> Result<ContainerInstance, ProvisionError> {
        let remoting_id = self.remoting_id()?;

        if !self.context.is_pre_scm()
            && self.spec.has_side_containers()
            && self.context.side_containers().is_empty()
        {
            self.create_side_containers(&remoting_id).await?;
        }

        let image = if self.context.is_pre_scm() {
            self.images.scm.clone()
        } else {
            self.build_image().await?
        };

        debug!("Creating build container from {} for: {}", image, proc.display_command());
        let container = self
            .driver
            .create_build_container(&image, &remoting_id, proc)
            .await?;
        self.context.push_build_container(container.clone());

        Ok(container)
    }

    /// Runs a created build container to completion, streaming its output
    pub async fn start_build_container(
        &self,
        container: &ContainerInstance,
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<ContainerExit, ProvisionError> {
        let exit = self.driver.start_attached(container.id(), output).await?;
        debug!(
            "Build container {} exited with code {}",
            short_id(container.id()),
            exit.exit_code
        );
        Ok(exit)
    }

    /// Creates and runs a build container for one command
    pub async fn run_command(
        &mut self,
        proc: &ProcStart,
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<ContainerExit, ProvisionError> {
        let container = self.create_build_container(proc).await?;
        self.start_build_container(&container, output).await
    }

    /// Streams a tar archive into the shared workspace (the remoting
    /// container's volumes)
    pub async fn copy_to_workspace(
        &self,
        path: &str,
        archive: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<(), ProvisionError> {
        let remoting_id = self.remoting_id()?;
        self.driver.copy_in(&remoting_id, path, archive).await?;
        Ok(())
    }

    /// Streams a path of the shared workspace out as a tar archive
    pub async fn copy_from_workspace(
        &self,
        path: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, ProvisionError> {
        let remoting_id = self.remoting_id()?;
        Ok(self.driver.copy_out(&remoting_id, path, sink).await?)
    }

    /// Removes side and build containers, then frees the capacity slot
    ///
    /// Never fails: removal errors are logged and reported. The remoting
    /// container is left in place for the next build.
    pub async fn clean(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();

        // Side containers first: build containers share their network
        let side_ids: Vec<String> = self
            .context
            .side_containers()
            .values()
            .filter(|c| c.is_created())
            .map(|c| c.id().to_string())
            .collect();
        let removed = self.remove_all(side_ids, &mut report).await;
        for container in self.context.side_containers_mut().values_mut() {
            if removed.contains(container.id()) {
                container.invalidate();
            }
        }

        let build_ids: Vec<String> = self
            .context
            .build_containers()
            .iter()
            .filter(|c| c.is_created())
            .map(|c| c.id().to_string())
            .collect();
        let removed = self.remove_all(build_ids, &mut report).await;
        for container in self.context.build_containers_mut() {
            if removed.contains(container.id()) {
                container.invalidate();
            }
        }

        self.driver.close().await;

        if self.slot_held {
            self.gate.release(self.context.constraint());
            self.slot_held = false;
        }

        info!(
            "Teardown of build {} complete: {} removed, {} failed",
            self.context.build_id,
            report.removed,
            report.failed.len()
        );
        report
    }

    /// Removes containers in parallel, returning the ids that are gone
    async fn remove_all(&self, ids: Vec<String>, report: &mut TeardownReport) -> HashSet<String> {
        let mut tasks = JoinSet::new();
        for id in ids {
            let driver = Arc::clone(&self.driver);
            tasks.spawn(async move {
                let result = driver.remove(&id).await;
                (id, result)
            });
        }

        let mut removed = HashSet::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, Ok(0))) => {
                    report.removed += 1;
                    removed.insert(id);
                }
                Ok((id, Ok(code))) => {
                    warn!("Failed to remove container {}: exit code {}", short_id(&id), code);
                    report.failed.push(id);
                }
                Ok((id, Err(e))) => {
                    warn!("Failed to remove container {}: {}", short_id(&id), e);
                    report.failed.push(id);
                }
                Err(e) => warn!("Container removal task failed: {}", e),
            }
        }
        removed
    }

    async fn create_side_containers(&mut self, remoting_id: &str) -> Result<(), ProvisionError> {
        let definitions = self.spec.side_containers.clone();

        for definition in definitions {
            let image = resolver::resolve(&definition.spec, self.driver.as_ref()).await?;
            info!("Starting {} container", definition.name);

            let container = self
                .driver
                .create_side_container(&image, remoting_id)
                .await?;
            let id = container.id().to_string();
            self.context.insert_side_container(&definition.name, container);

            let exit_code = self.driver.start(&id).await?;
            if exit_code != 0 {
                return Err(RuntimeError::CommandFailed {
                    command: format!("start {}", id),
                    exit_code,
                    stderr: format!("side container '{}' did not start", definition.name),
                }
                .into());
            }
        }

        Ok(())
    }

    async fn build_image(&mut self) -> Result<String, ProvisionError> {
        if let Some(image) = &self.build_image {
            return Ok(image.clone());
        }

        let image = resolver::resolve(&self.spec.build_host_image, self.driver.as_ref()).await?;
        self.build_image = Some(image.clone());
        Ok(image)
    }

    fn remoting_id(&self) -> Result<String, ProvisionError> {
        self.context
            .remoting_container()
            .filter(|c| c.is_created())
            .map(|c| c.id().to_string())
            .ok_or(ProvisionError::RemotingNotPrepared)
    }
}
