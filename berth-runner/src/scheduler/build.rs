//! Build harness
//!
//! Runs one build end to end: picks the job's container spec, prepares and
//! launches the remoting container, executes the build steps in build
//! containers, tears the build down and stores the context snapshot.

use anyhow::{Context as AnyhowContext, Result};
use berth_core::domain::job::JobContainersSpec;
use berth_core::domain::process::ProcStart;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::driver::RuntimeDriver;
use crate::repository::ContextStore;
use crate::service::{
    CapacityGate, ContainersProvisioner, ProvisionError, ProvisionerImages, TeardownReport,
};
use crate::transport::StdioChannel;

/// One build as submitted to the runner
#[derive(Debug, Clone, Deserialize)]
pub struct BuildDescription {
    /// Name of the job the build belongs to
    pub job: String,

    /// Label assigned to the build; used when `containers` is absent
    #[serde(default)]
    pub label: Option<String>,

    /// Forces a pull of the label-selected image
    #[serde(default)]
    pub force_pull: bool,

    /// Explicit container spec of the job
    #[serde(default)]
    pub containers: Option<JobContainersSpec>,

    pub steps: Vec<BuildStep>,
}

/// A single step of a build
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuildStep {
    /// Runs a command in a fresh build container
    Command {
        workdir: String,
        args: Vec<String>,
        /// Positional mask flags, one per argument
        #[serde(default)]
        masked: Vec<bool>,
    },

    /// Marks the end of source checkout
    CheckoutCompleted,

    /// Copies a local tar archive into the shared workspace
    CopyIn { source: PathBuf, path: String },

    /// Copies a workspace path out to a local tar archive
    CopyOut { path: String, destination: PathBuf },
}

impl BuildDescription {
    /// Reads a description from a JSON file
    pub async fn from_file(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read build description {}", path.display()))?;
        serde_json::from_slice(&data)
            .with_context(|| format!("Failed to parse build description {}", path.display()))
    }

    /// Reads every description named by `paths`
    ///
    /// A directory contributes all of its `.json` files in name order.
    pub async fn load_all(paths: &[PathBuf]) -> Result<Vec<Self>> {
        let mut descriptions = Vec::new();

        for path in paths {
            if !tokio::fs::metadata(path)
                .await
                .with_context(|| format!("Failed to access {}", path.display()))?
                .is_dir()
            {
                descriptions.push(Self::from_file(path).await?);
                continue;
            }

            let mut files = Vec::new();
            let mut entries = tokio::fs::read_dir(path)
                .await
                .with_context(|| format!("Failed to list {}", path.display()))?;
            while let Some(entry) = entries.next_entry().await? {
                let file = entry.path();
                if file.extension().is_some_and(|ext| ext == "json") {
                    files.push(file);
                }
            }
            files.sort();

            for file in files {
                descriptions.push(Self::from_file(&file).await?);
            }
        }

        Ok(descriptions)
    }

    /// Container spec for this build, `None` when containers do not apply
    pub fn container_spec(&self) -> Option<JobContainersSpec> {
        if let Some(spec) = &self.containers {
            return Some(spec.clone());
        }
        self.label
            .as_deref()
            .and_then(|label| JobContainersSpec::for_matrix_label(label, self.force_pull))
    }
}

/// Result of a finished build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    pub build_id: Uuid,

    /// Steps executed, including a failing one
    pub steps_run: usize,

    /// Index and exit code of the command that failed the build
    pub failed_step: Option<(usize, i32)>,

    pub teardown: TeardownReport,
}

impl BuildOutcome {
    pub fn success(&self) -> bool {
        self.failed_step.is_none()
    }
}

/// Step progress, kept apart from the teardown result
struct StepsResult {
    steps_run: usize,
    failed_step: Option<(usize, i32)>,
}

/// Runs builds against one runtime and capacity gate
pub struct BuildRunner {
    driver: Arc<dyn RuntimeDriver>,
    gate: Arc<CapacityGate>,
    store: Arc<dyn ContextStore>,
    images: ProvisionerImages,
}

impl BuildRunner {
    pub fn new(
        driver: Arc<dyn RuntimeDriver>,
        gate: Arc<CapacityGate>,
        store: Arc<dyn ContextStore>,
        images: ProvisionerImages,
    ) -> Self {
        Self {
            driver,
            gate,
            store,
            images,
        }
    }

    /// Runs a build to completion
    ///
    /// Returns `Ok(None)` when containers do not apply to the build. The
    /// build is always torn down and its context stored, including when a
    /// step fails or the admission wait is cancelled.
    pub async fn run(
        &self,
        description: &BuildDescription,
        output: &mut (dyn AsyncWrite + Send + Unpin),
        cancel: &CancellationToken,
    ) -> Result<Option<BuildOutcome>> {
        let Some(spec) = description.container_spec() else {
            info!(
                "Containers do not apply to job {}: no container spec and no image label",
                description.job
            );
            return Ok(None);
        };

        let previous = match self.store.load_last(&description.job).await {
            Ok(previous) => previous,
            Err(e) => {
                warn!("Ignoring previous build context of {}: {:#}", description.job, e);
                None
            }
        };

        let build_id = Uuid::new_v4();
        info!("Starting build {} of job {}", build_id, description.job);

        let mut provisioner = ContainersProvisioner::new(
            self.driver.clone(),
            self.gate.clone(),
            spec,
            self.images.clone(),
            build_id,
            previous.as_ref(),
        );
        let channel = StdioChannel::new();

        let steps =
            Self::execute(&mut provisioner, &channel, &description.steps, output, cancel).await;

        let teardown = provisioner.clean().await;
        if let Some(summary) = channel.disconnect().await {
            info!(
                "Agent channel closed after {} line(s) with exit code {}",
                summary.lines, summary.exit_code
            );
        }

        if let Err(e) = self
            .store
            .save(&description.job, provisioner.context())
            .await
        {
            warn!("Failed to store build context of {}: {:#}", description.job, e);
        }

        let steps = steps.with_context(|| format!("Build {} failed", build_id))?;

        let outcome = BuildOutcome {
            build_id,
            steps_run: steps.steps_run,
            failed_step: steps.failed_step,
            teardown,
        };

        if outcome.success() {
            info!("Build {} completed ({} step(s))", build_id, outcome.steps_run);
        } else {
            error!("Build {} failed at step {}", build_id, outcome.steps_run);
        }

        Ok(Some(outcome))
    }

    /// Runs builds concurrently, all sharing this runner's capacity gate
    ///
    /// Each build streams its command output into a writer from `output`.
    /// Results come back in the order of `descriptions`, keyed by job.
    pub async fn run_all<W, F>(
        self: Arc<Self>,
        descriptions: Vec<BuildDescription>,
        output: F,
        cancel: &CancellationToken,
    ) -> Vec<(String, Result<Option<BuildOutcome>>)>
    where
        W: AsyncWrite + Send + Unpin + 'static,
        F: Fn() -> W,
    {
        let handles: Vec<_> = descriptions
            .into_iter()
            .map(|description| {
                let runner = self.clone();
                let cancel = cancel.clone();
                let mut writer = output();
                let job = description.job.clone();
                let handle = tokio::spawn(async move {
                    runner.run(&description, &mut writer, &cancel).await
                });
                (job, handle)
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (job, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("Build task of {} failed: {}", job, e)),
            };
            results.push((job, result));
        }
        results
    }

    async fn execute(
        provisioner: &mut ContainersProvisioner,
        channel: &StdioChannel,
        steps: &[BuildStep],
        output: &mut (dyn AsyncWrite + Send + Unpin),
        cancel: &CancellationToken,
    ) -> Result<StepsResult, ProvisionError> {
        provisioner.prepare_remoting_container().await?;
        provisioner.launch_remoting_container(channel, cancel).await?;

        let mut steps_run = 0;
        for (index, step) in steps.iter().enumerate() {
            steps_run += 1;

            match step {
                BuildStep::Command {
                    workdir,
                    args,
                    masked,
                } => {
                    let proc = ProcStart::new(workdir.clone(), args.clone()).with_masks(masked);
                    info!("Running: {}", proc.display_command());

                    let exit = provisioner.run_command(&proc, &mut *output).await?;
                    if !exit.success() {
                        warn!("Command exited with code {}", exit.exit_code);
                        return Ok(StepsResult {
                            steps_run,
                            failed_step: Some((index, exit.exit_code)),
                        });
                    }
                }
                BuildStep::CheckoutCompleted => provisioner.on_scm_completed(),
                BuildStep::CopyIn { source, path } => {
                    let file = tokio::fs::File::open(source).await.map_err(|e| {
                        ProvisionError::WorkspaceIo {
                            path: source.clone(),
                            source: e,
                        }
                    })?;
                    provisioner.copy_to_workspace(path, Box::new(file)).await?;
                }
                BuildStep::CopyOut { path, destination } => {
                    let mut file = tokio::fs::File::create(destination).await.map_err(|e| {
                        ProvisionError::WorkspaceIo {
                            path: destination.clone(),
                            source: e,
                        }
                    })?;
                    let bytes = provisioner.copy_from_workspace(path, &mut file).await?;
                    file.flush().await.map_err(|e| ProvisionError::WorkspaceIo {
                        path: destination.clone(),
                        source: e,
                    })?;
                    info!("Copied {} byte(s) of {} to {}", bytes, path, destination.display());
                }
            }
        }

        Ok(StepsResult {
            steps_run,
            failed_step: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::{Call, FakeDriver};
    use crate::repository::FileContextStore;
    use std::time::Duration;
    use tempfile::TempDir;

    fn images() -> ProvisionerImages {
        ProvisionerImages {
            remoting: "agent:latest".to_string(),
            scm: "scm:latest".to_string(),
        }
    }

    fn runner(driver: Arc<FakeDriver>, gate: Arc<CapacityGate>, dir: &TempDir) -> BuildRunner {
        BuildRunner::new(
            driver,
            gate,
            Arc::new(FileContextStore::new(dir.path())),
            images(),
        )
    }

    fn description(json: &str) -> BuildDescription {
        serde_json::from_str(json).unwrap()
    }

    fn checkout_then_test() -> BuildDescription {
        description(
            r#"{
                "job": "app/main",
                "label": "docker:rust:1.90 constraint:heavy",
                "steps": [
                    { "type": "command", "workdir": "/ws", "args": ["git", "clone", "repo"] },
                    { "type": "checkout_completed" },
                    { "type": "command", "workdir": "/ws", "args": ["cargo", "test"] }
                ]
            }"#,
        )
    }

    fn build_images(driver: &FakeDriver) -> Vec<String> {
        driver
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::CreateBuild { image, .. } => Some(image),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_description_parsing() {
        let parsed = description(
            r#"{
                "job": "svc",
                "containers": {
                    "build_host_image": { "type": "image", "image": "node:22" },
                    "side_containers": [
                        { "name": "db", "spec": { "type": "image", "image": "postgres:17" } }
                    ]
                },
                "steps": [
                    { "type": "command", "workdir": "/ws", "args": ["login", "s3cret"], "masked": [false, true] },
                    { "type": "copy_out", "path": "/ws/out", "destination": "/tmp/out.tar" }
                ]
            }"#,
        );

        let spec = parsed.container_spec().unwrap();
        assert!(spec.has_side_containers());
        assert_eq!(parsed.steps.len(), 2);
        assert!(matches!(
            &parsed.steps[0],
            BuildStep::Command { masked, .. } if masked == &vec![false, true]
        ));
    }

    #[test]
    fn test_label_without_image_token_has_no_spec() {
        let parsed = description(r#"{ "job": "x", "label": "linux constraint:big", "steps": [] }"#);
        assert!(parsed.container_spec().is_none());

        let parsed = description(r#"{ "job": "x", "steps": [] }"#);
        assert!(parsed.container_spec().is_none());
    }

    #[tokio::test]
    async fn test_build_runs_steps_in_scm_then_build_image() {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(FakeDriver::new().with_image("rust:1.90"));
        let gate = Arc::new(CapacityGate::new(10, "default"));
        let runner = runner(driver.clone(), gate.clone(), &dir);

        let outcome = runner
            .run(&checkout_then_test(), &mut tokio::io::sink(), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert!(outcome.success());
        assert_eq!(outcome.steps_run, 3);
        assert_eq!(outcome.teardown.removed, 2);
        assert_eq!(build_images(&driver), vec!["scm:latest", "rust:1.90"]);
        assert_eq!(gate.count("heavy"), 0);
        assert_eq!(driver.count(|c| matches!(c, Call::Close)), 1);
    }

    #[tokio::test]
    async fn test_next_build_reuses_remoting_container() {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(FakeDriver::new().with_image("rust:1.90"));
        let gate = Arc::new(CapacityGate::new(10, "default"));
        let runner = runner(driver.clone(), gate, &dir);
        let cancel = CancellationToken::new();

        runner.run(&checkout_then_test(), &mut tokio::io::sink(), &cancel).await.unwrap();
        runner.run(&checkout_then_test(), &mut tokio::io::sink(), &cancel).await.unwrap();

        assert_eq!(driver.count(|c| matches!(c, Call::CreateRemoting { .. })), 1);
        assert_eq!(driver.count(|c| matches!(c, Call::StartInteractive(_))), 2);
    }

    #[tokio::test]
    async fn test_failing_command_stops_build_and_tears_down() {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(FakeDriver::new().with_image("rust:1.90"));
        driver.failing_command("clone");
        let gate = Arc::new(CapacityGate::new(10, "default"));
        let runner = runner(driver.clone(), gate.clone(), &dir);

        let outcome = runner
            .run(&checkout_then_test(), &mut tokio::io::sink(), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.failed_step, Some((0, 2)));
        assert_eq!(outcome.steps_run, 1);
        assert_eq!(build_images(&driver), vec!["scm:latest"]);
        assert_eq!(outcome.teardown.removed, 1);
        assert_eq!(gate.count("heavy"), 0);
    }

    #[tokio::test]
    async fn test_not_applicable_build_touches_nothing() {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(FakeDriver::new());
        let runner = runner(driver.clone(), Arc::new(CapacityGate::new(10, "default")), &dir);

        let parsed = description(r#"{ "job": "x", "label": "linux", "steps": [] }"#);
        let outcome = runner
            .run(&parsed, &mut tokio::io::sink(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert!(driver.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_admission_fails_build_but_stores_context() {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(FakeDriver::new());
        let gate = Arc::new(CapacityGate::new(10, "default").with_constraint_cap(1));
        assert!(gate.try_admit("heavy"));
        let runner = runner(driver.clone(), gate.clone(), &dir);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = runner
            .run(&checkout_then_test(), &mut tokio::io::sink(), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ProvisionError>(),
            Some(ProvisionError::Aborted(_))
        ));
        assert_eq!(gate.count("heavy"), 1);
        assert_eq!(driver.count(|c| matches!(c, Call::CreateBuild { .. })), 0);

        let stored = FileContextStore::new(dir.path())
            .load_last("app/main")
            .await
            .unwrap()
            .unwrap();
        assert!(stored.remoting_container().is_some());
    }

    #[tokio::test]
    async fn test_workspace_copy_steps() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("in.tar");
        let destination = dir.path().join("out.tar");
        tokio::fs::write(&source, b"archive bytes").await.unwrap();

        let driver = Arc::new(FakeDriver::new());
        let runner = runner(driver.clone(), Arc::new(CapacityGate::new(10, "default")), &dir);

        let parsed = BuildDescription {
            job: "copy".to_string(),
            label: Some("docker:alpine".to_string()),
            force_pull: false,
            containers: None,
            steps: vec![
                BuildStep::CopyIn {
                    source,
                    path: "/ws".to_string(),
                },
                BuildStep::CopyOut {
                    path: "/ws".to_string(),
                    destination: destination.clone(),
                },
            ],
        };

        let outcome = runner
            .run(&parsed, &mut tokio::io::sink(), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.success());
        assert_eq!(tokio::fs::read(&destination).await.unwrap(), b"archive bytes");
    }

    #[tokio::test]
    async fn test_command_output_is_streamed() {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(FakeDriver::new().with_image("rust:1.90"));
        let runner = runner(driver.clone(), Arc::new(CapacityGate::new(10, "default")), &dir);

        let mut output = Vec::new();
        runner
            .run(&checkout_then_test(), &mut output, &CancellationToken::new())
            .await
            .unwrap();

        let output = String::from_utf8(output).unwrap();
        assert_eq!(output.lines().count(), 2);
        assert!(output.lines().all(|line| line.starts_with("ran build-")));
    }

    #[tokio::test]
    async fn test_missing_copy_source_is_workspace_error() {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(FakeDriver::new());
        let gate = Arc::new(CapacityGate::new(10, "default"));
        let runner = runner(driver.clone(), gate.clone(), &dir);

        let parsed = BuildDescription {
            job: "copy".to_string(),
            label: Some("docker:alpine".to_string()),
            force_pull: false,
            containers: None,
            steps: vec![BuildStep::CopyIn {
                source: dir.path().join("missing.tar"),
                path: "/ws".to_string(),
            }],
        };

        let err = runner
            .run(&parsed, &mut tokio::io::sink(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProvisionError>(),
            Some(ProvisionError::WorkspaceIo { path, .. }) if path.ends_with("missing.tar")
        ));
        assert_eq!(driver.count(|c| matches!(c, Call::CopyIn { .. })), 0);
        assert_eq!(gate.count("default"), 0);
    }

    #[tokio::test]
    async fn test_concurrent_builds_share_capacity() {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(FakeDriver::new());
        let gate = Arc::new(
            CapacityGate::new(1, "default")
                .with_backoff(Duration::from_millis(1), Duration::from_millis(5)),
        );
        let runner = Arc::new(runner(driver.clone(), gate.clone(), &dir));

        let build = |job: &str| {
            description(&format!(
                r#"{{
                    "job": "{}",
                    "label": "docker:alpine",
                    "steps": [{{ "type": "command", "workdir": "/ws", "args": ["make"] }}]
                }}"#,
                job
            ))
        };

        let results = runner
            .run_all(
                vec![build("first"), build("second")],
                tokio::io::sink,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "first");
        for (_, result) in &results {
            assert!(result.as_ref().unwrap().as_ref().unwrap().success());
        }

        // The second launch waits for the first build's teardown
        let calls = driver.calls();
        let launches: Vec<usize> = calls
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c, Call::StartInteractive(_)))
            .map(|(i, _)| i)
            .collect();
        let first_close = calls.iter().position(|c| matches!(c, Call::Close)).unwrap();
        assert_eq!(launches.len(), 2);
        assert!(launches[0] < first_close);
        assert!(first_close < launches[1]);
        assert_eq!(gate.count("default"), 0);
    }

    #[tokio::test]
    async fn test_load_all_expands_directories() {
        let dir = TempDir::new().unwrap();
        let builds = dir.path().join("builds");
        tokio::fs::create_dir(&builds).await.unwrap();
        for job in ["b", "a"] {
            tokio::fs::write(
                builds.join(format!("{}.json", job)),
                format!(r#"{{ "job": "{}", "steps": [] }}"#, job),
            )
            .await
            .unwrap();
        }
        tokio::fs::write(builds.join("notes.txt"), "ignored").await.unwrap();
        let single = dir.path().join("single.json");
        tokio::fs::write(&single, r#"{ "job": "c", "steps": [] }"#).await.unwrap();

        let loaded = BuildDescription::load_all(&[builds, single]).await.unwrap();
        let jobs: Vec<&str> = loaded.iter().map(|d| d.job.as_str()).collect();
        assert_eq!(jobs, vec!["a", "b", "c"]);
    }
}
