//! Recording runtime driver for tests

use async_trait::async_trait;
use berth_core::domain::container::ContainerInstance;
use berth_core::domain::process::{ContainerExit, ProcStart};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{AttachedProcess, Result, RuntimeDriver, RuntimeError};

/// A driver operation as seen by the fake runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Exists(String),
    ImageExists(String),
    Pull(String),
    CreateRemoting {
        image: String,
    },
    CreateSide {
        image: String,
        remoting: String,
    },
    CreateBuild {
        image: String,
        remoting: String,
        workdir: String,
        args: Vec<String>,
    },
    Start(String),
    StartAttached(String),
    StartInteractive(String),
    CopyIn {
        container: String,
        path: String,
    },
    CopyOut {
        container: String,
        path: String,
    },
    Remove(String),
    Close,
}

/// In-memory runtime recording every call it receives
#[derive(Default)]
pub struct FakeDriver {
    calls: Mutex<Vec<Call>>,
    containers: Mutex<HashSet<String>>,
    images: Mutex<HashSet<String>>,
    files: Mutex<HashMap<(String, String), Vec<u8>>>,
    failing_removals: Mutex<HashSet<String>>,
    failing_args: Mutex<HashSet<String>>,
    failing_containers: Mutex<HashSet<String>>,
    fail_pull: AtomicBool,
    fail_image_check: AtomicBool,
    fail_create: AtomicBool,
    next_id: AtomicUsize,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a container as existing in the runtime
    pub fn with_container(self, id: &str) -> Self {
        self.containers.lock().unwrap().insert(id.to_string());
        self
    }

    /// Marks an image as present locally
    pub fn with_image(self, image: &str) -> Self {
        self.images.lock().unwrap().insert(image.to_string());
        self
    }

    /// Makes `rm` of the given container exit non-zero
    pub fn failing_removal_of(&self, id: &str) {
        self.failing_removals.lock().unwrap().insert(id.to_string());
    }

    /// Makes build containers whose command contains `arg` exit with code 2
    pub fn failing_command(&self, arg: &str) {
        self.failing_args.lock().unwrap().insert(arg.to_string());
    }

    pub fn fail_pulls(&self) {
        self.fail_pull.store(true, Ordering::SeqCst);
    }

    pub fn fail_image_checks(&self) {
        self.fail_image_check.store(true, Ordering::SeqCst);
    }

    pub fn fail_creates(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|call| predicate(call)).count()
    }

    pub fn has_container(&self, id: &str) -> bool {
        self.containers.lock().unwrap().contains(id)
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn create(&self, kind: &str, image: &str) -> Result<ContainerInstance> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(RuntimeError::CommandFailed {
                command: format!("fake create {}", image),
                exit_code: 125,
                stderr: "fake create failure".to_string(),
            });
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("{}-{}", kind, n);
        self.containers.lock().unwrap().insert(id.clone());
        Ok(ContainerInstance::created(id, image))
    }
}

#[async_trait]
impl RuntimeDriver for FakeDriver {
    async fn exists(&self, container_id: &str) -> Result<bool> {
        self.record(Call::Exists(container_id.to_string()));
        Ok(self.has_container(container_id))
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        self.record(Call::ImageExists(image.to_string()));
        if self.fail_image_check.load(Ordering::SeqCst) {
            return Err(RuntimeError::Timeout {
                command: format!("fake inspect {}", image),
                timeout: std::time::Duration::from_secs(1),
            });
        }
        Ok(self.images.lock().unwrap().contains(image))
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.record(Call::Pull(image.to_string()));
        if self.fail_pull.load(Ordering::SeqCst) {
            return Err(RuntimeError::CommandFailed {
                command: format!("fake pull {}", image),
                exit_code: 1,
                stderr: "manifest unknown".to_string(),
            });
        }
        self.images.lock().unwrap().insert(image.to_string());
        Ok(())
    }

    async fn create_remoting_container(&self, image: &str) -> Result<ContainerInstance> {
        self.record(Call::CreateRemoting {
            image: image.to_string(),
        });
        self.create("remoting", image)
    }

    async fn create_side_container(
        &self,
        image: &str,
        remoting_container_id: &str,
    ) -> Result<ContainerInstance> {
        self.record(Call::CreateSide {
            image: image.to_string(),
            remoting: remoting_container_id.to_string(),
        });
        self.create("side", image)
    }

    async fn create_build_container(
        &self,
        image: &str,
        remoting_container_id: &str,
        proc: &ProcStart,
    ) -> Result<ContainerInstance> {
        self.record(Call::CreateBuild {
            image: image.to_string(),
            remoting: remoting_container_id.to_string(),
            workdir: proc.workdir.clone(),
            args: proc.args.iter().map(|arg| arg.value.clone()).collect(),
        });
        let container = self.create("build", image)?;
        let fails = {
            let failing = self.failing_args.lock().unwrap();
            proc.args.iter().any(|arg| failing.contains(&arg.value))
        };
        if fails {
            self.failing_containers
                .lock()
                .unwrap()
                .insert(container.id().to_string());
        }
        Ok(container)
    }

    async fn start(&self, container_id: &str) -> Result<i32> {
        self.record(Call::Start(container_id.to_string()));
        Ok(if self.has_container(container_id) { 0 } else { 1 })
    }

    async fn start_attached(
        &self,
        container_id: &str,
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<ContainerExit> {
        self.record(Call::StartAttached(container_id.to_string()));
        let exit_code = if self.failing_containers.lock().unwrap().contains(container_id) {
            2
        } else {
            0
        };
        output
            .write_all(format!("ran {}\n", container_id).as_bytes())
            .await
            .map_err(|source| RuntimeError::Io {
                command: "fake start --attach".to_string(),
                source,
            })?;
        Ok(ContainerExit { exit_code })
    }

    async fn start_interactive_attached(&self, container_id: &str) -> Result<AttachedProcess> {
        self.record(Call::StartInteractive(container_id.to_string()));

        let (stdout, mut agent_out) = tokio::io::duplex(1024);
        let (stdin, _agent_in) = tokio::io::duplex(1024);
        agent_out
            .write_all(b"agent connected\n")
            .await
            .map_err(|source| RuntimeError::Io {
                command: "fake start -ia".to_string(),
                source,
            })?;

        Ok(AttachedProcess::from_streams(
            container_id,
            Box::new(stdin),
            Box::new(stdout),
        ))
    }

    async fn copy_in(
        &self,
        container_id: &str,
        path: &str,
        mut archive: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<()> {
        self.record(Call::CopyIn {
            container: container_id.to_string(),
            path: path.to_string(),
        });
        let mut bytes = Vec::new();
        archive
            .read_to_end(&mut bytes)
            .await
            .map_err(|source| RuntimeError::Io {
                command: "fake cp".to_string(),
                source,
            })?;
        self.files
            .lock()
            .unwrap()
            .insert((container_id.to_string(), path.to_string()), bytes);
        Ok(())
    }

    async fn copy_out(
        &self,
        container_id: &str,
        path: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64> {
        self.record(Call::CopyOut {
            container: container_id.to_string(),
            path: path.to_string(),
        });
        let bytes = self
            .files
            .lock()
            .unwrap()
            .get(&(container_id.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| RuntimeError::CommandFailed {
                command: "fake cp".to_string(),
                exit_code: 1,
                stderr: format!("no such path: {}", path),
            })?;
        sink.write_all(&bytes)
            .await
            .map_err(|source| RuntimeError::Io {
                command: "fake cp".to_string(),
                source,
            })?;
        Ok(bytes.len() as u64)
    }

    async fn remove(&self, container_id: &str) -> Result<i32> {
        self.record(Call::Remove(container_id.to_string()));
        if self.failing_removals.lock().unwrap().contains(container_id) {
            return Ok(1);
        }
        self.containers.lock().unwrap().remove(container_id);
        Ok(0)
    }

    async fn close(&self) {
        self.record(Call::Close);
    }
}
