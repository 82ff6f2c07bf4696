//! Context repository
//!
//! Persists the container context snapshot of a job's last build so the next
//! build of the same job can try to reuse its remoting container.

use anyhow::{Context, Result};
use async_trait::async_trait;
use berth_core::domain::context::BuildContainersContext;
use std::path::PathBuf;
use tracing::debug;

/// Repository trait for build context snapshots
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Loads the snapshot of the job's last build, if any
    async fn load_last(&self, job: &str) -> Result<Option<BuildContainersContext>>;

    /// Stores the snapshot of a finished build as the job's last build
    async fn save(&self, job: &str, context: &BuildContainersContext) -> Result<()>;
}

/// Stores one JSON file per job in a state directory
pub struct FileContextStore {
    dir: PathBuf,
}

impl FileContextStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// File holding a job's snapshot; job names may contain path separators
    fn path_for(&self, job: &str) -> PathBuf {
        let name: String = job
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", name))
    }
}

#[async_trait]
impl ContextStore for FileContextStore {
    async fn load_last(&self, job: &str) -> Result<Option<BuildContainersContext>> {
        let path = self.path_for(job);

        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No previous build context for job {}", job);
                return Ok(None);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };

        let context = serde_json::from_slice(&data)
            .with_context(|| format!("Failed to parse build context {}", path.display()))?;
        Ok(Some(context))
    }

    async fn save(&self, job: &str, context: &BuildContainersContext) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create state directory {}", self.dir.display()))?;

        let path = self.path_for(job);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(&context.snapshot())
            .context("Failed to serialize build context")?;

        tokio::fs::write(&tmp, data)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to move build context into {}", path.display()))?;

        debug!("Saved build context for job {} to {}", job, path.display());
        Ok(())
    }
}
