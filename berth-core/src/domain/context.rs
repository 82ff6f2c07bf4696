//! Build containers context
//!
//! The per-build record of which containers exist for a build. The
//! orchestrator mutates it while the build runs; a snapshot is persisted when
//! the build ends so the next build of the same job can reuse the remoting
//! container.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::container::ContainerInstance;

/// Container topology of one build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildContainersContext {
    /// Build this context belongs to
    pub build_id: Uuid,

    /// Long-lived container carrying the control channel
    remoting_container: Option<ContainerInstance>,

    /// Side containers by name, created at most once per build
    side_containers: BTreeMap<String, ContainerInstance>,

    /// Build containers in creation order
    build_containers: Vec<ContainerInstance>,

    /// Concurrency tag used as the capacity gate key
    constraint: String,

    /// Whether source checkout has not completed yet
    pre_scm: bool,

    /// When the snapshot was taken (unset while the build is running)
    #[serde(default)]
    recorded_at: Option<DateTime<Utc>>,
}

impl BuildContainersContext {
    /// Creates an empty context for a new build
    pub fn new(build_id: Uuid, constraint: impl Into<String>) -> Self {
        Self {
            build_id,
            remoting_container: None,
            side_containers: BTreeMap::new(),
            build_containers: Vec::new(),
            constraint: constraint.into(),
            pre_scm: true,
            recorded_at: None,
        }
    }

    /// Creates a context for a new build, carrying over the remoting container
    /// of a previous build of the same job
    ///
    /// Only the remoting container identity survives; side and build
    /// containers always belong to the build that created them.
    pub fn continued_from(
        build_id: Uuid,
        constraint: impl Into<String>,
        previous: Option<&BuildContainersContext>,
    ) -> Self {
        let mut context = Self::new(build_id, constraint);
        context.remoting_container = previous
            .and_then(|p| p.remoting_container.clone())
            .filter(ContainerInstance::is_created);
        context
    }

    pub fn remoting_container(&self) -> Option<&ContainerInstance> {
        self.remoting_container.as_ref()
    }

    /// Sets the remoting container
    ///
    /// Used when no remoting container is known yet or the known one has
    /// vanished from the runtime.
    pub fn set_remoting_container(&mut self, container: ContainerInstance) {
        self.remoting_container = Some(container);
    }

    pub fn side_containers(&self) -> &BTreeMap<String, ContainerInstance> {
        &self.side_containers
    }

    pub fn side_containers_mut(&mut self) -> &mut BTreeMap<String, ContainerInstance> {
        &mut self.side_containers
    }

    /// Registers a side container
    ///
    /// Returns `false` without replacing anything if a side container with the
    /// same name already exists.
    pub fn insert_side_container(
        &mut self,
        name: impl Into<String>,
        container: ContainerInstance,
    ) -> bool {
        match self.side_containers.entry(name.into()) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(container);
                true
            }
        }
    }

    pub fn build_containers(&self) -> &[ContainerInstance] {
        &self.build_containers
    }

    pub fn build_containers_mut(&mut self) -> &mut [ContainerInstance] {
        &mut self.build_containers
    }

    pub fn push_build_container(&mut self, container: ContainerInstance) {
        self.build_containers.push(container);
    }

    pub fn constraint(&self) -> &str {
        &self.constraint
    }

    pub fn is_pre_scm(&self) -> bool {
        self.pre_scm
    }

    /// Flips the context into the post-checkout phase
    pub fn mark_scm_completed(&mut self) {
        self.pre_scm = false;
    }

    pub fn recorded_at(&self) -> Option<DateTime<Utc>> {
        self.recorded_at
    }

    /// Returns a timestamped copy suitable for persisting
    pub fn snapshot(&self) -> Self {
        let mut snapshot = self.clone();
        snapshot.recorded_at = Some(Utc::now());
        snapshot
    }
}
