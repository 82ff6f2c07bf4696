//! Job container specification
//!
//! Describes the containers a job wants for each of its builds: the image the
//! build steps run in after checkout, the side containers to start next to
//! them and the concurrency constraint the build is counted against.

use serde::{Deserialize, Serialize};

use super::definition::{ContainerDefinition, constraint_from_label, image_from_label};

/// Containers hosting the builds of one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobContainersSpec {
    /// Image the post-checkout build steps run in
    pub build_host_image: ContainerDefinition,

    /// Auxiliary containers (databases, caches, ...) in declaration order
    #[serde(default)]
    pub side_containers: Vec<SideContainerDefinition>,

    /// Concurrency constraint; blank means the runner's default constraint
    #[serde(default)]
    pub constraint: Option<String>,
}

/// A named side container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideContainerDefinition {
    pub name: String,
    pub spec: ContainerDefinition,
}

impl JobContainersSpec {
    pub fn new(build_host_image: ContainerDefinition) -> Self {
        Self {
            build_host_image,
            side_containers: Vec::new(),
            constraint: None,
        }
    }

    pub fn with_side_container(mut self, name: impl Into<String>, spec: ContainerDefinition) -> Self {
        self.side_containers.push(SideContainerDefinition {
            name: name.into(),
            spec,
        });
        self
    }

    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraint = Some(constraint.into());
        self
    }

    /// Derives the containers of a matrix build from its assigned label
    ///
    /// Returns `None` when the label names no image, in which case container
    /// provisioning does not apply to the build.
    pub fn for_matrix_label(label: &str, force_pull: bool) -> Option<Self> {
        let image = image_from_label(label)?;
        Some(Self {
            build_host_image: ContainerDefinition::image(image, force_pull),
            side_containers: Vec::new(),
            constraint: constraint_from_label(label).map(str::to_string),
        })
    }

    pub fn has_side_containers(&self) -> bool {
        !self.side_containers.is_empty()
    }

    /// The constraint builds of this job count against
    pub fn effective_constraint<'a>(&'a self, default_constraint: &'a str) -> &'a str {
        match self.constraint.as_deref().map(str::trim) {
            Some(constraint) if !constraint.is_empty() => constraint,
            _ => default_constraint,
        }
    }
}
