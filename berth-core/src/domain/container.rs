//! Container instance domain model

use serde::{Deserialize, Serialize};

/// A single runtime-managed container
///
/// The identifier is assigned by the container runtime when the create
/// command succeeds and is cleared again once the container is removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInstance {
    /// Runtime-assigned identifier (empty until created, or after removal)
    #[serde(default)]
    id: String,

    /// Image the container was created from
    image_name: String,
}

impl ContainerInstance {
    /// Creates an instance for a container the runtime already knows about
    pub fn created(id: impl Into<String>, image_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            image_name: image_name.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn image_name(&self) -> &str {
        &self.image_name
    }

    /// Whether the runtime has assigned an identifier to this container
    pub fn is_created(&self) -> bool {
        !self.id.is_empty()
    }

    /// Clears the identifier after the container has been removed
    pub fn invalidate(&mut self) {
        self.id.clear();
    }
}

impl std::fmt::Display for ContainerInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_created() {
            write!(f, "{} ({})", short_id(&self.id), self.image_name)
        } else {
            write!(f, "<not created> ({})", self.image_name)
        }
    }
}

/// Shortens a runtime identifier to the conventional 12 characters
pub fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
