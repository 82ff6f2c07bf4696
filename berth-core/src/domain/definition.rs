//! Container definitions
//!
//! A container definition says which image a container should run. It is only
//! turned into a concrete image reference right before the container is
//! created, because label-derived definitions depend on the label assigned to
//! the build when it left the queue.

use serde::{Deserialize, Serialize};

/// Label token prefix selecting the build-host image
pub const IMAGE_LABEL_PREFIX: &str = "docker:";

/// Label token prefix selecting the concurrency constraint
pub const CONSTRAINT_LABEL_PREFIX: &str = "constraint:";

/// Specification of an image to run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContainerDefinition {
    /// A fixed image reference
    Image {
        image: String,
        #[serde(default)]
        force_pull: bool,
    },

    /// An image picked from the build's assigned label (`docker:<image>`)
    Label {
        label: String,
        #[serde(default)]
        force_pull: bool,
    },
}

/// A concrete image together with its pull policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    pub image: String,
    pub force_pull: bool,
}

impl ContainerDefinition {
    /// Creates a fixed image definition
    pub fn image(image: impl Into<String>, force_pull: bool) -> Self {
        Self::Image {
            image: image.into(),
            force_pull,
        }
    }

    /// Creates a label-derived definition
    pub fn label(label: impl Into<String>, force_pull: bool) -> Self {
        Self::Label {
            label: label.into(),
            force_pull,
        }
    }

    /// Returns the image this definition selects
    ///
    /// `None` means a label-derived definition whose label carries no image
    /// token, i.e. the definition does not apply to this build.
    pub fn image_spec(&self) -> Option<ImageSpec> {
        match self {
            Self::Image { image, force_pull } => Some(ImageSpec {
                image: image.clone(),
                force_pull: *force_pull,
            }),
            Self::Label { label, force_pull } => {
                image_from_label(label).map(|image| ImageSpec {
                    image: image.to_string(),
                    force_pull: *force_pull,
                })
            }
        }
    }
}

impl std::fmt::Display for ContainerDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Image { image, .. } => write!(f, "image {}", image),
            Self::Label { label, .. } => write!(f, "label '{}'", label),
        }
    }
}

/// Extracts the image named by a `docker:` token of an assigned label
pub fn image_from_label(label: &str) -> Option<&str> {
    label_value(label, IMAGE_LABEL_PREFIX)
}

/// Extracts the constraint named by a `constraint:` token of an assigned label
pub fn constraint_from_label(label: &str) -> Option<&str> {
    label_value(label, CONSTRAINT_LABEL_PREFIX)
}

/// First non-empty value of a whitespace-separated token starting with `prefix`
fn label_value<'a>(label: &'a str, prefix: &str) -> Option<&'a str> {
    label
        .split_whitespace()
        .filter_map(|token| token.strip_prefix(prefix))
        .find(|value| !value.is_empty())
}
