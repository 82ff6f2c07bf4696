//! Container definition resolver
//!
//! Turns a `ContainerDefinition` into an image reference that is present in
//! the runtime's local image store, pulling it when forced or missing.

use berth_core::domain::definition::{ContainerDefinition, ImageSpec};
use thiserror::Error;
use tracing::{info, warn};

use crate::driver::{RuntimeDriver, RuntimeError};

/// Errors raised while resolving a container definition
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Label-derived definition whose label names no image
    #[error("No image selected by {0}")]
    NoImageLabel(String),

    /// The image could not be pulled
    #[error("Failed to pull image {image}: {source}")]
    PullFailed {
        image: String,
        #[source]
        source: RuntimeError,
    },
}

/// Resolves a definition to an image reference, pulling it if needed
pub async fn resolve(
    definition: &ContainerDefinition,
    driver: &dyn RuntimeDriver,
) -> Result<String, ResolveError> {
    let Some(spec) = definition.image_spec() else {
        return Err(ResolveError::NoImageLabel(definition.to_string()));
    };

    resolve_image(&spec, driver).await?;
    Ok(spec.image)
}

/// Makes sure an image is available locally according to its pull policy
async fn resolve_image(spec: &ImageSpec, driver: &dyn RuntimeDriver) -> Result<(), ResolveError> {
    let pull = spec.force_pull
        || match driver.image_exists(&spec.image).await {
            Ok(present) => !present,
            Err(e) => {
                // Could be a runtime hiccup, but most likely the image is missing
                warn!("Failed to check image {}: {}", spec.image, e);
                true
            }
        };

    if pull {
        info!("Pulling image {}", spec.image);
        driver
            .pull_image(&spec.image)
            .await
            .map_err(|source| ResolveError::PullFailed {
                image: spec.image.clone(),
                source,
            })?;
    }

    Ok(())
}
