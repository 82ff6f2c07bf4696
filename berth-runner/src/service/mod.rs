//! Service layer
//!
//! Services contain the provisioning logic of the runner:
//! - `capacity`: process-wide admission control per constraint
//! - `resolver`: container definition to local image reference
//! - `provisioner`: per-build container topology

pub mod capacity;
pub mod provisioner;
pub mod resolver;

pub use capacity::CapacityGate;
pub use provisioner::{ContainersProvisioner, ProvisionError, ProvisionerImages, TeardownReport};
