//! Scheduler layer for the runner
//!
//! Reads build descriptions and drives each build through the container
//! provisioner step by step, recording its context for the next build of the
//! same job. Concurrent builds share one capacity gate.

pub mod build;

pub use build::{BuildDescription, BuildRunner};
