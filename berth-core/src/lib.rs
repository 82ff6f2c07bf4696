//! Berth Core
//!
//! Core types for provisioning per-build container topologies.
//!
//! This crate contains the domain types shared by the runner and anything that
//! persists or inspects build state:
//! - Container instances and the per-build topology context
//! - Container definitions (fixed image or label-derived)
//! - Job container specifications and process-start descriptions

pub mod domain;
