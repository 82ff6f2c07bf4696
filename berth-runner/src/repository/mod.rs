//! Repository layer
//!
//! Repositories persist build state between builds. They are trait-based so
//! the harness can swap storage without touching the provisioning logic.

mod contexts;

pub use contexts::{ContextStore, FileContextStore};
