//! Core domain types
//!
//! These types describe which containers a build needs and which containers
//! it actually got. They are serializable so that a build's topology can be
//! persisted and picked up again by the next build of the same job.

pub mod container;
pub mod context;
pub mod definition;
pub mod job;
pub mod process;
