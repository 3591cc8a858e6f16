//! Configuration
//!
//! Shared types, workspace layout and the persisted bundle/state files.

pub mod oci;
pub mod paths;
pub mod types;
