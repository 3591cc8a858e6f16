//! Thin wrappers around Linux kernel primitives.
//!
//! Most `unsafe` code is concentrated here.
//! Dependency direction: signal -> procfs -> capabilities -> namespace

pub mod capabilities;
pub mod namespace;
pub mod procfs;
pub mod signal;
