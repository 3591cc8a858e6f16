//! Sandbox runtime core.
//!
//! `realm` owns the process model and lifecycle state machine, `registry`
//! and `health` are the daemon's live view of running realms, `runtime`
//! implements the CLI actions over a workspace and `seed` is the warm-fork
//! side of the seed protocol.

pub mod health;
pub mod realm;
pub mod registry;
pub mod runtime;
pub mod seed;
