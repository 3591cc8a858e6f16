//! turf: a lightweight sandbox runtime
//!
//! Realms (sandboxed processes) are created from OCI-style bundles and
//! driven either by one-shot CLI invocations (runc mode) or by a
//! single-threaded daemon reachable over a Unix socket.
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::signal`]: Signal self-pipe for the event loop
//! - [`kernel::namespace`]: Mount namespace, mounts and pivot_root
//! - [`kernel::capabilities`]: Bounding set, no_new_privs, uid/gid transitions
//! - [`kernel::procfs`]: `/proc/<pid>` sampling for health checks
//!
//! ## Execution Control ([`exec`])
//! - [`exec::preexec`]: Type-state ordered child setup before exec or clone return
//!
//! ## Runtime Core ([`core`])
//! - [`core::realm`]: Realm configuration and lifecycle state machine
//! - [`core::registry`]: Live realms of the daemon
//! - [`core::health`]: Memory/CPU enforcement with hysteresis
//! - [`core::runtime`]: Sandbox actions over a workspace
//! - [`core::seed`]: Warm-fork strategy for seed processes
//!
//! ## Wire Protocols ([`ipc`]) and Event Loop ([`event`])
//! - [`ipc::message`]: Checksummed seed/fork messages
//! - [`ipc::frame`]: CLI forwarding frames
//! - [`event`]: epoll loop with timers
//!
//! ## Client/Server ([`daemon`])
//! - [`daemon::server`]: The turf daemon
//! - [`daemon::client`]: `turf -H` forwarding with stop retries
//!
//! ## Configuration ([`config`]) and Utilities ([`utils`])
//! - [`config::types`]: Shared enums, flags and the error type
//! - [`config::paths`]: Workspace layout
//! - [`config::oci`]: `config.json` and `state.json`
//! - [`utils::fd_closure`]: Descriptor closing with a keep list

// Kernel Primitives
pub mod kernel;

// Execution Control
pub mod exec;

// Runtime core
pub mod core;

// Wire protocols and event loop
pub mod event;
pub mod ipc;

// Client/server mode
pub mod daemon;

// Configuration
pub mod config;

// Utilities
pub mod utils;

// CLI entrypoint wiring
pub mod cli;

pub use config::types::*;
