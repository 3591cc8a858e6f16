//! Client/server mode.
//!
//! `server` is the long-running daemon behind `turf -D`; `client` forwards
//! a single command to it for `turf -H`. Both talk the frame protocol in
//! [`crate::ipc::frame`] over `<workdir>/turf.sock`.

pub mod client;
pub mod server;

pub use client::{RemoteClient, Reply};
pub use server::{CommandHandler, Daemon, DaemonConfig};
