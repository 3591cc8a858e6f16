//! Execution control
//!
//! Turns a realm's configuration into a launched child process.

pub mod preexec;
