//! Binary wire protocols
//!
//! `message` carries seed/warm-fork coordination over a socketpair;
//! `frame` carries forwarded CLI commands over the daemon socket. Both sit
//! on the bounds-checked cursors in `codec`.

pub mod codec;
pub mod frame;
pub mod message;
