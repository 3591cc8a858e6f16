//! Warm-fork coordination on the seed side.
//!
//! A seed realm is a pre-started process that answers FORK_REQ messages by
//! cloning itself into a new realm. Whether a given program can act as a
//! seed is a strategy choice: programs that embed `SeedLoop` serve requests,
//! everything else gets `NoWarmFork`.
use crate::config::paths::ENV_PHD_FD;
use crate::config::types::{Result, TurfError};
use crate::core::realm::{ForkOutcome, Realm};
use crate::ipc::message::{read_message, write_message, ForkResponse, Message};
use log::{debug, info, warn};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

/// Result of offering this process as a warm-fork seed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WarmForkOutcome {
    /// No seed support; run the workload normally
    Unsupported,
    /// Running inside a fresh clone; run the workload with this argv
    Cloned { argv: Vec<String> },
}

pub trait WarmFork {
    /// Serve fork requests until this process becomes a clone.
    ///
    /// In the seed this only returns once the channel is gone; the clone
    /// returns `Cloned` with its own argv.
    fn attempt_warm_fork(&mut self) -> Result<WarmForkOutcome>;
}

/// Strategy for processes started without a seed channel.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoWarmFork;

impl WarmFork for NoWarmFork {
    fn attempt_warm_fork(&mut self) -> Result<WarmForkOutcome> {
        Ok(WarmForkOutcome::Unsupported)
    }
}

/// Seed loop over the socketpair inherited from the daemon.
#[derive(Debug)]
pub struct SeedLoop {
    channel: UnixStream,
}

impl SeedLoop {
    pub fn new(channel: UnixStream) -> Self {
        Self { channel }
    }

    pub fn from_fd(fd: OwnedFd) -> Self {
        Self::new(UnixStream::from(fd))
    }

    /// Adopt the descriptor named by `TURFPHD_FD`, if any.
    ///
    /// Standard streams are never accepted as the channel.
    pub fn from_env() -> Option<Self> {
        let raw = std::env::var(ENV_PHD_FD).ok()?;
        let fd: RawFd = match raw.trim().parse() {
            Ok(fd) if fd > 2 => fd,
            _ => {
                warn!("ignoring {}={}: not a usable descriptor", ENV_PHD_FD, raw);
                return None;
            }
        };
        if nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_GETFD).is_err() {
            warn!("{}={} is not open", ENV_PHD_FD, fd);
            return None;
        }
        // SAFETY: the descriptor was handed to us through the environment
        // and nothing else in this process owns it.
        Some(Self::from_fd(unsafe { OwnedFd::from_raw_fd(fd) }))
    }
}

impl WarmFork for SeedLoop {
    fn attempt_warm_fork(&mut self) -> Result<WarmForkOutcome> {
        write_message(&mut self.channel, &Message::SeedReady)?;
        info!("seed ready (pid {})", std::process::id());

        loop {
            let req = match read_message(&mut self.channel) {
                Ok(Message::ForkReq(req)) => req,
                Ok(other) => {
                    warn!("seed: ignoring {} message", other.msg_type().name());
                    continue;
                }
                Err(TurfError::Protocol(e)) => {
                    warn!("seed: dropping malformed message: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut realm = Realm::from_fork_request(req);
            debug!("seed: fork request for {}", realm.name());
            // pid 0 tells the daemon the clone never happened
            let pid = match realm.fork() {
                Ok(ForkOutcome::Parent(pid)) => pid as u32,
                Ok(ForkOutcome::Child) => {
                    return Ok(WarmForkOutcome::Cloned {
                        argv: realm.config().argv.clone(),
                    });
                }
                Err(e) => {
                    warn!("seed: cannot clone {}: {}", realm.name(), e);
                    0
                }
            };
            let rsp = ForkResponse {
                pid,
                name: realm.name().to_string(),
            };
            write_message(&mut self.channel, &Message::ForkRsp(rsp))?;
        }
    }
}

/// Pick the strategy for the current process.
pub fn warm_fork_strategy() -> Box<dyn WarmFork> {
    match SeedLoop::from_env() {
        Some(seed) => Box::new(seed),
        None => Box::new(NoWarmFork),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::message::ForkRequest;
    use std::io::Write;

    #[test]
    fn test_no_warm_fork_is_unsupported() {
        assert_eq!(
            NoWarmFork.attempt_warm_fork().unwrap(),
            WarmForkOutcome::Unsupported
        );
    }

    #[test]
    fn test_seed_announces_then_fails_on_closed_channel() {
        let (mut ours, theirs) = UnixStream::pair().unwrap();
        let mut seed = SeedLoop::new(theirs);

        // Queue a stray SEED_READY, then half-close: the loop skips the
        // unexpected message and errors out on EOF.
        write_message(&mut ours, &Message::SeedReady).unwrap();
        ours.flush().unwrap();
        ours.shutdown(std::net::Shutdown::Write).unwrap();

        assert!(seed.attempt_warm_fork().is_err());
        assert_eq!(read_message(&mut ours).unwrap(), Message::SeedReady);
    }

    #[test]
    fn test_seed_survives_corrupt_and_unclonable_requests() {
        let (mut ours, theirs) = UnixStream::pair().unwrap();
        let mut seed = SeedLoop::new(theirs);

        let bad_env = ForkRequest {
            argv: vec!["app".into()],
            env: vec!["=no-key".into()],
            name: "clone1".into(),
            ..ForkRequest::default()
        };
        let mut corrupt = Vec::new();
        write_message(&mut corrupt, &Message::ForkReq(bad_env.clone())).unwrap();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0x20;

        ours.write_all(&corrupt).unwrap();
        write_message(&mut ours, &Message::ForkReq(bad_env)).unwrap();
        ours.shutdown(std::net::Shutdown::Write).unwrap();

        // Only the closed channel ends the loop
        let err = seed.attempt_warm_fork().unwrap_err();
        assert!(matches!(err, TurfError::Io(_)), "{:?}", err);

        assert_eq!(read_message(&mut ours).unwrap(), Message::SeedReady);
        assert_eq!(
            read_message(&mut ours).unwrap(),
            Message::ForkRsp(ForkResponse {
                pid: 0,
                name: "clone1".into(),
            })
        );
    }

    #[test]
    fn test_fork_request_fields_survive() {
        let req = ForkRequest {
            argv: vec!["app".into(), "--port".into(), "80".into()],
            name: "clone1".into(),
            ..ForkRequest::default()
        };
        let realm = Realm::from_fork_request(req);
        assert_eq!(realm.name(), "clone1");
        assert_eq!(realm.config().argv.len(), 3);
    }
}
