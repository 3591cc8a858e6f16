//! Async-safe signal delivery through a self-pipe
//!
//! Handlers only write the signal number as one byte into a non-blocking
//! pipe. The event loop watches the read end and performs reaping and
//! shutdown outside signal context.
use log::info;
use nix::fcntl::OFlag;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::pipe2;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

use crate::config::types::{Result, TurfError};

/// Write end of the installed self-pipe (-1 when none)
static PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

/// Owner of the self-pipe; dropping it uninstalls the byte writer.
pub struct SignalPipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl SignalPipe {
    /// Create the pipe and route `signals` into it.
    ///
    /// Must be called before any realm is launched so SIGCHLD is never missed.
    pub fn install(signals: &[Signal]) -> Result<Self> {
        let (read, write) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)
            .map_err(|e| TurfError::Process(format!("Failed to create signal pipe: {}", e)))?;

        PIPE_WRITE_FD.store(write.as_raw_fd(), Ordering::SeqCst);

        let sig_action = SigAction::new(
            SigHandler::Handler(Self::signal_handler),
            SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
            SigSet::empty(),
        );

        for sig in signals {
            unsafe {
                signal::sigaction(*sig, &sig_action).map_err(|e| {
                    TurfError::Process(format!("Failed to install {} handler: {}", sig, e))
                })?;
            }
        }

        info!("Signal pipe installed for {:?}", signals);
        Ok(Self { read, write })
    }

    /// Only performs a single write(2): no allocation, no locks, no logging
    extern "C" fn signal_handler(signo: libc::c_int) {
        let fd = PIPE_WRITE_FD.load(Ordering::SeqCst);
        if fd < 0 {
            return;
        }
        let saved = nix::errno::Errno::last_raw();
        let byte = signo as u8;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
        nix::errno::Errno::set_raw(saved);
    }

    pub fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Read every pending signal, in delivery order, without blocking.
    pub fn drain(&self) -> Vec<Signal> {
        let mut pending = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.read.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
            for b in &buf[..n as usize] {
                if let Ok(sig) = Signal::try_from(*b as i32) {
                    pending.push(sig);
                }
            }
        }
        pending
    }

    /// Queue a signal number as if the handler had run.
    pub fn notify(&self, sig: Signal) {
        let byte = sig as i32 as u8;
        unsafe {
            libc::write(
                self.write.as_raw_fd(),
                &byte as *const u8 as *const libc::c_void,
                1,
            );
        }
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        let _ = PIPE_WRITE_FD.compare_exchange(
            self.write.as_raw_fd(),
            -1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

/// Clients may vanish mid-write; EPIPE is handled at the call site.
pub fn ignore_sigpipe() -> Result<()> {
    unsafe {
        signal::signal(Signal::SIGPIPE, SigHandler::SigIgn)
            .map_err(|e| TurfError::Process(format!("Failed to ignore SIGPIPE: {}", e)))?;
    }
    Ok(())
}

/// Restore default dispositions in a freshly forked child.
pub fn reset_child_signals() {
    for sig in [Signal::SIGCHLD, Signal::SIGTERM, Signal::SIGPIPE] {
        unsafe {
            let _ = signal::signal(sig, SigHandler::SigDfl);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test only: the handler target is process-global.
    #[test]
    fn test_signal_pipe_delivery() {
        let pipe = SignalPipe::install(&[Signal::SIGUSR1]).unwrap();
        pipe.notify(Signal::SIGCHLD);
        pipe.notify(Signal::SIGTERM);
        assert_eq!(pipe.drain(), vec![Signal::SIGCHLD, Signal::SIGTERM]);
        assert!(pipe.drain().is_empty());

        signal::raise(Signal::SIGUSR1).unwrap();
        assert_eq!(pipe.drain(), vec![Signal::SIGUSR1]);
    }
}
