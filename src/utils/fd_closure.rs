/// Inherited file descriptor closure
///
/// Prefers close_range(2) over the gaps between the descriptors to keep,
/// falling back to iterating /proc/self/fd on kernels without it.
/// Runs in a forked child before exec, so it never logs.
use crate::config::types::{Result, TurfError};
use std::fs;
use std::os::fd::RawFd;

use nix::unistd::close;

/// Close every descriptor except those in `keep`.
///
/// `keep` must be sorted ascending; `sorted_keep_list` builds one.
pub fn close_inherited_fds(keep: &[RawFd]) -> Result<()> {
    if try_close_range(keep) {
        return Ok(());
    }
    close_fds_via_proc(keep)
}

/// Sort and dedup a keep list ahead of fork.
pub fn sorted_keep_list(fds: &[RawFd]) -> Vec<RawFd> {
    let mut keep: Vec<RawFd> = fds.iter().copied().filter(|fd| *fd >= 0).collect();
    keep.sort_unstable();
    keep.dedup();
    keep
}

fn close_range(first: u32, last: u32) -> bool {
    let rc = unsafe { libc::syscall(libc::SYS_close_range, first, last, 0 as libc::c_uint) };
    rc == 0
}

fn try_close_range(keep: &[RawFd]) -> bool {
    let mut next: u32 = 0;
    for fd in keep {
        let fd = *fd as u32;
        if fd > next && !close_range(next, fd - 1) {
            return false;
        }
        next = fd.saturating_add(1);
    }
    close_range(next, u32::MAX)
}

fn close_fds_via_proc(keep: &[RawFd]) -> Result<()> {
    let fd_dir = "/proc/self/fd";

    let entries = fs::read_dir(fd_dir)
        .map_err(|e| TurfError::Process(format!("Failed to read {}: {}", fd_dir, e)))?;

    // Collect first: closing while the directory stream is open would close its own fd
    let open: Vec<RawFd> = entries
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter_map(|name| name.parse::<RawFd>().ok())
        .collect();

    for fd in open {
        if keep.binary_search(&fd).is_err() {
            match close(fd) {
                Ok(()) | Err(nix::errno::Errno::EBADF) => {}
                Err(e) => {
                    return Err(TurfError::Process(format!("Failed to close fd {}: {}", fd, e)))
                }
            }
        }
    }
    Ok(())
}

/// Sorted list of open file descriptors
pub fn get_open_fds() -> Result<Vec<RawFd>> {
    let fd_dir = "/proc/self/fd";

    let entries = fs::read_dir(fd_dir)
        .map_err(|e| TurfError::Process(format!("Failed to read {}: {}", fd_dir, e)))?;

    let mut fds: Vec<RawFd> = entries
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter_map(|name| name.parse::<RawFd>().ok())
        .collect();

    fds.sort();
    Ok(fds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_open_fds() {
        let fds = get_open_fds().unwrap();
        assert!(fds.contains(&0));
        assert!(fds.contains(&1));
        assert!(fds.contains(&2));
    }

    #[test]
    fn test_sorted_keep_list() {
        assert_eq!(sorted_keep_list(&[7, 2, -1, 0, 2, 1]), vec![0, 1, 2, 7]);
    }

    #[test]
    fn test_close_keeps_listed_fd_in_child() {
        use nix::sys::wait::{waitpid, WaitStatus};
        use nix::unistd::{fork, ForkResult};
        use std::os::fd::AsRawFd;

        let keep_file = tempfile::tempfile().unwrap();
        let drop_file = tempfile::tempfile().unwrap();
        let keep_fd = keep_file.as_raw_fd();
        let drop_fd = drop_file.as_raw_fd();
        let keep = sorted_keep_list(&[0, 1, 2, keep_fd]);

        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let ok = close_inherited_fds(&keep).is_ok()
                    && unsafe { libc::fcntl(keep_fd, libc::F_GETFD) } >= 0
                    && unsafe { libc::fcntl(drop_fd, libc::F_GETFD) } < 0;
                unsafe { libc::_exit(if ok { 0 } else { 1 }) };
            }
            ForkResult::Parent { child } => {
                let status = waitpid(child, None).unwrap();
                assert_eq!(status, WaitStatus::Exited(child, 0));
            }
        }
    }
}
