use crate::config::types::{Mode, Result, TurfError};
/// Child-side launch sequence
///
/// Everything the child needs is converted into a `LaunchPlan` in the parent,
/// so between fork and exec only raw syscalls run: no logging, and no
/// allocation on the happy path.
///
/// The sequence is fixed and encoded as a type-state chain:
///
/// FreshChild -> StdioReady -> Isolated -> PrivsLocked
///
/// 1. parent death signal, default signal dispositions
/// 2. stdio wiring (terminal or /dev/null + append-mode redirect files)
/// 3. inherited fd closure, keeping stdio and the warm-fork peer
/// 4. setsid
/// 5. sysadmin: unshare(NEWNS), mounts, pivot_root; fallback: chdir
/// 6. sysadmin: bounding set drop, setresgid then setresuid
/// 7. prctl(PR_SET_NO_NEW_PRIVS, 1)
/// 8. execve, or environment replacement for a warm-fork clone
use crate::kernel::capabilities::{drop_bounding_set, set_no_new_privs, transition_ids};
use crate::kernel::namespace::{apply_mounts, pivot_into, unshare_mount_namespace, PreparedMount};
use crate::kernel::signal::reset_child_signals;
use crate::utils::fd_closure::close_inherited_fds;
use std::ffi::{CStr, CString};
use std::marker::PhantomData;
use std::os::fd::RawFd;

/// Exit status of a child that failed before or at exec
pub const EXIT_LAUNCH_FAILED: i32 = 127;

/// Launch parameters in their post-fork form
#[derive(Debug)]
pub struct LaunchPlan {
    pub mode: Mode,
    pub binary: CString,
    pub argv: Vec<CString>,
    /// `KEY=VALUE` entries handed to execve
    pub envp: Vec<CString>,
    /// The same entries split for setenv in a warm-fork clone
    pub env_pairs: Vec<(CString, CString)>,
    pub chroot: Option<CString>,
    pub stdout: Option<CString>,
    pub stderr: Option<CString>,
    pub terminal: bool,
    /// Close inherited descriptors; a warm-fork clone keeps the seed's
    pub close_fds: bool,
    /// Sorted, includes 0, 1 and 2
    pub keep_fds: Vec<RawFd>,
    pub mounts: Vec<PreparedMount>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub capbset: Option<u64>,
}

/// Split `KEY=VALUE` into setenv arguments; entries without '=' get an empty value.
pub fn split_env(entry: &CStr) -> Result<(CString, CString)> {
    let bytes = entry.to_bytes();
    let (key, value) = match bytes.iter().position(|b| *b == b'=') {
        Some(pos) => (&bytes[..pos], &bytes[pos + 1..]),
        None => (bytes, &b""[..]),
    };
    if key.is_empty() {
        return Err(TurfError::InvalidArgument(format!(
            "environment entry {:?} has no key",
            entry
        )));
    }
    // Neither half can hold NUL: both are slices of a CStr
    let key = CString::new(key).map_err(|_| TurfError::InvalidArgument("env key".into()))?;
    let value = CString::new(value).map_err(|_| TurfError::InvalidArgument("env value".into()))?;
    Ok((key, value))
}

// ============================================================================
// Parent Death Signal Setup
// ============================================================================

/// Kill the child if the launching process goes away.
pub fn setup_parent_death_signal() -> Result<()> {
    use nix::sys::prctl;
    use nix::sys::signal::Signal;

    prctl::set_pdeathsig(Signal::SIGKILL)
        .map_err(|e| TurfError::Process(format!("Failed to set parent death signal: {}", e)))
}

// ============================================================================
// Type-State Launch Chain
// ============================================================================

/// Type-state marker: fresh child, nothing set up yet
pub struct FreshChild;

/// Type-state marker: stdio wired, inherited fds closed
pub struct StdioReady;

/// Type-state marker: new session, root changed
pub struct Isolated;

/// Type-state marker: privileges dropped and locked
pub struct PrivsLocked;

/// A child process part-way through its launch sequence
pub struct ChildSetup<'a, S> {
    plan: &'a LaunchPlan,
    _state: PhantomData<S>,
}

impl<'a, S> ChildSetup<'a, S> {
    fn advance<T>(self) -> ChildSetup<'a, T> {
        ChildSetup {
            plan: self.plan,
            _state: PhantomData,
        }
    }
}

fn dup2(from: RawFd, to: RawFd) -> Result<()> {
    if unsafe { libc::dup2(from, to) } < 0 {
        return Err(TurfError::Process(format!(
            "dup2({}, {}): {}",
            from,
            to,
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

fn open_redirect(path: &CStr) -> RawFd {
    unsafe {
        libc::open(
            path.as_ptr(),
            libc::O_WRONLY | libc::O_APPEND | libc::O_CREAT,
            0o644 as libc::c_uint,
        )
    }
}

impl<'a> ChildSetup<'a, FreshChild> {
    pub fn new(plan: &'a LaunchPlan) -> Self {
        Self {
            plan,
            _state: PhantomData,
        }
    }

    /// Steps 1 to 3.
    pub fn wire_stdio(self) -> Result<ChildSetup<'a, StdioReady>> {
        reset_child_signals();
        setup_parent_death_signal()?;

        if self.plan.terminal {
            for fd in 0..=2 {
                dup2(fd, fd)?;
            }
        } else {
            let null = unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDWR) };
            if null < 0 {
                return Err(TurfError::Process("open /dev/null failed".to_string()));
            }
            // An unopenable redirect target degrades to /dev/null
            let out = self.plan.stdout.as_deref().map(open_redirect).unwrap_or(-1);
            let err = self.plan.stderr.as_deref().map(open_redirect).unwrap_or(-1);

            dup2(null, 0)?;
            dup2(if out >= 0 { out } else { null }, 1)?;
            dup2(if err >= 0 { err } else { null }, 2)?;
            for fd in [null, out, err] {
                if fd > 2 {
                    unsafe { libc::close(fd) };
                }
            }
        }

        if self.plan.close_fds {
            close_inherited_fds(&self.plan.keep_fds)?;
        }
        Ok(self.advance())
    }
}

impl<'a> ChildSetup<'a, StdioReady> {
    /// Steps 4 and 5.
    pub fn isolate(self) -> Result<ChildSetup<'a, Isolated>> {
        nix::unistd::setsid()
            .map_err(|e| TurfError::Process(format!("setsid failed: {}", e)))?;

        match self.plan.mode {
            Mode::Sysadmin => {
                unshare_mount_namespace()?;
                apply_mounts(&self.plan.mounts)?;
                if let Some(root) = &self.plan.chroot {
                    pivot_into(root)?;
                }
            }
            Mode::Fallback => {
                if let Some(dir) = &self.plan.chroot {
                    nix::unistd::chdir(dir.as_c_str())?;
                }
            }
        }
        Ok(self.advance())
    }
}

impl<'a> ChildSetup<'a, Isolated> {
    /// Steps 6 and 7.
    pub fn lock_privileges(self) -> Result<ChildSetup<'a, PrivsLocked>> {
        if self.plan.mode == Mode::Sysadmin {
            if let Some(mask) = self.plan.capbset {
                drop_bounding_set(mask)?;
            }
            transition_ids(self.plan.uid, self.plan.gid)?;
        }
        set_no_new_privs()?;
        Ok(self.advance())
    }
}

impl<'a> ChildSetup<'a, PrivsLocked> {
    /// Replace the process image. Only returns on failure.
    pub fn exec_payload(self) -> TurfError {
        match nix::unistd::execve(&self.plan.binary, &self.plan.argv, &self.plan.envp) {
            Ok(never) => match never {},
            Err(e) => TurfError::Process(format!("execve failed: {}", e)),
        }
    }

    /// Swap the inherited environment for the plan's (warm-fork clones keep running).
    pub fn replace_environment(self) -> Result<()> {
        if unsafe { libc::clearenv() } != 0 {
            return Err(TurfError::Process("clearenv failed".to_string()));
        }
        for (key, value) in &self.plan.env_pairs {
            if unsafe { libc::setenv(key.as_ptr(), value.as_ptr(), 1) } != 0 {
                return Err(TurfError::Process(format!("setenv {:?} failed", key)));
            }
        }
        Ok(())
    }
}

/// Child entry point of `run`: never returns.
///
/// The parent only learns about a failed launch through the exit status.
pub fn exec_child(plan: &LaunchPlan) -> ! {
    if let Ok(ready) = ChildSetup::new(plan)
        .wire_stdio()
        .and_then(|s| s.isolate())
        .and_then(|s| s.lock_privileges())
    {
        let _ = ready.exec_payload();
    }
    unsafe { libc::_exit(EXIT_LAUNCH_FAILED) }
}

/// Child entry point of the warm-fork variant: returns to keep running the clone.
pub fn prepare_clone(plan: &LaunchPlan) -> Result<()> {
    ChildSetup::new(plan)
        .wire_stdio()?
        .isolate()?
        .lock_privileges()?
        .replace_environment()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_env() {
        let (k, v) = split_env(c"PATH=/bin:/usr/bin").unwrap();
        assert_eq!(k.to_str().unwrap(), "PATH");
        assert_eq!(v.to_str().unwrap(), "/bin:/usr/bin");

        let (k, v) = split_env(c"A=b=c").unwrap();
        assert_eq!(k.to_str().unwrap(), "A");
        assert_eq!(v.to_str().unwrap(), "b=c");

        let (k, v) = split_env(c"FLAG").unwrap();
        assert_eq!(k.to_str().unwrap(), "FLAG");
        assert!(v.as_bytes().is_empty());

        assert!(split_env(c"=oops").is_err());
    }
}
