/// Mount namespace isolation and root pivoting for privileged realms
///
/// Paths are converted to `CString` before fork so the child side only
/// performs raw syscalls.
use crate::config::types::{Result, TurfError};

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::unistd::{chdir, chroot, fchdir};
use std::ffi::{CStr, CString};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

/// One mount applied inside a realm's private mount namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    /// Absolute path, interpreted relative to the realm root
    pub dest: String,
    pub fstype: String,
    pub flags: u64,
}

impl MountEntry {
    pub fn new(source: &str, dest: &str, fstype: &str, flags: u64) -> Result<Self> {
        if !dest.starts_with('/') {
            return Err(TurfError::InvalidArgument(format!(
                "mount destination '{}' must be absolute",
                dest
            )));
        }
        Ok(Self {
            source: source.to_string(),
            dest: dest.to_string(),
            fstype: fstype.to_string(),
            flags,
        })
    }

    /// Resolve the target under `root` and convert every field for use after fork.
    pub fn prepare(&self, root: Option<&str>) -> Result<PreparedMount> {
        let target = match root {
            Some(root) => format!("{}{}", root.trim_end_matches('/'), self.dest),
            None => self.dest.clone(),
        };
        Ok(PreparedMount {
            source: cstring(&self.source)?,
            target: cstring(&target)?,
            fstype: cstring(&self.fstype)?,
            flags: MsFlags::from_bits_truncate(self.flags as libc::c_ulong),
        })
    }
}

/// A mount entry ready for the child side of fork.
#[derive(Debug)]
pub struct PreparedMount {
    source: CString,
    target: CString,
    fstype: CString,
    flags: MsFlags,
}

pub(crate) fn cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| TurfError::InvalidArgument(format!("'{}' contains NUL", s)))
}

/// Detach from the parent's mount namespace.
pub fn unshare_mount_namespace() -> Result<()> {
    unshare(CloneFlags::CLONE_NEWNS).map_err(|e| {
        TurfError::Namespace(format!("Failed to unshare mount namespace: {}", e))
    })
}

/// Apply mounts in insertion order.
pub fn apply_mounts(mounts: &[PreparedMount]) -> Result<()> {
    for m in mounts {
        let fstype: Option<&CStr> = if m.fstype.as_bytes().is_empty() {
            None
        } else {
            Some(m.fstype.as_c_str())
        };
        mount(
            Some(m.source.as_c_str()),
            m.target.as_c_str(),
            fstype,
            m.flags,
            None::<&CStr>,
        )
        .map_err(|e| TurfError::Namespace(format!("mount {:?}: {}", m.target, e)))?;
    }
    Ok(())
}

fn open_dir(path: &CStr) -> Result<OwnedFd> {
    let fd = unsafe {
        libc::open(
            path.as_ptr(),
            libc::O_DIRECTORY | libc::O_RDONLY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(TurfError::Namespace(format!(
            "open {:?}: {}",
            path,
            std::io::Error::last_os_error()
        )));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Make `new_root` the process root and detach the old one.
///
/// Sequence: bind `new_root` onto itself, `pivot_root(".", ".")`, make the
/// stacked old root private and lazily unmount it, then chroot into "/".
pub fn pivot_into(new_root: &CStr) -> Result<()> {
    let old = open_dir(c"/")?;
    let new = open_dir(new_root)?;

    mount(
        Some(new_root),
        new_root,
        Some(c"bind"),
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&CStr>,
    )
    .map_err(|e| TurfError::Namespace(format!("bind mount {:?}: {}", new_root, e)))?;
    chdir(new_root)?;

    let rc = unsafe { libc::syscall(libc::SYS_pivot_root, c".".as_ptr(), c".".as_ptr()) };
    if rc != 0 {
        return Err(TurfError::Namespace(format!(
            "pivot_root: {}",
            std::io::Error::last_os_error()
        )));
    }

    fchdir(old.as_raw_fd())?;
    mount(
        None::<&CStr>,
        c".",
        None::<&CStr>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&CStr>,
    )
    .map_err(|e| TurfError::Namespace(format!("make old root private: {}", e)))?;
    umount2(c".", MntFlags::MNT_DETACH)
        .map_err(|e| TurfError::Namespace(format!("detach old root: {}", e)))?;

    fchdir(new.as_raw_fd())?;
    drop(old);
    drop(new);
    chroot(c"/")?;
    chdir(c"/")?;
    Ok(())
}

/// True when mount namespaces can be inspected on this system.
pub fn is_supported() -> bool {
    std::fs::metadata("/proc/self/ns/mnt").is_ok()
}
