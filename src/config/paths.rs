//! Workspace layout.
//!
//! Everything turf persists lives under one root directory:
//!
//! ```text
//! <workdir>/
//!   turf.sock          daemon control socket
//!   libturf.so         warm-fork injection library (default location)
//!   sandbox/<name>/    config.json + state.json per sandbox
//!   runtime/<rt>/      installed runtimes (binary search roots)
//!   overlay/<name>/    per-sandbox code, work and data dirs
//! ```
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Overrides the default `~/.turf` workspace root
pub const ENV_WORKDIR: &str = "TURF_WORKDIR";
/// Overrides the injection library path
pub const ENV_LIBTURF_PATH: &str = "LIBTURF_PATH";
/// Carries the warm-fork socket fd number into a seed process
pub const ENV_PHD_FD: &str = "TURFPHD_FD";

const SOCKET_NAME: &str = "turf.sock";
const LIBTURF_NAME: &str = "libturf.so";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Workdir {
    root: PathBuf,
}

impl Workdir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the workspace root from `TURF_WORKDIR`, falling back to `$HOME/.turf`.
    ///
    /// `TURF_WORKDIR` is only honored when it is absolute and longer than "/".
    pub fn from_env() -> Self {
        if let Ok(dir) = std::env::var(ENV_WORKDIR) {
            if dir.starts_with('/') && dir.len() >= 2 {
                return Self::new(dir);
            }
            log::warn!("ignoring {}={}: not an absolute directory", ENV_WORKDIR, dir);
        }
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        Self::new(Path::new(&home).join(".turf"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sandbox_dir(&self) -> PathBuf {
        self.root.join("sandbox")
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.root.join("runtime")
    }

    pub fn overlay_dir(&self) -> PathBuf {
        self.root.join("overlay")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.root.join(SOCKET_NAME)
    }

    pub fn sandbox(&self, name: &str) -> PathBuf {
        self.sandbox_dir().join(name)
    }

    pub fn overlay(&self, name: &str) -> PathBuf {
        self.overlay_dir().join(name)
    }

    pub fn spec_path(&self, name: &str) -> PathBuf {
        self.sandbox(name).join("config.json")
    }

    pub fn state_path(&self, name: &str) -> PathBuf {
        self.sandbox(name).join("state.json")
    }

    /// Injection library handed to seed realms through `LD_PRELOAD`.
    pub fn libturf_path(&self) -> PathBuf {
        if let Ok(p) = std::env::var(ENV_LIBTURF_PATH) {
            if p.len() > 3 {
                if is_executable(Path::new(&p)) {
                    return PathBuf::from(p);
                }
                log::error!("invalid {}: {} is not executable", ENV_LIBTURF_PATH, p);
            }
        }
        self.root.join(LIBTURF_NAME)
    }
}

fn is_executable(path: &Path) -> bool {
    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    unsafe { libc::access(c_path.as_ptr(), libc::X_OK) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let wd = Workdir::new("/var/lib/turf");
        assert_eq!(wd.socket_path(), PathBuf::from("/var/lib/turf/turf.sock"));
        assert_eq!(
            wd.state_path("sbx1"),
            PathBuf::from("/var/lib/turf/sandbox/sbx1/state.json")
        );
        assert_eq!(wd.overlay("sbx1"), PathBuf::from("/var/lib/turf/overlay/sbx1"));
        assert_eq!(wd.runtime_dir(), PathBuf::from("/var/lib/turf/runtime"));
    }

    #[test]
    fn test_libturf_default_location() {
        let wd = Workdir::new("/nonexistent/turf");
        if std::env::var(ENV_LIBTURF_PATH).is_err() {
            assert_eq!(wd.libturf_path(), PathBuf::from("/nonexistent/turf/libturf.so"));
        }
    }
}
