// Privilege helpers: capability probing, bounding-set drop, no_new_privs,
// and uid/gid transition.
//
// Everything except `has_sys_admin` and `effective_capabilities` may run in
// a forked child before exec, so none of these functions log.

use crate::config::types::{Result, TurfError};
use std::fs;

/// CAP_SYS_ADMIN capability number
pub const CAP_SYS_ADMIN: u32 = 21;
/// Highest capability number probed
const CAP_LAST_CAP: u32 = 40;

const PR_CAPBSET_READ: libc::c_int = 23;
const PR_CAPBSET_DROP: libc::c_int = 24;
const PR_SET_NO_NEW_PRIVS: libc::c_int = 38;
const PR_GET_NO_NEW_PRIVS: libc::c_int = 39;

/// Parse the `CapEff` mask out of `/proc/<pid>/status` contents.
pub fn parse_cap_eff(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("CapEff:"))
        .and_then(|hex| u64::from_str_radix(hex.trim(), 16).ok())
}

/// Effective capability mask of the calling process
pub fn effective_capabilities() -> Result<u64> {
    let status = fs::read_to_string("/proc/self/status")
        .map_err(|e| TurfError::Privilege(format!("Failed to read /proc/self/status: {}", e)))?;
    parse_cap_eff(&status)
        .ok_or_else(|| TurfError::Privilege("CapEff missing from /proc/self/status".to_string()))
}

/// True if the calling process may unshare namespaces and pivot_root.
pub fn has_sys_admin() -> bool {
    match effective_capabilities() {
        Ok(mask) => mask & (1u64 << CAP_SYS_ADMIN) != 0,
        Err(e) => {
            log::warn!("capability probe failed, assuming unprivileged: {}", e);
            false
        }
    }
}

/// Set no_new_privs so exec can never grant privileges.
pub fn set_no_new_privs() -> Result<()> {
    let result = unsafe { libc::prctl(PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if result != 0 {
        return Err(TurfError::Privilege(
            "Failed to set PR_SET_NO_NEW_PRIVS".to_string(),
        ));
    }
    Ok(())
}

pub fn check_no_new_privs() -> Result<bool> {
    let result = unsafe { libc::prctl(PR_GET_NO_NEW_PRIVS, 0, 0, 0, 0) };
    if result < 0 {
        return Err(TurfError::Privilege(
            "Failed to check PR_GET_NO_NEW_PRIVS".to_string(),
        ));
    }
    Ok(result == 1)
}

/// Capabilities currently in the bounding set
pub fn get_bounding_set() -> Vec<u32> {
    (0..=CAP_LAST_CAP)
        .filter(|cap| unsafe { libc::prctl(PR_CAPBSET_READ, *cap as libc::c_ulong, 0, 0, 0) } == 1)
        .collect()
}

/// Drop every capability not present in `keep` from the bounding set.
///
/// Missing capabilities (older kernels) are ignored; EPERM is not.
pub fn drop_bounding_set(keep: u64) -> Result<()> {
    for cap in 0..=CAP_LAST_CAP {
        if keep & (1u64 << cap) != 0 {
            continue;
        }
        let rc = unsafe { libc::prctl(PR_CAPBSET_DROP, cap as libc::c_ulong, 0, 0, 0) };
        if rc != 0 {
            let errno = nix::errno::Errno::last();
            if errno == nix::errno::Errno::EINVAL {
                continue;
            }
            return Err(TurfError::Privilege(format!(
                "Failed to drop capability {}: {}",
                cap, errno
            )));
        }
    }
    Ok(())
}

/// Switch to `uid`/`gid`: supplementary groups first, then setresgid, then setresuid.
///
/// Either id may be omitted to keep the current one.
pub fn transition_ids(uid: Option<u32>, gid: Option<u32>) -> Result<()> {
    if let Some(gid) = gid {
        // Unprivileged callers cannot clear groups; setresgid reports the real failure
        let _ = nix::unistd::setgroups(&[]);
        let rc =
            unsafe { libc::setresgid(gid as libc::gid_t, gid as libc::gid_t, gid as libc::gid_t) };
        if rc != 0 {
            return Err(TurfError::Privilege(format!(
                "Failed to setresgid({}): {}",
                gid,
                std::io::Error::last_os_error()
            )));
        }
    }
    if let Some(uid) = uid {
        let rc =
            unsafe { libc::setresuid(uid as libc::uid_t, uid as libc::uid_t, uid as libc::uid_t) };
        if rc != 0 {
            return Err(TurfError::Privilege(format!(
                "Failed to setresuid({}): {}",
                uid,
                std::io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

/// Current ids, for diagnostics
pub fn get_current_ids() -> String {
    use nix::unistd::{getegid, geteuid, getgid, getuid};

    format!(
        "UID: real={}, effective={} | GID: real={}, effective={}",
        getuid().as_raw(),
        geteuid().as_raw(),
        getgid().as_raw(),
        getegid().as_raw()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cap_eff() {
        let status = "Name:\tturf\nCapInh:\t0000000000000000\nCapEff:\t000001ffffffffff\n";
        let mask = parse_cap_eff(status).unwrap();
        assert_ne!(mask & (1 << CAP_SYS_ADMIN), 0);

        let unprivileged = "CapEff:\t0000000000000000\n";
        assert_eq!(parse_cap_eff(unprivileged), Some(0));
        assert_eq!(parse_cap_eff("Name:\tx\n"), None);
    }

    #[test]
    fn test_effective_capabilities_readable() {
        assert!(effective_capabilities().is_ok());
    }

    #[test]
    fn test_check_no_new_privs() {
        assert!(check_no_new_privs().is_ok());
    }

    #[test]
    fn test_get_current_ids() {
        let ids = get_current_ids();
        assert!(ids.contains("UID:"));
        assert!(ids.contains("GID:"));
    }

    #[test]
    fn test_transition_noop_without_ids() {
        assert!(transition_ids(None, None).is_ok());
    }
}
