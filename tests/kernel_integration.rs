//! Integration tests for the kernel module
//!
//! Privilege changes that cannot be undone run in a forked child so the test
//! process keeps its credentials. Everything here must pass unprivileged.

use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult};
use turf::kernel::capabilities::{
    check_no_new_privs, drop_bounding_set, effective_capabilities, get_bounding_set,
    get_current_ids, has_sys_admin, parse_cap_eff, set_no_new_privs, transition_ids, CAP_SYS_ADMIN,
};
use std::thread;
use std::time::{Duration, Instant};
use turf::kernel::procfs;

/// Run `f` in a forked child and return its exit code.
fn in_child(f: fn() -> i32) -> i32 {
    match unsafe { fork() }.unwrap() {
        ForkResult::Child => {
            let code = f();
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => match waitpid(child, None).unwrap() {
            WaitStatus::Exited(_, code) => code,
            other => panic!("child ended with {:?}", other),
        },
    }
}

#[test]
fn test_no_new_privs_sticks_in_child() {
    let code = in_child(|| {
        if set_no_new_privs().is_err() {
            return 1;
        }
        // Second call is a no-op
        if set_no_new_privs().is_err() {
            return 2;
        }
        match check_no_new_privs() {
            Ok(true) => 0,
            _ => 3,
        }
    });
    assert_eq!(code, 0);
}

#[test]
fn test_bounding_set_drop_matches_privilege() {
    let privileged = has_sys_admin();
    let code = in_child(|| {
        let before = get_bounding_set();
        match drop_bounding_set(0) {
            Ok(()) => {
                if get_bounding_set().is_empty() {
                    0
                } else {
                    10
                }
            }
            // Without CAP_SETPCAP the set must be left alone
            Err(_) if get_bounding_set() == before => 1,
            Err(_) => 11,
        }
    });
    if privileged {
        assert_eq!(code, 0, "privileged drop should empty the bounding set");
    } else {
        assert!(code == 0 || code == 1, "unexpected child code {}", code);
    }
}

#[test]
fn test_transition_to_current_ids_is_allowed() {
    let uid = nix::unistd::getuid().as_raw();
    let gid = nix::unistd::getgid().as_raw();
    let code = in_child(move_to_self);
    assert_eq!(code, 0, "switching to uid {} gid {} should succeed", uid, gid);
}

fn move_to_self() -> i32 {
    let uid = nix::unistd::getuid().as_raw();
    let gid = nix::unistd::getgid().as_raw();
    if transition_ids(Some(uid), Some(gid)).is_err() {
        return 1;
    }
    let ids = get_current_ids();
    if ids.contains(&format!("UID: real={}", uid)) {
        0
    } else {
        2
    }
}

#[test]
fn test_capability_queries_agree() {
    let status = std::fs::read_to_string("/proc/self/status").unwrap();
    let parsed = parse_cap_eff(&status).expect("CapEff line");
    assert_eq!(effective_capabilities().unwrap(), parsed);
    assert_eq!(has_sys_admin(), parsed & (1u64 << CAP_SYS_ADMIN) != 0);
}

#[test]
fn test_procfs_sees_a_running_child() {
    let mut child = std::process::Command::new("sleep")
        .arg("5")
        .spawn()
        .unwrap();
    let pid = child.id() as i32;

    assert!(procfs::pid_alive(pid));
    // rss stays 0 until the child has exec'd
    let deadline = Instant::now() + Duration::from_secs(3);
    let stat = loop {
        let stat = procfs::pid_stat(pid).unwrap();
        if stat.rss > 0 || Instant::now() >= deadline {
            break stat;
        }
        thread::sleep(Duration::from_millis(10));
    };
    assert_eq!(stat.pid, pid);
    assert!(stat.rss > 0);

    child.kill().unwrap();
    child.wait().unwrap();
    assert!(!procfs::pid_alive(pid));
}
