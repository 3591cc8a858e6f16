//! Client/server round trip through a real daemon.
//!
//! The daemon reaps with `wait4(-1)`, so it runs in a forked child where
//! it cannot steal exits from other tests.

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use turf::cli::execute_remote;
use turf::config::oci::{OciSpec, OciState};
use turf::config::paths::Workdir;
use turf::core::runtime::Runtime;
use turf::daemon::{Daemon, DaemonConfig, RemoteClient};
use turf::{Mode, RealmState};

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn spawn_daemon(workdir: &Workdir) -> Pid {
    match unsafe { fork() }.unwrap() {
        ForkResult::Child => {
            // the realms run /bin/sh, which a pivoted overlay lacks
            let rt = Runtime::new(workdir.clone()).with_mode(Mode::Fallback);
            let mut config = DaemonConfig::new(workdir);
            config.foreground = true;
            config.health_interval_ms = 100;
            let mut daemon = Daemon::new(config, rt, execute_remote);
            let code = match daemon.bind().and_then(|_| daemon.serve()) {
                Ok(()) => 0,
                Err(_) => 1,
            };
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => child,
    }
}

fn wait_for_socket(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !path.exists() {
        assert!(Instant::now() < deadline, "daemon never bound {}", path.display());
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn test_remote_lifecycle() {
    let tmp = TempDir::new().unwrap();
    let workdir = Workdir::new(tmp.path().join("turf"));
    let rt = Runtime::new(workdir.clone());
    rt.init().unwrap();
    fs::create_dir_all(workdir.runtime_dir().join("node")).unwrap();

    let bundle = tmp.path().join("bundle");
    fs::create_dir_all(bundle.join("code")).unwrap();
    let mut spec = OciSpec::default_spec();
    spec.process.as_mut().unwrap().args = vec!["sh".into(), "-c".into(), "sleep 30".into()];
    spec.turf.as_mut().unwrap().binary = Some("/bin/sh".into());
    spec.save(&bundle.join("config.json")).unwrap();

    let daemon = spawn_daemon(&workdir);
    wait_for_socket(&workdir.socket_path());
    let client = RemoteClient::new(workdir.socket_path()).with_retry_interval(100);

    let bundle_arg = bundle.to_string_lossy().into_owned();
    client
        .send(&args(&["create", "-b", &bundle_arg, "sbx1"]))
        .unwrap();
    assert_eq!(
        client
            .send(&args(&["create", "-b", &bundle_arg, "sbx1"]))
            .unwrap_err()
            .errno(),
        libc::EEXIST
    );

    client.send(&args(&["start", "sbx1"])).unwrap();
    let state = OciState::load(&workdir.state_path("sbx1")).unwrap();
    assert_eq!(state.state, RealmState::Running);
    assert!(state.pid > 0);
    assert_eq!(
        client.send(&args(&["start", "sbx1"])).unwrap_err().errno(),
        libc::EBUSY
    );

    // Succeeds either at once or after the daemon reaps the realm
    client.send(&args(&["stop", "sbx1"])).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let state = OciState::load(&workdir.state_path("sbx1")).unwrap();
        if state.state == RealmState::Stopped && state.exit_code.is_some() {
            break;
        }
        assert!(Instant::now() < deadline, "exit never persisted");
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(
        client.send(&args(&["stop", "sbx1"])).unwrap_err().errno(),
        libc::ECHILD
    );

    client.send(&args(&["delete", "sbx1"])).unwrap();
    assert!(!workdir.sandbox("sbx1").exists());

    // Commands that only make sense locally are refused
    assert_eq!(
        client.send(&args(&["list"])).unwrap_err().errno(),
        libc::ENOTSUP
    );

    kill(daemon, Signal::SIGTERM).unwrap();
    assert_eq!(waitpid(daemon, None).unwrap(), WaitStatus::Exited(daemon, 0));
    assert!(!workdir.socket_path().exists());
}
