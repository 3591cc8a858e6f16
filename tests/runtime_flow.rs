//! End-to-end sandbox lifecycle in runc mode (no daemon, no registry).

use std::fs;
use std::path::PathBuf;
use std::process::{Child, Command};
use tempfile::TempDir;
use turf::config::oci::{OciSpec, OciState};
use turf::config::paths::Workdir;
use turf::core::realm::ExitKind;
use turf::core::runtime::{CreateOptions, Runtime, StartOptions, DEFAULT_STOP_WAIT};
use turf::{Mode, RealmState};

fn workspace() -> (TempDir, Runtime) {
    let tmp = TempDir::new().unwrap();
    // /bin/sh only exists outside the pivoted overlay
    let rt = Runtime::new(Workdir::new(tmp.path().join("turf"))).with_mode(Mode::Fallback);
    rt.init().unwrap();
    fs::create_dir_all(rt.workdir().runtime_dir().join("node/bin")).unwrap();
    (tmp, rt)
}

/// A bundle running `/bin/sh -c <script>` from its code directory.
fn shell_bundle(tmp: &TempDir, script: &str) -> CreateOptions {
    let dir = tmp.path().join("bundle");
    fs::create_dir_all(dir.join("code")).unwrap();
    let mut spec = OciSpec::default_spec();
    spec.process.as_mut().unwrap().args = vec!["sh".into(), "-c".into(), script.into()];
    spec.turf.as_mut().unwrap().binary = Some("/bin/sh".into());
    spec.save(&dir.join("config.json")).unwrap();
    CreateOptions {
        bundle: Some(dir),
        ..CreateOptions::default()
    }
}

/// Pretend `name` is running as `child`.
fn mark_running(rt: &Runtime, name: &str, child: &Child) -> PathBuf {
    let path = rt.workdir().state_path(name);
    let mut state = OciState::load(&path).unwrap();
    state.state = RealmState::Running;
    state.pid = child.id() as i32;
    state.save(&path).unwrap();
    path
}

#[test]
fn test_runc_start_blocks_and_persists_exit() {
    let (tmp, rt) = workspace();
    let opts = shell_bundle(&tmp, "exit 7");
    rt.create("sbx1", &opts).unwrap();

    let outcome = rt.start("sbx1", &StartOptions::default(), None).unwrap();
    assert!(outcome.pid > 0);
    let status = outcome.exit_status.expect("runc start waits");

    let state = OciState::load(&rt.workdir().state_path("sbx1")).unwrap();
    assert_eq!(state.state, RealmState::Stopped);
    assert_eq!(state.pid, outcome.pid);
    assert_eq!(state.exit_code, Some(status));
    assert!(state.stopped.is_some());
    assert!(state.rusage.is_some());

    assert_eq!(ExitKind::from_wait_status(status), ExitKind::Exited(7));
}

#[test]
fn test_stdout_redirect_and_env_override() {
    let (tmp, rt) = workspace();
    let opts = shell_bundle(&tmp, "echo $GREETING");
    rt.create("sbx1", &opts).unwrap();

    let out = tmp.path().join("out.log");
    let start = StartOptions {
        stdout: Some(out.to_string_lossy().into_owned()),
        env: vec!["GREETING=hello".to_string()],
        ..StartOptions::default()
    };
    let outcome = rt.start("sbx1", &start, None).unwrap();
    assert_eq!(
        ExitKind::from_wait_status(outcome.exit_status.unwrap()),
        ExitKind::Exited(0)
    );
    assert_eq!(fs::read_to_string(&out).unwrap(), "hello\n");
}

#[test]
fn test_run_refuses_existing_sandbox() {
    let (tmp, rt) = workspace();
    let opts = shell_bundle(&tmp, "exit 0");
    rt.run("sbx1", &opts, &StartOptions::default(), None).unwrap();
    let err = rt
        .run("sbx1", &opts, &StartOptions::default(), None)
        .unwrap_err();
    assert_eq!(err.errno(), libc::EEXIST);
}

#[test]
fn test_stop_reports_eagain_until_reaped() {
    let (tmp, rt) = workspace();
    rt.create("sbx1", &shell_bundle(&tmp, "exit 0")).unwrap();
    let mut child = Command::new("sleep").arg("30").spawn().unwrap();
    let path = mark_running(&rt, "sbx1", &child);

    // SIGTERM lands but the zombie still exists until someone reaps it
    let err = rt.stop("sbx1", false, DEFAULT_STOP_WAIT, None).unwrap_err();
    assert_eq!(err.errno(), libc::EAGAIN);
    assert_eq!(OciState::load(&path).unwrap().state, RealmState::Running);

    child.wait().unwrap();
    rt.stop("sbx1", false, DEFAULT_STOP_WAIT, None).unwrap();
    let state = OciState::load(&path).unwrap();
    assert_eq!(state.state, RealmState::Stopped);
    assert!(state.stopped.is_some());

    let err = rt.stop("sbx1", false, DEFAULT_STOP_WAIT, None).unwrap_err();
    assert_eq!(err.errno(), libc::ECHILD);
}

#[test]
fn test_delete_live_sandbox_needs_force() {
    let (tmp, rt) = workspace();
    rt.create("sbx1", &shell_bundle(&tmp, "exit 0")).unwrap();
    let mut child = Command::new("sleep").arg("30").spawn().unwrap();
    mark_running(&rt, "sbx1", &child);

    assert_eq!(rt.delete("sbx1", false).unwrap_err().errno(), libc::EBUSY);
    assert!(rt.workdir().sandbox("sbx1").is_dir());

    rt.delete("sbx1", true).unwrap();
    assert!(!rt.workdir().sandbox("sbx1").exists());
    assert!(!rt.workdir().overlay("sbx1").exists());

    let status = child.wait().unwrap();
    use std::os::unix::process::ExitStatusExt;
    assert_eq!(status.signal(), Some(libc::SIGKILL));
}

#[test]
fn test_state_and_events_of_live_sandbox() {
    let (tmp, rt) = workspace();
    rt.create("sbx1", &shell_bundle(&tmp, "exit 0")).unwrap();
    let mut child = Command::new("sleep").arg("30").spawn().unwrap();
    mark_running(&rt, "sbx1", &child);

    let report = rt.state("sbx1").unwrap();
    assert!(report.live.is_some());
    let text = report.to_string();
    assert!(text.contains("state: running\n"));
    assert!(text.contains("stat.rss: "));

    let events = rt.events("sbx1").unwrap();
    let json = serde_json::to_value(&events).unwrap();
    assert_eq!(json["id"], "sbx1");
    assert_eq!(json["state"], "running");
    assert!(json.get("stat").is_some());

    let ps = rt.ps().unwrap();
    assert_eq!(ps[0].state, RealmState::Running);

    child.kill().unwrap();
    child.wait().unwrap();
    assert!(rt.state("sbx1").unwrap().live.is_none());
    assert_eq!(rt.ps().unwrap()[0].state, RealmState::Stopped);
}
