//! Daemon-side limit enforcement against real child processes.
//!
//! Samples come from a scripted sampler so the hysteresis is deterministic;
//! the kill itself hits a real `sleep`.

use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, Command};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use turf::config::oci::OciState;
use turf::config::paths::Workdir;
use turf::core::health::{health_check, ResourceSampler};
use turf::core::realm::Realm;
use turf::core::registry::Registry;
use turf::core::runtime::Runtime;
use turf::kernel::procfs::ProcStat;
use turf::{RealmState, RealmStatus, ResourceUsage, Result};

/// Fixed RSS, CPU time growing by `cpu_step_ms` per sample.
struct Scripted {
    rss_kib: u64,
    cpu_step_ms: u64,
    cpu_ms: u64,
}

impl ResourceSampler for Scripted {
    fn sample(&mut self, pid: i32) -> Result<ProcStat> {
        self.cpu_ms += self.cpu_step_ms;
        Ok(ProcStat {
            pid,
            rss: self.rss_kib,
            utime: self.cpu_ms,
            ..ProcStat::default()
        })
    }
}

fn workspace() -> (TempDir, Runtime) {
    let tmp = TempDir::new().unwrap();
    let rt = Runtime::new(Workdir::new(tmp.path().join("turf")));
    rt.init().unwrap();
    (tmp, rt)
}

/// Register a running `sleep` under `name` with the given limits.
fn register(rt: &Runtime, reg: &mut Registry, name: &str, mem_kib: u64, cpu_ms: u64) -> Child {
    fs::create_dir_all(rt.workdir().sandbox(name)).unwrap();
    let child = Command::new("sleep").arg("30").spawn().unwrap();

    let mut realm = Realm::new(name);
    if mem_kib > 0 {
        realm.limit_mem(mem_kib).unwrap();
    }
    if cpu_ms > 0 {
        realm.limit_cpu(cpu_ms).unwrap();
    }
    realm.set_pid(child.id() as i32);
    realm.set_state(RealmState::Running);
    reg.insert(realm).unwrap();
    child
}

/// Reap `child` and feed the exit back the way the daemon does.
fn reap(rt: &Runtime, reg: &mut Registry, mut child: Child) -> i32 {
    let pid = child.id() as i32;
    let status = child.wait().unwrap();
    assert_eq!(status.signal(), Some(libc::SIGKILL));
    rt.child_exit(reg, pid, status.into_raw(), ResourceUsage::default())
        .unwrap();
    pid
}

#[test]
fn test_memory_overage_kills_on_fourth_sample() {
    let (_tmp, rt) = workspace();
    let mut reg = Registry::new();
    let child = register(&rt, &mut reg, "sbx1", 64 * 1024, 0);
    let mut sampler = Scripted {
        rss_kib: 100 * 1024,
        cpu_step_ms: 0,
        cpu_ms: 0,
    };

    let t0 = Instant::now();
    for tick in 1..=3u64 {
        let killed = health_check(&mut reg, &mut sampler, t0 + Duration::from_secs(tick));
        assert!(killed.is_empty(), "killed early on tick {}", tick);
        let sbx = reg.get("sbx1").unwrap();
        assert!(sbx.realm.status().contains(RealmStatus::MEM_OVL));
        assert_eq!(sbx.watch.mem_overages() as u64, tick);
    }
    let killed = health_check(&mut reg, &mut sampler, t0 + Duration::from_secs(4));
    assert_eq!(killed, vec!["sbx1".to_string()]);

    let pid = reap(&rt, &mut reg, child);
    let state = OciState::load(&rt.workdir().state_path("sbx1")).unwrap();
    assert_eq!(state.state, RealmState::Stopped);
    assert_eq!(state.pid, pid);
    assert!(state.status.contains(RealmStatus::MEM_OVL));
    assert!(state.status.contains(RealmStatus::KILL));
    assert!(!state.status.contains(RealmStatus::CPU_OVL));
    assert_eq!(state.stat.map(|s| s.rss), Some(100 * 1024));

    // The next pass drops the exited entry instead of sampling it
    assert!(health_check(&mut reg, &mut sampler, t0 + Duration::from_secs(5)).is_empty());
    assert!(reg.get("sbx1").is_none());
}

#[test]
fn test_cpu_overage_kills_on_sixteenth_sample() {
    let (_tmp, rt) = workspace();
    let mut reg = Registry::new();
    // 100ms/s allowed, the sampler reports 900ms per second
    let child = register(&rt, &mut reg, "sbx2", 0, 100);
    let mut sampler = Scripted {
        rss_kib: 1024,
        cpu_step_ms: 900,
        cpu_ms: 0,
    };

    let t0 = Instant::now();
    // First sample only establishes the baseline
    assert!(health_check(&mut reg, &mut sampler, t0).is_empty());
    for tick in 1..=15u64 {
        assert!(health_check(&mut reg, &mut sampler, t0 + Duration::from_secs(tick)).is_empty());
    }
    let killed = health_check(&mut reg, &mut sampler, t0 + Duration::from_secs(16));
    assert_eq!(killed, vec!["sbx2".to_string()]);

    reap(&rt, &mut reg, child);
    let state = OciState::load(&rt.workdir().state_path("sbx2")).unwrap();
    assert!(state.status.contains(RealmStatus::CPU_OVL));
    assert!(state.status.contains(RealmStatus::KILL));
    assert!(!state.status.contains(RealmStatus::MEM_OVL));
}

#[test]
fn test_dip_below_limit_resets_the_count() {
    let (_tmp, rt) = workspace();
    let mut reg = Registry::new();
    let mut child = register(&rt, &mut reg, "sbx3", 64 * 1024, 0);
    let mut high = Scripted {
        rss_kib: 100 * 1024,
        cpu_step_ms: 0,
        cpu_ms: 0,
    };
    let mut low = Scripted {
        rss_kib: 1024,
        cpu_step_ms: 0,
        cpu_ms: 0,
    };

    let t0 = Instant::now();
    for tick in 0..3u64 {
        assert!(health_check(&mut reg, &mut high, t0 + Duration::from_secs(tick)).is_empty());
    }
    assert!(health_check(&mut reg, &mut low, t0 + Duration::from_secs(3)).is_empty());
    for tick in 4..7u64 {
        assert!(health_check(&mut reg, &mut high, t0 + Duration::from_secs(tick)).is_empty());
    }
    assert_eq!(reg.get("sbx3").unwrap().watch.mem_overages(), 3);

    child.kill().unwrap();
    child.wait().unwrap();
}
