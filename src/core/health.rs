//! Periodic resource enforcement with hysteresis.
//!
//! A realm is only killed after several consecutive samples over its limit:
//! more than 3 for memory, more than 15 for CPU. Any sample within the limit
//! resets the corresponding counter.
use crate::config::types::{RealmStatus, Result};
use crate::core::registry::Registry;
use crate::kernel::procfs::{self, ProcStat};
use log::{debug, warn};
use nix::sys::signal::Signal;
use std::time::Instant;

/// Consecutive memory overages tolerated before a kill
pub const MEM_OVL_TOLERANCE: u32 = 3;
/// Consecutive CPU overages tolerated before a kill
pub const CPU_OVL_TOLERANCE: u32 = 15;
/// Health timer period
pub const HEALTH_INTERVAL_MS: u64 = 1000;

/// Outcome of one limit check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Check {
    Within,
    Over,
    Kill,
}

/// Per-realm hysteresis state.
#[derive(Clone, Debug, Default)]
pub struct Watch {
    mem_limit_kib: u64,
    cpu_limit_ms: u64,
    mem_overages: u32,
    cpu_overages: u32,
    last_cpu_used: u64,
    /// `None` until the first CPU sample
    last_sample: Option<Instant>,
}

impl Watch {
    pub fn new(mem_limit_kib: u64, cpu_limit_ms: u64) -> Self {
        Self {
            mem_limit_kib,
            cpu_limit_ms,
            ..Self::default()
        }
    }

    pub fn mem_overages(&self) -> u32 {
        self.mem_overages
    }

    pub fn cpu_overages(&self) -> u32 {
        self.cpu_overages
    }

    pub fn check_memory(&mut self, rss_kib: u64) -> Check {
        if self.mem_limit_kib > 0 && rss_kib > self.mem_limit_kib {
            self.mem_overages += 1;
            if self.mem_overages > MEM_OVL_TOLERANCE {
                return Check::Kill;
            }
            return Check::Over;
        }
        self.mem_overages = 0;
        Check::Within
    }

    /// `cpu_used_ms` is cumulative user+system time including reaped children.
    pub fn check_cpu(&mut self, cpu_used_ms: u64, now: Instant) -> Check {
        let last_used = std::mem::replace(&mut self.last_cpu_used, cpu_used_ms);
        let Some(last) = self.last_sample.replace(now) else {
            return Check::Within;
        };

        let wall_ms = now.saturating_duration_since(last).as_millis() as u64;
        if wall_ms == 0 {
            return Check::Within;
        }
        let usage = cpu_used_ms.saturating_sub(last_used) * 1000 / wall_ms;
        debug!("cpu usage {}ms/s, limit {}", usage, self.cpu_limit_ms);

        if self.cpu_limit_ms > 0 && usage > self.cpu_limit_ms {
            self.cpu_overages += 1;
            if self.cpu_overages > CPU_OVL_TOLERANCE {
                return Check::Kill;
            }
            return Check::Over;
        }
        self.cpu_overages = 0;
        Check::Within
    }
}

/// Source of per-process statistics.
pub trait ResourceSampler {
    fn sample(&mut self, pid: i32) -> Result<ProcStat>;
}

/// Reads `/proc/<pid>/stat` and `/proc/<pid>/io`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcSampler;

impl ResourceSampler for ProcSampler {
    fn sample(&mut self, pid: i32) -> Result<ProcStat> {
        procfs::pid_stat(pid)
    }
}

/// One health pass over the registry.
///
/// Realms whose exit was already recorded are evicted instead of sampled.
/// Returns the names of realms killed in this pass.
pub fn health_check(
    registry: &mut Registry,
    sampler: &mut dyn ResourceSampler,
    now: Instant,
) -> Vec<String> {
    for name in registry.evict_exited() {
        debug!("evicted exited realm {}", name);
    }

    let mut killed = Vec::new();
    for sbx in registry.iter_mut() {
        let pid = sbx.realm.pid();
        if pid <= 0 {
            continue;
        }
        let stat = match sampler.sample(pid) {
            Ok(stat) => stat,
            Err(e) => {
                warn!("pid_stat({}) failed: {}", pid, e);
                continue;
            }
        };

        let mut kill = false;
        match sbx.watch.check_memory(stat.rss) {
            Check::Within => {}
            Check::Over => sbx.realm.mark(RealmStatus::MEM_OVL),
            Check::Kill => {
                sbx.realm.mark(RealmStatus::MEM_OVL);
                warn!("{} ({}) reaches the mem limit", sbx.realm.name(), pid);
                kill = true;
            }
        }
        match sbx.watch.check_cpu(stat.cpu_used_ms(), now) {
            Check::Within => {}
            Check::Over => sbx.realm.mark(RealmStatus::CPU_OVL),
            Check::Kill => {
                sbx.realm.mark(RealmStatus::CPU_OVL);
                warn!("{} ({}) reaches the cpu limit", sbx.realm.name(), pid);
                kill = true;
            }
        }

        if kill {
            let _ = sbx.realm.kill(Signal::SIGKILL);
            sbx.realm.mark(RealmStatus::KILL);
            killed.push(sbx.realm.name().to_string());
        }
        sbx.last_stat = Some(stat);
    }
    killed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_memory_kill_after_fourth_overage() {
        let mut w = Watch::new(1024, 0);
        assert_eq!(w.check_memory(2048), Check::Over);
        assert_eq!(w.check_memory(2048), Check::Over);
        assert_eq!(w.check_memory(2048), Check::Over);
        assert_eq!(w.check_memory(2048), Check::Kill);
    }

    #[test]
    fn test_memory_counter_resets() {
        let mut w = Watch::new(1024, 0);
        for _ in 0..3 {
            assert_eq!(w.check_memory(4096), Check::Over);
        }
        assert_eq!(w.check_memory(512), Check::Within);
        assert_eq!(w.mem_overages(), 0);
        for _ in 0..3 {
            assert_eq!(w.check_memory(4096), Check::Over);
        }
        assert_eq!(w.check_memory(4096), Check::Kill);
    }

    #[test]
    fn test_no_limit_never_kills() {
        let mut w = Watch::new(0, 0);
        let t0 = Instant::now();
        for i in 0..40u64 {
            assert_eq!(w.check_memory(u64::MAX), Check::Within);
            assert_eq!(
                w.check_cpu(i * 1000, t0 + Duration::from_secs(i)),
                Check::Within
            );
        }
    }

    #[test]
    fn test_first_cpu_sample_is_never_over() {
        let mut w = Watch::new(0, 100);
        assert_eq!(w.check_cpu(1_000_000, Instant::now()), Check::Within);
    }

    #[test]
    fn test_cpu_kill_after_sixteenth_overage() {
        // 100ms/s allowed, burning 900ms per second
        let mut w = Watch::new(0, 100);
        let t0 = Instant::now();
        assert_eq!(w.check_cpu(0, t0), Check::Within);
        for i in 1..=15u64 {
            let now = t0 + Duration::from_secs(i);
            assert_eq!(w.check_cpu(i * 900, now), Check::Over, "sample {}", i);
        }
        assert_eq!(
            w.check_cpu(16 * 900, t0 + Duration::from_secs(16)),
            Check::Kill
        );
    }

    #[test]
    fn test_zero_elapsed_is_ignored() {
        let mut w = Watch::new(0, 100);
        let t0 = Instant::now();
        w.check_cpu(0, t0);
        assert_eq!(w.check_cpu(5000, t0), Check::Within);
    }
}
