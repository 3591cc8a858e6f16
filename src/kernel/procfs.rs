/// Per-process statistics sampled from procfs
///
/// `/proc/<pid>/stat` provides CPU times (converted from clock ticks to
/// milliseconds), memory (converted to KiB), fault counters and the thread
/// count. `/proc/<pid>/io` adds I/O counters when readable.
use crate::config::types::{Result, TurfError};
use nix::sys::signal::kill;
use nix::unistd::{sysconf, Pid, SysconfVar};
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::OnceLock;

/// Used when sysconf cannot tell
const FALLBACK_CLOCK_TICKS_HZ: u64 = 100;
const FALLBACK_PAGE_SIZE: u64 = 4096;

/// Kernel units of `/proc/<pid>/stat`, queried once per process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatUnits {
    /// Clock ticks per second (`_SC_CLK_TCK`)
    pub ticks_hz: u64,
    /// Bytes per RSS page (`_SC_PAGE_SIZE`)
    pub page_size: u64,
}

impl StatUnits {
    pub fn host() -> Self {
        static UNITS: OnceLock<StatUnits> = OnceLock::new();
        *UNITS.get_or_init(|| StatUnits {
            ticks_hz: query(SysconfVar::CLK_TCK, FALLBACK_CLOCK_TICKS_HZ),
            page_size: query(SysconfVar::PAGE_SIZE, FALLBACK_PAGE_SIZE),
        })
    }
}

fn query(var: SysconfVar, fallback: u64) -> u64 {
    match sysconf(var) {
        Ok(Some(v)) if v > 0 => v as u64,
        other => {
            log::warn!("sysconf({:?}) gave {:?}, assuming {}", var, other, fallback);
            fallback
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcStat {
    pub pid: i32,
    pub ppid: i32,
    pub pgid: i32,
    pub sid: i32,
    pub min_flt: u64,
    pub cmin_flt: u64,
    pub maj_flt: u64,
    pub cmaj_flt: u64,
    /// user time, ms
    pub utime: u64,
    /// system time, ms
    pub stime: u64,
    /// reaped children user time, ms
    pub cutime: u64,
    /// reaped children system time, ms
    pub cstime: u64,
    pub num_threads: u64,
    /// virtual size, KiB
    pub vsize: u64,
    /// resident set, KiB
    pub rss: u64,
    #[serde(default)]
    pub rchar: u64,
    #[serde(default)]
    pub wchar: u64,
    #[serde(default)]
    pub syscr: u64,
    #[serde(default)]
    pub syscw: u64,
    #[serde(default)]
    pub read_bytes: u64,
    #[serde(default)]
    pub write_bytes: u64,
    #[serde(default)]
    pub cancelled_write_bytes: u64,
}

impl ProcStat {
    /// CPU time consumed by the process and its reaped children, ms.
    pub fn cpu_used_ms(&self) -> u64 {
        self.utime + self.stime + self.cutime + self.cstime
    }
}

/// Parse the contents of `/proc/<pid>/stat` using this host's units.
pub fn parse_stat(content: &str) -> Result<ProcStat> {
    parse_stat_with(content, StatUnits::host())
}

/// Parse the contents of `/proc/<pid>/stat`.
///
/// The command name (field 2) may contain spaces and parentheses, so the
/// remaining fields are split after the last `)`.
pub fn parse_stat_with(content: &str, units: StatUnits) -> Result<ProcStat> {
    let open = content
        .find('(')
        .ok_or_else(|| TurfError::InvalidArgument("stat: missing comm".to_string()))?;
    let close = content
        .rfind(')')
        .ok_or_else(|| TurfError::InvalidArgument("stat: missing comm".to_string()))?;

    let pid_field = content[..open].trim();
    // fields[0] is field 3 (state)
    let fields: Vec<&str> = content[close + 1..].split_whitespace().collect();
    if fields.len() < 22 {
        return Err(TurfError::InvalidArgument(format!(
            "stat: expected at least 24 fields, got {}",
            fields.len() + 2
        )));
    }

    let num = |idx: usize| -> u64 { fields[idx - 2].parse::<u64>().unwrap_or(0) };
    let ticks_to_ms = |ticks: u64| ticks * 1000 / units.ticks_hz;
    let signed = |idx: usize| -> i32 { fields[idx - 2].parse::<i32>().unwrap_or(0) };

    Ok(ProcStat {
        pid: pid_field.parse().unwrap_or(0),
        ppid: signed(3),
        pgid: signed(4),
        sid: signed(5),
        min_flt: num(9),
        cmin_flt: num(10),
        maj_flt: num(11),
        cmaj_flt: num(12),
        utime: ticks_to_ms(num(13)),
        stime: ticks_to_ms(num(14)),
        cutime: ticks_to_ms(num(15)),
        cstime: ticks_to_ms(num(16)),
        num_threads: num(19),
        vsize: num(22) / 1024,
        rss: num(23) * units.page_size / 1024,
        ..ProcStat::default()
    })
}

/// Fill I/O counters from the contents of `/proc/<pid>/io`.
pub fn parse_io(content: &str, stat: &mut ProcStat) {
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().parse::<u64>().unwrap_or(0);
        match key.trim() {
            "rchar" => stat.rchar = value,
            "wchar" => stat.wchar = value,
            "syscr" => stat.syscr = value,
            "syscw" => stat.syscw = value,
            "read_bytes" => stat.read_bytes = value,
            "write_bytes" => stat.write_bytes = value,
            "cancelled_write_bytes" => stat.cancelled_write_bytes = value,
            _ => {}
        }
    }
}

/// Sample a live process.
///
/// Fails with `NotFound` if the pid is gone. A missing or unreadable
/// `io` file is not an error (it needs ptrace access on some systems).
pub fn pid_stat(pid: i32) -> Result<ProcStat> {
    if pid <= 1 {
        return Err(TurfError::InvalidArgument(format!("invalid pid {}", pid)));
    }
    if kill(Pid::from_raw(pid), None).is_err() {
        return Err(TurfError::NotFound(format!("pid {}", pid)));
    }

    let content = fs::read_to_string(format!("/proc/{}/stat", pid))
        .map_err(|e| TurfError::NotFound(format!("/proc/{}/stat: {}", pid, e)))?;
    let mut stat = parse_stat(&content)?;

    match fs::read_to_string(format!("/proc/{}/io", pid)) {
        Ok(io) => parse_io(&io, &mut stat),
        Err(e) => log::debug!("proc.io.pid {} unavailable: {}", pid, e),
    }

    Ok(stat)
}

/// True if a signal can be delivered to `pid` (the process exists).
pub fn pid_alive(pid: i32) -> bool {
    pid > 0 && kill(Pid::from_raw(pid), None).is_ok()
}
