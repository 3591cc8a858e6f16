//! Sandbox actions over a workspace.
//!
//! Every CLI command ends up here, whether it runs in a one-shot process
//! (runc mode) or inside the daemon. Daemon calls pass the live registry;
//! runc calls pass `None` and block in `wait` where the daemon would not.
use crate::config::oci::{rfc3339_nanos, OciSpec, OciState};
use crate::config::paths::{Workdir, ENV_PHD_FD};
use crate::config::types::{
    validate_sandbox_name, Mode, RealmState, RealmStatus, ResourceUsage, Result, TurfError,
};
use crate::core::realm::{ExitKind, Realm, SeedChannel};
use crate::core::registry::Registry;
use crate::ipc::message::{ForkResponse, Message};
use crate::kernel::procfs::{self, ProcStat};
use chrono::Utc;
use log::{debug, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

/// Directories searched, in order, under `runtime/<rt>/`
const BINARY_SEARCH_DIRS: [&str; 5] = [".", "bin", "sbin", "usr/bin", "usr/sbin"];

/// Default `stop -t`
pub const DEFAULT_STOP_WAIT: u32 = 3;

const DEFAULT_CODE_DIR: &str = "code";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateOptions {
    /// Bundle directory holding `config.json` and the code directory
    pub bundle: Option<PathBuf>,
    pub mem_mb: Option<u32>,
    pub cpu_pct: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StartOptions {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    /// `KEY=VALUE` overrides on top of the bundle's environment
    pub env: Vec<String>,
    /// Clone from this seed realm instead of launching
    pub seed: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StartOutcome {
    /// 0 while a warm-fork clone is pending
    pub pid: i32,
    /// Daemon end of a seed realm's channel, to be watched by the caller
    pub seed_fd: Option<RawFd>,
    /// Raw wait status, runc mode only
    pub exit_status: Option<i32>,
}

/// One line of `turf ps`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PsEntry {
    pub name: String,
    pub pid: i32,
    pub state: RealmState,
}

impl fmt::Display for PsEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<30} {:>5} {}", self.name, self.pid, self.state)
    }
}

/// Output of `turf state`.
#[derive(Clone, Debug, PartialEq)]
pub struct StateReport {
    pub state: OciState,
    /// Present while the recorded pid is alive
    pub live: Option<ProcStat>,
}

impl fmt::Display for StateReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = &self.state;
        writeln!(f, "name: {}", st.id)?;
        writeln!(f, "pid: {}", st.pid)?;
        writeln!(f, "state: {}", st.state)?;
        if let Some(created) = st.created.as_ref() {
            writeln!(f, "created: {}", rfc3339_nanos::format(created))?;
        }

        if st.status.is_empty() {
            writeln!(f, "status: 0")?;
        } else {
            if st.status.contains(RealmStatus::CPU_OVL) {
                writeln!(f, "status.cpu_overload: 1")?;
            }
            if st.status.contains(RealmStatus::MEM_OVL) {
                writeln!(f, "status.mem_overload: 1")?;
            }
            if st.status.contains(RealmStatus::KILL) {
                writeln!(f, "status.killed: 1")?;
            }
        }

        if let Some(stat) = self.live.as_ref() {
            writeln!(f, "stat.utime: {}", stat.utime)?;
            writeln!(f, "stat.stime: {}", stat.stime)?;
            writeln!(f, "stat.cutime: {}", stat.cutime)?;
            writeln!(f, "stat.cstime: {}", stat.cstime)?;
            writeln!(f, "stat.vsize: {}", stat.vsize)?;
            writeln!(f, "stat.rss: {}", stat.rss)?;
            writeln!(f, "stat.min_flt: {}", stat.min_flt)?;
            writeln!(f, "stat.maj_flt: {}", stat.maj_flt)?;
            writeln!(f, "stat.num_threads: {}", stat.num_threads)?;
            writeln!(f, "io.read_bytes: {}", stat.read_bytes)?;
            return writeln!(f, "io.write_bytes: {}", stat.write_bytes);
        }

        if let Some(stopped) = st.stopped.as_ref() {
            writeln!(f, "stopped: {}", rfc3339_nanos::format(stopped))?;
        }
        match st.exit_code.map(ExitKind::from_wait_status) {
            Some(ExitKind::Exited(code)) => writeln!(f, "exitcode: {}", code)?,
            Some(ExitKind::Signaled(sig)) => writeln!(f, "killed.signal: {}", sig)?,
            Some(ExitKind::Unknown(raw)) => writeln!(f, "exitstatus: {:#x}", raw)?,
            None => {}
        }
        if let Some(ru) = st.rusage.as_ref() {
            writeln!(f, "rusage.utime: {}", ru.utime)?;
            writeln!(f, "rusage.stime: {}", ru.stime)?;
            writeln!(f, "rusage.maxrss: {}", ru.maxrss)?;
        }
        Ok(())
    }
}

/// Snapshot printed by `turf events`.
#[derive(Clone, Debug, Serialize)]
pub struct EventSnapshot {
    pub id: String,
    pub pid: i32,
    pub state: RealmState,
    pub status: RealmStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stat: Option<ProcStat>,
}

#[derive(Clone, Debug)]
pub struct Runtime {
    workdir: Workdir,
    /// Isolation mode for new realms; detected per realm when unset
    mode: Option<Mode>,
}

impl Runtime {
    pub fn new(workdir: Workdir) -> Self {
        Self {
            workdir,
            mode: None,
        }
    }

    /// Launch every realm in `mode` instead of the detected one.
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn mode(&self) -> Option<Mode> {
        self.mode
    }

    pub fn workdir(&self) -> &Workdir {
        &self.workdir
    }

    pub fn init(&self) -> Result<()> {
        for dir in [
            self.workdir.root().to_path_buf(),
            self.workdir.sandbox_dir(),
            self.workdir.runtime_dir(),
            self.workdir.overlay_dir(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        info!("workdir initialized at {}", self.workdir.root().display());
        Ok(())
    }

    /// Write the default `config.json` into `bundle` (or the current dir).
    pub fn spec(&self, opts: &CreateOptions) -> Result<PathBuf> {
        let dir = opts.bundle.clone().unwrap_or_else(|| PathBuf::from("."));
        let mut spec = OciSpec::default_spec();
        spec.apply_limits(opts.mem_mb, opts.cpu_pct);
        let path = dir.join("config.json");
        spec.save(&path)?;
        Ok(path)
    }

    pub fn create(&self, name: &str, opts: &CreateOptions) -> Result<()> {
        validate_sandbox_name(name)?;
        let bundle = opts.bundle.clone().unwrap_or_else(|| PathBuf::from("."));
        let mut spec = OciSpec::load(&bundle.join("config.json"))
            .map_err(|e| TurfError::InvalidArgument(format!("bundle spec: {}", e)))?;

        if self.workdir.sandbox(name).exists() {
            return Err(TurfError::Exists(format!("sandbox {}", name)));
        }
        if self.workdir.overlay(name).exists() {
            return Err(TurfError::Exists(format!("overlay {}", name)));
        }
        let runtime = spec
            .runtime()
            .ok_or_else(|| TurfError::Config("spec has no turf.runtime".to_string()))?;
        if !self.workdir.runtime_dir().join(runtime).is_dir() {
            return Err(TurfError::NotFound(format!("runtime {}", runtime)));
        }

        fs::create_dir_all(self.workdir.sandbox(name))?;
        let overlay = self.workdir.overlay(name);
        fs::create_dir_all(overlay.join("work"))?;
        fs::create_dir_all(overlay.join("data"))?;

        spec.apply_limits(opts.mem_mb, opts.cpu_pct);
        spec.save(&self.workdir.spec_path(name))?;

        let code = spec.code().unwrap_or(DEFAULT_CODE_DIR).to_string();
        let src = bundle.join(&code);
        if src.is_dir() {
            copy_tree(&src, &overlay.join(&code))?;
        } else {
            debug!("bundle has no {} directory", code);
        }

        OciState::create(name, &bundle.to_string_lossy()).save(&self.workdir.state_path(name))?;
        info!("sandbox {} created", name);
        Ok(())
    }

    pub fn delete(&self, name: &str, force: bool) -> Result<()> {
        validate_sandbox_name(name)?;
        let dir = self.workdir.sandbox(name);
        if !dir.exists() {
            return Err(TurfError::NotFound(format!("sandbox {}", name)));
        }

        if let Ok(state) = OciState::load(&self.workdir.state_path(name)) {
            if state.state != RealmState::Stopped && procfs::pid_alive(state.pid) {
                if !force {
                    return Err(TurfError::Busy(name.to_string()));
                }
                warn!("force delete: killing {} ({})", name, state.pid);
                let _ = kill(Pid::from_raw(state.pid), Signal::SIGKILL);
            }
        }

        remove_tree(&dir)?;
        remove_tree(&self.workdir.overlay(name))?;
        info!("sandbox {} deleted", name);
        Ok(())
    }

    /// Sandbox names, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        list_dirs(&self.workdir.sandbox_dir())
    }

    /// Installed runtimes, sorted.
    pub fn runtimes(&self) -> Result<Vec<String>> {
        list_dirs(&self.workdir.runtime_dir())
    }

    pub fn ps(&self) -> Result<Vec<PsEntry>> {
        let mut out = Vec::new();
        for name in self.list()? {
            let Ok(state) = OciState::load(&self.workdir.state_path(&name)) else {
                continue;
            };
            let live = procfs::pid_alive(state.pid);
            out.push(PsEntry {
                name,
                pid: state.pid,
                state: if live { state.state } else { RealmState::Stopped },
            });
        }
        Ok(out)
    }

    pub fn state(&self, name: &str) -> Result<StateReport> {
        validate_sandbox_name(name)?;
        let state = OciState::load(&self.workdir.state_path(name))?;
        let live = if state.state != RealmState::Stopped && procfs::pid_alive(state.pid) {
            procfs::pid_stat(state.pid).ok()
        } else {
            None
        };
        Ok(StateReport { state, live })
    }

    pub fn events(&self, name: &str) -> Result<EventSnapshot> {
        let report = self.state(name)?;
        Ok(EventSnapshot {
            id: report.state.id,
            pid: report.state.pid,
            state: report.state.state,
            status: report.state.status,
            stat: report.live,
        })
    }

    pub fn info(&self) -> String {
        format!(
            "workdir: {}\nsocket: {}\nlibturf: {}",
            self.workdir.root().display(),
            self.workdir.socket_path().display(),
            self.workdir.libturf_path().display()
        )
    }

    /// Resolve the binary for `argv0` inside runtime `rt`.
    pub fn find_binary(&self, rt: &str, argv0: &str) -> Result<PathBuf> {
        if argv0.starts_with('/') {
            return Ok(PathBuf::from(argv0));
        }
        let root = self.workdir.runtime_dir().join(rt);
        BINARY_SEARCH_DIRS
            .iter()
            .map(|dir| root.join(dir).join(argv0))
            .find(|p| p.is_file())
            .ok_or_else(|| TurfError::NotFound(format!("binary {} in runtime {}", argv0, rt)))
    }

    /// Configure a realm from the sandbox spec.
    fn prepare(&self, name: &str, spec: &OciSpec, opts: &StartOptions) -> Result<Realm> {
        let mut realm = Realm::new(name);
        if let Some(mode) = self.mode {
            realm.set_mode(mode)?;
        }

        let code = spec.code().unwrap_or(DEFAULT_CODE_DIR);
        let chroot = self.workdir.overlay(name).join(code);
        realm.set_chroot(&chroot.to_string_lossy())?;

        let argv = spec.args().to_vec();
        let argv0 = argv
            .first()
            .ok_or_else(|| TurfError::Config(format!("{}: spec has no process.args", name)))?;
        let binary = match spec.binary() {
            Some(bin) => PathBuf::from(bin),
            None => {
                let rt = spec
                    .runtime()
                    .ok_or_else(|| TurfError::Config("spec has no turf.runtime".to_string()))?;
                self.find_binary(rt, argv0)?
            }
        };
        realm.set_binary(&binary.to_string_lossy())?;

        let mut env = spec.env().to_vec();
        for kv in &opts.env {
            merge_env(&mut env, kv)?;
        }

        if spec.is_seed() {
            let channel = SeedChannel::pair()?;
            let child_fd = channel.child_fd().unwrap_or(-1);
            merge_env(
                &mut env,
                &format!("LD_PRELOAD={}", self.workdir.libturf_path().display()),
            )?;
            merge_env(&mut env, &format!("{}={}", ENV_PHD_FD, child_fd))?;
            realm.set_socketpair(channel)?;
        }
        realm.set_args(argv)?;
        realm.set_env(env)?;

        if let Some(kib) = spec.memory_limit_kib() {
            realm.limit_mem(kib)?;
        }
        if let Some(ms) = spec.cpu_limit_ms() {
            realm.limit_cpu(ms)?;
        }
        if let Some(uid) = spec.uid() {
            realm.set_uid(uid)?;
        }
        if let Some(gid) = spec.gid() {
            realm.set_gid(gid)?;
        }
        realm.set_terminal(spec.terminal())?;
        if let Some(path) = opts.stdout.as_deref() {
            realm.set_stdout(path)?;
        }
        if let Some(path) = opts.stderr.as_deref() {
            realm.set_stderr(path)?;
        }
        Ok(realm)
    }

    /// Launch a created sandbox.
    ///
    /// With a registry (daemon mode) the realm is registered and this
    /// returns at once; without one it blocks until the realm exits.
    pub fn start(
        &self,
        name: &str,
        opts: &StartOptions,
        registry: Option<&mut Registry>,
    ) -> Result<StartOutcome> {
        validate_sandbox_name(name)?;
        let spec = OciSpec::load(&self.workdir.spec_path(name))?;
        let state_path = self.workdir.state_path(name);
        let mut state = OciState::load_or_create(&state_path, name)?;

        if state.state != RealmState::Stopped && procfs::pid_alive(state.pid) {
            return Err(TurfError::Busy(name.to_string()));
        }
        if let Some(reg) = registry.as_deref() {
            if reg.get(name).is_some_and(|s| s.is_live()) {
                return Err(TurfError::Busy(name.to_string()));
            }
        }

        let mut realm = self.prepare(name, &spec, opts)?;
        state.status = RealmStatus::OK;
        state.exit_code = None;
        state.rusage = None;
        state.stat = None;
        state.stopped = None;
        state.created = Some(Utc::now());

        if let Some(seed) = opts.seed.as_deref() {
            let reg = registry.ok_or_else(|| {
                TurfError::NotSupported("cloning from a seed needs the daemon".to_string())
            })?;
            self.request_clone(reg, seed, &realm)?;
            realm.set_state(RealmState::Cloning);
            state.pid = 0;
            state.state = RealmState::Cloning;
            state.save(&state_path)?;
            reg.insert(realm)?;
            return Ok(StartOutcome::default());
        }

        let pid = realm.run()?;
        state.pid = pid;
        state.state = RealmState::Running;
        state.save(&state_path)?;

        match registry {
            Some(reg) => {
                let seed_fd = realm.channel_fd();
                reg.insert(realm)?;
                Ok(StartOutcome {
                    pid,
                    seed_fd,
                    exit_status: None,
                })
            }
            None => {
                let status = realm.wait()?;
                state.state = RealmState::Stopped;
                state.stopped = realm.stopped();
                state.exit_code = Some(status);
                state.rusage = realm.rusage();
                state.status = realm.status();
                state.save(&state_path)?;
                Ok(StartOutcome {
                    pid,
                    seed_fd: None,
                    exit_status: Some(status),
                })
            }
        }
    }

    fn request_clone(&self, registry: &mut Registry, seed: &str, realm: &Realm) -> Result<()> {
        let sbx = registry
            .get_mut(seed)
            .ok_or_else(|| TurfError::NotFound(format!("seed {}", seed)))?;
        if sbx.realm.state() != RealmState::ForkWait {
            warn!("seed {} is {}, not ready", seed, sbx.realm.state());
        }
        let channel = sbx
            .realm
            .channel_mut()
            .ok_or_else(|| TurfError::InvalidArgument(format!("{} is not a seed", seed)))?;
        channel.send(&Message::ForkReq(realm.fork_request()))?;
        info!("fork request for {} sent to seed {}", realm.name(), seed);
        Ok(())
    }

    /// Create and start in one step.
    pub fn run(
        &self,
        name: &str,
        create: &CreateOptions,
        start: &StartOptions,
        registry: Option<&mut Registry>,
    ) -> Result<StartOutcome> {
        self.create(name, create)?;
        self.start(name, start, registry)
    }

    /// Signal a running sandbox and confirm it is gone.
    ///
    /// Fails with `TryAgain` while the process still exists (in daemon
    /// mode that includes the window before it is reaped).
    pub fn stop(
        &self,
        name: &str,
        force: bool,
        time_wait: u32,
        registry: Option<&mut Registry>,
    ) -> Result<()> {
        validate_sandbox_name(name)?;
        let state_path = self.workdir.state_path(name);
        let mut state = OciState::load(&state_path)?;

        if state.state.is_inactive() {
            return Err(TurfError::NotRunning(name.to_string()));
        }
        if state.pid <= 1 {
            return Err(TurfError::NotFound(format!("pid of {}", name)));
        }

        let sig = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        let pid = Pid::from_raw(state.pid);
        if let Err(e) = kill(pid, sig) {
            debug!("kill({}, {}): {}", state.pid, sig, e);
        }

        let mut alive = true;
        for _ in 0..=time_wait {
            std::thread::yield_now();
            if !procfs::pid_alive(state.pid) {
                alive = false;
                break;
            }
        }
        if alive {
            return Err(TurfError::TryAgain(name.to_string()));
        }

        if let Some(reg) = registry {
            reg.remove_pid(state.pid);
        }
        state.mark_stopped();
        state.save(&state_path)?;
        info!("sandbox {} ({}) stopped", name, pid);
        Ok(())
    }

    /// Record a reaped child: persist its terminal state and flag it exited.
    ///
    /// Returns the realm name, or `None` for pids the registry does not own.
    pub fn child_exit(
        &self,
        registry: &mut Registry,
        pid: i32,
        status: i32,
        usage: ResourceUsage,
    ) -> Result<Option<String>> {
        let Some(sbx) = registry.find_by_pid(pid) else {
            debug!("reaped unknown pid {}", pid);
            return Ok(None);
        };
        sbx.realm.handle_exit(status, usage);
        let name = sbx.realm.name().to_string();

        let state_path = self.workdir.state_path(&name);
        let persisted = OciState::load_or_create(&state_path, &name).and_then(|mut state| {
            state.pid = pid;
            state.state = RealmState::Stopped;
            state.status = sbx.realm.status();
            state.stopped = sbx.realm.stopped();
            state.exit_code = Some(status);
            state.rusage = Some(usage);
            state.stat = sbx.last_stat.clone();
            state.save(&state_path)
        });
        sbx.realm.mark(RealmStatus::EXITED);
        persisted?;
        Ok(Some(name))
    }

    /// A seed announced itself on its channel.
    pub fn seed_ready(&self, registry: &mut Registry, fd: RawFd) -> Result<String> {
        let sbx = registry
            .find_by_channel(fd)
            .ok_or_else(|| TurfError::NotFound(format!("seed on fd {}", fd)))?;
        sbx.realm.set_state(RealmState::ForkWait);
        let name = sbx.realm.name().to_string();
        self.persist_transition(&name, sbx.realm.pid(), RealmState::ForkWait)?;
        info!("seed {} ready", name);
        Ok(name)
    }

    /// A seed finished cloning the realm named in the response.
    ///
    /// Pid 0 means the seed could not clone: the realm is dropped from the
    /// registry and recorded as stopped so it can be started again.
    pub fn fork_done(&self, registry: &mut Registry, rsp: &ForkResponse) -> Result<()> {
        if rsp.pid == 0 {
            registry
                .remove(&rsp.name)
                .ok_or_else(|| TurfError::NotFound(format!("cloned realm {}", rsp.name)))?;
            self.persist_transition(&rsp.name, 0, RealmState::Stopped)?;
            return Err(TurfError::Process(format!("seed failed to clone {}", rsp.name)));
        }
        let sbx = registry
            .get_mut(&rsp.name)
            .ok_or_else(|| TurfError::NotFound(format!("cloned realm {}", rsp.name)))?;
        let pid = rsp.pid as i32;
        sbx.realm.set_pid(pid);
        sbx.realm.set_state(RealmState::Running);
        self.persist_transition(&rsp.name, pid, RealmState::Running)?;
        info!("realm {} cloned as pid {}", rsp.name, pid);
        Ok(())
    }

    fn persist_transition(&self, name: &str, pid: i32, to: RealmState) -> Result<()> {
        let path = self.workdir.state_path(name);
        let mut state = OciState::load_or_create(&path, name)?;
        state.pid = pid;
        state.state = to;
        state.save(&path)
    }
}

/// Set `KEY=VALUE` in `env`, replacing an existing entry for `KEY`.
fn merge_env(env: &mut Vec<String>, kv: &str) -> Result<()> {
    let key = match kv.split_once('=') {
        Some((key, _)) if !key.is_empty() => key,
        _ => {
            return Err(TurfError::InvalidArgument(format!(
                "environment entry '{}' is not KEY=VALUE",
                kv
            )))
        }
    };
    let prefix = format!("{}=", key);
    match env.iter_mut().find(|e| e.starts_with(&prefix)) {
        Some(slot) => *slot = kv.to_string(),
        None => env.push(kv.to_string()),
    }
    Ok(())
}

fn list_dirs(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        let ty = entry.file_type()?;
        if ty.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if ty.is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn remove_tree(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
