use crate::config::types::{
    Mode, RealmFlags, RealmState, RealmStatus, ResourceUsage, Result, TurfError, RLM_DEF_GID,
    RLM_DEF_UID,
};
use crate::exec::preexec::{exec_child, prepare_clone, split_env, LaunchPlan, EXIT_LAUNCH_FAILED};
use crate::ipc::message::{write_message, Fill, ForkRequest, Message, MessageBuffer};
use crate::kernel::namespace::{cstring, MountEntry};
use crate::utils::fd_closure::sorted_keep_list;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::{kill, Signal};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd::{fork, getpid, setpgid, ForkResult, Pid};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

/// Launch configuration of a realm. Write-once: setters fail after launch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RealmConfig {
    pub flags: RealmFlags,
    pub mode: Mode,
    pub name: String,
    pub argv: Vec<String>,
    pub env: Vec<String>,
    pub binary: String,
    pub uid: u32,
    pub gid: u32,
    pub capbset: u64,
    /// Resident memory limit in KiB, 0 for none
    pub mem_limit_kib: u64,
    /// CPU time limit in ms per wall-clock second, 0 for none
    pub cpu_limit_ms: u64,
    pub chroot: Option<String>,
    /// Insertion-ordered, applied as given
    pub mounts: Vec<MountEntry>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

/// Socketpair between the daemon and a seed realm.
///
/// The parent end stays with the daemon (close-on-exec, nonblocking); the
/// child end is inherited by the seed and released in the parent once it
/// has launched. The seed reads its end with ordinary blocking calls.
#[derive(Debug)]
pub struct SeedChannel {
    parent: UnixStream,
    child: Option<OwnedFd>,
    inbox: MessageBuffer,
}

impl SeedChannel {
    pub fn pair() -> Result<Self> {
        let (parent, child) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )?;
        fcntl(parent.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
        let parent = UnixStream::from(parent);
        parent.set_nonblocking(true)?;
        Ok(Self {
            parent,
            child: Some(child),
            inbox: MessageBuffer::new(),
        })
    }

    pub fn parent_fd(&self) -> RawFd {
        self.parent.as_raw_fd()
    }

    pub fn child_fd(&self) -> Option<RawFd> {
        self.child.as_ref().map(|fd| fd.as_raw_fd())
    }

    pub fn send(&mut self, msg: &Message) -> Result<()> {
        write_message(&mut self.parent, msg)
    }

    /// Next complete message from the seed, `None` while one is still in
    /// flight. Never blocks; an orderly close is reported as an error.
    pub fn receive(&mut self) -> Result<Option<Message>> {
        if let Some(msg) = self.inbox.next_message()? {
            return Ok(Some(msg));
        }
        match self.inbox.fill(&mut self.parent)? {
            Fill::Read(_) => self.inbox.next_message(),
            Fill::WouldBlock => Ok(None),
            Fill::Closed => Err(TurfError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "seed channel closed",
            ))),
        }
    }

    fn release_child(&mut self) {
        self.child = None;
    }
}

/// Which side of a warm-fork clone the caller is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForkOutcome {
    /// In the seed; carries the new clone's pid
    Parent(i32),
    /// In the freshly cloned realm
    Child,
}

/// How a realm's wait status ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitKind {
    Exited(i32),
    Signaled(i32),
    Unknown(i32),
}

impl ExitKind {
    pub fn from_wait_status(status: i32) -> Self {
        if libc::WIFEXITED(status) {
            ExitKind::Exited(libc::WEXITSTATUS(status))
        } else if libc::WIFSIGNALED(status) {
            ExitKind::Signaled(libc::WTERMSIG(status))
        } else {
            ExitKind::Unknown(status)
        }
    }
}

/// One sandboxed process: its configuration and observed runtime state.
#[derive(Debug)]
pub struct Realm {
    cfg: RealmConfig,
    pid: i32,
    state: RealmState,
    status: RealmStatus,
    started: Option<DateTime<Utc>>,
    stopped: Option<DateTime<Utc>>,
    /// Raw wait status
    exit_code: Option<i32>,
    rusage: Option<ResourceUsage>,
    channel: Option<SeedChannel>,
}

impl Realm {
    pub fn new(name: &str) -> Self {
        Self {
            cfg: RealmConfig {
                name: name.to_string(),
                mode: Mode::detect(),
                uid: RLM_DEF_UID,
                gid: RLM_DEF_GID,
                ..RealmConfig::default()
            },
            pid: 0,
            state: RealmState::Init,
            status: RealmStatus::OK,
            started: None,
            stopped: None,
            exit_code: None,
            rusage: None,
            channel: None,
        }
    }

    /// Track a process that was launched elsewhere (a warm-fork clone, or a
    /// pid recovered from persisted state).
    pub fn attach(name: &str, pid: i32, state: RealmState) -> Self {
        let mut realm = Self::new(name);
        realm.pid = pid;
        realm.state = state;
        realm
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn config(&self) -> &RealmConfig {
        &self.cfg
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn state(&self) -> RealmState {
        self.state
    }

    pub fn status(&self) -> RealmStatus {
        self.status
    }

    pub fn started(&self) -> Option<DateTime<Utc>> {
        self.started
    }

    pub fn stopped(&self) -> Option<DateTime<Utc>> {
        self.stopped
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn rusage(&self) -> Option<ResourceUsage> {
        self.rusage
    }

    pub fn channel_mut(&mut self) -> Option<&mut SeedChannel> {
        self.channel.as_mut()
    }

    pub fn channel_fd(&self) -> Option<RawFd> {
        self.channel.as_ref().map(SeedChannel::parent_fd)
    }

    pub fn take_channel(&mut self) -> Option<SeedChannel> {
        self.channel.take()
    }

    pub fn set_state(&mut self, state: RealmState) {
        self.state = state;
    }

    pub fn set_pid(&mut self, pid: i32) {
        self.pid = pid;
    }

    pub fn mark(&mut self, flag: RealmStatus) {
        self.status.insert(flag);
    }

    fn configurable(&self) -> Result<()> {
        if self.state != RealmState::Init {
            return Err(TurfError::Busy(format!(
                "{} ({}): configuration is frozen after launch",
                self.cfg.name, self.state
            )));
        }
        Ok(())
    }

    pub fn set_mode(&mut self, mode: Mode) -> Result<()> {
        self.configurable()?;
        self.cfg.mode = mode;
        Ok(())
    }

    pub fn set_uid(&mut self, uid: u32) -> Result<()> {
        self.configurable()?;
        self.cfg.uid = uid;
        self.cfg.flags.insert(RealmFlags::UID);
        Ok(())
    }

    pub fn set_gid(&mut self, gid: u32) -> Result<()> {
        self.configurable()?;
        self.cfg.gid = gid;
        self.cfg.flags.insert(RealmFlags::GID);
        Ok(())
    }

    /// Capabilities kept in the bounding set
    pub fn set_capbset(&mut self, mask: u64) -> Result<()> {
        self.configurable()?;
        self.cfg.capbset = mask;
        self.cfg.flags.insert(RealmFlags::CAPBSET);
        Ok(())
    }

    pub fn limit_mem(&mut self, kib: u64) -> Result<()> {
        self.configurable()?;
        self.cfg.mem_limit_kib = kib;
        self.cfg.flags.insert(RealmFlags::MEM_LIMIT);
        Ok(())
    }

    pub fn limit_cpu(&mut self, ms_per_sec: u64) -> Result<()> {
        self.configurable()?;
        self.cfg.cpu_limit_ms = ms_per_sec;
        self.cfg.flags.insert(RealmFlags::CPU_LIMIT);
        Ok(())
    }

    /// Append a mount; the realm then needs its own mount namespace.
    pub fn mount(&mut self, source: &str, dest: &str, fstype: &str, flags: u64) -> Result<()> {
        self.configurable()?;
        let entry = MountEntry::new(source, dest, fstype, flags)?;
        info!("mount {} -> {} type '{}'", source, dest, fstype);
        self.cfg.mounts.push(entry);
        self.cfg.flags.insert(RealmFlags::NS_MOUNT);
        Ok(())
    }

    /// Root directory of the realm; can only be set once.
    pub fn set_chroot(&mut self, dir: &str) -> Result<()> {
        self.configurable()?;
        if self.cfg.chroot.is_some() {
            return Err(TurfError::InvalidArgument(format!(
                "chroot of {} already set",
                self.cfg.name
            )));
        }
        self.cfg.chroot = Some(dir.to_string());
        self.cfg.flags.insert(RealmFlags::CHROOT);
        Ok(())
    }

    pub fn set_env(&mut self, env: Vec<String>) -> Result<()> {
        self.configurable()?;
        self.cfg.env = env;
        Ok(())
    }

    pub fn set_args(&mut self, argv: Vec<String>) -> Result<()> {
        self.configurable()?;
        self.cfg.argv = argv;
        Ok(())
    }

    pub fn set_binary(&mut self, path: &str) -> Result<()> {
        self.configurable()?;
        self.cfg.binary = path.to_string();
        Ok(())
    }

    pub fn set_terminal(&mut self, on: bool) -> Result<()> {
        self.configurable()?;
        if on {
            self.cfg.flags.insert(RealmFlags::TERMINAL);
        } else {
            self.cfg.flags.remove(RealmFlags::TERMINAL);
        }
        Ok(())
    }

    pub fn set_stdout(&mut self, path: &str) -> Result<()> {
        self.configurable()?;
        self.cfg.stdout = Some(path.to_string());
        self.cfg.flags.insert(RealmFlags::FD_STDOUT);
        Ok(())
    }

    pub fn set_stderr(&mut self, path: &str) -> Result<()> {
        self.configurable()?;
        self.cfg.stderr = Some(path.to_string());
        self.cfg.flags.insert(RealmFlags::FD_STDERR);
        Ok(())
    }

    pub fn set_socketpair(&mut self, channel: SeedChannel) -> Result<()> {
        self.configurable()?;
        self.channel = Some(channel);
        self.cfg.flags.insert(RealmFlags::SOCKETPAIR);
        Ok(())
    }

    /// Convert the configuration into its post-fork form.
    ///
    /// A warm-fork clone never execs, keeps the seed's descriptors and needs
    /// no binary.
    pub fn launch_plan(&self, clone: bool) -> Result<LaunchPlan> {
        let cfg = &self.cfg;
        if !clone && cfg.binary.is_empty() {
            return Err(TurfError::Config(format!("{}: no binary to execute", cfg.name)));
        }
        if cfg.mode == Mode::Sysadmin && !crate::kernel::capabilities::has_sys_admin() {
            return Err(TurfError::NotSupported(format!(
                "{}: sysadmin mode without CAP_SYS_ADMIN",
                cfg.name
            )));
        }

        let argv = cfg
            .argv
            .iter()
            .map(|a| cstring(a))
            .collect::<Result<Vec<_>>>()?;
        let envp = cfg
            .env
            .iter()
            .map(|e| cstring(e))
            .collect::<Result<Vec<_>>>()?;
        let env_pairs = envp
            .iter()
            .map(|e| split_env(e))
            .collect::<Result<Vec<_>>>()?;

        let mut keep = vec![0, 1, 2];
        if let Some(fd) = self.channel.as_ref().and_then(SeedChannel::child_fd) {
            keep.push(fd);
        }

        let mounts = cfg
            .mounts
            .iter()
            .map(|m| m.prepare(cfg.chroot.as_deref()))
            .collect::<Result<Vec<_>>>()?;

        Ok(LaunchPlan {
            mode: cfg.mode,
            binary: cstring(&cfg.binary)?,
            argv,
            envp,
            env_pairs,
            chroot: cfg.chroot.as_deref().map(cstring).transpose()?,
            stdout: cfg.stdout.as_deref().map(cstring).transpose()?,
            stderr: cfg.stderr.as_deref().map(cstring).transpose()?,
            terminal: cfg.flags.contains(RealmFlags::TERMINAL),
            close_fds: !clone,
            keep_fds: sorted_keep_list(&keep),
            mounts,
            uid: cfg.flags.contains(RealmFlags::UID).then_some(cfg.uid),
            gid: cfg.flags.contains(RealmFlags::GID).then_some(cfg.gid),
            capbset: cfg.flags.contains(RealmFlags::CAPBSET).then_some(cfg.capbset),
        })
    }

    fn lead_process_group() {
        if let Err(e) = setpgid(Pid::from_raw(0), Pid::from_raw(0)) {
            debug!("setpgid: {}", e);
        }
    }

    fn launched(&mut self, pid: i32, state: RealmState) {
        self.pid = pid;
        self.started = Some(Utc::now());
        self.state = state;
        if let Some(ch) = self.channel.as_mut() {
            ch.release_child();
        }
    }

    /// Launch the realm. Returns the child pid without waiting for it.
    pub fn run(&mut self) -> Result<i32> {
        self.configurable()?;
        let plan = self.launch_plan(false)?;
        self.state = RealmState::Starting;
        Self::lead_process_group();

        match unsafe { fork() } {
            Ok(ForkResult::Child) => exec_child(&plan),
            Ok(ForkResult::Parent { child }) => {
                let pid = child.as_raw();
                self.launched(pid, RealmState::Running);
                info!("realm {} started as pid {}", self.cfg.name, pid);
                Ok(pid)
            }
            Err(e) => {
                self.state = RealmState::Init;
                Err(TurfError::Process(format!("fork for {}: {}", self.cfg.name, e)))
            }
        }
    }

    /// Warm-fork variant of `run`: the clone becomes a sibling of the caller
    /// and returns here with its environment replaced instead of exec'ing.
    pub fn fork(&mut self) -> Result<ForkOutcome> {
        self.configurable()?;
        let plan = self.launch_plan(true)?;
        self.state = RealmState::Cloning;
        Self::lead_process_group();

        let flags = (libc::SIGCHLD | libc::CLONE_PARENT) as libc::c_ulong;
        let rc = unsafe { libc::syscall(libc::SYS_clone, flags, 0usize, 0usize, 0usize, 0usize) };
        if rc < 0 {
            self.state = RealmState::Init;
            return Err(TurfError::Process(format!(
                "clone for {}: {}",
                self.cfg.name,
                std::io::Error::last_os_error()
            )));
        }

        if rc == 0 {
            if prepare_clone(&plan).is_err() {
                unsafe { libc::_exit(EXIT_LAUNCH_FAILED) }
            }
            self.pid = getpid().as_raw();
            self.state = RealmState::Cloned;
            return Ok(ForkOutcome::Child);
        }

        let pid = rc as i32;
        self.launched(pid, RealmState::Running);
        info!("realm {} cloned as pid {}", self.cfg.name, pid);
        Ok(ForkOutcome::Parent(pid))
    }

    /// Block until the child exits, then record its status.
    pub fn wait(&mut self) -> Result<i32> {
        if self.pid <= 0 {
            return Err(TurfError::NotRunning(self.cfg.name.clone()));
        }
        let mut status: libc::c_int = 0;
        let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
        loop {
            let rc = unsafe { libc::wait4(self.pid, &mut status, 0, &mut ru) };
            if rc >= 0 {
                break;
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(TurfError::Io(err));
            }
        }
        self.handle_exit(status, ResourceUsage::from_rusage(&ru));
        Ok(status)
    }

    /// Record an exit observed by whoever reaped the child.
    pub fn handle_exit(&mut self, status: i32, usage: ResourceUsage) {
        self.exit_code = Some(status);
        self.rusage = Some(usage);
        self.stopped = Some(Utc::now());
        self.state = RealmState::Stopped;
        info!(
            "realm {} ({}) exited: {:?}, utime {}ms stime {}ms maxrss {}KiB",
            self.cfg.name,
            self.pid,
            ExitKind::from_wait_status(status),
            usage.utime,
            usage.stime,
            usage.maxrss
        );
    }

    /// Signal the realm. TERM and KILL move it to `Stopping` even if the
    /// signal fails; `Stopped` is only set once the exit is reaped.
    pub fn kill(&mut self, sig: Signal) -> Result<()> {
        if self.pid <= 0 {
            return Err(TurfError::NotRunning(self.cfg.name.clone()));
        }
        let rc = kill(Pid::from_raw(self.pid), sig);
        if matches!(sig, Signal::SIGTERM | Signal::SIGKILL) {
            self.state = RealmState::Stopping;
        }
        rc.map_err(|e| {
            warn!("kill({}, {}) for {}: {}", self.pid, sig, self.cfg.name, e);
            TurfError::from(e)
        })
    }

    /// Serialize the configuration for a seed.
    pub fn fork_request(&self) -> ForkRequest {
        let cfg = &self.cfg;
        ForkRequest {
            flags: cfg.flags,
            mode: cfg.mode,
            argv: cfg.argv.clone(),
            env: cfg.env.clone(),
            binary: cfg.binary.clone(),
            name: cfg.name.clone(),
            uid: cfg.uid,
            gid: cfg.gid,
            chroot: cfg.chroot.clone().unwrap_or_default(),
            stdout: cfg.stdout.clone().unwrap_or_default(),
            stderr: cfg.stderr.clone().unwrap_or_default(),
        }
    }

    /// Rebuild a realm from a received FORK_REQ.
    pub fn from_fork_request(req: ForkRequest) -> Self {
        fn non_empty(s: String) -> Option<String> {
            (!s.is_empty()).then_some(s)
        }
        let mut realm = Self::new(&req.name);
        realm.cfg = RealmConfig {
            flags: req.flags,
            mode: req.mode,
            name: req.name,
            argv: req.argv,
            env: req.env,
            binary: req.binary,
            uid: req.uid,
            gid: req.gid,
            chroot: non_empty(req.chroot),
            stdout: non_empty(req.stdout),
            stderr: non_empty(req.stderr),
            ..RealmConfig::default()
        };
        realm
    }
}
