//! The turf daemon.
//!
//! One single-threaded event loop multiplexes the control socket, client
//! connections, seed channels, the signal self-pipe and the health timer.
//! Nothing here runs in signal context: SIGCHLD and SIGTERM only wake the
//! loop, which then reaps or shuts down from an ordinary callback.
use crate::config::paths::Workdir;
use crate::config::types::{ResourceUsage, Result, TurfError};
use crate::core::health::{health_check, ProcSampler, ResourceSampler, HEALTH_INTERVAL_MS};
use crate::core::registry::Registry;
use crate::core::runtime::Runtime;
use crate::event::{EventLoop, FileCallback, Mask, TimerCallback, TimerId, DEFAULT_SETSIZE};
use crate::ipc::frame::{parse_request, FrameHeader, FRAME_HDR_LEN, MAX_BODY_LEN};
use crate::ipc::message::Message;
use crate::kernel::signal::{ignore_sigpipe, SignalPipe};
use log::{debug, error, info, warn};
use nix::sys::signal::Signal;
use nix::sys::socket::{bind, listen, socket, AddressFamily, Backlog, SockFlag, SockType, UnixAddr};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};

pub const SOCKET_MODE: u32 = 0o660;
pub const LISTEN_BACKLOG: i32 = 1024;
/// Health ticks between SIGTERM and SIGKILL during shutdown
pub const SHUTDOWN_GRACE_TICKS: u32 = 5;
/// A client that has not delivered a full request by then is dropped
const CLIENT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub socket_mode: u32,
    pub backlog: i32,
    pub health_interval_ms: u64,
    /// Stay attached to the terminal instead of daemonizing
    pub foreground: bool,
    pub shutdown_grace_ticks: u32,
}

impl DaemonConfig {
    pub fn new(workdir: &Workdir) -> Self {
        Self {
            socket_path: workdir.socket_path(),
            socket_mode: SOCKET_MODE,
            backlog: LISTEN_BACKLOG,
            health_interval_ms: HEALTH_INTERVAL_MS,
            foreground: false,
            shutdown_grace_ticks: SHUTDOWN_GRACE_TICKS,
        }
    }
}

/// Executes one forwarded command line (`argv[0]` is the program name).
///
/// Returns the daemon end of a seed channel when the command launched a
/// seed realm.
pub type CommandHandler = fn(&[String], &Runtime, &mut Registry) -> Result<Option<RawFd>>;

/// One client connection. Reads and writes never block: the request is
/// assembled across READ events and the response drained across WRITE
/// events.
#[derive(Debug)]
struct Connection {
    stream: UnixStream,
    inbox: Vec<u8>,
    outbox: Vec<u8>,
    accepted: Instant,
}

impl Connection {
    fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            inbox: Vec::new(),
            outbox: Vec::new(),
            accepted: Instant::now(),
        }
    }

    /// Take in what the client has sent; `Some` once a request is complete.
    fn receive(&mut self) -> Result<Option<Vec<String>>> {
        let mut chunk = [0u8; FRAME_HDR_LEN + MAX_BODY_LEN];
        match self.stream.read(&mut chunk) {
            Ok(0) => {
                return Err(TurfError::Io(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "client hung up mid-request",
                )))
            }
            Ok(n) => self.inbox.extend_from_slice(&chunk[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        }
        Ok(parse_request(&self.inbox)?.map(|(args, _)| args))
    }

    /// Write what the socket takes; true once the response is out.
    fn flush(&mut self) -> Result<bool> {
        while !self.outbox.is_empty() {
            match self.stream.write(&self.outbox) {
                Ok(0) => return Err(TurfError::Io(ErrorKind::WriteZero.into())),
                Ok(n) => {
                    self.outbox.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    fn is_stalled(&self, now: Instant) -> bool {
        self.outbox.is_empty() && now.duration_since(self.accepted) > CLIENT_REQUEST_TIMEOUT
    }
}

pub struct Daemon {
    config: DaemonConfig,
    runtime: Runtime,
    registry: Registry,
    sampler: Box<dyn ResourceSampler>,
    handler: CommandHandler,
    listener: Option<UnixListener>,
    conns: HashMap<RawFd, Connection>,
    seed_fds: HashSet<RawFd>,
    signals: Option<SignalPipe>,
    /// Remaining grace ticks once shutdown started
    shutdown: Option<u32>,
}

impl Daemon {
    pub fn new(config: DaemonConfig, runtime: Runtime, handler: CommandHandler) -> Self {
        Self {
            config,
            runtime,
            registry: Registry::new(),
            sampler: Box::new(ProcSampler),
            handler,
            listener: None,
            conns: HashMap::new(),
            seed_fds: HashSet::new(),
            signals: None,
            shutdown: None,
        }
    }

    pub fn with_sampler(mut self, sampler: Box<dyn ResourceSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_some()
    }

    /// Create the control socket, replacing a stale one.
    pub fn bind(&mut self) -> Result<()> {
        let path = &self.config.socket_path;
        match fs::remove_file(path) {
            Ok(()) => debug!("removed stale socket {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let fd = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
            None,
        )?;
        let addr = UnixAddr::new(path.as_path())?;
        bind(fd.as_raw_fd(), &addr)?;
        fs::set_permissions(path, fs::Permissions::from_mode(self.config.socket_mode))?;
        listen(&fd, Backlog::new(self.config.backlog)?)?;

        info!("listening on {}", path.display());
        self.listener = Some(UnixListener::from(fd));
        Ok(())
    }

    /// Run the event loop until shutdown completes.
    pub fn serve(&mut self) -> Result<()> {
        ignore_sigpipe()?;
        let signals = SignalPipe::install(&[Signal::SIGCHLD, Signal::SIGTERM, Signal::SIGINT])?;
        let signal_fd = signals.read_fd();
        self.signals = Some(signals);
        if self.listener.is_none() {
            self.bind()?;
        }

        let mut el: EventLoop<Daemon> = EventLoop::new(DEFAULT_SETSIZE)?;
        if let Some(listener) = self.listener.as_ref() {
            let on_accept: FileCallback<Daemon> = Rc::new(Daemon::on_accept);
            el.create_event(listener.as_raw_fd(), Mask::READ, on_accept)?;
        }
        let on_signal: FileCallback<Daemon> = Rc::new(Daemon::on_signal);
        el.create_event(signal_fd, Mask::READ, on_signal)?;
        let on_health: TimerCallback<Daemon> = Rc::new(Daemon::on_health);
        el.create_timer(self.config.health_interval_ms, on_health);

        info!("daemon running (pid {})", std::process::id());
        el.run(self)?;

        self.signals = None;
        info!("daemon stopped");
        Ok(())
    }

    /// Run one forwarded command.
    pub fn execute(&mut self, args: &[String]) -> Result<Option<RawFd>> {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push("turf".to_string());
        argv.extend_from_slice(args);
        (self.handler)(&argv, &self.runtime, &mut self.registry)
    }

    fn dispatch(&mut self, el: &mut EventLoop<Daemon>, args: &[String]) -> i32 {
        let code = match self.execute(args) {
            Ok(seed) => {
                if let Some(fd) = seed {
                    self.watch_seed(el, fd);
                }
                0
            }
            Err(e) => {
                warn!("remote {:?}: {}", args, e);
                -e.errno()
            }
        };
        self.sweep_seed_channels(el);
        code
    }

    fn on_accept(el: &mut EventLoop<Daemon>, d: &mut Daemon, _fd: RawFd, _mask: Mask) {
        loop {
            let Some(listener) = d.listener.as_ref() else {
                return;
            };
            let stream = match listener.accept() {
                Ok((stream, _)) => stream,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) => {
                    error!("accept: {}", e);
                    return;
                }
            };
            if let Err(e) = stream.set_nonblocking(true) {
                warn!("client socket setup: {}", e);
                continue;
            }

            let fd = stream.as_raw_fd();
            let on_read: FileCallback<Daemon> = Rc::new(Daemon::on_client_read);
            match el.create_event(fd, Mask::READ, on_read) {
                Ok(()) => {
                    debug!("client {} accepted", fd);
                    d.conns.insert(fd, Connection::new(stream));
                }
                Err(e) => warn!("dropping client {}: {}", fd, e),
            }
        }
    }

    fn on_client_read(el: &mut EventLoop<Daemon>, d: &mut Daemon, fd: RawFd, _mask: Mask) {
        let request = match d.conns.get_mut(&fd) {
            Some(conn) => conn.receive(),
            None => {
                let _ = el.delete_event(fd, Mask::ALL);
                return;
            }
        };
        let args = match request {
            Ok(Some(args)) => args,
            Ok(None) => return,
            Err(e) => {
                warn!("client {}: {}", fd, e);
                d.close_conn(el, fd);
                return;
            }
        };

        debug!("client {} request {:?}", fd, args);
        let code = d.dispatch(el, &args);
        if let Some(conn) = d.conns.get_mut(&fd) {
            conn.outbox = FrameHeader::response(code).encode().to_vec();
        }

        let _ = el.delete_event(fd, Mask::READ);
        let on_write: FileCallback<Daemon> = Rc::new(Daemon::on_client_write);
        if let Err(e) = el.create_event(fd, Mask::WRITE, on_write) {
            warn!("client {}: {}", fd, e);
            d.close_conn(el, fd);
        }
    }

    fn on_client_write(el: &mut EventLoop<Daemon>, d: &mut Daemon, fd: RawFd, _mask: Mask) {
        if let Some(conn) = d.conns.get_mut(&fd) {
            match conn.flush() {
                Ok(false) => return,
                Ok(true) => {}
                Err(e) => warn!("client {} write: {}", fd, e),
            }
        }
        d.close_conn(el, fd);
    }

    fn drop_stalled_clients(&mut self, el: &mut EventLoop<Daemon>, now: Instant) {
        let stalled: Vec<RawFd> = self
            .conns
            .iter()
            .filter(|(_, conn)| conn.is_stalled(now))
            .map(|(fd, _)| *fd)
            .collect();
        for fd in stalled {
            warn!("client {} sent no complete request, dropping", fd);
            self.close_conn(el, fd);
        }
    }

    fn close_conn(&mut self, el: &mut EventLoop<Daemon>, fd: RawFd) {
        let _ = el.delete_event(fd, Mask::ALL);
        if self.conns.remove(&fd).is_some() {
            debug!("client {} closed", fd);
        }
    }

    fn watch_seed(&mut self, el: &mut EventLoop<Daemon>, fd: RawFd) {
        let on_seed: FileCallback<Daemon> = Rc::new(Daemon::on_seed_read);
        match el.create_event(fd, Mask::READ, on_seed) {
            Ok(()) => {
                self.seed_fds.insert(fd);
            }
            Err(e) => warn!("cannot watch seed channel {}: {}", fd, e),
        }
    }

    fn unwatch_seed(&mut self, el: &mut EventLoop<Daemon>, fd: RawFd) {
        let _ = el.delete_event(fd, Mask::ALL);
        self.seed_fds.remove(&fd);
    }

    /// Drop loop registrations of seed channels whose realm left the registry.
    fn sweep_seed_channels(&mut self, el: &mut EventLoop<Daemon>) {
        let stale: Vec<RawFd> = self
            .seed_fds
            .iter()
            .copied()
            .filter(|fd| self.registry.find_by_channel(*fd).is_none())
            .collect();
        for fd in stale {
            debug!("seed channel {} released", fd);
            self.unwatch_seed(el, fd);
        }
    }

    fn on_seed_read(el: &mut EventLoop<Daemon>, d: &mut Daemon, fd: RawFd, _mask: Mask) {
        let mut inbox = Vec::new();
        let mut closed = None;
        match d
            .registry
            .find_by_channel(fd)
            .and_then(|s| s.realm.channel_mut())
        {
            Some(channel) => loop {
                match channel.receive() {
                    Ok(Some(msg)) => inbox.push(msg),
                    Ok(None) => break,
                    Err(TurfError::Protocol(e)) => warn!("seed channel {}: dropped frame: {}", fd, e),
                    Err(e) => {
                        closed = Some(e);
                        break;
                    }
                }
            },
            None => {
                d.unwatch_seed(el, fd);
                return;
            }
        }

        for msg in inbox {
            let handled = match msg {
                Message::SeedReady => d.runtime.seed_ready(&mut d.registry, fd).map(|_| ()),
                Message::ForkRsp(rsp) => d.runtime.fork_done(&mut d.registry, &rsp),
                other => {
                    warn!("seed channel {}: unexpected {}", fd, other.msg_type().name());
                    Ok(())
                }
            };
            if let Err(e) = handled {
                warn!("seed channel {}: {}", fd, e);
            }
        }

        if let Some(e) = closed {
            info!("seed channel {} closed: {}", fd, e);
            d.unwatch_seed(el, fd);
            if let Some(sbx) = d.registry.find_by_channel(fd) {
                sbx.realm.take_channel();
            }
        }
    }

    fn on_signal(el: &mut EventLoop<Daemon>, d: &mut Daemon, _fd: RawFd, _mask: Mask) {
        let pending = d.signals.as_ref().map(SignalPipe::drain).unwrap_or_default();
        for sig in pending {
            match sig {
                Signal::SIGCHLD => d.reap_children(el),
                Signal::SIGTERM | Signal::SIGINT => d.begin_shutdown(el),
                other => debug!("ignoring {}", other),
            }
        }
    }

    /// Collect every finished child without blocking.
    fn reap_children(&mut self, el: &mut EventLoop<Daemon>) {
        loop {
            let mut status: libc::c_int = 0;
            let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
            let pid = unsafe { libc::wait4(-1, &mut status, libc::WNOHANG, &mut ru) };
            if pid <= 0 {
                break;
            }
            let usage = ResourceUsage::from_rusage(&ru);
            match self.runtime.child_exit(&mut self.registry, pid, status, usage) {
                Ok(Some(name)) => info!("realm {} ({}) exited", name, pid),
                Ok(None) => {}
                Err(e) => error!("recording exit of {}: {}", pid, e),
            }
        }
        self.sweep_seed_channels(el);
    }

    fn begin_shutdown(&mut self, el: &mut EventLoop<Daemon>) {
        if self.shutdown.is_some() {
            return;
        }
        warn!("shutting down, {} live realms", self.registry.live_count());
        self.shutdown = Some(self.config.shutdown_grace_ticks);

        if let Some(listener) = self.listener.take() {
            let _ = el.delete_event(listener.as_raw_fd(), Mask::ALL);
            let _ = fs::remove_file(&self.config.socket_path);
        }
        self.signal_live(Signal::SIGTERM);
    }

    fn signal_live(&mut self, sig: Signal) {
        for sbx in self.registry.iter_mut().filter(|s| s.is_live()) {
            let _ = sbx.realm.kill(sig);
        }
    }

    fn on_health(el: &mut EventLoop<Daemon>, d: &mut Daemon, _id: TimerId) -> i64 {
        let now = Instant::now();
        let killed = health_check(&mut d.registry, d.sampler.as_mut(), now);
        if !killed.is_empty() {
            warn!("health check killed {:?}", killed);
        }
        d.sweep_seed_channels(el);
        d.drop_stalled_clients(el, now);

        if let Some(ticks) = d.shutdown {
            if d.registry.live_count() == 0 {
                d.finish(el);
                return -1;
            }
            if ticks == 0 {
                d.signal_live(Signal::SIGKILL);
            } else {
                d.shutdown = Some(ticks - 1);
            }
        }
        d.config.health_interval_ms as i64
    }

    /// Deregister everything so the loop drains.
    fn finish(&mut self, el: &mut EventLoop<Daemon>) {
        if let Some(signals) = self.signals.as_ref() {
            let _ = el.delete_event(signals.read_fd(), Mask::ALL);
        }
        let seeds: Vec<RawFd> = self.seed_fds.iter().copied().collect();
        for fd in seeds {
            self.unwatch_seed(el, fd);
        }
        let conns: Vec<RawFd> = self.conns.keys().copied().collect();
        for fd in conns {
            self.close_conn(el, fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::RealmState;
    use crate::core::realm::{Realm, SeedChannel};
    use crate::ipc::frame::encode_request;
    use crate::ipc::message::{write_message, ForkResponse};
    use std::os::fd::FromRawFd;
    use tempfile::TempDir;

    fn echo_handler(argv: &[String], _rt: &Runtime, _reg: &mut Registry) -> Result<Option<RawFd>> {
        match argv.get(1).map(String::as_str) {
            Some("ok") => Ok(None),
            Some(other) => Err(TurfError::NotFound(other.to_string())),
            None => Err(TurfError::InvalidArgument("empty".to_string())),
        }
    }

    #[test]
    fn test_config_defaults() {
        let wd = Workdir::new("/var/lib/turf");
        let cfg = DaemonConfig::new(&wd);
        assert_eq!(cfg.socket_path, PathBuf::from("/var/lib/turf/turf.sock"));
        assert_eq!(cfg.socket_mode, 0o660);
        assert_eq!(cfg.backlog, 1024);
        assert_eq!(cfg.health_interval_ms, 1000);
        assert!(!cfg.foreground);
    }

    #[test]
    fn test_execute_prepends_program_name() {
        let tmp = TempDir::new().unwrap();
        let wd = Workdir::new(tmp.path());
        let mut d = Daemon::new(DaemonConfig::new(&wd), Runtime::new(wd), echo_handler);
        assert!(d.execute(&["ok".to_string()]).unwrap().is_none());
        let err = d.execute(&["missing".to_string()]).unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
    }

    fn daemon(tmp: &TempDir) -> Daemon {
        let wd = Workdir::new(tmp.path().join("turf"));
        let rt = Runtime::new(wd.clone());
        rt.init().unwrap();
        Daemon::new(DaemonConfig::new(&wd), rt, echo_handler)
    }

    #[test]
    fn test_connection_assembles_request_across_reads() {
        let (mut client, server) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        let mut conn = Connection::new(server);
        assert!(conn.receive().unwrap().is_none());

        let frame = encode_request(&["stop".to_string(), "sbx1".to_string()]).unwrap();
        client.write_all(&frame[..3]).unwrap();
        assert!(conn.receive().unwrap().is_none());
        client.write_all(&frame[3..]).unwrap();
        assert_eq!(conn.receive().unwrap().unwrap(), vec!["stop", "sbx1"]);

        // a response header is not a request
        let (mut client, server) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        let mut conn = Connection::new(server);
        client.write_all(&FrameHeader::response(0).encode()).unwrap();
        assert_eq!(conn.receive().unwrap_err().errno(), libc::ENOMSG);

        // hanging up halfway is an error, not a wait
        let (mut client, server) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        let mut conn = Connection::new(server);
        client.write_all(&frame[..FRAME_HDR_LEN]).unwrap();
        assert!(conn.receive().unwrap().is_none());
        drop(client);
        assert!(conn.receive().is_err());
    }

    #[test]
    fn test_stalled_client_does_not_block_the_loop() {
        let tmp = TempDir::new().unwrap();
        let mut d = daemon(&tmp);
        d.bind().unwrap();
        let mut el: EventLoop<Daemon> = EventLoop::new(DEFAULT_SETSIZE).unwrap();
        let listen_fd = d.listener.as_ref().unwrap().as_raw_fd();
        let on_accept: FileCallback<Daemon> = Rc::new(Daemon::on_accept);
        el.create_event(listen_fd, Mask::READ, on_accept).unwrap();

        let mut client = UnixStream::connect(&d.config.socket_path).unwrap();
        let frame = encode_request(&["ok".to_string()]).unwrap();
        client.write_all(&frame[..1]).unwrap();

        el.process_events(&mut d).unwrap();
        assert_eq!(d.conns.len(), 1);
        let started = Instant::now();
        el.process_events(&mut d).unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(d.conns.values().next().unwrap().inbox.len(), 1);

        client.write_all(&frame[1..]).unwrap();
        el.process_events(&mut d).unwrap();
        el.process_events(&mut d).unwrap();
        assert!(d.conns.is_empty());

        let mut reply = [0u8; FRAME_HDR_LEN];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(FrameHeader::decode(&reply).unwrap().code, 0);
    }

    #[test]
    fn test_idle_clients_are_dropped() {
        let tmp = TempDir::new().unwrap();
        let mut d = daemon(&tmp);
        let mut el: EventLoop<Daemon> = EventLoop::new(DEFAULT_SETSIZE).unwrap();
        let (_client, server) = UnixStream::pair().unwrap();
        let fd = server.as_raw_fd();
        let on_read: FileCallback<Daemon> = Rc::new(Daemon::on_client_read);
        el.create_event(fd, Mask::READ, on_read).unwrap();
        d.conns.insert(fd, Connection::new(server));

        d.drop_stalled_clients(&mut el, Instant::now());
        assert_eq!(d.conns.len(), 1);
        d.drop_stalled_clients(&mut el, Instant::now() + CLIENT_REQUEST_TIMEOUT * 2);
        assert!(d.conns.is_empty());
        assert_eq!(el.event_mask(fd), Mask::NONE);
    }

    #[test]
    fn test_partial_seed_message_does_not_block_the_loop() {
        let tmp = TempDir::new().unwrap();
        let mut d = daemon(&tmp);
        fs::create_dir_all(d.runtime.workdir().sandbox("seed1")).unwrap();
        let mut el: EventLoop<Daemon> = EventLoop::new(DEFAULT_SETSIZE).unwrap();

        let channel = SeedChannel::pair().unwrap();
        let far = nix::unistd::dup(channel.child_fd().unwrap()).unwrap();
        let mut far = unsafe { UnixStream::from_raw_fd(far) };
        let mut realm = Realm::new("seed1");
        realm.set_socketpair(channel).unwrap();
        realm.set_state(RealmState::Running);
        let fd = d.registry.insert(realm).unwrap().realm.channel_fd().unwrap();
        d.watch_seed(&mut el, fd);

        let mut wire = Vec::new();
        write_message(&mut wire, &Message::SeedReady).unwrap();
        let rsp = ForkResponse {
            pid: 0,
            name: "nobody".into(),
        };
        write_message(&mut wire, &Message::ForkRsp(rsp)).unwrap();

        far.write_all(&wire[..1]).unwrap();
        let started = Instant::now();
        el.process_events(&mut d).unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(d.registry.get("seed1").unwrap().realm.state(), RealmState::Running);

        // the rest arrives; both frames are handled, the channel stays up
        far.write_all(&wire[1..]).unwrap();
        el.process_events(&mut d).unwrap();
        assert_eq!(d.registry.get("seed1").unwrap().realm.state(), RealmState::ForkWait);
        assert!(d.seed_fds.contains(&fd));
        assert_eq!(
            d.registry.get_mut("seed1").unwrap().realm.channel_mut().unwrap().receive().unwrap(),
            None
        );
    }

    #[test]
    fn test_bind_sets_socket_mode() {
        let tmp = TempDir::new().unwrap();
        let wd = Workdir::new(tmp.path());
        let mut d = Daemon::new(DaemonConfig::new(&wd), Runtime::new(wd.clone()), echo_handler);
        fs::write(wd.socket_path(), "stale").unwrap();
        d.bind().unwrap();
        let meta = fs::metadata(wd.socket_path()).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o660);
        assert!(UnixStream::connect(wd.socket_path()).is_ok());
    }
}
