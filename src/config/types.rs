/// Core types shared by every turf subsystem
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Default uid a realm runs as when the bundle config does not name one
pub const RLM_DEF_UID: u32 = 36767;
/// Default gid a realm runs as when the bundle config does not name one
pub const RLM_DEF_GID: u32 = 36767;

/// Sandbox names are bounded on both ends
pub const SANDBOX_NAME_MIN_LEN: usize = 4;
pub const SANDBOX_NAME_MAX_LEN: usize = 254;

/// Execution mode of a realm.
///
/// `Fallback` works without any capability; `Sysadmin` additionally
/// unshares the mount namespace and pivots into the realm root.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Fallback,
    Sysadmin,
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "fallback" => Ok(Mode::Fallback),
            "sysadmin" => Ok(Mode::Sysadmin),
            other => Err(format!("unknown mode '{}', expected fallback or sysadmin", other)),
        }
    }
}

impl Mode {
    pub fn as_u32(self) -> u32 {
        match self {
            Mode::Fallback => 0,
            Mode::Sysadmin => 1,
        }
    }

    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Mode::Fallback),
            1 => Ok(Mode::Sysadmin),
            other => Err(TurfError::NotSupported(format!(
                "unknown realm mode {}",
                other
            ))),
        }
    }

    /// Pick the strongest mode this process can actually use.
    pub fn detect() -> Self {
        if crate::kernel::capabilities::has_sys_admin() {
            Mode::Sysadmin
        } else {
            Mode::Fallback
        }
    }
}

/// Lifecycle state of a realm, persisted as a lowercase string.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RealmState {
    #[default]
    Unknown,
    Init,
    Starting,
    Running,
    Stopping,
    Stopped,
    Killing,
    ForkWait,
    Cloning,
    Cloned,
}

impl RealmState {
    pub fn as_str(self) -> &'static str {
        match self {
            RealmState::Unknown => "unknown",
            RealmState::Init => "init",
            RealmState::Starting => "starting",
            RealmState::Running => "running",
            RealmState::Stopping => "stopping",
            RealmState::Stopped => "stopped",
            RealmState::Killing => "killing",
            RealmState::ForkWait => "forkwait",
            RealmState::Cloning => "cloning",
            RealmState::Cloned => "cloned",
        }
    }

    /// Unrecognized strings map to `Unknown`, never to an error.
    pub fn parse(s: &str) -> Self {
        match s {
            "init" => RealmState::Init,
            "starting" => RealmState::Starting,
            "running" => RealmState::Running,
            "stopping" => RealmState::Stopping,
            "stopped" => RealmState::Stopped,
            "killing" => RealmState::Killing,
            "forkwait" => RealmState::ForkWait,
            "cloning" => RealmState::Cloning,
            "cloned" => RealmState::Cloned,
            _ => RealmState::Unknown,
        }
    }

    /// States in which a stop request has nothing to do.
    pub fn is_inactive(self) -> bool {
        matches!(
            self,
            RealmState::Init | RealmState::Stopped | RealmState::Killing
        )
    }
}

impl fmt::Display for RealmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for RealmState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RealmState {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(RealmState::parse(&s))
    }
}

/// Cumulative status flags of a realm (OOM, CPU overload, killed, exited).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RealmStatus(u32);

impl RealmStatus {
    pub const OK: RealmStatus = RealmStatus(0);
    pub const MEM_OVL: RealmStatus = RealmStatus(1 << 0);
    pub const CPU_OVL: RealmStatus = RealmStatus(1 << 1);
    pub const KILL: RealmStatus = RealmStatus(1 << 2);
    pub const EXITED: RealmStatus = RealmStatus(1 << 3);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        RealmStatus(bits)
    }

    pub fn contains(self, other: RealmStatus) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn insert(&mut self, other: RealmStatus) {
        self.0 |= other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Which configuration fields have been set on a realm.
///
/// Bit positions are part of the FORK_REQ wire format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct RealmFlags(u32);

impl RealmFlags {
    pub const UID: RealmFlags = RealmFlags(1 << 0);
    pub const GID: RealmFlags = RealmFlags(1 << 1);
    pub const CPU_LIMIT: RealmFlags = RealmFlags(1 << 2);
    pub const MEM_LIMIT: RealmFlags = RealmFlags(1 << 3);
    pub const CHROOT: RealmFlags = RealmFlags(1 << 4);
    pub const CAPBSET: RealmFlags = RealmFlags(1 << 5);
    pub const NS_MOUNT: RealmFlags = RealmFlags(1 << 6);
    // bits 7..=9 are unassigned
    pub const TERMINAL: RealmFlags = RealmFlags(1 << 10);
    pub const FD_STDOUT: RealmFlags = RealmFlags(1 << 11);
    pub const FD_STDERR: RealmFlags = RealmFlags(1 << 12);
    pub const SOCKETPAIR: RealmFlags = RealmFlags(1 << 13);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        RealmFlags(bits)
    }

    pub fn contains(self, other: RealmFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: RealmFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: RealmFlags) {
        self.0 &= !other.0;
    }
}

/// Resource usage of an exited realm, as reported by `wait4`.
///
/// Times are in milliseconds, `maxrss` in KiB.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub utime: u64,
    pub stime: u64,
    pub maxrss: i64,
    #[serde(default)]
    pub minflt: i64,
    #[serde(default)]
    pub majflt: i64,
    #[serde(default)]
    pub nvcsw: i64,
    #[serde(default)]
    pub nivcsw: i64,
}

impl ResourceUsage {
    pub fn from_rusage(ru: &libc::rusage) -> Self {
        fn to_ms(tv: &libc::timeval) -> u64 {
            (tv.tv_sec as u64) * 1000 + (tv.tv_usec as u64) / 1000
        }
        Self {
            utime: to_ms(&ru.ru_utime),
            stime: to_ms(&ru.ru_stime),
            maxrss: ru.ru_maxrss as i64,
            minflt: ru.ru_minflt as i64,
            majflt: ru.ru_majflt as i64,
            nvcsw: ru.ru_nvcsw as i64,
            nivcsw: ru.ru_nivcsw as i64,
        }
    }
}

/// Check a sandbox name: 4..=254 characters, no path separators.
pub fn validate_sandbox_name(name: &str) -> Result<()> {
    let len = name.chars().count();
    if !(SANDBOX_NAME_MIN_LEN..=SANDBOX_NAME_MAX_LEN).contains(&len) {
        return Err(TurfError::InvalidArgument(format!(
            "illegal sandbox name '{}': length must be {}..={}",
            name, SANDBOX_NAME_MIN_LEN, SANDBOX_NAME_MAX_LEN
        )));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(TurfError::InvalidArgument(format!(
            "illegal sandbox name '{}': path separators are not allowed",
            name
        )));
    }
    Ok(())
}

/// Wire-level failures of the seed and CLI protocols
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("bad magic")]
    BadMagic,

    #[error("checksum mismatch (header {expected:#010x}, computed {computed:#010x})")]
    BadChecksum { expected: u32, computed: u32 },

    #[error("unexpected message type {found} (expected {expected})")]
    UnexpectedType { expected: u8, found: u8 },

    #[error("unknown message type {0}")]
    UnknownType(u8),

    #[error("truncated message: need {needed} bytes, {left} left")]
    Truncated { needed: usize, left: usize },

    #[error("no space left in buffer: need {needed} bytes, {left} left")]
    NoSpace { needed: usize, left: usize },

    #[error("declared length {declared} does not match {actual} available bytes")]
    BadLength { declared: usize, actual: usize },

    #[error("malformed string field")]
    BadString,

    #[error("{0} unread bytes after the last field")]
    TrailingBytes(usize),

    #[error("unsupported realm mode {0}")]
    UnknownMode(u32),
}

impl ProtocolError {
    pub fn errno(&self) -> i32 {
        match self {
            ProtocolError::BadMagic | ProtocolError::BadChecksum { .. } => libc::EBADMSG,
            ProtocolError::UnexpectedType { .. } | ProtocolError::UnknownType(_) => libc::ENOMSG,
            ProtocolError::Truncated { .. }
            | ProtocolError::NoSpace { .. }
            | ProtocolError::BadLength { .. } => libc::EMSGSIZE,
            ProtocolError::BadString | ProtocolError::TrailingBytes(_) => libc::EBADMSG,
            ProtocolError::UnknownMode(_) => libc::ENOTSUP,
        }
    }
}

/// Error types for turf
#[derive(Error, Debug)]
pub enum TurfError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::errno::Errno),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    Exists(String),

    #[error("Sandbox {0} is running")]
    Busy(String),

    #[error("Sandbox {0} is not running")]
    NotRunning(String),

    #[error("Sandbox {0} has not exited yet")]
    TryAgain(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Namespace isolation error: {0}")]
    Namespace(String),

    #[error("Privilege error: {0}")]
    Privilege(String),
}

impl TurfError {
    /// errno equivalent, sent back negated to remote clients.
    pub fn errno(&self) -> i32 {
        match self {
            TurfError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            TurfError::Sys(errno) => *errno as i32,
            TurfError::Json(_) => libc::EINVAL,
            TurfError::Protocol(p) => p.errno(),
            TurfError::Config(_) | TurfError::InvalidArgument(_) => libc::EINVAL,
            TurfError::NotFound(_) => libc::ENOENT,
            TurfError::Exists(_) => libc::EEXIST,
            TurfError::Busy(_) => libc::EBUSY,
            TurfError::NotRunning(_) => libc::ECHILD,
            TurfError::TryAgain(_) => libc::EAGAIN,
            TurfError::NotSupported(_) => libc::ENOTSUP,
            TurfError::Process(_) => libc::EIO,
            TurfError::Namespace(_) | TurfError::Privilege(_) => libc::EPERM,
        }
    }
}

/// Result type for turf operations
pub type Result<T> = std::result::Result<T, TurfError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_strings_round_trip() {
        let all = [
            RealmState::Init,
            RealmState::Starting,
            RealmState::Running,
            RealmState::Stopping,
            RealmState::Stopped,
            RealmState::Killing,
            RealmState::ForkWait,
            RealmState::Cloning,
            RealmState::Cloned,
        ];
        for state in all {
            assert_eq!(RealmState::parse(state.as_str()), state);
        }
        assert_eq!(RealmState::parse("bogus"), RealmState::Unknown);
    }

    #[test]
    fn test_state_serializes_as_string() {
        let json = serde_json::to_string(&RealmState::ForkWait).unwrap();
        assert_eq!(json, "\"forkwait\"");
        let back: RealmState = serde_json::from_str("\"running\"").unwrap();
        assert_eq!(back, RealmState::Running);
    }

    #[test]
    fn test_status_bits() {
        let mut status = RealmStatus::OK;
        assert!(status.is_empty());
        status.insert(RealmStatus::MEM_OVL);
        status.insert(RealmStatus::KILL);
        assert!(status.contains(RealmStatus::MEM_OVL));
        assert!(status.contains(RealmStatus::KILL));
        assert!(!status.contains(RealmStatus::CPU_OVL));
        assert_eq!(status.bits(), 0b101);
    }

    #[test]
    fn test_sandbox_name_validation() {
        assert!(validate_sandbox_name("sbx1").is_ok());
        assert!(validate_sandbox_name("abc").is_err());
        assert!(validate_sandbox_name(&"a".repeat(255)).is_err());
        assert!(validate_sandbox_name(&"a".repeat(254)).is_ok());
        assert!(validate_sandbox_name("ab/cd").is_err());
        assert!(validate_sandbox_name("ab\\cd").is_err());
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(TurfError::NotRunning("x".into()).errno(), libc::ECHILD);
        assert_eq!(TurfError::TryAgain("x".into()).errno(), libc::EAGAIN);
        assert_eq!(
            TurfError::Protocol(ProtocolError::BadMagic).errno(),
            libc::EBADMSG
        );
        assert_eq!(
            TurfError::Protocol(ProtocolError::UnexpectedType { expected: 1, found: 2 }).errno(),
            libc::ENOMSG
        );
        assert_eq!(TurfError::Sys(nix::errno::Errno::ESRCH).errno(), libc::ESRCH);
    }
}
