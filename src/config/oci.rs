//! Persisted bundle spec (`config.json`) and runtime state (`state.json`).
//!
//! Both follow the OCI runtime layout loosely: every field is optional on
//! read so hand-written or older files still load, and absent sections are
//! omitted on write.
use crate::config::types::{
    RealmState, RealmStatus, ResourceUsage, Result, TurfError, RLM_DEF_GID, RLM_DEF_UID,
};
use crate::kernel::procfs::ProcStat;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const TURF_OCI_VERSION: &str = "0.0.1-dev";

/// Runtime used by `turf spec` when none is given
pub const DEFAULT_RUNTIME: &str = "node";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Process {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(
        rename = "noNewPrivileges",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub no_new_privileges: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Root {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readonly: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    /// bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Cpu {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shares: Option<i64>,
    /// microseconds of CPU per period
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<i64>,
    /// microseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Memory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<Cpu>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Linux {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
}

/// turf-specific section
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TurfSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    /// code directory inside the bundle, copied into the overlay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
    #[serde(rename = "seed", default)]
    pub is_seed: bool,
}

/// `config.json`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OciSpec {
    #[serde(rename = "ociVersion", default)]
    pub oci_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<Process>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<Root>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linux: Option<Linux>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turf: Option<TurfSection>,
}

impl OciSpec {
    /// The spec written by `turf spec`.
    pub fn default_spec() -> Self {
        Self {
            oci_version: TURF_OCI_VERSION.to_string(),
            process: Some(Process {
                terminal: Some(false),
                user: Some(User {
                    uid: Some(RLM_DEF_UID),
                    gid: Some(RLM_DEF_GID),
                }),
                args: vec!["node".to_string(), "index.js".to_string()],
                env: vec![
                    "PATH=/usr/local/bin:/usr/bin:/bin".to_string(),
                    "TERM=xterm".to_string(),
                ],
                no_new_privileges: Some(true),
            }),
            root: Some(Root {
                path: Some("rootfs".to_string()),
                readonly: Some(false),
            }),
            linux: None,
            turf: Some(TurfSection {
                os: Some("linux".to_string()),
                runtime: Some(DEFAULT_RUNTIME.to_string()),
                code: Some("code".to_string()),
                binary: None,
                is_seed: false,
            }),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            TurfError::NotFound(format!("spec {}: {}", path.display(), e))
        })?;
        Self::loads(&content)
    }

    pub fn loads(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json(path, self)
    }

    /// Apply `--mem` (MB) and `--cpu` (percent) overrides.
    pub fn apply_limits(&mut self, mem_mb: Option<u32>, cpu_pct: Option<u32>) {
        if mem_mb.is_none() && cpu_pct.is_none() {
            return;
        }
        let resources = self
            .linux
            .get_or_insert_with(Linux::default)
            .resources
            .get_or_insert_with(Resources::default);

        if let Some(mb) = mem_mb {
            resources.memory = Some(Memory {
                limit: Some(i64::from(mb) * 1024 * 1024),
            });
        }
        if let Some(pct) = cpu_pct {
            let cpu = resources.cpu.get_or_insert_with(Cpu::default);
            cpu.period = Some(1_000_000);
            cpu.quota = Some(i64::from(pct) * 10_000);
        }
    }

    fn resources(&self) -> Option<&Resources> {
        self.linux.as_ref().and_then(|l| l.resources.as_ref())
    }

    /// Memory limit in KiB, comparable with sampled RSS.
    pub fn memory_limit_kib(&self) -> Option<u64> {
        self.resources()
            .and_then(|r| r.memory.as_ref())
            .and_then(|m| m.limit)
            .filter(|limit| *limit > 0)
            .map(|limit| limit as u64 / 1024)
    }

    /// CPU limit in milliseconds of CPU per wall-clock second.
    pub fn cpu_limit_ms(&self) -> Option<u64> {
        let cpu = self.resources().and_then(|r| r.cpu.as_ref())?;
        let quota = cpu.quota.filter(|q| *q > 0)?;
        let period_ms = cpu.period.filter(|p| *p >= 1000)? / 1000;
        Some((quota / period_ms) as u64)
    }

    pub fn args(&self) -> &[String] {
        self.process.as_ref().map(|p| p.args.as_slice()).unwrap_or(&[])
    }

    pub fn env(&self) -> &[String] {
        self.process.as_ref().map(|p| p.env.as_slice()).unwrap_or(&[])
    }

    pub fn terminal(&self) -> bool {
        self.process.as_ref().and_then(|p| p.terminal).unwrap_or(false)
    }

    pub fn uid(&self) -> Option<u32> {
        self.process.as_ref()?.user.as_ref()?.uid
    }

    pub fn gid(&self) -> Option<u32> {
        self.process.as_ref()?.user.as_ref()?.gid
    }

    pub fn runtime(&self) -> Option<&str> {
        self.turf.as_ref()?.runtime.as_deref()
    }

    pub fn code(&self) -> Option<&str> {
        self.turf.as_ref()?.code.as_deref()
    }

    pub fn binary(&self) -> Option<&str> {
        self.turf.as_ref()?.binary.as_deref()
    }

    pub fn is_seed(&self) -> bool {
        self.turf.as_ref().map(|t| t.is_seed).unwrap_or(false)
    }
}

/// RFC 3339 UTC timestamps with a nine-digit fraction, e.g.
/// `2019-05-05T00:34:56.909051486Z`.
pub mod rfc3339_nanos {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(ts: &DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
    }

    pub fn serialize<S: Serializer>(
        ts: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match ts {
            Some(ts) => serializer.serialize_str(&format(ts)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            None => Ok(None),
            Some(s) => DateTime::parse_from_rfc3339(&s)
                .map(|ts| Some(ts.with_timezone(&Utc)))
                .map_err(serde::de::Error::custom),
        }
    }
}

/// `state.json`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OciState {
    #[serde(rename = "ociVersion", default)]
    pub oci_version: String,
    pub id: String,
    #[serde(default)]
    pub pid: i32,
    #[serde(default)]
    pub bundle: String,
    #[serde(default)]
    pub state: RealmState,
    #[serde(default)]
    pub status: RealmStatus,
    #[serde(
        default,
        with = "rfc3339_nanos",
        skip_serializing_if = "Option::is_none"
    )]
    pub created: Option<DateTime<Utc>>,
    #[serde(
        default,
        with = "rfc3339_nanos",
        skip_serializing_if = "Option::is_none"
    )]
    pub stopped: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rusage: Option<ResourceUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stat: Option<ProcStat>,
}

impl OciState {
    /// Fresh state of a just-created sandbox.
    pub fn create(id: &str, bundle: &str) -> Self {
        Self {
            oci_version: TURF_OCI_VERSION.to_string(),
            id: id.to_string(),
            bundle: bundle.to_string(),
            state: RealmState::Init,
            created: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            TurfError::NotFound(format!("state {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Load the state file, or start a fresh one if it does not exist yet.
    pub fn load_or_create(path: &Path, id: &str) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::create(id, ""))
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json(path, self)
    }

    /// Record a terminal transition.
    pub fn mark_stopped(&mut self) {
        self.state = RealmState::Stopped;
        self.stopped = Some(Utc::now());
    }
}

/// Write pretty JSON via a temporary file and rename, so readers never see a torn file.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
