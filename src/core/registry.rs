//! Live realms tracked by the daemon.
//!
//! Keys are realm names. PID lookups skip realms whose exit has already been
//! recorded, so a recycled pid never resolves to a dead entry; those entries
//! are dropped on the next health pass.
use crate::config::types::{RealmStatus, Result, TurfError};
use crate::core::health::Watch;
use crate::core::realm::Realm;
use crate::kernel::procfs::ProcStat;
use std::collections::HashMap;
use std::os::fd::RawFd;

/// A registered realm with its health bookkeeping.
#[derive(Debug)]
pub struct Sandbox {
    pub realm: Realm,
    pub watch: Watch,
    /// Last health sample, persisted on exit
    pub last_stat: Option<ProcStat>,
}

impl Sandbox {
    pub fn new(realm: Realm) -> Self {
        let watch = Watch::new(realm.config().mem_limit_kib, realm.config().cpu_limit_ms);
        Self {
            realm,
            watch,
            last_stat: None,
        }
    }

    pub fn is_exited(&self) -> bool {
        self.realm.status().contains(RealmStatus::EXITED)
    }

    /// Has a process that has not been reaped yet.
    pub fn is_live(&self) -> bool {
        self.realm.pid() > 0 && !self.is_exited()
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    entries: HashMap<String, Sandbox>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a realm. A previous entry under the same name is only
    /// replaced once its exit has been recorded.
    pub fn insert(&mut self, realm: Realm) -> Result<&mut Sandbox> {
        let name = realm.name().to_string();
        if let Some(old) = self.entries.get(&name) {
            if !old.is_exited() && old.realm.pid() > 0 {
                return Err(TurfError::Exists(name));
            }
        }
        self.entries.insert(name.clone(), Sandbox::new(realm));
        self.entries
            .get_mut(&name)
            .ok_or(TurfError::NotFound(name))
    }

    pub fn get(&self, name: &str) -> Option<&Sandbox> {
        self.entries.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Sandbox> {
        self.entries.get_mut(name)
    }

    pub fn find_by_pid(&mut self, pid: i32) -> Option<&mut Sandbox> {
        if pid <= 0 {
            return None;
        }
        self.entries
            .values_mut()
            .find(|s| s.realm.pid() == pid && !s.is_exited())
    }

    /// Realm whose seed channel uses `fd`.
    pub fn find_by_channel(&mut self, fd: RawFd) -> Option<&mut Sandbox> {
        self.entries
            .values_mut()
            .find(|s| s.realm.channel_fd() == Some(fd))
    }

    pub fn remove(&mut self, name: &str) -> Option<Sandbox> {
        self.entries.remove(name)
    }

    pub fn remove_pid(&mut self, pid: i32) -> Option<Sandbox> {
        let name = self.find_by_pid(pid)?.realm.name().to_string();
        self.entries.remove(&name)
    }

    /// Drop every entry whose exit was recorded; returns their names.
    pub fn evict_exited(&mut self) -> Vec<String> {
        let gone: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, s)| s.is_exited())
            .map(|(name, _)| name.clone())
            .collect();
        for name in &gone {
            self.entries.remove(name);
        }
        gone
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sandbox> {
        self.entries.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Sandbox> {
        self.entries.values_mut()
    }

    pub fn live_count(&self) -> usize {
        self.entries.values().filter(|s| s.is_live()).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
