//! Engine table owned by the hub.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::time::{Duration, Instant};

use kluster_core::EngineId;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{ControllerError, RegistryError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Registered, no heartbeat seen yet.
    Unknown,
    Alive,
}

#[derive(Debug, Clone)]
pub struct EngineEntry {
    pub id: EngineId,
    pub ident: String,
    pub liveness: Liveness,
    pub registered_at: Instant,
    /// Direct (mux) requests sent to the engine and not yet answered.
    pub queue: BTreeSet<Uuid>,
    /// Load-balanced tasks assigned to the engine and not yet answered.
    pub tasks: BTreeSet<Uuid>,
    pub completed: BTreeSet<Uuid>,
}

impl EngineEntry {
    fn new(id: EngineId, ident: String, now: Instant) -> Self {
        Self {
            id,
            ident,
            liveness: Liveness::Unknown,
            registered_at: now,
            queue: BTreeSet::new(),
            tasks: BTreeSet::new(),
            completed: BTreeSet::new(),
        }
    }

    /// Forget a finished request, wherever it was outstanding.
    pub fn finish(&mut self, msg_id: Uuid) {
        self.queue.remove(&msg_id);
        self.tasks.remove(&msg_id);
        self.completed.insert(msg_id);
    }
}

/// Persisted engine table, written on every registration change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStateFile {
    pub next_id: u32,
    pub engines: BTreeMap<EngineId, String>,
}

impl EngineStateFile {
    pub fn load(path: &Path) -> Result<Self, ControllerError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ControllerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct EngineRegistry {
    next_id: u32,
    engines: BTreeMap<EngineId, EngineEntry>,
    by_ident: HashMap<String, EngineId>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a state file. Restored engines must heartbeat again
    /// before they count as alive.
    pub fn restore(state: EngineStateFile, now: Instant) -> Self {
        let mut registry = Self {
            next_id: state.next_id,
            ..Self::default()
        };
        for (id, ident) in state.engines {
            registry.next_id = registry.next_id.max(id.0 + 1);
            registry.by_ident.insert(ident.clone(), id);
            registry.engines.insert(id, EngineEntry::new(id, ident, now));
        }
        info!(engines = registry.engines.len(), next_id = registry.next_id, "restored engine table");
        registry
    }

    pub fn state(&self) -> EngineStateFile {
        EngineStateFile {
            next_id: self.next_id,
            engines: self.engines.iter().map(|(id, e)| (*id, e.ident.clone())).collect(),
        }
    }

    pub fn register(&mut self, ident: &str, now: Instant) -> Result<EngineId, RegistryError> {
        if self.by_ident.contains_key(ident) {
            return Err(RegistryError::DuplicateIdent(ident.to_string()));
        }
        let id = EngineId(self.next_id);
        self.next_id += 1;
        self.by_ident.insert(ident.to_string(), id);
        self.engines.insert(id, EngineEntry::new(id, ident.to_string(), now));
        Ok(id)
    }

    /// Returns the engine id when this flips the engine to `Alive`.
    pub fn mark_alive(&mut self, ident: &str) -> Option<EngineId> {
        let id = *self.by_ident.get(ident)?;
        let entry = self.engines.get_mut(&id)?;
        if entry.liveness == Liveness::Alive {
            return None;
        }
        entry.liveness = Liveness::Alive;
        Some(id)
    }

    pub fn unregister(&mut self, id: EngineId) -> Result<EngineEntry, RegistryError> {
        let entry = self.engines.remove(&id).ok_or(RegistryError::UnknownEngine(id))?;
        self.by_ident.remove(&entry.ident);
        Ok(entry)
    }

    /// Engines still `Unknown` after `timeout`.
    pub fn expired_unknown(&self, now: Instant, timeout: Duration) -> Vec<EngineId> {
        self.engines
            .values()
            .filter(|e| e.liveness == Liveness::Unknown && now.duration_since(e.registered_at) >= timeout)
            .map(|e| e.id)
            .collect()
    }

    pub fn id_of(&self, ident: &str) -> Option<EngineId> {
        self.by_ident.get(ident).copied()
    }

    pub fn get(&self, id: EngineId) -> Option<&EngineEntry> {
        self.engines.get(&id)
    }

    pub fn get_mut(&mut self, id: EngineId) -> Option<&mut EngineEntry> {
        self.engines.get_mut(&id)
    }

    pub fn by_ident_mut(&mut self, ident: &str) -> Option<&mut EngineEntry> {
        let id = self.id_of(ident)?;
        self.engines.get_mut(&id)
    }

    pub fn engines(&self) -> impl Iterator<Item = &EngineEntry> {
        self.engines.values()
    }

    pub fn engines_mut(&mut self) -> impl Iterator<Item = &mut EngineEntry> {
        self.engines.values_mut()
    }

    pub fn alive(&self) -> impl Iterator<Item = &EngineEntry> {
        self.engines.values().filter(|e| e.liveness == Liveness::Alive)
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_never_reused() {
        let mut reg = EngineRegistry::new();
        let now = Instant::now();
        let a = reg.register("a", now).unwrap();
        let b = reg.register("b", now).unwrap();
        reg.unregister(a).unwrap();
        let c = reg.register("a", now).unwrap();
        assert_eq!((a, b, c), (EngineId(0), EngineId(1), EngineId(2)));
    }

    #[test]
    fn duplicate_ident_is_rejected() {
        let mut reg = EngineRegistry::new();
        reg.register("a", Instant::now()).unwrap();
        assert_eq!(
            reg.register("a", Instant::now()),
            Err(RegistryError::DuplicateIdent("a".into()))
        );
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn first_heartbeat_marks_alive_once() {
        let mut reg = EngineRegistry::new();
        let id = reg.register("a", Instant::now()).unwrap();
        assert_eq!(reg.mark_alive("a"), Some(id));
        assert_eq!(reg.mark_alive("a"), None);
        assert_eq!(reg.mark_alive("zz"), None);
        assert_eq!(reg.alive().count(), 1);
    }

    #[test]
    fn silent_engines_expire() {
        let mut reg = EngineRegistry::new();
        let t0 = Instant::now();
        let quiet = reg.register("quiet", t0).unwrap();
        reg.register("chatty", t0).unwrap();
        reg.mark_alive("chatty");
        let timeout = Duration::from_secs(15);
        assert!(reg.expired_unknown(t0 + Duration::from_secs(14), timeout).is_empty());
        assert_eq!(reg.expired_unknown(t0 + timeout, timeout), vec![quiet]);
    }

    #[test]
    fn state_file_round_trips_and_keeps_counter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engines.json");
        let mut reg = EngineRegistry::new();
        let now = Instant::now();
        reg.register("a", now).unwrap();
        let b = reg.register("b", now).unwrap();
        reg.unregister(EngineId(0)).unwrap();
        reg.state().save(&path).unwrap();

        let restored = EngineRegistry::restore(EngineStateFile::load(&path).unwrap(), now);
        assert_eq!(restored.id_of("b"), Some(b));
        assert_eq!(restored.get(b).unwrap().liveness, Liveness::Unknown);
        let mut restored = restored;
        assert_eq!(restored.register("c", now).unwrap(), EngineId(2));
    }
}
