use std::fmt;

use serde::{Deserialize, Serialize};

/// Integer id the hub assigns to an engine at registration.
///
/// Ids are allocated from a monotonic counter and never reused within the
/// lifetime of a controller, so a stale id can never alias a new engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngineId(pub u32);

impl EngineId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for EngineId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}
