//! Placement policies for load-balanced tasks.

use std::fmt;
use std::str::FromStr;

use kluster_core::{EngineId, KlusterError};

/// What the scheduler knows about an engine when placing a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub id: EngineId,
    /// Tasks currently assigned to the engine.
    pub load: usize,
    /// Dispatch sequence number of the engine's most recent task, 0 if none.
    pub last_dispatch: u64,
}

/// Picks one engine among eligible candidates.
pub trait LoadScheme: Send + Sync {
    fn name(&self) -> &'static str;

    /// `candidates` is never empty and is ordered by engine id.
    fn choose(&self, candidates: &[Candidate]) -> Option<EngineId>;
}

/// Fewest outstanding tasks, ties to the lowest engine id.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeastLoad;

impl LoadScheme for LeastLoad {
    fn name(&self) -> &'static str {
        "leastload"
    }

    fn choose(&self, candidates: &[Candidate]) -> Option<EngineId> {
        candidates
            .iter()
            .min_by_key(|c| (c.load, c.id))
            .map(|c| c.id)
    }
}

/// Least recently dispatched to, ties to the lowest engine id.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lru;

impl LoadScheme for Lru {
    fn name(&self) -> &'static str {
        "lru"
    }

    fn choose(&self, candidates: &[Candidate]) -> Option<EngineId> {
        candidates
            .iter()
            .min_by_key(|c| (c.last_dispatch, c.id))
            .map(|c| c.id)
    }
}

/// How the controller serves the task channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskScheme {
    LeastLoad,
    Lru,
    /// ROUTER to DEALER relay, no dependencies or retries.
    Pure,
    /// No task channel at all.
    None,
}

impl TaskScheme {
    /// Placement policy, for schemes served by the task scheduler.
    pub fn load_scheme(self) -> Option<Box<dyn LoadScheme>> {
        match self {
            Self::LeastLoad => Some(Box::new(LeastLoad)),
            Self::Lru => Some(Box::new(Lru)),
            Self::Pure | Self::None => None,
        }
    }
}

impl FromStr for TaskScheme {
    type Err = KlusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "leastload" | "least_load" => Ok(Self::LeastLoad),
            "lru" => Ok(Self::Lru),
            "pure" => Ok(Self::Pure),
            "none" => Ok(Self::None),
            other => Err(KlusterError::Config(format!("unknown task scheme '{other}'"))),
        }
    }
}

impl fmt::Display for TaskScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::LeastLoad => "leastload",
            Self::Lru => "lru",
            Self::Pure => "pure",
            Self::None => "none",
        })
    }
}
