use kluster_core::EngineId;
use serde::{Deserialize, Serialize};

/// Metadata keys understood by the schedulers.
pub mod meta {
    pub const FOLLOW: &str = "follow";
    pub const AFTER: &str = "after";
    pub const RETRIES: &str = "retries";
    pub const TIMEOUT: &str = "timeout";
    pub const TARGETS: &str = "targets";
    pub const IS_COALESCING: &str = "is_coalescing";

    /// "ok" or "error" on every reply.
    pub const STATUS: &str = "status";
    pub const REASON: &str = "reason";
    pub const ENGINE_ID: &str = "engine_id";
    /// Engine ident a non-coalescing broadcast reply belongs to.
    pub const BROADCAST_TARGET: &str = "broadcast_target";
}

pub const STATUS_OK: &str = "ok";
pub const STATUS_ERROR: &str = "error";

/// Why the controller (not the engine) failed a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    EngineLost,
    Timeout,
    InvalidRequest,
    InvalidDependency,
    UnreachableDependency,
    ImpossibleDependency,
    UnavailableTarget,
    UnknownEngine,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EngineLost => "engine_lost",
            Self::Timeout => "timeout",
            Self::InvalidRequest => "invalid_request",
            Self::InvalidDependency => "invalid_dependency",
            Self::UnreachableDependency => "unreachable_dependency",
            Self::ImpossibleDependency => "impossible_dependency",
            Self::UnavailableTarget => "unavailable_target",
            Self::UnknownEngine => "unknown_engine",
        }
    }

    /// Failures that stem from dependency resolution rather than execution.
    pub fn is_dependency_failure(self) -> bool {
        matches!(
            self,
            Self::InvalidDependency | Self::UnreachableDependency | Self::ImpossibleDependency
        )
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of an error reply generated by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContent {
    pub ename: String,
    pub evalue: String,
    pub reason: FailureReason,
}

impl ErrorContent {
    pub fn new(reason: FailureReason, evalue: impl Into<String>) -> Self {
        let ename = match reason {
            FailureReason::EngineLost => "EngineError",
            FailureReason::Timeout => "TaskTimeout",
            FailureReason::InvalidRequest => "InvalidRequest",
            FailureReason::InvalidDependency => "InvalidDependency",
            FailureReason::UnreachableDependency | FailureReason::ImpossibleDependency => {
                "ImpossibleDependency"
            }
            FailureReason::UnavailableTarget | FailureReason::UnknownEngine => "UnmetDependency",
        };
        Self {
            ename: ename.to_string(),
            evalue: evalue.into(),
            reason,
        }
    }
}

/// One engine's share of a broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetResult {
    pub engine: String,
    #[serde(default)]
    pub engine_id: Option<EngineId>,
    pub status: String,
    #[serde(default)]
    pub reason: Option<FailureReason>,
    /// The engine's reply payload, or encoded [`ErrorContent`] on failure.
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl TargetResult {
    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

/// Payload of a coalesced `broadcast_reply`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BroadcastResults {
    pub results: Vec<TargetResult>,
}

impl BroadcastResults {
    pub fn all_ok(&self) -> bool {
        self.results.iter().all(TargetResult::is_ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_reason_wire_names_match_as_str() {
        for reason in [
            FailureReason::EngineLost,
            FailureReason::Timeout,
            FailureReason::InvalidDependency,
            FailureReason::UnreachableDependency,
            FailureReason::ImpossibleDependency,
            FailureReason::UnavailableTarget,
        ] {
            let json = serde_json::to_value(reason).unwrap();
            assert_eq!(json, serde_json::Value::String(reason.as_str().into()));
        }
    }

    #[test]
    fn dependency_failures_are_distinguishable() {
        assert!(FailureReason::ImpossibleDependency.is_dependency_failure());
        assert!(!FailureReason::EngineLost.is_dependency_failure());
        assert!(!FailureReason::Timeout.is_dependency_failure());
    }

    #[test]
    fn aggregate_ok_requires_every_target() {
        let ok = TargetResult {
            engine: "a".into(),
            engine_id: Some(EngineId(0)),
            status: STATUS_OK.into(),
            reason: None,
            payload: vec![],
        };
        let mut failed = ok.clone();
        failed.status = STATUS_ERROR.into();
        assert!(BroadcastResults { results: vec![ok.clone()] }.all_ok());
        assert!(!BroadcastResults { results: vec![ok, failed] }.all_ok());
    }
}
