use kluster_core::{EngineId, KlusterError};
use kluster_wire::WireError;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while bringing up or running controller units.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error(transparent)]
    Kluster(#[from] KlusterError),

    #[error("task db error: {0}")]
    Db(#[from] DbError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unit '{name}' failed: {reason}")]
    Unit { name: String, reason: String },
}

/// Why a submit was refused before it reached the pending queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("invalid dependency: {0}")]
    InvalidDependency(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("no record for task {0}")]
    NotFound(Uuid),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Engine table failures surfaced in hub replies.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("ident '{0}' is already registered")]
    DuplicateIdent(String),

    #[error("unknown engine {0}")]
    UnknownEngine(EngineId),
}
