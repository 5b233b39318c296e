use kluster_core::KlusterError;

use crate::state::LaunchState;

#[derive(Debug, thiserror::Error)]
pub enum LauncherError {
    #[error("{name}: {reason}")]
    ProcessState { name: String, reason: String },

    #[error("{name}: not running (state: {state})")]
    NotRunning { name: String, state: LaunchState },

    #[error("unknown launch status: {0}")]
    UnknownStatus(String),

    #[error("unknown launcher '{0}'")]
    UnknownLauncher(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("could not find a job id in submit output: {0:?}")]
    JobIdParse(String),

    #[error("submit command `{command}` failed ({status}): {output}")]
    Submit {
        command: String,
        status: String,
        output: String,
    },

    #[error("command `{command}` failed ({status}): {output}")]
    CommandFailed {
        command: String,
        status: String,
        output: String,
    },

    #[error("signal failed: {0}")]
    Signal(String),

    #[error("{0}")]
    Unsupported(String),

    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("invalid regex: {0}")]
    Regex(#[from] regex::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Kluster(#[from] KlusterError),
}

impl LauncherError {
    pub fn already_started(name: &str) -> Self {
        Self::ProcessState {
            name: name.to_string(),
            reason: "already started".into(),
        }
    }
}
