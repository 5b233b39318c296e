use thiserror::Error;

/// Failures shared by every kluster crate: loading `kluster.toml`,
/// validating it, and touching the profile directory.
#[derive(Error, Debug)]
pub enum KlusterError {
    /// A value was parsed but makes no sense (unknown scheme, zero slots).
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("kluster.toml: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("profile I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("profile JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
