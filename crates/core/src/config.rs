//! Cluster configuration, parsed from `kluster.toml`.
//!
//! Every section has serde defaults, so an empty file is a valid local
//! configuration. `KLUSTER_SECTION_KEY` environment variables override
//! individual keys after parsing.

mod loading;
mod types;
mod validation;

#[cfg(test)]
mod tests;

pub use types::{
    BatchConfig, ClusterConfig, ClusterSection, ControllerConfig, LauncherConfig, MpiConfig,
    SshConfig, SshEngineSpec, TransportConfig,
};
