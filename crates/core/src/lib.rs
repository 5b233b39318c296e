pub mod config;
pub mod error;
pub mod ids;
pub mod profile;

pub use config::{
    BatchConfig, ClusterConfig, ClusterSection, ControllerConfig, LauncherConfig, MpiConfig,
    SshConfig, SshEngineSpec, TransportConfig,
};
pub use error::KlusterError;
pub use ids::EngineId;
pub use profile::ProfileDir;
