use std::path::{Path, PathBuf};

use crate::error::KlusterError;

use super::types::ClusterConfig;

impl ClusterConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, KlusterError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, KlusterError> {
        tracing::info!(path = %path.as_ref().display(), "loading config");
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Load `path` if given, else `kluster.toml` in the profile dir if it
    /// exists, else defaults.
    pub fn discover(path: Option<&Path>, profile_dir: Option<&Path>) -> Result<Self, KlusterError> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        let mut config = match profile_dir {
            Some(dir) if dir.join("kluster.toml").is_file() => {
                Self::from_file(dir.join("kluster.toml"))?
            }
            _ => {
                let mut config = Self::default();
                config.apply_env_overrides();
                config.validate()?;
                config
            }
        };
        if let Some(dir) = profile_dir {
            config.cluster.profile_dir = dir.to_path_buf();
        }
        tracing::debug!(
            profile_dir = %config.cluster.profile_dir.display(),
            scheme = %config.controller.scheme,
            "configuration resolved"
        );
        Ok(config)
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// Convention: `KLUSTER_SECTION_KEY` overrides `section.key`.
    /// - `KLUSTER_CLUSTER_PROFILE_DIR` -> `cluster.profile_dir`
    /// - `KLUSTER_CLUSTER_ID` -> `cluster.cluster_id`
    /// - `KLUSTER_TRANSPORT_KIND` / `_IP` / `_BASE_PORT`
    /// - `KLUSTER_CONTROLLER_SCHEME` / `_HWM`
    /// - `KLUSTER_LAUNCHER_CONTROLLER` / `_ENGINES` / `_N`
    /// - `KLUSTER_BATCH_QUEUE`
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("KLUSTER_CLUSTER_PROFILE_DIR") {
            self.cluster.profile_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("KLUSTER_CLUSTER_ID") {
            self.cluster.cluster_id = v;
        }
        if let Ok(v) = std::env::var("KLUSTER_TRANSPORT_KIND") {
            self.transport.kind = v;
        }
        if let Ok(v) = std::env::var("KLUSTER_TRANSPORT_IP") {
            self.transport.ip = v;
        }
        if let Ok(v) = std::env::var("KLUSTER_TRANSPORT_BASE_PORT") {
            if let Ok(port) = v.parse::<u16>() {
                self.transport.base_port = port;
            }
        }
        if let Ok(v) = std::env::var("KLUSTER_CONTROLLER_SCHEME") {
            self.controller.scheme = v;
        }
        if let Ok(v) = std::env::var("KLUSTER_CONTROLLER_HWM") {
            if let Ok(hwm) = v.parse::<u32>() {
                self.controller.hwm = hwm;
            }
        }
        if let Ok(v) = std::env::var("KLUSTER_LAUNCHER_CONTROLLER") {
            self.launcher.controller = v;
        }
        if let Ok(v) = std::env::var("KLUSTER_LAUNCHER_ENGINES") {
            self.launcher.engines = v;
        }
        if let Ok(v) = std::env::var("KLUSTER_LAUNCHER_N") {
            if let Ok(n) = v.parse::<usize>() {
                self.launcher.n = n;
            }
        }
        if let Ok(v) = std::env::var("KLUSTER_BATCH_QUEUE") {
            self.launcher.batch.queue = Some(v);
        }
    }
}
