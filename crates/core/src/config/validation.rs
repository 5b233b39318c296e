use super::types::ClusterConfig;
use crate::error::KlusterError;

/// Deepest broadcast tree accepted.
const MAX_BROADCAST_DEPTH: u32 = 12;

impl ClusterConfig {
    /// Validate the config: unknown enum-like strings, impossible numbers.
    pub fn validate(&self) -> Result<(), KlusterError> {
        self.validate_transport_kind()?;
        self.validate_scheme()?;
        self.validate_heartbeat()?;
        self.validate_broadcast()?;
        self.validate_db()?;
        self.validate_launcher_timing()?;
        Ok(())
    }

    fn validate_transport_kind(&self) -> Result<(), KlusterError> {
        match self.transport.kind.as_str() {
            "ipc" | "tcp" => Ok(()),
            other => Err(KlusterError::Config(format!(
                "invalid transport kind '{other}', expected 'ipc' or 'tcp'"
            ))),
        }
    }

    fn validate_scheme(&self) -> Result<(), KlusterError> {
        match self.controller.scheme.as_str() {
            "leastload" | "lru" | "pure" | "none" => Ok(()),
            other => Err(KlusterError::Config(format!(
                "unknown task scheme '{other}', expected leastload, lru, pure or none"
            ))),
        }
    }

    fn validate_heartbeat(&self) -> Result<(), KlusterError> {
        if self.controller.heartbeat_period_ms == 0 {
            return Err(KlusterError::Config(
                "controller.heartbeat_period_ms must be positive".into(),
            ));
        }
        if self.controller.heartbeat_max_missed == 0 {
            return Err(KlusterError::Config(
                "controller.heartbeat_max_missed must be at least 1".into(),
            ));
        }
        Ok(())
    }

    fn validate_broadcast(&self) -> Result<(), KlusterError> {
        if self.controller.broadcast_depth > MAX_BROADCAST_DEPTH {
            return Err(KlusterError::Config(format!(
                "controller.broadcast_depth {} exceeds {MAX_BROADCAST_DEPTH}",
                self.controller.broadcast_depth
            )));
        }
        if self.controller.broadcast_slots == 0 {
            return Err(KlusterError::Config(
                "controller.broadcast_slots must be positive".into(),
            ));
        }
        if !(self.controller.broadcast_timeout_secs.is_finite()
            && self.controller.broadcast_timeout_secs > 0.0)
        {
            return Err(KlusterError::Config(
                "controller.broadcast_timeout_secs must be a positive number".into(),
            ));
        }
        Ok(())
    }

    fn validate_db(&self) -> Result<(), KlusterError> {
        match self.controller.db.as_str() {
            "nodb" | "memory" | "file" => Ok(()),
            other => Err(KlusterError::Config(format!(
                "unknown db backend '{other}', expected nodb, memory or file"
            ))),
        }
    }

    fn validate_launcher_timing(&self) -> Result<(), KlusterError> {
        let l = &self.launcher;
        for (name, value) in [
            ("delay_secs", l.delay_secs),
            ("stagger_secs", l.stagger_secs),
            ("kill_delay_secs", l.kill_delay_secs),
            ("early_shutdown_secs", l.early_shutdown_secs),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(KlusterError::Config(format!(
                    "launcher.{name} must be a non-negative number"
                )));
            }
        }
        Ok(())
    }
}
