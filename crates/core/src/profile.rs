use std::path::{Path, PathBuf};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

/// Default profile directory: `~/.kluster/profile_default`.
pub fn default_profile_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".kluster")
        .join("profile_default")
}

/// Layout of a cluster profile directory on disk.
///
/// ```text
/// <profile>/security/   connection files (mode 0600)
/// <profile>/pid/        cluster pid files
/// <profile>/log/        launcher work dirs and batch scripts
/// <profile>/db/         engine state and task db files
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileDir {
    root: PathBuf,
}

impl ProfileDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn security_dir(&self) -> PathBuf {
        self.root.join("security")
    }

    pub fn pid_dir(&self) -> PathBuf {
        self.root.join("pid")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("log")
    }

    pub fn db_dir(&self) -> PathBuf {
        self.root.join("db")
    }

    /// Create every subdirectory that does not exist yet.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [self.security_dir(), self.pid_dir(), self.log_dir(), self.db_dir()] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Base file name shared by every per-cluster artifact.
    ///
    /// An empty cluster id maps to the bare prefix so a single default
    /// cluster per profile needs no id at all.
    pub fn cluster_file_stem(prefix: &str, cluster_id: &str) -> String {
        if cluster_id.is_empty() {
            prefix.to_string()
        } else {
            format!("{prefix}-{cluster_id}")
        }
    }

    pub fn pid_file(&self, cluster_id: &str) -> PathBuf {
        self.pid_dir()
            .join(format!("{}.pid", Self::cluster_file_stem("kluster", cluster_id)))
    }

    pub fn engine_state_file(&self, cluster_id: &str) -> PathBuf {
        self.db_dir()
            .join(format!("{}.json", Self::cluster_file_stem("engines", cluster_id)))
    }

    /// Path of a connection file for the given side (`client` or `engine`).
    pub fn connection_file(&self, cluster_id: &str, side: &str) -> PathBuf {
        self.security_dir().join(format!(
            "{}-{side}.json",
            Self::cluster_file_stem("kluster", cluster_id)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_include_cluster_id_only_when_set() {
        let p = ProfileDir::new("/tmp/prof");
        assert_eq!(p.pid_file(""), PathBuf::from("/tmp/prof/pid/kluster.pid"));
        assert_eq!(p.pid_file("a1"), PathBuf::from("/tmp/prof/pid/kluster-a1.pid"));
        assert_eq!(
            p.connection_file("a1", "engine"),
            PathBuf::from("/tmp/prof/security/kluster-a1-engine.json")
        );
        assert_eq!(p.engine_state_file(""), PathBuf::from("/tmp/prof/db/engines.json"));
    }

    #[test]
    fn ensure_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let p = ProfileDir::new(dir.path().join("profile_x"));
        p.ensure().unwrap();
        assert!(p.security_dir().is_dir());
        assert!(p.pid_dir().is_dir());
        assert!(p.log_dir().is_dir());
        assert!(p.db_dir().is_dir());
    }
}
