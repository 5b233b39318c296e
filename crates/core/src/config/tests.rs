use std::path::PathBuf;

use super::types::{ClusterConfig, SshEngineSpec};

#[test]
fn empty_toml_is_valid_local_config() {
    let cfg = ClusterConfig::from_toml("").unwrap();
    assert_eq!(cfg.transport.kind, "tcp");
    assert_eq!(cfg.controller.scheme, "leastload");
    assert_eq!(cfg.controller.hwm, 1);
    assert_eq!(cfg.launcher.n, 2);
    assert_eq!(cfg.launcher.controller, "Local");
}

#[test]
fn parse_full_toml() {
    let toml = r#"
[cluster]
profile_dir = "/srv/kluster/profile_hpc"
cluster_id = "run7"

[transport]
kind = "tcp"
ip = "0.0.0.0"
location = "head.example.org"
base_port = 12000

[controller]
scheme = "lru"
hwm = 0
heartbeat_period_ms = 1000
heartbeat_max_missed = 3
broadcast_depth = 2
db = "memory"

[launcher]
controller = "Slurm"
engines = "SSH"
n = 16
kill_delay_secs = 0.5

[launcher.batch]
queue = "gpu"
account = "proj42"

[launcher.batch.namespace]
modules = "cuda/12"

[launcher.ssh.engines]
"node1" = 4
"alice@node2:2222" = [2, ["--debug"]]
"node3" = { n = 1, engine_cmd = ["/opt/engine"] }
"#;
    let cfg = ClusterConfig::from_toml(toml).unwrap();
    assert_eq!(cfg.cluster.profile_dir, PathBuf::from("/srv/kluster/profile_hpc"));
    assert_eq!(cfg.cluster.cluster_id, "run7");
    assert_eq!(cfg.transport.advertised_location(), "head.example.org");
    assert_eq!(cfg.transport.base_port, 12000);
    assert_eq!(cfg.controller.scheme, "lru");
    assert_eq!(cfg.controller.hwm, 0);
    assert_eq!(cfg.controller.heartbeat_max_missed, 3);
    assert_eq!(cfg.controller.broadcast_depth, 2);
    assert_eq!(cfg.launcher.controller, "Slurm");
    assert_eq!(cfg.launcher.n, 16);
    assert_eq!(cfg.launcher.kill_delay().as_millis(), 500);
    assert_eq!(cfg.launcher.batch.queue.as_deref(), Some("gpu"));
    assert_eq!(cfg.launcher.batch.namespace["modules"], "cuda/12");

    let engines = &cfg.launcher.ssh.engines;
    assert_eq!(engines["node1"], SshEngineSpec::Count(4));
    assert_eq!(engines["alice@node2:2222"].count(), 2);
    assert_eq!(
        engines["alice@node2:2222"].engine_args(),
        Some(&["--debug".to_string()][..])
    );
    assert_eq!(engines["node3"].engine_cmd(), Some(&["/opt/engine".to_string()][..]));
}

#[test]
fn reject_invalid_transport_kind() {
    let err = ClusterConfig::from_toml("[transport]\nkind = \"udp\"\n").unwrap_err();
    assert!(err.to_string().contains("invalid transport kind"));
}

#[test]
fn reject_unknown_scheme() {
    let err = ClusterConfig::from_toml("[controller]\nscheme = \"weighted\"\n").unwrap_err();
    assert!(err.to_string().contains("unknown task scheme"));
}

#[test]
fn reject_zero_missed_beats() {
    let err =
        ClusterConfig::from_toml("[controller]\nheartbeat_max_missed = 0\n").unwrap_err();
    assert!(err.to_string().contains("heartbeat_max_missed"));
}

#[test]
fn reject_negative_delays() {
    let err = ClusterConfig::from_toml("[launcher]\nkill_delay_secs = -1.0\n").unwrap_err();
    assert!(err.to_string().contains("kill_delay_secs"));
}

#[test]
fn reject_excessive_broadcast_depth() {
    let err = ClusterConfig::from_toml("[controller]\nbroadcast_depth = 40\n").unwrap_err();
    assert!(err.to_string().contains("broadcast_depth"));
}

#[test]
fn discover_prefers_profile_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("kluster.toml"),
        "[controller]\nscheme = \"lru\"\n",
    )
    .unwrap();
    let cfg = ClusterConfig::discover(None, Some(dir.path())).unwrap();
    assert_eq!(cfg.controller.scheme, "lru");
    assert_eq!(cfg.cluster.profile_dir, dir.path());
}

#[test]
fn discover_without_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = ClusterConfig::discover(None, Some(dir.path())).unwrap();
    assert_eq!(cfg.controller.scheme, "leastload");
    assert_eq!(cfg.cluster.profile_dir, dir.path());
}
