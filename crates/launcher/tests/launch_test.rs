#![cfg(unix)]
//! Controller and engine launchers built from config, end to end with `sh`
//! standing in for the kluster binaries.

use std::time::Duration;

use kluster_core::ClusterConfig;
use kluster_launcher::{
    controller_launcher, engine_launcher, ClusterLauncher, LaunchState, Launcher, StartData,
    StopData,
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn config(profile: &std::path::Path, controller: &str, engine: &str) -> ClusterConfig {
    let mut config = ClusterConfig::default();
    config.cluster.profile_dir = profile.to_path_buf();
    config.launcher.controller_cmd = vec!["sh".into(), "-c".into(), controller.into()];
    config.launcher.engine_cmd = vec!["sh".into(), "-c".into(), engine.into()];
    config.launcher.stagger_secs = 0.0;
    config.launcher.kill_delay_secs = 0.3;
    config.launcher.poll_interval_ms = 20;
    config
}

#[tokio::test]
async fn local_cluster_starts_and_stops() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "sleep 30", "sleep 30");

    let controller = controller_launcher(&config).unwrap();
    let engines = engine_launcher(&config).unwrap();
    assert!(matches!(controller, ClusterLauncher::Process(_)));

    assert!(matches!(controller.start(1).await.unwrap(), StartData::Pid(_)));
    match engines.start(3).await.unwrap() {
        StartData::Set(children) => assert_eq!(children.len(), 3),
        other => panic!("unexpected start data {other:?}"),
    }
    assert_eq!(engines.state(), LaunchState::Running);

    engines.stop().await.unwrap();
    controller.stop().await.unwrap();

    let engine_stop = tokio::time::timeout(TIMEOUT, engines.lifecycle().stopped())
        .await
        .unwrap();
    match engine_stop {
        StopData::Set(children) => assert_eq!(children.len(), 3),
        other => panic!("unexpected stop data {other:?}"),
    }
    tokio::time::timeout(TIMEOUT, controller.lifecycle().stopped())
        .await
        .unwrap();
    assert_eq!(controller.state(), LaunchState::After);
}

#[tokio::test]
async fn engines_exiting_on_their_own_stop_the_set() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "sleep 30", "exit 2");
    let engines = engine_launcher(&config).unwrap();
    engines.start(2).await.unwrap();
    let stopped = tokio::time::timeout(TIMEOUT, engines.lifecycle().stopped())
        .await
        .unwrap();
    assert!(!stopped.is_success());
}

#[tokio::test]
async fn stop_callbacks_fire_once_even_when_stop_is_repeated() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "sleep 30", "sleep 30");
    let controller = controller_launcher(&config).unwrap();

    let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let c = std::sync::Arc::clone(&calls);
    controller.on_stop(Box::new(move |_| {
        c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }));
    controller.start(1).await.unwrap();
    controller.stop().await.unwrap();
    controller.stop().await.unwrap();
    tokio::time::timeout(TIMEOUT, controller.lifecycle().stopped())
        .await
        .unwrap();
    controller.stop().await.unwrap();
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}
