//! Batch scheduler launchers: write a job script, submit it, remember the
//! job id, and delete the job on stop.
//!
//! Job state is not polled. The launcher stays `Running` until `stop`, which
//! records the delete command's output as the stop data.

pub mod system;
pub mod template;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, warn};

use kluster_core::BatchConfig;

use crate::cluster::{ClusterIdentity, Role, RoleCommand};
use crate::error::LauncherError;
use crate::process::run_command;
use crate::state::{Lifecycle, StartData, StopData};
use crate::traits::{Launcher, Signal};

pub use system::BatchSystem;
pub use template::{build_script, BatchContext};

/// Everything a batch launcher needs, resolved from config.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub system: BatchSystem,
    pub role: Role,
    pub config: BatchConfig,
    pub identity: ClusterIdentity,
    pub command: RoleCommand,
    pub work_dir: PathBuf,
}

struct BatchInner {
    lifecycle: Lifecycle,
    settings: BatchSettings,
    job_id: Mutex<Option<String>>,
    delete_timeout: Duration,
}

/// How long `stop` waits for the delete command.
pub const DEFAULT_DELETE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct BatchLauncher {
    inner: Arc<BatchInner>,
}

impl BatchLauncher {
    pub fn new(settings: BatchSettings) -> Self {
        let name = format!("{}-{}", settings.system, settings.role);
        Self {
            inner: Arc::new(BatchInner {
                lifecycle: Lifecycle::new(name),
                settings,
                job_id: Mutex::new(None),
                delete_timeout: DEFAULT_DELETE_TIMEOUT,
            }),
        }
    }

    /// Builder-style override of [`DEFAULT_DELETE_TIMEOUT`]. Call before sharing.
    pub fn with_delete_timeout(mut self, timeout: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.delete_timeout = timeout;
        }
        self
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.inner.settings
    }

    pub fn job_id(&self) -> Option<String> {
        self.inner.job_id.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn template(&self) -> Result<String, LauncherError> {
        let s = &self.inner.settings;
        let (inline, file) = match s.role {
            Role::Controller => (&s.config.controller_template, &s.config.controller_template_file),
            Role::Engine => (&s.config.engine_template, &s.config.engine_template_file),
        };
        if let Some(text) = inline {
            return Ok(text.clone());
        }
        if let Some(path) = file {
            debug!(path = %path.display(), "reading batch template");
            return Ok(std::fs::read_to_string(path)?);
        }
        Ok(s.system.default_template(s.role).to_string())
    }

    pub fn context(&self, n: usize) -> BatchContext {
        let s = &self.inner.settings;
        BatchContext {
            role: s.role,
            n,
            profile_dir: s.identity.profile_dir.display().to_string(),
            cluster_id: s.identity.cluster_id.clone(),
            queue: s.config.queue.clone(),
            account: s.config.account.clone(),
            qos: s.config.qos.clone(),
            timelimit: s.config.timelimit.clone(),
            options: s.config.options.clone(),
            work_dir: s.work_dir.display().to_string(),
            command: s.command.argv(&s.identity),
            namespace: s.config.namespace.clone(),
        }
    }

    pub fn script_path(&self) -> PathBuf {
        let s = &self.inner.settings;
        let stem = kluster_core::ProfileDir::cluster_file_stem(
            &format!("kluster-{}", s.role),
            &s.identity.cluster_id,
        );
        s.work_dir
            .join(format!("{stem}.{}", s.system.script_extension()))
    }

    /// Render and write the job script for `n` units.
    pub fn write_script(&self, n: usize) -> Result<(PathBuf, String), LauncherError> {
        let s = &self.inner.settings;
        let script = build_script(s.system, &self.template()?, &self.context(n))?;
        let path = self.script_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, &script)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;
        }
        info!(launcher = %self.name(), path = %path.display(), "wrote job script");
        Ok((path, script))
    }

    pub fn parse_job_id(&self, output: &str) -> Result<String, LauncherError> {
        let s = &self.inner.settings;
        let (default_re, default_group) = s.system.job_id_regex();
        let (pattern, group) = match &s.config.job_id_regexp {
            Some(custom) => (custom.as_str(), 0),
            None => (default_re, default_group),
        };
        Regex::new(pattern)?
            .captures(output)
            .and_then(|caps| caps.get(group))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| LauncherError::JobIdParse(output.to_string()))
    }

    async fn submit(&self, path: &Path, script: &str) -> Result<String, LauncherError> {
        let s = &self.inner.settings;
        let base = s
            .config
            .submit_command
            .clone()
            .unwrap_or_else(|| s.system.submit_command());
        let argv = s.system.submit_argv(&base, path, s.config.scheduler.as_deref());
        let input = s.system.submits_via_stdin().then_some(script.as_bytes());
        let out = run_command(&argv, input, Some(&s.work_dir)).await?;
        if !out.success {
            return Err(LauncherError::Submit {
                command: argv.join(" "),
                status: out.status.clone(),
                output: out.combined(),
            });
        }
        self.parse_job_id(&out.stdout)
    }
}

#[async_trait]
impl Launcher for BatchLauncher {
    fn lifecycle(&self) -> &Lifecycle {
        &self.inner.lifecycle
    }

    async fn start(&self, n: usize) -> Result<StartData, LauncherError> {
        self.lifecycle().begin_start()?;
        let submitted = async {
            let (path, script) = self.write_script(n)?;
            self.submit(&path, &script).await
        }
        .await;
        match submitted {
            Ok(job_id) => {
                info!(launcher = %self.name(), job_id = %job_id, n, "job submitted");
                *self.inner.job_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(job_id.clone());
                self.lifecycle().notify_start(StartData::JobId(job_id.clone()));
                Ok(StartData::JobId(job_id))
            }
            Err(e) => {
                self.lifecycle().notify_stop(StopData::StartFailed {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn stop(&self) -> Result<(), LauncherError> {
        let Some(job_id) = self.job_id() else {
            debug!(launcher = %self.name(), "stop: no job submitted");
            return Ok(());
        };
        if self.state() != crate::state::LaunchState::Running {
            return Ok(());
        }
        let s = &self.inner.settings;
        let base = s
            .config
            .delete_command
            .clone()
            .unwrap_or_else(|| s.system.delete_command());
        let argv = s.system.delete_argv(&base, &job_id, s.config.scheduler.as_deref());
        let deleted = tokio::time::timeout(self.inner.delete_timeout, run_command(&argv, None, Some(&s.work_dir))).await;
        let output = match deleted {
            Err(_) => {
                warn!(launcher = %self.name(), job_id = %job_id, timeout = ?self.inner.delete_timeout, "delete command timed out");
                format!("delete command for job {job_id} timed out after {:?}", self.inner.delete_timeout)
            }
            Ok(Ok(out)) if out.success => out.combined(),
            Ok(Ok(out)) => {
                warn!(launcher = %self.name(), job_id = %job_id, status = %out.status, "delete command failed");
                format!("job {job_id} already appears to be stopped: {}", out.combined())
            }
            Ok(Err(e)) => {
                warn!(launcher = %self.name(), job_id = %job_id, error = %e, "could not run delete command");
                e.to_string()
            }
        };
        self.lifecycle().notify_stop(StopData::Job { job_id, output });
        Ok(())
    }

    async fn signal(&self, sig: Signal) -> Result<(), LauncherError> {
        self.lifecycle().require_running()?;
        match sig {
            Signal::Kill | Signal::Terminate => self.stop().await,
            other => Err(LauncherError::Unsupported(format!(
                "{} jobs cannot receive {other}",
                self.inner.settings.system
            ))),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use kluster_core::LauncherConfig;

    use super::*;
    use crate::state::LaunchState;

    fn settings(dir: &Path, system: BatchSystem, config: BatchConfig) -> BatchSettings {
        BatchSettings {
            system,
            role: Role::Engine,
            config,
            identity: ClusterIdentity::new(dir.join("profile"), ""),
            command: RoleCommand::from_config(Role::Engine, &LauncherConfig::default()),
            work_dir: dir.to_path_buf(),
        }
    }

    fn fake_commands(dir: &Path) -> BatchConfig {
        let log = dir.join("deleted.txt");
        BatchConfig {
            queue: Some("gpu".into()),
            submit_command: Some(vec![
                "sh".into(),
                "-c".into(),
                "echo \"Your job 4242 (\\\"x\\\") has been submitted\"".into(),
                "qsub".into(),
            ]),
            delete_command: Some(vec![
                "sh".into(),
                "-c".into(),
                format!("echo deleted \"$1\" > {}; echo deleted \"$1\"", log.display()),
                "qdel".into(),
            ]),
            ..BatchConfig::default()
        }
    }

    #[tokio::test]
    async fn submit_parses_job_id_and_stop_deletes_it() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = BatchLauncher::new(settings(dir.path(), BatchSystem::Sge, fake_commands(dir.path())));
        let started = launcher.start(3).await.unwrap();
        assert_eq!(started, StartData::JobId("4242".into()));
        assert_eq!(launcher.state(), LaunchState::Running);

        let script = std::fs::read_to_string(launcher.script_path()).unwrap();
        assert!(script.contains("#$ -t 1-3"));
        assert!(script.contains("#$ -q gpu"));
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(launcher.script_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);

        launcher.stop().await.unwrap();
        assert_eq!(launcher.state(), LaunchState::After);
        match launcher.stop_data() {
            Some(StopData::Job { job_id, output }) => {
                assert_eq!(job_id, "4242");
                assert_eq!(output, "deleted 4242");
            }
            other => panic!("unexpected stop data {other:?}"),
        }
        assert!(dir.path().join("deleted.txt").exists());
    }

    #[tokio::test]
    async fn hung_delete_command_still_stops() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fake_commands(dir.path());
        config.delete_command = Some(vec!["sleep".into(), "30".into()]);
        let launcher = BatchLauncher::new(settings(dir.path(), BatchSystem::Sge, config))
            .with_delete_timeout(Duration::from_millis(200));
        launcher.start(1).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), launcher.stop())
            .await
            .expect("stop should not wait for the hung delete")
            .unwrap();
        assert_eq!(launcher.state(), LaunchState::After);
        match launcher.stop_data() {
            Some(StopData::Job { job_id, output }) => {
                assert_eq!(job_id, "4242");
                assert!(output.contains("timed out"), "{output}");
            }
            other => panic!("unexpected stop data {other:?}"),
        }
    }

    #[tokio::test]
    async fn lsf_script_goes_to_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let copy = dir.path().join("stdin.sh");
        let config = BatchConfig {
            submit_command: Some(vec![
                "sh".into(),
                "-c".into(),
                format!("cat > {}; echo 'Job <77> is submitted to default queue <normal>.'", copy.display()),
            ]),
            ..BatchConfig::default()
        };
        let launcher = BatchLauncher::new(settings(dir.path(), BatchSystem::Lsf, config));
        assert_eq!(launcher.start(2).await.unwrap(), StartData::JobId("77".into()));
        let piped = std::fs::read_to_string(&copy).unwrap();
        assert!(piped.contains("#BSUB -J kluster-engine[1-2]"));
    }

    #[tokio::test]
    async fn failed_submit_moves_to_after() {
        let dir = tempfile::tempdir().unwrap();
        let config = BatchConfig {
            submit_command: Some(vec!["false".into()]),
            ..BatchConfig::default()
        };
        let launcher = BatchLauncher::new(settings(dir.path(), BatchSystem::Pbs, config));
        assert!(matches!(launcher.start(1).await, Err(LauncherError::Submit { .. })));
        assert_eq!(launcher.state(), LaunchState::After);
        assert!(matches!(launcher.stop_data(), Some(StopData::StartFailed { .. })));
    }

    #[tokio::test]
    async fn output_without_job_id_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = BatchConfig {
            submit_command: Some(vec!["echo".into(), "no id here".into()]),
            ..BatchConfig::default()
        };
        let launcher = BatchLauncher::new(settings(dir.path(), BatchSystem::Slurm, config));
        assert!(matches!(launcher.start(1).await, Err(LauncherError::JobIdParse(_))));
    }

    #[tokio::test]
    async fn interrupt_is_unsupported_for_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = BatchLauncher::new(settings(dir.path(), BatchSystem::Sge, fake_commands(dir.path())));
        launcher.start(1).await.unwrap();
        assert!(matches!(
            launcher.signal(Signal::Interrupt).await,
            Err(LauncherError::Unsupported(_))
        ));
        launcher.signal(Signal::Kill).await.unwrap();
        assert_eq!(launcher.state(), LaunchState::After);
    }

    #[test]
    fn custom_job_id_regex_wins() {
        let dir = tempfile::tempdir().unwrap();
        let config = BatchConfig {
            job_id_regexp: Some(r"[a-z]+\.\d+".into()),
            ..BatchConfig::default()
        };
        let launcher = BatchLauncher::new(settings(dir.path(), BatchSystem::Pbs, config));
        assert_eq!(launcher.parse_job_id("submitted head.123 ok").unwrap(), "head.123");
    }

    #[test]
    fn template_file_is_read_when_no_inline_template() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("engine.tpl");
        std::fs::write(&file, "#!/bin/bash\n#PBS -t 1-{{ n }}\nstart {{ n }}\n").unwrap();
        let config = BatchConfig {
            engine_template_file: Some(file),
            ..BatchConfig::default()
        };
        let launcher = BatchLauncher::new(settings(dir.path(), BatchSystem::Pbs, config));
        let (_, script) = launcher.write_script(5).unwrap();
        assert_eq!(script, "#!/bin/bash\n#PBS -t 1-5\nstart 5\n");
    }
}
