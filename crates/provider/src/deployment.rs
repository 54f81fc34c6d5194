//! # Direct Deployments
//!
//! Marketplace-initiated deployments ("dapps") bypass the order/agreement
//! machinery: the chain names a target peer and a start descriptor, and the
//! target starts it at once.
//!
//! ```text
//! DeploymentRequested ──► DeploymentSpec ──► DeploymentController::start()
//!                                                 │
//!                                                 ▼
//!                                  dyn DeploymentRunner (DockerRunner)
//!                                      ├─ SingleContainer: docker run --name <uuid> <command…>
//!                                      └─ ComposeBundle:   fetch <cid> ─► docker compose -f <file> up -d
//! ```
//!
//! The controller keeps started deployments by dapp index so a later
//! `DeploymentStopped` event can stop them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

use crate::bundle_fetcher::BundleFetcher;
use crate::events::DeploymentRequested;

// ════════════════════════════════════════════════════════════════════════════════
// TYPES
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMethod {
    /// `command` holds `docker run` arguments.
    SingleContainer,
    /// `command` holds the content id of a compose file.
    ComposeBundle,
}

impl TryFrom<u8> for StartMethod {
    type Error = DeploymentError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(StartMethod::SingleContainer),
            2 => Ok(StartMethod::ComposeBundle),
            other => Err(DeploymentError::UnknownStartMethod(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentSpec {
    pub peer_id: String,
    pub cpu: u8,
    pub memory: u8,
    pub start_method: StartMethod,
    pub command: String,
    pub dapp_index: u64,
}

impl DeploymentSpec {
    pub fn from_event(e: &DeploymentRequested) -> Result<Self, DeploymentError> {
        Ok(Self {
            peer_id: e.peer_id.clone(),
            cpu: e.cpu,
            memory: e.memory,
            start_method: StartMethod::try_from(e.start_method)?,
            command: e.command.clone(),
            dapp_index: e.dapp_index,
        })
    }
}

/// A deployment with its local container name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub name: String,
    pub spec: DeploymentSpec,
}

impl Deployment {
    pub fn new(spec: DeploymentSpec) -> Self {
        Self {
            name: Uuid::new_v4().to_string(),
            spec,
        }
    }
}

#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error("unknown start method: {0}")]
    UnknownStartMethod(u8),

    #[error("empty deployment command")]
    EmptyCommand,

    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("bundle fetch failed: {0}")]
    Bundle(#[from] anyhow::Error),

    #[error("no deployment with dapp index {0}")]
    NotFound(u64),
}

// ════════════════════════════════════════════════════════════════════════════════
// RUNNER TRAIT
// ════════════════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait DeploymentRunner: Send + Sync {
    async fn start(&self, deployment: &Deployment) -> Result<(), DeploymentError>;

    async fn stop(&self, deployment: &Deployment) -> Result<(), DeploymentError>;

    async fn restart(&self, deployment: &Deployment) -> Result<(), DeploymentError>;

    /// Apply `new` to a running deployment.
    async fn update(
        &self,
        deployment: &Deployment,
        new: &DeploymentSpec,
    ) -> Result<(), DeploymentError>;
}

// ════════════════════════════════════════════════════════════════════════════════
// DOCKER RUNNER
// ════════════════════════════════════════════════════════════════════════════════

/// Runs deployments through the docker CLI.
pub struct DockerRunner {
    docker_bin: String,
    bundle_dir: PathBuf,
    fetcher: Arc<dyn BundleFetcher>,
}

impl DockerRunner {
    pub fn new(bundle_dir: impl Into<PathBuf>, fetcher: Arc<dyn BundleFetcher>) -> Self {
        Self::with_binary("docker", bundle_dir, fetcher)
    }

    pub fn with_binary(
        docker_bin: impl Into<String>,
        bundle_dir: impl Into<PathBuf>,
        fetcher: Arc<dyn BundleFetcher>,
    ) -> Self {
        Self {
            docker_bin: docker_bin.into(),
            bundle_dir: bundle_dir.into(),
            fetcher,
        }
    }

    async fn exec(&self, args: &[String]) -> Result<(), DeploymentError> {
        let command = format!("{} {}", self.docker_bin, args.join(" "));
        debug!(%command, "running docker command");

        let output = Command::new(&self.docker_bin)
            .args(args)
            .output()
            .await
            .map_err(|source| DeploymentError::Spawn {
                command: command.clone(),
                source,
            })?;
        debug!(stdout = %String::from_utf8_lossy(&output.stdout), "command output");

        if !output.status.success() {
            return Err(DeploymentError::CommandFailed {
                command,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        info!(%command, "docker command succeeded");
        Ok(())
    }

    async fn compose(&self, cid: &str, action: &[&str]) -> Result<(), DeploymentError> {
        let file = self.fetcher.fetch(cid, &self.bundle_dir).await?;
        self.exec(&compose_args(&file, action)).await
    }
}

fn split_command(command: &str) -> Result<Vec<String>, DeploymentError> {
    let parts: Vec<String> = command.split_whitespace().map(str::to_string).collect();
    if parts.is_empty() {
        return Err(DeploymentError::EmptyCommand);
    }
    Ok(parts)
}

fn run_args(deployment: &Deployment) -> Result<Vec<String>, DeploymentError> {
    let mut args = vec!["run".to_string(), "--name".to_string(), deployment.name.clone()];
    args.extend(split_command(&deployment.spec.command)?);
    Ok(args)
}

fn compose_args(file: &Path, action: &[&str]) -> Vec<String> {
    let mut args = vec![
        "compose".to_string(),
        "-f".to_string(),
        file.display().to_string(),
    ];
    args.extend(action.iter().map(|a| a.to_string()));
    args
}

#[async_trait]
impl DeploymentRunner for DockerRunner {
    async fn start(&self, deployment: &Deployment) -> Result<(), DeploymentError> {
        match deployment.spec.start_method {
            StartMethod::SingleContainer => self.exec(&run_args(deployment)?).await,
            StartMethod::ComposeBundle => {
                self.compose(&deployment.spec.command, &["up", "-d"]).await
            }
        }
    }

    async fn stop(&self, deployment: &Deployment) -> Result<(), DeploymentError> {
        match deployment.spec.start_method {
            StartMethod::SingleContainer => {
                self.exec(&["stop".to_string(), deployment.name.clone()]).await
            }
            StartMethod::ComposeBundle => self.compose(&deployment.spec.command, &["down"]).await,
        }
    }

    async fn restart(&self, deployment: &Deployment) -> Result<(), DeploymentError> {
        match deployment.spec.start_method {
            StartMethod::SingleContainer => {
                self.exec(&["restart".to_string(), deployment.name.clone()]).await
            }
            StartMethod::ComposeBundle => {
                self.compose(&deployment.spec.command, &["restart"]).await
            }
        }
    }

    async fn update(
        &self,
        deployment: &Deployment,
        new: &DeploymentSpec,
    ) -> Result<(), DeploymentError> {
        match deployment.spec.start_method {
            StartMethod::SingleContainer => {
                let mut args = vec!["update".to_string()];
                args.extend(split_command(&new.command)?);
                args.push(deployment.name.clone());
                self.exec(&args).await
            }
            StartMethod::ComposeBundle => {
                self.compose(&new.command, &["pull"]).await?;
                self.compose(&new.command, &["up", "-d"]).await
            }
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// CONTROLLER
// ════════════════════════════════════════════════════════════════════════════════

/// Tracks started deployments by dapp index.
pub struct DeploymentController {
    runner: Arc<dyn DeploymentRunner>,
    active: Mutex<HashMap<u64, Deployment>>,
}

impl DeploymentController {
    pub fn new(runner: Arc<dyn DeploymentRunner>) -> Self {
        Self {
            runner,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Start a deployment and remember it. Returns the local name.
    pub async fn start(&self, spec: DeploymentSpec) -> Result<String, DeploymentError> {
        let deployment = Deployment::new(spec);
        self.runner.start(&deployment).await?;
        let name = deployment.name.clone();
        info!(dapp_index = deployment.spec.dapp_index, %name, "deployment started");
        self.active.lock().insert(deployment.spec.dapp_index, deployment);
        Ok(name)
    }

    pub async fn stop(&self, dapp_index: u64) -> Result<(), DeploymentError> {
        let deployment = self
            .get(dapp_index)
            .ok_or(DeploymentError::NotFound(dapp_index))?;
        self.runner.stop(&deployment).await?;
        self.active.lock().remove(&dapp_index);
        info!(dapp_index, name = %deployment.name, "deployment stopped");
        Ok(())
    }

    pub async fn restart(&self, dapp_index: u64) -> Result<(), DeploymentError> {
        let deployment = self
            .get(dapp_index)
            .ok_or(DeploymentError::NotFound(dapp_index))?;
        self.runner.restart(&deployment).await
    }

    pub async fn update(&self, dapp_index: u64, new: DeploymentSpec) -> Result<(), DeploymentError> {
        let deployment = self
            .get(dapp_index)
            .ok_or(DeploymentError::NotFound(dapp_index))?;
        self.runner.update(&deployment, &new).await?;
        if let Some(d) = self.active.lock().get_mut(&dapp_index) {
            d.spec = new;
        }
        Ok(())
    }

    pub fn get(&self, dapp_index: u64) -> Option<Deployment> {
        self.active.lock().get(&dapp_index).cloned()
    }

    pub fn active_indices(&self) -> Vec<u64> {
        let mut v: Vec<u64> = self.active.lock().keys().copied().collect();
        v.sort_unstable();
        v
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// MOCK RUNNER
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerCall {
    Start(Deployment),
    Stop(String),
    Restart(String),
    Update(String, DeploymentSpec),
}

/// Records calls; `fail_next_start` makes the next start fail.
#[derive(Default)]
pub struct MockDeploymentRunner {
    calls: Mutex<Vec<RunnerCall>>,
    fail_start: Mutex<bool>,
}

impl MockDeploymentRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_start(&self) {
        *self.fail_start.lock() = true;
    }

    pub fn calls(&self) -> Vec<RunnerCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl DeploymentRunner for MockDeploymentRunner {
    async fn start(&self, deployment: &Deployment) -> Result<(), DeploymentError> {
        if std::mem::take(&mut *self.fail_start.lock()) {
            return Err(DeploymentError::CommandFailed {
                command: "docker run".to_string(),
                code: Some(125),
                stderr: "scripted failure".to_string(),
            });
        }
        self.calls.lock().push(RunnerCall::Start(deployment.clone()));
        Ok(())
    }

    async fn stop(&self, deployment: &Deployment) -> Result<(), DeploymentError> {
        self.calls.lock().push(RunnerCall::Stop(deployment.name.clone()));
        Ok(())
    }

    async fn restart(&self, deployment: &Deployment) -> Result<(), DeploymentError> {
        self.calls.lock().push(RunnerCall::Restart(deployment.name.clone()));
        Ok(())
    }

    async fn update(
        &self,
        deployment: &Deployment,
        new: &DeploymentSpec,
    ) -> Result<(), DeploymentError> {
        self.calls
            .lock()
            .push(RunnerCall::Update(deployment.name.clone(), new.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticFetcher;

    #[async_trait]
    impl BundleFetcher for StaticFetcher {
        async fn fetch(&self, cid: &str, out_dir: &Path) -> anyhow::Result<PathBuf> {
            let p = out_dir.join(cid);
            tokio::fs::create_dir_all(out_dir).await?;
            tokio::fs::write(&p, b"services: {}\n").await?;
            Ok(p)
        }
    }

    fn spec(method: StartMethod, command: &str) -> DeploymentSpec {
        DeploymentSpec {
            peer_id: "peer-a".to_string(),
            cpu: 1,
            memory: 2,
            start_method: method,
            command: command.to_string(),
            dapp_index: 11,
        }
    }

    #[test]
    fn test_start_method_from_u8() {
        assert_eq!(StartMethod::try_from(1).unwrap(), StartMethod::SingleContainer);
        assert_eq!(StartMethod::try_from(2).unwrap(), StartMethod::ComposeBundle);
        assert!(matches!(
            StartMethod::try_from(9),
            Err(DeploymentError::UnknownStartMethod(9))
        ));
    }

    #[test]
    fn test_run_args() {
        let d = Deployment::new(spec(StartMethod::SingleContainer, "-d  -p 80:80 nginx"));
        let args = run_args(&d).unwrap();
        assert_eq!(args[..3], ["run".to_string(), "--name".to_string(), d.name.clone()]);
        assert_eq!(args[3..], ["-d", "-p", "80:80", "nginx"].map(String::from));

        let empty = Deployment::new(spec(StartMethod::SingleContainer, "   "));
        assert!(matches!(run_args(&empty), Err(DeploymentError::EmptyCommand)));
    }

    #[test]
    fn test_compose_args() {
        let args = compose_args(Path::new("/tmp/bundles/QmX"), &["up", "-d"]);
        assert_eq!(args, ["compose", "-f", "/tmp/bundles/QmX", "up", "-d"].map(String::from));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_docker_runner_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let ok = DockerRunner::with_binary("true", dir.path(), Arc::new(StaticFetcher));
        let d = Deployment::new(spec(StartMethod::SingleContainer, "nginx"));
        ok.start(&d).await.unwrap();
        ok.stop(&d).await.unwrap();

        let failing = DockerRunner::with_binary("false", dir.path(), Arc::new(StaticFetcher));
        assert!(matches!(
            failing.start(&d).await,
            Err(DeploymentError::CommandFailed { code: Some(1), .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_compose_fetches_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let runner = DockerRunner::with_binary("true", dir.path(), Arc::new(StaticFetcher));
        let d = Deployment::new(spec(StartMethod::ComposeBundle, "QmCompose"));
        runner.start(&d).await.unwrap();
        assert!(dir.path().join("QmCompose").exists());
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = DockerRunner::with_binary(
            "/nonexistent/docker-binary",
            dir.path(),
            Arc::new(StaticFetcher),
        );
        let d = Deployment::new(spec(StartMethod::SingleContainer, "nginx"));
        assert!(matches!(runner.start(&d).await, Err(DeploymentError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_controller_tracks_by_dapp_index() {
        let runner = Arc::new(MockDeploymentRunner::new());
        let controller = DeploymentController::new(runner.clone());

        let name = controller
            .start(spec(StartMethod::SingleContainer, "nginx"))
            .await
            .unwrap();
        assert_eq!(controller.active_indices(), vec![11]);
        assert_eq!(controller.get(11).unwrap().name, name);

        controller.restart(11).await.unwrap();
        controller
            .update(11, spec(StartMethod::SingleContainer, "--cpus 2"))
            .await
            .unwrap();
        assert_eq!(controller.get(11).unwrap().spec.command, "--cpus 2");

        controller.stop(11).await.unwrap();
        assert!(controller.active_indices().is_empty());
        assert!(matches!(controller.stop(11).await, Err(DeploymentError::NotFound(11))));
        assert_eq!(runner.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_failed_start_is_not_tracked() {
        let runner = Arc::new(MockDeploymentRunner::new());
        runner.fail_next_start();
        let controller = DeploymentController::new(runner);
        assert!(controller
            .start(spec(StartMethod::SingleContainer, "nginx"))
            .await
            .is_err());
        assert!(controller.active_indices().is_empty());
    }
}
