use std::{process::Output, time::Duration};

use async_trait::async_trait;
use tokio::process::Command;

use super::{spec::SandboxSpec, SandboxError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    /// The container did not exist; teardown is still a success.
    AlreadyGone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Exited,
    Missing,
}

/// Container engine boundary. Production shells out to `docker`; tests use
/// an in-memory fake.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Starts the container and returns its id.
    async fn run(&self, spec: &SandboxSpec) -> Result<String, SandboxError>;

    async fn stop(&self, container: &str, grace: Duration) -> Result<StopOutcome, SandboxError>;

    async fn inspect(&self, container: &str) -> Result<ContainerState, SandboxError>;
}

#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

fn is_missing_container(stderr: &str) -> bool {
    stderr.contains("No such container") || stderr.contains("No such object")
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn exec(&self, args: &[String]) -> Result<Output, SandboxError> {
        self.exec_with_env(args, &[]).await
    }

    async fn exec_with_env(&self, args: &[String], env: &[(String, String)]) -> Result<Output, SandboxError> {
        Command::new(&self.binary)
            .args(args)
            .envs(env.iter().map(|(key, value)| (key.as_str(), value.as_str())))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| SandboxError::Runtime(format!("failed to execute {}: {err}", self.binary)))
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn run(&self, spec: &SandboxSpec) -> Result<String, SandboxError> {
        let output = self.exec_with_env(&spec.docker_run_args(), &spec.env).await?;
        if !output.status.success() {
            return Err(SandboxError::StartFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if container_id.is_empty() {
            return Err(SandboxError::StartFailed(
                "docker run returned no container id".to_string(),
            ));
        }
        Ok(container_id)
    }

    async fn stop(&self, container: &str, grace: Duration) -> Result<StopOutcome, SandboxError> {
        let stop = self
            .exec(&[
                "stop".to_string(),
                "-t".to_string(),
                grace.as_secs().to_string(),
                container.to_string(),
            ])
            .await?;
        if !stop.status.success() {
            let stderr = String::from_utf8_lossy(&stop.stderr);
            if is_missing_container(&stderr) {
                return Ok(StopOutcome::AlreadyGone);
            }
            tracing::warn!(container, error = %stderr.trim(), "docker stop failed, forcing removal");
        }

        let remove = self
            .exec(&["rm".to_string(), "-f".to_string(), container.to_string()])
            .await?;
        if !remove.status.success() {
            let stderr = String::from_utf8_lossy(&remove.stderr);
            if is_missing_container(&stderr) {
                return Ok(StopOutcome::AlreadyGone);
            }
            return Err(SandboxError::Runtime(stderr.trim().to_string()));
        }

        Ok(StopOutcome::Stopped)
    }

    async fn inspect(&self, container: &str) -> Result<ContainerState, SandboxError> {
        let output = self
            .exec(&[
                "inspect".to_string(),
                "--format".to_string(),
                "{{.State.Running}}".to_string(),
                container.to_string(),
            ])
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing_container(&stderr) {
                return Ok(ContainerState::Missing);
            }
            return Err(SandboxError::Runtime(stderr.trim().to_string()));
        }

        match String::from_utf8_lossy(&output.stdout).trim() {
            "true" => Ok(ContainerState::Running),
            _ => Ok(ContainerState::Exited),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_missing_container_messages() {
        assert!(is_missing_container(
            "Error response from daemon: No such container: kx-docs-1234abcd"
        ));
        assert!(!is_missing_container("permission denied"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_runtime_error() {
        let runtime = DockerCli::new("/nonexistent/docker-binary");
        let error = runtime
            .inspect("kx-docs-1234abcd")
            .await
            .expect_err("binary does not exist");
        assert!(matches!(error, SandboxError::Runtime(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_hands_env_values_to_the_child_process() {
        use std::os::unix::fs::PermissionsExt;

        use serde_json::json;

        use crate::{config::SandboxSettings, exchange::Exchange};

        let dir = tempfile::tempdir().expect("tempdir");
        let binary = dir.path().join("docker");
        std::fs::write(&binary, "#!/bin/sh\nprintf '%s' \"$EXCHANGE_CONFIG\"\n").expect("write script");
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).expect("chmod");

        let exchange = Exchange::new("code", "github", json!({ "token": "ghp_secret_value" }));
        let spec = SandboxSpec::for_exchange(&exchange, 9106, &SandboxSettings::default(), "");
        let runtime = DockerCli::new(binary.to_string_lossy());

        let container = runtime.run(&spec).await.expect("run");
        assert_eq!(container, r#"{"token":"ghp_secret_value"}"#);
    }
}
