//! Sandbox container lifecycle via the Docker API.
//!
//! One container per sandbox, created from a fixed image with the gateway
//! control port mapped to the allocated host port and a fixed 2 GiB / 1 CPU
//! ceiling. The shared gateway secret, the pre-seeded device identity and
//! any provisioned API key travel in as environment variables.

use crate::error::{Error, Result};
use crate::identity::DeviceIdentity;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures_util::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use tracing::{info, warn};

/// Control port the gateway listens on inside the container.
pub const GATEWAY_INTERNAL_PORT: u16 = 18789;

const MEMORY_LIMIT_BYTES: i64 = 2048 * 1024 * 1024;
const NANO_CPUS: i64 = 1_000_000_000;
const STOP_GRACE_SECS: i64 = 5;

/// Observed container state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    /// Container process is running
    Running,
    /// Container exists but is not running
    Stopped,
    /// Container missing or inspection failed
    Unknown,
}

/// Starts, stops and inspects sandbox containers.
pub struct ContainerManager {
    docker: Docker,
    image: String,
    gateway_token: SecretString,
}

impl ContainerManager {
    /// Connect to the local Docker daemon.
    pub fn new(image: String, gateway_token: SecretString) -> Result<Self> {
        let docker = Docker::connect_with_socket_defaults()
            .map_err(|e| Error::ContainerUnavailable(e.to_string()))?;
        Ok(Self {
            docker,
            image,
            gateway_token,
        })
    }

    /// Create and start the container for a sandbox. Returns the container id.
    pub async fn start(
        &self,
        sandbox_id: &str,
        host_port: u16,
        device: Option<&DeviceIdentity>,
        provider_api_key: Option<&str>,
    ) -> Result<String> {
        let env = build_env(self.gateway_token.expose_secret(), device, provider_api_key);

        let port_key = format!("{}/tcp", GATEWAY_INTERNAL_PORT);
        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(port_key.clone(), HashMap::new());
        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            port_key,
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(host_port.to_string()),
            }]),
        );

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            memory: Some(MEMORY_LIMIT_BYTES),
            nano_cpus: Some(NANO_CPUS),
            ..Default::default()
        };

        let config = Config {
            image: Some(self.image.clone()),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: format!("warden-sandbox-{}", sandbox_id),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| Error::ContainerUnavailable(e.to_string()))?;

        self.docker
            .start_container::<String>(&created.id, None)
            .await
            .map_err(|e| Error::ContainerUnavailable(format!("failed to start container: {}", e)))?;

        info!(sandbox_id, container_id = %created.id, host_port, "Started sandbox container");
        Ok(created.id)
    }

    /// Graceful stop then forced removal. Already-stopped and already-gone
    /// containers count as success.
    pub async fn remove(&self, container_id: &str) -> Result<()> {
        match self
            .docker
            .stop_container(container_id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
        {
            Ok(()) => {}
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => {}
            Err(e) => {
                warn!(container_id, error = %e, "Container stop failed, removing anyway");
            }
        }

        match self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => {
                info!(container_id, "Removed sandbox container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(Error::ContainerUnavailable(e.to_string())),
        }
    }

    /// Current state; inspection failures map to `Unknown` rather than
    /// erroring.
    pub async fn status(&self, container_id: &str) -> ContainerStatus {
        match self.docker.inspect_container(container_id, None).await {
            Ok(info) => match info.state.and_then(|s| s.running) {
                Some(true) => ContainerStatus::Running,
                _ => ContainerStatus::Stopped,
            },
            Err(_) => ContainerStatus::Unknown,
        }
    }

    /// Run a shell command inside the container and capture combined output.
    pub async fn exec_capture(&self, container_id: &str, script: &str) -> Result<String> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(vec!["sh".to_string(), "-c".to_string(), script.to_string()]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Error::ContainerUnavailable(e.to_string()))?;

        let mut captured = String::new();
        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| Error::ContainerUnavailable(e.to_string()))?
        {
            while let Some(Ok(chunk)) = output.next().await {
                captured.push_str(&chunk.to_string());
            }
        }
        Ok(captured)
    }
}

/// Environment for a new sandbox container.
fn build_env(
    gateway_token: &str,
    device: Option<&DeviceIdentity>,
    provider_api_key: Option<&str>,
) -> Vec<String> {
    let mut env = vec![format!("AGENT_GATEWAY_TOKEN={}", gateway_token)];
    if let Some(key) = provider_api_key {
        env.push(format!("OPENROUTER_API_KEY={}", key));
    }
    if let Some(device) = device {
        env.push(format!("WARDEN_DEVICE_ID={}", device.device_id));
        env.push(format!("WARDEN_DEVICE_PUBKEY={}", device.public_key_b64url()));
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityStore;

    #[test]
    fn env_always_carries_the_gateway_token() {
        let env = build_env("secret", None, None);
        assert_eq!(env, vec!["AGENT_GATEWAY_TOKEN=secret".to_string()]);
    }

    #[test]
    fn env_includes_device_and_key_when_present() {
        let tmp = tempfile::tempdir().unwrap();
        let identity = IdentityStore::new(tmp.path()).get_or_create("sb").unwrap();

        let env = build_env("secret", Some(&identity), Some("or-key"));
        assert!(env.contains(&"OPENROUTER_API_KEY=or-key".to_string()));
        assert!(env.contains(&format!("WARDEN_DEVICE_ID={}", identity.device_id)));
        assert!(env
            .iter()
            .any(|e| e.starts_with("WARDEN_DEVICE_PUBKEY=")));
    }
}
