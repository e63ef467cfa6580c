//! Sandbox lifecycle orchestration.
//!
//! `provision` writes the `provisioning` record synchronously and returns;
//! a background task then provisions the provider key, the device identity
//! and the container, waits for the gateway port, opens the persistent
//! connection and flips the record to `ready` — or to `error` with the
//! captured message. `teardown` best-effort-reverses all of it.

use crate::config::CoreConfig;
use crate::container::ContainerManager;
use crate::credentials::CredentialProvisioner;
use crate::error::{Error, Result};
use crate::gateway::ConnectionRegistry;
use crate::identity::IdentityStore;
use crate::outbound::OutboundRoute;
use crate::ports::PortAllocator;
use crate::store::{Sandbox, Store};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{error, info, warn};

const GATEWAY_PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const GATEWAY_PROBE_BACKOFF: Duration = Duration::from_secs(1);

/// Result of a provision call.
pub struct Provisioned {
    /// The user's sandbox record (freshly created or pre-existing)
    pub sandbox: Sandbox,
    /// Whether this call created it
    pub created: bool,
}

struct ManagerInner {
    config: CoreConfig,
    store: Store,
    identity: IdentityStore,
    ports: PortAllocator,
    containers: Arc<ContainerManager>,
    connections: ConnectionRegistry,
    credentials: Option<Arc<CredentialProvisioner>>,
    outbound: Arc<dyn OutboundRoute>,
}

/// Drives sandboxes through `provisioning → ready | error` and back down.
#[derive(Clone)]
pub struct SandboxManager {
    inner: Arc<ManagerInner>,
}

impl SandboxManager {
    /// Orchestrator over the shared components.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CoreConfig,
        store: Store,
        identity: IdentityStore,
        containers: Arc<ContainerManager>,
        connections: ConnectionRegistry,
        credentials: Option<Arc<CredentialProvisioner>>,
        outbound: Arc<dyn OutboundRoute>,
    ) -> Self {
        let ports = PortAllocator::new(config.port_range_start, config.port_range_end);
        Self {
            inner: Arc::new(ManagerInner {
                config,
                store,
                identity,
                ports,
                containers,
                connections,
                credentials,
                outbound,
            }),
        }
    }

    /// Ensure the user has a sandbox. Idempotent: an existing record is
    /// returned as-is and nothing new is allocated. A fresh record comes
    /// back in `provisioning` state while the heavy lifting continues in
    /// the background.
    pub async fn provision(&self, user_id: &str) -> Result<Provisioned> {
        if let Some(existing) = self.inner.store.sandbox_by_user(user_id).await? {
            return Ok(Provisioned {
                sandbox: existing,
                created: false,
            });
        }

        let used = self.inner.store.used_ports().await?;
        let port = self.inner.ports.allocate(&used).await?;
        let sandbox = self.inner.store.create_sandbox(user_id, port).await?;
        info!(user_id, sandbox_id = %sandbox.id, port, "Provisioning sandbox");

        let inner = self.inner.clone();
        let record = sandbox.clone();
        tokio::spawn(async move {
            if let Err(e) = provision_background(&inner, &record).await {
                error!(sandbox_id = %record.id, error = %e, "Sandbox provisioning failed");
                if let Err(db) = inner.store.mark_error(&record.id, &e.to_string()).await {
                    error!(sandbox_id = %record.id, error = %db, "Could not record provisioning failure");
                }
            }
        });

        Ok(Provisioned {
            sandbox,
            created: true,
        })
    }

    /// The user's sandbox record, if any.
    pub async fn status(&self, user_id: &str) -> Result<Option<Sandbox>> {
        self.inner.store.sandbox_by_user(user_id).await
    }

    /// Best-effort reverse of provisioning: revoke the provider key, close
    /// the connection, remove the container, drop the device key, delete
    /// the record. Returns `false` when the user has no sandbox.
    pub async fn teardown(&self, user_id: &str) -> Result<bool> {
        let Some(sandbox) = self.inner.store.sandbox_by_user(user_id).await? else {
            return Ok(false);
        };

        if let (Some(provisioner), Some(handle)) =
            (&self.inner.credentials, &sandbox.external_key_handle)
        {
            match provisioner.revoke(handle).await {
                Ok(()) => info!(sandbox_id = %sandbox.id, "Revoked provider key"),
                Err(e) => warn!(sandbox_id = %sandbox.id, error = %e, "Provider key revocation failed"),
            }
        }

        self.inner.connections.purge(&sandbox.id).await;

        if let Some(container_id) = &sandbox.container_id {
            if let Err(e) = self.inner.containers.remove(container_id).await {
                warn!(sandbox_id = %sandbox.id, error = %e, "Container removal failed");
            }
        }

        self.inner.identity.remove(&sandbox.id);
        self.inner.store.delete_sandbox(&sandbox.id).await?;
        info!(sandbox_id = %sandbox.id, user_id, "Sandbox torn down");
        Ok(true)
    }
}

async fn provision_background(inner: &Arc<ManagerInner>, sandbox: &Sandbox) -> Result<()> {
    // Per-sandbox provider key. Failure is "feature unavailable", not fatal.
    let mut provider_key = None;
    if let Some(provisioner) = &inner.credentials {
        let name = format!("warden-sandbox-{}", sandbox.id);
        match provisioner.issue(&name, 20, "monthly").await {
            Ok(key) => {
                inner.store.set_key_handle(&sandbox.id, &key.handle).await?;
                provider_key = Some(key.key);
            }
            Err(e) => {
                warn!(sandbox_id = %sandbox.id, error = %e, "Continuing without a provider key")
            }
        }
    }

    // Identity is generated before the container starts so the gateway can
    // pre-trust it from its environment.
    let identity = inner.identity.get_or_create(&sandbox.id)?;
    let container_id = inner
        .containers
        .start(
            &sandbox.id,
            sandbox.port,
            Some(&identity),
            provider_key.as_deref(),
        )
        .await?;
    inner.store.set_container(&sandbox.id, &container_id).await?;

    wait_for_gateway(sandbox.port, inner.config.gateway_ready_timeout).await?;

    // Route agent-initiated messages for this sandbox before the first
    // connection exists, so nothing is dropped on a later reconnect either.
    inner
        .connections
        .set_outbound(&sandbox.id, inner.outbound.clone());
    match inner
        .connections
        .get_or_create(&sandbox.id, sandbox.port, Some(&container_id))
        .await
    {
        Ok(_) => info!(sandbox_id = %sandbox.id, "Persistent gateway connection established"),
        Err(e) => {
            // The first turn will retry; readiness does not depend on it.
            warn!(sandbox_id = %sandbox.id, error = %e, "Deferred gateway connection to first turn")
        }
    }

    inner.store.mark_ready(&sandbox.id).await?;
    info!(sandbox_id = %sandbox.id, port = sandbox.port, "Sandbox ready");
    Ok(())
}

/// Poll the mapped host port until the gateway accepts TCP connections.
async fn wait_for_gateway(port: u16, deadline: Duration) -> Result<()> {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        match tokio::time::timeout(GATEWAY_PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port)))
            .await
        {
            Ok(Ok(_stream)) => return Ok(()),
            _ => tokio::time::sleep(GATEWAY_PROBE_BACKOFF).await,
        }
    }
    Err(Error::ContainerUnavailable(format!(
        "gateway on port {} did not become ready within {:?}",
        port, deadline
    )))
}
