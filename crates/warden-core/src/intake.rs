//! Inbound message intake.
//!
//! The channel adapter hands every inbound user message to
//! [`Intake::handle_incoming`]: mark it read, resolve the user, make sure
//! their sandbox exists and is ready (provisioning on first contact, polling
//! while provisioning completes), then submit the turn to the per-user
//! queue. All failure paths end in a short notice to the user.

use crate::error::Result;
use crate::outbound::ChannelDelivery;
use crate::queue::{SandboxRef, TurnQueue, TurnRequest};
use crate::sandbox::SandboxManager;
use crate::store::{Sandbox, SandboxStatus, Store};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

const READY_POLL_INTERVAL: Duration = Duration::from_secs(2);
const READY_POLL_DEADLINE: Duration = Duration::from_secs(90);

enum ReadyOutcome {
    Ready(Sandbox),
    Failed(String),
    TimedOut,
    Missing,
}

struct IntakeInner {
    store: Store,
    sandboxes: SandboxManager,
    queue: TurnQueue,
    delivery: Arc<dyn ChannelDelivery>,
    poll_interval: Duration,
    poll_deadline: Duration,
}

/// Front door for inbound user messages.
#[derive(Clone)]
pub struct Intake {
    inner: Arc<IntakeInner>,
}

impl Intake {
    /// Intake over the shared store, orchestrator, queue and channel adapter.
    pub fn new(
        store: Store,
        sandboxes: SandboxManager,
        queue: TurnQueue,
        delivery: Arc<dyn ChannelDelivery>,
    ) -> Self {
        Self {
            inner: Arc::new(IntakeInner {
                store,
                sandboxes,
                queue,
                delivery,
                poll_interval: READY_POLL_INTERVAL,
                poll_deadline: READY_POLL_DEADLINE,
            }),
        }
    }

    /// Handle one inbound message end to end. Never returns an error to the
    /// adapter; every failure becomes a user notice.
    pub async fn handle_incoming(&self, phone: &str, text: &str, external_message_id: &str) {
        if let Err(e) = self.handle_inner(phone, text, external_message_id).await {
            error!(phone, error = %e, "Inbound message handling failed");
            self.notify(phone, &e.user_notice()).await;
        }
    }

    async fn handle_inner(&self, phone: &str, text: &str, external_message_id: &str) -> Result<()> {
        if let Err(e) = self.inner.delivery.mark_read(external_message_id).await {
            warn!(phone, error = %e, "Could not mark message as read");
        }

        let user = self.inner.store.find_or_create_user(phone).await?;

        let mut sandbox = match self.inner.store.sandbox_by_user(&user.id).await? {
            Some(sandbox) => sandbox,
            None => {
                self.notify(
                    phone,
                    "Setting up your environment... This may take a minute.",
                )
                .await;
                self.inner.sandboxes.provision(&user.id).await?.sandbox
            }
        };

        if sandbox.status == SandboxStatus::Provisioning {
            let _ = self
                .inner
                .delivery
                .typing(phone, external_message_id)
                .await;
            sandbox = match self.wait_until_ready(&user.id).await? {
                ReadyOutcome::Ready(sandbox) => sandbox,
                ReadyOutcome::Failed(message) => {
                    self.notify(
                        phone,
                        &format!("Setup failed: {}. Please try again later.", message),
                    )
                    .await;
                    return Ok(());
                }
                ReadyOutcome::TimedOut => {
                    self.notify(phone, "Setup is taking too long. Please try again later.")
                        .await;
                    return Ok(());
                }
                ReadyOutcome::Missing => {
                    self.notify(
                        phone,
                        "Something went wrong setting up your environment. Please try again.",
                    )
                    .await;
                    return Ok(());
                }
            };
        }

        match sandbox.status {
            SandboxStatus::Ready => {}
            SandboxStatus::Error => {
                let message = sandbox
                    .error_message
                    .unwrap_or_else(|| "unknown".to_string());
                self.notify(
                    phone,
                    &format!(
                        "Your environment has an error: {}. Please try again later.",
                        message
                    ),
                )
                .await;
                return Ok(());
            }
            SandboxStatus::Provisioning => unreachable!("handled by the ready wait"),
        }

        self.inner
            .queue
            .submit(
                &user.id,
                SandboxRef {
                    sandbox_id: sandbox.id,
                    port: sandbox.port,
                    container_id: sandbox.container_id,
                    phone: phone.to_string(),
                },
                TurnRequest {
                    text: text.to_string(),
                    external_message_id: external_message_id.to_string(),
                },
            )
            .await;
        Ok(())
    }

    /// Poll the sandbox record until provisioning resolves one way or the
    /// other.
    async fn wait_until_ready(&self, user_id: &str) -> Result<ReadyOutcome> {
        let start = tokio::time::Instant::now();
        while start.elapsed() < self.inner.poll_deadline {
            tokio::time::sleep(self.inner.poll_interval).await;
            let Some(sandbox) = self.inner.store.sandbox_by_user(user_id).await? else {
                return Ok(ReadyOutcome::Missing);
            };
            match sandbox.status {
                SandboxStatus::Ready => return Ok(ReadyOutcome::Ready(sandbox)),
                SandboxStatus::Error => {
                    return Ok(ReadyOutcome::Failed(
                        sandbox
                            .error_message
                            .unwrap_or_else(|| "unknown error".to_string()),
                    ))
                }
                SandboxStatus::Provisioning => {}
            }
        }
        Ok(ReadyOutcome::TimedOut)
    }

    async fn notify(&self, phone: &str, text: &str) {
        if let Err(e) = self.inner.delivery.send_text(phone, text).await {
            error!(phone, error = %e, "Could not deliver notice");
        }
    }
}
