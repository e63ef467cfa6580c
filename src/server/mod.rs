//! Server wiring and the thin HTTP surface.
//!
//! Routes are deliberately minimal: health, sandbox status, teardown, and
//! inbound-message intake. Everything interesting happens in warden-core.

pub mod config;
mod delivery;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use config::AppConfig;
use delivery::WebhookDelivery;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use warden_core::container::ContainerManager;
use warden_core::credentials::CredentialProvisioner;
use warden_core::gateway::ConnectionRegistry;
use warden_core::identity::IdentityStore;
use warden_core::intake::Intake;
use warden_core::outbound::{ChannelDelivery, OutboundRouter};
use warden_core::queue::TurnQueue;
use warden_core::sandbox::SandboxManager;
use warden_core::store::Store;

#[derive(Clone)]
struct AppState {
    sandboxes: SandboxManager,
    intake: Intake,
}

/// Build the full component graph and serve until shutdown.
pub async fn run(config: AppConfig) -> Result<()> {
    let core = config.core_config()?;

    let store = Store::connect(&config.database.url).await?;
    let delivery: Arc<dyn ChannelDelivery> =
        Arc::new(WebhookDelivery::new(config.channel.outbound_url.clone()));

    let containers = Arc::new(ContainerManager::new(
        core.sandbox_image.clone(),
        core.gateway_token.clone(),
    )?);
    let connections = ConnectionRegistry::new(
        core.clone(),
        IdentityStore::new(&core.data_dir),
        containers.clone(),
    );
    connections.spawn_idle_sweep();

    let credentials = AppConfig::provisioning_key()
        .map(|key| Arc::new(CredentialProvisioner::new(key)));
    if credentials.is_none() {
        info!("No provisioning key configured; sandboxes run without provider keys");
    }

    let outbound = Arc::new(OutboundRouter::new(store.clone(), delivery.clone()));
    let sandboxes = SandboxManager::new(
        core.clone(),
        store.clone(),
        IdentityStore::new(&core.data_dir),
        containers,
        connections.clone(),
        credentials,
        outbound,
    );
    let queue = TurnQueue::new(
        Arc::new(connections.clone()),
        delivery.clone(),
        store.clone(),
        core.turn_timeout,
        core.queue_depth,
    );
    let intake = Intake::new(store, sandboxes.clone(), queue, delivery);

    let state = AppState { sandboxes, intake };
    let app = router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "Warden listening");
    axum::serve(listener, app).await?;

    connections.shutdown().await;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/messages", post(inbound_message))
        .route(
            "/api/sandboxes/:user_id",
            get(sandbox_status).delete(sandbox_teardown),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

#[derive(Deserialize)]
struct InboundMessage {
    phone: String,
    text: String,
    #[serde(default)]
    message_id: String,
}

/// Accept the message and process it off the request path; the channel
/// adapter only needs to know we have it.
async fn inbound_message(
    State(state): State<AppState>,
    Json(body): Json<InboundMessage>,
) -> StatusCode {
    tokio::spawn(async move {
        state
            .intake
            .handle_incoming(&body.phone, &body.text, &body.message_id)
            .await;
    });
    StatusCode::ACCEPTED
}

async fn sandbox_status(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    match state.sandboxes.status(&user_id).await {
        Ok(Some(sandbox)) => Ok(Json(json!({ "sandbox": sandbox }))),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!(user_id, error = %e, "Status lookup failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn sandbox_teardown(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> StatusCode {
    match state.sandboxes.teardown(&user_id).await {
        Ok(true) => StatusCode::NO_CONTENT,
        Ok(false) => StatusCode::NOT_FOUND,
        Err(e) => {
            error!(user_id, error = %e, "Teardown failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
