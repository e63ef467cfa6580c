//! Core runtime configuration.
//!
//! Everything the components need at construction time: the shared gateway
//! secret, the sandbox image, the host port range, and the various deadlines.
//! The server binary builds this from its TOML/env configuration.

use secrecy::SecretString;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the sandbox control plane.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Directory for durable control-plane state (device keys live in
    /// `<data_dir>/device-keys`).
    pub data_dir: PathBuf,
    /// Shared secret injected into every sandbox and presented on connect.
    pub gateway_token: SecretString,
    /// Container image for new sandboxes.
    pub sandbox_image: String,
    /// Inclusive host port range scanned for new sandboxes.
    pub port_range_start: u16,
    /// See `port_range_start`.
    pub port_range_end: u16,
    /// Deadline for the full connect handshake.
    pub connect_timeout: Duration,
    /// How long provisioning waits for the gateway port to accept connections.
    pub gateway_ready_timeout: Duration,
    /// Deadline for one conversational turn (terminal chat event).
    pub turn_timeout: Duration,
    /// Connections idle longer than this are reclaimed by the sweep.
    pub idle_timeout: Duration,
    /// Maximum queued turns per user beyond the one in flight.
    pub queue_depth: usize,
}

impl CoreConfig {
    /// Config with production defaults; callers supply the two inputs that
    /// have no sensible default.
    pub fn new(gateway_token: SecretString, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            gateway_token,
            sandbox_image: "warden-sandbox".to_string(),
            port_range_start: 30000,
            port_range_end: 35000,
            connect_timeout: Duration::from_secs(30),
            gateway_ready_timeout: Duration::from_secs(60),
            turn_timeout: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(30 * 60),
            queue_depth: 3,
        }
    }
}
