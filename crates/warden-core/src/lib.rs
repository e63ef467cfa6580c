//! Warden Core - Sandbox Control Plane
//!
//! This crate provides the control-plane logic for Warden's per-user agent
//! sandboxes, including:
//! - Identity: Ed25519 device keys and signed gateway assertions
//! - Ports: host port allocation for new sandboxes
//! - Container: sandbox container lifecycle via the Docker API
//! - Gateway: the authenticated WebSocket connection manager
//! - Sandbox: the provisioning / teardown orchestrator
//! - Queue: per-user turn serialization with bounded backlog
//! - Intake: inbound message flow from the channel adapter
//! - Store: SQLite persistence for users, sandboxes and messages

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod container;
pub mod credentials;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod intake;
pub mod outbound;
pub mod ports;
pub mod queue;
pub mod sandbox;
pub mod store;

pub use config::CoreConfig;
pub use error::{Error, Result};
