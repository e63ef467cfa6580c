//! SQLite persistence for users, sandboxes and messages.
//!
//! The schema is created in code on connect; warden owns the database file
//! and nothing else writes to it. Users and sandboxes rely on unique keys
//! (phone, user_id, port) for find-or-create semantics.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Sqlite};
use std::collections::HashSet;
use tracing::debug;
use uuid::Uuid;

/// A messaging-channel user.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    /// Stable id
    pub id: String,
    /// Channel address (unique)
    pub phone: String,
}

/// Sandbox lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    /// Background provisioning is still running
    Provisioning,
    /// Container up, gateway reachable
    Ready,
    /// Provisioning failed; terminal until teardown
    Error,
}

impl SandboxStatus {
    /// Stable string form used in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "ready" => Self::Ready,
            "error" => Self::Error,
            _ => Self::Provisioning,
        }
    }
}

/// One per-user sandbox record.
#[derive(Debug, Clone, Serialize)]
pub struct Sandbox {
    /// Stable id
    pub id: String,
    /// Owning user (unique)
    pub user_id: String,
    /// Host port the gateway is mapped to (unique)
    pub port: u16,
    /// Container id once started
    pub container_id: Option<String>,
    /// Lifecycle state
    pub status: SandboxStatus,
    /// Failure message when status is `error`
    pub error_message: Option<String>,
    /// Handle for revoking the provisioned API key
    pub external_key_handle: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Message direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    /// Inbound user turn
    User,
    /// Agent output
    Assistant,
}

impl MessageRole {
    fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// SQLite-backed store shared across components.
#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    /// Connect and run the in-code migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store for tests. A single connection keeps every query on
    /// the same database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                phone TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sandboxes (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL UNIQUE REFERENCES users(id),
                port INTEGER NOT NULL UNIQUE,
                container_id TEXT,
                status TEXT NOT NULL,
                error_message TEXT,
                external_key_handle TEXT,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                sandbox_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                status TEXT NOT NULL,
                source TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        debug!("Store migrations applied");
        Ok(())
    }

    /// Atomic find-or-create by phone.
    pub async fn find_or_create_user(&self, phone: &str) -> Result<User> {
        sqlx::query("INSERT INTO users (id, phone, created_at) VALUES (?, ?, ?) ON CONFLICT(phone) DO NOTHING")
            .bind(Uuid::new_v4().to_string())
            .bind(phone)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;

        let (id, phone): (String, String) =
            sqlx::query_as("SELECT id, phone FROM users WHERE phone = ?")
                .bind(phone)
                .fetch_one(&self.pool)
                .await?;
        Ok(User { id, phone })
    }

    /// Sandbox owned by a user, if any.
    pub async fn sandbox_by_user(&self, user_id: &str) -> Result<Option<Sandbox>> {
        let row = sqlx::query_as::<_, SandboxRow>(
            "SELECT id, user_id, port, container_id, status, error_message, external_key_handle, created_at
             FROM sandboxes WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(SandboxRow::into_sandbox))
    }

    /// Ports currently recorded against any sandbox.
    pub async fn used_ports(&self) -> Result<HashSet<u16>> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT port FROM sandboxes")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(p,)| p as u16).collect())
    }

    /// Insert a fresh `provisioning` record.
    pub async fn create_sandbox(&self, user_id: &str, port: u16) -> Result<Sandbox> {
        let sandbox = Sandbox {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            port,
            container_id: None,
            status: SandboxStatus::Provisioning,
            error_message: None,
            external_key_handle: None,
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO sandboxes (id, user_id, port, status, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&sandbox.id)
        .bind(&sandbox.user_id)
        .bind(sandbox.port as i64)
        .bind(sandbox.status.as_str())
        .bind(sandbox.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(sandbox)
    }

    /// Record the started container.
    pub async fn set_container(&self, sandbox_id: &str, container_id: &str) -> Result<()> {
        sqlx::query("UPDATE sandboxes SET container_id = ? WHERE id = ?")
            .bind(container_id)
            .bind(sandbox_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record the provisioned key handle.
    pub async fn set_key_handle(&self, sandbox_id: &str, handle: &str) -> Result<()> {
        sqlx::query("UPDATE sandboxes SET external_key_handle = ? WHERE id = ?")
            .bind(handle)
            .bind(sandbox_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Transition to `ready`.
    pub async fn mark_ready(&self, sandbox_id: &str) -> Result<()> {
        sqlx::query("UPDATE sandboxes SET status = 'ready', error_message = NULL WHERE id = ?")
            .bind(sandbox_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Transition to `error` with the captured message.
    pub async fn mark_error(&self, sandbox_id: &str, message: &str) -> Result<()> {
        sqlx::query("UPDATE sandboxes SET status = 'error', error_message = ? WHERE id = ?")
            .bind(message)
            .bind(sandbox_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a sandbox record.
    pub async fn delete_sandbox(&self, sandbox_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sandboxes WHERE id = ?")
            .bind(sandbox_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Channel address of the user owning a sandbox.
    pub async fn phone_for_sandbox(&self, sandbox_id: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT u.phone FROM users u JOIN sandboxes s ON s.user_id = u.id WHERE s.id = ?",
        )
        .bind(sandbox_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(phone,)| phone))
    }

    /// Append one message record.
    pub async fn record_message(
        &self,
        sandbox_id: &str,
        role: MessageRole,
        content: &str,
        status: &str,
        source: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO messages (id, sandbox_id, role, content, status, source, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(sandbox_id)
        .bind(role.as_str())
        .bind(content)
        .bind(status)
        .bind(source)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Number of stored messages for a sandbox (used by tests and status
    /// surfaces).
    pub async fn message_count(&self, sandbox_id: &str) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM messages WHERE sandbox_id = ?")
                .bind(sandbox_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

#[derive(sqlx::FromRow)]
struct SandboxRow {
    id: String,
    user_id: String,
    port: i64,
    container_id: Option<String>,
    status: String,
    error_message: Option<String>,
    external_key_handle: Option<String>,
    created_at: String,
}

impl SandboxRow {
    fn into_sandbox(self) -> Sandbox {
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        Sandbox {
            id: self.id,
            user_id: self.user_id,
            port: self.port as u16,
            container_id: self.container_id,
            status: SandboxStatus::parse(&self.status),
            error_message: self.error_message,
            external_key_handle: self.external_key_handle,
            created_at,
        }
    }
}
