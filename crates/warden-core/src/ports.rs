//! Host port allocation for new sandboxes.
//!
//! Ports already recorded against existing sandboxes are skipped, and every
//! remaining candidate is bind-probed on the wildcard address so a port held
//! by an unrelated process is not handed out. A concurrent allocator racing
//! between probe and container start is not defended against; the container
//! start fails loudly in that case.

use crate::error::{Error, Result};
use std::collections::HashSet;
use tokio::net::TcpListener;
use tracing::debug;

/// Scans a fixed inclusive range for a usable host port.
#[derive(Debug, Clone, Copy)]
pub struct PortAllocator {
    start: u16,
    end: u16,
}

impl PortAllocator {
    /// Allocator over the inclusive range `[start, end]`.
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Return the first port in range that is neither recorded as used nor
    /// bound by another process.
    pub async fn allocate(&self, used: &HashSet<u16>) -> Result<u16> {
        for port in self.start..=self.end {
            if used.contains(&port) {
                continue;
            }
            if !probe(port).await {
                continue;
            }
            debug!(port, "Allocated sandbox port");
            return Ok(port);
        }
        Err(Error::NoPortAvailable {
            start: self.start,
            end: self.end,
        })
    }
}

/// Bind-and-release on the wildcard address.
async fn probe(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).await.is_ok()
}
