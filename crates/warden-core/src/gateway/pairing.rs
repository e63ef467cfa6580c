//! Pairing recovery.
//!
//! When the gateway rejects a connect with `NOT_PAIRED`, the control plane
//! repairs the trust registration from outside: it executes a privileged
//! command inside the sandbox container that promotes the matching pending
//! pairing request, or falls back to inserting its own device id into the
//! paired set. The connect handshake is then retried from scratch.
//!
//! The self-pairing fallback is an intentional trust decision for this
//! deployment (see DESIGN.md): the control plane creates the container and
//! injects its secret, so it is already the root of trust for that sandbox.

use crate::container::ContainerManager;
use crate::error::Result;
use tracing::{info, warn};

/// Directory inside the sandbox where the gateway keeps its device registry.
const DEVICE_STORE_DIR: &str = "/root/.agent/devices";

/// What the recovery run achieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingOutcome {
    /// The pending request named by the gateway was promoted
    Promoted,
    /// No pending request matched; our device id was inserted directly
    SelfPaired,
    /// The in-container script did not confirm either path
    Failed(String),
}

/// Repair the gateway's pairing state for our device.
pub async fn recover_pairing(
    containers: &ContainerManager,
    container_id: &str,
    device_id: &str,
    pending_request_id: Option<&str>,
) -> Result<PairingOutcome> {
    let script = recovery_script(device_id, pending_request_id);
    let output = containers.exec_capture(container_id, &script).await?;
    let outcome = parse_outcome(&output);
    match &outcome {
        PairingOutcome::Promoted => info!(container_id, "Promoted pending pairing request"),
        PairingOutcome::SelfPaired => info!(container_id, "Self-paired device with gateway"),
        PairingOutcome::Failed(out) => {
            warn!(container_id, output = %out, "Pairing recovery did not confirm")
        }
    }
    Ok(outcome)
}

/// Identifiers are embedded in a shell command; restrict them to the
/// characters fingerprints and request ids actually use.
fn sanitize(id: &str) -> String {
    id.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}

fn recovery_script(device_id: &str, pending_request_id: Option<&str>) -> String {
    let device_id = sanitize(device_id);
    let request_id = pending_request_id.map(sanitize).unwrap_or_default();
    format!(
        concat!(
            "cd {dir} && node -e \"",
            "const fs = require('fs');",
            "const read = (f) => {{ try {{ return JSON.parse(fs.readFileSync(f, 'utf8')); }} catch {{ return {{}}; }} }};",
            "const pending = read('pending.json');",
            "const paired = read('paired.json');",
            "const rid = '{rid}';",
            "const deviceId = '{device}';",
            "if (rid && pending[rid]) {{",
            "  paired[rid] = pending[rid];",
            "  delete pending[rid];",
            "  fs.writeFileSync('pending.json', JSON.stringify(pending, null, 2));",
            "  console.log('promoted');",
            "}} else {{",
            "  paired[deviceId] = {{ deviceId, pairedAt: new Date().toISOString() }};",
            "  console.log('self-paired');",
            "}}",
            "fs.writeFileSync('paired.json', JSON.stringify(paired, null, 2));",
            "\"",
        ),
        dir = DEVICE_STORE_DIR,
        rid = request_id,
        device = device_id,
    )
}

fn parse_outcome(output: &str) -> PairingOutcome {
    let trimmed = output.trim();
    if trimmed.contains("promoted") {
        PairingOutcome::Promoted
    } else if trimmed.contains("self-paired") {
        PairingOutcome::SelfPaired
    } else {
        PairingOutcome::Failed(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_embeds_sanitized_identifiers() {
        let script = recovery_script("abc123", Some("req'; rm -rf /"));
        assert!(script.contains("const deviceId = 'abc123';"));
        assert!(script.contains("const rid = 'reqrm-rf';"));
        assert!(!script.contains("rm -rf /"));
    }

    #[test]
    fn missing_request_id_leaves_rid_empty() {
        let script = recovery_script("abc123", None);
        assert!(script.contains("const rid = '';"));
    }

    #[test]
    fn outcomes_parse_from_script_output() {
        assert_eq!(parse_outcome("promoted\n"), PairingOutcome::Promoted);
        assert_eq!(parse_outcome("self-paired"), PairingOutcome::SelfPaired);
        assert_eq!(
            parse_outcome("sh: node: not found"),
            PairingOutcome::Failed("sh: node: not found".to_string())
        );
    }
}
