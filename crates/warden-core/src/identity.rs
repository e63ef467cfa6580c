//! Ed25519 device identity for gateway attestation.
//!
//! Each sandbox gets one signing keypair on the control-plane side. The
//! gateway inside the sandbox knows the device by its fingerprint (SHA-256
//! over the raw 32-byte public key) and verifies a signed assertion over the
//! nonce it issued during the connect handshake.
//!
//! Keys are persisted as owner-only JSON files under
//! `<data_dir>/device-keys/<sandbox_id>.json` and never rotated; anything
//! unreadable, malformed, or failing the signature self-test is discarded
//! and regenerated.

use crate::error::{Error, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Version tag of the compound assertion payload. The gateway verifies
/// against this exact format.
const PAYLOAD_VERSION: &str = "v2";

/// A device identity: fingerprint plus the signing key behind it.
pub struct DeviceIdentity {
    /// Hex SHA-256 fingerprint of the raw public key
    pub device_id: String,
    signing_key: SigningKey,
}

/// Inputs to an authentication assertion (everything except the key).
pub struct AssertionParams<'a> {
    /// Server-issued challenge nonce
    pub nonce: &'a str,
    /// Client identifier presented on connect
    pub client_id: &'a str,
    /// Client mode presented on connect
    pub client_mode: &'a str,
    /// Requested role
    pub role: &'a str,
    /// Requested capability scopes
    pub scopes: &'a [String],
    /// Millisecond timestamp baked into the payload
    pub signed_at: i64,
    /// Shared gateway secret, if any
    pub token: Option<&'a str>,
}

/// A signed assertion ready to embed in the connect request.
pub struct SignedAssertion {
    /// Base64url (unpadded) Ed25519 signature over the compound payload
    pub signature: String,
    /// Timestamp that was signed
    pub signed_at: i64,
}

/// Build the deterministic pipe-delimited payload the gateway verifies.
///
/// Field order is the authentication contract; it must never change.
pub fn assertion_payload(device_id: &str, params: &AssertionParams<'_>) -> String {
    [
        PAYLOAD_VERSION,
        device_id,
        params.client_id,
        params.client_mode,
        params.role,
        &params.scopes.join(","),
        &params.signed_at.to_string(),
        params.token.unwrap_or(""),
        params.nonce,
    ]
    .join("|")
}

impl DeviceIdentity {
    /// Raw 32-byte public key, base64url without padding (the encoding the
    /// gateway expects in the connect device block and in container env).
    pub fn public_key_b64url(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.signing_key.verifying_key().as_bytes())
    }

    /// Sign an assertion over the given parameters.
    pub fn sign_assertion(&self, params: &AssertionParams<'_>) -> SignedAssertion {
        let payload = assertion_payload(&self.device_id, params);
        let signature = self.signing_key.sign(payload.as_bytes());
        SignedAssertion {
            signature: URL_SAFE_NO_PAD.encode(signature.to_bytes()),
            signed_at: params.signed_at,
        }
    }
}

/// Hex SHA-256 over the raw public key bytes.
fn fingerprint(public_key: &VerifyingKey) -> String {
    let digest = Sha256::digest(public_key.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// On-disk key file format.
#[derive(Serialize, Deserialize)]
struct StoredDeviceKey {
    device_id: String,
    public_key: String,
    private_key: String,
}

/// Loads and creates per-sandbox device identities.
pub struct IdentityStore {
    dir: PathBuf,
}

impl IdentityStore {
    /// Store rooted at `<data_dir>/device-keys`.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: data_dir.as_ref().join("device-keys"),
        }
    }

    fn key_path(&self, sandbox_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sandbox_id))
    }

    /// Load the identity for a sandbox, generating and persisting a fresh
    /// keypair if none exists or the stored one is unusable.
    ///
    /// Idempotent: repeated calls return the same identity until the file is
    /// deleted or corrupted.
    pub fn get_or_create(&self, sandbox_id: &str) -> Result<DeviceIdentity> {
        let path = self.key_path(sandbox_id);

        if path.exists() {
            match self.load(&path) {
                Ok(identity) => return Ok(identity),
                Err(e) => {
                    warn!(sandbox_id, error = %e, "Stored device key unusable, regenerating");
                    let _ = fs::remove_file(&path);
                }
            }
        }

        info!(sandbox_id, "Generating new Ed25519 device keypair");
        let signing_key = SigningKey::generate(&mut rand::thread_rng());
        let device_id = fingerprint(&signing_key.verifying_key());

        let stored = StoredDeviceKey {
            device_id: device_id.clone(),
            public_key: URL_SAFE_NO_PAD.encode(signing_key.verifying_key().as_bytes()),
            private_key: URL_SAFE_NO_PAD.encode(signing_key.to_bytes()),
        };
        if let Err(e) = self.persist(&path, &stored) {
            warn!(sandbox_id, error = %e, "Could not persist device key");
        }

        Ok(DeviceIdentity {
            device_id,
            signing_key,
        })
    }

    /// Delete a sandbox's key file. Best-effort; used during teardown.
    pub fn remove(&self, sandbox_id: &str) {
        let path = self.key_path(sandbox_id);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(sandbox_id, error = %e, "Could not delete device key");
            }
        }
    }

    fn load(&self, path: &Path) -> Result<DeviceIdentity> {
        let raw = fs::read_to_string(path).map_err(|e| Error::Key(e.to_string()))?;
        let stored: StoredDeviceKey =
            serde_json::from_str(&raw).map_err(|e| Error::Key(e.to_string()))?;

        let secret: [u8; 32] = URL_SAFE_NO_PAD
            .decode(&stored.private_key)
            .map_err(|e| Error::Key(e.to_string()))?
            .try_into()
            .map_err(|_| Error::Key("private key is not 32 bytes".to_string()))?;
        let signing_key = SigningKey::from_bytes(&secret);

        let public: [u8; 32] = URL_SAFE_NO_PAD
            .decode(&stored.public_key)
            .map_err(|e| Error::Key(e.to_string()))?
            .try_into()
            .map_err(|_| Error::Key("public key is not 32 bytes".to_string()))?;
        if signing_key.verifying_key().as_bytes() != &public {
            return Err(Error::Key("public key does not match private key".to_string()));
        }

        // Signature self-test: a key that cannot sign-and-verify is treated
        // as absent.
        let probe = signing_key.sign(b"test");
        signing_key
            .verifying_key()
            .verify(b"test", &probe)
            .map_err(|e| Error::Key(e.to_string()))?;

        // The fingerprint is derived, never trusted from disk. Repair the
        // file if a stale id is recorded.
        let device_id = fingerprint(&signing_key.verifying_key());
        if stored.device_id != device_id {
            debug!(path = %path.display(), "Repairing stale device id in key file");
            let repaired = StoredDeviceKey {
                device_id: device_id.clone(),
                ..stored
            };
            if let Err(e) = self.persist(path, &repaired) {
                warn!(error = %e, "Could not rewrite repaired device key");
            }
        }

        Ok(DeviceIdentity {
            device_id,
            signing_key,
        })
    }

    fn persist(&self, path: &Path, stored: &StoredDeviceKey) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(stored).expect("key file serializes");
        fs::write(path, json)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scopes() -> Vec<String> {
        vec!["operator.read".to_string(), "operator.write".to_string()]
    }

    #[test]
    fn payload_field_order_is_stable() {
        let params = AssertionParams {
            nonce: "abc123",
            client_id: "cli",
            client_mode: "cli",
            role: "operator",
            scopes: &scopes(),
            signed_at: 1000,
            token: Some("tok"),
        };
        assert_eq!(
            assertion_payload("d1", &params),
            "v2|d1|cli|cli|operator|operator.read,operator.write|1000|tok|abc123"
        );
    }

    #[test]
    fn missing_token_becomes_empty_field() {
        let params = AssertionParams {
            nonce: "n",
            client_id: "cli",
            client_mode: "cli",
            role: "operator",
            scopes: &scopes(),
            signed_at: 7,
            token: None,
        };
        assert_eq!(
            assertion_payload("d1", &params),
            "v2|d1|cli|cli|operator|operator.read,operator.write|7||n"
        );
    }

    #[test]
    fn identity_is_stable_across_loads() {
        let tmp = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(tmp.path());

        let first = store.get_or_create("sb-1").unwrap();
        let second = store.get_or_create("sb-1").unwrap();
        assert_eq!(first.device_id, second.device_id);
        assert_eq!(first.public_key_b64url(), second.public_key_b64url());
    }

    #[test]
    fn corrupt_key_file_regenerates_with_new_id() {
        let tmp = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(tmp.path());

        let first = store.get_or_create("sb-1").unwrap();
        std::fs::write(store.key_path("sb-1"), "not json").unwrap();
        let second = store.get_or_create("sb-1").unwrap();
        assert_ne!(first.device_id, second.device_id);
    }

    #[test]
    fn stale_fingerprint_is_repaired_on_load() {
        let tmp = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(tmp.path());

        let identity = store.get_or_create("sb-1").unwrap();
        let path = store.key_path("sb-1");
        let mut stored: StoredDeviceKey =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        stored.device_id = "stale".to_string();
        std::fs::write(&path, serde_json::to_string(&stored).unwrap()).unwrap();

        let reloaded = store.get_or_create("sb-1").unwrap();
        assert_eq!(reloaded.device_id, identity.device_id);

        let repaired: StoredDeviceKey =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(repaired.device_id, identity.device_id);
    }

    #[test]
    fn signature_verifies_and_is_unpadded_base64url() {
        let tmp = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(tmp.path());
        let identity = store.get_or_create("sb-1").unwrap();

        let params = AssertionParams {
            nonce: "challenge",
            client_id: "cli",
            client_mode: "cli",
            role: "operator",
            scopes: &scopes(),
            signed_at: 42,
            token: Some("secret"),
        };
        let assertion = identity.sign_assertion(&params);
        assert!(!assertion.signature.contains('='));

        let sig_bytes: [u8; 64] = URL_SAFE_NO_PAD
            .decode(&assertion.signature)
            .unwrap()
            .try_into()
            .unwrap();
        let pub_bytes: [u8; 32] = URL_SAFE_NO_PAD
            .decode(identity.public_key_b64url())
            .unwrap()
            .try_into()
            .unwrap();
        let verifying = VerifyingKey::from_bytes(&pub_bytes).unwrap();
        let payload = assertion_payload(&identity.device_id, &params);
        verifying
            .verify(
                payload.as_bytes(),
                &ed25519_dalek::Signature::from_bytes(&sig_bytes),
            )
            .unwrap();
    }

    #[test]
    fn device_id_is_sha256_of_raw_public_key() {
        let tmp = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(tmp.path());
        let identity = store.get_or_create("sb-1").unwrap();

        let raw = URL_SAFE_NO_PAD.decode(identity.public_key_b64url()).unwrap();
        let expected: String = Sha256::digest(&raw)
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        assert_eq!(identity.device_id, expected);
    }
}
