//! Signing and verification of security events.
//!
//! Uses HMAC-SHA256 with a device-local 32-byte key over the canonical
//! encoding in [`SecurityEvent::canonical_bytes`]. The signer holds only a
//! handle to a [`KeyProvider`]; key material is fetched per operation and
//! never cached.
//!
//! # Key Management
//!
//! - **Generation**: [`ensure_device_key`] creates a 32-byte random key on
//!   first run from the OS CSPRNG via the `rand` crate.
//! - **Storage**: in the data directory, away from the audit log it signs.
//! - **Permissions**: 0600 on Unix (owner read/write only).

use hmac::{Hmac, Mac};
use rand::RngExt;
use sha2::Sha256;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use super::record::{EventSignature, SecurityEvent};

type HmacSha256 = Hmac<Sha256>;

pub const DEVICE_KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum SigningError {
    /// No usable key. The caller records the entry as unsigned.
    #[error("signing key unavailable: {0}")]
    SigningUnavailable(String),

    #[error("failed to encode event for signing: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Source of the signing key (external collaborator).
pub trait KeyProvider: Send + Sync {
    fn signing_key(&self) -> Result<[u8; DEVICE_KEY_LEN], SigningError>;
}

/// Key stored in a file in the data directory.
#[derive(Debug, Clone)]
pub struct DeviceKeyFile {
    path: PathBuf,
}

impl DeviceKeyFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyProvider for DeviceKeyFile {
    fn signing_key(&self) -> Result<[u8; DEVICE_KEY_LEN], SigningError> {
        read_device_key(&self.path)
    }
}

/// Fixed in-memory key.
#[derive(Clone)]
pub struct StaticKey([u8; DEVICE_KEY_LEN]);

impl StaticKey {
    pub fn new(key: [u8; DEVICE_KEY_LEN]) -> Self {
        Self(key)
    }
}

impl KeyProvider for StaticKey {
    fn signing_key(&self) -> Result<[u8; DEVICE_KEY_LEN], SigningError> {
        Ok(self.0)
    }
}

/// Provider used when signing is switched off in config.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoKey;

impl KeyProvider for NoKey {
    fn signing_key(&self) -> Result<[u8; DEVICE_KEY_LEN], SigningError> {
        Err(SigningError::SigningUnavailable(
            "signing disabled by configuration".to_string(),
        ))
    }
}

/// Ensure a device key exists at `path`.
///
/// If the key file does not exist, generates 32 random bytes and writes
/// them with 0600 permissions (Unix). Existing keys are left alone.
pub fn ensure_device_key(path: &Path) -> anyhow::Result<()> {
    use anyhow::Context;

    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut key = [0u8; DEVICE_KEY_LEN];
    rand::rng().fill(&mut key);

    fs::write(path, key).context("Failed to write device key")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .context("Failed to set device key permissions")?;
    }

    tracing::info!("Generated device key at {}", path.display());
    Ok(())
}

/// Read a device key, rejecting files of the wrong length.
pub fn read_device_key(path: &Path) -> Result<[u8; DEVICE_KEY_LEN], SigningError> {
    let bytes = fs::read(path).map_err(|e| {
        SigningError::SigningUnavailable(format!("cannot read {}: {}", path.display(), e))
    })?;

    if bytes.len() != DEVICE_KEY_LEN {
        return Err(SigningError::SigningUnavailable(format!(
            "device key has unexpected length {} (expected {})",
            bytes.len(),
            DEVICE_KEY_LEN
        )));
    }

    let mut key = [0u8; DEVICE_KEY_LEN];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Stateless signer/verifier bound to a key provider.
#[derive(Clone)]
pub struct EventSigner {
    keys: Arc<dyn KeyProvider>,
}

impl EventSigner {
    pub fn new(keys: Arc<dyn KeyProvider>) -> Self {
        Self { keys }
    }

    /// Sign everything in `event` except its signature field.
    pub fn sign(&self, event: &SecurityEvent) -> Result<EventSignature, SigningError> {
        let key = self.keys.signing_key()?;
        let payload = event.canonical_bytes()?;
        let mut mac = new_mac(&key)?;
        mac.update(&payload);
        Ok(EventSignature::HmacSha256(hex_encode(
            &mac.finalize().into_bytes(),
        )))
    }

    /// True only for a well-formed HMAC over the event's current contents.
    pub fn verify(&self, event: &SecurityEvent, signature: &EventSignature) -> bool {
        let EventSignature::HmacSha256(hex) = signature else {
            return false;
        };
        let Some(expected) = hex_decode(hex) else {
            return false;
        };
        let (Ok(key), Ok(payload)) = (self.keys.signing_key(), event.canonical_bytes()) else {
            return false;
        };
        let Ok(mut mac) = new_mac(&key) else {
            return false;
        };
        mac.update(&payload);
        // Constant-time comparison
        mac.verify_slice(&expected).is_ok()
    }

    pub fn verify_event(&self, event: &SecurityEvent) -> bool {
        self.verify(event, &event.signature)
    }
}

fn new_mac(key: &[u8; DEVICE_KEY_LEN]) -> Result<HmacSha256, SigningError> {
    HmacSha256::new_from_slice(key)
        .map_err(|e| SigningError::SigningUnavailable(format!("invalid HMAC key: {}", e)))
}

/// Hex-encode a byte slice.
pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hex_decode(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| hex.get(i..i + 2).and_then(|b| u8::from_str_radix(b, 16).ok()))
        .collect()
}
