//! Credential store.
//!
//! Loads the local Curve25519 keypair and the peer public keys the secure
//! channel trusts. Key material is minted elsewhere; this module only reads
//! it, once, at startup.
//!
//! Certificates are small JSON files named after the identity they belong to:
//! - `<identity>.key` holds `{"public_key": "<hex>"}`
//! - `<identity>.key_secret` additionally holds `"secret_key": "<hex>"`

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length in bytes of every Curve25519 key.
pub const KEY_LEN: usize = 32;

/// File extension of public certificates.
pub const PUBLIC_EXTENSION: &str = "key";

/// File extension of secret certificates.
pub const SECRET_EXTENSION: &str = "key_secret";

#[derive(Debug, Error)]
pub enum CredentialLoadError {
    #[error("credential file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid certificate {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid {field} in {path}: {reason}")]
    InvalidKey {
        path: PathBuf,
        field: &'static str,
        reason: String,
    },

    #[error("{0} does not contain a secret key")]
    MissingSecret(PathBuf),

    #[error("secret key in {0} does not match its public key")]
    KeyMismatch(PathBuf),

    #[error("no authorized public keys found in {0}")]
    NoAuthorizedKeys(PathBuf),
}

/// A Curve25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Build from a slice, as handed back by the Noise handshake.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; KEY_LEN]>::try_from(bytes).ok().map(Self)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A Curve25519 secret key. Zeroed on drop, never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; KEY_LEN]);

impl SecretKey {
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Expose the raw key bytes. Use immediately and let go.
    pub const fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Derive the matching public key.
    pub fn public_key(&self) -> PublicKey {
        let secret = x25519_dalek::StaticSecret::from(self.0);
        PublicKey(x25519_dalek::PublicKey::from(&secret).to_bytes())
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

/// A local identity: public key plus the secret key that never leaves the host.
#[derive(Debug, Clone)]
pub struct Keypair {
    pub public: PublicKey,
    secret: SecretKey,
}

impl Keypair {
    pub fn from_secret(secret: SecretKey) -> Self {
        Self {
            public: secret.public_key(),
            secret,
        }
    }

    pub const fn secret(&self) -> &SecretKey {
        &self.secret
    }
}

/// On-disk certificate layout.
#[derive(Debug, Serialize, Deserialize)]
struct CertificateFile {
    public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    secret_key: Option<String>,
}

/// Path of the public certificate for `identity` inside `dir`.
pub fn public_certificate_path(dir: &Path, identity: &str) -> PathBuf {
    dir.join(format!("{identity}.{PUBLIC_EXTENSION}"))
}

/// Path of the secret certificate for `identity` inside `dir`.
pub fn secret_certificate_path(dir: &Path, identity: &str) -> PathBuf {
    dir.join(format!("{identity}.{SECRET_EXTENSION}"))
}

fn read_certificate(path: &Path) -> Result<CertificateFile, CredentialLoadError> {
    if !path.exists() {
        return Err(CredentialLoadError::NotFound(path.to_path_buf()));
    }
    let text = std::fs::read_to_string(path).map_err(|source| CredentialLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| CredentialLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn decode_key(
    path: &Path,
    field: &'static str,
    text: &str,
) -> Result<[u8; KEY_LEN], CredentialLoadError> {
    let mut bytes = [0u8; KEY_LEN];
    hex::decode_to_slice(text.trim(), &mut bytes).map_err(|e| {
        CredentialLoadError::InvalidKey {
            path: path.to_path_buf(),
            field,
            reason: e.to_string(),
        }
    })?;
    Ok(bytes)
}

#[cfg(unix)]
fn warn_if_exposed(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(meta) = std::fs::metadata(path) {
        let mode = meta.permissions().mode();
        if mode & 0o077 != 0 {
            warn!(
                path = %path.display(),
                mode = %format!("{mode:o}"),
                "Secret certificate is readable by other users"
            );
        }
    }
}

#[cfg(not(unix))]
fn warn_if_exposed(_path: &Path) {}

/// Load a keypair from a secret certificate.
pub fn load_keypair(path: &Path) -> Result<Keypair, CredentialLoadError> {
    let cert = read_certificate(path)?;
    let public = PublicKey(decode_key(path, "public_key", &cert.public_key)?);
    let secret_hex = cert
        .secret_key
        .as_deref()
        .ok_or_else(|| CredentialLoadError::MissingSecret(path.to_path_buf()))?;
    let secret = SecretKey(decode_key(path, "secret_key", secret_hex)?);

    let keypair = Keypair::from_secret(secret);
    if keypair.public != public {
        return Err(CredentialLoadError::KeyMismatch(path.to_path_buf()));
    }

    warn_if_exposed(path);
    debug!(path = %path.display(), public_key = %keypair.public, "Loaded keypair");
    Ok(keypair)
}

/// Load the public key from either kind of certificate.
pub fn load_public_key(path: &Path) -> Result<PublicKey, CredentialLoadError> {
    let cert = read_certificate(path)?;
    Ok(PublicKey(decode_key(path, "public_key", &cert.public_key)?))
}

/// Load every `*.key` certificate in `dir`.
///
/// Fails if the directory is missing, any certificate is invalid, or no
/// certificate is found: an empty trust set would lock everyone out silently.
pub fn load_authorized_keys(dir: &Path) -> Result<Vec<PublicKey>, CredentialLoadError> {
    if !dir.is_dir() {
        return Err(CredentialLoadError::NotFound(dir.to_path_buf()));
    }
    let entries = std::fs::read_dir(dir).map_err(|source| CredentialLoadError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| CredentialLoadError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == PUBLIC_EXTENSION) {
            paths.push(path);
        }
    }
    paths.sort();

    let mut keys = Vec::with_capacity(paths.len());
    for path in &paths {
        let key = load_public_key(path)?;
        if !keys.contains(&key) {
            keys.push(key);
        }
    }

    if keys.is_empty() {
        return Err(CredentialLoadError::NoAuthorizedKeys(dir.to_path_buf()));
    }
    debug!(dir = %dir.display(), count = keys.len(), "Loaded authorized keys");
    Ok(keys)
}

/// Everything the worker needs to accept channels.
#[derive(Debug, Clone)]
pub struct WorkerCredentials {
    pub keypair: Keypair,
    pub authorized_keys: Vec<PublicKey>,
}

impl WorkerCredentials {
    pub fn load(
        secret_keys_dir: &Path,
        public_keys_dir: &Path,
        identity: &str,
    ) -> Result<Self, CredentialLoadError> {
        Ok(Self {
            keypair: load_keypair(&secret_certificate_path(secret_keys_dir, identity))?,
            authorized_keys: load_authorized_keys(public_keys_dir)?,
        })
    }
}

/// Everything the dispatcher needs to open a channel to one worker.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub keypair: Keypair,
    pub worker_key: PublicKey,
}

impl ClientCredentials {
    pub fn load(
        secret_keys_dir: &Path,
        public_keys_dir: &Path,
        identity: &str,
        worker_identity: &str,
    ) -> Result<Self, CredentialLoadError> {
        Ok(Self {
            keypair: load_keypair(&secret_certificate_path(secret_keys_dir, identity))?,
            worker_key: load_public_key(&public_certificate_path(
                public_keys_dir,
                worker_identity,
            ))?,
        })
    }
}
