//! Domain newtypes with validation
//!
//! Strongly-typed wrappers for domain identifiers and values. Each newtype
//! ensures data validity at construction time rather than passing bare
//! `String`/`u64` around.

use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::DomainError;

// ============================================================================
// UniqueId — process-internal correlation id, unrelated to the remote ID
// ============================================================================

/// A generic unique identifier, used to correlate persisted rows that are
/// not otherwise addressable (e.g. a not-yet-persisted upload session).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UniqueId(Uuid);

impl UniqueId {
    /// Generates a new random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UniqueId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for UniqueId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UniqueId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| DomainError::InvalidId(e.to_string()))
    }
}

impl From<Uuid> for UniqueId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

// ============================================================================
// SyncPath — a path within the FUSE mount point
// ============================================================================

/// A path known to live under the configured mount root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncPath(PathBuf);

impl SyncPath {
    /// Wraps an already-validated absolute path.
    pub fn new(path: PathBuf) -> Result<Self, DomainError> {
        if !path.is_absolute() {
            return Err(DomainError::InvalidPath(format!(
                "path must be absolute: {}",
                path.display()
            )));
        }
        Ok(Self(path))
    }

    /// Builds a `SyncPath` from a root and a path that must live under it.
    pub fn new_within_root(path: PathBuf, root: &SyncPath) -> Result<Self, DomainError> {
        if !path.starts_with(root.as_path()) {
            return Err(DomainError::PathNotInRoot(format!(
                "{} is not under {}",
                path.display(),
                root.as_path().display()
            )));
        }
        Self::new(path)
    }

    /// Returns the wrapped path.
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Joins a path component onto this path.
    pub fn join(&self, component: &str) -> Result<Self, DomainError> {
        if component.contains('/') {
            return Err(DomainError::InvalidPath(format!(
                "path component must not contain '/': {component}"
            )));
        }
        Self::new(self.0.join(component))
    }
}

impl Display for SyncPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl AsRef<Path> for SyncPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

// ============================================================================
// RemotePath — a OneDrive "path addressing" string, e.g. "/docs/notes.txt"
// ============================================================================

/// A remote path in the `/me/drive/root:/a/b:/` addressing form (without
/// the `root:` prefix or trailing colon — see [`RemotePath::as_api_segment`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemotePath(String);

impl RemotePath {
    /// Creates a new remote path; must be empty (root) or start with `/`.
    pub fn new(path: String) -> Result<Self, DomainError> {
        if !path.is_empty() && !path.starts_with('/') {
            return Err(DomainError::InvalidRemotePath(format!(
                "remote path must start with '/': {path}"
            )));
        }
        Ok(Self(path.trim_end_matches('/').to_string()))
    }

    /// The drive root.
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Returns true if this is the drive root.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Appends a single path component.
    pub fn join(&self, component: &str) -> Result<Self, DomainError> {
        if component.is_empty() || component.contains('/') {
            return Err(DomainError::InvalidRemotePath(format!(
                "invalid path component: {component}"
            )));
        }
        Ok(Self(format!("{}/{}", self.0, component)))
    }

    /// The final path segment, if any.
    pub fn file_name(&self) -> Option<&str> {
        self.0.rsplit('/').next().filter(|s| !s.is_empty())
    }
}

impl Display for RemotePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RemotePath {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for RemotePath {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<RemotePath> for String {
    fn from(path: RemotePath) -> Self {
        path.0
    }
}

// ============================================================================
// RemoteId — an item ID, either the server's opaque ID or a local placeholder
// ============================================================================

/// Prefix marking an ID as filesystem-generated, not yet known to the
/// remote. See §3 "Identity" — `local-<20 random alphanumerics>`.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Either an opaque server-assigned drive-item ID, or a `local-` prefixed
/// placeholder minted for an item created locally but not yet uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemoteId(String);

impl RemoteId {
    /// Wraps an existing ID string (server-assigned or local).
    pub fn new(id: String) -> Result<Self, DomainError> {
        if id.is_empty() {
            return Err(DomainError::InvalidRemoteId("id cannot be empty".into()));
        }
        Ok(Self(id))
    }

    /// Mints a fresh local placeholder ID.
    pub fn new_local() -> Self {
        let suffix: String = {
            use rand_suffix::random_alphanumeric;
            random_alphanumeric(20)
        };
        Self(format!("{LOCAL_ID_PREFIX}{suffix}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if this ID was generated locally and has never been uploaded.
    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_ID_PREFIX)
    }
}

impl Display for RemoteId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RemoteId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for RemoteId {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<RemoteId> for String {
    fn from(id: RemoteId) -> Self {
        id.0
    }
}

/// Minimal dependency-free random alphanumeric generator, isolated in its
/// own module so the rest of this file reads like ordinary newtype
/// boilerplate.
mod rand_suffix {
    use std::time::{SystemTime, UNIX_EPOCH};

    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

    /// Uses `uuid`'s RNG (already a dependency) rather than pulling in `rand`
    /// for twenty bytes of suffix.
    pub fn random_alphanumeric(len: usize) -> String {
        let mut seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0)
            ^ (uuid::Uuid::new_v4().as_u128());
        let mut out = String::with_capacity(len);
        for _ in 0..len {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            let idx = (seed >> 64) as usize % ALPHABET.len();
            out.push(ALPHABET[idx] as char);
        }
        out
    }
}

// ============================================================================
// FileHash — content integrity hash, SHA-1 hex or quickXorHash Base64
// ============================================================================

/// A validated content hash. The wire format depends on drive type (§6):
/// uppercase SHA-1 hex for personal drives, Base64 quickXorHash for
/// business/sharepoint drives. This type accepts either; callers that need
/// to know which kind they have consult [`FileHash::kind`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FileHash(String);

/// Which hash algorithm produced a [`FileHash`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    Sha1,
    QuickXor,
}

impl FileHash {
    /// quickXorHash is always 20 bytes, Base64-encoded to 28 characters.
    const QUICK_XOR_BASE64_LEN: usize = 28;
    /// SHA-1 is 20 bytes, hex-encoded to 40 characters.
    const SHA1_HEX_LEN: usize = 40;

    /// Wraps a SHA-1 hex digest, uppercasing it to match §6's wire format.
    pub fn sha1(hex: impl Into<String>) -> Result<Self, DomainError> {
        let hex = hex.into();
        if hex.len() != Self::SHA1_HEX_LEN || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DomainError::InvalidHash(format!(
                "not a 40-character hex SHA-1 digest: {hex}"
            )));
        }
        Ok(Self(hex.to_ascii_uppercase()))
    }

    /// Wraps a Base64 quickXorHash digest.
    pub fn quick_xor(base64: impl Into<String>) -> Result<Self, DomainError> {
        let base64 = base64.into();
        if base64.len() != Self::QUICK_XOR_BASE64_LEN {
            return Err(DomainError::InvalidHash(format!(
                "quickXorHash must be {} base64 characters: {base64}",
                Self::QUICK_XOR_BASE64_LEN
            )));
        }
        Ok(Self(base64))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Infers the algorithm from the encoded length.
    pub fn kind(&self) -> HashKind {
        if self.0.len() == Self::SHA1_HEX_LEN {
            HashKind::Sha1
        } else {
            HashKind::QuickXor
        }
    }
}

impl Display for FileHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for FileHash {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s.len() == Self::SHA1_HEX_LEN {
            Self::sha1(s)
        } else {
            Self::quick_xor(s)
        }
    }
}

impl From<FileHash> for String {
    fn from(hash: FileHash) -> Self {
        hash.0
    }
}

// ============================================================================
// DeltaToken — opaque resume cursor for the change feed
// ============================================================================

/// Opaque cursor extracted from a `@odata.deltaLink`/`@odata.nextLink`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeltaToken(String);

impl DeltaToken {
    pub fn new(token: String) -> Result<Self, DomainError> {
        if token.is_empty() {
            return Err(DomainError::InvalidDeltaToken(
                "delta token cannot be empty".to_string(),
            ));
        }
        Ok(Self(token))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DeltaToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeltaToken {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for DeltaToken {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<DeltaToken> for String {
    fn from(token: DeltaToken) -> Self {
        token.0
    }
}
