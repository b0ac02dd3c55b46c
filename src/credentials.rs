//! Per-identity authentication material for the messaging platform.
//!
//! The platform hands the engine opaque auth material after pairing and
//! refreshes it over the life of a session. The engine persists every
//! update and deletes it on logout. Deleting material that does not exist
//! is not an error.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::SessionKey;

/// Opaque auth material as issued by the platform.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthMaterial(pub serde_json::Value);

impl std::fmt::Debug for AuthMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthMaterial([REDACTED])")
    }
}

/// Storage for auth material.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load material for a session, if any was stored.
    async fn load(&self, key: &SessionKey) -> anyhow::Result<Option<AuthMaterial>>;

    /// Persist (replace) material for a session.
    async fn save(&self, key: &SessionKey, material: &AuthMaterial) -> anyhow::Result<()>;

    /// Delete material for a session. Succeeds when nothing was stored.
    async fn purge(&self, key: &SessionKey) -> anyhow::Result<()>;

    /// Whether usable material exists for a session.
    async fn exists(&self, key: &SessionKey) -> bool {
        matches!(self.load(key).await, Ok(Some(_)))
    }
}

/// One private JSON file per session under a base directory.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    base_dir: PathBuf,
}

impl FileCredentialStore {
    /// Store files under `base_dir`, created on first write.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// File holding a session's material.
    pub fn path_for(&self, key: &SessionKey) -> PathBuf {
        self.base_dir.join(format!(
            "{}__{}.json",
            sanitize_component(&key.tenant),
            sanitize_component(&key.identity)
        ))
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self, key: &SessionKey) -> anyhow::Result<Option<AuthMaterial>> {
        let path = self.path_for(key);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        let material: AuthMaterial = serde_json::from_str(&contents)
            .with_context(|| format!("corrupt credentials at {}", path.display()))?;
        Ok(Some(material))
    }

    async fn save(&self, key: &SessionKey, material: &AuthMaterial) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.base_dir)
            .await
            .with_context(|| format!("failed to create {}", self.base_dir.display()))?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec(material).context("failed to encode credentials")?;
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        enforce_private_file_permissions(&tmp)?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to move credentials into {}", path.display()))?;
        debug!(session = %key, "credentials saved");
        Ok(())
    }

    async fn purge(&self, key: &SessionKey) -> anyhow::Result<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(session = %key, "credentials purged");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to delete {}", path.display())),
        }
    }
}

/// Restrict a file to its owner when supported.
///
/// # Errors
///
/// Returns an error if permissions cannot be updated.
pub fn enforce_private_file_permissions(path: &Path) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let perms = fs::Permissions::from_mode(0o600);
        fs::set_permissions(path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }
    #[cfg(not(unix))]
    let _ = path;

    Ok(())
}

/// Make a key component safe to use in a file name.
fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '+' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
