use std::{io, path::PathBuf};

use shared::domain::UserId;
use tracing::warn;

/// Locates the per-user credential directories owned by the chat transport.
/// Only existence is inspected here; the contents are the transport's
/// business.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    root: PathBuf,
}

impl CredentialStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn dir_for(&self, user_id: &UserId) -> PathBuf {
        self.root.join(format!("session-{user_id}"))
    }

    pub async fn exists(&self, user_id: &UserId) -> bool {
        let dir = self.dir_for(user_id);
        match tokio::fs::try_exists(&dir).await {
            Ok(exists) => exists,
            Err(err) => {
                warn!(
                    user_id = %user_id,
                    path = %dir.display(),
                    %err,
                    "credentials: existence check failed; treating as absent"
                );
                false
            }
        }
    }

    pub async fn purge(&self, user_id: &UserId) -> io::Result<bool> {
        match tokio::fs::remove_dir_all(self.dir_for(user_id)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }
}
