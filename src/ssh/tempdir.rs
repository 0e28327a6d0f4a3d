//! Per-connection temporary directory

use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::access::FileAccess;
use super::config::ConnectionSpec;
use super::file::RemoteFile;
use crate::error::{Result, SshElevateError};

const TEMP_DIRECTORY_PREFIX: &str = "ssh-elevate-";

/// Lazily created directory holding a connection's temporary files
///
/// Created on first use under the configured temporary root with a random
/// name, through a [`FileAccess`] acting as the connecting identity.
pub struct TempDirectory {
    spec: Arc<ConnectionSpec>,
    access: Arc<dyn FileAccess>,
    dir: OnceCell<RemoteFile>,
}

impl TempDirectory {
    pub fn new(spec: Arc<ConnectionSpec>, access: Arc<dyn FileAccess>) -> Self {
        Self {
            spec,
            access,
            dir: OnceCell::new(),
        }
    }

    /// The directory, created if needed
    pub async fn directory(&self) -> Result<&RemoteFile> {
        self.dir
            .get_or_try_init(|| async {
                let root = RemoteFile::temp(&self.spec.temporary_directory, self.spec.os);
                let dir = root.child(&format!(
                    "{}{}",
                    TEMP_DIRECTORY_PREFIX,
                    Uuid::new_v4().simple()
                ));
                self.access.mkdir(&dir).await?;
                info!("Created temporary directory {} on {}", dir, self.spec);
                Ok::<_, SshElevateError>(dir)
            })
            .await
    }

    /// A fresh, not yet existing path in the directory
    ///
    /// The name keeps `hint` as suffix so staged copies remain recognizable.
    pub async fn temp_file(&self, hint: &str) -> Result<RemoteFile> {
        let dir = self.directory().await?;
        let hint = if hint.is_empty() { "tmp" } else { hint };
        let short = Uuid::new_v4().simple().to_string();
        Ok(dir.child(&format!("{}-{}", &short[..12], hint)))
    }

    /// Remove the directory if it was created and removal is configured
    ///
    /// Failures are logged, never raised.
    pub async fn cleanup(&self) {
        let Some(dir) = self.dir.get() else {
            return;
        };
        if !self.spec.delete_temporary_directory_on_disconnect {
            debug!("Keeping temporary directory {} on {}", dir, self.spec);
            return;
        }
        match self.access.delete_recursively(dir).await {
            Ok(()) => debug!("Removed temporary directory {} on {}", dir, self.spec),
            Err(e) => warn!(
                "Cannot remove temporary directory {} on {}: {}",
                dir, self.spec, e
            ),
        }
    }
}
