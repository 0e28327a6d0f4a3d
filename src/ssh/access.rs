//! File access strategies
//!
//! [`FileAccess`] is the file surface of a connection. [`PlainFileAccess`]
//! works directly as the connecting identity over a [`FileTransfer`];
//! [`StagedFileAccess`](super::staging::StagedFileAccess) routes files owned
//! by the elevated identity through the connection's temporary directory.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::file::{RemoteFile, RemoteFileWriter};
use super::transport::{BoxedReader, FileTransfer};
use crate::error::{Result, SshElevateError};

/// Remote file operations of one connection
#[async_trait]
pub trait FileAccess: Send + Sync {
    /// Open `file` for reading
    async fn read(&self, file: &RemoteFile) -> Result<BoxedReader>;

    /// Open `file` for writing, creating or truncating it
    async fn write(&self, file: &RemoteFile) -> Result<RemoteFileWriter>;

    async fn exists(&self, file: &RemoteFile) -> Result<bool>;

    async fn is_directory(&self, file: &RemoteFile) -> Result<bool>;

    /// Entries of a directory
    async fn list(&self, dir: &RemoteFile) -> Result<Vec<RemoteFile>>;

    async fn mkdir(&self, dir: &RemoteFile) -> Result<()>;

    /// Create `dir` and any missing parents
    async fn mkdirs(&self, dir: &RemoteFile) -> Result<()>;

    /// Delete a file or an empty directory
    async fn delete(&self, file: &RemoteFile) -> Result<()>;

    async fn delete_recursively(&self, file: &RemoteFile) -> Result<()>;

    async fn rename(&self, from: &RemoteFile, to: &RemoteFile) -> Result<()>;

    async fn set_executable(&self, file: &RemoteFile, executable: bool) -> Result<()>;
}

/// File access as the connecting identity
pub struct PlainFileAccess {
    connection: String,
    transfer: Arc<dyn FileTransfer>,
    temp_directory_mode: Option<u32>,
}

impl PlainFileAccess {
    pub fn new(connection: impl ToString, transfer: Arc<dyn FileTransfer>) -> Self {
        Self {
            connection: connection.to_string(),
            transfer,
            temp_directory_mode: None,
        }
    }

    /// Explicit mode for directories created under the temporary directory
    ///
    /// Elevated connections use `1777` so both identities can populate them.
    pub fn with_temp_directory_mode(mut self, mode: u32) -> Self {
        self.temp_directory_mode = Some(mode);
        self
    }

    fn missing(&self, file: &RemoteFile) -> SshElevateError {
        SshElevateError::transport(&self.connection, format!("{} does not exist", file))
    }
}

#[async_trait]
impl FileAccess for PlainFileAccess {
    async fn read(&self, file: &RemoteFile) -> Result<BoxedReader> {
        debug!("Opening {} for reading on {}", file, self.connection);
        self.transfer.open_read(file.path()).await
    }

    async fn write(&self, file: &RemoteFile) -> Result<RemoteFileWriter> {
        debug!("Opening {} for writing on {}", file, self.connection);
        let inner = self.transfer.open_write(file.path()).await?;
        Ok(RemoteFileWriter::new(&self.connection, file.clone(), inner))
    }

    async fn exists(&self, file: &RemoteFile) -> Result<bool> {
        Ok(self.transfer.stat(file.path()).await?.is_some())
    }

    async fn is_directory(&self, file: &RemoteFile) -> Result<bool> {
        Ok(self
            .transfer
            .stat(file.path())
            .await?
            .is_some_and(|stat| stat.is_directory))
    }

    async fn list(&self, dir: &RemoteFile) -> Result<Vec<RemoteFile>> {
        let names = self.transfer.list(dir.path()).await?;
        Ok(names.iter().map(|name| dir.child(name)).collect())
    }

    async fn mkdir(&self, dir: &RemoteFile) -> Result<()> {
        let mode = if dir.is_temp_file() {
            self.temp_directory_mode
        } else {
            None
        };
        self.transfer.mkdir(dir.path(), mode).await
    }

    async fn mkdirs(&self, dir: &RemoteFile) -> Result<()> {
        let mut missing = Vec::new();
        let mut current = Some(dir.clone());
        while let Some(file) = current {
            if self.exists(&file).await? {
                break;
            }
            current = file.parent();
            missing.push(file);
        }
        for file in missing.iter().rev() {
            self.mkdir(file).await?;
        }
        Ok(())
    }

    async fn delete(&self, file: &RemoteFile) -> Result<()> {
        match self.transfer.stat(file.path()).await? {
            Some(stat) if stat.is_directory => self.transfer.remove_dir(file.path()).await,
            Some(_) => self.transfer.remove_file(file.path()).await,
            None => Err(self.missing(file)),
        }
    }

    async fn delete_recursively(&self, file: &RemoteFile) -> Result<()> {
        // Depth-first: collect every directory, then remove bottom-up.
        let mut dirs = Vec::new();
        let mut pending = vec![file.clone()];
        while let Some(current) = pending.pop() {
            match self.transfer.stat(current.path()).await? {
                Some(stat) if stat.is_directory => {
                    pending.extend(self.list(&current).await?);
                    dirs.push(current);
                }
                Some(_) => self.transfer.remove_file(current.path()).await?,
                None if current == *file => return Err(self.missing(file)),
                None => {}
            }
        }
        for dir in dirs.iter().rev() {
            self.transfer.remove_dir(dir.path()).await?;
        }
        Ok(())
    }

    async fn rename(&self, from: &RemoteFile, to: &RemoteFile) -> Result<()> {
        self.transfer.rename(from.path(), to.path()).await
    }

    async fn set_executable(&self, file: &RemoteFile, executable: bool) -> Result<()> {
        let stat = self
            .transfer
            .stat(file.path())
            .await?
            .ok_or_else(|| self.missing(file))?;
        let mode = stat.mode.unwrap_or(0o644);
        let mode = if executable {
            mode | 0o111
        } else {
            mode & !0o111
        };
        self.transfer.set_mode(file.path(), mode & 0o7777).await
    }
}
