//! SFTP subsystem file transfer

use async_trait::async_trait;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::FileAttributes;

use super::transport::{BoxedReader, BoxedWriter, FileStat, FileTransfer};
use crate::error::{Result, SshElevateError};

/// [`FileTransfer`] over an initialized SFTP session
pub struct SftpTransfer {
    connection: String,
    sftp: SftpSession,
}

impl SftpTransfer {
    pub fn new(connection: impl ToString, sftp: SftpSession) -> Self {
        Self {
            connection: connection.to_string(),
            sftp,
        }
    }

    fn error(&self, action: &str, path: &str, e: impl std::fmt::Display) -> SshElevateError {
        SshElevateError::transport(&self.connection, format!("{} {}: {}", action, path, e))
    }
}

#[async_trait]
impl FileTransfer for SftpTransfer {
    async fn open_read(&self, path: &str) -> Result<BoxedReader> {
        let file = self
            .sftp
            .open(path)
            .await
            .map_err(|e| self.error("Cannot open", path, e))?;
        Ok(Box::pin(file))
    }

    async fn open_write(&self, path: &str) -> Result<BoxedWriter> {
        let file = self
            .sftp
            .create(path)
            .await
            .map_err(|e| self.error("Cannot create", path, e))?;
        Ok(Box::pin(file))
    }

    async fn stat(&self, path: &str) -> Result<Option<FileStat>> {
        let exists = self
            .sftp
            .try_exists(path)
            .await
            .map_err(|e| self.error("Cannot stat", path, e))?;
        if !exists {
            return Ok(None);
        }
        let attrs = self
            .sftp
            .metadata(path)
            .await
            .map_err(|e| self.error("Cannot stat", path, e))?;
        Ok(Some(FileStat {
            is_directory: attrs.is_dir(),
            size: attrs.size.unwrap_or(0),
            mode: attrs.permissions.map(|mode| mode & 0o7777),
        }))
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        let entries = self
            .sftp
            .read_dir(path)
            .await
            .map_err(|e| self.error("Cannot list", path, e))?;
        Ok(entries
            .map(|entry| entry.file_name())
            .filter(|name| name != "." && name != "..")
            .collect())
    }

    async fn mkdir(&self, path: &str, mode: Option<u32>) -> Result<()> {
        self.sftp
            .create_dir(path)
            .await
            .map_err(|e| self.error("Cannot create directory", path, e))?;
        match mode {
            Some(mode) => self.set_mode(path, mode).await,
            None => Ok(()),
        }
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        self.sftp
            .remove_file(path)
            .await
            .map_err(|e| self.error("Cannot delete", path, e))
    }

    async fn remove_dir(&self, path: &str) -> Result<()> {
        self.sftp
            .remove_dir(path)
            .await
            .map_err(|e| self.error("Cannot delete directory", path, e))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.sftp
            .rename(from, to)
            .await
            .map_err(|e| self.error("Cannot rename", from, e))
    }

    async fn set_mode(&self, path: &str, mode: u32) -> Result<()> {
        let attrs = FileAttributes {
            permissions: Some(mode),
            ..Default::default()
        };
        self.sftp
            .set_metadata(path, attrs)
            .await
            .map_err(|e| self.error("Cannot change mode of", path, e))
    }
}
