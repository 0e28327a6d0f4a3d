//! Remote file handles

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::warn;

use super::config::OsFamily;
use super::transport::BoxedWriter;
use crate::error::{Result, SshElevateError};

/// A path on the remote host
///
/// Temporary files live in the connection's temporary directory and are
/// always accessed as the connecting identity, bypassing staging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    path: String,
    is_temp_file: bool,
    os: OsFamily,
}

impl RemoteFile {
    pub fn new(path: impl Into<String>, os: OsFamily) -> Self {
        Self {
            path: path.into(),
            is_temp_file: false,
            os,
        }
    }

    pub(crate) fn temp(path: impl Into<String>, os: OsFamily) -> Self {
        Self {
            path: path.into(),
            is_temp_file: true,
            os,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_temp_file(&self) -> bool {
        self.is_temp_file
    }

    pub fn os(&self) -> OsFamily {
        self.os
    }

    /// Last path component
    pub fn name(&self) -> &str {
        let sep = self.os.file_separator();
        let trimmed = self.path.trim_end_matches(sep);
        trimmed.rsplit(sep).next().unwrap_or(trimmed)
    }

    /// Child entry, temp if this file is temp
    pub fn child(&self, name: &str) -> RemoteFile {
        let sep = self.os.file_separator();
        let path = if self.path.ends_with(sep) {
            format!("{}{}", self.path, name)
        } else {
            format!("{}{}{}", self.path, sep, name)
        };
        Self {
            path,
            is_temp_file: self.is_temp_file,
            os: self.os,
        }
    }

    /// Parent directory, `None` at the root
    pub fn parent(&self) -> Option<RemoteFile> {
        let sep = self.os.file_separator();
        let trimmed = self.path.trim_end_matches(sep);
        let index = trimmed.rfind(sep)?;
        let path = if index == 0 {
            sep.to_string()
        } else {
            trimmed[..index].to_string()
        };
        if path == self.path {
            return None;
        }
        Some(Self {
            path,
            is_temp_file: self.is_temp_file,
            os: self.os,
        })
    }
}

impl fmt::Display for RemoteFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// Work performed after a writer's data is durable
#[async_trait]
pub trait CommitOnClose: Send {
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Output stream for a remote file
///
/// Data is only guaranteed to reach its destination once [`close`] has
/// returned `Ok`; staged writes copy the temporary file into place there.
///
/// [`close`]: RemoteFileWriter::close
pub struct RemoteFileWriter {
    connection: String,
    target: RemoteFile,
    inner: BoxedWriter,
    commit: Option<Box<dyn CommitOnClose>>,
}

impl RemoteFileWriter {
    pub(crate) fn new(connection: impl ToString, target: RemoteFile, inner: BoxedWriter) -> Self {
        Self {
            connection: connection.to_string(),
            target,
            inner,
            commit: None,
        }
    }

    pub(crate) fn with_commit(mut self, commit: Box<dyn CommitOnClose>) -> Self {
        self.commit = Some(commit);
        self
    }

    pub fn target(&self) -> &RemoteFile {
        &self.target
    }

    /// Flush, close and commit
    pub async fn close(mut self) -> Result<()> {
        let connection = self.connection.clone();
        self.inner
            .shutdown()
            .await
            .map_err(|e| SshElevateError::io(&connection, e))?;
        match self.commit.take() {
            Some(commit) => commit.commit().await,
            None => Ok(()),
        }
    }
}

impl AsyncWrite for RemoteFileWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.inner.as_mut().poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.as_mut().poll_shutdown(cx)
    }
}

impl Drop for RemoteFileWriter {
    fn drop(&mut self) {
        if self.commit.is_some() {
            warn!(
                "Writer for {} on {} dropped without close, data was not copied into place",
                self.target, self.connection
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_and_parent() {
        let dir = RemoteFile::new("/var/log", OsFamily::Unix);
        let file = dir.child("syslog");
        assert_eq!(file.path(), "/var/log/syslog");
        assert_eq!(file.name(), "syslog");
        assert_eq!(file.parent(), Some(dir));

        let root = RemoteFile::new("/", OsFamily::Unix);
        assert_eq!(root.child("etc").path(), "/etc");
        assert_eq!(root.parent(), None);
        assert_eq!(
            RemoteFile::new("/etc", OsFamily::Unix).parent().unwrap().path(),
            "/"
        );
    }

    #[test]
    fn test_temp_flag_inherited() {
        let temp = RemoteFile::temp("/tmp/ssh-elevate-1", OsFamily::Unix);
        assert!(temp.child("x").is_temp_file());
        assert!(!RemoteFile::new("/etc", OsFamily::Unix).is_temp_file());
    }

    #[test]
    fn test_windows_paths() {
        let dir = RemoteFile::new("C:\\temp", OsFamily::Windows);
        assert_eq!(dir.child("a.txt").path(), "C:\\temp\\a.txt");
        assert_eq!(dir.child("a.txt").name(), "a.txt");
    }

    #[tokio::test]
    async fn test_close_runs_commit() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        struct Flag(Arc<AtomicBool>);

        #[async_trait]
        impl CommitOnClose for Flag {
            async fn commit(self: Box<Self>) -> Result<()> {
                self.0.store(true, Ordering::SeqCst);
                Ok(())
            }
        }

        let committed = Arc::new(AtomicBool::new(false));
        let mut writer = RemoteFileWriter::new(
            "ssh:sftp://alice@h:22",
            RemoteFile::new("/x", OsFamily::Unix),
            Box::pin(tokio::io::sink()),
        )
        .with_commit(Box::new(Flag(committed.clone())));
        writer.write_all(b"abc").await.unwrap();
        writer.close().await.unwrap();
        assert!(committed.load(Ordering::SeqCst));
    }
}
