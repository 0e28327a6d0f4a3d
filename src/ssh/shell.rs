//! File transfer over exec-based shell helpers
//!
//! Used where the SFTP subsystem is not: plain `scp` connections and the
//! unprivileged side of elevated connections. Every helper runs as the
//! connecting identity (`NOELEVATION`) without entering the working directory
//! (`NOCD`), and without a PTY so file bytes and end of input pass unchanged.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::task::JoinHandle;
use tracing::debug;

use super::cmdline::{CommandLine, NOCD_PSEUDO_COMMAND, NOELEVATION_PSEUDO_COMMAND};
use super::command::RemoteExecutor;
use super::transport::{
    BoxedReader, BoxedWriter, ExitStatus, FileStat, FileTransfer, RemoteProcess, StdinWriter,
};
use crate::error::Result;

/// [`FileTransfer`] built from `cat`, `test`, `ls`, `mkdir`, `rm`, `mv` and
/// `chmod`
#[derive(Clone)]
pub struct ShellTransfer {
    executor: RemoteExecutor,
}

impl ShellTransfer {
    pub fn new(executor: RemoteExecutor) -> Self {
        Self {
            executor: executor.without_pty(),
        }
    }

    fn helper<I, S>(args: I) -> CommandLine
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandLine::build(args)
            .with_pseudo_command(NOELEVATION_PSEUDO_COMMAND)
            .with_pseudo_command(NOCD_PSEUDO_COMMAND)
    }

    async fn run(&self, cmd: CommandLine) -> Result<()> {
        self.executor.execute_checked(&cmd, None).await.map(|_| ())
    }

    async fn test(&self, flag: &str, path: &str) -> Result<bool> {
        let output = self
            .executor
            .execute(&Self::helper(["test", flag, path]), None)
            .await?;
        Ok(output.success())
    }
}

/// Waits for a helper process and turns a non-zero exit into an IO error
fn watch_exit(
    name: String,
    stdout: Option<BoxedReader>,
    mut stderr: BoxedReader,
    exit_status: ExitStatus,
) -> JoinHandle<io::Result<()>> {
    tokio::spawn(async move {
        let mut err = String::new();
        let drain_stdout = async {
            if let Some(mut stdout) = stdout {
                let _ = tokio::io::copy(&mut stdout, &mut tokio::io::sink()).await;
            }
        };
        let (_, read) = tokio::join!(drain_stdout, stderr.read_to_string(&mut err));
        if let Err(e) = read {
            debug!("Cannot read stderr of [{}]: {}", name, e);
        }
        match exit_status.await {
            0 => Ok(()),
            code => Err(io::Error::other(format!(
                "[{}] failed with exit code {}: {}",
                name,
                code,
                err.trim_end()
            ))),
        }
    })
}

/// Reads a helper's stdout, failing at end of stream if the helper failed
struct HelperReader {
    stdout: BoxedReader,
    exit: Option<JoinHandle<io::Result<()>>>,
}

impl AsyncRead for HelperReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        ready!(self.stdout.as_mut().poll_read(cx, buf))?;
        if buf.filled().len() > before || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        match self.exit.as_mut() {
            None => Poll::Ready(Ok(())),
            Some(exit) => {
                let result = ready!(Pin::new(exit).poll(cx));
                self.exit = None;
                Poll::Ready(result.unwrap_or_else(|e| Err(io::Error::other(e))))
            }
        }
    }
}

/// Feeds a helper's stdin, completing only once the helper succeeded
struct HelperWriter {
    stdin: StdinWriter,
    exit: Option<JoinHandle<io::Result<()>>>,
}

impl AsyncWrite for HelperWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stdin).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(Pin::new(&mut self.stdin).poll_shutdown(cx))?;
        match self.exit.as_mut() {
            None => Poll::Ready(Ok(())),
            Some(exit) => {
                let result = ready!(Pin::new(exit).poll(cx));
                self.exit = None;
                Poll::Ready(result.unwrap_or_else(|e| Err(io::Error::other(e))))
            }
        }
    }
}

#[async_trait]
impl FileTransfer for ShellTransfer {
    async fn open_read(&self, path: &str) -> Result<BoxedReader> {
        let cmd = Self::helper(["cat", path]);
        let RemoteProcess {
            stdin,
            stdout,
            stderr,
            exit_status,
        } = self.executor.start_process(&cmd, None).await?;
        let _ = stdin.close().await;
        let exit = watch_exit(cmd.to_string(), None, stderr, exit_status);
        Ok(Box::pin(HelperReader {
            stdout,
            exit: Some(exit),
        }))
    }

    async fn open_write(&self, path: &str) -> Result<BoxedWriter> {
        let cmd = Self::helper(["cat"]).raw(">").arg(path);
        let RemoteProcess {
            stdin,
            stdout,
            stderr,
            exit_status,
        } = self.executor.start_process(&cmd, None).await?;
        let exit = watch_exit(cmd.to_string(), Some(stdout), stderr, exit_status);
        Ok(Box::pin(HelperWriter {
            stdin: stdin.writer(),
            exit: Some(exit),
        }))
    }

    async fn stat(&self, path: &str) -> Result<Option<FileStat>> {
        if !self.test("-e", path).await? {
            return Ok(None);
        }
        Ok(Some(FileStat {
            is_directory: self.test("-d", path).await?,
            size: 0,
            mode: None,
        }))
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        let output = self
            .executor
            .execute_checked(&Self::helper(["ls", "-1A", path]), None)
            .await?;
        Ok(output
            .stdout
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn mkdir(&self, path: &str, mode: Option<u32>) -> Result<()> {
        let cmd = match mode {
            Some(mode) => {
                let mode = format!("{:o}", mode);
                Self::helper(["mkdir", "-m", mode.as_str(), path])
            }
            None => Self::helper(["mkdir", path]),
        };
        self.run(cmd).await
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        self.run(Self::helper(["rm", "-f", path])).await
    }

    async fn remove_dir(&self, path: &str) -> Result<()> {
        self.run(Self::helper(["rmdir", path])).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.run(Self::helper(["mv", from, to])).await
    }

    async fn set_mode(&self, path: &str, mode: u32) -> Result<()> {
        let mode = format!("{:o}", mode);
        self.run(Self::helper(["chmod", mode.as_str(), path])).await
    }
}
