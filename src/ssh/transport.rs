//! Transport collaborator interfaces
//!
//! The core never speaks the SSH protocol itself. It consumes an already
//! authenticated [`TransportSession`] that can spawn commands, open a file
//! transfer channel and open `direct-tcpip` streams. [`RusshSession`] is the
//! production implementation.
//!
//! [`RusshSession`]: super::session::RusshSession

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::PollSender;

use super::config::{ConnectionSpec, PtySpec};
use crate::error::Result;

/// Boxed byte source
pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

/// Boxed byte sink
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// A bidirectional byte stream
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DuplexStream for T {}

/// Boxed bidirectional stream, the result of a `direct-tcpip` open
pub type BoxedStream = Box<dyn DuplexStream>;

/// Message delivered to a remote process's standard input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdinMessage {
    Data(Vec<u8>),
    Eof,
}

/// Messages queued for one process's stdin before writers wait
const STDIN_QUEUE_DEPTH: usize = 16;

fn stdin_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "remote stdin is closed")
}

/// Cloneable handle to a remote process's standard input
///
/// Writes are delivered in order. The queue is bounded, so writers wait while
/// the transport is behind. The password injector holds a clone next to the
/// caller's handle.
#[derive(Debug, Clone)]
pub struct ProcessStdin {
    tx: mpsc::Sender<StdinMessage>,
}

impl ProcessStdin {
    /// Create a handle and the receiving end the transport drains
    pub fn channel() -> (Self, mpsc::Receiver<StdinMessage>) {
        let (tx, rx) = mpsc::channel(STDIN_QUEUE_DEPTH);
        (Self { tx }, rx)
    }

    /// Send bytes to the remote process
    pub async fn write(&self, data: impl Into<Vec<u8>>) -> io::Result<()> {
        self.tx
            .send(StdinMessage::Data(data.into()))
            .await
            .map_err(|_| stdin_closed())
    }

    /// Signal end of input
    pub async fn close(&self) -> io::Result<()> {
        self.tx
            .send(StdinMessage::Eof)
            .await
            .map_err(|_| stdin_closed())
    }

    /// Poll-based writer over the same queue
    pub fn writer(&self) -> StdinWriter {
        StdinWriter {
            tx: PollSender::new(self.tx.clone()),
            eof_sent: false,
        }
    }
}

/// [`AsyncWrite`] into a process's stdin
///
/// `poll_write` is pending until the queue has room. `poll_shutdown` sends
/// the end of input once.
pub struct StdinWriter {
    tx: PollSender<StdinMessage>,
    eof_sent: bool,
}

impl fmt::Debug for StdinWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdinWriter")
            .field("eof_sent", &self.eof_sent)
            .finish_non_exhaustive()
    }
}

impl StdinWriter {
    fn poll_send(&mut self, cx: &mut Context<'_>, message: StdinMessage) -> Poll<io::Result<()>> {
        ready!(self.tx.poll_reserve(cx)).map_err(|_| stdin_closed())?;
        self.tx.send_item(message).map_err(|_| stdin_closed())?;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for StdinWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.eof_sent {
            return Poll::Ready(Err(stdin_closed()));
        }
        ready!(this.poll_send(cx, StdinMessage::Data(data.to_vec())))?;
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.eof_sent {
            ready!(this.poll_send(cx, StdinMessage::Eof))?;
            this.eof_sent = true;
        }
        Poll::Ready(Ok(()))
    }
}

/// Exit status of a remote process, resolved when the process ends
///
/// Resolves to `-1` when the remote side reported no status (killed by a
/// signal, or the channel closed early).
pub struct ExitStatus {
    rx: oneshot::Receiver<i32>,
}

impl ExitStatus {
    /// Create a status and the sender the transport completes
    pub fn channel() -> (oneshot::Sender<i32>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }
}

impl Future for ExitStatus {
    type Output = i32;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<i32> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|status| status.unwrap_or(-1))
    }
}

impl fmt::Debug for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExitStatus").finish_non_exhaustive()
    }
}

/// A spawned remote process
pub struct RemoteProcess {
    pub stdin: ProcessStdin,
    pub stdout: BoxedReader,
    pub stderr: BoxedReader,
    pub exit_status: ExitStatus,
}

impl fmt::Debug for RemoteProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteProcess").finish_non_exhaustive()
    }
}

/// Metadata of a remote path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub is_directory: bool,
    pub size: u64,
    pub mode: Option<u32>,
}

/// File operations performed as the connecting identity
#[async_trait]
pub trait FileTransfer: Send + Sync {
    /// Open a file for reading
    async fn open_read(&self, path: &str) -> Result<BoxedReader>;

    /// Create or truncate a file for writing
    ///
    /// Data is durable once the writer's `shutdown` has completed.
    async fn open_write(&self, path: &str) -> Result<BoxedWriter>;

    /// Metadata of `path`, `None` if it does not exist
    async fn stat(&self, path: &str) -> Result<Option<FileStat>>;

    /// Names of the entries of a directory, without `.` and `..`
    async fn list(&self, path: &str) -> Result<Vec<String>>;

    /// Create a directory, optionally with an explicit mode
    async fn mkdir(&self, path: &str, mode: Option<u32>) -> Result<()>;

    async fn remove_file(&self, path: &str) -> Result<()>;

    async fn remove_dir(&self, path: &str) -> Result<()>;

    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    async fn set_mode(&self, path: &str, mode: u32) -> Result<()>;
}

/// An authenticated SSH session
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Spawn `command` on the remote host
    async fn open_exec(&self, command: &str, pty: Option<&PtySpec>) -> Result<RemoteProcess>;

    /// Open the SFTP subsystem
    async fn open_file_transfer(&self) -> Result<Arc<dyn FileTransfer>>;

    /// Open a stream to `remote_host:remote_port` as seen from the remote side
    async fn open_direct(&self, remote_host: &str, remote_port: u16) -> Result<BoxedStream>;

    /// Close the session
    async fn disconnect(&self);
}

/// Opens sessions
#[async_trait]
pub trait SessionConnector: Send + Sync {
    /// Connect and authenticate per `spec`, dialing `host:port`
    ///
    /// `host:port` differs from the spec's address when the connection is
    /// routed through a tunnel.
    async fn connect(
        &self,
        spec: &ConnectionSpec,
        host: &str,
        port: u16,
    ) -> Result<Arc<dyn TransportSession>>;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;

    use super::*;

    #[tokio::test]
    async fn test_stdin_queue_order() {
        let (stdin, mut rx) = ProcessStdin::channel();
        stdin.write(b"one".to_vec()).await.unwrap();
        stdin.write("two").await.unwrap();
        stdin.close().await.unwrap();

        assert_eq!(rx.recv().await, Some(StdinMessage::Data(b"one".to_vec())));
        assert_eq!(rx.recv().await, Some(StdinMessage::Data(b"two".to_vec())));
        assert_eq!(rx.recv().await, Some(StdinMessage::Eof));
    }

    #[tokio::test]
    async fn test_stdin_closed_receiver() {
        let (stdin, rx) = ProcessStdin::channel();
        drop(rx);
        let err = stdin.write("x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_stdin_writer_waits_for_room() {
        let (stdin, mut rx) = ProcessStdin::channel();
        let mut writer = stdin.writer();
        for _ in 0..STDIN_QUEUE_DEPTH {
            writer.write_all(b"chunk").await.unwrap();
        }

        let blocked = tokio::time::timeout(Duration::from_millis(50), writer.write_all(b"more")).await;
        assert!(blocked.is_err(), "write completed with a full queue");

        assert_eq!(rx.recv().await, Some(StdinMessage::Data(b"chunk".to_vec())));
        writer.write_all(b"last").await.unwrap();

        let drain = async {
            let mut rest = Vec::new();
            while let Some(message) = rx.recv().await {
                let eof = message == StdinMessage::Eof;
                rest.push(message);
                if eof {
                    break;
                }
            }
            rest
        };
        let (shutdown, rest) = tokio::join!(writer.shutdown(), drain);
        shutdown.unwrap();
        assert_eq!(rest.len(), STDIN_QUEUE_DEPTH + 1);
        assert_eq!(rest[STDIN_QUEUE_DEPTH - 1], StdinMessage::Data(b"last".to_vec()));
        assert_eq!(rest[STDIN_QUEUE_DEPTH], StdinMessage::Eof);
    }

    #[tokio::test]
    async fn test_exit_status_defaults_when_dropped() {
        let (tx, status) = ExitStatus::channel();
        drop(tx);
        assert_eq!(status.await, -1);

        let (tx, status) = ExitStatus::channel();
        tx.send(3).unwrap();
        assert_eq!(status.await, 3);
    }
}
