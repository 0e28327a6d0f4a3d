//! russh-backed transport
//!
//! [`RusshConnector`] dials and authenticates, [`RusshSession`] turns russh
//! channels into the [`TransportSession`] primitives: exec channels with
//! separate stdout/stderr pipes, the SFTP subsystem and `direct-tcpip`
//! streams.

use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::PrivateKeyWithHashAlg;
use russh::{ChannelMsg, Disconnect};
use russh_sftp::client::SftpSession;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use super::config::{ConnectionSpec, PtySpec};
use super::handler::SshHandler;
use super::sftp::SftpTransfer;
use super::transport::{
    BoxedStream, ExitStatus, FileTransfer, ProcessStdin, RemoteProcess, SessionConnector,
    StdinMessage, TransportSession,
};
use crate::error::{Result, SshElevateError};

/// Buffer size of the in-process pipes carrying command output
const PIPE_BUFFER: usize = 64 * 1024;

/// Opens [`RusshSession`]s
#[derive(Debug, Default, Clone)]
pub struct RusshConnector;

impl RusshConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SessionConnector for RusshConnector {
    async fn connect(
        &self,
        spec: &ConnectionSpec,
        host: &str,
        port: u16,
    ) -> Result<Arc<dyn TransportSession>> {
        let session = RusshSession::connect(spec, host, port).await?;
        Ok(Arc::new(session))
    }
}

/// An authenticated russh client session
pub struct RusshSession {
    connection: String,
    handle: Handle<SshHandler>,
}

impl RusshSession {
    /// Connect to `host:port` and authenticate per `spec`
    pub async fn connect(spec: &ConnectionSpec, host: &str, port: u16) -> Result<Self> {
        let connection = spec.to_string();
        info!("Connecting to {} via {}:{}...", connection, host, port);

        let handler = match spec.host_key_fingerprint {
            Some(ref fingerprint) => SshHandler::with_fingerprint(fingerprint),
            None => SshHandler::new(),
        };
        let ssh_config = Arc::new(client::Config::default());

        let connect_result = timeout(
            spec.connection_timeout,
            client::connect(ssh_config, (host, port), handler),
        )
        .await;

        let mut handle = match connect_result {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                error!("SSH connection to {} failed: {}", connection, e);
                return Err(SshElevateError::connect(&connection, e));
            }
            Err(_) => {
                error!(
                    "SSH connection to {} timed out after {:?}",
                    connection, spec.connection_timeout
                );
                return Err(SshElevateError::connect(
                    &connection,
                    format!("Connection timeout after {:?}", spec.connection_timeout),
                ));
            }
        };

        authenticate(&mut handle, spec, &connection).await?;
        info!("Connected to {}", connection);

        Ok(Self { connection, handle })
    }
}

/// Authenticate with the SSH server, password first, then key
async fn authenticate(
    handle: &mut Handle<SshHandler>,
    spec: &ConnectionSpec,
    connection: &str,
) -> Result<()> {
    if let Some(ref password) = spec.password {
        debug!("Attempting password authentication for user '{}'", spec.username);
        let auth_result = handle
            .authenticate_password(&spec.username, password)
            .await
            .map_err(|e| SshElevateError::connect(connection, e))?;

        if auth_result.success() {
            debug!("Password authentication successful");
            return Ok(());
        }
        if spec.private_key.is_none() {
            return Err(SshElevateError::connect(
                connection,
                "Password authentication rejected",
            ));
        }
        debug!("Password rejected, falling back to key authentication");
    }

    if let Some(ref key_content) = spec.private_key {
        debug!("Attempting key authentication for user '{}'", spec.username);
        let key = russh::keys::decode_secret_key(key_content, spec.passphrase.as_deref())
            .map_err(|e| {
                SshElevateError::connect(connection, format!("Failed to parse private key: {}", e))
            })?;
        let key_with_alg = PrivateKeyWithHashAlg::new(Arc::new(key), None);

        let auth_result = handle
            .authenticate_publickey(&spec.username, key_with_alg)
            .await
            .map_err(|e| SshElevateError::connect(connection, e))?;

        if auth_result.success() {
            debug!("Key authentication successful");
            return Ok(());
        }
        return Err(SshElevateError::connect(
            connection,
            "Key authentication rejected",
        ));
    }

    Err(SshElevateError::connect(
        connection,
        "No authentication method available (require password or private key)",
    ))
}

#[async_trait]
impl TransportSession for RusshSession {
    async fn open_exec(&self, command: &str, pty: Option<&PtySpec>) -> Result<RemoteProcess> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| {
                SshElevateError::transport(&self.connection, format!("Failed to open channel: {}", e))
            })?;

        if let Some(pty) = pty {
            channel
                .request_pty(true, &pty.term, pty.cols, pty.rows, pty.width, pty.height, &[])
                .await
                .map_err(|e| {
                    SshElevateError::transport(
                        &self.connection,
                        format!("Failed to request PTY: {}", e),
                    )
                })?;
        }

        channel.exec(true, command).await.map_err(|e| {
            SshElevateError::transport(&self.connection, format!("Failed to exec command: {}", e))
        })?;
        trace!("Exec channel open for [{}]", command);

        let (stdin, stdin_rx) = ProcessStdin::channel();
        let (stdout_tx, stdout) = tokio::io::duplex(PIPE_BUFFER);
        let (stderr_tx, stderr) = tokio::io::duplex(PIPE_BUFFER);
        let (status_tx, exit_status) = ExitStatus::channel();

        tokio::spawn(forward_stdin(channel.make_writer(), stdin_rx));
        tokio::spawn(pump_output(channel, stdout_tx, stderr_tx, status_tx));

        Ok(RemoteProcess {
            stdin,
            stdout: Box::pin(stdout),
            stderr: Box::pin(stderr),
            exit_status,
        })
    }

    async fn open_file_transfer(&self) -> Result<Arc<dyn FileTransfer>> {
        let channel = self.handle.channel_open_session().await.map_err(|e| {
            SshElevateError::transport(&self.connection, format!("Failed to open channel: {}", e))
        })?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| {
                SshElevateError::transport(
                    &self.connection,
                    format!("Failed to request SFTP subsystem: {}", e),
                )
            })?;
        let sftp = SftpSession::new(channel.into_stream()).await.map_err(|e| {
            SshElevateError::transport(
                &self.connection,
                format!("Failed to initialize SFTP session: {}", e),
            )
        })?;
        debug!("SFTP session open on {}", self.connection);
        Ok(Arc::new(SftpTransfer::new(&self.connection, sftp)))
    }

    async fn open_direct(&self, remote_host: &str, remote_port: u16) -> Result<BoxedStream> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(remote_host, u32::from(remote_port), "127.0.0.1", 0)
            .await
            .map_err(|e| {
                SshElevateError::transport(
                    &self.connection,
                    format!(
                        "Failed to open direct-tcpip channel to {}:{}: {}",
                        remote_host, remote_port, e
                    ),
                )
            })?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn disconnect(&self) {
        if self.handle.is_closed() {
            debug!("Session {} already closed", self.connection);
            return;
        }
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            warn!("Failed to disconnect {}: {}", self.connection, e);
        } else {
            info!("Disconnected from {}", self.connection);
        }
    }
}

async fn forward_stdin<W>(mut writer: W, mut rx: mpsc::Receiver<StdinMessage>)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let result = match message {
            StdinMessage::Data(data) => writer.write_all(&data).await,
            StdinMessage::Eof => {
                let _ = writer.shutdown().await;
                break;
            }
        };
        if let Err(e) = result {
            debug!("Remote stdin closed: {}", e);
            break;
        }
    }
}

async fn pump_output(
    mut channel: russh::Channel<client::Msg>,
    mut stdout: DuplexStream,
    mut stderr: DuplexStream,
    status: oneshot::Sender<i32>,
) {
    let mut status = Some(status);
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => {
                if stdout.write_all(&data).await.is_err() {
                    trace!("Stdout reader dropped");
                }
            }
            ChannelMsg::ExtendedData { data, ext } if ext == 1 => {
                if stderr.write_all(&data).await.is_err() {
                    trace!("Stderr reader dropped");
                }
            }
            ChannelMsg::ExitStatus { exit_status } => {
                if let Some(tx) = status.take() {
                    let _ = tx.send(exit_status as i32);
                }
            }
            ChannelMsg::Eof => {
                let _ = stdout.shutdown().await;
                let _ = stderr.shutdown().await;
            }
            ChannelMsg::Close => break,
            _ => {}
        }
    }
    // Dropping the pipes ends both readers; a missing status resolves to -1.
}
