//! Local port forwarder
//!
//! One accept loop per local listening socket. Every accepted connection gets
//! its own relay task that opens a `direct-tcpip` stream through the session
//! and copies bytes both ways until either side closes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SshElevateError};
use crate::ssh::transport::TransportSession;

/// Pause after a failed `accept`, e.g. while out of file descriptors
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A running forwarder
pub struct Forwarder {
    local_addr: SocketAddr,
    remote: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Forwarder {
    /// Start forwarding `listener` to `remote_host:remote_port`
    ///
    /// Returns once the accept loop is running, so the local address can be
    /// dialed right away.
    pub async fn spawn(
        connection: &str,
        listener: TcpListener,
        session: Arc<dyn TransportSession>,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<Self> {
        let local_addr = listener
            .local_addr()
            .map_err(|e| SshElevateError::io(connection, e))?;
        let remote = format!("{}:{}", remote_host, remote_port);
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();

        let handle = tokio::spawn(accept_loop(
            listener,
            session,
            remote_host.to_string(),
            remote_port,
            cancel.clone(),
            ready_tx,
        ));

        if ready_rx.await.is_err() {
            return Err(SshElevateError::transport(
                connection,
                format!("Forwarder for {} stopped before accepting", remote),
            ));
        }
        info!(
            "Forwarding {} to {} through {}",
            local_addr, remote, connection
        );

        Ok(Self {
            local_addr,
            remote,
            cancel,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop accepting, close the socket and end every relay
    pub async fn close(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("Forwarder for {} ended abnormally: {}", self.remote, e);
        }
        debug!("Closed forwarder {} -> {}", self.local_addr, self.remote);
    }
}

async fn accept_loop(
    listener: TcpListener,
    session: Arc<dyn TransportSession>,
    remote_host: String,
    remote_port: u16,
    cancel: CancellationToken,
    ready: oneshot::Sender<()>,
) {
    let _ = ready.send(());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    debug!("Accepted {} for {}:{}", peer, remote_host, remote_port);
                    tokio::spawn(relay(
                        socket,
                        session.clone(),
                        remote_host.clone(),
                        remote_port,
                        cancel.child_token(),
                    ));
                }
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    if !accept_backoff(&cancel).await {
                        break;
                    }
                }
            },
        }
    }
}

/// Wait before the next `accept`; `false` when cancelled meanwhile
async fn accept_backoff(cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => true,
    }
}

async fn relay(
    mut socket: TcpStream,
    session: Arc<dyn TransportSession>,
    remote_host: String,
    remote_port: u16,
    cancel: CancellationToken,
) {
    let mut stream = match session.open_direct(&remote_host, remote_port).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Cannot open channel to {}:{}: {}", remote_host, remote_port, e);
            return;
        }
    };
    tokio::select! {
        _ = cancel.cancelled() => {}
        result = tokio::io::copy_bidirectional(&mut socket, &mut stream) => match result {
            Ok((sent, received)) => debug!(
                "Relay to {}:{} done, {} bytes out, {} bytes in",
                remote_host, remote_port, sent, received
            ),
            Err(e) => debug!("Relay to {}:{} failed: {}", remote_host, remote_port, e),
        },
    }
}
