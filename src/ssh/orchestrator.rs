//! Connection orchestration
//!
//! Turns a [`ConnectionSpec`] into an open [`SshConnection`]: picks the
//! elevation strategy and the file access strategy, opens the jump-host
//! chain, routes the session through it and binds the static port forwards.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::access::{FileAccess, PlainFileAccess};
use super::command::RemoteExecutor;
use super::config::{ConnectionSpec, ConnectionType, ElevationKind};
use super::connection::{FileSurface, SshConnection};
use super::elevation::{
    ElevationStrategy, InteractiveSudoElevation, NoElevation, SuElevation, SudoElevation,
};
use super::shell::ShellTransfer;
use super::staging::StagedFileAccess;
use super::tempdir::TempDirectory;
use super::transport::{SessionConnector, TransportSession};
use crate::error::{Result, SshElevateError};
use crate::tunnel::{Forwarder, PortLeasePool, TunnelConnection};

/// Mode of temporary directories on elevated connections
const ELEVATED_TEMP_DIRECTORY_MODE: u32 = 0o1777;

/// How a connection reaches files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAccessKind {
    /// No file access (tunnels)
    None,
    /// SFTP subsystem as the connecting identity
    Sftp,
    /// Exec-based shell helpers as the connecting identity
    Shell,
    /// Shell helpers plus elevated staging for non-temporary paths
    Staged,
}

/// Builds connections from specifications
pub struct ConnectionOrchestrator {
    connector: Arc<dyn SessionConnector>,
    pool: Arc<PortLeasePool>,
}

impl ConnectionOrchestrator {
    /// Orchestrator leasing tunnel ports from the process-wide pool
    pub fn new(connector: Arc<dyn SessionConnector>) -> Self {
        Self::with_pool(connector, PortLeasePool::global())
    }

    pub fn with_pool(connector: Arc<dyn SessionConnector>, pool: Arc<PortLeasePool>) -> Self {
        Self { connector, pool }
    }

    /// Elevation strategy for `spec`
    ///
    /// The elevation settings must agree with the connection type.
    pub fn elevation_strategy(spec: &ConnectionSpec) -> Result<Arc<dyn ElevationStrategy>> {
        let expected = spec.connection_type.elevation();
        if spec.elevation.kind != expected {
            return Err(SshElevateError::config(format!(
                "{}: elevation {:?} does not match connection type {}",
                spec,
                spec.elevation.kind,
                spec.connection_type.as_str()
            )));
        }
        Ok(match spec.elevation.kind {
            ElevationKind::None => Arc::new(NoElevation),
            ElevationKind::Sudo => Arc::new(SudoElevation::from_spec(spec)?),
            ElevationKind::InteractiveSudo => Arc::new(InteractiveSudoElevation::from_spec(spec)?),
            ElevationKind::Su => Arc::new(SuElevation::from_spec(spec)?),
        })
    }

    /// File access strategy for `spec`
    pub fn file_access_kind(spec: &ConnectionSpec) -> FileAccessKind {
        match spec.connection_type {
            ConnectionType::Tunnel => FileAccessKind::None,
            ConnectionType::Sftp => FileAccessKind::Sftp,
            ConnectionType::Scp => FileAccessKind::Shell,
            ConnectionType::Su | ConnectionType::Sudo | ConnectionType::InteractiveSudo => {
                if spec.stages_files() {
                    FileAccessKind::Staged
                } else {
                    FileAccessKind::Shell
                }
            }
        }
    }

    /// Open `spec` and every jump host it traverses
    pub async fn connect(&self, spec: ConnectionSpec) -> Result<SshConnection> {
        let spec = Arc::new(spec);
        Self::elevation_strategy(&spec)?;

        let mut hops = Vec::new();
        let mut next = spec.tunnel.as_deref();
        while let Some(hop) = next {
            hops.push(Arc::new(hop.clone()));
            next = hop.tunnel.as_deref();
        }
        hops.reverse();

        let mut jumps: Vec<SshConnection> = Vec::with_capacity(hops.len());
        for hop in hops {
            match self.open_via(hop, jumps.last()).await {
                Ok(jump) => jumps.push(jump),
                Err(e) => {
                    close_all(jumps).await;
                    return Err(e);
                }
            }
        }

        match self.open_via(spec, jumps.last()).await {
            Ok(mut connection) => {
                connection.set_jumps(jumps);
                Ok(connection)
            }
            Err(e) => {
                close_all(jumps).await;
                Err(e)
            }
        }
    }

    async fn open_via(
        &self,
        spec: Arc<ConnectionSpec>,
        via: Option<&SshConnection>,
    ) -> Result<SshConnection> {
        let (host, port) = match via {
            Some(jump) => {
                let addr = jump.map(&spec.host, spec.port).await?;
                debug!("Reaching {} through {} at {}", spec, jump, addr);
                (addr.ip().to_string(), addr.port())
            }
            None => (spec.host.clone(), spec.port),
        };

        let elevation = Self::elevation_strategy(&spec)?;
        let session = self.connector.connect(&spec, &host, port).await?;
        match self.assemble(spec, session.clone(), elevation).await {
            Ok(connection) => Ok(connection),
            Err(e) => {
                session.disconnect().await;
                Err(e)
            }
        }
    }

    async fn assemble(
        &self,
        spec: Arc<ConnectionSpec>,
        session: Arc<dyn TransportSession>,
        elevation: Arc<dyn ElevationStrategy>,
    ) -> Result<SshConnection> {
        let kind = Self::file_access_kind(&spec);
        let executor = (spec.connection_type != ConnectionType::Tunnel)
            .then(|| RemoteExecutor::new(spec.clone(), session.clone(), elevation));
        let files = match executor {
            Some(ref executor) => file_surface(&spec, &session, executor, kind).await?,
            None => None,
        };
        let tunnel = TunnelConnection::new(spec.clone(), session.clone(), self.pool.clone());

        let mut connection =
            SshConnection::new(spec.clone(), session.clone(), executor, files, tunnel);

        for forward in &spec.local_port_forwards {
            let bound = tokio::net::TcpListener::bind(("127.0.0.1", forward.local_port)).await;
            let result = match bound {
                Ok(listener) => {
                    Forwarder::spawn(
                        &spec.to_string(),
                        listener,
                        session.clone(),
                        &forward.remote_host,
                        forward.remote_port,
                    )
                    .await
                }
                Err(e) => Err(SshElevateError::io(&*spec, e)),
            };
            match result {
                Ok(forwarder) => connection.add_forward(forwarder),
                Err(e) => {
                    warn!(
                        "Cannot forward local port {} on {}: {}",
                        forward.local_port, spec, e
                    );
                    connection.close().await;
                    return Err(e);
                }
            }
        }

        info!("Opened {} with {:?} file access", spec, kind);
        Ok(connection)
    }
}

async fn file_surface(
    spec: &Arc<ConnectionSpec>,
    session: &Arc<dyn TransportSession>,
    executor: &RemoteExecutor,
    kind: FileAccessKind,
) -> Result<Option<FileSurface>> {
    let plain = match kind {
        FileAccessKind::None => return Ok(None),
        FileAccessKind::Sftp => PlainFileAccess::new(spec, session.open_file_transfer().await?),
        FileAccessKind::Shell | FileAccessKind::Staged => {
            PlainFileAccess::new(spec, Arc::new(ShellTransfer::new(executor.clone())))
        }
    };
    let plain: Arc<dyn FileAccess> = if spec.elevation.kind != ElevationKind::None {
        Arc::new(plain.with_temp_directory_mode(ELEVATED_TEMP_DIRECTORY_MODE))
    } else {
        Arc::new(plain)
    };

    let temp = Arc::new(TempDirectory::new(spec.clone(), plain.clone()));
    let access: Arc<dyn FileAccess> = if kind == FileAccessKind::Staged {
        Arc::new(StagedFileAccess::new(
            executor.clone(),
            plain,
            temp.clone(),
        ))
    } else {
        plain
    };
    Ok(Some(FileSurface { access, temp }))
}

async fn close_all(jumps: Vec<SshConnection>) {
    for jump in jumps.into_iter().rev() {
        jump.close().await;
    }
}
