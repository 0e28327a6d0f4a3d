//! SSH connection
//!
//! An [`SshConnection`] bundles one authenticated session with the strategies
//! the orchestrator selected for it: the command executor (elevation), the
//! file surface (plain, shell helpers or staged), the temporary directory,
//! its tunnel mappings and the jump hosts it was reached through.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::access::FileAccess;
use super::cmdline::CommandLine;
use super::command::{CommandOutput, RemoteExecutor};
use super::config::{ConnectionSpec, ConnectionType};
use super::file::RemoteFile;
use super::tempdir::TempDirectory;
use super::transport::{RemoteProcess, TransportSession};
use crate::error::{Result, SshElevateError};
use crate::tunnel::{Forwarder, TunnelConnection};

/// File surface of a connection
pub(crate) struct FileSurface {
    pub(crate) access: Arc<dyn FileAccess>,
    pub(crate) temp: Arc<TempDirectory>,
}

/// An open SSH connection
///
/// Commands run through the elevation strategy chosen for the connection and
/// file operations through its file access strategy. Pure tunnel connections
/// offer neither and only map ports.
pub struct SshConnection {
    spec: Arc<ConnectionSpec>,
    session: Arc<dyn TransportSession>,
    executor: Option<RemoteExecutor>,
    files: Option<FileSurface>,
    working_dir: Mutex<Option<String>>,
    tunnel: TunnelConnection,
    forwards: Vec<Forwarder>,
    jumps: Vec<SshConnection>,
}

impl SshConnection {
    pub(crate) fn new(
        spec: Arc<ConnectionSpec>,
        session: Arc<dyn TransportSession>,
        executor: Option<RemoteExecutor>,
        files: Option<FileSurface>,
        tunnel: TunnelConnection,
    ) -> Self {
        Self {
            spec,
            session,
            executor,
            files,
            working_dir: Mutex::new(None),
            tunnel,
            forwards: Vec::new(),
            jumps: Vec::new(),
        }
    }

    pub(crate) fn add_forward(&mut self, forwarder: Forwarder) {
        self.forwards.push(forwarder);
    }

    /// Jump hosts, outermost first
    pub(crate) fn set_jumps(&mut self, jumps: Vec<SshConnection>) {
        self.jumps = jumps;
    }

    pub fn spec(&self) -> &Arc<ConnectionSpec> {
        &self.spec
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.spec.connection_type
    }

    /// Number of jump hosts this connection traverses
    pub fn jump_count(&self) -> usize {
        self.jumps.len()
    }

    /// Local addresses of the static `localPortForwards`
    pub fn forwarded_addresses(&self) -> Vec<std::net::SocketAddr> {
        self.forwards.iter().map(Forwarder::local_addr).collect()
    }

    /// Directory commands start in, `None` for the login directory
    pub fn working_directory(&self) -> Option<String> {
        self.working_dir.lock().clone()
    }

    pub fn set_working_directory(&self, dir: Option<&str>) {
        *self.working_dir.lock() = dir.map(str::to_string);
    }

    fn executor(&self, operation: &str) -> Result<&RemoteExecutor> {
        self.executor
            .as_ref()
            .ok_or_else(|| SshElevateError::unsupported(&*self.spec, operation))
    }

    fn surface(&self, operation: &str) -> Result<&FileSurface> {
        self.files
            .as_ref()
            .ok_or_else(|| SshElevateError::unsupported(&*self.spec, operation))
    }

    /// Run `cmd` in the working directory and capture its output
    pub async fn execute(&self, cmd: &CommandLine) -> Result<CommandOutput> {
        let working_dir = self.working_directory();
        self.executor("Command execution")?
            .execute(cmd, working_dir.as_deref())
            .await
    }

    /// Like [`execute`](Self::execute), failing on a non-zero exit code
    pub async fn execute_checked(&self, cmd: &CommandLine) -> Result<CommandOutput> {
        let working_dir = self.working_directory();
        self.executor("Command execution")?
            .execute_checked(cmd, working_dir.as_deref())
            .await
    }

    /// Spawn `cmd` and hand back its live streams
    pub async fn start_process(&self, cmd: &CommandLine) -> Result<RemoteProcess> {
        let working_dir = self.working_directory();
        self.executor("Process execution")?
            .start_process(cmd, working_dir.as_deref())
            .await
    }

    /// Handle to a remote path
    pub fn file(&self, path: &str) -> Result<RemoteFile> {
        self.surface("File access")?;
        Ok(RemoteFile::new(path, self.spec.os))
    }

    /// File operations of this connection
    pub fn files(&self) -> Result<&Arc<dyn FileAccess>> {
        Ok(&self.surface("File access")?.access)
    }

    /// A fresh path in the connection's temporary directory
    pub async fn temp_file(&self, hint: &str) -> Result<RemoteFile> {
        self.surface("Temporary files")?.temp.temp_file(hint).await
    }

    /// Local address reaching `remote_host:remote_port` through this connection
    pub async fn map(&self, remote_host: &str, remote_port: u16) -> Result<std::net::SocketAddr> {
        self.tunnel.map(remote_host, remote_port).await
    }

    /// Tear everything down
    ///
    /// The temporary directory is removed first while the session is still
    /// usable, then forwarders and tunnel mappings, then the session, then
    /// each jump host from the innermost outwards.
    pub async fn close(self) {
        info!("Closing {}", self.spec);
        if let Some(ref files) = self.files {
            files.temp.cleanup().await;
        }
        for forwarder in self.forwards {
            forwarder.close().await;
        }
        self.tunnel.close().await;
        self.session.disconnect().await;

        for jump in self.jumps.into_iter().rev() {
            debug!("Closing jump host {}", jump.spec);
            Box::pin(jump.close()).await;
        }
    }
}

impl fmt::Display for SshConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.spec, f)
    }
}

impl fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConnection")
            .field("spec", &self.spec.to_string())
            .field("jumps", &self.jumps.len())
            .finish_non_exhaustive()
    }
}
