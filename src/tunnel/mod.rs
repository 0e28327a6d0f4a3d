//! Jump-host tunnels
//!
//! A [`TunnelConnection`] makes hosts behind an SSH server reachable from
//! this process: each `(remoteHost, remotePort)` pair is mapped once to a
//! leased local port with its own [`Forwarder`].

pub mod forwarder;
pub mod pool;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

pub use forwarder::Forwarder;
pub use pool::{PortLease, PortLeasePool};

use crate::error::{Result, SshElevateError};
use crate::ssh::config::ConnectionSpec;
use crate::ssh::transport::TransportSession;

struct PortForwardMapping {
    lease: PortLease,
    forwarder: Forwarder,
}

/// Port mappings through one SSH session
pub struct TunnelConnection {
    spec: Arc<ConnectionSpec>,
    session: Arc<dyn TransportSession>,
    pool: Arc<PortLeasePool>,
    mappings: Mutex<HashMap<(String, u16), PortForwardMapping>>,
}

impl TunnelConnection {
    pub fn new(
        spec: Arc<ConnectionSpec>,
        session: Arc<dyn TransportSession>,
        pool: Arc<PortLeasePool>,
    ) -> Self {
        Self {
            spec,
            session,
            pool,
            mappings: Mutex::new(HashMap::new()),
        }
    }

    /// Local address that reaches `remote_host:remote_port` through the session
    ///
    /// The first call for a pair leases a port and starts a forwarder; later
    /// calls return the same address.
    pub async fn map(&self, remote_host: &str, remote_port: u16) -> Result<SocketAddr> {
        let mut mappings = self.mappings.lock().await;
        let key = (remote_host.to_string(), remote_port);
        if let Some(mapping) = mappings.get(&key) {
            debug!(
                "Reusing {} for {}:{}",
                mapping.forwarder.local_addr(),
                remote_host,
                remote_port
            );
            return Ok(mapping.forwarder.local_addr());
        }

        let connection = self.spec.to_string();
        let (lease, listener) = self
            .pool
            .lease(self.spec.port_allocation_range_start, &connection)?;
        let listener = tokio::net::TcpListener::from_std(listener)
            .map_err(|e| SshElevateError::io(&connection, e))?;
        let forwarder = Forwarder::spawn(
            &connection,
            listener,
            self.session.clone(),
            remote_host,
            remote_port,
        )
        .await?;

        let addr = forwarder.local_addr();
        info!(
            "Mapped {}:{} to {} on {}",
            remote_host, remote_port, addr, connection
        );
        mappings.insert(key, PortForwardMapping { lease, forwarder });
        Ok(addr)
    }

    /// Number of live mappings
    pub async fn mapping_count(&self) -> usize {
        self.mappings.lock().await.len()
    }

    /// Close every forwarder, then return every leased port
    pub async fn close(&self) {
        let mappings: Vec<PortForwardMapping> =
            self.mappings.lock().await.drain().map(|(_, m)| m).collect();
        let mut leases = Vec::with_capacity(mappings.len());
        for mapping in mappings {
            mapping.forwarder.close().await;
            leases.push(mapping.lease);
        }
        drop(leases);
        debug!("Closed tunnel mappings on {}", self.spec);
    }
}
