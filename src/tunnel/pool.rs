//! Process-wide local port leases

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{Result, SshElevateError};

/// Set of local ports currently leased by tunnels
///
/// Leasing scans upward from a floor, skipping leased ports and ports that
/// cannot be bound, inside one critical section so concurrent tunnels never
/// race for the same port.
#[derive(Debug, Default)]
pub struct PortLeasePool {
    leased: Mutex<BTreeSet<u16>>,
}

static GLOBAL_POOL: OnceLock<Arc<PortLeasePool>> = OnceLock::new();

impl PortLeasePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// The pool shared by every tunnel in this process
    pub fn global() -> Arc<PortLeasePool> {
        GLOBAL_POOL
            .get_or_init(|| Arc::new(PortLeasePool::new()))
            .clone()
    }

    /// Lease the first free port at or above `floor` and bind it on loopback
    ///
    /// The listener is returned in non-blocking mode, ready for tokio.
    pub fn lease(
        self: &Arc<Self>,
        floor: u16,
        connection: &str,
    ) -> Result<(PortLease, TcpListener)> {
        let mut leased = self.leased.lock();
        for port in floor..=u16::MAX {
            if leased.contains(&port) {
                continue;
            }
            match TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
                Ok(listener) => {
                    listener
                        .set_nonblocking(true)
                        .map_err(|e| SshElevateError::io(connection, e))?;
                    leased.insert(port);
                    debug!("Leased local port {} for {}", port, connection);
                    return Ok((
                        PortLease {
                            pool: self.clone(),
                            port,
                        },
                        listener,
                    ));
                }
                Err(e) => trace!("Local port {} unavailable: {}", port, e),
            }
        }
        Err(SshElevateError::PortExhausted {
            connection: connection.to_string(),
            floor,
        })
    }

    pub fn is_leased(&self, port: u16) -> bool {
        self.leased.lock().contains(&port)
    }

    pub fn leased_count(&self) -> usize {
        self.leased.lock().len()
    }

    fn release(&self, port: u16) {
        if self.leased.lock().remove(&port) {
            debug!("Returned local port {}", port);
        }
    }
}

/// A leased port, returned to its pool on drop
#[derive(Debug)]
pub struct PortLease {
    pool: Arc<PortLeasePool>,
    port: u16,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.pool.release(self.port);
    }
}
