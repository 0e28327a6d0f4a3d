//! ssh-elevate - remote commands and files over SSH, with su/sudo elevation
//!
//! This crate runs commands and moves files on remote hosts reached over SSH,
//! including hosts where the authenticated user must elevate to another
//! identity and hosts reachable only through jump hosts.
//!
//! # Features
//!
//! - Command line rewriting: `cd` prefixes, per-segment `sudo`/`su` prefixes,
//!   quoted nested commands, `NOCD`/`NOELEVATION` pseudo-commands
//! - Answers `su` and interactive `sudo` password prompts in the output stream
//! - Elevated file access staged through a sticky, world-writable temp directory
//! - Jump-host tunnels with process-wide local port leases
//!
//! # Example Usage (CLI)
//!
//! ```bash
//! ssh-elevate --host=db --user=alice --password=secret --type=sudo \
//!   -o sudoUsername=root exec -- ls -la /root
//! ```
//!
//! # Example Usage (library)
//!
//! ```no_run
//! # async fn demo() -> ssh_elevate::Result<()> {
//! use std::sync::Arc;
//! use ssh_elevate::ssh::{
//!     CommandLine, ConnectionOrchestrator, ConnectionSpec, ConnectionType, RusshConnector,
//! };
//!
//! let spec = ConnectionSpec::builder(ConnectionType::Sudo, "db", "alice")
//!     .with_password("secret")
//!     .with_elevated_user("root")
//!     .build()?;
//! let orchestrator = ConnectionOrchestrator::new(Arc::new(RusshConnector::new()));
//! let connection = orchestrator.connect(spec).await?;
//! let output = connection.execute(&CommandLine::build(["id", "-un"])).await?;
//! assert_eq!(output.stdout.trim(), "root");
//! connection.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod ssh;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use config::{Args, ConnectionOptions};
pub use error::{Result, SshElevateError};
pub use ssh::{
    CommandLine, CommandOutput, ConnectionOrchestrator, ConnectionSpec, ConnectionType,
    RusshConnector, SshConnection,
};
pub use tunnel::{PortLeasePool, TunnelConnection};
