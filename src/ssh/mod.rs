//! SSH connection module
//!
//! Command line processing, elevation strategies, password injection, file
//! access strategies and the russh transport, assembled into
//! [`SshConnection`]s by the [`ConnectionOrchestrator`].

pub mod access;
pub mod cmdline;
pub mod command;
pub mod config;
pub mod connection;
pub mod elevation;
pub mod escape;
pub mod file;
pub mod handler;
pub mod injector;
pub mod orchestrator;
pub mod processor;
pub mod session;
pub mod sftp;
pub mod shell;
pub mod staging;
pub mod tempdir;
pub mod transport;

// Re-exports
pub use access::{FileAccess, PlainFileAccess};
pub use cmdline::{CommandArgument, CommandLine, NOCD_PSEUDO_COMMAND, NOELEVATION_PSEUDO_COMMAND};
pub use command::{CommandOutput, RemoteExecutor};
pub use config::{
    ConnectionSpec, ConnectionSpecBuilder, ConnectionType, ElevationKind, LocalPortForward,
    OsFamily, PtySpec,
};
pub use connection::SshConnection;
pub use elevation::ElevationStrategy;
pub use file::{RemoteFile, RemoteFileWriter};
pub use handler::SshHandler;
pub use injector::ElevationPasswordInjector;
pub use orchestrator::{ConnectionOrchestrator, FileAccessKind};
pub use processor::CommandLineProcessor;
pub use session::{RusshConnector, RusshSession};
pub use staging::StagedFileAccess;
pub use transport::{FileTransfer, RemoteProcess, SessionConnector, TransportSession};
