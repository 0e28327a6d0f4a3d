//! ssh-elevate - Entry point
//!
//! Parses CLI arguments into a connection specification, opens the
//! connection (through any jump hosts), runs the requested subcommand and
//! closes everything again.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::io::AsyncWriteExt;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ssh_elevate::config::{Args, Command};
use ssh_elevate::error::{Result, SshElevateError};
use ssh_elevate::ssh::{
    CommandLine, ConnectionOrchestrator, ConnectionSpec, RusshConnector, SshConnection,
};

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr, stdout carries command output
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<u8> {
    let options = args.connection_options()?;
    let spec = ConnectionSpec::from_options(&options)?;

    info!("ssh-elevate v{} connecting to {}", env!("CARGO_PKG_VERSION"), spec);
    let orchestrator = ConnectionOrchestrator::new(Arc::new(RusshConnector::new()));
    let connection = orchestrator.connect(spec).await?;

    let result = dispatch(&connection, args.command).await;
    connection.close().await;
    result
}

async fn dispatch(connection: &SshConnection, command: Command) -> Result<u8> {
    match command {
        Command::Exec { workdir, args } => {
            connection.set_working_directory(workdir.as_deref());
            let output = connection.execute(&CommandLine::build(args)).await?;
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            Ok(u8::try_from(output.exit_code).unwrap_or(1))
        }
        Command::Get { remote, local } => {
            let file = connection.file(&remote)?;
            let mut reader = connection.files()?.read(&file).await?;
            let mut out = tokio::fs::File::create(&local)
                .await
                .map_err(|e| SshElevateError::io(connection, e))?;
            let copied = tokio::io::copy(&mut reader, &mut out)
                .await
                .map_err(|e| SshElevateError::io(connection, e))?;
            out.flush()
                .await
                .map_err(|e| SshElevateError::io(connection, e))?;
            info!("Copied {} bytes from {} to {}", copied, file, local.display());
            Ok(0)
        }
        Command::Put { local, remote } => {
            let file = connection.file(&remote)?;
            let mut input = tokio::fs::File::open(&local)
                .await
                .map_err(|e| SshElevateError::io(connection, e))?;
            let mut writer = connection.files()?.write(&file).await?;
            let copied = tokio::io::copy(&mut input, &mut writer)
                .await
                .map_err(|e| SshElevateError::io(connection, e))?;
            writer.close().await?;
            info!("Copied {} bytes from {} to {}", copied, local.display(), file);
            Ok(0)
        }
        Command::Forward { target } => {
            let (host, port) = target
                .rsplit_once(':')
                .and_then(|(host, port)| Some((host, port.parse::<u16>().ok()?)))
                .ok_or_else(|| {
                    SshElevateError::config(format!(
                        "Invalid forward target '{}', expected remoteHost:remotePort",
                        target
                    ))
                })?;
            let addr = connection.map(host, port).await?;
            println!("{}", addr);
            info!("Forwarding {} to {}:{}, press Ctrl+C to stop", addr, host, port);
            shutdown_signal().await;
            Ok(0)
        }
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), shutting down...");
        }
        _ = async {
            #[cfg(unix)]
            {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                    }
                    Err(e) => {
                        error!("Failed to register SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}
