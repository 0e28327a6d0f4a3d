//! Command execution over SSH
//!
//! Provides the `CommandOutput` struct and the [`RemoteExecutor`], which
//! processes a logical command line, spawns it through the session and wires
//! up password injection for elevated commands under interactive elevation.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use super::cmdline::CommandLine;
use super::config::ConnectionSpec;
use super::elevation::ElevationStrategy;
use super::injector::{inject_password, ElevationPasswordInjector};
use super::processor::CommandLineProcessor;
use super::transport::{BoxedReader, RemoteProcess, TransportSession};
use crate::error::{Result, SshElevateError};

/// Output from a command execution
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Standard output from the command
    pub stdout: String,

    /// Standard error from the command
    pub stderr: String,

    /// Exit code of the command (-1 if the remote side reported none)
    pub exit_code: i32,
}

impl CommandOutput {
    /// Check if the command succeeded
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Get combined output (stdout + stderr)
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Spawns processed command lines on one session
#[derive(Clone)]
pub struct RemoteExecutor {
    spec: Arc<ConnectionSpec>,
    session: Arc<dyn TransportSession>,
    elevation: Arc<dyn ElevationStrategy>,
    processor: CommandLineProcessor,
    use_pty: bool,
}

impl RemoteExecutor {
    pub fn new(
        spec: Arc<ConnectionSpec>,
        session: Arc<dyn TransportSession>,
        elevation: Arc<dyn ElevationStrategy>,
    ) -> Self {
        let processor = CommandLineProcessor::new(spec.os, elevation.clone());
        if elevation.prompt_answer().is_some() && spec.pty.is_none() {
            warn!(
                "{} answers an elevation password prompt but allocates no PTY, the prompt may not be shown",
                spec
            );
        }
        Self {
            spec,
            session,
            elevation,
            processor,
            use_pty: true,
        }
    }

    /// An executor on the same session that never allocates a PTY
    ///
    /// For helpers that move file data through stdin and stdout, which a
    /// terminal line discipline would rewrite.
    pub fn without_pty(&self) -> Self {
        Self {
            use_pty: false,
            ..self.clone()
        }
    }

    pub fn spec(&self) -> &Arc<ConnectionSpec> {
        &self.spec
    }

    pub fn elevation(&self) -> &Arc<dyn ElevationStrategy> {
        &self.elevation
    }

    /// Process and spawn `cmd`
    ///
    /// When the command is elevated and the elevation answers a prompt, both
    /// output streams are scanned for the password prompt; the password is
    /// sent at most once per process.
    pub async fn start_process(
        &self,
        cmd: &CommandLine,
        working_dir: Option<&str>,
    ) -> Result<RemoteProcess> {
        self.spawn(cmd, working_dir).await.map(|(process, _)| process)
    }

    /// Spawn `cmd`, reporting whether a password injector was attached
    async fn spawn(
        &self,
        cmd: &CommandLine,
        working_dir: Option<&str>,
    ) -> Result<(RemoteProcess, bool)> {
        let prepared = self.processor.prepare(cmd, working_dir)?;
        let encoded = prepared.line.render(self.spec.os, false);
        info!("Starting command [{}] on {}", prepared.line, self.spec);

        let pty = self.spec.pty.as_ref().filter(|_| self.use_pty);
        let mut process = self.session.open_exec(&encoded, pty).await?;

        let answer = self.elevation.prompt_answer().filter(|_| prepared.elevated);
        if let Some(answer) = answer {
            let sent = Arc::new(AtomicBool::new(false));
            let stdout = std::mem::replace(&mut process.stdout, Box::pin(tokio::io::empty()));
            let stderr = std::mem::replace(&mut process.stderr, Box::pin(tokio::io::empty()));
            process.stdout = inject_password(
                stdout,
                process.stdin.clone(),
                ElevationPasswordInjector::new(answer.clone(), sent.clone()),
            );
            process.stderr = inject_password(
                stderr,
                process.stdin.clone(),
                ElevationPasswordInjector::new(answer.clone(), sent),
            );
        }

        Ok((process, answer.is_some()))
    }

    /// Execute `cmd` and capture its output
    ///
    /// Stdin is closed right away unless a password prompt may need an
    /// answer; stdout and stderr are drained concurrently.
    pub async fn execute(
        &self,
        cmd: &CommandLine,
        working_dir: Option<&str>,
    ) -> Result<CommandOutput> {
        let (process, injecting) = self.spawn(cmd, working_dir).await?;
        if !injecting {
            let _ = process.stdin.close().await;
        }
        let output = self.collect_output(process).await?;

        debug!(
            "Command completed: exit_code={}, stdout_len={}, stderr_len={}",
            output.exit_code,
            output.stdout.len(),
            output.stderr.len()
        );
        Ok(output)
    }

    /// Execute `cmd`, turning a non-zero exit into `RemoteCommandFailed`
    pub async fn execute_checked(
        &self,
        cmd: &CommandLine,
        working_dir: Option<&str>,
    ) -> Result<CommandOutput> {
        let output = self.execute(cmd, working_dir).await?;
        if !output.success() {
            return Err(SshElevateError::RemoteCommandFailed {
                connection: self.spec.to_string(),
                command: cmd.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim_end().to_string(),
            });
        }
        Ok(output)
    }

    async fn collect_output(&self, process: RemoteProcess) -> Result<CommandOutput> {
        let RemoteProcess {
            stdin,
            stdout,
            stderr,
            exit_status,
        } = process;

        let (stdout, stderr) = tokio::join!(read_all(stdout), read_all(stderr));
        let exit_code = exit_status.await;
        // Interactive elevation keeps stdin open for the prompt until the end.
        let _ = stdin.close().await;

        Ok(CommandOutput {
            stdout: stdout.map_err(|e| SshElevateError::io(&*self.spec, e))?,
            stderr: stderr.map_err(|e| SshElevateError::io(&*self.spec, e))?,
            exit_code,
        })
    }
}

async fn read_all(mut reader: BoxedReader) -> std::io::Result<String> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
