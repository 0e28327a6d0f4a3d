//! Answering interactive elevation prompts
//!
//! `su` and interactive `sudo` print a password prompt before any command
//! output. [`ElevationPasswordInjector`] watches the bytes of the first output
//! line and, when the buffered line matches the prompt pattern, writes the
//! password to the process's stdin. Every byte is still passed on to the
//! caller unchanged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::elevation::PromptAnswer;
use super::transport::{BoxedReader, ProcessStdin};

const PUMP_BUFFER_SIZE: usize = 8192;

/// Prompt detection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// Bytes are buffered and matched against the prompt
    ScanningFirstLine,
    /// A newline was seen, nothing is matched any more
    PassedFirstLine,
}

/// Prompt scanner for one output stream of one process
///
/// The `sent` flag is shared by all scanners of a process so the password is
/// written at most once even when both stdout and stderr show the prompt.
/// After a match, scanning continues to the end of the first line but a
/// repeated prompt is never answered again.
#[derive(Debug)]
pub struct ElevationPasswordInjector {
    answer: PromptAnswer,
    sent: Arc<AtomicBool>,
    state: ScanState,
    line: Vec<u8>,
}

impl ElevationPasswordInjector {
    pub fn new(answer: PromptAnswer, sent: Arc<AtomicBool>) -> Self {
        Self {
            answer,
            sent,
            state: ScanState::ScanningFirstLine,
            line: Vec::new(),
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Whether the password has been sent for this process
    pub fn password_sent(&self) -> bool {
        self.sent.load(Ordering::SeqCst)
    }

    /// Observe one output byte
    ///
    /// Returns the bytes to write to stdin (`password + "\r\n"`) when this
    /// byte completes a prompt that has not been answered yet.
    pub fn observe(&mut self, byte: u8) -> Option<Vec<u8>> {
        if self.state == ScanState::PassedFirstLine {
            return None;
        }

        self.line.push(byte);
        if byte == b'\n' {
            self.state = ScanState::PassedFirstLine;
            self.line = Vec::new();
            return None;
        }

        if byte != self.answer.prompt.final_byte() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.line);
        if !self.answer.prompt.is_match(&text) {
            return None;
        }
        if self.sent.swap(true, Ordering::SeqCst) {
            debug!("Password prompt [{}] seen again, already answered", text);
            return None;
        }

        debug!("Password prompt [{}] detected, sending password", text);
        let mut response = self.answer.password.clone().into_bytes();
        response.extend_from_slice(b"\r\n");
        Some(response)
    }
}

/// Pass `source` through an injector, answering the prompt on `stdin`
///
/// Spawns one pump task per stream. Failures to write the password are
/// logged and never interrupt the returned reader.
pub fn inject_password(
    mut source: BoxedReader,
    stdin: ProcessStdin,
    mut injector: ElevationPasswordInjector,
) -> BoxedReader {
    let (mut sink, reader) = tokio::io::duplex(PUMP_BUFFER_SIZE);

    tokio::spawn(async move {
        let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
        loop {
            let n = match source.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("Output stream ended with error: {}", e);
                    break;
                }
            };

            if injector.state() == ScanState::ScanningFirstLine {
                for &byte in &buf[..n] {
                    if let Some(response) = injector.observe(byte) {
                        if let Err(e) = stdin.write(response).await {
                            warn!("Cannot send elevation password: {}", e);
                        }
                    }
                }
            }

            if sink.write_all(&buf[..n]).await.is_err() {
                debug!("Output consumer went away, stopping password scan");
                break;
            }
        }
        let _ = sink.shutdown().await;
    });

    Box::pin(reader)
}
