//! Command line rewriting
//!
//! Turns the logical command a caller asks for into the exact command line
//! sent to the remote shell: the working directory is entered, and the
//! command is prefixed with the connection's elevation template.

use std::sync::Arc;

use tracing::trace;

use super::cmdline::{
    CommandArgument, CommandLine, NOCD_PSEUDO_COMMAND, NOELEVATION_PSEUDO_COMMAND,
};
use super::config::{ElevationKind, OsFamily};
use super::elevation::ElevationStrategy;
use crate::error::{Result, SshElevateError};

/// A processed command line
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedCommand {
    pub line: CommandLine,
    /// Whether the elevation prefix was applied
    pub elevated: bool,
}

/// Rewrites command lines for one connection
///
/// A line must be processed exactly once, right before it is spawned.
/// Processing an already processed line elevates it a second time.
#[derive(Debug, Clone)]
pub struct CommandLineProcessor {
    os: OsFamily,
    elevation: Arc<dyn ElevationStrategy>,
}

impl CommandLineProcessor {
    pub fn new(os: OsFamily, elevation: Arc<dyn ElevationStrategy>) -> Self {
        Self { os, elevation }
    }

    /// Produce the remote command line for `cmd`
    pub fn process(&self, cmd: &CommandLine, working_dir: Option<&str>) -> Result<CommandLine> {
        self.prepare(cmd, working_dir).map(|prepared| prepared.line)
    }

    /// Produce the remote command line for `cmd` and whether it is elevated
    ///
    /// 1. A leading `NOCD` is stripped and disables the `cd <workdir>` prefix.
    /// 2. A leading `NOELEVATION` is stripped and disables elevation.
    /// 3. With elevation and `quote_command`, the `cd` segment and the command
    ///    become one nested argument behind the prefix, so the directory is
    ///    entered by the elevated shell.
    /// 4. Otherwise the prefix is placed before the command and after every
    ///    raw `|` or `;`, so each segment is elevated on its own, and the `cd`
    ///    segment goes in front unelevated.
    pub fn prepare(&self, cmd: &CommandLine, working_dir: Option<&str>) -> Result<PreparedCommand> {
        if cmd.is_empty() {
            return Err(SshElevateError::config("Cannot execute an empty command line"));
        }

        let mut args = cmd.arguments().to_vec();
        let mut no_cd = false;
        let mut no_elevation = false;
        loop {
            match args.first() {
                Some(arg) if !no_cd && arg.is_literal(NOCD_PSEUDO_COMMAND) => no_cd = true,
                Some(arg) if !no_elevation && arg.is_literal(NOELEVATION_PSEUDO_COMMAND) => {
                    no_elevation = true
                }
                _ => break,
            }
            args.remove(0);
        }
        if args.is_empty() {
            return Err(SshElevateError::config(format!(
                "Command line [{}] contains only pseudo-commands",
                cmd
            )));
        }

        let mut with_cd = CommandLine::new();
        if let Some(dir) = working_dir.filter(|_| !no_cd) {
            with_cd.push(CommandArgument::Literal("cd".to_string()));
            with_cd.push(CommandArgument::Literal(dir.to_string()));
            with_cd.push(CommandArgument::Raw(self.os.command_separator().to_string()));
        }

        let elevated = !no_elevation && self.elevation.kind() != ElevationKind::None;
        let line = if !elevated {
            with_cd.extend(args);
            with_cd
        } else if self.elevation.quote_command() {
            with_cd.extend(args);
            let mut quoted = CommandLine::new();
            quoted.extend(self.elevation.prefix());
            quoted.push(CommandArgument::Nested(with_cd));
            quoted
        } else {
            with_cd.extend(self.prefix_segments(args));
            with_cd
        };

        trace!("Processed command line [{}] into [{}]", cmd, line);
        Ok(PreparedCommand { line, elevated })
    }

    fn prefix_segments(&self, args: Vec<CommandArgument>) -> Vec<CommandArgument> {
        let prefix = self.elevation.prefix();
        let count = args.len();
        let mut out = prefix.clone();
        for (i, arg) in args.into_iter().enumerate() {
            let separates = arg.is_raw("|") || arg.is_raw(";");
            out.push(arg);
            // A trailing separator starts no new segment.
            if separates && i + 1 < count {
                out.extend(prefix.iter().cloned());
            }
        }
        out
    }
}
