//! Remote command lines
//!
//! A [`CommandLine`] is an ordered list of arguments, each tagged with how it
//! must reach the remote shell: literal arguments are quoted for the target
//! OS family, raw arguments (`|`, `;`, `>`) are inserted verbatim, password
//! arguments are quoted but masked when the line is logged, and nested
//! command lines are rendered and then quoted as a single argument.

use std::fmt;

use super::config::OsFamily;

/// Leading pseudo-command: do not prefix the command with `cd <workdir>`
pub const NOCD_PSEUDO_COMMAND: &str = "NOCD";

/// Leading pseudo-command: run the command as the connecting identity
pub const NOELEVATION_PSEUDO_COMMAND: &str = "NOELEVATION";

const MASKED_PASSWORD: &str = "********";

/// One argument of a [`CommandLine`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandArgument {
    Literal(String),
    Raw(String),
    Password(String),
    Nested(CommandLine),
}

impl CommandArgument {
    /// Render for the given OS family
    ///
    /// With `mask_passwords`, password arguments become `********`.
    pub fn render(&self, os: OsFamily, mask_passwords: bool) -> String {
        match self {
            CommandArgument::Literal(s) => os.quote(s),
            CommandArgument::Raw(s) => s.clone(),
            CommandArgument::Password(_) if mask_passwords => MASKED_PASSWORD.to_string(),
            CommandArgument::Password(s) => os.quote(s),
            CommandArgument::Nested(line) => os.quote(&line.render(os, mask_passwords)),
        }
    }

    /// Whether this is the raw token `token`
    pub fn is_raw(&self, token: &str) -> bool {
        matches!(self, CommandArgument::Raw(s) if s == token)
    }

    /// Whether this is the literal word `word`
    pub fn is_literal(&self, word: &str) -> bool {
        matches!(self, CommandArgument::Literal(s) if s == word)
    }
}

/// An ordered sequence of command arguments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandLine {
    args: Vec<CommandArgument>,
}

impl CommandLine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a command line of literal arguments
    ///
    /// ```
    /// use ssh_elevate::ssh::cmdline::CommandLine;
    /// use ssh_elevate::ssh::config::OsFamily;
    ///
    /// let cmd = CommandLine::build(["ls", "-l", "/var/log"]);
    /// assert_eq!(cmd.render(OsFamily::Unix, false), "ls -l /var/log");
    /// ```
    pub fn build<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut line = Self::new();
        for arg in args {
            line = line.arg(arg);
        }
        line
    }

    /// Append a literal argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(CommandArgument::Literal(arg.into()));
        self
    }

    /// Append a raw, unescaped token
    pub fn raw(mut self, token: impl Into<String>) -> Self {
        self.args.push(CommandArgument::Raw(token.into()));
        self
    }

    /// Append a password argument (masked in logs)
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.args.push(CommandArgument::Password(password.into()));
        self
    }

    /// Append a whole command line as one quoted argument
    pub fn nested(mut self, line: CommandLine) -> Self {
        self.args.push(CommandArgument::Nested(line));
        self
    }

    pub fn push(&mut self, arg: CommandArgument) {
        self.args.push(arg);
    }

    pub fn extend(&mut self, args: impl IntoIterator<Item = CommandArgument>) {
        self.args.extend(args);
    }

    /// Prepend a pseudo-command such as [`NOCD_PSEUDO_COMMAND`]
    pub fn with_pseudo_command(mut self, marker: &str) -> Self {
        self.args
            .insert(0, CommandArgument::Literal(marker.to_string()));
        self
    }

    pub fn arguments(&self) -> &[CommandArgument] {
        &self.args
    }

    pub fn into_arguments(self) -> Vec<CommandArgument> {
        self.args
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// Whether the first argument is the pseudo-command `marker`
    pub fn starts_with_pseudo_command(&self, marker: &str) -> bool {
        self.args.first().is_some_and(|arg| arg.is_literal(marker))
    }

    /// Render the full line for the given OS family
    pub fn render(&self, os: OsFamily, mask_passwords: bool) -> String {
        self.args
            .iter()
            .map(|arg| arg.render(os, mask_passwords))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Each argument rendered individually, passwords masked
    pub fn rendered_arguments(&self, os: OsFamily) -> Vec<String> {
        self.args.iter().map(|arg| arg.render(os, true)).collect()
    }
}

impl fmt::Display for CommandLine {
    /// Masked UNIX rendering, safe for logs and error messages
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(OsFamily::Unix, true))
    }
}
