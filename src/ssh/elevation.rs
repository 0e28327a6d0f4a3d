//! Privilege elevation strategies
//!
//! Each [`ElevationStrategy`] describes how a command is run as another OS
//! identity: the prefix tokens placed in front of it, whether the command is
//! wrapped as one nested argument, and whether a password must be typed at an
//! interactive prompt. The orchestrator picks one strategy per connection.

use std::fmt;
use std::sync::Arc;

use regex::Regex;
use tracing::warn;

use super::cmdline::CommandArgument;
use super::config::{ConnectionSpec, ElevationKind};
use crate::error::{Result, SshElevateError};

/// A compiled password prompt pattern
///
/// The pattern must match the whole prompt text, and its final character is
/// used as a cheap trigger before the regex is evaluated.
#[derive(Debug, Clone)]
pub struct PasswordPrompt {
    pattern: String,
    regex: Regex,
    final_byte: u8,
}

impl PasswordPrompt {
    /// Compile a prompt pattern
    ///
    /// # Examples
    ///
    /// ```
    /// use ssh_elevate::ssh::elevation::PasswordPrompt;
    ///
    /// let prompt = PasswordPrompt::new(".*[Pp]assword.*:").unwrap();
    /// assert!(prompt.is_match("[sudo] password for alice:"));
    /// assert!(!prompt.is_match("[sudo] password for alice: "));
    /// assert!(PasswordPrompt::new(".*assword.*").is_err());
    /// ```
    pub fn new(pattern: &str) -> Result<Self> {
        let final_byte = match pattern.as_bytes().last() {
            None => {
                return Err(SshElevateError::config(
                    "Password prompt regex must not be empty",
                ))
            }
            Some(b'*' | b'?' | b'+' | b'.') => {
                return Err(SshElevateError::config(format!(
                    "Password prompt regex '{}' must not end in a wildcard",
                    pattern
                )))
            }
            Some(b) => *b,
        };
        let regex = Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
            SshElevateError::config(format!("Invalid password prompt regex: {}", e))
        })?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
            final_byte,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Last byte of the pattern, the trigger for a full match attempt
    pub fn final_byte(&self) -> u8 {
        self.final_byte
    }

    /// Whether `text` matches the whole pattern
    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

/// Password typed when the prompt appears
#[derive(Clone)]
pub struct PromptAnswer {
    pub prompt: Arc<PasswordPrompt>,
    pub password: String,
}

impl fmt::Debug for PromptAnswer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromptAnswer")
            .field("prompt", &self.prompt.pattern())
            .field("password", &"********")
            .finish()
    }
}

/// How commands are elevated on one connection
pub trait ElevationStrategy: fmt::Debug + Send + Sync {
    fn kind(&self) -> ElevationKind;

    /// Identity commands run as, `None` without elevation
    fn elevated_user(&self) -> Option<&str> {
        None
    }

    /// Tokens inserted in front of every elevated command segment
    fn prefix(&self) -> Vec<CommandArgument> {
        Vec::new()
    }

    /// Wrap the command as one nested argument instead of prefixing segments
    fn quote_command(&self) -> bool {
        false
    }

    /// Password to type at the elevation prompt, if any
    fn prompt_answer(&self) -> Option<&PromptAnswer> {
        None
    }
}

/// Commands run as the connecting identity
#[derive(Debug, Default)]
pub struct NoElevation;

impl ElevationStrategy for NoElevation {
    fn kind(&self) -> ElevationKind {
        ElevationKind::None
    }
}

/// The parts shared by every elevated strategy
#[derive(Debug, Clone)]
struct ElevatedUser {
    user: String,
    prefix: Vec<String>,
    quote_command: bool,
}

impl ElevatedUser {
    fn from_spec(spec: &ConnectionSpec) -> Result<Self> {
        let elevation = &spec.elevation;
        let user = elevation
            .elevated_user
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                SshElevateError::config(format!("{}: missing elevated username", spec))
            })?;

        if !elevation.command_prefix.contains("{0}") {
            warn!(
                "Elevation command prefix '{}' does not contain {{0}}, the elevated user will not be passed",
                elevation.command_prefix
            );
        }

        let prefix = elevation
            .command_prefix
            .replace("{0}", &user)
            .split_whitespace()
            .map(str::to_string)
            .collect::<Vec<_>>();
        if prefix.is_empty() {
            return Err(SshElevateError::config(format!(
                "{}: elevation command prefix is empty",
                spec
            )));
        }

        Ok(Self {
            user,
            prefix,
            quote_command: elevation.quote_command,
        })
    }

    fn prefix_arguments(&self) -> Vec<CommandArgument> {
        self.prefix
            .iter()
            .cloned()
            .map(CommandArgument::Literal)
            .collect()
    }
}

fn prompt_answer(spec: &ConnectionSpec, password: Option<&String>) -> Result<PromptAnswer> {
    let password = password.cloned().ok_or_else(|| {
        SshElevateError::config(format!("{}: missing elevation password", spec))
    })?;
    Ok(PromptAnswer {
        prompt: Arc::new(PasswordPrompt::new(&spec.elevation.password_prompt_regex)?),
        password,
    })
}

/// Non-interactive `sudo` (passwordless sudoers entry)
#[derive(Debug)]
pub struct SudoElevation {
    elevated: ElevatedUser,
}

impl SudoElevation {
    pub fn from_spec(spec: &ConnectionSpec) -> Result<Self> {
        Ok(Self {
            elevated: ElevatedUser::from_spec(spec)?,
        })
    }
}

impl ElevationStrategy for SudoElevation {
    fn kind(&self) -> ElevationKind {
        ElevationKind::Sudo
    }

    fn elevated_user(&self) -> Option<&str> {
        Some(&self.elevated.user)
    }

    fn prefix(&self) -> Vec<CommandArgument> {
        self.elevated.prefix_arguments()
    }

    fn quote_command(&self) -> bool {
        self.elevated.quote_command
    }
}

/// `sudo` that asks for the connecting user's password
#[derive(Debug)]
pub struct InteractiveSudoElevation {
    elevated: ElevatedUser,
    answer: PromptAnswer,
}

impl InteractiveSudoElevation {
    pub fn from_spec(spec: &ConnectionSpec) -> Result<Self> {
        Ok(Self {
            elevated: ElevatedUser::from_spec(spec)?,
            answer: prompt_answer(spec, spec.password.as_ref())?,
        })
    }
}

impl ElevationStrategy for InteractiveSudoElevation {
    fn kind(&self) -> ElevationKind {
        ElevationKind::InteractiveSudo
    }

    fn elevated_user(&self) -> Option<&str> {
        Some(&self.elevated.user)
    }

    fn prefix(&self) -> Vec<CommandArgument> {
        self.elevated.prefix_arguments()
    }

    fn quote_command(&self) -> bool {
        self.elevated.quote_command
    }

    fn prompt_answer(&self) -> Option<&PromptAnswer> {
        Some(&self.answer)
    }
}

/// `su` that asks for the elevated user's password
#[derive(Debug)]
pub struct SuElevation {
    elevated: ElevatedUser,
    answer: PromptAnswer,
}

impl SuElevation {
    pub fn from_spec(spec: &ConnectionSpec) -> Result<Self> {
        Ok(Self {
            elevated: ElevatedUser::from_spec(spec)?,
            answer: prompt_answer(spec, spec.elevation.password.as_ref())?,
        })
    }
}

impl ElevationStrategy for SuElevation {
    fn kind(&self) -> ElevationKind {
        ElevationKind::Su
    }

    fn elevated_user(&self) -> Option<&str> {
        Some(&self.elevated.user)
    }

    fn prefix(&self) -> Vec<CommandArgument> {
        self.elevated.prefix_arguments()
    }

    fn quote_command(&self) -> bool {
        self.elevated.quote_command
    }

    fn prompt_answer(&self) -> Option<&PromptAnswer> {
        Some(&self.answer)
    }
}
