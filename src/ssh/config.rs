//! Connection specification types
//!
//! A [`ConnectionSpec`] describes one SSH connection: where to connect, who to
//! authenticate as, which identity to elevate to and how, and which jump host
//! (if any) the connection must traverse. It is built once, validated by
//! [`ConnectionSpecBuilder::build`], and never mutated afterwards.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::escape::{escape_unix, escape_windows};
use crate::error::{Result, SshElevateError};

/// Default SSH port
pub const DEFAULT_PORT: u16 = 22;

/// Default password prompt pattern for interactive elevation
pub const DEFAULT_PASSWORD_PROMPT_REGEX: &str = ".*[Pp]assword.*:";

/// Default `sudo` prefix template, `{0}` is replaced by the elevated user
pub const DEFAULT_SUDO_COMMAND_PREFIX: &str = "sudo -u {0}";

/// Default `su` prefix template, `{0}` is replaced by the elevated user
pub const DEFAULT_SU_COMMAND_PREFIX: &str = "su - {0} -c";

/// PTY allocated when `allocateDefaultPty` is set
pub const DEFAULT_PTY: &str = "vt220:80:24:0:0";

/// First local port considered when leasing tunnel ports
pub const DEFAULT_PORT_ALLOCATION_RANGE_START: u16 = 1025;

/// Default connect timeout
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(120);

/// Operating system family of the remote host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OsFamily {
    #[default]
    Unix,
    Windows,
    Zos,
}

impl OsFamily {
    /// Separator placed between two commands on one line
    pub fn command_separator(self) -> &'static str {
        match self {
            OsFamily::Windows => "&&",
            OsFamily::Unix | OsFamily::Zos => ";",
        }
    }

    /// Path separator
    pub fn file_separator(self) -> char {
        match self {
            OsFamily::Windows => '\\',
            OsFamily::Unix | OsFamily::Zos => '/',
        }
    }

    /// Default root for connection temporary directories
    pub fn default_temporary_directory(self) -> &'static str {
        match self {
            OsFamily::Windows => "C:\\windows\\temp",
            OsFamily::Unix | OsFamily::Zos => "/tmp",
        }
    }

    /// Quote a literal argument for this family's shell
    pub fn quote(self, arg: &str) -> String {
        match self {
            OsFamily::Windows => escape_windows(arg),
            OsFamily::Unix | OsFamily::Zos => escape_unix(arg),
        }
    }

    /// Whether the family supports `su`/`sudo` elevation
    pub fn is_unix_like(self) -> bool {
        !matches!(self, OsFamily::Windows)
    }
}

impl FromStr for OsFamily {
    type Err = SshElevateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "UNIX" => Ok(OsFamily::Unix),
            "WINDOWS" => Ok(OsFamily::Windows),
            "ZOS" => Ok(OsFamily::Zos),
            other => Err(SshElevateError::config(format!(
                "Unknown operating system family: {}",
                other
            ))),
        }
    }
}

/// The kind of identity elevation applied to commands and files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElevationKind {
    None,
    Su,
    Sudo,
    InteractiveSudo,
}

/// Connection variant selected by the `connectionType` option
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    /// Plain connection, files over the SFTP subsystem
    Sftp,
    /// Plain connection, files over exec-based shell helpers
    Scp,
    Su,
    Sudo,
    InteractiveSudo,
    /// Jump host: port mapping only, no commands or files
    Tunnel,
}

impl ConnectionType {
    pub fn elevation(self) -> ElevationKind {
        match self {
            ConnectionType::Su => ElevationKind::Su,
            ConnectionType::Sudo => ElevationKind::Sudo,
            ConnectionType::InteractiveSudo => ElevationKind::InteractiveSudo,
            ConnectionType::Sftp | ConnectionType::Scp | ConnectionType::Tunnel => {
                ElevationKind::None
            }
        }
    }

    /// Lower-case name used in the connection's string form
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionType::Sftp => "sftp",
            ConnectionType::Scp => "scp",
            ConnectionType::Su => "su",
            ConnectionType::Sudo => "sudo",
            ConnectionType::InteractiveSudo => "interactive_sudo",
            ConnectionType::Tunnel => "tunnel",
        }
    }
}

impl FromStr for ConnectionType {
    type Err = SshElevateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "NONE" | "SFTP" => Ok(ConnectionType::Sftp),
            "SCP" => Ok(ConnectionType::Scp),
            "SU" => Ok(ConnectionType::Su),
            "SUDO" => Ok(ConnectionType::Sudo),
            "INTERACTIVE_SUDO" => Ok(ConnectionType::InteractiveSudo),
            "TUNNEL" => Ok(ConnectionType::Tunnel),
            other => Err(SshElevateError::config(format!(
                "Unknown connection type: {}",
                other
            ))),
        }
    }
}

/// Pseudo-terminal request, parsed from `term:cols:rows:width:height`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtySpec {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
    pub width: u32,
    pub height: u32,
}

impl FromStr for PtySpec {
    type Err = SshElevateError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        let invalid = || {
            SshElevateError::config(format!(
                "Invalid PTY specification '{}', expected term:cols:rows:width:height",
                s
            ))
        };
        if parts.len() != 5 || parts[0].is_empty() {
            return Err(invalid());
        }
        let num = |p: &str| p.parse::<u32>().map_err(|_| invalid());
        Ok(PtySpec {
            term: parts[0].to_string(),
            cols: num(parts[1])?,
            rows: num(parts[2])?,
            width: num(parts[3])?,
            height: num(parts[4])?,
        })
    }
}

/// A fixed `localPort:remoteHost:remotePort` forward
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPortForward {
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

impl LocalPortForward {
    /// Parse a comma-separated `localPort:remoteHost:remotePort[,...]` list
    pub fn parse_list(value: &str) -> Result<Vec<Self>> {
        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl FromStr for LocalPortForward {
    type Err = SshElevateError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            SshElevateError::config(format!(
                "Invalid port forward '{}', expected localPort:remoteHost:remotePort",
                s
            ))
        };
        let mut parts = s.split(':');
        let (Some(local), Some(host), Some(remote), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        if host.is_empty() {
            return Err(invalid());
        }
        Ok(LocalPortForward {
            local_port: local.parse().map_err(|_| invalid())?,
            remote_host: host.to_string(),
            remote_port: remote.parse().map_err(|_| invalid())?,
        })
    }
}

/// Elevation settings of a connection
#[derive(Debug, Clone)]
pub struct ElevationSpec {
    pub kind: ElevationKind,

    /// Identity commands run as after elevation
    pub elevated_user: Option<String>,

    /// Password typed at the elevation prompt (interactive variants only)
    pub password: Option<String>,

    /// Template prepended to commands, `{0}` → elevated user
    pub command_prefix: String,

    /// Pattern matched against the first output line to detect the prompt
    pub password_prompt_regex: String,

    /// Wrap the whole command as one nested argument behind the prefix
    pub quote_command: bool,

    /// `chmod -R go+rX` files written through staging
    pub override_umask: bool,

    /// `cp -p` when copying a staged temp file to its target
    pub preserve_attributes_on_copy_from_temp_file: bool,

    /// `cp -p` when copying a target into a staged temp file
    pub preserve_attributes_on_copy_to_temp_file: bool,
}

impl ElevationSpec {
    fn for_kind(kind: ElevationKind) -> Self {
        let (command_prefix, quote_command) = match kind {
            ElevationKind::Su => (DEFAULT_SU_COMMAND_PREFIX, true),
            _ => (DEFAULT_SUDO_COMMAND_PREFIX, false),
        };
        Self {
            kind,
            elevated_user: None,
            password: None,
            command_prefix: command_prefix.to_string(),
            password_prompt_regex: DEFAULT_PASSWORD_PROMPT_REGEX.to_string(),
            quote_command,
            override_umask: true,
            preserve_attributes_on_copy_from_temp_file: true,
            preserve_attributes_on_copy_to_temp_file: true,
        }
    }
}

/// Immutable description of one SSH connection
#[derive(Debug, Clone)]
pub struct ConnectionSpec {
    pub connection_type: ConnectionType,
    pub os: OsFamily,

    /// Remote hostname or IP address
    pub host: String,

    /// SSH port (default: 22)
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Password for password authentication
    pub password: Option<String>,

    /// Private key content (not path!) for key authentication
    pub private_key: Option<String>,

    /// Passphrase protecting `private_key`
    pub passphrase: Option<String>,

    /// Expected `SHA256:` fingerprint of the server's host key
    pub host_key_fingerprint: Option<String>,

    pub elevation: ElevationSpec,
    pub pty: Option<PtySpec>,
    pub local_port_forwards: Vec<LocalPortForward>,
    pub port_allocation_range_start: u16,
    pub temporary_directory: String,
    pub delete_temporary_directory_on_disconnect: bool,
    pub connection_timeout: Duration,

    /// Jump host this connection must traverse
    pub tunnel: Option<Box<ConnectionSpec>>,
}

impl ConnectionSpec {
    /// Start building a specification
    pub fn builder(
        connection_type: ConnectionType,
        host: impl Into<String>,
        username: impl Into<String>,
    ) -> ConnectionSpecBuilder {
        ConnectionSpecBuilder::new(connection_type, host, username)
    }

    pub fn elevation_kind(&self) -> ElevationKind {
        self.elevation.kind
    }

    /// Whether files owned by the elevated identity must be staged
    pub fn stages_files(&self) -> bool {
        self.elevation.kind != ElevationKind::None
            && self
                .elevation
                .elevated_user
                .as_deref()
                .is_some_and(|user| user != self.username)
    }
}

impl fmt::Display for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ssh:{}://{}", self.connection_type.as_str(), self.username)?;
        if self.elevation.kind != ElevationKind::None {
            if let Some(ref user) = self.elevation.elevated_user {
                write!(f, ":{}", user)?;
            }
        }
        write!(f, "@{}:{}", self.host, self.port)
    }
}

/// Builder for [`ConnectionSpec`]
#[derive(Debug, Clone)]
pub struct ConnectionSpecBuilder {
    spec: ConnectionSpec,
    allocate_default_pty: bool,
}

impl ConnectionSpecBuilder {
    /// Create a builder with minimal required fields
    pub fn new(
        connection_type: ConnectionType,
        host: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        let os = OsFamily::default();
        Self {
            spec: ConnectionSpec {
                connection_type,
                os,
                host: host.into(),
                port: DEFAULT_PORT,
                username: username.into(),
                password: None,
                private_key: None,
                passphrase: None,
                host_key_fingerprint: None,
                elevation: ElevationSpec::for_kind(connection_type.elevation()),
                pty: None,
                local_port_forwards: Vec::new(),
                port_allocation_range_start: DEFAULT_PORT_ALLOCATION_RANGE_START,
                temporary_directory: os.default_temporary_directory().to_string(),
                delete_temporary_directory_on_disconnect: true,
                connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
                tunnel: None,
            },
            allocate_default_pty: false,
        }
    }

    /// Set the SSH port
    pub fn with_port(mut self, port: u16) -> Self {
        self.spec.port = port;
        self
    }

    /// Set the remote operating system family
    ///
    /// Resets the temporary directory root to the family's default.
    pub fn with_os(mut self, os: OsFamily) -> Self {
        self.spec.os = os;
        self.spec.temporary_directory = os.default_temporary_directory().to_string();
        self
    }

    /// Set password authentication
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.spec.password = Some(password.into());
        self
    }

    /// Set private key authentication (key content, not path)
    pub fn with_private_key(mut self, key: impl Into<String>) -> Self {
        self.spec.private_key = Some(key.into());
        self
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.spec.passphrase = Some(passphrase.into());
        self
    }

    pub fn with_host_key_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.spec.host_key_fingerprint = Some(fingerprint.into());
        self
    }

    /// Set the identity commands are elevated to
    pub fn with_elevated_user(mut self, user: impl Into<String>) -> Self {
        self.spec.elevation.elevated_user = Some(user.into());
        self
    }

    /// Set the password answered at the `su` prompt
    pub fn with_elevation_password(mut self, password: impl Into<String>) -> Self {
        self.spec.elevation.password = Some(password.into());
        self
    }

    pub fn with_command_prefix(mut self, template: impl Into<String>) -> Self {
        self.spec.elevation.command_prefix = template.into();
        self
    }

    pub fn with_password_prompt_regex(mut self, regex: impl Into<String>) -> Self {
        self.spec.elevation.password_prompt_regex = regex.into();
        self
    }

    pub fn with_quote_command(mut self, quote: bool) -> Self {
        self.spec.elevation.quote_command = quote;
        self
    }

    pub fn with_override_umask(mut self, override_umask: bool) -> Self {
        self.spec.elevation.override_umask = override_umask;
        self
    }

    pub fn with_preserve_attributes_on_copy_from_temp_file(mut self, preserve: bool) -> Self {
        self.spec.elevation.preserve_attributes_on_copy_from_temp_file = preserve;
        self
    }

    pub fn with_preserve_attributes_on_copy_to_temp_file(mut self, preserve: bool) -> Self {
        self.spec.elevation.preserve_attributes_on_copy_to_temp_file = preserve;
        self
    }

    pub fn with_pty(mut self, pty: PtySpec) -> Self {
        self.spec.pty = Some(pty);
        self
    }

    /// Allocate [`DEFAULT_PTY`] when no explicit PTY is set
    pub fn with_default_pty(mut self, allocate: bool) -> Self {
        self.allocate_default_pty = allocate;
        self
    }

    pub fn with_local_port_forward(mut self, forward: LocalPortForward) -> Self {
        self.spec.local_port_forwards.push(forward);
        self
    }

    pub fn with_port_allocation_range_start(mut self, port: u16) -> Self {
        self.spec.port_allocation_range_start = port;
        self
    }

    pub fn with_temporary_directory(mut self, path: impl Into<String>) -> Self {
        self.spec.temporary_directory = path.into();
        self
    }

    pub fn with_delete_temporary_directory_on_disconnect(mut self, delete: bool) -> Self {
        self.spec.delete_temporary_directory_on_disconnect = delete;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.spec.connection_timeout = timeout;
        self
    }

    /// Route the connection through a jump host
    pub fn with_tunnel(mut self, jump: ConnectionSpec) -> Self {
        self.spec.tunnel = Some(Box::new(jump));
        self
    }

    /// Validate and produce the immutable specification
    pub fn build(self) -> Result<ConnectionSpec> {
        let mut spec = self.spec;
        if spec.pty.is_none() && self.allocate_default_pty {
            spec.pty = Some(DEFAULT_PTY.parse()?);
        }
        validate(&spec)?;
        Ok(spec)
    }
}

fn validate(spec: &ConnectionSpec) -> Result<()> {
    let mut errors = Vec::new();

    if spec.host.is_empty() {
        errors.push("Missing host".to_string());
    }
    if spec.username.is_empty() {
        errors.push("Missing username".to_string());
    }
    if spec.port_allocation_range_start == 0 {
        errors.push("portAllocationRangeStart must be at least 1".to_string());
    }

    let elevation = &spec.elevation;
    if elevation.kind != ElevationKind::None {
        if !spec.os.is_unix_like() {
            errors.push(format!(
                "Elevation via {} is only supported on UNIX hosts",
                spec.connection_type.as_str()
            ));
        }
        if elevation.elevated_user.as_deref().map_or(true, str::is_empty) {
            errors.push("Missing elevated username (sudoUsername/suUsername)".to_string());
        }
        if elevation.command_prefix.trim().is_empty() {
            errors.push("Elevation command prefix must not be empty".to_string());
        }
        match elevation.password_prompt_regex.chars().last() {
            None => errors.push("Password prompt regex must not be empty".to_string()),
            Some('*') | Some('?') | Some('+') | Some('.') => errors.push(format!(
                "Password prompt regex '{}' must not end in a wildcard",
                elevation.password_prompt_regex
            )),
            Some(_) => {
                if let Err(e) = regex::Regex::new(&elevation.password_prompt_regex) {
                    errors.push(format!("Invalid password prompt regex: {}", e));
                }
            }
        }
    }
    match elevation.kind {
        ElevationKind::Su if elevation.password.is_none() => {
            errors.push("su elevation requires suPassword".to_string());
        }
        ElevationKind::InteractiveSudo if spec.password.is_none() => {
            errors.push("Interactive sudo requires the connection password".to_string());
        }
        _ => {}
    }

    if !errors.is_empty() {
        return Err(SshElevateError::config(format!(
            "Invalid specification for {}:\n{}",
            spec,
            errors.join("\n")
        )));
    }
    Ok(())
}
