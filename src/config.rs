//! Configuration and CLI argument parsing for ssh-elevate
//!
//! Connections are described by a flat map of string options
//! ([`ConnectionOptions`]), loaded from a JSON file and/or given on the
//! command line, and turned into a validated [`ConnectionSpec`] by
//! [`ConnectionSpec::from_options`]. Jump-host options use the
//! `jumpstation.` prefix.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SshElevateError};
use crate::ssh::config::{ConnectionSpec, ConnectionType, LocalPortForward, OsFamily, PtySpec};

/// Prefix of the nested jump-host options
pub const JUMPSTATION_PREFIX: &str = "jumpstation.";

/// ssh-elevate CLI Arguments
#[derive(Parser, Debug, Clone)]
#[command(name = "ssh-elevate")]
#[command(version)]
#[command(about = "Run commands and move files on SSH hosts through su/sudo elevation and jump hosts")]
pub struct Args {
    /// JSON file with connection options
    #[arg(long, global = true, env = "SSH_ELEVATE_OPTIONS_FILE")]
    pub options_file: Option<PathBuf>,

    /// SSH host to connect to
    #[arg(long, global = true, env = "SSH_ELEVATE_HOST")]
    pub host: Option<String>,

    /// SSH port
    #[arg(long, global = true, env = "SSH_ELEVATE_PORT")]
    pub port: Option<u16>,

    /// SSH username
    #[arg(long, global = true, env = "SSH_ELEVATE_USER")]
    pub user: Option<String>,

    /// SSH password (alternative to key)
    #[arg(long, global = true, env = "SSH_ELEVATE_PASSWORD")]
    pub password: Option<String>,

    /// Path to SSH private key file (alternative to password)
    #[arg(long, global = true, env = "SSH_ELEVATE_KEY")]
    pub key: Option<PathBuf>,

    /// Connection type: sftp, scp, su, sudo, interactive_sudo or tunnel
    #[arg(long = "type", global = true, env = "SSH_ELEVATE_TYPE")]
    pub connection_type: Option<String>,

    /// Extra connection option, e.g. `-o sudoUsername=root`
    #[arg(short = 'o', long = "option", global = true, value_parser = parse_key_value)]
    pub options: Vec<(String, String)>,

    #[command(subcommand)]
    pub command: Command,
}

/// What to do once connected
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run a command and relay its output and exit code
    Exec {
        /// Directory the command starts in
        #[arg(long)]
        workdir: Option<String>,

        /// Command and arguments
        #[arg(trailing_var_arg = true, required = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Copy a remote file to a local path
    Get { remote: String, local: PathBuf },

    /// Copy a local file to a remote path
    Put { local: PathBuf, remote: String },

    /// Map a host reachable from the SSH server to a local port
    Forward {
        /// `remoteHost:remotePort`
        target: String,
    },
}

fn parse_key_value(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{}'", s)),
    }
}

impl Args {
    /// Options file first, then the dedicated flags, then `-o` pairs
    pub fn connection_options(&self) -> Result<ConnectionOptions> {
        let mut options = match self.options_file {
            Some(ref path) => ConnectionOptions::from_json_file(path)?,
            None => ConnectionOptions::default(),
        };

        if let Some(ref host) = self.host {
            options.set("address", host);
        }
        if let Some(port) = self.port {
            options.set("port", port.to_string());
        }
        if let Some(ref user) = self.user {
            options.set("username", user);
        }
        if let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) {
            options.set("password", password);
        }
        if let Some(ref key) = self.key {
            options.set("privateKeyFile", key.display().to_string());
        }
        if let Some(ref connection_type) = self.connection_type {
            options.set("connectionType", connection_type);
        }
        for (key, value) in &self.options {
            options.set(key, value);
        }
        Ok(options)
    }
}

/// String key/value connection options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionOptions(BTreeMap<String, String>);

impl ConnectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON object
    ///
    /// Non-string scalars are stored in their JSON text form, and a nested
    /// `jumpstation` object is flattened into `jumpstation.` keys.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| SshElevateError::config(format!("Invalid options JSON: {}", e)))?;
        let mut options = Self::new();
        options.flatten("", &value)?;
        Ok(options)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            SshElevateError::config(format!("Cannot read options file {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    fn flatten(&mut self, prefix: &str, value: &serde_json::Value) -> Result<()> {
        use serde_json::Value;

        let Value::Object(map) = value else {
            return Err(SshElevateError::config("Connection options must be a JSON object"));
        };
        for (key, value) in map {
            let key = format!("{}{}", prefix, key);
            match value {
                Value::Object(_) => self.flatten(&format!("{}.", key), value)?,
                Value::String(s) => self.set(&key, s),
                Value::Null => {}
                other => self.set(&key, other.to_string()),
            }
        }
        Ok(())
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_string(), value.into());
    }

    /// Builder-style [`set`](Self::set)
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Value of `key`, empty strings count as absent
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| SshElevateError::config(format!("Missing required option {}", key)))
    }

    fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        self.get(key)
            .map(|value| {
                value.trim().parse::<T>().map_err(|_| {
                    SshElevateError::config(format!("Invalid value '{}' for option {}", value, key))
                })
            })
            .transpose()
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.get(key).map(|v| v.trim().to_ascii_lowercase()) {
            None => Ok(None),
            Some(v) if v == "true" => Ok(Some(true)),
            Some(v) if v == "false" => Ok(Some(false)),
            Some(v) => Err(SshElevateError::config(format!(
                "Invalid boolean '{}' for option {}",
                v, key
            ))),
        }
    }

    /// Options under `jumpstation.`, with the prefix removed
    pub fn jumpstation(&self) -> Option<ConnectionOptions> {
        let nested: BTreeMap<String, String> = self
            .0
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(JUMPSTATION_PREFIX)
                    .map(|rest| (rest.to_string(), value.clone()))
            })
            .collect();
        (!nested.is_empty()).then_some(ConnectionOptions(nested))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl ConnectionSpec {
    /// Build and validate a specification from connection options
    ///
    /// `connectionType` defaults to `sftp` and to `tunnel` for a jump host.
    pub fn from_options(options: &ConnectionOptions) -> Result<Self> {
        build_spec(options, ConnectionType::Sftp)
    }
}

fn build_spec(options: &ConnectionOptions, default_type: ConnectionType) -> Result<ConnectionSpec> {
    let connection_type = options
        .parse::<ConnectionType>("connectionType")?
        .unwrap_or(default_type);
    let mut builder = ConnectionSpec::builder(
        connection_type,
        options.require("address")?,
        options.require("username")?,
    );

    if let Some(port) = options.parse::<u16>("port")? {
        builder = builder.with_port(port);
    }
    if let Some(os) = options.parse::<OsFamily>("os")? {
        builder = builder.with_os(os);
    }
    if let Some(password) = options.get("password") {
        builder = builder.with_password(password);
    }
    if let Some(path) = options.get("privateKeyFile") {
        let key = std::fs::read_to_string(path).map_err(|e| {
            SshElevateError::config(format!("Cannot read private key file {}: {}", path, e))
        })?;
        builder = builder.with_private_key(key);
    }
    if let Some(passphrase) = options.get("passphrase") {
        builder = builder.with_passphrase(passphrase);
    }
    if let Some(fingerprint) = options.get("hostKeyFingerprint") {
        builder = builder.with_host_key_fingerprint(fingerprint);
    }

    // Elevation options are read under the prefix of the elevation in use.
    let prefix = match connection_type {
        ConnectionType::Su => "su",
        _ => "sudo",
    };
    let key = |name: &str| format!("{}{}", prefix, name);

    if let Some(user) = options.get(&key("Username")) {
        builder = builder.with_elevated_user(user);
    }
    if let Some(password) = options.get("suPassword") {
        builder = builder.with_elevation_password(password);
    }
    if let Some(template) = options.get(&key("CommandPrefix")) {
        builder = builder.with_command_prefix(template);
    }
    if let Some(regex) = options.get(&key("PasswordPromptRegex")) {
        builder = builder.with_password_prompt_regex(regex);
    }
    if let Some(quote) = options.get_bool(&key("QuoteCommand"))? {
        builder = builder.with_quote_command(quote);
    }
    if let Some(override_umask) = options.get_bool(&key("OverrideUmask"))? {
        builder = builder.with_override_umask(override_umask);
    }
    if let Some(preserve) = options.get_bool(&key("PreserveAttributesOnCopyFromTempFile"))? {
        builder = builder.with_preserve_attributes_on_copy_from_temp_file(preserve);
    }
    if let Some(preserve) = options.get_bool(&key("PreserveAttributesOnCopyToTempFile"))? {
        builder = builder.with_preserve_attributes_on_copy_to_temp_file(preserve);
    }

    if let Some(pty) = options.parse::<PtySpec>("allocatePty")? {
        builder = builder.with_pty(pty);
    }
    if let Some(allocate) = options.get_bool("allocateDefaultPty")? {
        builder = builder.with_default_pty(allocate);
    }
    if let Some(forwards) = options.get("localPortForwards") {
        for forward in LocalPortForward::parse_list(forwards)? {
            builder = builder.with_local_port_forward(forward);
        }
    }
    if let Some(floor) = options.parse::<u16>("portAllocationRangeStart")? {
        builder = builder.with_port_allocation_range_start(floor);
    }
    if let Some(dir) = options.get("temporaryDirectoryPath") {
        builder = builder.with_temporary_directory(dir);
    }
    if let Some(delete) = options.get_bool("deleteTemporaryDirectoryOnDisconnect")? {
        builder = builder.with_delete_temporary_directory_on_disconnect(delete);
    }
    if let Some(millis) = options.parse::<u64>("connectionTimeoutMillis")? {
        builder = builder.with_connection_timeout(Duration::from_millis(millis));
    }

    if let Some(jump) = options.jumpstation() {
        builder = builder.with_tunnel(build_spec(&jump, ConnectionType::Tunnel)?);
    }

    builder.build()
}
