//! In-memory SSH host for tests
//!
//! [`FakeSession`] interprets the shell helpers this crate emits over an
//! in-memory filesystem with owners and modes, prompts for a password on
//! elevated commands when asked to, and answers `direct-tcpip` opens with an
//! echo stream. Sessions created with [`FakeSession::login`] share one host.

use std::collections::BTreeMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, SshElevateError};
use crate::ssh::config::{ConnectionSpec, PtySpec};
use crate::ssh::transport::{
    BoxedReader, BoxedStream, BoxedWriter, ExitStatus, FileStat, FileTransfer, ProcessStdin,
    RemoteProcess, SessionConnector, StdinMessage, TransportSession,
};

const ROOT: &str = "root";

#[derive(Debug, Clone)]
enum Node {
    File {
        data: Vec<u8>,
        mode: u32,
        owner: String,
    },
    Dir {
        mode: u32,
        owner: String,
    },
}

impl Node {
    fn mode(&self) -> u32 {
        match self {
            Node::File { mode, .. } | Node::Dir { mode, .. } => *mode,
        }
    }

    fn owner(&self) -> &str {
        match self {
            Node::File { owner, .. } | Node::Dir { owner, .. } => owner,
        }
    }

    fn is_dir(&self) -> bool {
        matches!(self, Node::Dir { .. })
    }

    fn set_mode(&mut self, new_mode: u32) {
        match self {
            Node::File { mode, .. } | Node::Dir { mode, .. } => *mode = new_mode,
        }
    }

    fn set_owner(&mut self, new_owner: &str) {
        match self {
            Node::File { owner, .. } | Node::Dir { owner, .. } => *owner = new_owner.to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct HostState {
    nodes: BTreeMap<String, Node>,
    executed: Vec<String>,
    pty_requests: Vec<bool>,
    stdin: Vec<Vec<u8>>,
    password: Option<String>,
    disconnected: bool,
    direct_opens: Vec<(String, u16)>,
}

impl HostState {
    fn new(user: &str) -> Self {
        let mut state = Self::default();
        state.nodes.insert(
            "/".to_string(),
            Node::Dir {
                mode: 0o755,
                owner: ROOT.to_string(),
            },
        );
        state.nodes.insert(
            "/tmp".to_string(),
            Node::Dir {
                mode: 0o1777,
                owner: ROOT.to_string(),
            },
        );
        state.nodes.insert(
            "/root".to_string(),
            Node::Dir {
                mode: 0o700,
                owner: ROOT.to_string(),
            },
        );
        state.nodes.insert(
            "/home".to_string(),
            Node::Dir {
                mode: 0o755,
                owner: ROOT.to_string(),
            },
        );
        state.nodes.insert(
            format!("/home/{}", user),
            Node::Dir {
                mode: 0o755,
                owner: user.to_string(),
            },
        );
        state
    }

    fn children(&self, dir: &str) -> Vec<String> {
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{}/", dir)
        };
        self.nodes
            .keys()
            .filter(|k| k.starts_with(&prefix) && k.len() > prefix.len())
            .filter(|k| !k[prefix.len()..].contains('/'))
            .map(|k| k[prefix.len()..].to_string())
            .collect()
    }

    fn subtree(&self, path: &str) -> Vec<String> {
        let prefix = format!("{}/", path);
        self.nodes
            .keys()
            .filter(|k| *k == path || k.starts_with(&prefix))
            .cloned()
            .collect()
    }

    fn can_read(&self, user: &str, path: &str) -> bool {
        match self.nodes.get(path) {
            Some(node) => user == ROOT || node.owner() == user || node.mode() & 0o004 != 0,
            None => false,
        }
    }

    fn can_write(&self, user: &str, path: &str) -> bool {
        match self.nodes.get(path) {
            Some(node) => user == ROOT || node.owner() == user || node.mode() & 0o002 != 0,
            None => false,
        }
    }

    fn can_create(&self, user: &str, path: &str) -> bool {
        let parent = parent(path);
        self.nodes.get(&parent).is_some_and(Node::is_dir) && self.can_write(user, &parent)
    }

    fn write_file(&mut self, user: &str, path: &str, data: Vec<u8>) -> std::result::Result<(), String> {
        let writable = self.can_write(user, path);
        let creatable = self.can_create(user, path);
        match self.nodes.get_mut(path) {
            Some(Node::Dir { .. }) => Err(format!("{}: Is a directory", path)),
            Some(Node::File { .. }) if !writable => Err(format!("{}: Permission denied", path)),
            Some(Node::File { data: existing, .. }) => {
                *existing = data;
                Ok(())
            }
            None if !creatable => Err(format!("{}: Permission denied", path)),
            None => {
                self.nodes.insert(
                    path.to_string(),
                    Node::File {
                        data,
                        mode: 0o644,
                        owner: user.to_string(),
                    },
                );
                Ok(())
            }
        }
    }

    fn copy(&mut self, user: &str, src: &str, dst: &str, preserve: bool) -> std::result::Result<(), String> {
        if !self.nodes.contains_key(src) {
            return Err(format!("cannot stat '{}': No such file or directory", src));
        }
        let target = if self.nodes.get(dst).is_some_and(Node::is_dir) {
            join(dst, &name(src))
        } else {
            dst.to_string()
        };
        if !self.can_create(user, &target) && !self.can_write(user, &target) {
            return Err(format!("cannot create '{}': Permission denied", target));
        }
        for path in self.subtree(src) {
            if !self.can_read(user, &path) {
                return Err(format!("cannot open '{}' for reading: Permission denied", path));
            }
            let mut node = self.nodes[&path].clone();
            if !(preserve && user == ROOT) {
                node.set_owner(user);
            }
            if !preserve {
                node.set_mode(if node.is_dir() { 0o755 } else { 0o644 });
            }
            let new_path = format!("{}{}", target, &path[src.len()..]);
            self.nodes.insert(new_path, node);
        }
        Ok(())
    }
}

fn parent(path: &str) -> String {
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(i) => path[..i].to_string(),
        None => "/".to_string(),
    }
}

fn name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

fn join(dir: &str, child: &str) -> String {
    if dir == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", dir, child)
    }
}

fn normalize(cwd: &str, path: &str) -> String {
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        join(cwd, path)
    };
    let trimmed = joined.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug, Clone)]
struct Token {
    text: String,
    quoted: bool,
    glob: bool,
}

impl Token {
    fn is_op(&self, op: &str) -> bool {
        !self.quoted && self.text == op
    }

    fn is_separator(&self) -> bool {
        self.is_op(";") || self.is_op("|") || self.is_op("&&")
    }
}

fn tokenize(line: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut current: Option<Token> = None;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            ' ' | '\t' => {
                if let Some(token) = current.take() {
                    tokens.push(token);
                }
            }
            '\\' => {
                let token = current.get_or_insert_with(empty_token);
                token.quoted = true;
                if let Some(next) = chars.next() {
                    token.text.push(next);
                }
            }
            '"' => {
                let token = current.get_or_insert_with(empty_token);
                token.quoted = true;
                while let Some(next) = chars.next() {
                    match next {
                        '"' => break,
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                token.text.push(escaped);
                            }
                        }
                        other => token.text.push(other),
                    }
                }
            }
            '*' => {
                let token = current.get_or_insert_with(empty_token);
                token.glob = true;
                token.text.push('*');
            }
            other => current.get_or_insert_with(empty_token).text.push(other),
        }
    }
    if let Some(token) = current {
        tokens.push(token);
    }
    tokens
}

fn empty_token() -> Token {
    Token {
        text: String::new(),
        quoted: false,
        glob: false,
    }
}

struct Shell {
    state: Arc<Mutex<HostState>>,
    user: String,
    cwd: String,
    out: Vec<u8>,
    err: Vec<u8>,
}

impl Shell {
    fn run_line(&mut self, tokens: &[Token], input: &[u8]) -> i32 {
        let mut segments: Vec<(Vec<Token>, Option<String>)> = Vec::new();
        let mut current = Vec::new();
        for token in tokens {
            if token.is_separator() {
                segments.push((std::mem::take(&mut current), Some(token.text.clone())));
            } else {
                current.push(token.clone());
            }
        }
        if !current.is_empty() {
            segments.push((current, None));
        }

        let mut code = 0;
        let mut previous_op: Option<String> = None;
        let mut piped: Option<Vec<u8>> = None;
        for (segment, op) in segments {
            if previous_op.as_deref() == Some("&&") && code != 0 {
                break;
            }
            let stdin = piped.take().unwrap_or_else(|| input.to_vec());
            let capture = op.as_deref() == Some("|");
            let saved = std::mem::take(&mut self.out);
            code = self.run_segment(&segment, &stdin);
            if capture {
                piped = Some(std::mem::replace(&mut self.out, saved));
            } else {
                let produced = std::mem::replace(&mut self.out, saved);
                self.out.extend(produced);
            }
            previous_op = op;
        }
        code
    }

    fn run_segment(&mut self, tokens: &[Token], input: &[u8]) -> i32 {
        let words: Vec<&str> = tokens.iter().map(|t| t.text.as_str()).collect();
        match words.as_slice() {
            ["sudo", "-u", user, ..] => {
                let user = user.to_string();
                self.run_as(&user, |shell| shell.run_segment(&tokens[3..], input))
            }
            ["su", "-", user, "-c", command] => {
                let user = user.to_string();
                let nested = tokenize(command);
                self.run_as(&user, |shell| shell.run_line(&nested, input))
            }
            _ => self.run_command(tokens, input),
        }
    }

    fn run_as(&mut self, user: &str, f: impl FnOnce(&mut Shell) -> i32) -> i32 {
        let previous = std::mem::replace(&mut self.user, user.to_string());
        let code = f(self);
        self.user = previous;
        code
    }

    fn fail(&mut self, msg: impl AsRef<str>) -> i32 {
        self.err.extend_from_slice(msg.as_ref().as_bytes());
        self.err.push(b'\n');
        1
    }

    fn run_command(&mut self, tokens: &[Token], input: &[u8]) -> i32 {
        let words: Vec<String> = tokens.iter().map(|t| t.text.clone()).collect();
        let args: Vec<&str> = words.iter().map(String::as_str).collect();
        let cwd = self.cwd.clone();
        let path = |p: &str| normalize(&cwd, p);
        let user = self.user.clone();
        let state = self.state.clone();
        let mut host = state.lock();

        match args.as_slice() {
            ["cd", dir] => {
                let dir = path(dir);
                if host.nodes.get(&dir).is_some_and(Node::is_dir) {
                    self.cwd = dir;
                    0
                } else {
                    self.fail(format!("cd: {}: No such file or directory", dir))
                }
            }
            ["id", "-un"] => {
                self.out.extend_from_slice(format!("{}\n", user).as_bytes());
                0
            }
            ["echo", rest @ ..] => {
                self.out.extend_from_slice(format!("{}\n", rest.join(" ")).as_bytes());
                0
            }
            ["cat", ">", target] if tokens[1].is_op(">") => {
                let target = path(target);
                match host.write_file(&user, &target, input.to_vec()) {
                    Ok(()) => 0,
                    Err(e) => self.fail(format!("cat: {}", e)),
                }
            }
            ["cat", file] => {
                let file = path(file);
                match host.nodes.get(&file) {
                    None => self.fail(format!("cat: {}: No such file or directory", file)),
                    Some(Node::Dir { .. }) => self.fail(format!("cat: {}: Is a directory", file)),
                    Some(Node::File { data, .. }) => {
                        if host.can_read(&user, &file) {
                            self.out.extend_from_slice(data);
                            0
                        } else {
                            self.fail(format!("cat: {}: Permission denied", file))
                        }
                    }
                }
            }
            ["cp", flags, src, dst] if flags.starts_with('-') => {
                let preserve = flags.contains('p');
                let dst = path(dst);
                let sources = if tokens[2].glob && src.ends_with("/*") {
                    let dir = path(&src[..src.len() - 2]);
                    host.children(&dir)
                        .into_iter()
                        .map(|child| join(&dir, &child))
                        .collect()
                } else {
                    vec![path(src)]
                };
                for source in sources {
                    if let Err(e) = host.copy(&user, &source, &dst, preserve) {
                        return self.fail(format!("cp: {}", e));
                    }
                }
                0
            }
            ["chmod", "-R", mode, target] => {
                let target = path(target);
                let paths = host.subtree(&target);
                if paths.is_empty() {
                    return self.fail(format!("chmod: {}: No such file or directory", target));
                }
                for p in paths {
                    if let Err(e) = chmod(&mut host, &user, &p, mode) {
                        return self.fail(e);
                    }
                }
                0
            }
            ["chmod", mode, target] => match chmod(&mut host, &user, &path(target), mode) {
                Ok(()) => 0,
                Err(e) => self.fail(e),
            },
            ["mkdir", rest @ ..] => {
                let mut parents = false;
                let mut mode = 0o755;
                let mut iter = rest.iter();
                let mut dirs = Vec::new();
                while let Some(arg) = iter.next() {
                    match *arg {
                        "-p" => parents = true,
                        "-m" => {
                            mode = iter
                                .next()
                                .and_then(|m| u32::from_str_radix(m, 8).ok())
                                .unwrap_or(0o755)
                        }
                        dir => dirs.push(path(dir)),
                    }
                }
                for dir in dirs {
                    let mut todo = vec![dir.clone()];
                    if parents {
                        let mut p = parent(&dir);
                        while !host.nodes.contains_key(&p) {
                            todo.push(p.clone());
                            p = parent(&p);
                        }
                    } else if host.nodes.contains_key(&dir) {
                        return self.fail(format!("mkdir: {}: File exists", dir));
                    }
                    for d in todo.into_iter().rev() {
                        if host.nodes.contains_key(&d) {
                            continue;
                        }
                        if !host.can_create(&user, &d) {
                            return self.fail(format!("mkdir: {}: Permission denied", d));
                        }
                        host.nodes.insert(
                            d,
                            Node::Dir {
                                mode,
                                owner: user.clone(),
                            },
                        );
                    }
                }
                0
            }
            ["test", flag, target] => {
                let node = host.nodes.get(&path(target));
                let ok = match *flag {
                    "-e" => node.is_some(),
                    "-d" => node.is_some_and(Node::is_dir),
                    "-f" => node.is_some_and(|n| !n.is_dir()),
                    _ => false,
                };
                i32::from(!ok)
            }
            ["ls", "-1A", dir] => {
                let dir = path(dir);
                if !host.nodes.get(&dir).is_some_and(Node::is_dir) {
                    return self.fail(format!("ls: {}: No such file or directory", dir));
                }
                for child in host.children(&dir) {
                    self.out.extend_from_slice(format!("{}\n", child).as_bytes());
                }
                0
            }
            ["rm", "-f", target] => {
                let target = path(target);
                match host.nodes.get(&target) {
                    Some(Node::Dir { .. }) => self.fail(format!("rm: {}: is a directory", target)),
                    Some(_) if !host.can_write(&user, &parent(&target)) => {
                        self.fail(format!("rm: {}: Permission denied", target))
                    }
                    Some(_) => {
                        host.nodes.remove(&target);
                        0
                    }
                    None => 0,
                }
            }
            ["rm", "-rf", target] => {
                let target = path(target);
                for p in host.subtree(&target) {
                    // Sticky directories: the entry's or the directory's owner may unlink.
                    let owns = |path: &str| host.nodes.get(path).is_some_and(|n| n.owner() == user);
                    if user != ROOT && !owns(&p) && !owns(&parent(&p)) {
                        return self.fail(format!("rm: {}: Permission denied", p));
                    }
                }
                for p in host.subtree(&target) {
                    host.nodes.remove(&p);
                }
                0
            }
            ["rmdir", target] => {
                let target = path(target);
                if !host.children(&target).is_empty() {
                    return self.fail(format!("rmdir: {}: Directory not empty", target));
                }
                match host.nodes.remove(&target) {
                    Some(_) => 0,
                    None => self.fail(format!("rmdir: {}: No such file or directory", target)),
                }
            }
            ["mv", from, to] => {
                let from = path(from);
                let mut to = path(to);
                if host.nodes.get(&to).is_some_and(Node::is_dir) {
                    to = join(&to, &name(&from));
                }
                let paths = host.subtree(&from);
                if paths.is_empty() {
                    return self.fail(format!("mv: {}: No such file or directory", from));
                }
                for p in paths {
                    if let Some(node) = host.nodes.remove(&p) {
                        host.nodes.insert(format!("{}{}", to, &p[from.len()..]), node);
                    }
                }
                0
            }
            [command, ..] => {
                self.err
                    .extend_from_slice(format!("sh: {}: command not found\n", command).as_bytes());
                127
            }
            [] => 0,
        }
    }
}

fn chmod(host: &mut HostState, user: &str, path: &str, spec: &str) -> std::result::Result<(), String> {
    let Some(node) = host.nodes.get_mut(path) else {
        return Err(format!("chmod: {}: No such file or directory", path));
    };
    if user != ROOT && node.owner() != user {
        return Err(format!("chmod: {}: Operation not permitted", path));
    }
    if let Ok(mode) = u32::from_str_radix(spec, 8) {
        node.set_mode(mode);
        return Ok(());
    }
    let op_index = spec
        .find(['+', '-'])
        .ok_or_else(|| format!("chmod: invalid mode: {}", spec))?;
    let who = &spec[..op_index];
    let add = &spec[op_index..op_index + 1] == "+";
    let perms = &spec[op_index + 1..];
    let mode = node.mode();
    let mut bits = 0;
    for p in perms.chars() {
        bits |= match p {
            'r' => 0o4,
            'w' => 0o2,
            'x' => 0o1,
            'X' if node.is_dir() || mode & 0o111 != 0 => 0o1,
            _ => 0,
        };
    }
    let mut mask = 0;
    for w in if who.is_empty() { "a".chars() } else { who.chars() } {
        mask |= match w {
            'u' => bits << 6,
            'g' => bits << 3,
            'o' => bits,
            'a' => (bits << 6) | (bits << 3) | bits,
            _ => 0,
        };
    }
    node.set_mode(if add { mode | mask } else { mode & !mask });
    Ok(())
}

/// One login on a fake host
pub(crate) struct FakeSession {
    user: String,
    state: Arc<Mutex<HostState>>,
}

impl FakeSession {
    /// A fresh host with `/`, `/tmp` (1777), `/root` (700) and the user's home
    pub(crate) fn new(user: &str) -> Self {
        Self {
            user: user.to_string(),
            state: Arc::new(Mutex::new(HostState::new(user))),
        }
    }

    /// Another login on the same host
    pub(crate) fn login(&self, user: &str) -> Self {
        Self {
            user: user.to_string(),
            state: self.state.clone(),
        }
    }

    /// Prompt for `password` before running elevated commands
    pub(crate) fn require_password(&self, password: &str) {
        self.state.lock().password = Some(password.to_string());
    }

    pub(crate) fn put_file(&self, path: &str, data: &[u8], owner: &str, mode: u32) {
        self.state.lock().nodes.insert(
            path.to_string(),
            Node::File {
                data: data.to_vec(),
                mode,
                owner: owner.to_string(),
            },
        );
    }

    pub(crate) fn put_dir(&self, path: &str, owner: &str, mode: u32) {
        self.state.lock().nodes.insert(
            path.to_string(),
            Node::Dir {
                mode,
                owner: owner.to_string(),
            },
        );
    }

    pub(crate) fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.state.lock().nodes.get(path) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub(crate) fn mode(&self, path: &str) -> Option<u32> {
        self.state.lock().nodes.get(path).map(Node::mode)
    }

    pub(crate) fn exists(&self, path: &str) -> bool {
        self.state.lock().nodes.contains_key(path)
    }

    /// Paths under `dir` (exclusive)
    pub(crate) fn paths_under(&self, dir: &str) -> Vec<String> {
        let state = self.state.lock();
        state
            .subtree(dir)
            .into_iter()
            .filter(|p| p != dir)
            .collect()
    }

    /// Command lines received by `open_exec`, in order
    pub(crate) fn executed(&self) -> Vec<String> {
        self.state.lock().executed.clone()
    }

    /// Command lines that were spawned with a PTY, in order
    pub(crate) fn executed_with_pty(&self) -> Vec<String> {
        let host = self.state.lock();
        host.executed
            .iter()
            .zip(&host.pty_requests)
            .filter(|(_, pty)| **pty)
            .map(|(line, _)| line.clone())
            .collect()
    }

    /// Chunks written to the stdin of spawned processes
    pub(crate) fn stdin_received(&self) -> Vec<Vec<u8>> {
        self.state.lock().stdin.clone()
    }

    pub(crate) fn is_disconnected(&self) -> bool {
        self.state.lock().disconnected
    }

    pub(crate) fn direct_opens(&self) -> Vec<(String, u16)> {
        self.state.lock().direct_opens.clone()
    }
}

fn is_elevated(tokens: &[Token]) -> Option<&'static str> {
    let mut at_start = true;
    for token in tokens {
        if at_start {
            if token.text == "sudo" {
                return Some("sudo");
            }
            if token.text == "su" {
                return Some("su");
            }
        }
        at_start = token.is_separator();
    }
    None
}

#[async_trait]
impl TransportSession for FakeSession {
    async fn open_exec(&self, command: &str, pty: Option<&PtySpec>) -> Result<RemoteProcess> {
        let (user, state) = (self.user.clone(), self.state.clone());
        {
            let mut host = state.lock();
            host.executed.push(command.to_string());
            host.pty_requests.push(pty.is_some());
        }

        let (stdin, mut stdin_rx) = ProcessStdin::channel();
        let (mut out_w, out_r) = tokio::io::duplex(64 * 1024);
        let (mut err_w, err_r) = tokio::io::duplex(64 * 1024);
        let (exit_tx, exit_status) = ExitStatus::channel();
        let tokens = tokenize(command);

        tokio::spawn(async move {
            let password = state.lock().password.clone();
            if let (Some(password), Some(kind)) = (password, is_elevated(&tokens)) {
                let prompt = match kind {
                    "su" => "Password: ".to_string(),
                    _ => format!("[sudo] password for {}: ", user),
                };
                let _ = out_w.write_all(prompt.as_bytes()).await;
                let typed = match stdin_rx.recv().await {
                    Some(StdinMessage::Data(data)) => data,
                    _ => Vec::new(),
                };
                state.lock().stdin.push(typed.clone());
                let typed = String::from_utf8_lossy(&typed);
                if typed.trim_end_matches(['\r', '\n']) != password {
                    let _ = err_w.write_all(b"Sorry, try again.\n").await;
                    let _ = exit_tx.send(1);
                    return;
                }
                let _ = out_w.write_all(b"\n").await;
            }

            let mut input = Vec::new();
            if tokens.iter().any(|t| t.is_op(">")) {
                while let Some(StdinMessage::Data(data)) = stdin_rx.recv().await {
                    input.extend(data);
                }
            }

            let mut shell = Shell {
                state: state.clone(),
                cwd: format!("/home/{}", user),
                user,
                out: Vec::new(),
                err: Vec::new(),
            };
            let code = shell.run_line(&tokens, &input);
            let (out, err) = (shell.out, shell.err);
            let _ = tokio::join!(out_w.write_all(&out), err_w.write_all(&err));
            drop(out_w);
            drop(err_w);
            let _ = exit_tx.send(code);
        });

        Ok(RemoteProcess {
            stdin,
            stdout: Box::pin(out_r),
            stderr: Box::pin(err_r),
            exit_status,
        })
    }

    async fn open_file_transfer(&self) -> Result<Arc<dyn FileTransfer>> {
        Ok(Arc::new(FakeTransfer {
            user: self.user.clone(),
            state: self.state.clone(),
        }))
    }

    async fn open_direct(&self, remote_host: &str, remote_port: u16) -> Result<BoxedStream> {
        self.state
            .lock()
            .direct_opens
            .push((remote_host.to_string(), remote_port));
        let (near, mut far) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match far.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if far.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(Box::new(near))
    }

    async fn disconnect(&self) {
        self.state.lock().disconnected = true;
    }
}

/// SFTP-like access to the fake host as the logged-in user
struct FakeTransfer {
    user: String,
    state: Arc<Mutex<HostState>>,
}

impl FakeTransfer {
    fn error(&self, msg: impl ToString) -> SshElevateError {
        SshElevateError::transport(format!("fake://{}", self.user), msg)
    }
}

struct FakeUpload {
    user: String,
    path: String,
    state: Arc<Mutex<HostState>>,
    buf: Vec<u8>,
}

impl AsyncWrite for FakeUpload {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        self.get_mut().buf.extend_from_slice(data);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let data = std::mem::take(&mut this.buf);
        let result = this
            .state
            .lock()
            .write_file(&this.user, &this.path, data)
            .map_err(|e| io::Error::new(io::ErrorKind::PermissionDenied, e));
        Poll::Ready(result)
    }
}

#[async_trait]
impl FileTransfer for FakeTransfer {
    async fn open_read(&self, path: &str) -> Result<BoxedReader> {
        let state = self.state.lock();
        match state.nodes.get(path) {
            Some(Node::File { data, .. }) if state.can_read(&self.user, path) => {
                Ok(Box::pin(io::Cursor::new(data.clone())))
            }
            Some(Node::File { .. }) => Err(self.error(format!("{}: Permission denied", path))),
            _ => Err(self.error(format!("{}: No such file", path))),
        }
    }

    async fn open_write(&self, path: &str) -> Result<BoxedWriter> {
        Ok(Box::pin(FakeUpload {
            user: self.user.clone(),
            path: path.to_string(),
            state: self.state.clone(),
            buf: Vec::new(),
        }))
    }

    async fn stat(&self, path: &str) -> Result<Option<FileStat>> {
        Ok(self.state.lock().nodes.get(path).map(|node| FileStat {
            is_directory: node.is_dir(),
            size: match node {
                Node::File { data, .. } => data.len() as u64,
                Node::Dir { .. } => 0,
            },
            mode: Some(node.mode()),
        }))
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        let state = self.state.lock();
        if !state.nodes.get(path).is_some_and(Node::is_dir) {
            return Err(self.error(format!("{}: not a directory", path)));
        }
        Ok(state.children(path))
    }

    async fn mkdir(&self, path: &str, mode: Option<u32>) -> Result<()> {
        let mut state = self.state.lock();
        if state.nodes.contains_key(path) || !state.can_create(&self.user, path) {
            return Err(self.error(format!("{}: cannot create directory", path)));
        }
        state.nodes.insert(
            path.to_string(),
            Node::Dir {
                mode: mode.unwrap_or(0o755),
                owner: self.user.clone(),
            },
        );
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock();
        match state.nodes.get(path) {
            Some(Node::File { .. }) => {
                state.nodes.remove(path);
                Ok(())
            }
            _ => Err(self.error(format!("{}: No such file", path))),
        }
    }

    async fn remove_dir(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock();
        if !state.children(path).is_empty() {
            return Err(self.error(format!("{}: Directory not empty", path)));
        }
        match state.nodes.remove(path) {
            Some(_) => Ok(()),
            None => Err(self.error(format!("{}: No such directory", path))),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut state = self.state.lock();
        let paths = state.subtree(from);
        if paths.is_empty() {
            return Err(self.error(format!("{}: No such file", from)));
        }
        for p in paths {
            if let Some(node) = state.nodes.remove(&p) {
                state.nodes.insert(format!("{}{}", to, &p[from.len()..]), node);
            }
        }
        Ok(())
    }

    async fn set_mode(&self, path: &str, mode: u32) -> Result<()> {
        match self.state.lock().nodes.get_mut(path) {
            Some(node) => {
                node.set_mode(mode);
                Ok(())
            }
            None => Err(self.error(format!("{}: No such file", path))),
        }
    }
}

/// Hands out logins on fake hosts, one host per spec host name
#[derive(Default)]
pub(crate) struct FakeConnector {
    hosts: Mutex<BTreeMap<String, Arc<FakeSession>>>,
    dials: Mutex<Vec<(String, String, u16)>>,
}

impl FakeConnector {
    /// The host behind `name`, created on first use
    pub(crate) fn host(&self, name: &str, user: &str) -> Arc<FakeSession> {
        self.hosts
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(FakeSession::new(user)))
            .clone()
    }

    /// `(spec host, dialed host, dialed port)` for each connect
    pub(crate) fn dials(&self) -> Vec<(String, String, u16)> {
        self.dials.lock().clone()
    }
}

#[async_trait]
impl SessionConnector for FakeConnector {
    async fn connect(
        &self,
        spec: &ConnectionSpec,
        host: &str,
        port: u16,
    ) -> Result<Arc<dyn TransportSession>> {
        self.dials
            .lock()
            .push((spec.host.clone(), host.to_string(), port));
        let fake = self.host(&spec.host, &spec.username);
        Ok(Arc::new(fake.login(&spec.username)))
    }
}
