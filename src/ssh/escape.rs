//! Argument quoting for remote shells
//!
//! Literal command-line arguments are escaped so the remote shell passes them
//! through verbatim. UNIX-family shells get backslash escaping (single quotes
//! for multi-line arguments), Windows gets double quotes.

const UNIX_SPECIAL_CHARS: &str = " \t\r'\"\\;|&<>()$`*?[]{}#~!";
const WINDOWS_SPECIAL_CHARS: &str = " \t\"&|<>^()%!";

/// Escape an argument for a UNIX-family (`sh`-compatible) shell.
///
/// Safe arguments are returned unchanged; every special character is
/// preceded by a backslash. The empty string becomes `""`. A backslash before
/// a newline is a line continuation, so arguments containing newlines are
/// single-quoted instead.
///
/// # Examples
///
/// ```
/// use ssh_elevate::ssh::escape::escape_unix;
///
/// assert_eq!(escape_unix("/tmp"), "/tmp");
/// assert_eq!(escape_unix("ls /tmp"), "ls\\ /tmp");
/// assert_eq!(escape_unix(""), "\"\"");
/// ```
pub fn escape_unix(s: &str) -> String {
    if s.is_empty() {
        return "\"\"".to_string();
    }
    if s.contains('\n') {
        return format!("'{}'", s.replace('\'', "'\\''"));
    }

    let mut escaped = String::with_capacity(s.len() + 4);
    for ch in s.chars() {
        if UNIX_SPECIAL_CHARS.contains(ch) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Escape an argument for `cmd.exe`.
///
/// Arguments containing special characters are wrapped in double quotes,
/// with embedded double quotes backslash-escaped.
pub fn escape_windows(s: &str) -> String {
    if s.is_empty() {
        return "\"\"".to_string();
    }

    if !s.chars().any(|ch| WINDOWS_SPECIAL_CHARS.contains(ch)) {
        return s.to_string();
    }

    format!("\"{}\"", s.replace('"', "\\\""))
}
