//! Validated subprocess execution with hard timeouts.
//!
//! Everything the daemon runs on the host goes through [`CommandExecutor`].
//! The system implementation refuses anything the allow-list rejects, bounds
//! every child with a timeout that kills it, and redacts sensitive material
//! before logging.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::validator;

/// Outcome of a completed (non-timed-out) subprocess.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Seam for running privileged host commands.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Runs `command args..` with a hard timeout. Validation rejection,
    /// spawn failure and timeout all surface as errors; a nonzero exit is a
    /// normal `CommandOutput` with `success == false`.
    async fn run(
        &self,
        command: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput>;
}

/// Production executor backed by `tokio::process`.
pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(
        &self,
        command: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput> {
        if !validator::validate(command, args) {
            warn!(
                "refusing disallowed command: {} {}",
                command,
                sanitize_log_data(&args.join(" "))
            );
            anyhow::bail!("command not allowed: {command}");
        }

        debug!("running: {} {}", command, args.join(" "));

        let output = Command::new(command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(timeout, output).await {
            Ok(Ok(out)) => Ok(CommandOutput {
                success: out.status.success(),
                stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            }),
            Ok(Err(e)) => Err(e).with_context(|| format!("spawning {command}")),
            // Dropping the output future kills the child via kill_on_drop.
            Err(_) => anyhow::bail!(
                "{command} timed out after {}s",
                timeout.as_secs()
            ),
        }
    }
}

/// Key/value pairs whose values get scrubbed from log output.
const SENSITIVE_KEYS: [&str; 4] = ["password", "secret", "api_key", "token"];

/// Replaces secret-bearing values with `[REDACTED]`.
///
/// Catches `key=value` / `key: value` forms for the sensitive key names and
/// `Bearer <token>` authorization strings. Matching is ASCII
/// case-insensitive and never splits multi-byte characters (redacted runs
/// end at ASCII whitespace).
pub fn sanitize_log_data(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if let Some((keep_until, skip_until)) = match_sensitive(bytes, i) {
            out.extend_from_slice(&bytes[i..keep_until]);
            out.extend_from_slice(b"[REDACTED]");
            i = skip_until;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// If a sensitive pattern starts at `i`, returns (end of prefix to keep,
/// end of value to drop).
fn match_sensitive(bytes: &[u8], i: usize) -> Option<(usize, usize)> {
    // Word boundary on the left, so "monkey=" is not a "key=" hit.
    if i > 0 && (bytes[i - 1].is_ascii_alphanumeric() || bytes[i - 1] == b'_') {
        return None;
    }

    let starts_with = |kw: &str| {
        bytes.len() >= i + kw.len() && bytes[i..i + kw.len()].eq_ignore_ascii_case(kw.as_bytes())
    };

    if starts_with("bearer ") {
        let mut j = i + "bearer ".len();
        while j < bytes.len() && bytes[j] == b' ' {
            j += 1;
        }
        let start = j;
        while j < bytes.len() && !bytes[j].is_ascii_whitespace() {
            j += 1;
        }
        if j > start {
            return Some((start, j));
        }
        return None;
    }

    for kw in SENSITIVE_KEYS {
        if !starts_with(kw) {
            continue;
        }
        let mut j = i + kw.len();
        while j < bytes.len() && bytes[j] == b' ' {
            j += 1;
        }
        if j >= bytes.len() || (bytes[j] != b'=' && bytes[j] != b':') {
            continue;
        }
        j += 1;
        while j < bytes.len() && bytes[j] == b' ' {
            j += 1;
        }
        let start = j;
        while j < bytes.len() && !bytes[j].is_ascii_whitespace() {
            j += 1;
        }
        if j > start {
            return Some((start, j));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_disallowed_command_without_spawning() {
        let exec = SystemCommandExecutor;
        let err = exec
            .run("rm", &["-rf".into(), "/".into()], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }

    #[tokio::test]
    async fn rejects_disallowed_systemctl_action() {
        let exec = SystemCommandExecutor;
        assert!(exec
            .run(
                "systemctl",
                &["reboot".into(), "x.service".into()],
                Duration::from_secs(1)
            )
            .await
            .is_err());
    }

    #[test]
    fn redacts_key_value_secrets() {
        assert_eq!(
            sanitize_log_data("token=abc123 user=bob"),
            "token=[REDACTED] user=bob"
        );
        assert_eq!(
            sanitize_log_data("Password: hunter2"),
            "Password: [REDACTED]"
        );
        assert_eq!(
            sanitize_log_data("api_key = sk-live-42"),
            "api_key = [REDACTED]"
        );
    }

    #[test]
    fn redacts_bearer_tokens() {
        assert_eq!(
            sanitize_log_data("Authorization: Bearer eyJhbGci.xyz"),
            "Authorization: Bearer [REDACTED]"
        );
    }

    #[test]
    fn leaves_lookalikes_alone() {
        assert_eq!(sanitize_log_data("monkey=5"), "monkey=5");
        assert_eq!(
            sanitize_log_data("the token was rotated"),
            "the token was rotated"
        );
    }
}
