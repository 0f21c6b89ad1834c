//! Command allow-list validation.
//!
//! This module is the single authorization boundary between the watchdog and
//! execution of privileged external commands. Every subprocess the daemon
//! spawns goes through [`validate`] first; commands or argument shapes outside
//! the allow-list are rejected before anything is executed.

use ahash::AHashMap as HashMap;
use once_cell::sync::Lazy;
use std::collections::HashSet;

/// Permitted commands mapped to their allowed sub-arguments/flags.
///
/// An empty list means the command is validated entirely by a specialized
/// rule (`chown`) or by the generic character-class rule.
static ALLOWED_COMMANDS: Lazy<HashMap<&'static str, Vec<&'static str>>> = Lazy::new(|| {
    let mut map = HashMap::new();
    map.insert(
        "systemctl",
        vec!["start", "stop", "restart", "status", "is-active", "is-failed"],
    );
    map.insert("sysctl", vec!["-n", "-w"]);
    map.insert("renice", vec!["-n", "-p"]);
    map.insert(
        "ionice",
        vec!["-c1", "-c2", "-c3", "-n0", "-n1", "-n2", "-n3", "-n4", "-n5", "-n6", "-n7", "-p"],
    );
    map.insert("taskset", vec!["-cp"]);
    map.insert("pkill", vec!["-f"]);
    map.insert("pgrep", vec!["-f"]);
    map.insert("fail2ban-client", vec!["status", "set", "unbanall"]);
    // Validated separately: only the fixed user:group pair is accepted.
    map.insert("chown", vec![]);
    map
});

/// Kernel tunables that may be written via `sysctl -w`.
static ALLOWED_SYSCTL_PARAMS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "net.core.rmem_default",
        "net.core.wmem_default",
        "net.core.rmem_max",
        "net.core.wmem_max",
        "net.core.netdev_max_backlog",
        "net.core.somaxconn",
        "net.ipv4.tcp_rmem",
        "net.ipv4.tcp_wmem",
        "net.ipv4.tcp_congestion_control",
        "net.ipv4.tcp_notsent_lowat",
        "net.ipv4.tcp_slow_start_after_idle",
        "vm.swappiness",
        "vm.vfs_cache_pressure",
        "vm.dirty_ratio",
        "vm.dirty_background_ratio",
        "vm.nr_hugepages",
    ]
    .into_iter()
    .collect()
});

/// Only this owner pair may ever be passed to chown.
const ALLOWED_CHOWN_PAIR: &str = "satisfactory:satisfactory";

/// Validates whether a command and its arguments are permitted.
///
/// Pure predicate with no side effects; callers log rejections so that
/// attempted privilege escalation stays auditable.
pub fn validate(command: &str, args: &[String]) -> bool {
    let Some(allowed_args) = ALLOWED_COMMANDS.get(command) else {
        return false;
    };

    match command {
        "systemctl" => {
            if args.len() < 2 {
                return false;
            }
            let (action, service) = (args[0].as_str(), args[1].as_str());
            allowed_args.contains(&action) && service.ends_with(".service")
        }
        "sysctl" => {
            if args.len() < 2 {
                return false;
            }
            match args[0].as_str() {
                "-w" => {
                    let param = args[1].split('=').next().unwrap_or("");
                    ALLOWED_SYSCTL_PARAMS.contains(param)
                }
                "-n" => ALLOWED_SYSCTL_PARAMS.contains(args[1].as_str()),
                _ => false,
            }
        }
        "chown" => args.len() >= 2 && args[0] == ALLOWED_CHOWN_PAIR,
        _ => args.iter().all(|arg| {
            allowed_args.contains(&arg.as_str()) || is_safe_token(arg)
        }),
    }
}

/// Generic argument rule: alphanumeric plus `.`, `-`, `_`, `/` only.
///
/// Defends against shell metacharacter injection even though arguments are
/// passed without a shell.
fn is_safe_token(arg: &str) -> bool {
    !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/'))
}
