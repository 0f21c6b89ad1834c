//! Performance sampling for the managed game server.
//!
//! Everything is read from `/proc`: the server pid is found by process name,
//! CPU usage is a jiffies delta between consecutive samples, resident memory
//! comes from `statm`, and the player estimate counts established game-port
//! connections in `/proc/net/tcp{,6}`. Service activity is asked of systemd
//! through the validated executor.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use crate::executor::CommandExecutor;

/// One point-in-time health sample of the managed server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSample {
    /// None when no matching process exists (not an error).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    pub cpu_percent: f64,
    pub memory_mb: u64,
    pub estimated_players: usize,
    pub service_active: bool,
    pub timestamp: DateTime<Utc>,
}

impl PerformanceSample {
    /// An "everything absent" sample for degraded paths.
    pub fn absent() -> Self {
        Self {
            pid: None,
            cpu_percent: 0.0,
            memory_mb: 0,
            estimated_players: 0,
            service_active: false,
            timestamp: Utc::now(),
        }
    }
}

/// Seam for obtaining samples; production reads /proc, tests script them.
#[async_trait]
pub trait PerformanceSource: Send + Sync {
    async fn sample(&self) -> Result<PerformanceSample>;
}

/// Previous CPU reading, kept per pid so a restart resets the delta.
struct CpuBaseline {
    pid: i32,
    total_ticks: u64,
    at: Instant,
}

/// /proc-backed sampler.
pub struct ProcPerformanceSource {
    process_names: Vec<String>,
    service_unit: String,
    game_port: u16,
    player_conn_baseline: usize,
    command_timeout: Duration,
    executor: Arc<dyn CommandExecutor>,
    last_cpu: Mutex<Option<CpuBaseline>>,
}

impl ProcPerformanceSource {
    pub fn new(
        process_names: Vec<String>,
        service_unit: String,
        game_port: u16,
        player_conn_baseline: usize,
        command_timeout: Duration,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            process_names,
            service_unit,
            game_port,
            player_conn_baseline,
            command_timeout,
            executor,
            last_cpu: Mutex::new(None),
        }
    }

    /// Scans /proc for the first process whose comm matches a configured name.
    fn find_server_pid(&self) -> Option<i32> {
        let entries = fs::read_dir("/proc").ok()?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(|s| s.parse::<i32>().ok()) else {
                continue;
            };
            let comm_path = entry.path().join("comm");
            let Ok(comm) = fs::read_to_string(&comm_path) else {
                continue;
            };
            let comm = comm.trim();
            // comm is truncated to 15 bytes, so match on the prefix too.
            if self
                .process_names
                .iter()
                .any(|n| n == comm || (comm.len() == 15 && n.starts_with(comm)))
            {
                return Some(pid);
            }
        }
        None
    }

    /// CPU usage since the previous sample of the same pid, in percent of
    /// one core. First observation of a pid reports 0.
    async fn cpu_percent(&self, pid: i32) -> f64 {
        let stat = match fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(s) => s,
            Err(_) => return 0.0,
        };
        let Some(ticks) = parse_stat_cpu_ticks(&stat) else {
            return 0.0;
        };
        let now = Instant::now();

        let mut last = self.last_cpu.lock().await;
        let percent = match last.as_ref() {
            Some(prev) if prev.pid == pid && now > prev.at => {
                let elapsed = now.duration_since(prev.at).as_secs_f64();
                let delta = ticks.saturating_sub(prev.total_ticks) as f64;
                if elapsed > 0.0 {
                    (delta / ticks_per_sec()) / elapsed * 100.0
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };
        *last = Some(CpuBaseline {
            pid,
            total_ticks: ticks,
            at: now,
        });
        percent
    }

    fn memory_mb(&self, pid: i32) -> u64 {
        let statm = match fs::read_to_string(format!("/proc/{pid}/statm")) {
            Ok(s) => s,
            Err(_) => return 0,
        };
        parse_statm_rss_pages(&statm)
            .map(|pages| pages * page_size() / (1024 * 1024))
            .unwrap_or(0)
    }

    /// Established connections on the game port, minus the baseline the
    /// server keeps open on its own.
    fn estimated_players(&self) -> usize {
        let mut established = 0;
        for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
            if let Ok(content) = fs::read_to_string(Path::new(table)) {
                established += count_established(&content, self.game_port);
            }
        }
        established.saturating_sub(self.player_conn_baseline)
    }

    async fn service_active(&self) -> bool {
        let args = vec!["is-active".to_string(), self.service_unit.clone()];
        match self
            .executor
            .run("systemctl", &args, self.command_timeout)
            .await
        {
            Ok(out) => out.success && out.stdout.trim() == "active",
            Err(e) => {
                debug!("is-active query failed: {e:#}");
                false
            }
        }
    }
}

#[async_trait]
impl PerformanceSource for ProcPerformanceSource {
    async fn sample(&self) -> Result<PerformanceSample> {
        let service_active = self.service_active().await;
        let pid = self.find_server_pid();

        let (cpu_percent, memory_mb) = match pid {
            Some(pid) => (self.cpu_percent(pid).await, self.memory_mb(pid)),
            None => (0.0, 0),
        };

        Ok(PerformanceSample {
            pid,
            cpu_percent,
            memory_mb,
            estimated_players: self.estimated_players(),
            service_active,
            timestamp: Utc::now(),
        })
    }
}

/// utime + stime out of /proc/pid/stat.
///
/// Fields are located after the last ')' so a comm containing spaces or
/// parentheses cannot shift them.
pub fn parse_stat_cpu_ticks(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    // rest starts at field 3 (state); utime and stime are fields 14 and 15.
    let utime: u64 = fields.nth(11)?.parse().ok()?;
    let stime: u64 = fields.next()?.parse().ok()?;
    Some(utime + stime)
}

/// Resident set size in pages, second field of /proc/pid/statm.
pub fn parse_statm_rss_pages(statm: &str) -> Option<u64> {
    statm.split_whitespace().nth(1)?.parse().ok()
}

/// Counts ESTABLISHED sockets bound to `port` in a /proc/net/tcp table.
pub fn count_established(table: &str, port: u16) -> usize {
    table
        .lines()
        .skip(1)
        .filter(|line| {
            let mut fields = line.split_whitespace();
            let Some(local) = fields.nth(1) else {
                return false;
            };
            let Some(state) = fields.nth(1) else {
                return false;
            };
            if state != "01" {
                return false;
            }
            local
                .rsplit(':')
                .next()
                .and_then(|hex| u16::from_str_radix(hex, 16).ok())
                == Some(port)
        })
        .count()
}

fn ticks_per_sec() -> f64 {
    // SAFETY: sysconf has no memory-safety preconditions.
    let v = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if v > 0 {
        v as f64
    } else {
        100.0
    }
}

fn page_size() -> u64 {
    // SAFETY: sysconf has no memory-safety preconditions.
    let v = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if v > 0 {
        v as u64
    } else {
        4096
    }
}
