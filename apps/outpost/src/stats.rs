//! Host load sampling read straight from procfs.

use std::time::Duration;

use thiserror::Error;

/// CPU usage needs two readings; this is the gap between them.
pub const CPU_SAMPLE_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("unexpected format in {0}")]
    Format(&'static str),
    #[error("load sampling is not supported on this platform")]
    Unsupported,
}

/// Load percentages, already rounded to two decimals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

/// Blocking sampler. Callers on an async runtime should go through
/// `spawn_blocking`.
pub trait StatsSampler: Send + Sync {
    fn sample(&self) -> Result<LoadSample, StatsError>;
}

#[derive(Debug, Clone)]
pub struct ProcStatsSampler {
    window: Duration,
}

impl ProcStatsSampler {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }
}

impl Default for ProcStatsSampler {
    fn default() -> Self {
        Self::new(CPU_SAMPLE_WINDOW)
    }
}

impl StatsSampler for ProcStatsSampler {
    #[cfg(target_os = "linux")]
    fn sample(&self) -> Result<LoadSample, StatsError> {
        let before = parse_cpu_times(&read_proc("/proc/stat")?)?;
        std::thread::sleep(self.window);
        let after = parse_cpu_times(&read_proc("/proc/stat")?)?;
        let memory = parse_memory_percent(&read_proc("/proc/meminfo")?)?;
        Ok(LoadSample {
            cpu_percent: round2(before.busy_percent_until(&after)),
            memory_percent: round2(memory),
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn sample(&self) -> Result<LoadSample, StatsError> {
        Err(StatsError::Unsupported)
    }
}

#[cfg(target_os = "linux")]
fn read_proc(path: &'static str) -> Result<String, StatsError> {
    std::fs::read_to_string(path).map_err(|source| StatsError::Read { path, source })
}

/// Aggregate jiffies from the first `cpu` line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    total: u64,
    idle: u64,
}

impl CpuTimes {
    fn busy_percent_until(&self, later: &CpuTimes) -> f64 {
        let total = later.total.saturating_sub(self.total);
        if total == 0 {
            return 0.0;
        }
        let idle = later.idle.saturating_sub(self.idle);
        total.saturating_sub(idle) as f64 / total as f64 * 100.0
    }
}

fn parse_cpu_times(stat: &str) -> Result<CpuTimes, StatsError> {
    let line = stat
        .lines()
        .find(|line| line.starts_with("cpu "))
        .ok_or(StatsError::Format("/proc/stat"))?;
    // user nice system idle iowait irq softirq steal; guest time is already
    // folded into user/nice.
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .map(|field| field.parse().map_err(|_| StatsError::Format("/proc/stat")))
        .collect::<Result<_, _>>()?;
    if fields.len() < 4 {
        return Err(StatsError::Format("/proc/stat"));
    }
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Ok(CpuTimes {
        total: fields.iter().sum(),
        idle,
    })
}

fn parse_memory_percent(meminfo: &str) -> Result<f64, StatsError> {
    let mut total = None;
    let mut available = None;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = parse_kib(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = parse_kib(rest);
        }
    }
    match (total, available) {
        (Some(total), Some(available)) if total > 0 => {
            Ok(total.saturating_sub(available) as f64 / total as f64 * 100.0)
        }
        _ => Err(StatsError::Format("/proc/meminfo")),
    }
}

fn parse_kib(rest: &str) -> Option<u64> {
    rest.split_whitespace().next()?.parse().ok()
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
