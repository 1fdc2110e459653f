//! # Health Metrics
//!
//! The server reports an idle-CPU percentage on every heartbeat response.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::warn;

/// Source of the idle-CPU percentage sent back on heartbeats.
pub trait HealthMetric: Send + Sync {
    fn cpu_idle(&self) -> f64;
}

/// Reports a constant value.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedHealth(pub f64);

impl HealthMetric for FixedHealth {
    fn cpu_idle(&self) -> f64 {
        self.0
    }
}

/// Aggregate CPU counters from the first `cpu` line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuTimes {
    pub idle: u64,
    /// Every column except guest time, which user time already includes.
    pub total: u64,
}

impl CpuTimes {
    pub fn parse(stat: &str) -> Option<Self> {
        let line = stat.lines().find(|l| l.split_whitespace().next() == Some("cpu"))?;
        let mut times = CpuTimes::default();
        for (i, field) in line.split_whitespace().enumerate().skip(1) {
            let Ok(val) = field.parse::<u64>() else { continue };
            if i == 4 {
                times.idle = val;
            }
            if i != 9 {
                times.total += val;
            }
        }
        Some(times)
    }
}

/// Idle percentage between two samples, `0.0` when no time has passed.
pub fn idle_between(prev: CpuTimes, cur: CpuTimes) -> f64 {
    let total = cur.total.saturating_sub(prev.total);
    if total == 0 {
        return 0.0;
    }
    cur.idle.saturating_sub(prev.idle) as f64 * 100.0 / total as f64
}

/// Samples `/proc/stat` on an interval and reports idle time between the last
/// two samples. Reads `0.0` until two samples exist, and always off Linux.
pub struct ProcStatHealth {
    samples: Arc<Samples>,
    task: JoinHandle<()>,
}

impl ProcStatHealth {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

    /// Starts sampling. Must be called inside a tokio runtime.
    pub fn spawn(interval: Duration) -> Self {
        Self::spawn_with_root(interval, proc_root())
    }

    fn spawn_with_root(interval: Duration, root: PathBuf) -> Self {
        let samples = Arc::new(RwLock::new([None, None]));
        let task_samples = samples.clone();
        let path = root.join("proc/stat");

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = sample(&path, &task_samples).await {
                    warn!(path = %path.display(), error = %e, "update cpu stat failed");
                }
            }
        });

        Self { samples, task }
    }
}

impl HealthMetric for ProcStatHealth {
    fn cpu_idle(&self) -> f64 {
        match *self.samples.read() {
            [Some(cur), Some(prev)] => idle_between(prev, cur),
            _ => 0.0,
        }
    }
}

impl Drop for ProcStatHealth {
    fn drop(&mut self) {
        self.task.abort();
    }
}

type Samples = RwLock<[Option<CpuTimes>; 2]>;

/// Reads one sample and shifts the previous one back.
async fn sample(path: &Path, samples: &Samples) -> std::io::Result<()> {
    let stat = tokio::fs::read_to_string(path).await?;
    if let Some(times) = CpuTimes::parse(&stat) {
        let mut s = samples.write();
        s[1] = s[0];
        s[0] = Some(times);
    }
    Ok(())
}

/// `NUX_ROOTFS` lets a containerised process read the host's `/proc`.
fn proc_root() -> PathBuf {
    match std::env::var("NUX_ROOTFS") {
        Ok(root) if root.starts_with('/') && Path::new(&root).is_dir() => {
            PathBuf::from(root.trim_end_matches('/'))
        }
        _ => PathBuf::from("/"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT_A: &str = "cpu  100 0 50 800 50 0 0 0 0 0\ncpu0 1 2 3 4\nctxt 1\n";
    const STAT_B: &str = "cpu  150 0 100 1100 50 0 0 0 25 0\nctxt 2\n";

    #[test]
    fn test_parse_aggregate_line() {
        let t = CpuTimes::parse(STAT_A).unwrap();
        assert_eq!(t.idle, 800);
        assert_eq!(t.total, 1000);
        assert_eq!(CpuTimes::parse("intr 1 2 3\n"), None);
    }

    #[test]
    fn test_guest_time_not_double_counted() {
        let t = CpuTimes::parse(STAT_B).unwrap();
        assert_eq!(t.total, 1400);
    }

    #[test]
    fn test_idle_between_samples() {
        let a = CpuTimes::parse(STAT_A).unwrap();
        let b = CpuTimes::parse(STAT_B).unwrap();
        assert_eq!(idle_between(a, b), 75.0);
        assert_eq!(idle_between(a, a), 0.0);
    }

    #[tokio::test]
    async fn test_sample_shifts_history() {
        let dir = std::env::temp_dir().join(format!("tiderun-health-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("stat");
        let samples: Samples = RwLock::new([None, None]);

        std::fs::write(&path, STAT_A).unwrap();
        sample(&path, &samples).await.unwrap();
        std::fs::write(&path, STAT_B).unwrap();
        sample(&path, &samples).await.unwrap();

        let [cur, prev] = *samples.read();
        assert_eq!(idle_between(prev.unwrap(), cur.unwrap()), 75.0);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_proc_stat_health_starts_at_zero() {
        let dir = std::env::temp_dir().join(format!("tiderun-health-missing-{}", std::process::id()));
        let health = ProcStatHealth::spawn_with_root(Duration::from_secs(60), dir);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(health.cpu_idle(), 0.0);
    }

    #[test]
    fn test_fixed_health() {
        assert_eq!(FixedHealth(73.5).cpu_idle(), 73.5);
    }
}
