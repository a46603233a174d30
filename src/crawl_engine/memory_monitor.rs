//! System memory sampling and the admission memory gate
//!
//! A background task samples memory usage on a fixed interval and stores the
//! latest value in atomics. The gate check on the request path is a pair of
//! atomic loads; it never samples and never blocks.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::crawl_types::{AdmissionGate, CancelReason, DispatchError, DispatchResult};
use crate::utils::{instant_to_nanos, nanos_to_instant};

/// Source of memory usage readings
pub trait MemorySource: Send + Sync + 'static {
    /// Percentage of system memory currently in use, in `[0, 100]`
    fn sample_percent(&self) -> Result<f64>;
}

/// Reads `/proc/meminfo`: used = 1 - MemAvailable / MemTotal
#[derive(Debug, Clone)]
pub struct SystemMemory {
    meminfo_path: PathBuf,
}

impl Default for SystemMemory {
    fn default() -> Self {
        Self {
            meminfo_path: PathBuf::from("/proc/meminfo"),
        }
    }
}

impl SystemMemory {
    #[must_use]
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            meminfo_path: path.into(),
        }
    }

    fn parse_meminfo(raw: &str) -> Result<f64> {
        let field = |name: &str| -> Result<f64> {
            raw.lines()
                .find_map(|line| line.strip_prefix(name))
                .and_then(|rest| rest.trim_start_matches(':').split_whitespace().next())
                .with_context(|| format!("{name} missing from meminfo"))?
                .parse::<f64>()
                .with_context(|| format!("{name} is not a number"))
        };

        let total = field("MemTotal")?;
        let available = field("MemAvailable")?;
        if total <= 0.0 {
            anyhow::bail!("MemTotal is zero");
        }
        Ok(((1.0 - available / total) * 100.0).clamp(0.0, 100.0))
    }
}

impl MemorySource for SystemMemory {
    fn sample_percent(&self) -> Result<f64> {
        let raw = std::fs::read_to_string(&self.meminfo_path)
            .with_context(|| format!("Failed to read {}", self.meminfo_path.display()))?;
        Self::parse_meminfo(&raw)
    }
}

/// Latest memory reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemorySample {
    pub percent_used: f64,
    pub sampled_at: Instant,
}

/// Memory gate shared by every admission
pub struct MemoryMonitor {
    source: Arc<dyn MemorySource>,
    threshold_percent: f64,
    sample_interval: Duration,
    /// f64 bits of the latest percentage
    percent_bits: AtomicU64,
    sampled_at_nanos: AtomicU64,
    has_sample: AtomicBool,
    sampler_handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for MemoryMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMonitor")
            .field("threshold_percent", &self.threshold_percent)
            .field("sample_interval", &self.sample_interval)
            .field("latest", &self.latest())
            .finish_non_exhaustive()
    }
}

impl MemoryMonitor {
    pub fn new(
        source: Arc<dyn MemorySource>,
        threshold_percent: f64,
        sample_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            source,
            threshold_percent,
            sample_interval,
            percent_bits: AtomicU64::new(0f64.to_bits()),
            sampled_at_nanos: AtomicU64::new(0),
            has_sample: AtomicBool::new(false),
            sampler_handle: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn threshold_percent(&self) -> f64 {
        self.threshold_percent
    }

    /// Take one sample now and publish it
    ///
    /// # Errors
    /// Propagates the source error; the previous sample stays in place.
    pub fn sample_now(&self) -> Result<f64> {
        let percent = self.source.sample_percent()?;
        self.percent_bits.store(percent.to_bits(), Ordering::Release);
        self.sampled_at_nanos
            .store(instant_to_nanos(Instant::now()), Ordering::Release);
        self.has_sample.store(true, Ordering::Release);
        Ok(percent)
    }

    /// Latest published sample, if any
    #[must_use]
    pub fn latest(&self) -> Option<MemorySample> {
        if !self.has_sample.load(Ordering::Acquire) {
            return None;
        }
        Some(MemorySample {
            percent_used: f64::from_bits(self.percent_bits.load(Ordering::Acquire)),
            sampled_at: nanos_to_instant(self.sampled_at_nanos.load(Ordering::Acquire)),
        })
    }

    /// Whether the gate is currently closed; open until a first sample exists
    #[must_use]
    pub fn is_over_threshold(&self) -> bool {
        self.latest()
            .is_some_and(|sample| sample.percent_used >= self.threshold_percent)
    }

    /// Start the background sampler; it stops when `shutdown` is cancelled
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) {
        let mut handle = self.sampler_handle.lock();
        if handle.is_some() {
            return;
        }

        if let Err(e) = self.sample_now() {
            warn!("Initial memory sample failed, gate stays open: {e:#}");
        }

        let monitor = Arc::clone(self);
        *handle = Some(tokio::spawn(async move {
            sample_loop(monitor, shutdown).await;
        }));
        info!(
            "Memory monitor started (threshold {:.1}%, every {:?})",
            self.threshold_percent, self.sample_interval
        );
    }

    /// Abort the background sampler if it is running
    pub fn stop(&self) {
        if let Some(handle) = self.sampler_handle.lock().take() {
            handle.abort();
        }
    }

    /// Hold a new execution until memory use drops below the threshold
    ///
    /// Executions already running are never pre-empted; only admission waits.
    ///
    /// # Errors
    /// `AdmissionTimeout(memory)` after `max_polls` polls with the gate still
    /// closed, or `SessionCancelled` if `cancel` fires first.
    pub async fn wait_for_admission(
        &self,
        poll_interval: Duration,
        max_polls: u32,
        cancel: &CancellationToken,
    ) -> DispatchResult<()> {
        if !self.is_over_threshold() {
            return Ok(());
        }

        debug!(
            "Memory above {:.1}%, holding admission",
            self.threshold_percent
        );
        for _ in 0..max_polls {
            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(DispatchError::cancelled(CancelReason::Caller));
                }
                () = tokio::time::sleep(poll_interval) => {}
            }
            if !self.is_over_threshold() {
                return Ok(());
            }
        }

        warn!(
            "Memory gate still closed after {max_polls} polls of {poll_interval:?}"
        );
        Err(DispatchError::admission_timeout(AdmissionGate::Memory))
    }
}

impl Drop for MemoryMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.sampler_handle.get_mut().take() {
            handle.abort();
        }
    }
}

/// Background task: the only regular writer of the sample
async fn sample_loop(monitor: Arc<MemoryMonitor>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(monitor.sample_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = monitor.sample_now() {
                    warn!("Memory sample failed, keeping previous value: {e:#}");
                }
            }
        }
    }

    debug!("Memory sample loop exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMINFO: &str = "MemTotal:       16000000 kB\n\
                           MemFree:         1000000 kB\n\
                           MemAvailable:    4000000 kB\n\
                           Buffers:          200000 kB\n";

    #[test]
    fn test_parse_meminfo() {
        let percent = SystemMemory::parse_meminfo(MEMINFO).expect("valid meminfo");
        assert!((percent - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_meminfo_missing_field() {
        let err = SystemMemory::parse_meminfo("MemTotal: 100 kB\n")
            .expect_err("MemAvailable is required");
        assert!(err.to_string().contains("MemAvailable"));
    }

    #[test]
    fn test_system_memory_reads_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("meminfo");
        std::fs::write(&path, MEMINFO).expect("write meminfo");

        let source = SystemMemory::with_path(&path);
        let percent = source.sample_percent().expect("readable meminfo");
        assert!((percent - 75.0).abs() < 1e-9);
    }
}
