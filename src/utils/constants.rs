//! Shared defaults for the dispatch subsystem
//!
//! Every tunable in [`crate::config::DispatchConfig`] falls back to one of these.

/// Default page pool size: 10 concurrently open pages
///
/// Each page is a browser tab with its own renderer. Ten tabs stay well under
/// 2GB of RSS on a typical documentation site.
pub const DEFAULT_MAX_PAGES: usize = 10;

/// Idle pages older than this are closed by the sweeper (5 minutes)
pub const DEFAULT_IDLE_TTL_SECS: u64 = 300;

/// How often the sweeper looks for expired idle pages
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;

/// Consecutive page-open failures before the pool stops admitting work
pub const DEFAULT_MAX_CONSECUTIVE_OPEN_FAILURES: u32 = 5;

/// Memory gate closes at 90% system memory use
pub const DEFAULT_MEMORY_THRESHOLD_PERCENT: f64 = 90.0;

/// Memory sampling interval
pub const DEFAULT_MEMORY_SAMPLE_INTERVAL_MS: u64 = 1_000;

/// Poll interval while a request waits on the memory gate
pub const DEFAULT_MEMORY_POLL_INTERVAL_MS: u64 = 500;

/// Polls before a memory-gated request gives up (one minute at the default interval)
pub const DEFAULT_MEMORY_MAX_POLLS: u32 = 120;

/// Base delay range between requests to the same destination
pub const DEFAULT_BASE_DELAY_SECS: (f64, f64) = (1.0, 3.0);

/// Ceiling for adaptive backoff
pub const DEFAULT_MAX_DELAY_SECS: f64 = 60.0;

/// Upper bound of the random offset added to every reservation
pub const DEFAULT_JITTER_SECS: f64 = 0.25;

/// Retries for rate-limited responses before the result is reported as failed
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Retries for failed fetches; off unless configured
pub const DEFAULT_FAILURE_RETRIES: u32 = 0;

/// Pause before a failed fetch is retried
pub const DEFAULT_RETRY_DELAY_SECS: f64 = 1.0;

/// HTTP status codes treated as "slow down" signals
pub const DEFAULT_RATE_LIMIT_CODES: [u16; 2] = [429, 503];

/// Backoff seed used when the current delay is zero
///
/// Doubling zero stays zero, so the first backoff step starts here instead.
pub const BACKOFF_SEED_MS: u64 = 250;

/// Maximum number of destinations tracked by the rate limiter
pub const MAX_TRACKED_DESTINATIONS: usize = 1000;

/// Largest value accepted for any second-valued setting (one year)
///
/// Deadlines are computed as `Instant + Duration`, which panics on overflow.
pub const MAX_DURATION_SECS: f64 = 31_536_000.0;

pub const DEFAULT_RATE_WAIT_TIMEOUT_SECS: f64 = 120.0;
pub const DEFAULT_POOL_ACQUIRE_TIMEOUT_SECS: f64 = 60.0;
pub const DEFAULT_FETCH_TIMEOUT_SECS: f64 = 60.0;

/// Time allowed for the first streamed result
pub const DEFAULT_STREAM_INIT_TIMEOUT_SECS: f64 = 30.0;

/// Time allowed for a whole stream session (10 minutes)
pub const DEFAULT_BATCH_PROCESS_TIMEOUT_SECS: f64 = 600.0;

/// Background workers draining the job queue
pub const DEFAULT_JOB_WORKERS: usize = 4;

/// Terminal jobs are kept this long before cleanup may reap them (5 minutes)
pub const DEFAULT_JOB_RETENTION_SECS: u64 = 300;

/// Chrome user agent string applied when a profile does not set one
///
/// Updated: 2025-01-29 to Chrome 132 (current stable)
pub const CHROME_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.6834.160 Safari/537.36";
