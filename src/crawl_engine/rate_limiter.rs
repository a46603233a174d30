//! Per-destination pacing with adaptive backoff
//!
//! Every destination carries a floor (`next_allowed_at`) and a current delay.
//! A caller reserves the slot `max(now, floor)` and pushes the floor forward by
//! the delay plus jitter while holding the destination's lock, then sleeps
//! until its slot outside the lock. Concurrent requests to one destination are
//! therefore spaced by at least `current_delay`, while different destinations
//! never contend.
//!
//! Key features:
//! - LRU cache with bounded capacity (max 1000 destinations)
//! - Independent mutex per destination
//! - Rate-limited and 5xx responses double the delay up to `max_delay`
//! - Successes reset the delay to a random base in `[base_min, base_max]`

use log::{debug, warn};
use lru::LruCache;
use parking_lot::Mutex;
use rand::Rng;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::crawl_types::{AdmissionGate, DispatchError, DispatchResult, RequestOutcome};
use crate::config::RateLimitConfig;
use crate::utils::{BACKOFF_SEED_MS, MAX_TRACKED_DESTINATIONS};

/// Pacing state of one destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestinationState {
    /// Earliest instant the next request may start; `None` until first use
    pub next_allowed_at: Option<Instant>,
    pub current_delay: Duration,
    pub consecutive_failures: u32,
}

/// Rate limiter shared by every dispatch path of one service
pub struct RateLimiter {
    config: RateLimitConfig,
    destinations: Mutex<LruCache<String, Arc<Mutex<DestinationState>>>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("tracked_destinations", &self.tracked_destinations())
            .finish()
    }
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_capacity(config, MAX_TRACKED_DESTINATIONS)
    }

    #[must_use]
    pub fn with_capacity(config: RateLimitConfig, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            destinations: Mutex::new(LruCache::new(capacity)),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Wait until `destination` may receive the next request
    ///
    /// The slot is reserved before sleeping; if it lies past `timeout` nothing
    /// is reserved and the call fails at once.
    ///
    /// # Errors
    /// `AdmissionTimeout(rate)` when the reserved slot would exceed `timeout`.
    pub async fn wait_turn(&self, destination: &str, timeout: Duration) -> DispatchResult<()> {
        let state = self.state_for(destination);
        let now = Instant::now();
        let deadline = now + timeout;

        let slot = {
            let mut state = state.lock();
            let slot = state.next_allowed_at.map_or(now, |floor| floor.max(now));
            if slot > deadline {
                debug!(
                    "Rate slot for {destination} is {:?} away, beyond the {:?} wait budget",
                    slot - now,
                    timeout
                );
                return Err(DispatchError::admission_timeout(AdmissionGate::Rate));
            }
            state.next_allowed_at = Some(slot + state.current_delay + self.jitter());
            slot
        };

        if slot > now {
            debug!("Waiting {:?} for rate slot on {destination}", slot - now);
            tokio::time::sleep_until(slot).await;
        }
        Ok(())
    }

    /// Feed an execution outcome back into the destination's pacing state
    ///
    /// Returns `true` when the outcome was a rate-limit response and the
    /// destination has not yet exhausted `max_retries`.
    pub fn on_result(&self, destination: &str, outcome: RequestOutcome) -> bool {
        let state = self.state_for(destination);
        let mut state = state.lock();

        if !outcome.is_throttling() {
            state.current_delay = self.base_delay();
            state.consecutive_failures = 0;
            return false;
        }

        let (base_min, _) = self.config.base_delay();
        let seed = Duration::from_millis(BACKOFF_SEED_MS);
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.current_delay = state
            .current_delay
            .saturating_mul(2)
            .max(seed)
            .min(self.config.max_delay())
            .max(base_min);

        let floor = Instant::now() + state.current_delay;
        state.next_allowed_at = Some(state.next_allowed_at.map_or(floor, |f| f.max(floor)));

        warn!(
            "{destination} answered {outcome:?} ({} in a row), backing off to {:?}",
            state.consecutive_failures, state.current_delay
        );

        outcome == RequestOutcome::RateLimited
            && state.consecutive_failures <= self.config.max_retries()
    }

    /// Current pacing state of `destination`, without touching LRU order
    #[must_use]
    pub fn snapshot(&self, destination: &str) -> Option<DestinationState> {
        let cache = self.destinations.lock();
        cache.peek(destination).map(|state| *state.lock())
    }

    /// Number of destinations currently tracked
    #[must_use]
    pub fn tracked_destinations(&self) -> usize {
        self.destinations.lock().len()
    }

    /// Forget every destination
    pub fn clear(&self) {
        self.destinations.lock().clear();
    }

    fn state_for(&self, destination: &str) -> Arc<Mutex<DestinationState>> {
        let mut cache = self.destinations.lock();
        if let Some(state) = cache.get(destination) {
            return Arc::clone(state);
        }

        let state = Arc::new(Mutex::new(DestinationState {
            next_allowed_at: None,
            current_delay: self.base_delay(),
            consecutive_failures: 0,
        }));
        cache.put(destination.to_string(), Arc::clone(&state));
        state
    }

    fn base_delay(&self) -> Duration {
        let (min, max) = self.config.base_delay();
        if max <= min {
            return min;
        }
        Duration::from_secs_f64(rand::rng().random_range(min.as_secs_f64()..=max.as_secs_f64()))
    }

    fn jitter(&self) -> Duration {
        let jitter = self.config.jitter();
        if jitter.is_zero() {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(rand::rng().random_range(0.0..=jitter.as_secs_f64()))
    }
}
