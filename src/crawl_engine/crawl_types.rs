//! Core types shared by every dispatch path.
//!
//! This module contains the error taxonomy, the opaque fetch payload returned by
//! a backend, the outcome classification fed back into the rate limiter, and the
//! per-request `CrawlResult` handed to callers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::request::{CrawlRequest, RequestId};

/// Admission gate that refused or timed out a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionGate {
    Memory,
    Rate,
    Pool,
}

impl fmt::Display for AdmissionGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => write!(f, "memory gate"),
            Self::Rate => write!(f, "rate limiter"),
            Self::Pool => write!(f, "page pool"),
        }
    }
}

/// Why a stream session stopped before all requests resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The caller closed or dropped the session
    Caller,
    /// `batch_process_timeout` elapsed
    Timeout,
    /// The service is shutting down
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Caller => write!(f, "closed by caller"),
            Self::Timeout => write!(f, "session deadline elapsed"),
            Self::Shutdown => write!(f, "service shutting down"),
        }
    }
}

/// Error taxonomy for dispatch operations
///
/// Clonable and serializable so it can be stored in job records and sent across
/// stream sessions unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatchError {
    /// A gate was not cleared within its bounded wait
    #[error("admission timed out waiting on the {gate}")]
    AdmissionTimeout { gate: AdmissionGate },

    /// The backend reported a failure for this request
    #[error("fetch failed: {reason}")]
    FetchFailure {
        reason: String,
        status_code: Option<u16>,
    },

    /// Poll on an unknown or reaped task id
    #[error("job not found: {task_id}")]
    JobNotFound { task_id: String },

    /// Stream closed by the caller, by its deadline, or by shutdown
    #[error("stream session cancelled: {reason}")]
    SessionCancelled { reason: CancelReason },

    /// No result arrived before `stream_init_timeout`
    #[error("stream produced no result within {waited_ms}ms")]
    StreamInitTimeout { waited_ms: u64 },

    /// The backend could not open a page for this configuration
    #[error("failed to open page: {message}")]
    PageOpen { message: String },

    /// Request descriptor could not be built
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// Configuration rejected at build time
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Fatal: the dispatcher no longer admits new work
    #[error("dispatcher unavailable: {message}")]
    Unavailable { message: String },

    /// A worker task panicked or was aborted
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl DispatchError {
    pub fn admission_timeout(gate: AdmissionGate) -> Self {
        Self::AdmissionTimeout { gate }
    }

    pub fn cancelled(reason: CancelReason) -> Self {
        Self::SessionCancelled { reason }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Failures a retry might cure: fetch errors, page opens and admission timeouts
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::FetchFailure { .. } | Self::PageOpen { .. } | Self::AdmissionTimeout { .. }
        )
    }

    /// Fatal errors stop new admissions; everything else degrades one request.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

impl From<FetchFailure> for DispatchError {
    fn from(failure: FetchFailure) -> Self {
        Self::FetchFailure {
            reason: failure.reason,
            status_code: failure.status_code,
        }
    }
}

/// Convenience alias for Result with `DispatchError`
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Opaque payload produced by a backend for one request
///
/// The dispatcher never looks inside `content`; only `status_code` is read, to
/// classify the outcome for the rate limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchPayload {
    pub status_code: Option<u16>,
    pub final_url: Option<String>,
    pub content: String,
}

/// Failure reported by a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchFailure {
    pub reason: String,
    pub status_code: Option<u16>,
}

impl FetchFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            status_code: None,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (HTTP {code})", self.reason),
            None => write!(f, "{}", self.reason),
        }
    }
}

/// Outcome of one execution as seen by the rate limiter
///
/// Different outcomes move the destination delay in different directions:
/// - Success and plain failures reset it to the base value
/// - Rate limiting and server errors double it up to the ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Page fetched with a non-throttling status
    Success,
    /// Status code in the configured rate-limit set (429, 503 by default)
    RateLimited,
    /// Any other 5xx
    ServerError,
    /// Failure without a throttling signal (DNS, navigation, timeout)
    Failed,
}

impl RequestOutcome {
    /// Classify a status code (if any) against the configured rate-limit codes
    #[must_use]
    pub fn classify(status_code: Option<u16>, fetched: bool, rate_limit_codes: &[u16]) -> Self {
        match status_code {
            Some(code) if rate_limit_codes.contains(&code) => Self::RateLimited,
            Some(code) if (500..600).contains(&code) => Self::ServerError,
            _ if fetched => Self::Success,
            _ => Self::Failed,
        }
    }

    /// Outcomes that grow the destination delay
    #[must_use]
    pub fn is_throttling(self) -> bool {
        matches!(self, Self::RateLimited | Self::ServerError)
    }
}

/// Per-request result handed back to callers
///
/// Exactly one of `payload` / `error` is set, mirroring `success`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlResult {
    pub request_id: RequestId,
    pub url: String,
    pub success: bool,
    pub payload: Option<FetchPayload>,
    pub error: Option<DispatchError>,
    /// Attempts made, counting rate-limit and failure retries
    pub attempts: u32,
    pub elapsed_ms: u64,
}

impl CrawlResult {
    pub(crate) fn from_outcome(
        request: &CrawlRequest,
        outcome: DispatchResult<FetchPayload>,
        attempts: u32,
        elapsed: Duration,
    ) -> Self {
        let (success, payload, error) = match outcome {
            Ok(payload) => (true, Some(payload), None),
            Err(error) => (false, None, Some(error)),
        };
        Self {
            request_id: request.id(),
            url: request.url().to_string(),
            success,
            payload,
            error,
            attempts,
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Error entry for a request whose task never produced a result
    pub(crate) fn failed(request_id: RequestId, url: String, error: DispatchError) -> Self {
        Self {
            request_id,
            url,
            success: false,
            payload: None,
            error: Some(error),
            attempts: 0,
            elapsed_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_classification() {
        let codes = [429, 503];
        assert_eq!(
            RequestOutcome::classify(Some(200), true, &codes),
            RequestOutcome::Success
        );
        assert_eq!(
            RequestOutcome::classify(Some(429), true, &codes),
            RequestOutcome::RateLimited
        );
        assert_eq!(
            RequestOutcome::classify(Some(503), false, &codes),
            RequestOutcome::RateLimited
        );
        assert_eq!(
            RequestOutcome::classify(Some(502), true, &codes),
            RequestOutcome::ServerError
        );
        assert_eq!(
            RequestOutcome::classify(None, false, &codes),
            RequestOutcome::Failed
        );
        assert_eq!(
            RequestOutcome::classify(Some(404), false, &codes),
            RequestOutcome::Failed
        );
    }

    #[test]
    fn test_error_serializes_with_kind_tag() {
        let err = DispatchError::admission_timeout(AdmissionGate::Pool);
        let json = serde_json::to_value(&err).expect("error should serialize");
        assert_eq!(json["kind"], "admission_timeout");
        assert_eq!(json["gate"], "pool");

        let back: DispatchError = serde_json::from_value(json).expect("error should deserialize");
        assert_eq!(back, err);
    }

    #[test]
    fn test_only_unavailable_is_fatal() {
        assert!(DispatchError::unavailable("pool poisoned").is_fatal());
        assert!(!DispatchError::admission_timeout(AdmissionGate::Rate).is_fatal());
        assert!(!DispatchError::from(FetchFailure::new("boom")).is_fatal());
    }
}
