//! Timeout utilities for page operations
//!
//! Provides async timeout wrappers so a hung navigation or backend call
//! surfaces as a fetch failure instead of holding a page forever.

use std::future::Future;
use std::time::Duration;

use super::crawl_types::FetchFailure;

/// Wrap a page operation with an explicit timeout
///
/// # Arguments
/// * `operation` - The async Future to execute with a timeout
/// * `timeout` - Upper bound for the operation
/// * `operation_name` - Human-readable name for error messages
///
/// # Returns
/// * `Ok(T)` - Operation completed successfully
/// * `Err` - Either the operation failed or the timeout was reached
pub async fn with_page_timeout<F, T>(
    operation: F,
    timeout: Duration,
    operation_name: &str,
) -> Result<T, FetchFailure>
where
    F: Future<Output = Result<T, FetchFailure>>,
{
    match tokio::time::timeout(timeout, operation).await {
        Ok(result) => result,
        Err(_) => Err(FetchFailure::new(format!(
            "{operation_name} timeout after {:.1} seconds",
            timeout.as_secs_f64()
        ))),
    }
}
