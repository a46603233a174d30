//! Configuration module for crawl dispatch
//!
//! This module provides the `DispatchConfig` struct, its fluent builder and the
//! Chromium launch settings, with validation and sensible defaults.

// Sub-modules
pub mod builder;
pub mod getters;
pub mod types;

// Re-exports for public API
pub use builder::DispatchConfigBuilder;
pub use types::{BrowserLaunchConfig, DispatchConfig, RateLimitConfig, RetryConfig};
