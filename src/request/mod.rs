//! Validated fetch request descriptors
//!
//! A `CrawlRequest` is built once from a URL and a browser profile; the
//! destination and configuration fingerprint are resolved at construction and
//! never change afterwards.

pub mod profile;

pub use profile::{BrowserProfile, Fingerprint, Viewport};

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;
use uuid::Uuid;

use crate::crawl_engine::crawl_types::DispatchError;

/// Unique identifier of one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One page fetch, immutable once admitted
#[derive(Debug, Clone)]
pub struct CrawlRequest {
    id: RequestId,
    url: Url,
    destination: String,
    profile: BrowserProfile,
    fingerprint: Fingerprint,
    stream: bool,
    priority: i32,
}

impl CrawlRequest {
    /// Build a request for `url` using `profile`
    ///
    /// # Errors
    /// Returns `InvalidRequest` if the URL does not parse or has no host.
    pub fn new(url: &str, profile: BrowserProfile) -> Result<Self, DispatchError> {
        let parsed = Url::parse(url).map_err(|e| DispatchError::InvalidRequest {
            message: format!("Failed to parse URL {url}: {e}"),
        })?;
        let destination = destination_of(&parsed).ok_or_else(|| DispatchError::InvalidRequest {
            message: format!("URL has no host: {url}"),
        })?;
        let fingerprint = profile.fingerprint();

        Ok(Self {
            id: RequestId::new(),
            url: parsed,
            destination,
            profile,
            fingerprint,
            stream: false,
            priority: 0,
        })
    }

    /// Request with the default profile
    ///
    /// # Errors
    /// Same as [`CrawlRequest::new`].
    pub fn for_url(url: &str) -> Result<Self, DispatchError> {
        Self::new(url, BrowserProfile::default())
    }

    #[must_use]
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Normalized host used as the rate-limiting key
    #[must_use]
    pub fn destination(&self) -> &str {
        &self.destination
    }

    #[must_use]
    pub fn profile(&self) -> &BrowserProfile {
        &self.profile
    }

    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    #[must_use]
    pub fn is_stream(&self) -> bool {
        self.stream
    }

    #[must_use]
    pub fn priority(&self) -> i32 {
        self.priority
    }
}

/// Lowercased host with a leading `www.` stripped; non-default ports kept
fn destination_of(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_lowercase();
    if host.is_empty() {
        return None;
    }
    let host = match host.strip_prefix("www.") {
        Some(rest) if !rest.is_empty() => rest.to_string(),
        _ => host,
    };
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_normalization() {
        let dest = |u: &str| {
            CrawlRequest::for_url(u)
                .expect("URL should be accepted")
                .destination()
                .to_string()
        };
        assert_eq!(dest("https://example.com/path"), "example.com");
        assert_eq!(dest("https://WWW.Example.com"), "example.com");
        assert_eq!(dest("https://sub.example.com/a?b=1"), "sub.example.com");
        assert_eq!(dest("http://example.com:8080/x"), "example.com:8080");
        assert_eq!(dest("https://example.com:443/x"), "example.com");
    }

    #[test]
    fn test_invalid_urls_are_rejected() {
        assert!(matches!(
            CrawlRequest::for_url("not a url"),
            Err(DispatchError::InvalidRequest { .. })
        ));
        assert!(matches!(
            CrawlRequest::for_url("data:text/plain,hello"),
            Err(DispatchError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = CrawlRequest::for_url("https://example.com").expect("valid URL");
        let b = CrawlRequest::for_url("https://example.com").expect("valid URL");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.fingerprint(), b.fingerprint());
    }
}
