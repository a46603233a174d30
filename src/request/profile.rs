//! Browser profile and configuration fingerprint
//!
//! Two requests may share a page handle only if every field that shapes the
//! browser context is identical. The fingerprint is an explicit hash over the
//! normalized fields, so reuse never depends on reflective equality of the
//! full request.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use xxhash_rust::xxh3::Xxh3;

/// Viewport applied to every page opened for a profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

/// Browser/context configuration carried by a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserProfile {
    pub headless: bool,
    pub user_agent: Option<String>,
    pub viewport: Viewport,
    pub javascript_enabled: bool,
    /// Proxy server, e.g. `http://proxy.local:8080`
    pub proxy: Option<String>,
    pub locale: Option<String>,
    pub extra_headers: BTreeMap<String, String>,
}

impl Default for BrowserProfile {
    fn default() -> Self {
        Self {
            headless: true,
            user_agent: None,
            viewport: Viewport::default(),
            javascript_enabled: true,
            proxy: None,
            locale: None,
            extra_headers: BTreeMap::new(),
        }
    }
}

impl BrowserProfile {
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    #[must_use]
    pub fn with_viewport(mut self, width: u32, height: u32) -> Self {
        self.viewport = Viewport { width, height };
        self
    }

    #[must_use]
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_javascript(mut self, enabled: bool) -> Self {
        self.javascript_enabled = enabled;
        self
    }

    /// Deterministic key identifying interchangeable page handles
    ///
    /// Normalization: strings are trimmed, proxy and locale lowercased, header
    /// names lowercased (the map is ordered, so header order never matters).
    /// Every field is length-prefixed so adjacent fields cannot alias.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Xxh3::new();
        hasher.update(&[u8::from(self.headless), u8::from(self.javascript_enabled)]);
        hasher.update(&self.viewport.width.to_le_bytes());
        hasher.update(&self.viewport.height.to_le_bytes());
        write_opt(&mut hasher, self.user_agent.as_deref().map(str::trim));
        write_opt(
            &mut hasher,
            self.proxy.as_deref().map(|p| p.trim().to_ascii_lowercase()).as_deref(),
        );
        write_opt(
            &mut hasher,
            self.locale.as_deref().map(|l| l.trim().to_ascii_lowercase()).as_deref(),
        );

        let headers: BTreeMap<String, &str> = self
            .extra_headers
            .iter()
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim()))
            .collect();
        hasher.update(&(headers.len() as u64).to_le_bytes());
        for (name, value) in &headers {
            write_str(&mut hasher, name);
            write_str(&mut hasher, value);
        }

        Fingerprint(hasher.digest())
    }

    /// Subset of the profile that needs its own browser process
    ///
    /// Headless mode and proxy are launch flags; everything else is applied per tab.
    #[must_use]
    pub fn launch_key(&self) -> String {
        format!(
            "{}|{}",
            if self.headless { "headless" } else { "headful" },
            self.proxy
                .as_deref()
                .map(|p| p.trim().to_ascii_lowercase())
                .unwrap_or_default()
        )
    }
}

fn write_str(hasher: &mut Xxh3, value: &str) {
    hasher.update(&(value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}

fn write_opt(hasher: &mut Xxh3, value: Option<&str>) {
    match value {
        Some(v) => {
            hasher.update(&[1]);
            write_str(hasher, v);
        }
        None => hasher.update(&[0]),
    }
}

/// Normalized configuration key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(u64);

impl Fingerprint {
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0.to_be_bytes()))
    }
}
