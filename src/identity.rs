//! Cache identity and refresh policy
//!
//! A [`CacheIdentity`] is the globally unique, stable key of one cache. It
//! never changes once a cache has produced artifacts, because the on-disk
//! directory is derived from it. [`CachePolicy`] carries the refresh options
//! attached to a cache definition.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{LarderError, LarderResult};

/// Globally unique cache key with a human-readable label.
///
/// Identities compare by their full namespace path. The same label under
/// different namespaces names different caches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheIdentity {
    segments: Vec<String>,
    label: String,
}

impl CacheIdentity {
    /// Create an identity with no namespace
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            segments: Vec::new(),
            label: label.into(),
        }
    }

    /// Create an identity under a namespace path
    pub fn namespaced<I, S>(segments: I, label: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
            label: label.into(),
        }
    }

    /// Human-readable label (last path component)
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Full slash-separated name, e.g. `reports/sales/monthly`
    pub fn qualified(&self) -> String {
        if self.segments.is_empty() {
            self.label.clone()
        } else {
            format!("{}/{}", self.segments.join("/"), self.label)
        }
    }

    /// Stable on-disk directory name derived from the qualified name.
    ///
    /// Hashing keeps directory names filesystem-safe regardless of what
    /// characters the label contains.
    pub fn directory_key(&self) -> String {
        let digest = Sha256::digest(self.qualified().as_bytes());
        hex::encode(&digest[..16])
    }
}

impl fmt::Display for CacheIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.qualified())
    }
}

/// When a cache is allowed to compute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RefreshMode {
    /// Refresh only on explicit request
    Manual,
    /// First fill is automatic, later refreshes are manual
    InitialOnly,
    /// Automatic initialization and refresh
    #[default]
    Automatic,
}

/// Refresh options attached to one cache definition
#[derive(Debug, Clone, Default)]
pub struct CachePolicy {
    mode: RefreshMode,
    period: Option<Duration>,
    exclusive: bool,
    blocking: bool,
}

impl CachePolicy {
    /// Create a policy with default options (automatic refresh)
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the refresh mode
    pub fn mode(mut self, mode: RefreshMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the expiry period. Useful for non-reactive sources like downloads.
    pub fn period(mut self, period: Duration) -> Self {
        self.period = Some(period);
        self
    }

    /// Prevent other caches from refreshing while this one is computing
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Suspend callers instead of failing while the cache is empty
    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    /// Current refresh mode
    pub fn refresh_mode(&self) -> RefreshMode {
        self.mode
    }

    /// Current expiry period, if any
    pub fn expiry_period(&self) -> Option<Duration> {
        self.period
    }

    /// Whether refreshes require the exclusive lock
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Whether empty reads suspend instead of failing
    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// Validate option combinations for the given cache
    pub fn validate(&self, identity: &CacheIdentity) -> LarderResult<()> {
        if let Some(period) = self.period {
            if period.is_zero() {
                return Err(LarderError::Policy {
                    cache: identity.qualified(),
                    reason: "expiry period must be positive".to_string(),
                });
            }
            if self.mode != RefreshMode::Automatic {
                return Err(LarderError::Policy {
                    cache: identity.qualified(),
                    reason: "expiry period requires automatic refresh".to_string(),
                });
            }
        }
        Ok(())
    }
}
