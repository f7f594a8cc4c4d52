//! Cache configuration.

use std::num::NonZeroUsize;
use std::time::Duration;

/// Configuration for a [`TtlCache`](super::TtlCache).
#[derive(Debug, Clone, Default)]
pub struct CacheConfig {
    /// How long a computed value stays fresh. `None` means it never expires.
    pub ttl: Option<Duration>,
    /// Maximum number of keys held before the least recently used is evicted.
    pub capacity: Option<NonZeroUsize>,
}

impl CacheConfig {
    /// Unbounded cache whose entries never expire.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the entry TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Bound the number of keys. A capacity of zero leaves the cache unbounded.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = NonZeroUsize::new(capacity);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_never_expires_and_is_unbounded() {
        let config = CacheConfig::new();
        assert!(config.ttl.is_none());
        assert!(config.capacity.is_none());
    }

    #[test]
    fn test_builder() {
        let config = CacheConfig::new()
            .with_ttl(Duration::from_secs(60))
            .with_capacity(100);
        assert_eq!(config.ttl, Some(Duration::from_secs(60)));
        assert_eq!(config.capacity.map(NonZeroUsize::get), Some(100));

        assert!(CacheConfig::new().with_capacity(0).capacity.is_none());
    }
}
