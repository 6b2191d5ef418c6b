//! Cache key construction
//!
//! All keys carry a version prefix so a schema change can invalidate every
//! cached value by bumping `CACHE_KEY_VERSION`.

use crate::core::constants::CACHE_KEY_VERSION;

/// Namespaced cache key builder
pub struct CacheKey;

impl CacheKey {
    fn build(parts: &[&str]) -> String {
        let mut key = String::from(CACHE_KEY_VERSION);
        for part in parts {
            key.push(':');
            key.push_str(part);
        }
        key
    }

    /// Canonical presence entry for an identity
    pub fn presence(identity: &str) -> String {
        Self::build(&["presence", identity])
    }

    /// Rate limit window counter
    pub fn rate_limit(bucket: &str, identifier: &str) -> String {
        Self::build(&["rl", bucket, identifier])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_versioned_and_namespaced() {
        assert_eq!(CacheKey::presence("alice"), "v1:presence:alice");
        assert_eq!(CacheKey::rate_limit("messages", "alice"), "v1:rl:messages:alice");
    }
}
