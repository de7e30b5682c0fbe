//! # Keys & Time
//!
//! Key derivation and clock helpers shared by the cache and the rate limiter.
//!
//! Cache keys must be deterministic: two call sites caching the same logical
//! lookup have to land on the same key, no matter how their keyword arguments
//! were ordered. We hash the positional arguments in order and the keyword
//! pairs after sorting them, so `analyze(brand="x", product="y")` and
//! `analyze(product="y", brand="x")` collide on purpose.

use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Builds `"{namespace}:{hash}"` from the ordered arguments and sorted
/// keyword pairs of a lookup.
pub fn cache_key(namespace: &str, args: &[&str], kwargs: &[(&str, &str)]) -> String {
    let mut hasher = Sha256::new();

    for arg in args {
        hasher.update(arg.as_bytes());
        hasher.update([0u8]);
    }

    let mut sorted: Vec<(&str, &str)> = kwargs.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));

    for (key, value) in sorted {
        hasher.update(key.as_bytes());
        hasher.update([1u8]);
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    }

    format!("{namespace}:{}", hex::encode(&hasher.finalize()[..16]))
}

/// Key of the event window for one identifier under one policy scope.
pub fn rate_limit_key(identifier: &str, scope: &str) -> String {
    format!("ratelimit:{identifier}:{scope}")
}

#[cfg(test)]
mod tests {
    use super::{cache_key, rate_limit_key};

    #[test]
    fn test_equal_calls_equal_keys() {
        let a = cache_key("ingredient", &["niacinamide"], &[]);
        let b = cache_key("ingredient", &["niacinamide"], &[]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_kwarg_order_is_irrelevant() {
        let a = cache_key("analysis", &[], &[("brand", "x"), ("product", "y")]);
        let b = cache_key("analysis", &[], &[("product", "y"), ("brand", "x")]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_namespace_and_args_distinguish() {
        let a = cache_key("ingredient", &["retinol"], &[]);
        let b = cache_key("product", &["retinol"], &[]);
        let c = cache_key("ingredient", &["retinal"], &[]);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_key_has_namespace_prefix() {
        let key = cache_key("ingredient", &["123"], &[]);
        assert!(key.starts_with("ingredient:"));
    }

    #[test]
    fn test_rate_limit_key_format() {
        assert_eq!(
            rate_limit_key("user:42", "auth"),
            "ratelimit:user:42:auth"
        );
    }
}
