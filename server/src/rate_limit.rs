//! Sliding-window rate limiting keyed by salted hashes of IPs and user IDs.
//!
//! Each (key, limit type) pair keeps a queue of request timestamps. A request
//! is allowed when fewer than `max_requests` timestamps fall inside the
//! trailing window. Keys are hashed with SHA-256 and a configurable salt
//! before they are stored, so raw IP addresses never sit in memory or logs.
//!
//! # Limit Types
//!
//! | Type | Window | Max requests |
//! |------|--------|--------------|
//! | `auth` | 300 s | 5 |
//! | `api` | 60 s | 60 |
//! | `voice` | 60 s | 30 |
//!
//! # Example
//!
//! ```rust
//! use voicehub_server::rate_limit::{LimitType, RateLimiter};
//!
//! #[tokio::main]
//! async fn main() {
//!     let limiter = RateLimiter::new("salt");
//!
//!     let result = limiter
//!         .check_ip_rate_limit("203.0.113.7", LimitType::Api, true)
//!         .await;
//!     assert!(result.is_allowed());
//!     assert_eq!(result.info().remaining, 59);
//! }
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::warn;

/// Header carrying the request limit for the window.
pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";

/// Header carrying the requests left in the window.
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";

/// Header carrying the seconds until the oldest counted request expires.
pub const HEADER_RESET: &str = "X-RateLimit-Reset";

/// Header carrying the window length in seconds.
pub const HEADER_WINDOW: &str = "X-RateLimit-Window";

/// Category of rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitType {
    /// Login, registration and password reset attempts.
    Auth,
    /// General API traffic.
    Api,
    /// LiveKit token issuance.
    Voice,
}

impl LimitType {
    /// Parses a limit type name. Unknown names fall back to [`LimitType::Api`].
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "auth" => Self::Auth,
            "voice" => Self::Voice,
            _ => Self::Api,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Api => "api",
            Self::Voice => "voice",
        }
    }

    fn default_limit(&self) -> LimitConfig {
        match self {
            Self::Auth => LimitConfig::new(Duration::from_secs(300), 5),
            Self::Api => LimitConfig::new(Duration::from_secs(60), 60),
            Self::Voice => LimitConfig::new(Duration::from_secs(60), 30),
        }
    }
}

impl fmt::Display for LimitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Window length and request budget for one limit type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitConfig {
    pub window: Duration,
    pub max_requests: u32,
}

impl LimitConfig {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
        }
    }
}

/// Snapshot of a key's usage, suitable for `X-RateLimit-*` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitInfo {
    /// Maximum requests per window.
    pub limit: u32,
    /// Requests left in the current window.
    pub remaining: u32,
    /// Seconds until the oldest counted request leaves the window (0 if none).
    pub reset_secs: u64,
    /// Window length in seconds.
    pub window_secs: u64,
}

impl LimitInfo {
    /// Header name/value pairs describing this snapshot.
    pub fn headers(&self) -> [(&'static str, String); 4] {
        [
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
            (HEADER_RESET, self.reset_secs.to_string()),
            (HEADER_WINDOW, self.window_secs.to_string()),
        ]
    }
}

/// Result of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    /// The request is allowed to proceed.
    Allowed(LimitInfo),

    /// The request is rate limited.
    ///
    /// The client should wait for `retry_after_secs` seconds before
    /// retrying. This value should be returned in the `Retry-After` header.
    Limited {
        info: LimitInfo,
        /// Number of seconds until the client can retry (at least 1).
        retry_after_secs: u64,
    },
}

impl RateLimitResult {
    /// Returns `true` if the request is allowed.
    #[inline]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }

    /// Returns `true` if the request is rate limited.
    #[inline]
    pub fn is_limited(&self) -> bool {
        matches!(self, Self::Limited { .. })
    }

    /// Returns the retry-after duration if rate limited, or `None` if allowed.
    #[inline]
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::Allowed(_) => None,
            Self::Limited {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
        }
    }

    /// Usage snapshot for response headers.
    #[inline]
    pub fn info(&self) -> LimitInfo {
        match self {
            Self::Allowed(info) | Self::Limited { info, .. } => *info,
        }
    }
}

/// Thread-safe sliding-window rate limiter.
///
/// Cloning is cheap and clones share state, so one limiter can be handed to
/// every service and to the HTTP middleware.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<RwLock<RateLimiterInner>>,
    salt: Arc<str>,
}

struct RateLimiterInner {
    /// Request timestamps per (hashed key, limit type), oldest first.
    windows: HashMap<(String, LimitType), VecDeque<Instant>>,

    /// Active limits per type.
    limits: HashMap<LimitType, LimitConfig>,
}

impl RateLimiterInner {
    fn limit_for(&self, limit_type: LimitType) -> LimitConfig {
        self.limits
            .get(&limit_type)
            .copied()
            .unwrap_or_else(|| limit_type.default_limit())
    }
}

impl RateLimiter {
    /// Creates a rate limiter with the default limits and the given salt.
    pub fn new(salt: impl Into<String>) -> Self {
        let limits = [LimitType::Auth, LimitType::Api, LimitType::Voice]
            .into_iter()
            .map(|t| (t, t.default_limit()))
            .collect();

        Self {
            inner: Arc::new(RwLock::new(RateLimiterInner {
                windows: HashMap::new(),
                limits,
            })),
            salt: Arc::from(salt.into()),
        }
    }

    /// Checks whether a request for `key` is within the `limit_type` budget.
    ///
    /// Timestamps older than the window are discarded first. The request is
    /// recorded only when `increment` is true and the request is allowed, so
    /// callers can check a limit and count the attempt later (e.g. only
    /// failed logins).
    pub async fn check_rate_limit(
        &self,
        key: &str,
        limit_type: LimitType,
        increment: bool,
    ) -> RateLimitResult {
        let hashed_key = self.hash_key(key);
        let now = Instant::now();

        let mut inner = self.inner.write().await;
        let limit = inner.limit_for(limit_type);

        // Read-only checks must not create queues for keys that were never counted.
        let window_key = (hashed_key.clone(), limit_type);
        let mut untracked = VecDeque::new();
        let timestamps = if increment {
            inner.windows.entry(window_key).or_default()
        } else {
            inner
                .windows
                .get_mut(&window_key)
                .unwrap_or(&mut untracked)
        };

        while timestamps
            .front()
            .is_some_and(|t| now.duration_since(*t) >= limit.window)
        {
            timestamps.pop_front();
        }

        let allowed = timestamps.len() < limit.max_requests as usize;
        if increment && allowed {
            timestamps.push_back(now);
        }

        let count = u32::try_from(timestamps.len()).unwrap_or(u32::MAX);
        let reset_secs = timestamps
            .front()
            .map(|oldest| {
                (*oldest + limit.window)
                    .saturating_duration_since(now)
                    .as_secs()
            })
            .unwrap_or(0);

        let info = LimitInfo {
            limit: limit.max_requests,
            remaining: limit.max_requests.saturating_sub(count),
            reset_secs,
            window_secs: limit.window.as_secs(),
        };

        if allowed {
            return RateLimitResult::Allowed(info);
        }

        warn!(
            key_prefix = &hashed_key[..8],
            limit_type = %limit_type,
            max_requests = limit.max_requests,
            window_secs = info.window_secs,
            "Rate limit exceeded"
        );

        RateLimitResult::Limited {
            info,
            retry_after_secs: reset_secs.max(1),
        }
    }

    /// Rate limit keyed by client IP, normalised to its network prefix.
    pub async fn check_ip_rate_limit(
        &self,
        ip: &str,
        limit_type: LimitType,
        increment: bool,
    ) -> RateLimitResult {
        self.check_rate_limit(&normalize_ip(ip), limit_type, increment)
            .await
    }

    /// Rate limit keyed by authenticated user ID.
    pub async fn check_user_rate_limit(
        &self,
        user_id: &str,
        limit_type: LimitType,
        increment: bool,
    ) -> RateLimitResult {
        self.check_rate_limit(&user_key(user_id), limit_type, increment)
            .await
    }

    /// Clears recorded requests for `key`, for one limit type or all of them.
    pub async fn reset_limits(&self, key: &str, limit_type: Option<LimitType>) {
        let hashed_key = self.hash_key(key);
        let mut inner = self.inner.write().await;

        match limit_type {
            Some(limit_type) => {
                inner.windows.remove(&(hashed_key, limit_type));
            }
            None => inner.windows.retain(|(k, _), _| *k != hashed_key),
        }
    }

    /// Clears recorded requests for a client IP.
    pub async fn reset_ip_limits(&self, ip: &str, limit_type: Option<LimitType>) {
        self.reset_limits(&normalize_ip(ip), limit_type).await;
    }

    /// Replaces the window and budget for a limit type.
    pub async fn update_limit(&self, limit_type: LimitType, window: Duration, max_requests: u32) {
        let mut inner = self.inner.write().await;
        inner
            .limits
            .insert(limit_type, LimitConfig::new(window, max_requests));
    }

    /// Returns the active limit for a type.
    pub async fn limit(&self, limit_type: LimitType) -> LimitConfig {
        self.inner.read().await.limit_for(limit_type)
    }

    /// Drops timestamps outside their window and removes empty queues.
    ///
    /// # Returns
    ///
    /// The number of queues that were removed.
    pub async fn cleanup_stale_entries(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let limits = inner.limits.clone();
        let initial_count = inner.windows.len();

        inner.windows.retain(|(_, limit_type), timestamps| {
            let window = limits
                .get(limit_type)
                .map(|l| l.window)
                .unwrap_or_else(|| limit_type.default_limit().window);
            while timestamps
                .front()
                .is_some_and(|t| now.duration_since(*t) >= window)
            {
                timestamps.pop_front();
            }
            !timestamps.is_empty()
        });

        initial_count - inner.windows.len()
    }

    /// Returns the number of tracked (key, type) queues.
    pub async fn key_count(&self) -> usize {
        self.inner.read().await.windows.len()
    }

    /// Spawns a background task that periodically cleans up stale entries.
    ///
    /// # Returns
    ///
    /// A `JoinHandle` for the spawned task. The task runs until aborted.
    pub fn spawn_cleanup_task(&self, cleanup_interval: Duration) -> tokio::task::JoinHandle<()> {
        let limiter = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);

            loop {
                interval.tick().await;
                let removed = limiter.cleanup_stale_entries().await;
                if removed > 0 {
                    tracing::debug!(
                        removed_count = removed,
                        "Cleaned up stale rate limit entries"
                    );
                }
            }
        })
    }

    fn hash_key(&self, key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hasher.update(self.salt.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new("default_salt")
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("salt", &"<redacted>")
            .finish_non_exhaustive()
    }
}

/// Reduces an IP address to its network prefix: `/24` for IPv4 and the first
/// four groups for IPv6. Anything that does not parse is returned unchanged.
pub fn normalize_ip(ip: &str) -> String {
    match ip.trim().parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            let [a, b, c, _] = v4.octets();
            format!("{a}.{b}.{c}.0")
        }
        Ok(IpAddr::V6(v6)) => {
            let s = v6.segments();
            format!("{:x}:{:x}:{:x}:{:x}::", s[0], s[1], s[2], s[3])
        }
        Err(_) => ip.to_string(),
    }
}

fn user_key(user_id: &str) -> String {
    format!("user:{user_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test that requests under the limit are allowed.
    #[tokio::test]
    async fn allows_requests_under_limit() {
        let limiter = RateLimiter::new("salt");

        for i in 0..5 {
            let result = limiter.check_rate_limit("client", LimitType::Auth, true).await;
            assert!(result.is_allowed(), "Request {} should be allowed", i + 1);
            assert_eq!(result.info().remaining, 4 - i);
        }
    }

    /// Test that requests over the limit are blocked.
    #[tokio::test]
    async fn blocks_requests_over_limit() {
        let limiter = RateLimiter::new("salt");

        for _ in 0..5 {
            assert!(limiter
                .check_rate_limit("client", LimitType::Auth, true)
                .await
                .is_allowed());
        }

        let result = limiter.check_rate_limit("client", LimitType::Auth, true).await;
        assert!(result.is_limited());
        assert_eq!(result.info().remaining, 0);
        assert!(result.retry_after().unwrap() >= 1);
        assert!(result.retry_after().unwrap() <= 300);
    }

    #[tokio::test]
    async fn check_without_increment_does_not_count() {
        let limiter = RateLimiter::new("salt");

        for _ in 0..10 {
            let result = limiter.check_rate_limit("peek", LimitType::Auth, false).await;
            assert!(result.is_allowed());
            assert_eq!(result.info().remaining, 5);
            assert_eq!(result.info().reset_secs, 0);
        }

        assert_eq!(limiter.key_count().await, 0);
    }

    #[tokio::test]
    async fn rejected_requests_are_not_recorded() {
        let limiter = RateLimiter::new("salt");
        limiter.update_limit(LimitType::Api, Duration::from_millis(200), 2).await;

        for _ in 0..5 {
            limiter.check_rate_limit("client", LimitType::Api, true).await;
        }

        tokio::time::sleep(Duration::from_millis(250)).await;

        let result = limiter.check_rate_limit("client", LimitType::Api, true).await;
        assert!(result.is_allowed());
        assert_eq!(result.info().remaining, 1);
    }

    /// Test that the window slides.
    #[tokio::test]
    async fn window_slides_over_time() {
        let limiter = RateLimiter::new("salt");
        limiter.update_limit(LimitType::Api, Duration::from_millis(100), 2).await;

        for _ in 0..2 {
            limiter.check_rate_limit("client", LimitType::Api, true).await;
        }
        assert!(limiter
            .check_rate_limit("client", LimitType::Api, true)
            .await
            .is_limited());

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(limiter
            .check_rate_limit("client", LimitType::Api, true)
            .await
            .is_allowed());
    }

    /// Test that different keys and types are tracked independently.
    #[tokio::test]
    async fn independent_key_and_type_tracking() {
        let limiter = RateLimiter::new("salt");

        for _ in 0..5 {
            limiter.check_rate_limit("key-1", LimitType::Auth, true).await;
        }
        assert!(limiter
            .check_rate_limit("key-1", LimitType::Auth, true)
            .await
            .is_limited());

        assert!(limiter
            .check_rate_limit("key-2", LimitType::Auth, true)
            .await
            .is_allowed());
        assert!(limiter
            .check_rate_limit("key-1", LimitType::Api, true)
            .await
            .is_allowed());
    }

    #[tokio::test]
    async fn reset_limits_for_single_type() {
        let limiter = RateLimiter::new("salt");
        for _ in 0..5 {
            limiter.check_rate_limit("key", LimitType::Auth, true).await;
        }
        limiter.check_rate_limit("key", LimitType::Api, true).await;

        limiter.reset_limits("key", Some(LimitType::Auth)).await;

        let auth = limiter.check_rate_limit("key", LimitType::Auth, false).await;
        assert_eq!(auth.info().remaining, 5);
        let api = limiter.check_rate_limit("key", LimitType::Api, false).await;
        assert_eq!(api.info().remaining, 59);
    }

    #[tokio::test]
    async fn reset_limits_for_all_types() {
        let limiter = RateLimiter::new("salt");
        limiter.check_rate_limit("key", LimitType::Auth, true).await;
        limiter.check_rate_limit("key", LimitType::Voice, true).await;
        limiter.check_rate_limit("other", LimitType::Voice, true).await;

        limiter.reset_limits("key", None).await;

        assert_eq!(limiter.key_count().await, 1);
    }

    #[tokio::test]
    async fn ip_limits_share_network_prefix() {
        let limiter = RateLimiter::new("salt");

        for i in 0..5 {
            let ip = format!("198.51.100.{i}");
            limiter.check_ip_rate_limit(&ip, LimitType::Auth, true).await;
        }

        assert!(limiter
            .check_ip_rate_limit("198.51.100.200", LimitType::Auth, true)
            .await
            .is_limited());

        limiter
            .reset_ip_limits("198.51.100.9", Some(LimitType::Auth))
            .await;
        assert!(limiter
            .check_ip_rate_limit("198.51.100.1", LimitType::Auth, true)
            .await
            .is_allowed());
    }

    #[tokio::test]
    async fn user_limits_are_separate_from_raw_keys() {
        let limiter = RateLimiter::new("salt");
        for _ in 0..30 {
            limiter
                .check_user_rate_limit("abc", LimitType::Voice, true)
                .await;
        }

        assert!(limiter
            .check_user_rate_limit("abc", LimitType::Voice, true)
            .await
            .is_limited());
        assert!(limiter
            .check_rate_limit("abc", LimitType::Voice, true)
            .await
            .is_allowed());
    }

    #[tokio::test]
    async fn update_limit_changes_budget() {
        let limiter = RateLimiter::new("salt");
        limiter.update_limit(LimitType::Voice, Duration::from_secs(10), 1).await;

        assert_eq!(
            limiter.limit(LimitType::Voice).await,
            LimitConfig::new(Duration::from_secs(10), 1)
        );
        assert!(limiter
            .check_rate_limit("k", LimitType::Voice, true)
            .await
            .is_allowed());
        let limited = limiter.check_rate_limit("k", LimitType::Voice, true).await;
        assert!(limited.is_limited());
        assert_eq!(limited.info().window_secs, 10);
    }

    #[tokio::test]
    async fn reset_secs_tracks_oldest_request() {
        let limiter = RateLimiter::new("salt");

        let result = limiter.check_rate_limit("k", LimitType::Api, true).await;

        let info = result.info();
        assert!(info.reset_secs <= 60 && info.reset_secs >= 59);
        assert_eq!(info.window_secs, 60);
        assert_eq!(info.limit, 60);
    }

    #[tokio::test]
    async fn cleanup_removes_only_expired_queues() {
        let limiter = RateLimiter::new("salt");
        limiter.update_limit(LimitType::Api, Duration::from_millis(20), 10).await;

        limiter.check_rate_limit("short-1", LimitType::Api, true).await;
        limiter.check_rate_limit("short-2", LimitType::Api, true).await;
        limiter.check_rate_limit("long", LimitType::Auth, true).await;
        limiter.check_rate_limit("peek", LimitType::Auth, false).await;

        tokio::time::sleep(Duration::from_millis(40)).await;

        let removed = limiter.cleanup_stale_entries().await;
        assert_eq!(removed, 2);
        assert_eq!(limiter.key_count().await, 1);
    }

    /// Test that the rate limiter can be cloned and shared.
    #[tokio::test]
    async fn cloneable_and_shareable() {
        let limiter = RateLimiter::new("salt");
        let limiter_clone = limiter.clone();

        for _ in 0..5 {
            limiter.check_rate_limit("shared", LimitType::Auth, true).await;
        }

        assert!(limiter_clone
            .check_rate_limit("shared", LimitType::Auth, true)
            .await
            .is_limited());
    }

    #[test]
    fn keys_are_salted_hashes() {
        let a = RateLimiter::new("salt-a");
        let b = RateLimiter::new("salt-b");

        let hashed = a.hash_key("10.0.0.1");
        assert_eq!(hashed.len(), 64);
        assert!(!hashed.contains("10.0.0.1"));
        assert_eq!(hashed, a.hash_key("10.0.0.1"));
        assert_ne!(hashed, b.hash_key("10.0.0.1"));
    }

    #[test]
    fn normalize_ip_truncates_to_network() {
        assert_eq!(normalize_ip("192.168.1.77"), "192.168.1.0");
        assert_eq!(
            normalize_ip("2001:db8:85a3:1234:5678:8a2e:370:7334"),
            "2001:db8:85a3:1234::"
        );
        assert_eq!(normalize_ip("not-an-ip"), "not-an-ip");
    }

    #[test]
    fn limit_type_parsing_falls_back_to_api() {
        assert_eq!(LimitType::from_name("auth"), LimitType::Auth);
        assert_eq!(LimitType::from_name("VOICE"), LimitType::Voice);
        assert_eq!(LimitType::from_name("upload"), LimitType::Api);
    }

    #[test]
    fn headers_expose_limit_info() {
        let info = LimitInfo {
            limit: 60,
            remaining: 12,
            reset_secs: 30,
            window_secs: 60,
        };

        let headers = info.headers();
        assert_eq!(headers[0], (HEADER_LIMIT, "60".to_string()));
        assert_eq!(headers[1], (HEADER_REMAINING, "12".to_string()));
        assert_eq!(headers[2], (HEADER_RESET, "30".to_string()));
        assert_eq!(headers[3], (HEADER_WINDOW, "60".to_string()));
    }

    /// Test RateLimitResult helper methods.
    #[test]
    fn rate_limit_result_helpers() {
        let info = LimitInfo {
            limit: 5,
            remaining: 0,
            reset_secs: 7,
            window_secs: 300,
        };

        let allowed = RateLimitResult::Allowed(info);
        assert!(allowed.is_allowed());
        assert_eq!(allowed.retry_after(), None);

        let limited = RateLimitResult::Limited {
            info,
            retry_after_secs: 7,
        };
        assert!(limited.is_limited());
        assert_eq!(limited.retry_after(), Some(7));
        assert_eq!(limited.info(), info);
    }
}
