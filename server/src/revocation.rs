//! In-memory token revocation store.
//!
//! Tracks revoked JWT IDs (`jti`) until the tokens they belong to would have
//! expired anyway, plus per-user revocation cutoffs that invalidate every token
//! issued to a user up to a point in time.
//!
//! # Limitations
//!
//! The store lives in process memory: revocations are lost on restart and are
//! not shared between server instances. Tokens revoked before a restart become
//! valid again until they expire.
//!
//! # Example
//!
//! ```rust
//! use voicehub_server::revocation::TokenRevocationStore;
//!
//! let store = TokenRevocationStore::default();
//! let exp = chrono::Utc::now().timestamp() + 3600;
//!
//! assert!(store.revoke_token("token-id", Some(exp)));
//! assert!(store.is_token_revoked("token-id", "user-1", 0));
//! assert!(!store.is_token_revoked("other-id", "user-1", 0));
//! ```

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, trace};

/// Expiry assumed for a revoked token whose `exp` is unknown (24 hours).
pub const DEFAULT_REVOCATION_TTL_SECS: i64 = 24 * 3600;

/// Default retention for per-user cutoffs (30 days, the default refresh TTL).
const DEFAULT_USER_CUTOFF_RETENTION: Duration = Duration::from_secs(30 * 24 * 3600);

#[derive(Debug, Default)]
struct RevocationState {
    /// jti -> unix timestamp after which the entry can be dropped.
    tokens: HashMap<String, i64>,

    /// user id -> unix time in milliseconds; tokens issued at or before it
    /// are revoked.
    users: HashMap<String, i64>,
}

/// Thread-safe store of revoked tokens and users.
///
/// Clones share the same underlying state.
#[derive(Clone)]
pub struct TokenRevocationStore {
    state: Arc<RwLock<RevocationState>>,

    /// How long a per-user cutoff is kept. Must cover the longest token lifetime.
    user_cutoff_retention: Duration,
}

impl TokenRevocationStore {
    /// Creates an empty store.
    ///
    /// `user_cutoff_retention` should be at least the refresh token lifetime so
    /// that no token issued before a cutoff can outlive it.
    pub fn new(user_cutoff_retention: Duration) -> Self {
        debug!(
            retention_secs = user_cutoff_retention.as_secs(),
            "Creating token revocation store"
        );
        Self {
            state: Arc::new(RwLock::new(RevocationState::default())),
            user_cutoff_retention,
        }
    }

    /// Revokes a single token by its JWT ID.
    ///
    /// `expires_at` is the token's `exp` claim; when unknown the entry is kept
    /// for [`DEFAULT_REVOCATION_TTL_SECS`].
    ///
    /// Returns `false` if `jti` is empty.
    pub fn revoke_token(&self, jti: &str, expires_at: Option<i64>) -> bool {
        if jti.is_empty() {
            return false;
        }

        let expires_at =
            expires_at.unwrap_or_else(|| Utc::now().timestamp() + DEFAULT_REVOCATION_TTL_SECS);

        self.state
            .write()
            .unwrap()
            .tokens
            .insert(jti.to_string(), expires_at);

        trace!(expires_at, "Token revoked");
        true
    }

    /// Revokes every token issued to `user_id` up to now.
    ///
    /// Tokens issued later (e.g. after the user logs in again) are unaffected.
    pub fn revoke_all_user_tokens(&self, user_id: &str) -> bool {
        if user_id.is_empty() {
            return false;
        }

        let now_ms = Utc::now().timestamp_millis();
        let mut state = self.state.write().unwrap();

        // Tokens issued right after an earlier cutoff are stamped one
        // millisecond past it, so a new cutoff must move beyond that.
        let cutoff_ms = match state.users.get(user_id) {
            Some(previous) => now_ms.max(previous.saturating_add(1)),
            None => now_ms,
        };
        state.users.insert(user_id.to_string(), cutoff_ms);

        debug!(user_id = %user_id, cutoff_ms, "All user tokens revoked");
        true
    }

    /// Revokes every token issued to `user_id` at or before `cutoff_ms`
    /// (unix time in milliseconds).
    pub fn revoke_user_tokens_issued_before(&self, user_id: &str, cutoff_ms: i64) -> bool {
        if user_id.is_empty() {
            return false;
        }

        let mut state = self.state.write().unwrap();
        let entry = state.users.entry(user_id.to_string()).or_insert(cutoff_ms);
        *entry = (*entry).max(cutoff_ms);

        debug!(user_id = %user_id, cutoff_ms, "All user tokens revoked");
        true
    }

    /// Returns `true` if the token is revoked.
    ///
    /// A token is revoked when its `jti` is in the store (even if the entry is
    /// past its expiry and awaiting cleanup), or when its subject has a
    /// cutoff at or after `issued_at_ms`.
    pub fn is_token_revoked(&self, jti: &str, subject: &str, issued_at_ms: i64) -> bool {
        let state = self.state.read().unwrap();

        if state.tokens.contains_key(jti) {
            return true;
        }

        state
            .users
            .get(subject)
            .is_some_and(|cutoff| issued_at_ms <= *cutoff)
    }

    /// The user's revocation cutoff in milliseconds, if any.
    pub fn user_cutoff(&self, user_id: &str) -> Option<i64> {
        self.state.read().unwrap().users.get(user_id).copied()
    }

    /// Returns `true` if the user has an active revocation cutoff.
    pub fn is_user_revoked(&self, user_id: &str) -> bool {
        self.state.read().unwrap().users.contains_key(user_id)
    }

    /// Removes entries that no longer protect anything.
    ///
    /// Token entries are dropped once their expiry has passed; user cutoffs
    /// are dropped once they are older than the retention period.
    ///
    /// # Returns
    ///
    /// The number of token entries that were removed.
    pub fn cleanup_expired_tokens(&self) -> usize {
        self.cleanup_at(Utc::now().timestamp())
    }

    fn cleanup_at(&self, now: i64) -> usize {
        let retention_ms =
            i64::try_from(self.user_cutoff_retention.as_millis()).unwrap_or(i64::MAX);
        let now_ms = now.saturating_mul(1000);

        let mut state = self.state.write().unwrap();
        let initial_tokens = state.tokens.len();
        let initial_users = state.users.len();

        state.tokens.retain(|_, expires_at| *expires_at >= now);
        state
            .users
            .retain(|_, cutoff| cutoff.saturating_add(retention_ms) >= now_ms);

        let removed = initial_tokens - state.tokens.len();
        let removed_users = initial_users - state.users.len();

        if removed > 0 || removed_users > 0 {
            debug!(
                removed_count = removed,
                removed_user_count = removed_users,
                remaining_count = state.tokens.len(),
                "Cleaned up expired revocations"
            );
        }

        removed
    }

    /// Number of revoked token IDs currently tracked.
    pub fn revoked_token_count(&self) -> usize {
        self.state.read().unwrap().tokens.len()
    }

    /// Number of users with a revocation cutoff.
    pub fn revoked_user_count(&self) -> usize {
        self.state.read().unwrap().users.len()
    }

    /// Clears all revocations.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        let mut state = self.state.write().unwrap();
        let count = state.tokens.len() + state.users.len();
        state.tokens.clear();
        state.users.clear();
        debug!(cleared_count = count, "Cleared all revocations");
    }

    /// Spawns a background task that periodically removes expired entries.
    pub fn spawn_cleanup_task(&self, cleanup_interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);

            loop {
                interval.tick().await;
                store.cleanup_expired_tokens();
            }
        })
    }
}

impl Default for TokenRevocationStore {
    fn default() -> Self {
        Self::new(DEFAULT_USER_CUTOFF_RETENTION)
    }
}

impl std::fmt::Debug for TokenRevocationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (tokens, users) = self
            .state
            .read()
            .map(|s| (s.tokens.len(), s.users.len()))
            .unwrap_or((0, 0));
        f.debug_struct("TokenRevocationStore")
            .field("revoked_tokens", &tokens)
            .field("revoked_users", &users)
            .field("user_cutoff_retention", &self.user_cutoff_retention)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> i64 {
        Utc::now().timestamp()
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    #[test]
    fn test_revoke_and_check_token() {
        let store = TokenRevocationStore::default();

        assert!(store.revoke_token("jti-1", Some(now() + 60)));
        assert!(store.is_token_revoked("jti-1", "user-1", now()));
        assert!(!store.is_token_revoked("jti-2", "user-1", now()));
        assert_eq!(store.revoked_token_count(), 1);
    }

    #[test]
    fn test_revoke_empty_jti_is_rejected() {
        let store = TokenRevocationStore::default();

        assert!(!store.revoke_token("", Some(now() + 60)));
        assert_eq!(store.revoked_token_count(), 0);
    }

    #[test]
    fn test_missing_expiry_defaults_to_one_day() {
        let store = TokenRevocationStore::default();
        let before = now();

        store.revoke_token("jti-1", None);

        let expires_at = *store.state.read().unwrap().tokens.get("jti-1").unwrap();
        assert!(expires_at >= before + DEFAULT_REVOCATION_TTL_SECS);
        assert!(expires_at <= now() + DEFAULT_REVOCATION_TTL_SECS);
    }

    #[test]
    fn test_expired_entry_still_revoked_until_cleanup() {
        let store = TokenRevocationStore::default();
        store.revoke_token("old", Some(now() - 10));

        assert!(store.is_token_revoked("old", "user-1", 0));

        assert_eq!(store.cleanup_expired_tokens(), 1);
        assert!(!store.is_token_revoked("old", "user-1", 0));
    }

    #[test]
    fn test_cleanup_keeps_unexpired_entries() {
        let store = TokenRevocationStore::default();
        store.revoke_token("expired", Some(now() - 1));
        store.revoke_token("live", Some(now() + 3600));

        assert_eq!(store.cleanup_expired_tokens(), 1);
        assert!(store.is_token_revoked("live", "user-1", 0));
        assert_eq!(store.revoked_token_count(), 1);
    }

    #[test]
    fn test_revoke_all_user_tokens_affects_only_earlier_tokens() {
        let store = TokenRevocationStore::default();
        let cutoff = 1_000_500;

        assert!(store.revoke_user_tokens_issued_before("user-1", cutoff));

        assert!(store.is_token_revoked("any-jti", "user-1", cutoff - 100));
        assert!(store.is_token_revoked("any-jti", "user-1", cutoff));
        assert!(!store.is_token_revoked("any-jti", "user-1", cutoff + 1));
        assert!(!store.is_token_revoked("any-jti", "user-2", cutoff - 100));
        assert!(store.is_user_revoked("user-1"));
        assert_eq!(store.user_cutoff("user-1"), Some(cutoff));
        assert_eq!(store.user_cutoff("user-2"), None);
    }

    #[test]
    fn test_user_cutoff_only_moves_forward() {
        let store = TokenRevocationStore::default();

        store.revoke_user_tokens_issued_before("user-1", 2_000);
        store.revoke_user_tokens_issued_before("user-1", 1_000);

        assert!(store.is_token_revoked("jti", "user-1", 1_500));
    }

    #[test]
    fn test_revoke_all_user_tokens_uses_current_time() {
        let store = TokenRevocationStore::default();
        let issued = now_ms() - 5;

        store.revoke_all_user_tokens("user-1");

        assert!(store.is_token_revoked("jti", "user-1", issued));
        assert!(!store.is_token_revoked("jti", "user-1", now_ms() + 60_000));
    }

    #[test]
    fn test_repeated_revoke_all_always_advances() {
        let store = TokenRevocationStore::default();
        let future = now_ms() + 60_000;
        store.revoke_user_tokens_issued_before("user-1", future);

        store.revoke_all_user_tokens("user-1");

        assert_eq!(store.user_cutoff("user-1"), Some(future + 1));
        assert!(store.is_token_revoked("jti", "user-1", future + 1));
    }

    #[test]
    fn test_user_cutoffs_dropped_after_retention() {
        let store = TokenRevocationStore::new(Duration::from_secs(100));
        store.revoke_user_tokens_issued_before("user-1", 1_000_000);

        store.cleanup_at(1_050);
        assert_eq!(store.revoked_user_count(), 1);

        store.cleanup_at(1_101);
        assert_eq!(store.revoked_user_count(), 0);
    }

    #[test]
    fn test_clear_removes_everything() {
        let store = TokenRevocationStore::default();
        store.revoke_token("jti-1", None);
        store.revoke_all_user_tokens("user-1");

        store.clear();

        assert_eq!(store.revoked_token_count(), 0);
        assert_eq!(store.revoked_user_count(), 0);
    }

    #[test]
    fn test_clones_share_state() {
        let store = TokenRevocationStore::default();
        let clone = store.clone();

        store.revoke_token("shared", None);

        assert!(clone.is_token_revoked("shared", "user-1", 0));
    }

    #[test]
    fn test_debug_impl_shows_counts() {
        let store = TokenRevocationStore::default();
        store.revoke_token("jti-secret-value", None);

        let debug = format!("{store:?}");
        assert!(debug.contains("revoked_tokens: 1"));
        assert!(!debug.contains("jti-secret-value"));
    }

    #[test]
    fn test_concurrent_access() {
        use std::thread;

        let store = TokenRevocationStore::default();
        let handles: Vec<_> = (0..10)
            .map(|i| {
                let store = store.clone();
                thread::spawn(move || {
                    for j in 0..100 {
                        let jti = format!("jti-{i}-{j}");
                        store.revoke_token(&jti, None);
                        assert!(store.is_token_revoked(&jti, "user", 0));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.revoked_token_count(), 1000);
    }

    #[tokio::test]
    async fn test_cleanup_task_removes_expired_entries() {
        let store = TokenRevocationStore::default();
        store.revoke_token("expired", Some(now() - 10));

        let handle = store.spawn_cleanup_task(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        assert_eq!(store.revoked_token_count(), 0);
    }
}
