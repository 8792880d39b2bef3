//! Per-user session store: current-state name with TTL.
//!
//! Expiry is fail-closed: a read landing exactly at the deadline is already
//! expired. Reads lazily drop the stale entry they hit; a periodic sweep
//! (driven by the dispatcher) reclaims the rest.

use std::time::Duration;

use dashmap::DashMap;
use teloxide::types::UserId;
use tokio::time::Instant;

struct SessionEntry {
    state: String,
    expires_at: Instant,
}

/// Concurrency-safe map from user id to current-state name, with per-entry
/// TTL. State-name validity is the dispatcher's concern; the store only
/// tracks the assignment.
pub(crate) struct SessionStore {
    entries: DashMap<UserId, SessionEntry>,
    ttl: Duration,
}

impl SessionStore {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Stores or refreshes the user's state assignment, restarting the TTL.
    pub(crate) fn insert(&self, user: UserId, state: String) {
        self.entries.insert(
            user,
            SessionEntry {
                state,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Returns the user's live state name, if any. Expired entries are
    /// invisible immediately and removed on the way out.
    pub(crate) fn get(&self, user: UserId) -> Option<String> {
        let expired = match self.entries.get(&user) {
            Some(entry) => {
                if Instant::now() < entry.expires_at {
                    return Some(entry.state.clone());
                }
                true
            }
            None => false,
        };

        if expired {
            self.entries
                .remove_if(&user, |_, entry| Instant::now() >= entry.expires_at);
        }
        None
    }

    /// Drops every expired entry, returning how many were reclaimed.
    pub(crate) fn sweep(&self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| Instant::now() < entry.expires_at);
        before - self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER: UserId = UserId(7);

    #[tokio::test]
    async fn get_returns_live_entry() {
        let store = SessionStore::new(Duration::from_secs(60));
        store.insert(USER, "greeting".to_string());
        assert_eq!(store.get(USER).as_deref(), Some("greeting"));
    }

    #[tokio::test]
    async fn insert_overwrites_previous_state() {
        let store = SessionStore::new(Duration::from_secs(60));
        store.insert(USER, "greeting".to_string());
        store.insert(USER, "name_enter".to_string());
        assert_eq!(store.get(USER).as_deref(), Some("name_enter"));
    }

    #[tokio::test]
    async fn expired_entry_is_invisible_and_lazily_removed() {
        let store = SessionStore::new(Duration::from_millis(50));
        store.insert(USER, "greeting".to_string());
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(store.get(USER), None);
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn sweep_reclaims_only_expired_entries() {
        let store = SessionStore::new(Duration::from_millis(50));
        store.insert(UserId(1), "a".to_string());
        tokio::time::sleep(Duration::from_millis(80)).await;
        store.insert(UserId(2), "b".to_string());

        assert_eq!(store.sweep(), 1);
        assert_eq!(store.get(UserId(2)).as_deref(), Some("b"));
    }
}
