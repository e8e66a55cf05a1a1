//! Expiring client registry.
//!
//! A keyed map of client records with a per-entry deadline. `put` refreshes
//! the deadline; a background sweep reclaims entries the clients stopped
//! refreshing. `list` filters on the deadline itself, so a record never
//! outlives its TTL in a snapshot even between sweeps.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parley_core::User;

/// How long a record lives without a refreshing `put`.
pub const CLIENT_TTL: Duration = Duration::from_secs(30);

/// How often the sweep reclaims expired entries.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct RegistryEntry {
    user: User,
    expires_at: Instant,
}

/// Thread-safe registry of live clients, keyed by client id.
#[derive(Clone)]
pub struct ExpiringRegistry {
    entries: Arc<DashMap<String, RegistryEntry>>,
    ttl: Duration,
}

impl Default for ExpiringRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpiringRegistry {
    pub fn new() -> Self {
        Self::with_ttl(CLIENT_TTL)
    }

    /// A registry with a custom TTL. Tests use short ones.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// Insert or replace a record and reset its expiry.
    pub fn put(&self, user: User) {
        let expires_at = Instant::now() + self.ttl;
        self.entries
            .insert(user.id.clone(), RegistryEntry { user, expires_at });
    }

    /// Snapshot of all live records, unspecified order.
    pub fn list(&self) -> Vec<User> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|e| e.value().expires_at > now)
            .map(|e| e.value().user.clone())
            .collect()
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Reclaim expired entries every [`SWEEP_INTERVAL`].
///
/// Runs forever — cancel by dropping the task handle.
pub async fn sweep_loop(registry: ExpiringRegistry) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        let removed = registry.sweep();
        if removed > 0 {
            tracing::debug!(removed, "expired directory entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> User {
        User {
            id: id.into(),
            name: format!("name-{id}"),
            address: "10.0.0.1".into(),
            port: 1000,
        }
    }

    #[test]
    fn put_then_list_round_trips() {
        let registry = ExpiringRegistry::new();
        registry.put(user("aaa"));
        registry.put(user("bbb"));

        let mut ids: Vec<String> = registry.list().into_iter().map(|u| u.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["aaa", "bbb"]);
    }

    #[test]
    fn put_replaces_existing_id() {
        let registry = ExpiringRegistry::new();
        registry.put(user("aaa"));
        let mut updated = user("aaa");
        updated.port = 2000;
        registry.put(updated);

        let listed = registry.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].port, 2000);
    }

    #[test]
    fn expired_entries_disappear_from_list_before_sweep() {
        let registry = ExpiringRegistry::with_ttl(Duration::from_millis(30));
        registry.put(user("aaa"));
        assert_eq!(registry.list().len(), 1);

        std::thread::sleep(Duration::from_millis(60));
        assert!(registry.list().is_empty());
        // still resident until the sweep reclaims it
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn sweep_reclaims_expired_entries() {
        let registry = ExpiringRegistry::with_ttl(Duration::from_millis(30));
        registry.put(user("aaa"));
        registry.put(user("bbb"));

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(registry.sweep(), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn refresh_resets_the_expiry() {
        let registry = ExpiringRegistry::with_ttl(Duration::from_millis(200));
        registry.put(user("aaa"));

        std::thread::sleep(Duration::from_millis(120));
        registry.put(user("aaa"));

        std::thread::sleep(Duration::from_millis(120));
        // past the original deadline, inside the refreshed one
        assert_eq!(registry.list().len(), 1);
    }
}
