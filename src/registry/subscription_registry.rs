//! Subscription Registry
//!
//! Single source of truth mapping watched addresses to notifiable devices.
//!
//! The registry keeps two views in lockstep: device token → subscription, and
//! address → device tokens. Every mutation runs its reassignment, replace and
//! install steps inside one write-locked critical section, so readers never
//! observe an index that is not the exact inverse of the subscription set.
//! The full snapshot is then persisted before the mutating call returns.

use crate::domain::ports::{Snapshot, SnapshotEntry, SnapshotStore};
use crate::error::{Error, Result};
use backoff::ExponentialBackoffBuilder;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::RegistryEvent;

// =============================================================================
// Constants
// =============================================================================

/// Capacity of the registry event broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Normalize an address for storage and lookup
#[inline]
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

// =============================================================================
// Subscription
// =============================================================================

/// One device's subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Device token (unique key)
    pub device_token: String,
    /// Normalized addresses, never empty
    pub addresses: BTreeSet<String>,
    /// Delivery-provider token
    pub push_token: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    /// Whether notifications can be delivered to this device
    pub fn has_push_token(&self) -> bool {
        self.push_token.is_some()
    }

    fn to_entry(&self) -> SnapshotEntry {
        SnapshotEntry {
            addresses: self.addresses.iter().cloned().collect(),
            expo_push_token: self.push_token.clone(),
            created_at: self.created_at,
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Upper bound for a single snapshot write
    pub save_timeout: Duration,
    /// First retry delay after a failed save
    pub save_retry_initial: Duration,
    /// Give up retrying a save after this long
    pub save_retry_max_elapsed: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            save_timeout: Duration::from_secs(5),
            save_retry_initial: Duration::from_millis(200),
            save_retry_max_elapsed: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// Registry State
// =============================================================================

#[derive(Debug, Default)]
struct RegistryState {
    subscriptions: HashMap<String, Subscription>,
    address_index: HashMap<String, HashSet<String>>,
}

impl RegistryState {
    /// Rebuild state from a snapshot
    ///
    /// Entries are installed oldest first. A claim duplicated under the same push
    /// token by a newer entry is stripped from the older one, as on subscribe.
    fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut entries: Vec<(String, SnapshotEntry)> = snapshot.subscriptions.into_iter().collect();
        entries.sort_by(|(a_token, a), (b_token, b)| {
            a.created_at.cmp(&b.created_at).then_with(|| a_token.cmp(b_token))
        });

        let mut state = Self::default();
        for (device_token, entry) in entries {
            let addresses: BTreeSet<String> =
                entry.addresses.iter().map(|a| normalize_address(a)).collect();
            if addresses.is_empty() {
                warn!(device_token = %device_token, "Skipping snapshot entry without addresses");
                continue;
            }
            if let Some(push_token) = entry.expo_push_token.as_deref() {
                for address in &addresses {
                    for other in state.same_push_token_claims(&device_token, address, push_token) {
                        let emptied = state.strip_address(&other, address);
                        warn!(
                            address = %address,
                            from_device = %other,
                            to_device = %device_token,
                            dropped = emptied,
                            "Snapshot held a duplicate push-token claim; kept the newest"
                        );
                    }
                }
            }
            state.install(Subscription {
                device_token,
                addresses,
                push_token: entry.expo_push_token,
                created_at: entry.created_at,
            });
        }
        state
    }

    fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            subscriptions: self
                .subscriptions
                .iter()
                .map(|(token, sub)| (token.clone(), sub.to_entry()))
                .collect(),
            last_updated: Utc::now(),
        }
    }

    fn index_insert(&mut self, address: &str, device_token: &str) {
        self.address_index
            .entry(address.to_string())
            .or_default()
            .insert(device_token.to_string());
    }

    fn index_remove(&mut self, address: &str, device_token: &str) {
        if let Some(devices) = self.address_index.get_mut(address) {
            devices.remove(device_token);
            if devices.is_empty() {
                self.address_index.remove(address);
            }
        }
    }

    fn install(&mut self, subscription: Subscription) {
        for address in &subscription.addresses {
            self.index_insert(address, &subscription.device_token);
        }
        self.subscriptions
            .insert(subscription.device_token.clone(), subscription);
    }

    fn remove_device(&mut self, device_token: &str) -> Option<Subscription> {
        let subscription = self.subscriptions.remove(device_token)?;
        for address in &subscription.addresses {
            self.index_remove(address, device_token);
        }
        Some(subscription)
    }

    /// Strip one address from a device. Returns true if the subscription emptied and was deleted.
    fn strip_address(&mut self, device_token: &str, address: &str) -> bool {
        self.index_remove(address, device_token);
        let emptied = match self.subscriptions.get_mut(device_token) {
            Some(sub) => {
                sub.addresses.remove(address);
                sub.addresses.is_empty()
            }
            None => false,
        };
        if emptied {
            self.subscriptions.remove(device_token);
        }
        emptied
    }

    /// Devices other than `device_token` holding `address` under the same push token
    fn same_push_token_claims(
        &self,
        device_token: &str,
        address: &str,
        push_token: &str,
    ) -> Vec<String> {
        let Some(devices) = self.address_index.get(address) else {
            return Vec::new();
        };
        let mut claims: Vec<String> = devices
            .iter()
            .filter(|other| other.as_str() != device_token)
            .filter(|other| {
                self.subscriptions
                    .get(other.as_str())
                    .and_then(|sub| sub.push_token.as_deref())
                    == Some(push_token)
            })
            .cloned()
            .collect();
        claims.sort();
        claims
    }

    fn is_consistent(&self) -> bool {
        for (device_token, sub) in &self.subscriptions {
            if sub.addresses.is_empty() || sub.device_token != *device_token {
                return false;
            }
            for address in &sub.addresses {
                match self.address_index.get(address) {
                    Some(devices) if devices.contains(device_token) => {}
                    _ => return false,
                }
            }
        }
        for (address, devices) in &self.address_index {
            if devices.is_empty() {
                return false;
            }
            for device_token in devices {
                match self.subscriptions.get(device_token) {
                    Some(sub) if sub.addresses.contains(address) => {}
                    _ => return false,
                }
            }
        }
        true
    }
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
struct PersistenceStatus {
    last_saved_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    dirty: bool,
    failures: u64,
    /// Bumped on every mutation; a save only clears `dirty` if it saw the latest
    generation: u64,
}

/// Snapshot of registry health
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub active_subscriptions: usize,
    pub monitored_addresses: usize,
    pub last_saved_at: Option<DateTime<Utc>>,
    pub last_persist_error: Option<String>,
    /// In-memory state has changes the durable snapshot does not
    pub dirty: bool,
    pub persist_failures: u64,
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// Address ↔ device registry with persistence
pub struct SubscriptionRegistry {
    config: RegistryConfig,
    state: RwLock<RegistryState>,
    store: Arc<dyn SnapshotStore>,
    /// Serializes snapshot writes so an older snapshot never lands last
    persist_lock: tokio::sync::Mutex<()>,
    persistence: Mutex<PersistenceStatus>,
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("SubscriptionRegistry")
            .field("subscriptions", &state.subscriptions.len())
            .field("addresses", &state.address_index.len())
            .field("store", &self.store.describe())
            .finish()
    }
}

impl SubscriptionRegistry {
    /// Create an empty registry backed by `store`
    pub fn new(store: Arc<dyn SnapshotStore>, config: RegistryConfig) -> Arc<Self> {
        let (event_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Arc::new(Self {
            config,
            state: RwLock::new(RegistryState::default()),
            store,
            persist_lock: tokio::sync::Mutex::new(()),
            persistence: Mutex::new(PersistenceStatus::default()),
            event_sender,
        })
    }

    /// Replace in-memory state with the stored snapshot
    ///
    /// A missing snapshot yields an empty registry. An undecodable snapshot is
    /// returned as an error and leaves the registry untouched.
    pub async fn load(&self) -> Result<usize> {
        let snapshot = self.store.load().await?;
        let loaded = RegistryState::from_snapshot(snapshot.unwrap_or_default());
        let count = loaded.subscriptions.len();
        let addresses = loaded.address_index.len();
        *self.state.write() = loaded;

        info!(
            store = %self.store.describe(),
            subscriptions = count,
            addresses = addresses,
            "Subscription registry loaded"
        );
        Ok(count)
    }

    /// Get an event receiver
    pub fn subscribe_events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    /// Subscribe `device_token` to `addresses`, replacing any previous subscription
    ///
    /// Addresses already claimed by another device with the same push token are
    /// moved to this device; a device left without addresses is removed.
    pub async fn add_subscription<I>(
        &self,
        device_token: &str,
        addresses: I,
        push_token: Option<&str>,
    ) -> Result<()>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        if device_token.trim().is_empty() {
            return Err(Error::validation(
                "missing_device_token",
                "device token must not be empty",
            ));
        }

        let normalized: BTreeSet<String> = addresses
            .into_iter()
            .map(|a| normalize_address(a.as_ref()))
            .filter(|a| !a.is_empty())
            .collect();
        if normalized.is_empty() {
            return Err(Error::validation(
                "missing_addresses",
                "at least one address is required",
            ));
        }

        let mut events = Vec::new();
        {
            let mut state = self.state.write();

            // Reassignment: same physical device must not hold a claim under two identities
            if let Some(push_token) = push_token {
                for address in &normalized {
                    for other in state.same_push_token_claims(device_token, address, push_token) {
                        let emptied = state.strip_address(&other, address);
                        debug!(
                            address = %address,
                            from_device = %other,
                            to_device = %device_token,
                            "Reassigned address claim"
                        );
                        events.push(RegistryEvent::AddressReassigned {
                            address: address.clone(),
                            from_device: other.clone(),
                            to_device: device_token.to_string(),
                        });
                        if emptied {
                            events.push(RegistryEvent::SubscriptionDropped {
                                device_token: other,
                            });
                        }
                    }
                }
            }

            let replaced = state.remove_device(device_token).is_some();

            let address_count = normalized.len();
            state.install(Subscription {
                device_token: device_token.to_string(),
                addresses: normalized,
                push_token: push_token.map(str::to_string),
                created_at: Utc::now(),
            });

            events.push(RegistryEvent::Subscribed {
                device_token: device_token.to_string(),
                address_count,
                replaced,
            });
        }

        self.mark_dirty();
        for event in events {
            let _ = self.event_sender.send(event);
        }
        info!(device_token = %device_token, "Subscription stored");

        self.persist().await;
        Ok(())
    }

    /// Remove a device's subscription
    ///
    /// Returns whether a subscription existed. Removing an unknown device is a no-op.
    pub async fn remove_subscription(&self, device_token: &str) -> bool {
        let removed = self.state.write().remove_device(device_token);

        match removed {
            Some(sub) => {
                info!(
                    device_token = %device_token,
                    addresses = sub.addresses.len(),
                    "Subscription removed"
                );
                self.mark_dirty();
                let _ = self.event_sender.send(RegistryEvent::Unsubscribed {
                    device_token: device_token.to_string(),
                });
                self.persist().await;
                true
            }
            None => {
                debug!(device_token = %device_token, "No subscription to remove");
                false
            }
        }
    }

    /// Devices currently subscribed to `address`
    pub fn devices_for_address(&self, address: &str) -> HashSet<String> {
        self.state
            .read()
            .address_index
            .get(&normalize_address(address))
            .cloned()
            .unwrap_or_default()
    }

    /// Get a device's subscription
    pub fn subscription(&self, device_token: &str) -> Option<Subscription> {
        self.state.read().subscriptions.get(device_token).cloned()
    }

    /// Check if a device has a subscription
    pub fn contains(&self, device_token: &str) -> bool {
        self.state.read().subscriptions.contains_key(device_token)
    }

    /// All subscriptions, ordered by device token
    pub fn list_all(&self) -> Vec<Subscription> {
        let mut subs: Vec<Subscription> =
            self.state.read().subscriptions.values().cloned().collect();
        subs.sort_by(|a, b| a.device_token.cmp(&b.device_token));
        subs
    }

    /// Get registry statistics
    pub fn stats(&self) -> RegistryStats {
        let (active_subscriptions, monitored_addresses) = {
            let state = self.state.read();
            (state.subscriptions.len(), state.address_index.len())
        };
        let persistence = self.persistence.lock();

        RegistryStats {
            active_subscriptions,
            monitored_addresses,
            last_saved_at: persistence.last_saved_at,
            last_persist_error: persistence.last_error.clone(),
            dirty: persistence.dirty,
            persist_failures: persistence.failures,
        }
    }

    /// Current state as a snapshot
    pub fn snapshot(&self) -> Snapshot {
        self.state.read().to_snapshot()
    }

    /// Verify the address index is exactly the inverse of the subscription set
    pub fn is_consistent(&self) -> bool {
        self.state.read().is_consistent()
    }

    fn mark_dirty(&self) {
        let mut status = self.persistence.lock();
        status.dirty = true;
        status.generation += 1;
    }

    /// Write the current snapshot, retrying transient failures
    ///
    /// Failures are recorded and logged; the in-memory mutation stays applied.
    async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;
        // Read before the snapshot so a concurrent mutation keeps `dirty` set
        let generation = self.persistence.lock().generation;
        let snapshot = self.state.read().to_snapshot();

        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.save_retry_initial)
            .with_max_elapsed_time(Some(self.config.save_retry_max_elapsed))
            .build();
        let store = &self.store;
        let snapshot = &snapshot;
        let timeout = self.config.save_timeout;

        let result = backoff::future::retry(policy, || async move {
            match tokio::time::timeout(timeout, store.save(snapshot)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) if e.is_transient() => {
                    warn!(error = %e, "Snapshot save failed, retrying");
                    Err(backoff::Error::transient(e))
                }
                Ok(Err(e)) => Err(backoff::Error::permanent(e)),
                Err(_) => {
                    warn!(timeout = ?timeout, "Snapshot save timed out, retrying");
                    Err(backoff::Error::transient(Error::Persistence(format!(
                        "save timed out after {:?}",
                        timeout
                    ))))
                }
            }
        })
        .await;

        let mut status = self.persistence.lock();
        match result {
            Ok(()) => {
                status.last_saved_at = Some(snapshot.last_updated);
                status.last_error = None;
                if status.generation == generation {
                    status.dirty = false;
                }
                debug!(subscriptions = snapshot.len(), "Snapshot persisted");
            }
            Err(e) => {
                status.last_error = Some(e.to_string());
                status.failures += 1;
                status.dirty = true;
                error!(
                    error = %e,
                    store = %self.store.describe(),
                    "Snapshot persistence failed; in-memory state is ahead of storage"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemorySnapshotStore;
    use assert_matches::assert_matches;

    const TOKEN_A: &str = "ExponentPushToken[aaaa]";
    const TOKEN_B: &str = "ExponentPushToken[bbbb]";

    fn fast_config() -> RegistryConfig {
        RegistryConfig {
            save_timeout: Duration::from_millis(200),
            save_retry_initial: Duration::from_millis(5),
            save_retry_max_elapsed: Duration::from_millis(30),
        }
    }

    fn test_registry() -> (Arc<SubscriptionRegistry>, Arc<MemorySnapshotStore>) {
        let store = Arc::new(MemorySnapshotStore::new());
        let registry = SubscriptionRegistry::new(store.clone(), fast_config());
        (registry, store)
    }

    fn devices(list: &[&str]) -> HashSet<String> {
        list.iter().map(|d| d.to_string()).collect()
    }

    #[tokio::test]
    async fn test_add_and_lookup_normalizes() {
        let (registry, store) = test_registry();

        registry
            .add_subscription("dev1", ["0xAA", " 0xBb "], Some(TOKEN_A))
            .await
            .unwrap();

        assert_eq!(registry.devices_for_address("0xaa"), devices(&["dev1"]));
        assert_eq!(registry.devices_for_address("0XAA"), devices(&["dev1"]));
        assert_eq!(registry.devices_for_address("0xbb"), devices(&["dev1"]));
        assert!(registry.devices_for_address("0xcc").is_empty());

        let sub = registry.subscription("dev1").unwrap();
        assert_eq!(sub.addresses.len(), 2);
        assert!(sub.has_push_token());
        assert_eq!(store.save_count(), 1);
        assert!(registry.is_consistent());
    }

    #[tokio::test]
    async fn test_reassignment_same_push_token() {
        let (registry, _store) = test_registry();

        registry
            .add_subscription("dev1", ["0xAA"], Some(TOKEN_A))
            .await
            .unwrap();
        registry
            .add_subscription("dev2", ["0xAA"], Some(TOKEN_A))
            .await
            .unwrap();

        assert_eq!(registry.devices_for_address("0xaa"), devices(&["dev2"]));
        assert!(registry.subscription("dev1").is_none());
        assert!(registry.is_consistent());
    }

    #[tokio::test]
    async fn test_reassignment_keeps_unrelated_claims() {
        let (registry, _store) = test_registry();

        registry
            .add_subscription("devA", ["0xA1", "0xA2"], Some(TOKEN_A))
            .await
            .unwrap();
        registry
            .add_subscription("devB", ["0xA1"], Some(TOKEN_A))
            .await
            .unwrap();

        let a = registry.subscription("devA").unwrap();
        assert_eq!(a.addresses, BTreeSet::from(["0xa2".to_string()]));
        assert_eq!(registry.devices_for_address("0xa1"), devices(&["devB"]));
        assert_eq!(registry.devices_for_address("0xa2"), devices(&["devA"]));
        assert!(registry.is_consistent());
    }

    #[tokio::test]
    async fn test_different_push_tokens_share_address() {
        let (registry, _store) = test_registry();

        registry
            .add_subscription("dev1", ["0xAA"], Some(TOKEN_A))
            .await
            .unwrap();
        registry
            .add_subscription("dev2", ["0xAA"], Some(TOKEN_B))
            .await
            .unwrap();
        registry.add_subscription("dev3", ["0xAA"], None).await.unwrap();

        assert_eq!(
            registry.devices_for_address("0xaa"),
            devices(&["dev1", "dev2", "dev3"])
        );
    }

    #[tokio::test]
    async fn test_missing_push_token_never_reassigns() {
        let (registry, _store) = test_registry();

        registry.add_subscription("dev1", ["0xAA"], None).await.unwrap();
        registry.add_subscription("dev2", ["0xAA"], None).await.unwrap();

        assert_eq!(registry.devices_for_address("0xaa"), devices(&["dev1", "dev2"]));
    }

    #[tokio::test]
    async fn test_full_replace() {
        let (registry, _store) = test_registry();

        registry
            .add_subscription("dev1", ["0xAA", "0xBB"], Some(TOKEN_A))
            .await
            .unwrap();
        registry
            .add_subscription("dev1", ["0xCC"], Some(TOKEN_A))
            .await
            .unwrap();

        assert!(registry.devices_for_address("0xaa").is_empty());
        assert!(registry.devices_for_address("0xbb").is_empty());
        assert_eq!(registry.devices_for_address("0xcc"), devices(&["dev1"]));
        assert_eq!(registry.stats().monitored_addresses, 1);
        assert!(registry.is_consistent());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (registry, store) = test_registry();

        registry
            .add_subscription("dev1", ["0xAA"], Some(TOKEN_A))
            .await
            .unwrap();
        registry
            .add_subscription("dev2", ["0xAA", "0xBB"], Some(TOKEN_B))
            .await
            .unwrap();

        assert!(registry.remove_subscription("dev2").await);
        let after_once = registry.snapshot();
        assert!(!registry.remove_subscription("dev2").await);
        let after_twice = registry.snapshot();

        assert_eq!(after_once.subscriptions, after_twice.subscriptions);
        assert!(registry.devices_for_address("0xbb").is_empty());
        assert_eq!(registry.devices_for_address("0xaa"), devices(&["dev1"]));
        // The second removal is a no-op and does not rewrite the snapshot
        assert_eq!(store.save_count(), 3);
        assert!(registry.is_consistent());
    }

    #[tokio::test]
    async fn test_validation() {
        let (registry, store) = test_registry();

        let result = registry.add_subscription("dev1", ["  "], Some(TOKEN_A)).await;
        assert_matches!(result, Err(Error::Validation { ref code, .. }) if code == "missing_addresses");

        let empty: [&str; 0] = [];
        let result = registry.add_subscription("dev1", empty, Some(TOKEN_A)).await;
        assert_matches!(result, Err(Error::Validation { .. }));

        let result = registry.add_subscription("", ["0xAA"], Some(TOKEN_A)).await;
        assert_matches!(result, Err(Error::Validation { ref code, .. }) if code == "missing_device_token");

        assert_eq!(store.save_count(), 0);
        assert_eq!(registry.stats().active_subscriptions, 0);
    }

    #[tokio::test]
    async fn test_invariants_after_mixed_sequence() {
        let (registry, _store) = test_registry();
        let tokens = [TOKEN_A, TOKEN_B];
        let addresses = ["0x01", "0x02", "0x03", "0x04"];

        for i in 0..40usize {
            let device = format!("dev{}", i % 7);
            if i % 5 == 4 {
                registry.remove_subscription(&device).await;
            } else {
                let picked = [addresses[i % 4], addresses[(i * 3 + 1) % 4]];
                registry
                    .add_subscription(&device, picked, Some(tokens[i % 2]))
                    .await
                    .unwrap();
            }
            assert!(registry.is_consistent(), "inconsistent after step {}", i);
        }

        // No two devices with the same push token claim the same address
        for address in addresses {
            let holders = registry.devices_for_address(address);
            let mut seen = HashSet::new();
            for device in holders {
                let token = registry.subscription(&device).unwrap().push_token;
                assert!(seen.insert(token), "duplicate push token on {}", address);
            }
        }
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let (registry, store) = test_registry();

        registry
            .add_subscription("dev1", ["0xAA", "0xBB"], Some(TOKEN_A))
            .await
            .unwrap();
        registry.add_subscription("dev2", ["0xBB"], None).await.unwrap();

        let saved = store.current().unwrap();
        let fresh = SubscriptionRegistry::new(
            Arc::new(MemorySnapshotStore::with_snapshot(saved)),
            fast_config(),
        );
        assert_eq!(fresh.load().await.unwrap(), 2);

        for address in ["0xaa", "0xbb"] {
            assert_eq!(
                fresh.devices_for_address(address),
                registry.devices_for_address(address)
            );
        }
        assert_eq!(
            fresh.subscription("dev1").unwrap(),
            registry.subscription("dev1").unwrap()
        );
        assert!(fresh.subscription("dev2").unwrap().push_token.is_none());
        assert!(fresh.is_consistent());
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_mutation() {
        let (registry, store) = test_registry();
        store.set_available(false);

        registry
            .add_subscription("dev1", ["0xAA"], Some(TOKEN_A))
            .await
            .unwrap();

        assert_eq!(registry.devices_for_address("0xaa"), devices(&["dev1"]));
        let stats = registry.stats();
        assert!(stats.dirty);
        assert!(stats.last_persist_error.is_some());
        assert_eq!(stats.persist_failures, 1);

        store.set_available(true);
        registry.remove_subscription("dev1").await;
        let stats = registry.stats();
        assert!(!stats.dirty);
        assert!(stats.last_persist_error.is_none());
        assert!(stats.last_saved_at.is_some());
    }

    #[tokio::test]
    async fn test_events_emitted() {
        let (registry, _store) = test_registry();
        let mut events = registry.subscribe_events();

        registry
            .add_subscription("dev1", ["0xAA"], Some(TOKEN_A))
            .await
            .unwrap();
        registry
            .add_subscription("dev2", ["0xAA"], Some(TOKEN_A))
            .await
            .unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::Subscribed {
                device_token: "dev1".to_string(),
                address_count: 1,
                replaced: false,
            }
        );
        assert_matches!(events.recv().await.unwrap(), RegistryEvent::AddressReassigned { .. });
        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::SubscriptionDropped {
                device_token: "dev1".to_string()
            }
        );
        assert_matches!(events.recv().await.unwrap(), RegistryEvent::Subscribed { .. });
    }

    #[tokio::test]
    async fn test_list_all_sorted() {
        let (registry, _store) = test_registry();

        registry.add_subscription("b", ["0x02"], None).await.unwrap();
        registry.add_subscription("a", ["0x01"], Some(TOKEN_A)).await.unwrap();

        let all = registry.list_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].device_token, "a");
        assert_eq!(all[1].device_token, "b");
    }

    /// Store whose first save waits for `release`; later saves stall or fail
    struct GatedStore {
        release: tokio::sync::Notify,
        calls: std::sync::atomic::AtomicUsize,
        stall_all: bool,
    }

    impl GatedStore {
        fn new(stall_all: bool) -> Arc<Self> {
            Arc::new(Self {
                release: tokio::sync::Notify::new(),
                calls: std::sync::atomic::AtomicUsize::new(0),
                stall_all,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl SnapshotStore for GatedStore {
        async fn load(&self) -> Result<Option<Snapshot>> {
            Ok(None)
        }

        async fn save(&self, _snapshot: &Snapshot) -> Result<()> {
            let call = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if self.stall_all {
                futures::future::pending::<()>().await;
            }
            if call == 0 {
                self.release.notified().await;
                return Ok(());
            }
            Err(Error::Persistence("disk full".into()))
        }

        fn describe(&self) -> String {
            "gated".to_string()
        }
    }

    #[tokio::test]
    async fn test_stale_save_does_not_clear_dirty() {
        let store = GatedStore::new(false);
        let registry = SubscriptionRegistry::new(store.clone(), fast_config());

        let first = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry.add_subscription("dev1", ["0xAA"], Some(TOKEN_A)).await
            })
        };
        while store.calls() == 0 {
            tokio::task::yield_now().await;
        }

        let second = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry.add_subscription("dev2", ["0xBB"], Some(TOKEN_B)).await
            })
        };
        while !registry.contains("dev2") {
            tokio::task::yield_now().await;
        }

        store.release.notify_one();
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let stats = registry.stats();
        assert!(stats.dirty, "dev2 never reached storage");
        assert!(stats.last_persist_error.unwrap().contains("disk full"));
        assert_eq!(stats.persist_failures, 1);
    }

    #[tokio::test]
    async fn test_save_timeout_recorded() {
        let store = GatedStore::new(true);
        let registry = SubscriptionRegistry::new(store, fast_config());

        registry
            .add_subscription("dev1", ["0xAA"], Some(TOKEN_A))
            .await
            .unwrap();

        let stats = registry.stats();
        assert!(stats.dirty);
        assert!(stats.last_persist_error.unwrap().contains("timed out"));
        assert!(stats.last_saved_at.is_none());
        assert!(registry.contains("dev1"));
    }

    #[tokio::test]
    async fn test_load_strips_duplicate_push_token_claims() {
        let older = chrono::Utc::now() - chrono::Duration::minutes(5);
        let newer = chrono::Utc::now();
        let mut snapshot = Snapshot::default();
        snapshot.subscriptions.insert(
            "old".to_string(),
            SnapshotEntry {
                addresses: vec!["0xaa".into(), "0xbb".into()],
                expo_push_token: Some(TOKEN_A.into()),
                created_at: older,
            },
        );
        snapshot.subscriptions.insert(
            "lone".to_string(),
            SnapshotEntry {
                addresses: vec!["0xcc".into()],
                expo_push_token: Some(TOKEN_A.into()),
                created_at: older,
            },
        );
        snapshot.subscriptions.insert(
            "new".to_string(),
            SnapshotEntry {
                addresses: vec!["0xAA".into(), "0xcc".into()],
                expo_push_token: Some(TOKEN_A.into()),
                created_at: newer,
            },
        );
        snapshot.subscriptions.insert(
            "other".to_string(),
            SnapshotEntry {
                addresses: vec!["0xaa".into()],
                expo_push_token: Some(TOKEN_B.into()),
                created_at: older,
            },
        );

        let registry = SubscriptionRegistry::new(
            Arc::new(MemorySnapshotStore::with_snapshot(snapshot)),
            fast_config(),
        );
        assert_eq!(registry.load().await.unwrap(), 3);

        assert_eq!(registry.devices_for_address("0xaa"), devices(&["new", "other"]));
        assert_eq!(registry.devices_for_address("0xcc"), devices(&["new"]));
        assert_eq!(
            registry.subscription("old").unwrap().addresses,
            BTreeSet::from(["0xbb".to_string()])
        );
        assert!(registry.subscription("lone").is_none());
        assert!(registry.is_consistent());
    }
}
