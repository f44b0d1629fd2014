//! Key pool state machine
//!
//! Every key lives in a single map together with an explicit state tag
//! (`Available` or `Leased`). A key that is gone has no record at all. The
//! ordered queue of available keys sits next to the map and holds exactly the
//! keys tagged `Available`, in the order they will be offered by `lease`.
//!
//! All state sits behind one mutex. Each operation takes it once and performs
//! its whole read-modify-write sequence inside that critical section, so a
//! request handler and the sweeper can never observe a half-applied transition.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::key::Key;

/// Tunables for key generation and lease timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Number of keys created by each `generate` call.
    pub batch_size: usize,
    /// How long a lease lasts before the sweeper releases it.
    pub lease_duration: Duration,
    /// Lifetime granted on creation, release and keep-alive.
    pub key_lifetime: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            lease_duration: Duration::from_secs(60),
            key_lifetime: Duration::from_secs(300),
        }
    }
}

/// Lease state of a key that still exists.
///
/// Transitions:
/// - Available → Leased (lease)
/// - Leased → Available (release, or lease deadline passed during a sweep)
/// - either → removed (delete, keep-alive on an expired key, lifetime elapsed)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Available,
    Leased { until: Instant },
}

impl KeyState {
    /// Status label for stats/logging.
    pub fn label(&self) -> &'static str {
        match self {
            KeyState::Available => "available",
            KeyState::Leased { .. } => "leased",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct KeyRecord {
    expires_at: Instant,
    state: KeyState,
}

/// Keys reclaimed by one sweep pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Keys whose lease deadline passed and were returned to the queue.
    pub released: Vec<Key>,
    /// Keys whose lifetime elapsed and were removed.
    pub removed: Vec<Key>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.released.is_empty() && self.removed.is_empty()
    }
}

/// Number of keys by state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolCounts {
    pub total: usize,
    pub available: usize,
    pub leased: usize,
}

/// Per-key diagnostic view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyStats {
    pub key: Key,
    pub state: &'static str,
    pub expires_in_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_for_secs: Option<u64>,
}

/// Read-only snapshot of the pool for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Available keys in lease order.
    pub available: Vec<Key>,
    /// Leased keys, sorted.
    pub blocked: Vec<Key>,
    /// Every tracked key, sorted.
    pub keys: Vec<KeyStats>,
}

#[derive(Debug, Default)]
struct PoolState {
    keys: HashMap<Key, KeyRecord>,
    available: VecDeque<Key>,
}

impl PoolState {
    /// Return a leased key to the tail of the queue with a renewed lifetime.
    fn release(&mut self, key: &str, expires_at: Instant) -> Result<()> {
        let (key, record) = self
            .keys
            .get_key_value(key)
            .map(|(k, r)| (k.clone(), *r))
            .ok_or_else(|| Error::Unknown(key.to_string()))?;

        if record.state == KeyState::Available {
            return Err(Error::NotLeased(key.to_string()));
        }

        self.keys.insert(
            key.clone(),
            KeyRecord {
                expires_at,
                state: KeyState::Available,
            },
        );
        self.available.push_back(key);
        Ok(())
    }

    /// Remove a leased key. Available keys cannot be deleted this way.
    fn delete(&mut self, key: &str) -> Result<()> {
        match self.keys.get(key).map(|r| r.state) {
            None => Err(Error::Unknown(key.to_string())),
            Some(KeyState::Available) => Err(Error::NotLeased(key.to_string())),
            Some(KeyState::Leased { .. }) => {
                self.keys.remove(key);
                Ok(())
            }
        }
    }

    /// Remove a key in any state from every collection holding it.
    fn reclaim(&mut self, key: &str) -> Option<KeyRecord> {
        let record = self.keys.remove(key)?;
        if record.state == KeyState::Available {
            self.available.retain(|k| k.as_str() != key);
        }
        Some(record)
    }

    fn counts(&self) -> PoolCounts {
        let available = self.available.len();
        PoolCounts {
            total: self.keys.len(),
            available,
            leased: self.keys.len() - available,
        }
    }

    /// Queue and map must agree: every queued key is tracked as `Available`,
    /// appears once, and no `Available` record is missing from the queue.
    fn check_invariants(&self) {
        if cfg!(debug_assertions) {
            let mut seen = std::collections::HashSet::with_capacity(self.available.len());
            for key in &self.available {
                assert!(seen.insert(key), "key {key} queued twice");
                match self.keys.get(key) {
                    Some(record) => assert_eq!(
                        record.state,
                        KeyState::Available,
                        "queued key {key} is not available"
                    ),
                    None => panic!("queued key {key} has no record"),
                }
            }
            let available_records = self
                .keys
                .values()
                .filter(|r| r.state == KeyState::Available)
                .count();
            assert_eq!(
                available_records,
                self.available.len(),
                "available records missing from the queue"
            );
        }
    }
}

/// Fixed-size pool of leaseable keys.
///
/// Constructed once and shared behind an `Arc` between request handlers and the
/// sweeper task.
pub struct KeyPool {
    state: Mutex<PoolState>,
    settings: PoolSettings,
}

impl KeyPool {
    pub fn new(settings: PoolSettings) -> Self {
        info!(
            batch_size = settings.batch_size,
            lease_secs = settings.lease_duration.as_secs(),
            lifetime_secs = settings.key_lifetime.as_secs(),
            "key pool initialized"
        );
        Self {
            state: Mutex::new(PoolState::default()),
            settings,
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Create a fresh batch of keys and make it the new available queue.
    ///
    /// Generation resets the offer set rather than adding to it: keys that were
    /// still waiting in the queue are retired, while leased keys are left alone.
    pub async fn generate(&self) -> Vec<Key> {
        let batch: Vec<Key> = (0..self.settings.batch_size)
            .map(|_| Key::generate())
            .collect();
        let expires_at = deadline(Instant::now(), self.settings.key_lifetime);

        let mut state = self.state.lock().await;
        let retired = std::mem::take(&mut state.available);
        for key in &retired {
            state.keys.remove(key);
        }
        for key in &batch {
            state.keys.insert(
                key.clone(),
                KeyRecord {
                    expires_at,
                    state: KeyState::Available,
                },
            );
            state.available.push_back(key.clone());
        }
        state.check_invariants();
        let counts = state.counts();
        drop(state);

        info!(
            generated = batch.len(),
            retired = retired.len(),
            "generated key batch"
        );
        record_operation("generate", &Ok::<(), Error>(()));
        publish_counts(counts);
        batch
    }

    /// Lease the first unexpired key in the queue.
    ///
    /// Every key visited by the scan leaves the queue. Expired ones are dropped
    /// from the pool entirely, so a lease also clears stale entries from the
    /// head of the queue. Returns `PoolEmpty` when nothing valid remains.
    pub async fn lease(&self) -> Result<Key> {
        let now = Instant::now();
        let until = deadline(now, self.settings.lease_duration);

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let mut discarded = 0usize;
        let mut leased = None;

        while let Some(key) = state.available.pop_front() {
            let Some(record) = state.keys.get_mut(&key) else {
                continue;
            };
            if now < record.expires_at {
                record.state = KeyState::Leased { until };
                leased = Some(key);
                break;
            }
            state.keys.remove(&key);
            discarded += 1;
        }
        state.check_invariants();
        let counts = state.counts();
        drop(guard);

        if discarded > 0 {
            debug!(discarded, "dropped expired keys while leasing");
        }
        let result = leased.ok_or(Error::PoolEmpty);
        match &result {
            Ok(key) => debug!(key = %key, "key leased"),
            Err(_) => debug!("lease requested but no keys available"),
        }
        record_operation("lease", &result);
        publish_counts(counts);
        result
    }

    /// Return a leased key to the queue, renewing its lifetime.
    pub async fn release(&self, key: &str) -> Result<()> {
        let expires_at = deadline(Instant::now(), self.settings.key_lifetime);

        let mut state = self.state.lock().await;
        let result = state.release(key, expires_at);
        state.check_invariants();
        let counts = state.counts();
        drop(state);

        if result.is_ok() {
            debug!(key, "key released");
        }
        record_operation("release", &result);
        publish_counts(counts);
        result
    }

    /// Permanently remove a currently leased key.
    ///
    /// A key sitting in the available queue is reported as `NotLeased`; it has
    /// to be leased before it can be deleted.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let result = state.delete(key);
        state.check_invariants();
        let counts = state.counts();
        drop(state);

        if result.is_ok() {
            info!(key, "key deleted");
        }
        record_operation("delete", &result);
        publish_counts(counts);
        result
    }

    /// Renew a key's lifetime regardless of its lease state.
    ///
    /// A key whose lifetime already elapsed is reclaimed on the spot and
    /// reported as `Expired`.
    pub async fn keep_alive(&self, key: &str) -> Result<()> {
        let now = Instant::now();

        let mut state = self.state.lock().await;
        let result = match state.keys.get(key).map(|r| r.expires_at) {
            None => Err(Error::Unknown(key.to_string())),
            Some(expires_at) if now >= expires_at => {
                state.reclaim(key);
                Err(Error::Expired(key.to_string()))
            }
            Some(_) => {
                if let Some(record) = state.keys.get_mut(key) {
                    record.expires_at = deadline(now, self.settings.key_lifetime);
                }
                Ok(())
            }
        };
        state.check_invariants();
        let counts = state.counts();
        drop(state);

        match &result {
            Ok(()) => debug!(key, "key lifetime renewed"),
            Err(Error::Expired(_)) => info!(key, "keep-alive on expired key, key removed"),
            Err(_) => {}
        }
        record_operation("keep_alive", &result);
        publish_counts(counts);
        result
    }

    /// Run one reclamation pass over every tracked key.
    ///
    /// A key whose lease deadline passed is released first, then removed as
    /// well if the lifetime it had before that release has also elapsed. Each
    /// key is handled on its own: a failure on one is logged and the pass moves
    /// on to the next.
    pub async fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let renewed = deadline(now, self.settings.key_lifetime);
        let mut report = SweepReport::default();

        let mut state = self.state.lock().await;
        let snapshot: Vec<(Key, KeyRecord)> =
            state.keys.iter().map(|(k, r)| (k.clone(), *r)).collect();

        for (key, record) in snapshot {
            let lease_overdue = matches!(record.state, KeyState::Leased { until } if now >= until);
            if lease_overdue {
                match state.release(key.as_str(), renewed) {
                    Ok(()) => report.released.push(key.clone()),
                    Err(e) => {
                        warn!(key = %key, error = %e, "failed to release overdue lease, continuing sweep");
                    }
                }
            }

            if now >= record.expires_at {
                match state.reclaim(key.as_str()) {
                    Some(_) => report.removed.push(key),
                    None => {
                        warn!(key = %key, "expired key vanished during sweep, continuing");
                    }
                }
            }
        }
        state.check_invariants();
        let counts = state.counts();
        drop(state);

        metrics::counter!("key_pool_keys_reclaimed_total", "reason" => "lease_timeout")
            .increment(report.released.len() as u64);
        metrics::counter!("key_pool_keys_reclaimed_total", "reason" => "lifetime_expired")
            .increment(report.removed.len() as u64);
        publish_counts(counts);
        report
    }

    /// Snapshot of the queue, the leased set and every key record.
    pub async fn stats(&self) -> PoolStats {
        let now = Instant::now();
        let state = self.state.lock().await;

        let available: Vec<Key> = state.available.iter().cloned().collect();
        let mut blocked: Vec<Key> = state
            .keys
            .iter()
            .filter(|(_, r)| matches!(r.state, KeyState::Leased { .. }))
            .map(|(k, _)| k.clone())
            .collect();
        blocked.sort();

        let mut keys: Vec<KeyStats> = state
            .keys
            .iter()
            .map(|(key, record)| KeyStats {
                key: key.clone(),
                state: record.state.label(),
                expires_in_secs: record.expires_at.saturating_duration_since(now).as_secs(),
                blocked_for_secs: match record.state {
                    KeyState::Leased { until } => {
                        Some(until.saturating_duration_since(now).as_secs())
                    }
                    KeyState::Available => None,
                },
            })
            .collect();
        keys.sort_by(|a, b| a.key.cmp(&b.key));

        PoolStats {
            available,
            blocked,
            keys,
        }
    }

    /// Count keys by state.
    pub async fn counts(&self) -> PoolCounts {
        self.state.lock().await.counts()
    }
}

/// Roughly 30 years; stands in for durations too large to add to an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + span`, clamped instead of overflowing.
fn deadline(now: Instant, span: Duration) -> Instant {
    now.checked_add(span)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

fn record_operation<T>(operation: &'static str, result: &Result<T>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.label(),
    };
    metrics::counter!("key_pool_operations_total", "operation" => operation, "outcome" => outcome)
        .increment(1);
}

fn publish_counts(counts: PoolCounts) {
    metrics::gauge!("key_pool_keys", "state" => "available").set(counts.available as f64);
    metrics::gauge!("key_pool_keys", "state" => "leased").set(counts.leased as f64);
}
