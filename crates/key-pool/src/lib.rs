//! In-memory lease pool for short-lived random keys
//!
//! Issues keys in fixed-size batches and tracks each one through its lifecycle.
//! A key is either available (queued for the next lease) or leased (checked
//! out with a deadline). Keys that are never returned are reclaimed: a lease
//! that outlives its deadline is released automatically, and a key whose total
//! lifetime elapses is removed outright.
//!
//! Key lifecycle:
//! 1. `generate` creates a batch; each key starts `Available` with a fresh lifetime
//! 2. `lease` hands out the oldest unexpired key → `Leased` with a deadline
//! 3. `release` returns it to the queue and renews its lifetime
//! 4. `delete` removes a leased key permanently
//! 5. `keep_alive` renews a key's lifetime without touching its lease
//! 6. The background sweeper auto-releases overdue leases and removes expired keys

pub mod error;
pub mod key;
pub mod pool;
pub mod sweeper;

pub use error::{Error, Result};
pub use key::Key;
pub use pool::{KeyPool, KeyState, KeyStats, PoolCounts, PoolSettings, PoolStats, SweepReport};
pub use sweeper::{Sweeper, spawn_sweeper};
