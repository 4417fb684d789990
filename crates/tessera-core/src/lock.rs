//! In-process write serialization and backoff helpers.
//!
//! Writers to the same `(dataset, month)` unit must not interleave: the data
//! object and its manifest are published as one logical step. [`KeyedLocks`]
//! hands out one async mutex per key so unrelated keys proceed in parallel
//! while writers to the same key queue up.
//!
//! Cross-process safety comes from the conditional manifest write in the
//! catalog; the lock only removes pointless CAS contention inside a process.
//!
//! The backoff helpers are shared by CAS retry loops and stage retries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::sync::OwnedMutexGuard;

/// Default base backoff duration.
pub const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Default maximum backoff duration.
pub const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Upper bound (exclusive) of the random jitter added to each delay, in ms.
const JITTER_MAX_MS: u64 = 50;

/// A registry of per-key async mutexes.
///
/// Cloning is cheap and clones share the same lock table.
#[derive(Debug, Default, Clone)]
pub struct KeyedLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

/// Guard returned by [`KeyedLocks::lock`]. The key is released on drop.
#[derive(Debug)]
pub struct KeyedGuard {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl KeyedGuard {
    /// The key this guard holds.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl KeyedLocks {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for `key`, waiting for any current holder.
    pub async fn lock(&self, key: &str) -> KeyedGuard {
        let mutex = {
            let mut table = self
                .locks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            // Drop entries nobody else holds so the table doesn't grow without bound.
            table.retain(|k, m| k == key || Arc::strong_count(m) > 1);
            Arc::clone(table.entry(key.to_string()).or_default())
        };

        KeyedGuard {
            key: key.to_string(),
            _guard: mutex.lock_owned().await,
        }
    }

    /// Number of keys currently tracked.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.locks
            .lock()
            .map_or(0, |table| table.len())
    }
}

/// Computes the delay before retry number `attempt` (1-based).
///
/// Doubles from `base` on each attempt, capped at `max`, plus 0-50ms jitter.
#[must_use]
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    let delay = base.saturating_mul(1_u32 << exp).min(max);
    delay + Duration::from_millis(rand_jitter())
}

/// Generates random jitter for backoff (0-50ms).
fn rand_jitter() -> u64 {
    // Sub-second clock nanos are enough entropy to spread concurrent retries.
    let seed = u64::from(
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos(),
    );
    seed % JITTER_MAX_MS
}
