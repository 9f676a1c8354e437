//! Worker-local key/value store with sliding expiry
//!
//! Entries stored with a ttl expire `ttl` seconds after they were last
//! written or read. Expiry records live in a min-heap and are checked
//! lazily: a record whose time no longer matches its entry (deleted,
//! refreshed or made permanent since) is discarded when it surfaces.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use workhive_config::EnvironmentConfig;
use workhive_errors::{ConfigError, Result};

/// Key/value store shared by the tasks that run on one worker.
///
/// Cloning yields another handle to the same store.
#[derive(Clone)]
pub struct Environment {
    inner: Arc<Inner>,
}

struct Inner {
    sweep_interval: Duration,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    expirations: BinaryHeap<Reverse<(Instant, String)>>,
    sweeping: bool,
}

struct Entry {
    value: Value,
    ttl: Option<Duration>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

impl State {
    /// Drop expired keys, stopping at the first record that is still live
    fn sweep(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        loop {
            let Some(Reverse((expires_at, key))) = self.expirations.peek() else {
                break;
            };
            let current = self.entries.get(key).and_then(|entry| entry.expires_at);
            let stale = current != Some(*expires_at);
            if !stale && now < *expires_at {
                break;
            }

            if let Some(Reverse((_, key))) = self.expirations.pop() {
                if !stale && self.entries.remove(&key).is_some() {
                    removed += 1;
                }
            }
        }
        removed
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new(&EnvironmentConfig::default())
    }
}

impl Environment {
    #[must_use]
    pub fn new(config: &EnvironmentConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                sweep_interval: config.sweep_interval(),
                state: Mutex::new(State::default()),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `value` under `key`.
    ///
    /// `Value::Null` deletes the key. With `ttl` the entry expires after
    /// `ttl` seconds without a read; without it the entry is permanent, even
    /// if it previously had a ttl.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidTtl` if `ttl` is zero.
    pub fn set(&self, key: impl Into<String>, value: Value, ttl: Option<u64>) -> Result<()> {
        if ttl == Some(0) {
            return Err(ConfigError::InvalidTtl { ttl: 0 }.into());
        }

        let key = key.into();
        if value.is_null() {
            self.delete(&key);
            return Ok(());
        }

        let ttl = ttl.map(Duration::from_secs);
        let start_sweep = {
            let mut state = self.lock();
            let expires_at = ttl.map(|ttl| Instant::now() + ttl);
            if let Some(at) = expires_at {
                state.expirations.push(Reverse((at, key.clone())));
            }
            state.entries.insert(
                key,
                Entry {
                    value,
                    ttl,
                    expires_at,
                },
            );
            expires_at.is_some() && !std::mem::replace(&mut state.sweeping, true)
        };

        if start_sweep {
            self.start_sweep();
        }
        Ok(())
    }

    /// Read `key`, sliding its expiry forward if it has a ttl
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        let mut state = self.lock();

        let entry = state.entries.get_mut(key)?;
        if entry.is_expired(now) {
            state.entries.remove(key);
            return None;
        }

        let value = entry.value.clone();
        if let Some(ttl) = entry.ttl {
            let refreshed = now + ttl;
            if entry.expires_at.is_none_or(|at| refreshed > at) {
                entry.expires_at = Some(refreshed);
                state.expirations.push(Reverse((refreshed, key.to_string())));
            }
        }
        Some(value)
    }

    /// Remove `key`; returns whether it was present
    pub fn delete(&self, key: &str) -> bool {
        self.lock().entries.remove(key).is_some()
    }

    /// Whether `key` holds a live value. Does not refresh the expiry.
    #[must_use]
    pub fn exists(&self, key: &str) -> bool {
        let now = Instant::now();
        self.lock()
            .entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Drop every entry and every pending expiry
    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.expirations.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of queued expiry records, stale ones included
    #[must_use]
    pub fn pending_expirations(&self) -> usize {
        self.lock().expirations.len()
    }

    /// Whether the background sweep is currently scheduled
    #[must_use]
    pub fn is_sweeping(&self) -> bool {
        self.lock().sweeping
    }

    fn start_sweep(&self) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(sweep_loop(
                    Arc::downgrade(&self.inner),
                    self.inner.sweep_interval,
                ));
            }
            Err(_) => {
                // Expired entries are still hidden from reads; the sweep
                // starts with the next ttl-bearing set inside a runtime.
                self.lock().sweeping = false;
            }
        }
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

async fn sweep_loop(weak: Weak<Inner>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            return;
        };

        let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = state.sweep(Instant::now());
        if removed > 0 {
            tracing::trace!(removed, "expired environment entries");
        }
        if state.expirations.is_empty() {
            state.sweeping = false;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn read_slides_expiry() {
        let env = Environment::default();
        env.set("token", json!("abc"), Some(5)).unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(env.get("token"), Some(json!("abc")));

        // 6s after the write but only 3s after the read
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(env.exists("token"));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!env.exists("token"));
        assert_eq!(env.get("token"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_expired_and_stops() {
        let env = Environment::default();
        env.set("a", json!(1), Some(1)).unwrap();
        env.set("b", json!(2), Some(2)).unwrap();
        env.set("keep", json!(3), None).unwrap();
        assert!(env.is_sweeping());

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(env.len(), 1);
        assert_eq!(env.pending_expirations(), 0);
        assert!(!env.is_sweeping());
        assert_eq!(env.get("keep"), Some(json!(3)));

        env.set("c", json!(4), Some(1)).unwrap();
        assert!(env.is_sweeping());
    }

    #[tokio::test(start_paused = true)]
    async fn overwrite_without_ttl_makes_entry_permanent() {
        let env = Environment::default();
        env.set("k", json!("temporary"), Some(1)).unwrap();
        env.set("k", json!("permanent"), None).unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(env.get("k"), Some(json!("permanent")));
        assert_eq!(env.pending_expirations(), 0);
    }

    #[test]
    fn null_deletes_and_zero_ttl_is_rejected() {
        let env = Environment::default();
        env.set("k", json!(true), None).unwrap();
        env.set("k", Value::Null, None).unwrap();
        assert!(!env.exists("k"));

        let err = env.set("k", json!(1), Some(0)).unwrap_err();
        assert!(matches!(
            err,
            workhive_errors::Error::Config(ConfigError::InvalidTtl { ttl: 0 })
        ));
    }

    #[test]
    fn stale_records_are_skipped() {
        let now = Instant::now();
        let mut state = State::default();
        state.entries.insert(
            "k".to_string(),
            Entry {
                value: json!(1),
                ttl: Some(Duration::from_secs(10)),
                expires_at: Some(now + Duration::from_secs(10)),
            },
        );
        state
            .expirations
            .push(Reverse((now + Duration::from_secs(1), "k".to_string())));
        state
            .expirations
            .push(Reverse((now + Duration::from_secs(10), "k".to_string())));

        assert_eq!(state.sweep(now + Duration::from_secs(2)), 0);
        assert!(state.entries.contains_key("k"));
        assert_eq!(state.expirations.len(), 1);

        assert_eq!(state.sweep(now + Duration::from_secs(10)), 1);
        assert!(state.entries.is_empty());
    }
}
