//! In-process ephemeral store.
//!
//! Backs the [`EphemeralStore`] contract with a `DashMap`. Suitable for a
//! single instance and for tests; multi-instance deployments need a shared
//! cache behind the same trait.

use super::EphemeralStore;
use crate::clock::Clock;
use crate::error::{EphemeralError, EphemeralResult};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Sorted(SortedSet),
}

/// Score-ordered members with a member index, so re-scoring a member never
/// scans the set.
#[derive(Debug, Clone, Default)]
struct SortedSet {
    by_score: BTreeSet<(i64, String)>,
    scores: HashMap<String, i64>,
}

impl SortedSet {
    fn insert(&mut self, score: i64, member: &str) {
        if let Some(previous) = self.scores.insert(member.to_string(), score) {
            if previous == score {
                return;
            }
            self.by_score.remove(&(previous, member.to_string()));
        }
        self.by_score.insert((score, member.to_string()));
    }

    fn remove_below(&mut self, min_score: i64) -> u64 {
        let keep = self.by_score.split_off(&(min_score, String::new()));
        let dropped = std::mem::replace(&mut self.by_score, keep);
        for (_, member) in &dropped {
            self.scores.remove(member);
        }
        dropped.len() as u64
    }

    fn len(&self) -> usize {
        self.by_score.len()
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    /// Unix millis after which the entry is gone. `None` never expires.
    expires_at: Option<i64>,
}

impl Entry {
    fn is_live(&self, now: i64) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// DashMap-backed TTL cache.
#[derive(Debug)]
pub struct MemoryEphemeralStore {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
}

impl MemoryEphemeralStore {
    /// Create an empty store reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Drop every expired entry. Returns how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    /// Number of keys currently held, including not-yet-swept expired ones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn deadline(&self, ttl: Duration) -> Option<i64> {
        Some(self.clock.now_millis().saturating_add(ttl.as_millis() as i64))
    }
}

#[async_trait]
impl EphemeralStore for MemoryEphemeralStore {
    async fn get(&self, key: &str) -> EphemeralResult<Option<String>> {
        let now = self.clock.now_millis();
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };
        if !entry.is_live(now) {
            drop(entry);
            self.entries.remove_if(key, |_, e| !e.is_live(now));
            return Ok(None);
        }
        match &entry.value {
            Value::Text(text) => Ok(Some(text.clone())),
            Value::Sorted(_) => Err(EphemeralError::WrongType {
                key: key.to_string(),
            }),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> EphemeralResult<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: self.deadline(ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> EphemeralResult<bool> {
        let now = self.clock.now_millis();
        let fresh = Entry {
            value: Value::Text(value.to_string()),
            expires_at: self.deadline(ttl),
        };
        // The entry guard holds the shard lock, so check-and-insert is atomic.
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    return Ok(false);
                }
                occupied.insert(fresh);
                Ok(true)
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> EphemeralResult<bool> {
        let now = self.clock.now_millis();
        let deadline = self.deadline(ttl);
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.is_live(now) => {
                entry.expires_at = deadline;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> EphemeralResult<bool> {
        let now = self.clock.now_millis();
        Ok(self
            .entries
            .remove(key)
            .map(|(_, entry)| entry.is_live(now))
            .unwrap_or(false))
    }

    async fn sorted_add(&self, key: &str, score: i64, member: &str) -> EphemeralResult<()> {
        let now = self.clock.now_millis();
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Sorted(SortedSet::default()),
            expires_at: None,
        });
        if !entry.is_live(now) {
            *entry = Entry {
                value: Value::Sorted(SortedSet::default()),
                expires_at: None,
            };
        }
        match &mut entry.value {
            Value::Sorted(set) => {
                set.insert(score, member);
                Ok(())
            }
            Value::Text(_) => Err(EphemeralError::WrongType {
                key: key.to_string(),
            }),
        }
    }

    async fn sorted_remove_below(&self, key: &str, min_score: i64) -> EphemeralResult<u64> {
        let now = self.clock.now_millis();
        let Some(mut entry) = self.entries.get_mut(key) else {
            return Ok(0);
        };
        if !entry.is_live(now) {
            return Ok(0);
        }
        match &mut entry.value {
            Value::Sorted(set) => Ok(set.remove_below(min_score)),
            Value::Text(_) => Err(EphemeralError::WrongType {
                key: key.to_string(),
            }),
        }
    }

    async fn sorted_len(&self, key: &str) -> EphemeralResult<u64> {
        let now = self.clock.now_millis();
        let Some(entry) = self.entries.get(key) else {
            return Ok(0);
        };
        if !entry.is_live(now) {
            return Ok(0);
        }
        match &entry.value {
            Value::Sorted(set) => Ok(set.len() as u64),
            Value::Text(_) => Err(EphemeralError::WrongType {
                key: key.to_string(),
            }),
        }
    }
}

/// Spawn a background task that periodically drops expired entries.
///
/// Returns a handle that can be used to abort the task.
pub fn spawn_sweeper(
    store: Arc<MemoryEphemeralStore>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = interval(every);
        loop {
            timer.tick().await;
            let dropped = store.sweep_expired();
            if dropped > 0 {
                tracing::debug!("Ephemeral sweep: dropped {} expired keys", dropped);
            }
        }
    })
}
