//! Process-local [`MetricsStore`] for single-instance deployments and tests.
//!
//! Expiry is measured with tokio's clock so paused-time tests see windows roll over.

use std::{
    collections::{BTreeSet, HashMap},
    time::Duration,
};

use async_trait::async_trait;
use regex::Regex;
use tokio::{sync::Mutex, time::Instant};

use super::{MetricsStore, StoreError};

#[derive(Debug)]
enum StoredValue {
    Text(String),
    Set(BTreeSet<String>),
}

#[derive(Debug)]
struct Entry {
    value: StoredValue,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Writes sweep every expired entry at most this often.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct Table {
    entries: HashMap<String, Entry>,
    last_sweep: Option<Instant>,
}

impl Table {
    fn purge(&mut self, key: &str, now: Instant) {
        if self.entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            self.entries.remove(key);
        }
    }

    fn sweep(&mut self, now: Instant) {
        self.entries.retain(|_, entry| !entry.is_expired(now));
        self.last_sweep = Some(now);
    }

    /// Drops expired keys of other pairs so per-tenant windows do not pile up.
    fn sweep_if_due(&mut self, now: Instant) {
        let due = match self.last_sweep {
            Some(at) => now.saturating_duration_since(at) >= SWEEP_INTERVAL,
            None => true,
        };
        if due {
            self.sweep(now);
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryMetricsStore {
    table: Mutex<Table>,
}

impl InMemoryMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys, including expired ones not yet swept.
    pub async fn stored_keys(&self) -> usize {
        self.table.lock().await.entries.len()
    }
}

fn glob_to_regex(pattern: &str) -> Result<Regex, StoreError> {
    let escaped = regex::escape(pattern)
        .replace(r"\*", ".*")
        .replace(r"\?", ".");
    Regex::new(&format!("^{escaped}$")).map_err(|err| StoreError::Backend(err.to_string()))
}

#[async_trait]
impl MetricsStore for InMemoryMetricsStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut table = self.table.lock().await;
        table.purge(key, Instant::now());
        Ok(match table.entries.get(key) {
            Some(Entry {
                value: StoredValue::Text(text),
                ..
            }) => Some(text.clone()),
            _ => None,
        })
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut table = self.table.lock().await;
        table.sweep_if_due(Instant::now());
        table.entries.insert(
            key.to_string(),
            Entry {
                value: StoredValue::Text(value.to_string()),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut table = self.table.lock().await;
        table.sweep_if_due(now);
        table.entries.insert(
            key.to_string(),
            Entry {
                value: StoredValue::Text(value.to_string()),
                expires_at: Some(now + ttl),
            },
        );
        Ok(())
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let now = Instant::now();
        let mut table = self.table.lock().await;
        table.sweep_if_due(now);
        table.purge(key, now);

        match table.entries.get_mut(key) {
            Some(entry) => {
                let StoredValue::Text(text) = &mut entry.value else {
                    return Err(StoreError::NotAnInteger {
                        key: key.to_string(),
                    });
                };
                let next = text
                    .parse::<i64>()
                    .map_err(|_| StoreError::NotAnInteger {
                        key: key.to_string(),
                    })?
                    + 1;
                *text = next.to_string();
                Ok(next)
            }
            None => {
                table.entries.insert(
                    key.to_string(),
                    Entry {
                        value: StoredValue::Text("1".to_string()),
                        expires_at: Some(now + ttl),
                    },
                );
                Ok(1)
            }
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let now = Instant::now();
        let mut table = self.table.lock().await;
        table.purge(key, now);
        Ok(table
            .entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut table = self.table.lock().await;
        table.sweep_if_due(now);
        table.purge(key, now);
        let entry = table.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: StoredValue::Set(BTreeSet::new()),
            expires_at: None,
        });
        match &mut entry.value {
            StoredValue::Set(members) => {
                members.insert(member.to_string());
                Ok(())
            }
            StoredValue::Text(_) => Err(StoreError::Backend(format!(
                "key '{key}' holds a string, not a set"
            ))),
        }
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut table = self.table.lock().await;
        if let Some(Entry {
            value: StoredValue::Set(members),
            ..
        }) = table.entries.get_mut(key)
        {
            members.remove(member);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut table = self.table.lock().await;
        table.purge(key, Instant::now());
        Ok(match table.entries.get(key) {
            Some(Entry {
                value: StoredValue::Set(members),
                ..
            }) => members.iter().cloned().collect(),
            _ => Vec::new(),
        })
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let matcher = glob_to_regex(pattern)?;
        let now = Instant::now();
        let mut table = self.table.lock().await;
        table.sweep(now);

        let mut keys: Vec<String> = table
            .entries
            .keys()
            .filter(|key| matcher.is_match(key))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut table = self.table.lock().await;
        let mut removed = 0;
        for key in keys {
            if let Some(entry) = table.entries.remove(key) {
                if !entry.is_expired(now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}
