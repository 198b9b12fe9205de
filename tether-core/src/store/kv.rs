//! Shared key-value store contract
//!
//! Two shapes of data live in the store:
//! - plain string records (`connection_state:<service>`)
//! - score-ordered sets (`history:<service>`, reconnection events)
//!
//! `InMemoryStore` backs tests and single-process deployments. A networked
//! store implements the same trait.

use crate::core::errors::TetherResult;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;

/// Async key-value store with sorted-set support
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn set(&self, key: &str, value: String) -> TetherResult<()>;

    async fn get(&self, key: &str) -> TetherResult<Option<String>>;

    /// Returns whether the key existed
    async fn delete(&self, key: &str) -> TetherResult<bool>;

    /// All plain records whose key starts with `prefix`
    async fn scan_prefix(&self, prefix: &str) -> TetherResult<Vec<(String, String)>>;

    /// Insert or rescore `member` in the sorted set at `key`
    async fn zadd(&self, key: &str, score: f64, member: String) -> TetherResult<()>;

    /// Members with `min <= score <= max`, ascending by score
    async fn zrange_by_score(&self, key: &str, min: f64, max: f64)
        -> TetherResult<Vec<(String, f64)>>;

    /// Remove members with `min <= score <= max`; returns how many
    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> TetherResult<usize>;
}

/// Total order on f64 scores for the sorted-set index
#[derive(Debug, Clone, Copy, PartialEq)]
struct Score(f64);

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Default)]
struct SortedSet {
    by_member: std::collections::HashMap<String, f64>,
    by_score: BTreeMap<(Score, String), ()>,
}

impl SortedSet {
    fn insert(&mut self, score: f64, member: String) {
        if let Some(old) = self.by_member.insert(member.clone(), score) {
            self.by_score.remove(&(Score(old), member.clone()));
        }
        self.by_score.insert((Score(score), member), ());
    }

    fn range(&self, min: f64, max: f64) -> Vec<(String, f64)> {
        self.by_score
            .keys()
            .filter(|(score, _)| score.0 >= min && score.0 <= max)
            .map(|(score, member)| (member.clone(), score.0))
            .collect()
    }

    fn remove_range(&mut self, min: f64, max: f64) -> usize {
        let doomed: Vec<(Score, String)> = self
            .by_score
            .keys()
            .filter(|(score, _)| score.0 >= min && score.0 <= max)
            .cloned()
            .collect();
        for key in &doomed {
            self.by_score.remove(key);
            self.by_member.remove(&key.1);
        }
        doomed.len()
    }

    fn is_empty(&self) -> bool {
        self.by_member.is_empty()
    }
}

/// Process-local `SharedStore`
#[derive(Debug, Default)]
pub struct InMemoryStore {
    values: DashMap<String, String>,
    sorted: DashMap<String, SortedSet>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len() + self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SharedStore for InMemoryStore {
    async fn set(&self, key: &str, value: String) -> TetherResult<()> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> TetherResult<Option<String>> {
        Ok(self.values.get(key).map(|v| v.clone()))
    }

    async fn delete(&self, key: &str) -> TetherResult<bool> {
        let plain = self.values.remove(key).is_some();
        let sorted = self.sorted.remove(key).is_some();
        Ok(plain || sorted)
    }

    async fn scan_prefix(&self, prefix: &str) -> TetherResult<Vec<(String, String)>> {
        let mut entries: Vec<(String, String)> = self
            .values
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        entries.sort();
        Ok(entries)
    }

    async fn zadd(&self, key: &str, score: f64, member: String) -> TetherResult<()> {
        self.sorted
            .entry(key.to_string())
            .or_default()
            .insert(score, member);
        Ok(())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> TetherResult<Vec<(String, f64)>> {
        Ok(self
            .sorted
            .get(key)
            .map(|set| set.range(min, max))
            .unwrap_or_default())
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> TetherResult<usize> {
        let removed = match self.sorted.get_mut(key) {
            Some(mut set) => set.remove_range(min, max),
            None => return Ok(0),
        };
        self.sorted.remove_if(key, |_, set| set.is_empty());
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_plain_records() {
        let store = InMemoryStore::new();
        store.set("connection_state:a", "1".to_string()).await.unwrap();
        store.set("connection_state:b", "2".to_string()).await.unwrap();
        store.set("other:c", "3".to_string()).await.unwrap();

        assert_eq!(store.get("connection_state:a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.get("missing").await.unwrap(), None);

        let scanned = store.scan_prefix("connection_state:").await.unwrap();
        assert_eq!(scanned.len(), 2);
        assert_eq!(scanned[0].0, "connection_state:a");

        assert!(store.delete("other:c").await.unwrap());
        assert!(!store.delete("other:c").await.unwrap());
    }

    #[tokio::test]
    async fn test_sorted_set_ordering_and_rescore() {
        let store = InMemoryStore::new();
        store.zadd("h", 3.0, "c".to_string()).await.unwrap();
        store.zadd("h", 1.0, "a".to_string()).await.unwrap();
        store.zadd("h", 2.0, "b".to_string()).await.unwrap();

        let all = store.zrange_by_score("h", f64::NEG_INFINITY, f64::INFINITY).await.unwrap();
        let members: Vec<&str> = all.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(members, vec!["a", "b", "c"]);

        // Rescore moves the member, no duplicate
        store.zadd("h", 10.0, "a".to_string()).await.unwrap();
        let all = store.zrange_by_score("h", 0.0, 100.0).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[2], ("a".to_string(), 10.0));
    }

    #[tokio::test]
    async fn test_sorted_set_remove_range() {
        let store = InMemoryStore::new();
        for i in 0..5 {
            store.zadd("h", i as f64, format!("m{}", i)).await.unwrap();
        }

        let removed = store.zrem_range_by_score("h", f64::NEG_INFINITY, 1.5).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.zrange_by_score("h", 0.0, 10.0).await.unwrap().len(), 3);

        store.zrem_range_by_score("h", 0.0, 10.0).await.unwrap();
        assert!(store.is_empty());
        assert_eq!(store.zrem_range_by_score("missing", 0.0, 1.0).await.unwrap(), 0);
    }
}
