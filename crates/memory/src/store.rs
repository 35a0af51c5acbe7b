//! The vector-store interface and an in-memory implementation.
//!
//! Driver internals (Qdrant, pgvector, ...) are external collaborators;
//! this crate only speaks the [`VectorStore`] trait. The in-memory
//! cosine store backs tests and local runs.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;

use mx_domain::error::{Error, Result};

/// One search hit: the stored id, cosine score, and payload.
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: u32,
    pub score: f32,
    pub payload: Value,
}

/// Named interface over a vector database. Ids are unique per
/// collection; `update` is last-writer-wins by id.
#[async_trait::async_trait]
pub trait VectorStore: Send + Sync {
    async fn insert(&self, collection: &str, id: u32, vector: Vec<f32>, payload: Value)
        -> Result<()>;

    async fn update(&self, collection: &str, id: u32, vector: Vec<f32>, payload: Value)
        -> Result<()>;

    async fn delete(&self, collection: &str, id: u32) -> Result<()>;

    async fn get(&self, collection: &str, id: u32) -> Result<Option<Value>>;

    /// Top `limit` points by cosine similarity, highest first.
    async fn search(&self, collection: &str, vector: &[f32], limit: usize)
        -> Result<Vec<ScoredPoint>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type Collection = HashMap<u32, (Vec<f32>, Value)>;

#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    /// All `(id, payload)` pairs in a collection (diagnostics and tests).
    pub fn entries(&self, collection: &str) -> Vec<(u32, Value)> {
        self.collections
            .read()
            .get(collection)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(id, (_, payload))| (*id, payload.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[async_trait::async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn insert(
        &self,
        collection: &str,
        id: u32,
        vector: Vec<f32>,
        payload: Value,
    ) -> Result<()> {
        let mut collections = self.collections.write();
        let entries = collections.entry(collection.to_owned()).or_default();
        if entries.contains_key(&id) {
            return Err(Error::VectorStore(format!(
                "id {id} already exists in collection {collection}"
            )));
        }
        entries.insert(id, (vector, payload));
        Ok(())
    }

    async fn update(
        &self,
        collection: &str,
        id: u32,
        vector: Vec<f32>,
        payload: Value,
    ) -> Result<()> {
        self.collections
            .write()
            .entry(collection.to_owned())
            .or_default()
            .insert(id, (vector, payload));
        Ok(())
    }

    async fn delete(&self, collection: &str, id: u32) -> Result<()> {
        if let Some(entries) = self.collections.write().get_mut(collection) {
            entries.remove(&id);
        }
        Ok(())
    }

    async fn get(&self, collection: &str, id: u32) -> Result<Option<Value>> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .and_then(|entries| entries.get(&id))
            .map(|(_, payload)| payload.clone()))
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredPoint>> {
        let collections = self.collections.read();
        let Some(entries) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<ScoredPoint> = entries
            .iter()
            .map(|(id, (v, payload))| ScoredPoint {
                id: *id,
                score: cosine(vector, v),
                payload: payload.clone(),
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_rejects_duplicate_ids() {
        let store = InMemoryVectorStore::new();
        store
            .insert("k", 1, vec![1.0, 0.0], serde_json::json!({"text": "a"}))
            .await
            .unwrap();
        let err = store
            .insert("k", 1, vec![0.0, 1.0], serde_json::json!({"text": "b"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VectorStore(_)));
    }

    #[tokio::test]
    async fn update_is_last_writer_wins() {
        let store = InMemoryVectorStore::new();
        store
            .update("k", 1, vec![1.0, 0.0], serde_json::json!({"text": "old"}))
            .await
            .unwrap();
        store
            .update("k", 1, vec![1.0, 0.0], serde_json::json!({"text": "new"}))
            .await
            .unwrap();
        let payload = store.get("k", 1).await.unwrap().unwrap();
        assert_eq!(payload["text"], "new");
        assert_eq!(store.len("k"), 1);
    }

    #[tokio::test]
    async fn search_orders_by_cosine() {
        let store = InMemoryVectorStore::new();
        store
            .insert("k", 1, vec![1.0, 0.0], serde_json::json!({"text": "exact"}))
            .await
            .unwrap();
        store
            .insert("k", 2, vec![0.0, 1.0], serde_json::json!({"text": "orthogonal"}))
            .await
            .unwrap();
        store
            .insert("k", 3, vec![0.7, 0.7], serde_json::json!({"text": "diagonal"}))
            .await
            .unwrap();

        let hits = store.search("k", &[1.0, 0.0], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, 1);
        assert!(hits[0].score > 0.99);
        assert_eq!(hits[1].id, 3);
    }

    #[tokio::test]
    async fn collections_are_isolated() {
        let store = InMemoryVectorStore::new();
        store
            .insert("a", 1, vec![1.0], serde_json::json!({}))
            .await
            .unwrap();
        assert!(store.search("b", &[1.0], 5).await.unwrap().is_empty());
    }
}
