//! Document store collaborator.

use async_trait::async_trait;
use denorm_core::{
    document_id, id_value, new_entity_id, DenormResult, Document, EntityId, Filter,
    STORAGE_ID_FIELD,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Generic document store operations the engine relies on.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Get a document of `model` by id.
    async fn get_by_id(&self, model: &str, id: EntityId) -> DenormResult<Option<Document>>;

    /// All documents of `model` matching `filter`.
    async fn find_by_filter(&self, model: &str, filter: &Filter) -> DenormResult<Vec<Document>>;

    /// Overwrite the given top-level fields of one document.
    ///
    /// Returns `false` when the document no longer exists.
    async fn update_fields_by_id(
        &self,
        model: &str,
        id: EntityId,
        fields: Document,
    ) -> DenormResult<bool>;
}

/// In-memory document store keyed by model, then id.
pub struct InMemoryDocumentStore {
    collections: RwLock<HashMap<String, BTreeMap<EntityId, Document>>>,
    writes: AtomicU64,
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            writes: AtomicU64::new(0),
        }
    }
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a document. A document without an id gets a fresh
    /// `_id`. Returns the stored id.
    pub async fn insert(&self, model: &str, mut doc: Document) -> EntityId {
        let id = match document_id(&doc) {
            Some(id) => id,
            None => {
                let id = new_entity_id();
                doc.insert(STORAGE_ID_FIELD.to_string(), id_value(id));
                id
            }
        };
        self.collections
            .write()
            .await
            .entry(model.to_string())
            .or_default()
            .insert(id, doc);
        id
    }

    /// Remove a document. Returns whether it existed.
    pub async fn delete(&self, model: &str, id: EntityId) -> bool {
        self.collections
            .write()
            .await
            .get_mut(model)
            .and_then(|docs| docs.remove(&id))
            .is_some()
    }

    /// Every document of `model`, in id order.
    pub async fn all(&self, model: &str) -> Vec<Document> {
        self.collections
            .read()
            .await
            .get(model)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of successful `update_fields_by_id` calls so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get_by_id(&self, model: &str, id: EntityId) -> DenormResult<Option<Document>> {
        let collections = self.collections.read().await;
        Ok(collections.get(model).and_then(|docs| docs.get(&id)).cloned())
    }

    async fn find_by_filter(&self, model: &str, filter: &Filter) -> DenormResult<Vec<Document>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(model)
            .map(|docs| docs.values().filter(|d| filter.matches(d)).cloned().collect())
            .unwrap_or_default())
    }

    async fn update_fields_by_id(
        &self,
        model: &str,
        id: EntityId,
        fields: Document,
    ) -> DenormResult<bool> {
        let mut collections = self.collections.write().await;
        let Some(doc) = collections.get_mut(model).and_then(|docs| docs.get_mut(&id)) else {
            return Ok(false);
        };
        for (key, value) in fields {
            doc.insert(key, value);
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_insert_assigns_id() {
        let store = InMemoryDocumentStore::new();
        let id = store.insert("House", doc(json!({ "address": "A" }))).await;
        let stored = store.get_by_id("House", id).await.unwrap().unwrap();
        assert_eq!(stored["_id"], id_value(id));
        assert_eq!(stored["address"], json!("A"));
    }

    #[tokio::test]
    async fn test_find_by_nested_path() {
        let store = InMemoryDocumentStore::new();
        let house = new_entity_id();
        store
            .insert("Tenant", doc(json!({ "house": { "id": house.to_string() } })))
            .await;
        store
            .insert("Tenant", doc(json!({ "house": { "id": new_entity_id().to_string() } })))
            .await;

        let filter = Filter::any_path_eq(["house.id"], id_value(house));
        let found = store.find_by_filter("Tenant", &filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(store.find_by_filter("Lease", &filter).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_fields_merges_and_counts() {
        let store = InMemoryDocumentStore::new();
        let id = store
            .insert("Tenant", doc(json!({ "name": "T1", "house": null })))
            .await;
        let updated = store
            .update_fields_by_id("Tenant", id, doc(json!({ "house": { "id": "x" } })))
            .await
            .unwrap();
        assert!(updated);
        let stored = store.get_by_id("Tenant", id).await.unwrap().unwrap();
        assert_eq!(stored["name"], json!("T1"));
        assert_eq!(stored["house"]["id"], json!("x"));
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_update_missing_document_is_not_an_error() {
        let store = InMemoryDocumentStore::new();
        let updated = store
            .update_fields_by_id("Tenant", new_entity_id(), Document::new())
            .await
            .unwrap();
        assert!(!updated);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = InMemoryDocumentStore::new();
        let id = store.insert("House", Document::new()).await;
        assert!(store.delete("House", id).await);
        assert!(!store.delete("House", id).await);
        assert!(store.get_by_id("House", id).await.unwrap().is_none());
    }
}
