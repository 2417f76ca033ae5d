//! Process-local collaborators backing the default binary and the tests.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;

use crate::clients::{NewRecipe, ObjectStore, RecipeStore, UploadBody};
use crate::error::{PersistenceError, StorageError};
use crate::models::ItemId;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StoredRecipe {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub categories: Vec<String>,
    pub attributes: BTreeMap<String, f64>,
    pub image_url: Option<String>,
}

#[derive(Default)]
struct Table {
    next_id: i64,
    rows: BTreeMap<i64, StoredRecipe>,
}

/// Recipe table with integer keys. A batch is checked in full before any
/// row is written, so a failing batch leaves the table untouched.
#[derive(Default)]
pub struct InMemoryRecipeStore {
    table: RwLock<Table>,
}

impl InMemoryRecipeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &ItemId) -> Option<StoredRecipe> {
        let key: i64 = id.as_str().parse().ok()?;
        self.table.read().rows.get(&key).cloned()
    }

    pub fn len(&self) -> usize {
        self.table.read().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecipeStore for InMemoryRecipeStore {
    async fn insert_batch(&self, rows: Vec<NewRecipe>) -> Result<Vec<ItemId>, PersistenceError> {
        if let Some(bad) = rows.iter().find(|r| r.name.trim().is_empty()) {
            return Err(PersistenceError::ConstraintViolation(format!("recipe name is required: {:?}", bad.description)));
        }
        let mut table = self.table.write();
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            table.next_id += 1;
            let id = table.next_id;
            table.rows.insert(
                id,
                StoredRecipe {
                    id,
                    name: row.name,
                    description: row.description,
                    categories: row.categories,
                    attributes: row.attributes,
                    image_url: None,
                },
            );
            ids.push(ItemId::from(id));
        }
        Ok(ids)
    }

    async fn update_image(&self, id: &ItemId, url: &str) -> Result<(), PersistenceError> {
        let key: i64 = id
            .as_str()
            .parse()
            .map_err(|_| PersistenceError::ConstraintViolation(format!("unknown recipe id {id}")))?;
        let mut table = self.table.write();
        let row = table
            .rows
            .get_mut(&key)
            .ok_or_else(|| PersistenceError::ConstraintViolation(format!("unknown recipe id {id}")))?;
        row.image_url = Some(url.to_string());
        Ok(())
    }
}

pub struct InMemoryObjectStore {
    public_base: String,
    objects: RwLock<HashMap<String, Bytes>>,
}

impl InMemoryObjectStore {
    pub fn new(public_base: impl Into<String>) -> Self {
        Self { public_base: public_base.into(), objects: RwLock::new(HashMap::new()) }
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn upload(&self, body: UploadBody, key: &str) -> Result<String, StorageError> {
        let data = match body {
            UploadBody::Bytes { data, .. } => data,
            // nothing to fetch from in-process; keep the source reference
            UploadBody::Url(url) => Bytes::from(url.into_bytes()),
        };
        self.objects.write().insert(key.to_string(), data);
        Ok(format!("{}/{}", self.public_base.trim_end_matches('/'), key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn row(name: &str) -> NewRecipe {
        NewRecipe { name: name.into(), description: format!("{name} description"), categories: vec!["main".into()], attributes: BTreeMap::new() }
    }

    #[tokio::test]
    async fn batch_gets_sequential_numeric_ids() {
        let store = InMemoryRecipeStore::new();
        let ids = store.insert_batch(vec![row("a"), row("b")]).await.unwrap();
        assert_eq!(ids, vec![ItemId::from(1i64), ItemId::from(2i64)]);
        assert_eq!(store.get(&ids[1]).unwrap().name, "b");
    }

    #[tokio::test]
    async fn failing_batch_commits_nothing() {
        let store = InMemoryRecipeStore::new();
        let err = store.insert_batch(vec![row("a"), row(" ")]).await.unwrap_err();
        assert!(matches!(err, PersistenceError::ConstraintViolation(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn image_write_back() {
        let store = InMemoryRecipeStore::new();
        let ids = store.insert_batch(vec![row("a")]).await.unwrap();
        store.update_image(&ids[0], "https://cdn/x.png").await.unwrap();
        assert_eq!(store.get(&ids[0]).unwrap().image_url.as_deref(), Some("https://cdn/x.png"));
        assert!(store.update_image(&ItemId::from(99i64), "u").await.is_err());
    }

    #[tokio::test]
    async fn object_store_returns_public_url() {
        let store = InMemoryObjectStore::new("memory://images/");
        let url = store
            .upload(UploadBody::Bytes { content_type: "image/png".into(), data: Bytes::from_static(b"png") }, "jobs/1/a.png")
            .await
            .unwrap();
        assert_eq!(url, "memory://images/jobs/1/a.png");
        assert_eq!(store.get("jobs/1/a.png").unwrap(), Bytes::from_static(b"png"));
    }
}
