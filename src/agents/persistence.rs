use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::clients::{NewRecipe, RecipeStore};
use crate::config::PipelineConfig;
use crate::error::{PersistenceError, PipelineError};
use crate::models::{ItemId, PersistedItemResult, ValidatedItem};
use crate::placeholders::PlaceholderPool;

/// Writes a chunk in one transaction and hands the imaging stages everything
/// they read, copied from the validated input rather than read back.
pub struct PersistenceAgent {
    store: Arc<dyn RecipeStore>,
    placeholders: Arc<PlaceholderPool>,
    timeout: Duration,
}

impl PersistenceAgent {
    pub fn new(store: Arc<dyn RecipeStore>, placeholders: Arc<PlaceholderPool>, config: &PipelineConfig) -> Self {
        Self { store, placeholders, timeout: config.persistence_timeout }
    }

    /// Inserts the chunk as one batch. The id-count and field checks run after
    /// the store has committed, so when they fail the rows stay behind: the
    /// error names their ids so the job record points at them.
    pub async fn persist(&self, chunk_index: usize, items: &[ValidatedItem]) -> Result<Vec<PersistedItemResult>, PipelineError> {
        let fail = |source: PersistenceError| {
            error!(chunk = chunk_index, error = %source, "❌ chunk persistence failed");
            PipelineError::Persistence { chunk: chunk_index, source }
        };

        let rows = items
            .iter()
            .map(|v| NewRecipe {
                name: v.item.name.clone(),
                description: v.item.description.clone(),
                categories: v.item.categories.clone(),
                attributes: v.attributes().clone(),
            })
            .collect();

        let ids = match tokio::time::timeout(self.timeout, self.store.insert_batch(rows)).await {
            Ok(Ok(ids)) => ids,
            Ok(Err(e)) => return Err(fail(e)),
            Err(_) => return Err(fail(PersistenceError::Timeout)),
        };
        if ids.len() != items.len() {
            return Err(fail(PersistenceError::ConstraintViolation(format!(
                "store returned {} ids for {} rows; committed ids: {}",
                ids.len(),
                items.len(),
                joined(&ids)
            ))));
        }

        let results: Vec<PersistedItemResult> = ids
            .into_iter()
            .zip(items)
            .enumerate()
            .map(|(position, (id, v))| {
                let placeholder = self.placeholders.select(&v.item.categories, &id, chunk_index, position);
                PersistedItemResult {
                    image_url: placeholder.data_url.clone(),
                    id,
                    name: v.item.name.clone(),
                    description: v.item.description.clone(),
                    categories: v.item.categories.clone(),
                    chunk_index,
                    position,
                }
            })
            .collect();

        if let Err(e) = ensure_no_field_loss(items, &results) {
            let ids: Vec<ItemId> = results.into_iter().map(|r| r.id).collect();
            return Err(fail(match e {
                PersistenceError::FieldLoss(field) => {
                    PersistenceError::FieldLoss(format!("{field}; committed ids: {}", joined(&ids)))
                }
                other => other,
            }));
        }
        info!(chunk = chunk_index, items = results.len(), "💾 chunk persisted");
        Ok(results)
    }
}

fn joined(ids: &[ItemId]) -> String {
    ids.iter().map(ItemId::as_str).collect::<Vec<_>>().join(", ")
}

/// Every field the image stages read must survive the persistence boundary.
pub fn ensure_no_field_loss(items: &[ValidatedItem], results: &[PersistedItemResult]) -> Result<(), PersistenceError> {
    for (source, out) in items.iter().zip(results) {
        let lost = if !source.item.name.is_empty() && out.name.is_empty() {
            Some("name")
        } else if !source.item.description.is_empty() && out.description.is_empty() {
            Some("description")
        } else if !source.item.categories.is_empty() && out.categories.is_empty() {
            Some("categories")
        } else if out.image_url.is_empty() {
            Some("image_url")
        } else {
            None
        };
        if let Some(field) = lost {
            return Err(PersistenceError::FieldLoss(format!("{field} of item {}", out.id)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::memory::InMemoryRecipeStore;
    use crate::models::{GeneratedItem, Verdict};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn validated(name: &str) -> ValidatedItem {
        ValidatedItem {
            item: GeneratedItem {
                name: name.into(),
                description: format!("Crispy {name} with herbs"),
                categories: vec!["dessert".into()],
                attributes: BTreeMap::from([("calories".to_string(), 300.0)]),
            },
            verdict: Verdict::Valid,
        }
    }

    fn agent(store: Arc<dyn RecipeStore>) -> PersistenceAgent {
        PersistenceAgent::new(store, Arc::new(PlaceholderPool::embedded()), &PipelineConfig::default())
    }

    struct UuidStore;

    #[async_trait]
    impl RecipeStore for UuidStore {
        async fn insert_batch(&self, rows: Vec<NewRecipe>) -> Result<Vec<ItemId>, PersistenceError> {
            Ok(rows.iter().map(|_| ItemId::from(Uuid::new_v4())).collect())
        }
        async fn update_image(&self, _: &ItemId, _: &str) -> Result<(), PersistenceError> {
            Ok(())
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl RecipeStore for BrokenStore {
        async fn insert_batch(&self, _: Vec<NewRecipe>) -> Result<Vec<ItemId>, PersistenceError> {
            Err(PersistenceError::Connection("connection reset".into()))
        }
        async fn update_image(&self, _: &ItemId, _: &str) -> Result<(), PersistenceError> {
            Ok(())
        }
    }

    /// Commits every row but reports one id short.
    struct ShortStore(InMemoryRecipeStore);

    #[async_trait]
    impl RecipeStore for ShortStore {
        async fn insert_batch(&self, rows: Vec<NewRecipe>) -> Result<Vec<ItemId>, PersistenceError> {
            let mut ids = self.0.insert_batch(rows).await?;
            ids.pop();
            Ok(ids)
        }
        async fn update_image(&self, _: &ItemId, _: &str) -> Result<(), PersistenceError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn results_carry_every_downstream_field() {
        let items = vec![validated("Tart"), validated("Crumble")];
        let results = agent(Arc::new(InMemoryRecipeStore::new())).persist(2, &items).await.unwrap();
        for (src, out) in items.iter().zip(&results) {
            assert_eq!(out.name, src.item.name);
            assert_eq!(out.description, src.item.description);
            assert_eq!(out.categories, src.item.categories);
            assert!(out.image_url.starts_with("data:image/svg+xml;base64,"));
            assert_eq!(out.chunk_index, 2);
        }
        assert_eq!(results[1].position, 1);
    }

    #[tokio::test]
    async fn uuid_keys_are_accepted() {
        let results = agent(Arc::new(UuidStore)).persist(0, &[validated("Flan")]).await.unwrap();
        assert!(Uuid::parse_str(results[0].id.as_str()).is_ok());
    }

    #[tokio::test]
    async fn store_failure_fails_the_chunk() {
        let err = agent(Arc::new(BrokenStore)).persist(1, &[validated("Flan")]).await.unwrap_err();
        assert!(matches!(err, PipelineError::Persistence { chunk: 1, source: PersistenceError::Connection(_) }));
    }

    #[tokio::test]
    async fn id_mismatch_names_the_committed_rows() {
        let err = agent(Arc::new(ShortStore(InMemoryRecipeStore::new())))
            .persist(0, &[validated("Tart"), validated("Flan")])
            .await
            .unwrap_err();
        match err {
            PipelineError::Persistence { source: PersistenceError::ConstraintViolation(msg), .. } => {
                assert!(msg.ends_with("committed ids: 1"), "{msg}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn lost_description_is_detected() {
        let items = vec![validated("Tart")];
        let results = vec![PersistedItemResult {
            id: ItemId::from(1i64),
            name: "Tart".into(),
            description: String::new(),
            categories: vec!["dessert".into()],
            image_url: "data:x".into(),
            chunk_index: 0,
            position: 0,
        }];
        assert!(matches!(ensure_no_field_loss(&items, &results), Err(PersistenceError::FieldLoss(f)) if f.starts_with("description")));
    }
}
