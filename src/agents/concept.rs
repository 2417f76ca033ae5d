use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::clients::ContentClient;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::models::{ChunkSpec, GenerationRequest, GenerationStrategy, ItemParams};

/// Turns a request into an ordered list of chunks with one concept per item.
pub struct ConceptAgent {
    client: Arc<dyn ContentClient>,
    chunk_size: usize,
    max_items: usize,
    planning_timeout: Duration,
}

impl ConceptAgent {
    pub fn new(client: Arc<dyn ContentClient>, config: &PipelineConfig) -> Self {
        Self {
            client,
            chunk_size: config.chunk_size.max(1),
            max_items: config.max_items,
            planning_timeout: config.planning_timeout,
        }
    }

    /// Request-level validation. Runs before a job exists.
    pub fn check(&self, request: &GenerationRequest) -> Result<(), PipelineError> {
        if request.count == 0 || request.count > self.max_items {
            return Err(PipelineError::InvalidRequest(format!(
                "count must be between 1 and {}, got {}",
                self.max_items, request.count
            )));
        }
        if request.categories.iter().any(|c| c.trim().is_empty()) {
            return Err(PipelineError::InvalidRequest("category filters must not be blank".into()));
        }
        for (attr, range) in &request.constraints {
            if attr.trim().is_empty() {
                return Err(PipelineError::InvalidRequest("constraint attribute name must not be blank".into()));
            }
            let bounds = [range.min, range.max];
            if bounds.iter().flatten().any(|v| !v.is_finite() || *v < 0.0) {
                return Err(PipelineError::InvalidRequest(format!("{attr}: bounds must be finite and non-negative")));
            }
            if let (Some(min), Some(max)) = (range.min, range.max) {
                if min > max {
                    return Err(PipelineError::InvalidRequest(format!("{attr}: min {min} exceeds max {max}")));
                }
            }
        }
        Ok(())
    }

    /// Plans the chunks. The elaboration call is best-effort: on error or
    /// timeout the default concepts are used and the reason is kept.
    pub async fn plan(&self, request: &GenerationRequest) -> Result<GenerationStrategy, PipelineError> {
        self.check(request)?;

        let (concepts, fallback_reason) =
            match tokio::time::timeout(self.planning_timeout, self.client.plan_concepts(request)).await {
                Ok(Ok(concepts)) => (concepts, None),
                Ok(Err(e)) => {
                    warn!(error = %e, "concept elaboration failed, using default strategy");
                    (Vec::new(), Some(format!("concept elaboration failed: {e}")))
                }
                Err(_) => {
                    warn!(timeout_secs = self.planning_timeout.as_secs(), "concept elaboration timed out, using default strategy");
                    (Vec::new(), Some("concept elaboration timed out".to_string()))
                }
            };

        let params = item_params(request, concepts);
        let chunks: Vec<ChunkSpec> = params
            .chunks(self.chunk_size)
            .enumerate()
            .map(|(index, items)| ChunkSpec {
                index,
                items: items.to_vec(),
                constraints: request.constraints.clone(),
                goal: request.goal.clone(),
            })
            .collect();

        info!(chunks = chunks.len(), items = request.count, chunk_size = self.chunk_size, "📋 strategy planned");
        Ok(GenerationStrategy { chunks, fallback_reason })
    }
}

/// One parameter set per requested item: elaborated concepts first (blank and
/// repeated ones dropped), padded with context-free defaults.
fn item_params(request: &GenerationRequest, concepts: Vec<String>) -> Vec<ItemParams> {
    let mut seen = std::collections::HashSet::new();
    let mut concepts: Vec<String> = concepts
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty() && seen.insert(c.to_lowercase()))
        .take(request.count)
        .collect();
    let base = request.goal.as_deref().map(str::trim).filter(|g| !g.is_empty()).unwrap_or("Chef's choice");
    for n in concepts.len()..request.count {
        concepts.push(format!("{base} recipe #{}", n + 1));
    }
    concepts
        .into_iter()
        .enumerate()
        .map(|(i, concept)| ItemParams {
            concept,
            categories: if request.categories.is_empty() {
                Vec::new()
            } else {
                vec![request.categories[i % request.categories.len()].clone()]
            },
        })
        .collect()
}
