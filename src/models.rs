use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use uuid::Uuid;

pub type JobId = Uuid;

#[skip_serializing_none]
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq)]
pub struct AttributeRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl AttributeRange {
    pub fn contains(&self, value: f64) -> bool {
        self.min.map_or(true, |m| value >= m) && self.max.map_or(true, |m| value <= m)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GenerationRequest {
    pub count: usize,
    #[serde(default)]
    pub categories: Vec<String>, // e.g., breakfast, dessert
    #[serde(default)]
    pub constraints: BTreeMap<String, AttributeRange>, // e.g., calories, protein_g
    #[serde(default)]
    pub goal: Option<String>,
}

/// Per-item parameters handed to the content generator.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ItemParams {
    pub concept: String,
    pub categories: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChunkSpec {
    pub index: usize,
    pub items: Vec<ItemParams>,
    pub constraints: BTreeMap<String, AttributeRange>,
    pub goal: Option<String>,
}

impl ChunkSpec {
    pub fn item_count(&self) -> usize {
        self.items.len()
    }
}

#[skip_serializing_none]
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GenerationStrategy {
    pub chunks: Vec<ChunkSpec>,
    /// Set when the planning call failed and the default strategy was used.
    pub fallback_reason: Option<String>,
}

impl GenerationStrategy {
    pub fn total_items(&self) -> usize {
        self.chunks.iter().map(ChunkSpec::item_count).sum()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GeneratedItem {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, f64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Valid,
    AutoFixed { scale: f64, corrected: BTreeMap<String, f64> },
}

/// An item that passed validation. Rejected items are a separate type and
/// cannot be handed to persistence.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ValidatedItem {
    pub item: GeneratedItem,
    pub verdict: Verdict,
}

impl ValidatedItem {
    pub fn attributes(&self) -> &BTreeMap<String, f64> {
        match &self.verdict {
            Verdict::Valid => &self.item.attributes,
            Verdict::AutoFixed { corrected, .. } => corrected,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RejectedItem {
    pub item: GeneratedItem,
    pub reason: String,
}

/// Identifier assigned by the relational store. Stores hand back either
/// UUIDs or integer keys; both are carried as their string form.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Uuid> for ItemId {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}

impl From<i64> for ItemId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ItemId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ItemId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Everything the imaging stages read about a saved item. Every field is
/// filled by the persistence agent from the validated input.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PersistedItemResult {
    pub id: ItemId,
    pub name: String,
    pub description: String,
    pub categories: Vec<String>,
    pub image_url: String,
    pub chunk_index: usize,
    pub position: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ImageOutcome {
    Generated,
    PlaceholderFallback,
    Failed,
}

#[skip_serializing_none]
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ImageResult {
    pub item_id: ItemId,
    pub outcome: ImageOutcome,
    /// Temporary URL from the image API, or a placeholder data URL.
    pub url: String,
    pub attempts: u32,
    pub error: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StoredImage {
    pub item_id: ItemId,
    pub url: String,
    /// False when the upload failed and `url` is the temporary source.
    pub permanent: bool,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SavedItem {
    pub id: ItemId,
    pub name: String,
    pub image_url: String,
    pub image_outcome: ImageOutcome,
}

#[skip_serializing_none]
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ChunkReport {
    pub index: usize,
    pub planned: usize,
    pub generated: usize,
    pub rejected: usize,
    pub persisted: usize,
    pub images_generated: usize,
    pub images_placeholder: usize,
    pub images_uploaded: usize,
    pub error: Option<String>,
}

impl ChunkReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.persisted > 0
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct JobResult {
    pub requested: usize,
    pub generated: usize,
    pub persisted: usize,
    pub images_generated: usize,
    pub images_placeholder: usize,
    pub images_uploaded: usize,
    pub degraded: bool,
    pub errors: Vec<String>,
    pub saved_items: Vec<SavedItem>,
    pub chunks: Vec<ChunkReport>,
}
