//! Stock images substituted when real image generation is exhausted.

use std::collections::BTreeMap;
use std::path::Path;

use include_dir::{include_dir, Dir};

use crate::data_url;
use crate::hashing::stable_hash;
use crate::models::ItemId;

static EMBEDDED: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/assets/placeholders");

pub const DEFAULT_CATEGORY: &str = "default";

#[derive(Debug, Clone, PartialEq)]
pub struct Placeholder {
    pub name: String,
    pub data_url: String,
}

/// Per-category pools of placeholder images. Selection is keyed by a stable
/// hash of the item's identity and position, never by chance.
#[derive(Debug, Clone)]
pub struct PlaceholderPool {
    pools: BTreeMap<String, Vec<Placeholder>>,
}

impl PlaceholderPool {
    pub fn embedded() -> Self {
        let mut pools = BTreeMap::new();
        for dir in EMBEDDED.dirs() {
            let category = dir.path().file_name().and_then(|n| n.to_str()).unwrap_or(DEFAULT_CATEGORY).to_lowercase();
            let mut files: Vec<_> = dir.files().collect();
            files.sort_by(|a, b| a.path().cmp(b.path()));
            let images = files
                .into_iter()
                .map(|f| Placeholder {
                    name: f.path().display().to_string(),
                    data_url: data_url::encode(mime_for(f.path()), f.contents()),
                })
                .collect();
            pools.insert(category, images);
        }
        Self::new(pools)
    }

    /// Builds a pool; a `default` category is synthesised if missing or empty.
    pub fn new(mut pools: BTreeMap<String, Vec<Placeholder>>) -> Self {
        pools.retain(|_, v| !v.is_empty());
        pools.entry(DEFAULT_CATEGORY.to_string()).or_insert_with(|| vec![generated_default()]);
        Self { pools }
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.pools.keys().map(String::as_str)
    }

    /// Picks from the first category with a pool, falling back to `default`.
    /// The same `(item_id, chunk_index, position)` always yields the same image.
    pub fn select(&self, categories: &[String], item_id: &ItemId, chunk_index: usize, position: usize) -> &Placeholder {
        let pool = categories
            .iter()
            .find_map(|c| self.pools.get(&c.trim().to_lowercase()))
            .or_else(|| self.pools.get(DEFAULT_CATEGORY))
            .filter(|p| !p.is_empty());
        let pool = match pool {
            Some(pool) => pool,
            None => &self.pools[DEFAULT_CATEGORY],
        };
        let key = stable_hash([
            item_id.as_str().as_bytes(),
            &(chunk_index as u64).to_be_bytes()[..],
            &(position as u64).to_be_bytes()[..],
        ]);
        &pool[(key % pool.len() as u64) as usize]
    }

    #[cfg(test)]
    pub fn is_placeholder(&self, url: &str) -> bool {
        self.pools.values().flatten().any(|p| p.data_url == url)
    }
}

fn mime_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "image/svg+xml",
    }
}

fn generated_default() -> Placeholder {
    let svg = r##"<svg width="512" height="512" xmlns="http://www.w3.org/2000/svg"><rect width="512" height="512" fill="#6B7280"/><text x="256" y="256" font-family="Arial, sans-serif" font-size="32" text-anchor="middle" fill="white">Recipe</text></svg>"##;
    Placeholder { name: "generated/default.svg".into(), data_url: data_url::encode("image/svg+xml", svg.as_bytes()) }
}
