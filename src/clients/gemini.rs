use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::clients::{ContentClient, ImageClient};
use crate::error::{ContentError, ImageApiError};
use crate::models::{ChunkSpec, GeneratedItem, GenerationRequest};

const TEXT_MODEL: &str = "gemini-1.5-flash";
const IMAGE_MODEL: &str = "gemini-2.5-flash-image-preview";

#[derive(Debug)]
enum CallError {
    RateLimited,
    Timeout,
    Blocked(String),
    Http(String),
    Parse(String),
}

impl From<CallError> for ContentError {
    fn from(e: CallError) -> Self {
        match e {
            CallError::RateLimited => ContentError::RateLimited,
            CallError::Timeout => ContentError::Timeout,
            CallError::Blocked(msg) | CallError::Parse(msg) => ContentError::InvalidResponse(msg),
            CallError::Http(msg) => ContentError::Http(msg),
        }
    }
}

impl From<CallError> for ImageApiError {
    fn from(e: CallError) -> Self {
        match e {
            CallError::RateLimited => ImageApiError::RateLimited,
            CallError::Timeout => ImageApiError::Timeout,
            CallError::Blocked(msg) => ImageApiError::ContentPolicyViolation(msg),
            CallError::Http(msg) | CallError::Parse(msg) => ImageApiError::Http(msg),
        }
    }
}

/// Shortens every `data` string in a response before it is logged; inline
/// images arrive there as base64.
fn truncate_base64_in_json(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                if key == "data" {
                    if let serde_json::Value::String(s) = val {
                        if s.len() > 100 {
                            *val = serde_json::Value::String(format!("{}...[truncated {} chars]", &s[..50], s.len() - 50));
                        }
                    }
                } else {
                    truncate_base64_in_json(val);
                }
            }
        }
        serde_json::Value::Array(arr) => arr.iter_mut().for_each(truncate_base64_in_json),
        _ => {}
    }
}

pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
}

/// The key from the environment, if it is usable at all. There is no offline
/// mode: a missing key would only turn every chunk into a failed call.
pub fn usable_api_key(raw: Option<String>) -> Option<String> {
    raw.map(|k| k.trim().to_string()).filter(|k| !k.is_empty() && k != "DEMO_KEY")
}

impl GeminiClient {
    pub fn new(api_key: String, base_url: Option<String>, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let base_url = base_url.unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string());
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self { client, api_key, base_url })
    }

    async fn perform_api_call(&self, model: &str, request_body: serde_json::Value) -> Result<GeminiResponse, CallError> {
        let url = format!("{}/models/{}:generateContent?key={}", self.base_url, model, self.api_key);
        info!("🔗 Making request to: {}", url.replace(&self.api_key, "***"));

        let response = self.client.post(&url).json(&request_body).send().await.map_err(|e| {
            if e.is_timeout() { CallError::Timeout } else { CallError::Http(e.to_string()) }
        })?;

        let status = response.status();
        info!("📥 Response status: {}", status);
        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!(model, "⏳ Gemini rate limit hit");
            return Err(CallError::RateLimited);
        }
        let response_text = response.text().await.map_err(|e| {
            if e.is_timeout() { CallError::Timeout } else { CallError::Http(e.to_string()) }
        })?;
        if !status.is_success() {
            error!("❌ API Error response: {}", response_text);
            return Err(CallError::Http(format!("status={} body={}", status, response_text)));
        }

        if response_text.len() > 1000 {
            if let Ok(mut json_value) = serde_json::from_str::<serde_json::Value>(&response_text) {
                truncate_base64_in_json(&mut json_value);
                info!("📥 Raw Gemini API response: {}", json_value);
            }
        } else {
            info!("📥 Raw Gemini API response: {}", response_text);
        }

        let parsed: GeminiResponse = serde_json::from_str(&response_text)
            .map_err(|e| CallError::Parse(format!("parse error: {}", e)))?;
        if let Some(reason) = parsed.prompt_feedback.as_ref().and_then(|f| f.block_reason.clone()) {
            return Err(CallError::Blocked(reason));
        }
        if let Some(reason) = parsed.candidates.iter().filter_map(|c| c.finish_reason.as_deref()).find(|r| r.contains("SAFETY")) {
            return Err(CallError::Blocked(reason.to_string()));
        }
        Ok(parsed)
    }

    async fn generate_json(&self, prompt: &str) -> Result<String, ContentError> {
        let payload = json!({
            "contents": [{ "parts": [{"text": prompt}] }],
            "generationConfig": {
                "temperature": 0.7,
                "topK": 40,
                "topP": 0.95,
                "responseMimeType": "application/json"
            }
        });
        let parsed = self.perform_api_call(TEXT_MODEL, payload).await?;
        extract_first_text(&parsed).ok_or_else(|| ContentError::InvalidResponse("no text content in response".into()))
    }

    pub fn build_chunk_prompt(chunk: &ChunkSpec) -> String {
        let concepts: Vec<String> = chunk
            .items
            .iter()
            .enumerate()
            .map(|(i, p)| {
                if p.categories.is_empty() {
                    format!("{}. {}", i + 1, p.concept)
                } else {
                    format!("{}. {} (categories: {})", i + 1, p.concept, p.categories.join(", "))
                }
            })
            .collect();
        let limits: Vec<String> = chunk
            .constraints
            .iter()
            .map(|(attr, r)| match (r.min, r.max) {
                (Some(lo), Some(hi)) => format!("{attr} between {lo} and {hi}"),
                (Some(lo), None) => format!("{attr} at least {lo}"),
                (None, Some(hi)) => format!("{attr} at most {hi}"),
                (None, None) => attr.clone(),
            })
            .collect();
        let goal = chunk.goal.as_deref().map(|g| format!(" Overall goal: {g}.")).unwrap_or_default();
        let limits = if limits.is_empty() { String::new() } else { format!(" Per serving: {}.", limits.join("; ")) };
        format!(
            "Create exactly {count} distinct recipes, one for each concept below.{goal}{limits}\n{concepts}\n\
            Respond with a JSON array of objects with keys: name (string), description (2-3 appetising sentences), \
            categories (array of strings), attributes (object of numeric nutrition values per serving, e.g. calories, protein_g, carbs_g, fat_g).",
            count = chunk.item_count(),
            concepts = concepts.join("\n"),
        )
    }
}

#[async_trait]
impl ContentClient for GeminiClient {
    async fn plan_concepts(&self, request: &GenerationRequest) -> Result<Vec<String>, ContentError> {
        let goal = request.goal.as_deref().unwrap_or("a varied, balanced selection");
        let cats = if request.categories.is_empty() { String::new() } else { format!(" Categories: {}.", request.categories.join(", ")) };
        let prompt = format!(
            "Plan {} distinct recipe concepts for: {}.{} Respond with a JSON array of short concept strings, no duplicates.",
            request.count, goal, cats
        );
        info!("🎯 Planning {} concepts", request.count);
        let text = self.generate_json(&prompt).await?;
        serde_json::from_str::<Vec<String>>(strip_code_fence(&text))
            .map_err(|e| ContentError::InvalidResponse(format!("concept list: {e}")))
    }

    async fn generate_items(&self, chunk: &ChunkSpec) -> Result<Vec<GeneratedItem>, ContentError> {
        let prompt = Self::build_chunk_prompt(chunk);
        info!("🎯 Generating chunk {} with prompt (truncated): {}", chunk.index + 1, prompt.chars().take(120).collect::<String>());
        let text = self.generate_json(&prompt).await?;
        let mut items: Vec<GeneratedItem> = serde_json::from_str(strip_code_fence(&text))
            .map_err(|e| ContentError::InvalidResponse(format!("recipe list: {e}")))?;
        if items.len() < chunk.item_count() {
            return Err(ContentError::InvalidResponse(format!(
                "expected {} recipes, got {}",
                chunk.item_count(),
                items.len()
            )));
        }
        items.truncate(chunk.item_count());
        info!("✅ Chunk {} produced {} recipes", chunk.index + 1, items.len());
        Ok(items)
    }
}

#[async_trait]
impl ImageClient for GeminiClient {
    async fn generate_image(&self, prompt: &str) -> Result<String, ImageApiError> {
        let request_body = json!({
            "contents": [{ "parts": [{"text": prompt}] }],
            "generationConfig": {
                "responseModalities": ["TEXT", "IMAGE"],
                "temperature": 0.4,
                "topP": 0.95,
                "topK": 64,
                "candidateCount": 1
            }
        });
        let parsed = self.perform_api_call(IMAGE_MODEL, request_body).await?;
        let (mime, data) = extract_first_image(&parsed).ok_or_else(|| ImageApiError::Http("no image data in response".into()))?;
        info!("🖼️ Extracted {} image ({} chars)", mime, data.len());
        Ok(format!("data:{};base64,{}", mime, data))
    }
}

fn strip_code_fence(text: &str) -> &str {
    let t = text.trim();
    let t = t.strip_prefix("```json").or_else(|| t.strip_prefix("```")).unwrap_or(t);
    t.strip_suffix("```").unwrap_or(t).trim()
}

// --- Response Parsing Helpers ---

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default, rename = "promptFeedback")]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct PromptFeedback {
    #[serde(rename = "blockReason")]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Content,
    #[serde(default, rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct Content { #[serde(default)] parts: Vec<Part> }

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Part {
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
    Text { text: String },
    Other(serde_json::Value),
}

#[derive(Debug, Deserialize)]
struct InlineData {
    data: String,
    #[serde(rename = "mimeType")]
    mime_type: String,
}

fn extract_first_image(resp: &GeminiResponse) -> Option<(String, String)> {
    resp.candidates.iter().flat_map(|c| &c.content.parts).find_map(|p| match p {
        Part::Inline { inline_data } => Some((inline_data.mime_type.clone(), inline_data.data.clone())),
        _ => None,
    })
}

fn extract_first_text(resp: &GeminiResponse) -> Option<String> {
    resp.candidates.iter().flat_map(|c| &c.content.parts).find_map(|p| match p {
        Part::Text { text } => Some(text.trim().to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttributeRange, ItemParams};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    #[test]
    fn parses_inline_image_parts() {
        let raw = r#"{"candidates":[{"content":{"parts":[{"text":"here"},{"inlineData":{"mimeType":"image/png","data":"iVBORw0KGgo"}}]}}]}"#;
        let parsed: GeminiResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(extract_first_image(&parsed), Some(("image/png".into(), "iVBORw0KGgo".into())));
        assert_eq!(extract_first_text(&parsed), Some("here".into()));
    }

    #[test]
    fn logged_responses_shorten_inline_data() {
        let long = "A".repeat(400);
        let mut value = json!({"candidates": [{"content": {"parts": [{"inlineData": {"data": long}}, {"text": "kept"}]}}]});
        truncate_base64_in_json(&mut value);
        let data = value["candidates"][0]["content"]["parts"][0]["inlineData"]["data"].as_str().unwrap();
        assert!(data.ends_with("...[truncated 350 chars]"), "{data}");
        assert_eq!(value["candidates"][0]["content"]["parts"][1]["text"], "kept");
    }

    #[test]
    fn missing_or_demo_key_is_unusable() {
        assert_eq!(usable_api_key(None), None);
        assert_eq!(usable_api_key(Some("   ".into())), None);
        assert_eq!(usable_api_key(Some("DEMO_KEY".into())), None);
        assert_eq!(usable_api_key(Some(" AIzaSyExample \n".into())), Some("AIzaSyExample".into()));
    }

    #[test]
    fn strips_markdown_fences() {
        assert_eq!(strip_code_fence("```json\n[\"a\"]\n```"), "[\"a\"]");
        assert_eq!(strip_code_fence("[1]"), "[1]");
    }

    #[test]
    fn chunk_prompt_names_every_concept_and_limit() {
        let mut constraints = BTreeMap::new();
        constraints.insert("calories".to_string(), AttributeRange { min: Some(300.0), max: Some(600.0) });
        let chunk = ChunkSpec {
            index: 0,
            items: vec![
                ItemParams { concept: "Miso salmon".into(), categories: vec!["main".into()] },
                ItemParams { concept: "Berry oats".into(), categories: vec![] },
            ],
            constraints,
            goal: Some("high protein".into()),
        };
        let prompt = GeminiClient::build_chunk_prompt(&chunk);
        assert!(prompt.contains("exactly 2 distinct recipes"));
        assert!(prompt.contains("1. Miso salmon (categories: main)"));
        assert!(prompt.contains("2. Berry oats"));
        assert!(prompt.contains("calories between 300 and 600"));
        assert!(prompt.contains("high protein"));
    }
}
