use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use super::{DrawingInput, EmbeddingGenerator, GenerationEngine};
use crate::core::config::ProviderConfig;
use crate::core::errors::{EngineError, EngineResult, ProviderError};
use crate::quote::ContextDocument;
use crate::store::DrawingAnalysis;

const ANALYSIS_PROMPT: &str = "Analyze this technical drawing and describe it in a structured way:\n\
1. DESCRIPTION: what the part is (type of part, overall shape)\n\
2. DIMENSIONS: main dimensions if visible (length, width, height, diameters, thickness)\n\
3. FEATURES: estimated complexity (low, medium, high), tight tolerances, \
holes, threads, bends, welds\n\
4. MATERIAL: as stated on the drawing, otherwise 'not specified'\n\
5. POSSIBLE PROCESSES: every process that could produce the part \
(CNC, laser cutting, bending, 3D printing, welding, ...). List options, do not choose.";

const SYSTEM_PROMPT: &str = "You produce manufacturing cost estimates as strict JSON.";

/// Provider for any server speaking the OpenAI HTTP API
/// (LM Studio, llama.cpp server, vLLM, OpenAI itself).
#[derive(Clone)]
pub struct OpenAiCompatProvider {
    base_url: String,
    client: Client,
    config: ProviderConfig,
}

impl OpenAiCompatProvider {
    pub fn new(config: &ProviderConfig) -> EngineResult<Self> {
        let base_url = config
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| EngineError::Config("provider.base_url is not set".to_string()))?;

        // Per-call timeouts are enforced by the retry policy.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| EngineError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            config: config.clone(),
        })
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value, ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.post(&url).json(body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let res = request.send().await.map_err(classify_transport)?;
        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        res.json::<Value>()
            .await
            .map_err(|e| ProviderError::permanent(format!("undecodable response from {path}: {e}")))
    }

    async fn chat_content(&self, model: &str, messages: Value, json_mode: bool) -> Result<String, ProviderError> {
        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": false,
        });
        if json_mode {
            if let Some(obj) = body.as_object_mut() {
                obj.insert("response_format".to_string(), json!({ "type": "json_object" }));
                obj.insert("temperature".to_string(), json!(0.2));
            }
        }

        let payload = self.post_json("/v1/chat/completions", &body).await?;
        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::permanent("chat completion returned no content"))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let body = json!({
            "model": self.config.embedding_model,
            "input": [text],
        });

        let payload = self.post_json("/v1/embeddings", &body).await?;
        let values = payload["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| ProviderError::permanent("embedding response has no vector"))?;

        let vector: Vec<f32> = values
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();
        if vector.is_empty() || vector.len() != values.len() {
            return Err(ProviderError::permanent("embedding response is malformed"));
        }
        Ok(vector)
    }
}

#[async_trait]
impl EmbeddingGenerator for OpenAiCompatProvider {
    async fn analyze(&self, drawing: &DrawingInput) -> Result<DrawingAnalysis, ProviderError> {
        let data_url = format!(
            "data:{};base64,{}",
            drawing.mime_type,
            base64::engine::general_purpose::STANDARD.encode(&drawing.bytes)
        );
        let messages = json!([{
            "role": "user",
            "content": [
                { "type": "text", "text": ANALYSIS_PROMPT },
                { "type": "image_url", "image_url": { "url": data_url } }
            ]
        }]);

        let description = self
            .chat_content(&self.config.vision_model, messages, false)
            .await?;
        if description.trim().is_empty() {
            return Err(ProviderError::permanent("drawing analysis is empty"));
        }

        let embedding = self.embed(&description).await?;
        tracing::debug!(
            drawing = %drawing.drawing_ref,
            dimension = embedding.len(),
            "drawing analyzed"
        );

        Ok(DrawingAnalysis {
            description,
            embedding,
        })
    }
}

#[async_trait]
impl GenerationEngine for OpenAiCompatProvider {
    async fn synthesize(&self, context: &ContextDocument) -> Result<Value, ProviderError> {
        let messages = json!([
            { "role": "system", "content": SYSTEM_PROMPT },
            { "role": "user", "content": context.render_prompt() }
        ]);

        let content = self
            .chat_content(&self.config.generation_model, messages, true)
            .await?;
        Ok(extract_json(&content))
    }
}

/// Parse model output as JSON, tolerating a surrounding markdown fence.
/// Text that is not JSON is handed back as a string for schema validation
/// to reject.
fn extract_json(content: &str) -> Value {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    serde_json::from_str(unfenced).unwrap_or_else(|_| Value::String(content.to_string()))
}

fn classify_status(status: StatusCode, body: &str) -> ProviderError {
    let message = format!("HTTP {}: {}", status.as_u16(), truncate(body, 300));
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        ProviderError::transient(message)
    } else {
        ProviderError::permanent(message)
    }
}

fn classify_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ProviderError::transient(err.to_string())
    } else {
        ProviderError::permanent(err.to_string())
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
