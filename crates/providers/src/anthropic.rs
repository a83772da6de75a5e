//! Anthropic Messages API provider.
//!
//! - `x-api-key` header authentication (not Bearer)
//! - `anthropic-version` header
//! - System prompt as a top-level field
//! - User images as base64 image content blocks
//! - Streaming via SSE: `content_block_delta` text deltas, usage from
//!   `message_start` and `message_delta`

use async_trait::async_trait;
use coxswain_core::block::{TurnRecord, Usage};
use coxswain_core::error::ProviderError;
use coxswain_core::provider::{ProviderClient, StreamEvent};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MAX_TOKENS: u32 = 8192;
const DEFAULT_CONTEXT_WINDOW: u64 = 200_000;

/// Anthropic Messages API client.
pub struct AnthropicClient {
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    context_window: u64,
    client: reqwest::Client,
}

impl AnthropicClient {
    /// Create a client for the given API key and model.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(600))
            .build()
            .map_err(|e| ProviderError::NotConfigured(e.to_string()))?;

        Ok(Self {
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            model: model.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            context_window: DEFAULT_CONTEXT_WINDOW,
            client,
        })
    }

    /// Custom base URL (testing, proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Override the advertised context window.
    pub fn with_context_window(mut self, window: u64) -> Self {
        self.context_window = window;
        self
    }

    /// Convert history records to API messages.
    fn to_api_messages(history: &[TurnRecord]) -> Vec<ApiMessage> {
        history
            .iter()
            .map(|record| match record {
                TurnRecord::User { text, images, .. } => {
                    if images.is_empty() {
                        ApiMessage {
                            role: "user",
                            content: ApiContent::Text(text.clone()),
                        }
                    } else {
                        let mut blocks = vec![ApiBlock::Text { text: text.clone() }];
                        for image in images {
                            blocks.push(ApiBlock::Image {
                                source: ApiImageSource {
                                    kind: "base64",
                                    media_type: image.media_type.clone(),
                                    data: image.data.clone(),
                                },
                            });
                        }
                        ApiMessage {
                            role: "user",
                            content: ApiContent::Blocks(blocks),
                        }
                    }
                }
                TurnRecord::Assistant { text, .. } => ApiMessage {
                    role: "assistant",
                    content: ApiContent::Text(text.clone()),
                },
            })
            .collect()
    }
}

#[async_trait]
impl ProviderClient for AnthropicClient {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn context_window(&self) -> u64 {
        self.context_window
    }

    async fn stream_turn(
        &self,
        system_prompt: &str,
        history: &[TurnRecord],
    ) -> Result<mpsc::Receiver<Result<StreamEvent, ProviderError>>, ProviderError> {
        if self.api_key.is_empty() {
            return Err(ProviderError::NotConfigured("missing API key".into()));
        }

        let url = format!("{}/v1/messages", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": system_prompt,
            "messages": Self::to_api_messages(history),
            "stream": true,
        });

        debug!(model = %self.model, records = history.len(), "Starting streamed turn");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        if status == 429 {
            return Err(ProviderError::RateLimited {
                retry_after_secs: 5,
            });
        }
        if status == 401 || status == 403 {
            return Err(ProviderError::AuthenticationFailed(
                "Invalid Anthropic API key".into(),
            ));
        }
        if status != 200 {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::ApiError {
                status_code: status,
                message,
            });
        }

        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(error = %e, "Provider stream interrupted");
                        let _ = tx
                            .send(Err(ProviderError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                };

                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim_end_matches('\r').to_string();
                    buffer = buffer[line_end + 1..].to_string();

                    if line.is_empty() || line.starts_with(':') {
                        continue;
                    }
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    let data = data.trim();
                    if data.is_empty() {
                        continue;
                    }

                    let event: serde_json::Value = match serde_json::from_str(data) {
                        Ok(v) => v,
                        Err(e) => {
                            trace!(error = %e, data = %data, "Ignoring unparseable SSE line");
                            continue;
                        }
                    };

                    match event["type"].as_str().unwrap_or("") {
                        "message_start" => {
                            if let Some(usage) = parse_usage(&event["message"]["usage"]) {
                                if tx.send(Ok(StreamEvent::Usage(usage))).await.is_err() {
                                    return;
                                }
                            }
                        }
                        "content_block_delta" => {
                            let delta = &event["delta"];
                            if delta["type"].as_str() == Some("text_delta") {
                                if let Some(text) = delta["text"].as_str() {
                                    let event = StreamEvent::Text {
                                        content: text.to_string(),
                                    };
                                    if tx.send(Ok(event)).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                        "message_delta" => {
                            if let Some(usage) = parse_usage(&event["usage"]) {
                                if tx.send(Ok(StreamEvent::Usage(usage))).await.is_err() {
                                    return;
                                }
                            }
                        }
                        "message_stop" => return,
                        "error" => {
                            let message = event["error"]["message"]
                                .as_str()
                                .unwrap_or("provider reported an error")
                                .to_string();
                            let _ = tx
                                .send(Err(ProviderError::StreamInterrupted(message)))
                                .await;
                            return;
                        }
                        _ => {}
                    }
                }
            }
            // Stream ended without message_stop: normal termination as far
            // as the consumer is concerned; the receiver just closes.
        });

        Ok(rx)
    }
}

/// Extract usage counters from an SSE usage object, if present.
fn parse_usage(value: &serde_json::Value) -> Option<Usage> {
    if !value.is_object() {
        return None;
    }
    Some(Usage {
        input_tokens: value["input_tokens"].as_u64().unwrap_or(0),
        output_tokens: value["output_tokens"].as_u64().unwrap_or(0),
        cache_writes: value["cache_creation_input_tokens"].as_u64().unwrap_or(0),
        cache_reads: value["cache_read_input_tokens"].as_u64().unwrap_or(0),
    })
}

// --- Request body types ---

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: ApiContent,
}

#[derive(Serialize)]
#[serde(untagged)]
enum ApiContent {
    Text(String),
    Blocks(Vec<ApiBlock>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiBlock {
    Text { text: String },
    Image { source: ApiImageSource },
}

#[derive(Serialize)]
struct ApiImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use coxswain_core::block::ImageData;

    #[test]
    fn constructor_and_overrides() {
        let client = AnthropicClient::new("sk-test", "claude-sonnet-4-20250514")
            .unwrap()
            .with_base_url("http://localhost:8080/")
            .with_context_window(100_000);
        assert_eq!(client.base_url, "http://localhost:8080");
        assert_eq!(client.context_window(), 100_000);
        assert_eq!(client.name(), "anthropic");
    }

    #[test]
    fn history_converts_to_api_messages() {
        let history = vec![
            TurnRecord::user("do the thing"),
            TurnRecord::assistant("<read_file><path>a</path></read_file>"),
        ];
        let messages = AnthropicClient::to_api_messages(&history);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].role, "assistant");

        let json = serde_json::to_string(&messages).unwrap();
        assert!(json.contains("do the thing"));
        assert!(json.contains("read_file"));
    }

    #[test]
    fn user_images_become_base64_blocks() {
        let record = TurnRecord::user_with_images(
            "see screenshot",
            vec![ImageData {
                media_type: "image/png".into(),
                data: "aGVsbG8=".into(),
            }],
        );
        let messages = AnthropicClient::to_api_messages(&[record]);
        let json = serde_json::to_string(&messages).unwrap();
        assert!(json.contains(r#""type":"image""#));
        assert!(json.contains(r#""media_type":"image/png""#));
        assert!(json.contains("aGVsbG8="));
    }

    #[test]
    fn usage_parses_cache_counters() {
        let value = serde_json::json!({
            "input_tokens": 100,
            "output_tokens": 20,
            "cache_creation_input_tokens": 5,
            "cache_read_input_tokens": 7,
        });
        let usage = parse_usage(&value).unwrap();
        assert_eq!(usage.total(), 132);
    }

    #[test]
    fn missing_usage_is_none() {
        assert!(parse_usage(&serde_json::Value::Null).is_none());
    }

    #[tokio::test]
    async fn empty_api_key_fails_fast() {
        let client = AnthropicClient::new("", "model").unwrap();
        let err = client.stream_turn("sys", &[]).await.unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured(_)));
    }
}
