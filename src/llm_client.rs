//! LLM Client (C15): a uniform contract over chat-completion, vision, and
//! embedding calls, with correlation-tagged analytics emission.
//!
//! Every call carries the caller's `request_id` in a `tracing` span and
//! emits a `llm_call` event on completion with latency and token-ish sizing
//! — the concrete mechanism behind "correlation-tagged analytics emission".
//! Retries on 429 and 5xx with exponential backoff (1s, 2s, 4s, 8s, 16s,
//! 32s cap), fails fast on other 4xx.

use std::time::Duration;

use crate::config::LlmConfig;
use crate::error::{CoreError, StepErrorKind};

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }
}

pub struct LlmClient {
    http: reqwest::Client,
    config: LlmConfig,
    api_key: String,
    max_retries: u32,
}

impl LlmClient {
    pub fn new(config: LlmConfig, api_key: String, max_retries: u32, timeout_secs: u64) -> Result<Self, CoreError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        Ok(Self { http, config, api_key, max_retries })
    }

    /// Text-completion capability: used by generation, wiki synthesis, and
    /// checklist classification.
    pub async fn chat(
        &self,
        request_id: &str,
        messages: &[ChatMessage],
    ) -> Result<String, CoreError> {
        let span = tracing::info_span!("llm_call", request_id, model = %self.config.chat_model, capability = "chat");
        let _enter = span.enter();
        let started = std::time::Instant::now();

        let body = serde_json::json!({
            "model": self.config.chat_model,
            "messages": messages.iter().map(|m| serde_json::json!({"role": m.role, "content": m.content})).collect::<Vec<_>>(),
        });

        let json = self
            .post_with_retry(&format!("{}/chat/completions", self.config.base_url), &body)
            .await?;

        let content = json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| CoreError::ExternalApi {
                service: "llm_chat".to_string(),
                message: "missing choices[0].message.content".to_string(),
            })?
            .to_string();

        tracing::info!(duration_ms = started.elapsed().as_millis() as u64, "llm_call completed");
        Ok(content)
    }

    /// Vision-captioning capability: used by the enrichment step (C8) for
    /// tables and figures. `image_base64` is a data-URL-free base64 payload.
    pub async fn caption_image(
        &self,
        request_id: &str,
        prompt: &str,
        image_base64: &str,
        mime_type: &str,
    ) -> Result<String, CoreError> {
        let span = tracing::info_span!("llm_call", request_id, model = %self.config.vision_model, capability = "vision");
        let _enter = span.enter();
        let started = std::time::Instant::now();

        let body = serde_json::json!({
            "model": self.config.vision_model,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": prompt},
                    {"type": "image_url", "image_url": {"url": format!("data:{mime_type};base64,{image_base64}")}},
                ],
            }],
        });

        let json = self
            .post_with_retry(&format!("{}/chat/completions", self.config.base_url), &body)
            .await?;

        let caption = json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| CoreError::ExternalApi {
                service: "llm_vision".to_string(),
                message: "missing choices[0].message.content".to_string(),
            })?
            .to_string();

        tracing::info!(duration_ms = started.elapsed().as_millis() as u64, "llm_call completed");
        Ok(caption)
    }

    /// Embedding capability: used by the embedding step (C10) and by query
    /// encoding in retrieval (C11).
    pub async fn embed(&self, request_id: &str, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>, CoreError> {
        let span = tracing::info_span!("llm_call", request_id, model, capability = "embedding", batch_size = texts.len());
        let _enter = span.enter();
        let started = std::time::Instant::now();

        let body = serde_json::json!({ "model": model, "input": texts });
        let json = self
            .post_with_retry(&format!("{}/embeddings", self.config.base_url), &body)
            .await?;

        let data = json["data"].as_array().ok_or_else(|| CoreError::ExternalApi {
            service: "llm_embedding".to_string(),
            message: "missing data array".to_string(),
        })?;

        let embeddings: Vec<Vec<f32>> = data
            .iter()
            .map(|item| {
                item["embedding"]
                    .as_array()
                    .map(|arr| arr.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect())
                    .unwrap_or_default()
            })
            .collect();

        tracing::info!(duration_ms = started.elapsed().as_millis() as u64, "llm_call completed");
        Ok(embeddings)
    }

    async fn post_with_retry(&self, url: &str, body: &serde_json::Value) -> Result<serde_json::Value, CoreError> {
        let mut last_err: Option<CoreError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .http
                .post(url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json::<serde_json::Value>()
                            .await
                            .map_err(|e| CoreError::ExternalApi {
                                service: "llm".to_string(),
                                message: e.to_string(),
                            });
                    }
                    if status.as_u16() == 429 {
                        last_err = Some(CoreError::ExternalApi {
                            service: "llm".to_string(),
                            message: format!("rate limited ({status})"),
                        });
                        continue;
                    }
                    if status.is_server_error() {
                        last_err = Some(CoreError::ExternalApi {
                            service: "llm".to_string(),
                            message: format!("server error ({status})"),
                        });
                        continue;
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    return Err(CoreError::ExternalApi {
                        service: "llm".to_string(),
                        message: format!("{status}: {body_text}"),
                    });
                }
                Err(e) if e.is_timeout() => {
                    last_err = Some(CoreError::ExternalApi {
                        service: "llm".to_string(),
                        message: format!("timeout: {e}"),
                    });
                }
                Err(e) => {
                    last_err = Some(CoreError::ExternalApi {
                        service: "llm".to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        Err(last_err.unwrap_or(CoreError::ExternalApi {
            service: "llm".to_string(),
            message: "request failed after retries".to_string(),
        }))
    }
}

/// Maps an exhausted-retries client error onto the embedding step's typed
/// sub-kind (§7.1) so callers can decide whether to fail the run fatally.
pub fn classify_embedding_failure(err: &CoreError) -> StepErrorKind {
    match err {
        CoreError::ExternalApi { message, .. } if message.contains("rate limited") => {
            StepErrorKind::RateLimited
        }
        CoreError::ExternalApi { message, .. } if message.contains("timeout") => StepErrorKind::Timeout,
        _ => StepErrorKind::VendorError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: String) -> LlmConfig {
        LlmConfig {
            chat_model: "gpt-4o".to_string(),
            vision_model: "gpt-4o".to_string(),
            base_url,
            ocr_base_url: "http://127.0.0.1:1".to_string(),
        }
    }

    #[tokio::test]
    async fn chat_parses_message_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "the foundation depth is 2.5 metres"}}]
            })))
            .mount(&server)
            .await;

        let client = LlmClient::new(test_config(server.uri()), "test-key".to_string(), 3, 5).unwrap();
        let reply = client.chat("req-1", &[ChatMessage::user("depth?")]).await.unwrap();
        assert_eq!(reply, "the foundation depth is 2.5 metres");
    }

    #[tokio::test]
    async fn embed_parses_vector_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"embedding": vec![0.1_f32; 1024]},
                    {"embedding": vec![0.2_f32; 1024]},
                ]
            })))
            .mount(&server)
            .await;

        let client = LlmClient::new(test_config(server.uri()), "test-key".to_string(), 3, 5).unwrap();
        let vectors = client
            .embed("req-1", "voyage-multilingual-2", &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0].len(), 1024);
    }

    #[tokio::test]
    async fn chat_retries_on_rate_limit_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "ok"}}]
            })))
            .mount(&server)
            .await;

        let client = LlmClient::new(test_config(server.uri()), "test-key".to_string(), 3, 5).unwrap();
        let reply = client.chat("req-1", &[ChatMessage::user("hi")]).await.unwrap();
        assert_eq!(reply, "ok");
    }

    #[tokio::test]
    async fn chat_fails_fast_on_client_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .mount(&server)
            .await;

        let client = LlmClient::new(test_config(server.uri()), "test-key".to_string(), 3, 5).unwrap();
        let err = client.chat("req-1", &[ChatMessage::user("hi")]).await.unwrap_err();
        assert!(matches!(err, CoreError::ExternalApi { .. }));
    }

    #[test]
    fn classify_embedding_failure_maps_rate_limited() {
        let err = CoreError::ExternalApi {
            service: "llm".to_string(),
            message: "rate limited (429 Too Many Requests)".to_string(),
        };
        assert_eq!(classify_embedding_failure(&err), StepErrorKind::RateLimited);
    }
}
