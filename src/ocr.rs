//! OCR provider abstraction used by the Partition Step (C6) when a document
//! is classified scanned (§4.6): a Danish-language-model-configured
//! OCR backend, generalized as a trait so other backends can be swapped in.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::CoreError;

#[derive(Debug, Clone)]
pub struct OcrPage {
    pub page_number: i64,
    pub text: String,
}

#[async_trait]
pub trait OcrProvider: Send + Sync {
    /// Runs OCR over a rendered page image, returning recognized text.
    async fn recognize_page(&self, page_number: i64, image_png: &[u8]) -> Result<OcrPage, CoreError>;
}

/// HTTP-backed OCR provider, calling a locally-hosted or remote OCR service
/// configured with a Danish language model (§1). The contract is kept
/// HTTP-generic rather than binding to a particular vendor SDK.
pub struct HttpOcrProvider {
    http: reqwest::Client,
    base_url: String,
    language: String,
}

impl HttpOcrProvider {
    pub fn new(base_url: impl Into<String>, language: impl Into<String>, timeout_secs: u64) -> Result<Self, CoreError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            language: language.into(),
        })
    }
}

#[async_trait]
impl OcrProvider for HttpOcrProvider {
    async fn recognize_page(&self, page_number: i64, image_png: &[u8]) -> Result<OcrPage, CoreError> {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(image_png);

        let body = serde_json::json!({
            "language": self.language,
            "image_base64": encoded,
        });

        let response = self
            .http
            .post(format!("{}/ocr", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::Partition {
                kind: crate::error::StepErrorKind::VendorError,
                message: format!("OCR request failed: {e}"),
            })?;

        if !response.status().is_success() {
            return Err(CoreError::Partition {
                kind: crate::error::StepErrorKind::VendorError,
                message: format!("OCR backend returned {}", response.status()),
            });
        }

        let json: serde_json::Value = response.json().await.map_err(|e| CoreError::Partition {
            kind: crate::error::StepErrorKind::VendorError,
            message: format!("OCR response not JSON: {e}"),
        })?;

        let text = json["text"].as_str().unwrap_or_default().to_string();
        Ok(OcrPage { page_number, text })
    }
}
