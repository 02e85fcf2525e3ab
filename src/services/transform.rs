use async_trait::async_trait;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::{Client, StatusCode, Url};
use std::time::Duration;

/// Header carrying the optional preprocessor API key.
pub const API_KEY_HEADER: &str = "Salad-Api-Key";

/// Response header with the preprocessor's own processing time in seconds.
pub const INFERENCE_TIME_HEADER: &str = "X-Inference-Time";

/// Bytes produced by the preprocessor for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformOutput {
    pub data: Vec<u8>,
    pub gpu_time: Option<f64>,
}

/// Remote service that turns input bytes into output bytes for a profile.
#[async_trait]
pub trait TransformService: Send + Sync {
    async fn transform(
        &self,
        process_id: &str,
        input: Vec<u8>,
    ) -> Result<TransformOutput, TransformError>;
}

/// HTTP client for the image preprocessor (`POST {base}/image/{process_id}`).
pub struct TransformClient {
    http: Client,
    base_url: Url,
    api_key: Option<String>,
}

impl TransformClient {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, TransformError> {
        let base_url =
            Url::parse(base_url).map_err(|e| TransformError::InvalidUrl(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(TransformError::InvalidUrl(base_url.to_string()));
        }

        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(TransformError::Http)?;

        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    /// URL for a processing profile. The profile id is one encoded path segment.
    pub fn endpoint(&self, process_id: &str) -> Result<Url, TransformError> {
        let mut url = self.base_url.clone();
        url.set_query(None);
        url.set_fragment(None);
        url.path_segments_mut()
            .map_err(|_| TransformError::InvalidUrl(self.base_url.to_string()))?
            .clear()
            .push("image")
            .push(process_id);
        Ok(url)
    }
}

/// Read the inference time header. Missing or unparseable values are `None`.
pub fn parse_inference_time(value: Option<&HeaderValue>) -> Option<f64> {
    value?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
}

#[async_trait]
impl TransformService for TransformClient {
    async fn transform(
        &self,
        process_id: &str,
        input: Vec<u8>,
    ) -> Result<TransformOutput, TransformError> {
        let url = self.endpoint(process_id)?;

        let mut request = self
            .http
            .post(url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(input);
        if let Some(api_key) = &self.api_key {
            request = request.header(API_KEY_HEADER, api_key);
        }

        let response = request.send().await.map_err(TransformError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransformError::Status {
                status,
                body: body.chars().take(512).collect(),
            });
        }

        let gpu_time = parse_inference_time(response.headers().get(INFERENCE_TIME_HEADER));
        let data = response.bytes().await.map_err(TransformError::Http)?;
        if data.is_empty() {
            return Err(TransformError::EmptyBody);
        }

        Ok(TransformOutput {
            data: data.to_vec(),
            gpu_time,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("Invalid preprocessor URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Preprocessor returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("Preprocessor returned an empty body")]
    EmptyBody,
}
