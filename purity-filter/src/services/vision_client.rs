//! Google Cloud Vision safe-search client
//!
//! Sends `SAFE_SEARCH_DETECTION` requests to the `images:annotate` REST
//! endpoint. Responses are positional: the n-th response belongs to the
//! n-th submitted reference.

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use purity_common::db::SafeSearchScores;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;

/// Images allowed in one `images:annotate` call
pub const MAX_IMAGES_PER_CALL: usize = 16;

const USER_AGENT: &str = concat!("purity-filter/", env!("CARGO_PKG_VERSION"));

/// Provider errors
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("API error {0}: {1}")]
    ApiError(u16, String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Provider timed out after {0:?}")]
    Timeout(Duration),
}

/// Outcome for one submitted reference
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderItem {
    pub scores: Option<SafeSearchScores>,
    pub error: Option<String>,
}

/// Remote content-safety classifier
#[async_trait]
pub trait ClassificationProvider: Send + Sync {
    /// One entry per reference, positionally. `None` means the provider
    /// returned nothing for that position.
    async fn classify_batch(
        &self,
        references: &[String],
    ) -> Result<Vec<Option<ProviderItem>>, ProviderError>;
}

/// Provider likelihood scale
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Likelihood {
    #[default]
    Unknown,
    VeryUnlikely,
    Unlikely,
    Possible,
    Likely,
    VeryLikely,
}

impl Likelihood {
    /// Unrecognized names map to `Unknown`
    pub fn from_name(name: &str) -> Self {
        match name {
            "VERY_UNLIKELY" => Likelihood::VeryUnlikely,
            "UNLIKELY" => Likelihood::Unlikely,
            "POSSIBLE" => Likelihood::Possible,
            "LIKELY" => Likelihood::Likely,
            "VERY_LIKELY" => Likelihood::VeryLikely,
            _ => Likelihood::Unknown,
        }
    }

    pub fn score(self) -> i16 {
        match self {
            Likelihood::Unknown => 0,
            Likelihood::VeryUnlikely => 1,
            Likelihood::Unlikely => 2,
            Likelihood::Possible => 3,
            Likelihood::Likely => 4,
            Likelihood::VeryLikely => 5,
        }
    }
}

#[derive(Debug, Serialize)]
struct AnnotateRequest<'a> {
    requests: Vec<ImageRequest<'a>>,
}

#[derive(Debug, Serialize)]
struct ImageRequest<'a> {
    image: Image<'a>,
    features: [Feature; 1],
}

#[derive(Debug, Serialize)]
struct Image<'a> {
    source: ImageSource<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageSource<'a> {
    image_uri: &'a str,
}

#[derive(Debug, Serialize)]
struct Feature {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Default, Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<ImageResponse>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageResponse {
    safe_search_annotation: Option<SafeSearchAnnotation>,
    error: Option<Status>,
}

#[derive(Debug, Default, Deserialize)]
struct SafeSearchAnnotation {
    #[serde(default)]
    adult: String,
    #[serde(default)]
    spoof: String,
    #[serde(default)]
    medical: String,
    #[serde(default)]
    violence: String,
    #[serde(default)]
    racy: String,
}

#[derive(Debug, Deserialize)]
struct Status {
    #[serde(default)]
    message: String,
}

impl From<SafeSearchAnnotation> for SafeSearchScores {
    fn from(annotation: SafeSearchAnnotation) -> Self {
        SafeSearchScores {
            adult: Likelihood::from_name(&annotation.adult).score(),
            spoof: Likelihood::from_name(&annotation.spoof).score(),
            medical: Likelihood::from_name(&annotation.medical).score(),
            violence: Likelihood::from_name(&annotation.violence).score(),
            racy: Likelihood::from_name(&annotation.racy).score(),
        }
    }
}

impl From<ImageResponse> for ProviderItem {
    fn from(response: ImageResponse) -> Self {
        ProviderItem {
            scores: response.safe_search_annotation.map(SafeSearchScores::from),
            error: response.error.map(|status| status.message),
        }
    }
}

/// Vision REST client
pub struct VisionClient {
    http_client: reqwest::Client,
    endpoint: String,
    api_key: String,
    rate_limiter: RateLimiter<
        governor::state::direct::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
}

impl VisionClient {
    /// `requests_per_second` of zero is treated as one
    pub fn new(
        endpoint: String,
        api_key: String,
        requests_per_second: u32,
    ) -> Result<Self, ProviderError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        let quota = Quota::per_second(NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN));

        Ok(Self {
            http_client,
            endpoint,
            api_key,
            rate_limiter: RateLimiter::direct(quota),
        })
    }

    async fn annotate(&self, references: &[String]) -> Result<Vec<ImageResponse>, ProviderError> {
        self.rate_limiter.until_ready().await;

        let body = AnnotateRequest {
            requests: references
                .iter()
                .map(|uri| ImageRequest {
                    image: Image {
                        source: ImageSource { image_uri: uri },
                    },
                    features: [Feature {
                        kind: "SAFE_SEARCH_DETECTION",
                    }],
                })
                .collect(),
        };

        tracing::debug!(images = references.len(), "Calling Vision images:annotate");

        let response = self
            .http_client
            .post(&self.endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::ApiError(status.as_u16(), error_text));
        }

        let parsed: AnnotateResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;

        Ok(parsed.responses)
    }
}

#[async_trait]
impl ClassificationProvider for VisionClient {
    async fn classify_batch(
        &self,
        references: &[String],
    ) -> Result<Vec<Option<ProviderItem>>, ProviderError> {
        let mut items = Vec::with_capacity(references.len());

        for chunk in references.chunks(MAX_IMAGES_PER_CALL) {
            let mut responses = self.annotate(chunk).await?.into_iter();
            for _ in chunk {
                items.push(responses.next().map(ProviderItem::from));
            }
        }

        tracing::info!(images = references.len(), "Vision safe-search batch complete");
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Query, routing::post, Json, Router};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_likelihood_scale() {
        let names = ["UNKNOWN", "VERY_UNLIKELY", "UNLIKELY", "POSSIBLE", "LIKELY", "VERY_LIKELY", "SOMETHING_NEW"];

        let scores: Vec<i16> = names.iter().map(|n| Likelihood::from_name(n).score()).collect();
        assert_eq!(scores, vec![0, 1, 2, 3, 4, 5, 0]);
    }

    #[test]
    fn test_response_conversion() {
        let response: AnnotateResponse = serde_json::from_value(json!({
            "responses": [
                {"safeSearchAnnotation": {"adult": "LIKELY", "spoof": "UNLIKELY", "medical": "VERY_UNLIKELY", "violence": "POSSIBLE", "racy": "VERY_LIKELY"}},
                {"error": {"code": 7, "message": "We can not access the URL currently."}},
                {}
            ]
        }))
        .unwrap();

        let items: Vec<ProviderItem> = response.responses.into_iter().map(ProviderItem::from).collect();

        assert_eq!(
            items[0].scores,
            Some(SafeSearchScores { adult: 4, spoof: 2, medical: 1, violence: 3, racy: 5 })
        );
        assert!(items[0].error.is_none());
        assert!(items[1].scores.is_none());
        assert_eq!(items[1].error.as_deref(), Some("We can not access the URL currently."));
        assert_eq!(items[2], ProviderItem::default());
    }

    /// Local stand-in for images:annotate that answers every image as
    /// VERY_LIKELY adult except the last one in each call, which it omits.
    async fn spawn_fake_vision(calls: Arc<AtomicUsize>) -> String {
        let app = Router::new().route(
            "/v1/annotate",
            post(move |Query(params): Query<HashMap<String, String>>, Json(body): Json<Value>| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(params.get("key").map(String::as_str), Some("test-key"));
                    let requests = body["requests"].as_array().cloned().unwrap_or_default();
                    assert!(requests.len() <= MAX_IMAGES_PER_CALL);
                    assert_eq!(requests[0]["features"][0]["type"], "SAFE_SEARCH_DETECTION");
                    let responses: Vec<Value> = requests
                        .iter()
                        .take(requests.len().saturating_sub(1))
                        .map(|_| json!({"safeSearchAnnotation": {"adult": "VERY_LIKELY"}}))
                        .collect();
                    Json(json!({ "responses": responses }))
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/v1/annotate", addr)
    }

    #[tokio::test]
    async fn test_classify_batch_chunks_and_keeps_positions() {
        let calls = Arc::new(AtomicUsize::new(0));
        let endpoint = spawn_fake_vision(Arc::clone(&calls)).await;
        let client = VisionClient::new(endpoint, "test-key".to_string(), 100).unwrap();
        let references: Vec<String> = (0..20).map(|i| format!("https://img/{}.png", i)).collect();

        let items = client.classify_batch(&references).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(items.len(), 20);
        assert_eq!(items[0].as_ref().unwrap().scores.unwrap().adult, 5);
        // Last slot of each call was omitted by the fake
        assert!(items[15].is_none());
        assert!(items[19].is_none());
        assert!(items[16].is_some());
    }

    #[tokio::test]
    async fn test_http_error_maps_to_api_error() {
        let app = Router::new().route(
            "/v1/annotate",
            post(|| async { (axum::http::StatusCode::FORBIDDEN, "API key not valid") }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = VisionClient::new(format!("http://{}/v1/annotate", addr), "bad".to_string(), 10).unwrap();
        let result = client.classify_batch(&["https://img/a.png".to_string()]).await;

        match result {
            Err(ProviderError::ApiError(status, body)) => {
                assert_eq!(status, 403);
                assert!(body.contains("API key not valid"));
            }
            other => panic!("expected ApiError, got {:?}", other),
        }
    }
}
