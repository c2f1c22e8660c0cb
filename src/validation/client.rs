use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use super::source::{KnowledgeSource, SourceRequest};
use super::SourceKind;
use crate::config::{RequestConfig, SourceConfig};
use crate::error::{ValidationError, ValidationResult};

/// Response body of a remote validation source.
#[derive(Debug, Deserialize)]
struct ScoreResponse {
    score: f64,
}

/// Validation source reached over HTTP.
///
/// Sends `POST {base_url}/v1/score` with a [`SourceRequest`] body and
/// expects `{ "score": <0..1> }` back.
#[derive(Clone)]
pub struct HttpKnowledgeSource {
    client: Client,
    kind: SourceKind,
    base_url: String,
    request_config: RequestConfig,
}

impl HttpKnowledgeSource {
    /// Create a new HTTP source
    pub fn new(
        kind: SourceKind,
        base_url: &str,
        request_config: RequestConfig,
    ) -> ValidationResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(ValidationError::Http)?;

        Ok(Self {
            client,
            kind,
            base_url: base_url.trim_end_matches('/').to_string(),
            request_config,
        })
    }

    /// Get the base URL (for testing)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Execute a single request (internal)
    async fn execute_request(&self, url: &str, request: &SourceRequest) -> ValidationResult<f64> {
        debug!(source = %self.kind, session_id = %request.session_id, "Calling validation source");

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ValidationError::Timeout {
                        timeout_ms: self.request_config.timeout_ms,
                    }
                } else {
                    ValidationError::Http(e)
                }
            })?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(ValidationError::Api {
                status: status.as_u16(),
                message: error_body,
            });
        }

        let body: ScoreResponse =
            response
                .json()
                .await
                .map_err(|e| ValidationError::InvalidResponse {
                    message: format!("Failed to parse response: {}", e),
                })?;

        if !(0.0..=1.0).contains(&body.score) {
            return Err(ValidationError::ScoreOutOfRange {
                source_name: self.kind.to_string(),
                score: body.score,
            });
        }

        Ok(body.score)
    }
}

#[async_trait]
impl KnowledgeSource for HttpKnowledgeSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn score(&self, request: &SourceRequest) -> ValidationResult<f64> {
        let url = format!("{}/v1/score", self.base_url);

        let mut last_error = None;
        let mut retries = 0;

        while retries <= self.request_config.max_retries {
            if retries > 0 {
                let delay = Duration::from_millis(
                    self.request_config.retry_delay_ms * (2_u64.pow(retries - 1)),
                );
                warn!(
                    source = %self.kind,
                    retry = retries,
                    delay_ms = delay.as_millis(),
                    "Retrying validation source request"
                );
                tokio::time::sleep(delay).await;
            }

            let start = Instant::now();

            match self.execute_request(&url, request).await {
                Ok(score) => {
                    info!(
                        source = %self.kind,
                        score,
                        latency_ms = start.elapsed().as_millis(),
                        "Validation source answered"
                    );
                    return Ok(score);
                }
                // A malformed score will not improve on retry.
                Err(e @ ValidationError::ScoreOutOfRange { .. }) => return Err(e),
                Err(e) => {
                    error!(
                        source = %self.kind,
                        error = %e,
                        latency_ms = start.elapsed().as_millis(),
                        retry = retries,
                        "Validation source call failed"
                    );
                    last_error = Some(e);
                    retries += 1;
                }
            }
        }

        Err(ValidationError::Unavailable {
            source_name: self.kind.to_string(),
            message: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "Unknown error".to_string()),
            retries,
        })
    }
}

/// Build the HTTP sources that have a configured URL.
pub fn build_sources(
    config: &SourceConfig,
    request_config: &RequestConfig,
) -> ValidationResult<Vec<Arc<dyn KnowledgeSource>>> {
    let configured = [
        (SourceKind::KnowledgeBase, &config.knowledge_base_url),
        (SourceKind::VectorSearch, &config.vector_search_url),
        (SourceKind::ArchitectureRules, &config.architecture_rules_url),
        (SourceKind::CostModel, &config.cost_model_url),
    ];

    let mut sources: Vec<Arc<dyn KnowledgeSource>> = Vec::new();
    for (kind, url) in configured {
        if let Some(url) = url {
            info!(source = %kind, url = %url, "Validation source configured");
            sources.push(Arc::new(HttpKnowledgeSource::new(
                kind,
                url,
                request_config.clone(),
            )?));
        }
    }
    Ok(sources)
}
