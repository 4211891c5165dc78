//! Intent service HTTP client

use async_trait::async_trait;

use super::{INTENT_SERVICE, IntentRequest, IntentResult};
use crate::circuit_breaker::Dependency;
use crate::error::{ColloquyError, Result};

/// Client for `POST {base_url}/classify`
#[derive(Debug, Clone)]
pub struct HttpIntentService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpIntentService {
    /// Create a client for the service at `base_url`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Create a client sharing an existing connection pool
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Service base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Dependency<IntentRequest, IntentResult> for HttpIntentService {
    async fn call(&self, request: &IntentRequest) -> Result<IntentResult> {
        let url = format!("{}/classify", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| ColloquyError::dependency(INTENT_SERVICE, format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ColloquyError::dependency(
                INTENT_SERVICE,
                format!("HTTP {}: {}", status, text),
            ));
        }

        response.json::<IntentResult>().await.map_err(|e| {
            ColloquyError::dependency(INTENT_SERVICE, format!("invalid response body: {}", e))
        })
    }
}
