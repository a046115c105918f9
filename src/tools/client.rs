use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use serde_json::{Map, Value};
use tracing::debug;

/// Opaque call to an external tool-execution endpoint.
#[async_trait]
pub trait ToolClient: Send + Sync {
    async fn call(&self, tool: &str, payload: &Map<String, Value>) -> Result<Value>;
}

/// JSON-over-HTTP tool client: `POST {tool, arguments, user_id}` to the endpoint.
#[derive(Clone)]
pub struct HttpToolClient {
    endpoint: String,
    api_key: Option<String>,
    user_id: Option<String>,
    http: Client,
}

impl HttpToolClient {
    pub fn new(
        endpoint: &str,
        api_key: Option<String>,
        user_id: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build tool HTTP client")?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
            user_id,
            http,
        })
    }
}

#[async_trait]
impl ToolClient for HttpToolClient {
    async fn call(&self, tool: &str, payload: &Map<String, Value>) -> Result<Value> {
        let mut body = Map::new();
        body.insert("tool".to_string(), Value::String(tool.to_string()));
        body.insert("arguments".to_string(), Value::Object(payload.clone()));
        if let Some(user_id) = &self.user_id {
            body.insert("user_id".to_string(), Value::String(user_id.clone()));
        }

        debug!("Invoking tool {} at {}", tool, self.endpoint);
        let mut request = self.http.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header(AUTHORIZATION, format!("Bearer {}", key));
        }

        let resp = request
            .send()
            .await
            .context("failed to reach tool execution endpoint")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "tool execution failed: status {} body {}",
                status,
                body
            ));
        }

        resp.json::<Value>()
            .await
            .context("failed to decode tool execution response")
    }
}
