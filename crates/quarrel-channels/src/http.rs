use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use quarrel_core::config::ChannelConfig;
use quarrel_core::error::{QuarrelError, Result};
use quarrel_core::routing::Route;
use quarrel_core::traits::{AgentChannel, AgentConnector};
use quarrel_core::types::AgentSlot;

#[derive(Serialize)]
struct PromptRequest<'a> {
    prompt: &'a str,
}

#[derive(Deserialize)]
struct ReplyBody {
    text: String,
}

/// Agent reachable over plain HTTP.
///
/// Route operations are paths relative to the endpoint address: prompts are
/// POSTed as `{"prompt": ...}` to the input path, and the reply path is read
/// with GET. A JSON reply body with a `text` field yields that field;
/// anything else is taken verbatim.
pub struct HttpAgentChannel {
    http: Client,
    name: String,
    address: String,
    prepare_timeout: Duration,
}

impl HttpAgentChannel {
    pub fn new(http: Client, slot: &AgentSlot, prepare_timeout: Duration) -> Self {
        Self {
            http,
            name: slot.name.clone(),
            address: slot.endpoint_address.clone(),
            prepare_timeout,
        }
    }

    fn base(&self) -> Result<&str> {
        if self.address.is_empty() {
            Err(QuarrelError::channel(&self.name, "no endpoint address"))
        } else {
            Ok(&self.address)
        }
    }

    fn err(&self, e: impl ToString) -> QuarrelError {
        QuarrelError::channel(&self.name, e)
    }

    async fn get_text(&self, url: &str, timeout: Option<Duration>) -> Result<String> {
        let mut req = self.http.get(url);
        if let Some(timeout) = timeout {
            req = req.timeout(timeout);
        }
        let response = req.send().await.map_err(|e| self.err(e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| self.err(e))?;
        if !status.is_success() {
            return Err(self.err(format!("HTTP {} from {}", status, url)));
        }
        Ok(body)
    }
}

impl AgentChannel for HttpAgentChannel {
    fn prepare(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let base = self.base()?;
            self.get_text(base, Some(self.prepare_timeout)).await?;
            debug!(agent = %self.name, address = %base, "Agent endpoint reachable");
            Ok(())
        })
    }

    fn submit(&self, route: Route, prompt: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let url = join_url(self.base()?, &route.input);
            let response = self
                .http
                .post(&url)
                .json(&PromptRequest { prompt: &prompt })
                .send()
                .await
                .map_err(|e| self.err(e))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(self.err(format!("HTTP {}: {}", status, body)));
            }
            Ok(())
        })
    }

    fn sample(&self, route: Route) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let url = join_url(self.base()?, &route.reply);
            let body = self.get_text(&url, None).await?;
            Ok(reply_text(body))
        })
    }

    fn snapshot(&self) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let base = self.base()?;
            self.get_text(base, None).await
        })
    }
}

/// Builds [`HttpAgentChannel`]s sharing one connection pool.
pub struct HttpConnector {
    http: Client,
    prepare_timeout: Duration,
}

impl HttpConnector {
    pub fn new(config: &ChannelConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| QuarrelError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            http,
            prepare_timeout: Duration::from_secs(config.prepare_timeout_secs),
        })
    }
}

impl AgentConnector for HttpConnector {
    fn connect(&self, slot: &AgentSlot) -> Result<Arc<dyn AgentChannel>> {
        Ok(Arc::new(HttpAgentChannel::new(
            self.http.clone(),
            slot,
            self.prepare_timeout,
        )))
    }
}

/// Resolve a route operation against an endpoint address. Absolute URLs
/// are used as-is; an empty operation targets the address itself.
pub fn join_url(base: &str, operation: &str) -> String {
    let operation = operation.trim();
    if operation.starts_with("http://") || operation.starts_with("https://") {
        return operation.to_string();
    }
    let operation = operation.trim_start_matches('/');
    if operation.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), operation)
}

fn reply_text(body: String) -> String {
    match serde_json::from_str::<ReplyBody>(&body) {
        Ok(reply) => reply.text,
        Err(_) => body,
    }
}
