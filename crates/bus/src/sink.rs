use async_trait::async_trait;
use murmur_core::{EnvelopeBatch, Error, MessageEnvelope, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::backoff::retry_transient;

/// One registered adapter endpoint for a platform. `send` delivers an
/// outbound envelope; `call_api` issues a platform API call and waits for
/// the correlated response.
#[async_trait]
pub trait AdapterSink: Send + Sync {
    async fn send(&self, envelope: &MessageEnvelope) -> Result<()>;

    async fn call_api(&self, action: &str, params: Value, timeout: Duration) -> Result<Value>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Synchronous API responder used by in-process adapters.
pub type ApiResponder = Arc<dyn Fn(&str, &Value) -> Result<Value> + Send + Sync>;

/// Adapter living in this process: outbound envelopes land on a channel the
/// adapter drains, API calls go straight to a responder closure.
pub struct InProcessSink {
    outbound_tx: mpsc::Sender<MessageEnvelope>,
    api_responder: Option<ApiResponder>,
}

impl InProcessSink {
    pub fn new(outbound_tx: mpsc::Sender<MessageEnvelope>) -> Self {
        Self {
            outbound_tx,
            api_responder: None,
        }
    }

    pub fn with_api_responder(mut self, responder: ApiResponder) -> Self {
        self.api_responder = Some(responder);
        self
    }
}

#[async_trait]
impl AdapterSink for InProcessSink {
    async fn send(&self, envelope: &MessageEnvelope) -> Result<()> {
        self.outbound_tx
            .send(envelope.clone())
            .await
            .map_err(|_| Error::TransientAdapter("in-process adapter is gone".to_string()))
    }

    async fn call_api(&self, action: &str, params: Value, _timeout: Duration) -> Result<Value> {
        match &self.api_responder {
            Some(responder) => responder(action, &params),
            None => Err(Error::Other(format!(
                "in-process adapter has no API responder for '{}'",
                action
            ))),
        }
    }
}

/// Adapter reached over HTTP: outbound envelopes are POSTed as a batch to
/// the adapter's ingest endpoint. Transient network failures retry with
/// backoff; API calls are not part of the HTTP transport.
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
    max_retries: u32,
}

impl HttpSink {
    pub fn new(endpoint: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.to_string(),
            max_retries: 3,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

#[async_trait]
impl AdapterSink for HttpSink {
    async fn send(&self, envelope: &MessageEnvelope) -> Result<()> {
        let batch = EnvelopeBatch::new(vec![envelope.clone()]);
        retry_transient(self.max_retries, 500, || {
            let client = self.client.clone();
            let endpoint = self.endpoint.clone();
            let batch = batch.clone();
            async move {
                let response = client
                    .post(&endpoint)
                    .json(&batch)
                    .send()
                    .await
                    .map_err(|e| Error::TransientAdapter(e.to_string()))?;
                if response.status().is_server_error() {
                    return Err(Error::TransientAdapter(format!(
                        "adapter returned {}",
                        response.status()
                    )));
                }
                if !response.status().is_success() {
                    return Err(Error::Other(format!(
                        "adapter rejected batch: {}",
                        response.status()
                    )));
                }
                debug!(endpoint = %endpoint, "Outbound batch delivered");
                Ok(())
            }
        })
        .await
    }

    async fn call_api(&self, action: &str, _params: Value, _timeout: Duration) -> Result<Value> {
        Err(Error::Other(format!(
            "api call '{}' not supported over the HTTP transport",
            action
        )))
    }
}
