use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use murmur_bus::RuntimeHandle;
use murmur_core::{EnvelopeBatch, Error, ENVELOPE_SCHEMA_VERSION};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemResult {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse {
    pub schema_version: u32,
    pub results: Vec<BatchItemResult>,
}

/// Ingest a batch of envelopes, one result per item. Bad envelopes drop
/// individually; the batch itself always answers.
pub async fn ingest_batch(ingress: &RuntimeHandle, batch: EnvelopeBatch) -> BatchResponse {
    let mut results = Vec::with_capacity(batch.items.len());
    if batch.schema_version > ENVELOPE_SCHEMA_VERSION {
        warn!(
            version = batch.schema_version,
            "Rejecting batch with unsupported schema version"
        );
        let error = format!("unsupported schema version {}", batch.schema_version);
        return BatchResponse {
            schema_version: ENVELOPE_SCHEMA_VERSION,
            results: batch
                .items
                .iter()
                .map(|_| BatchItemResult {
                    ok: false,
                    error: Some(error.clone()),
                })
                .collect(),
        };
    }
    for envelope in batch.items {
        match ingress.push_incoming(envelope).await {
            Ok(()) => results.push(BatchItemResult { ok: true, error: None }),
            Err(e @ Error::BufferFull(_)) => {
                results.push(BatchItemResult {
                    ok: false,
                    error: Some(e.to_string()),
                });
            }
            Err(e) => {
                warn!(error = %e, "Batch item rejected");
                results.push(BatchItemResult {
                    ok: false,
                    error: Some(e.to_string()),
                });
            }
        }
    }
    BatchResponse {
        schema_version: ENVELOPE_SCHEMA_VERSION,
        results,
    }
}

async fn messages_handler(
    State(ingress): State<RuntimeHandle>,
    Json(batch): Json<EnvelopeBatch>,
) -> (StatusCode, Json<BatchResponse>) {
    let response = ingest_batch(&ingress, batch).await;
    (StatusCode::OK, Json(response))
}

pub fn router(ingress: RuntimeHandle) -> Router {
    Router::new()
        .route("/adapter/messages", post(messages_handler))
        .with_state(ingress)
}

/// Serve the HTTP adapter transport until shutdown.
pub async fn serve(
    bind_addr: &str,
    ingress: RuntimeHandle,
    mut shutdown: broadcast::Receiver<()>,
) -> murmur_core::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = bind_addr, "HTTP adapter endpoint listening");
    axum::serve(listener, router(ingress))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_bus::MessageRuntime;
    use murmur_core::{
        MessageEnvelope, MessageInfo, MessageKind, OverflowPolicy, Segment, UserInfo,
    };
    use std::time::Duration;

    fn envelope(text: &str) -> MessageEnvelope {
        MessageEnvelope::incoming(
            "qq",
            "m1",
            MessageInfo {
                message_type: MessageKind::Private,
                user: UserInfo::new("1"),
                group: None,
                self_id: "bot".to_string(),
                to_me: true,
            },
            Segment::text(text),
        )
    }

    #[tokio::test]
    async fn test_ingest_batch_per_item_results() {
        let runtime = MessageRuntime::new(1, OverflowPolicy::Drop, Duration::from_secs(10));
        let handle = runtime.handle();

        let batch = EnvelopeBatch::new(vec![envelope("first"), envelope("second")]);
        let response = ingest_batch(&handle, batch).await;
        assert_eq!(response.results.len(), 2);
        assert!(response.results[0].ok);
        // Queue capacity 1: the second item reports BufferFull.
        assert!(!response.results[1].ok);
        assert!(response.results[1].error.as_deref().unwrap().contains("full"));
    }

    #[tokio::test]
    async fn test_ingest_batch_rejects_newer_schema() {
        let runtime = MessageRuntime::new(8, OverflowPolicy::Drop, Duration::from_secs(10));
        let handle = runtime.handle();
        let mut batch = EnvelopeBatch::new(vec![envelope("x")]);
        batch.schema_version = ENVELOPE_SCHEMA_VERSION + 1;
        let response = ingest_batch(&handle, batch).await;
        assert!(!response.results[0].ok);
    }
}
