use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use murmur_bus::{AdapterSink, FrameType, RuntimeHandle, WireFrame};
use murmur_core::{Error, MessageEnvelope, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

type PendingMap = Arc<StdMutex<HashMap<String, oneshot::Sender<Value>>>>;

/// Sink for one connected WebSocket adapter: outbound envelopes and API
/// calls frame onto the socket, responses multiplex back by echo.
pub struct WsSink {
    frames_tx: mpsc::Sender<WireFrame>,
    pending: PendingMap,
}

impl WsSink {
    fn new(frames_tx: mpsc::Sender<WireFrame>, pending: PendingMap) -> Self {
        Self { frames_tx, pending }
    }
}

#[async_trait]
impl AdapterSink for WsSink {
    async fn send(&self, envelope: &MessageEnvelope) -> Result<()> {
        let frame = WireFrame::message(serde_json::to_value(envelope)?);
        self.frames_tx
            .send(frame)
            .await
            .map_err(|_| Error::TransientAdapter("websocket adapter is gone".to_string()))
    }

    async fn call_api(&self, action: &str, params: Value, timeout: Duration) -> Result<Value> {
        let echo = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending lock").insert(echo.clone(), tx);

        let payload = serde_json::json!({ "action": action, "params": params });
        if self
            .frames_tx
            .send(WireFrame::api_call(payload, &echo))
            .await
            .is_err()
        {
            self.pending.lock().expect("pending lock").remove(&echo);
            return Err(Error::TransientAdapter(
                "websocket adapter is gone".to_string(),
            ));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(Error::TransientAdapter(
                "websocket closed during api call".to_string(),
            )),
            Err(_) => {
                self.pending.lock().expect("pending lock").remove(&echo);
                Err(Error::AdapterTimeout(format!(
                    "api call '{}' got no response within {:?}",
                    action, timeout
                )))
            }
        }
    }
}

/// Callbacks the server uses to attach/detach a platform's sink, normally
/// wired to `MessageRuntime::register_sink` / `unregister_sink`.
pub struct SinkRegistrar {
    pub register: Box<dyn Fn(&str, Arc<dyn AdapterSink>) + Send + Sync>,
    pub unregister: Box<dyn Fn(&str) + Send + Sync>,
}

/// WebSocket endpoint adapters connect to, declaring their platform in the
/// path (`/adapter/<platform>`).
pub struct WsAdapterServer {
    bind_addr: String,
    ingress: RuntimeHandle,
    registrar: Arc<SinkRegistrar>,
}

impl WsAdapterServer {
    pub fn new(bind_addr: &str, ingress: RuntimeHandle, registrar: SinkRegistrar) -> Self {
        Self {
            bind_addr: bind_addr.to_string(),
            ingress,
            registrar: Arc::new(registrar),
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        info!(addr = %self.bind_addr, "WebSocket adapter endpoint listening");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "Adapter connecting");
                            let ingress = self.ingress.clone();
                            let registrar = self.registrar.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, ingress, registrar).await {
                                    warn!(error = %e, "Adapter connection ended with error");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("WebSocket adapter endpoint shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    ingress: RuntimeHandle,
    registrar: Arc<SinkRegistrar>,
) -> Result<()> {
    // Pull the platform tag out of the handshake path.
    let platform: Arc<StdMutex<Option<String>>> = Arc::new(StdMutex::new(None));
    let platform_capture = platform.clone();
    let ws = tokio_tungstenite::accept_hdr_async(stream, move |req: &Request, resp: Response| {
        let path = req.uri().path();
        let tag = path.rsplit('/').next().unwrap_or_default().to_string();
        *platform_capture.lock().expect("platform lock") = Some(tag);
        Ok(resp)
    })
    .await
    .map_err(|e| Error::TransientAdapter(format!("websocket handshake failed: {}", e)))?;

    let platform = platform
        .lock()
        .expect("platform lock")
        .clone()
        .filter(|p| !p.is_empty() && p != "adapter")
        .ok_or_else(|| Error::BadEnvelope("adapter connected without a platform tag".to_string()))?;

    let (mut ws_write, mut ws_read) = ws.split();
    let (frames_tx, mut frames_rx) = mpsc::channel::<WireFrame>(64);
    let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));

    (registrar.register)(&platform, Arc::new(WsSink::new(frames_tx, pending.clone())));
    info!(platform = %platform, "Adapter connected");

    let writer = tokio::spawn(async move {
        while let Some(frame) = frames_rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if ws_write.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = ws_read.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                warn!(platform = %platform, error = %e, "WebSocket read failed");
                break;
            }
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        handle_frame(&text, &ingress, &pending).await;
    }

    (registrar.unregister)(&platform);
    writer.abort();
    info!(platform = %platform, "Adapter disconnected");
    Ok(())
}

/// Dispatch one inbound frame: messages enter the runtime, API responses
/// resolve by echo, responses without a matching echo drop.
pub async fn handle_frame(text: &str, ingress: &RuntimeHandle, pending: &PendingMap) {
    let frame: WireFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "Dropping malformed adapter frame");
            return;
        }
    };
    match frame.frame_type {
        FrameType::Message => match MessageEnvelope::decode(&frame.payload.to_string()) {
            Ok(envelope) => {
                if let Err(e) = ingress.push_incoming(envelope).await {
                    warn!(error = %e, "Inbound envelope rejected");
                }
            }
            Err(e) => {
                warn!(error = %e, "Dropping bad envelope");
            }
        },
        FrameType::ApiResponse => {
            let resolved = frame
                .echo
                .as_deref()
                .and_then(|echo| pending.lock().expect("pending lock").remove(echo));
            match resolved {
                Some(tx) => {
                    let _ = tx.send(frame.payload);
                }
                None => debug!(echo = ?frame.echo, "API response without matching echo dropped"),
            }
        }
        FrameType::ApiCall => {
            debug!("Ignoring api_call frame from adapter side");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_bus::MessageRuntime;
    use murmur_core::{MessageInfo, MessageKind, OverflowPolicy, Segment, UserInfo};

    fn runtime() -> MessageRuntime {
        MessageRuntime::new(8, OverflowPolicy::Block, Duration::from_secs(10))
    }

    fn envelope_frame() -> String {
        let envelope = MessageEnvelope::incoming(
            "qq",
            "m1",
            MessageInfo {
                message_type: MessageKind::Private,
                user: UserInfo::new("1"),
                group: None,
                self_id: "bot".to_string(),
                to_me: true,
            },
            Segment::text("hi"),
        );
        serde_json::to_string(&WireFrame::message(serde_json::to_value(envelope).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_handle_frame_routes_messages_and_echoes() {
        let rt = runtime();
        let ingress = rt.handle();
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));

        handle_frame(&envelope_frame(), &ingress, &pending).await;

        // A pending echo resolves; an unknown echo is dropped quietly.
        let (tx, rx) = oneshot::channel();
        pending.lock().unwrap().insert("e1".to_string(), tx);
        let response = serde_json::to_string(&WireFrame::api_response(
            serde_json::json!({"ok": true}),
            "e1",
        ))
        .unwrap();
        handle_frame(&response, &ingress, &pending).await;
        assert_eq!(rx.await.unwrap()["ok"], serde_json::json!(true));

        let stray = serde_json::to_string(&WireFrame::api_response(
            serde_json::json!({}),
            "unknown",
        ))
        .unwrap();
        handle_frame(&stray, &ingress, &pending).await;
        assert!(pending.lock().unwrap().is_empty());

        // Garbage frames are dropped without panicking.
        handle_frame("{nope", &ingress, &pending).await;
    }

    #[tokio::test]
    async fn test_ws_sink_times_out_without_response() {
        let (frames_tx, mut frames_rx) = mpsc::channel(4);
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let sink = WsSink::new(frames_tx, pending.clone());

        let result = sink
            .call_api("send_msg", serde_json::json!({}), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(Error::AdapterTimeout(_))));
        assert!(pending.lock().unwrap().is_empty());

        // The api_call frame did go out.
        let frame = frames_rx.recv().await.unwrap();
        assert_eq!(frame.frame_type, FrameType::ApiCall);
        assert!(frame.echo.is_some());
    }
}
