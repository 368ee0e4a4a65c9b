use async_trait::async_trait;
use murmur_core::{Error, MessageEnvelope, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::runtime::RuntimeHandle;
use crate::sink::AdapterSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    Message,
    ApiCall,
    ApiResponse,
}

/// Outer frame of the subprocess/WebSocket transport. `echo` correlates an
/// `api_call` with its `api_response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFrame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub echo: Option<String>,
}

impl WireFrame {
    pub fn message(payload: Value) -> Self {
        Self {
            frame_type: FrameType::Message,
            payload,
            echo: None,
        }
    }

    pub fn api_call(payload: Value, echo: &str) -> Self {
        Self {
            frame_type: FrameType::ApiCall,
            payload,
            echo: Some(echo.to_string()),
        }
    }

    pub fn api_response(payload: Value, echo: &str) -> Self {
        Self {
            frame_type: FrameType::ApiResponse,
            payload,
            echo: Some(echo.to_string()),
        }
    }
}

type PendingMap = Arc<StdMutex<HashMap<String, oneshot::Sender<Value>>>>;

/// Adapter isolated behind a duplex byte stream (typically a child process's
/// stdio). Envelopes and API calls travel as line-delimited JSON frames;
/// API responses are multiplexed back by echo.
pub struct SubprocessSink {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: PendingMap,
    reader_task: JoinHandle<()>,
    bad_envelopes: Arc<AtomicU64>,
}

impl SubprocessSink {
    pub fn start<R, W>(reader: R, writer: W, ingress: RuntimeHandle) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let bad_envelopes = Arc::new(AtomicU64::new(0));
        let reader_task = tokio::spawn(read_loop(
            reader,
            ingress,
            pending.clone(),
            bad_envelopes.clone(),
        ));
        Arc::new(Self {
            writer: Mutex::new(Box::new(writer)),
            pending,
            reader_task,
            bad_envelopes,
        })
    }

    async fn write_frame(&self, frame: &WireFrame) -> Result<()> {
        let mut line = serde_json::to_vec(frame)?;
        line.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&line)
            .await
            .map_err(|e| Error::TransientAdapter(format!("adapter pipe write failed: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| Error::TransientAdapter(format!("adapter pipe flush failed: {}", e)))
    }

    pub fn bad_envelope_count(&self) -> u64 {
        self.bad_envelopes.load(Ordering::Relaxed)
    }
}

async fn read_loop<R>(
    reader: R,
    ingress: RuntimeHandle,
    pending: PendingMap,
    bad_envelopes: Arc<AtomicU64>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("Adapter pipe closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Adapter pipe read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let frame: WireFrame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(e) => {
                let count = bad_envelopes.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(error = %e, bad_frames = count, "Dropping malformed adapter frame");
                continue;
            }
        };
        match frame.frame_type {
            FrameType::Message => {
                match MessageEnvelope::decode(&frame.payload.to_string()) {
                    Ok(envelope) => {
                        if let Err(e) = ingress.push_incoming(envelope).await {
                            warn!(error = %e, "Inbound envelope rejected");
                        }
                    }
                    Err(e) => {
                        let count = bad_envelopes.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(error = %e, bad_envelopes = count, "Dropping bad envelope");
                    }
                }
            }
            FrameType::ApiResponse => {
                let resolved = frame
                    .echo
                    .as_deref()
                    .and_then(|echo| pending.lock().expect("pending lock").remove(echo));
                match resolved {
                    Some(tx) => {
                        let _ = tx.send(frame.payload);
                    }
                    None => {
                        // Late or unsolicited responses are dropped by design
                        // of the echo protocol.
                        debug!(echo = ?frame.echo, "API response without matching echo");
                    }
                }
            }
            FrameType::ApiCall => {
                debug!("Ignoring api_call frame from adapter side");
            }
        }
    }
}

#[async_trait]
impl AdapterSink for SubprocessSink {
    async fn send(&self, envelope: &MessageEnvelope) -> Result<()> {
        let frame = WireFrame::message(serde_json::to_value(envelope)?);
        self.write_frame(&frame).await
    }

    async fn call_api(&self, action: &str, params: Value, timeout: Duration) -> Result<Value> {
        let echo = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock")
            .insert(echo.clone(), tx);

        let payload = serde_json::json!({ "action": action, "params": params });
        if let Err(e) = self.write_frame(&WireFrame::api_call(payload, &echo)).await {
            self.pending.lock().expect("pending lock").remove(&echo);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => {
                error!(action, "Adapter closed while an API call was pending");
                Err(Error::TransientAdapter(format!(
                    "adapter closed during api call '{}'",
                    action
                )))
            }
            Err(_) => {
                self.pending.lock().expect("pending lock").remove(&echo);
                Err(Error::AdapterTimeout(format!(
                    "api call '{}' got no response within {:?}",
                    action, timeout
                )))
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.reader_task.abort();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_core::{MessageInfo, MessageKind, OverflowPolicy, Segment, UserInfo};

    use crate::runtime::MessageRuntime;

    fn test_runtime() -> MessageRuntime {
        MessageRuntime::new(16, OverflowPolicy::Block, Duration::from_secs(10))
    }

    fn sample_envelope() -> MessageEnvelope {
        MessageEnvelope::incoming(
            "qq",
            "m1",
            MessageInfo {
                message_type: MessageKind::Private,
                user: UserInfo::new("42"),
                group: None,
                self_id: "bot".to_string(),
                to_me: true,
            },
            Segment::text("ping"),
        )
    }

    #[tokio::test]
    async fn test_api_call_round_trip_by_echo() {
        let (bot_side, adapter_side) = tokio::io::duplex(4096);
        let (bot_read, bot_write) = tokio::io::split(bot_side);
        let (adapter_read, mut adapter_write) = tokio::io::split(adapter_side);

        let rt = test_runtime();
        let sink = SubprocessSink::start(bot_read, bot_write, rt.handle());

        // Fake adapter: answer every api_call with its echo.
        tokio::spawn(async move {
            let mut lines = BufReader::new(adapter_read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let frame: WireFrame = serde_json::from_str(&line).unwrap();
                if frame.frame_type == FrameType::ApiCall {
                    let echo = frame.echo.unwrap();
                    let response =
                        WireFrame::api_response(serde_json::json!({"status": "ok"}), &echo);
                    let mut out = serde_json::to_vec(&response).unwrap();
                    out.push(b'\n');
                    adapter_write.write_all(&out).await.unwrap();
                }
            }
        });

        let result = sink
            .call_api("send_msg", serde_json::json!({"text": "hi"}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result["status"], "ok");
    }

    #[tokio::test]
    async fn test_api_call_times_out_without_echo() {
        let (bot_side, adapter_side) = tokio::io::duplex(4096);
        let (bot_read, bot_write) = tokio::io::split(bot_side);
        // Keep the adapter side alive but silent.
        let _hold = adapter_side;

        let rt = test_runtime();
        let sink = SubprocessSink::start(bot_read, bot_write, rt.handle());
        let result = sink
            .call_api("send_msg", serde_json::json!({}), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(Error::AdapterTimeout(_))));

        // The runtime keeps working: a later send still succeeds.
        sink.send(&sample_envelope()).await.unwrap();
    }

    #[tokio::test]
    async fn test_inbound_message_frame_reaches_runtime() {
        let (bot_side, adapter_side) = tokio::io::duplex(4096);
        let (bot_read, bot_write) = tokio::io::split(bot_side);
        let (_adapter_read, mut adapter_write) = tokio::io::split(adapter_side);

        let rt = test_runtime();
        let _sink = SubprocessSink::start(bot_read, bot_write, rt.handle());

        let frame = WireFrame::message(serde_json::to_value(sample_envelope()).unwrap());
        let mut line = serde_json::to_vec(&frame).unwrap();
        line.push(b'\n');
        adapter_write.write_all(&line).await.unwrap();
        // Malformed garbage must be dropped without killing the reader.
        adapter_write.write_all(b"{bogus\n").await.unwrap();

        let routed = Arc::new(StdMutex::new(Vec::<String>::new()));
        let routed_clone = routed.clone();
        rt.add_route(
            Arc::new(|_| true),
            crate::runtime::route_fn(move |env: MessageEnvelope| {
                let routed = routed_clone.clone();
                async move {
                    routed.lock().unwrap().push(env.plain_text());
                    Ok(())
                }
            }),
            "collect",
            None,
        );

        let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
        let run = rt.run(shutdown_rx);
        tokio::pin!(run);
        tokio::select! {
            _ = &mut run => {}
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
        }
        let _ = shutdown_tx.send(());
        run.await;

        assert_eq!(*routed.lock().unwrap(), vec!["ping".to_string()]);
    }
}
