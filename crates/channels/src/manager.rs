use murmur_bus::MessageRuntime;
use murmur_core::Result;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::ws::{SinkRegistrar, WsAdapterServer};

/// Wires adapter endpoints to the message runtime: the WebSocket endpoint
/// registers a sink per connected platform, the HTTP endpoint is ingest-only.
pub struct ChannelManager {
    runtime: Arc<MessageRuntime>,
    ws_bind: Option<String>,
    http_bind: Option<String>,
}

impl ChannelManager {
    pub fn new(runtime: Arc<MessageRuntime>) -> Self {
        Self {
            runtime,
            ws_bind: None,
            http_bind: None,
        }
    }

    pub fn with_websocket(mut self, bind_addr: &str) -> Self {
        self.ws_bind = Some(bind_addr.to_string());
        self
    }

    pub fn with_http(mut self, bind_addr: &str) -> Self {
        self.http_bind = Some(bind_addr.to_string());
        self
    }

    /// Spawn the configured endpoints. Each runs until the shutdown signal.
    pub fn start(&self, shutdown: &broadcast::Sender<()>) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();

        if let Some(ws_bind) = &self.ws_bind {
            let register_rt = self.runtime.clone();
            let unregister_rt = self.runtime.clone();
            let registrar = SinkRegistrar {
                register: Box::new(move |platform, sink| {
                    register_rt.register_sink(platform, sink);
                }),
                unregister: Box::new(move |platform| {
                    unregister_rt.unregister_sink(platform);
                }),
            };
            let server = WsAdapterServer::new(ws_bind, self.runtime.handle(), registrar);
            let rx = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                if let Err(e) = server.run(rx).await {
                    error!(error = %e, "WebSocket adapter endpoint failed");
                }
            }));
        }

        if let Some(http_bind) = &self.http_bind {
            let bind = http_bind.clone();
            let ingress = self.runtime.handle();
            let rx = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                if let Err(e) = crate::http::serve(&bind, ingress, rx).await {
                    error!(error = %e, "HTTP adapter endpoint failed");
                }
            }));
        }

        info!(
            ws = self.ws_bind.as_deref().unwrap_or("-"),
            http = self.http_bind.as_deref().unwrap_or("-"),
            "Channel manager started"
        );
        Ok(handles)
    }
}
