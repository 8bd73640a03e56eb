use super::{build_runtime, from_frame, to_frame, ws_error};
use crate::config::WebsocketClientConfig;
use crate::error::{RadapterError, Result};
use crate::message::{Message, Scalar};
use crate::transport::{ProtocolKind, Received, Transport};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio_native_tls::native_tls;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Websocket client binding
pub struct WebsocketClientTransport {
    config: WebsocketClientConfig,
    runtime: Option<Runtime>,
    stream: Option<WsStream>,
}

impl WebsocketClientTransport {
    pub fn new(config: WebsocketClientConfig) -> Self {
        Self {
            config,
            runtime: None,
            stream: None,
        }
    }

    fn connector(&self) -> Result<Option<tokio_tungstenite::Connector>> {
        if !self.config.url.starts_with("wss://") {
            return Ok(None);
        }
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(self.config.accept_invalid_certs)
            .build()
            .map_err(|e| RadapterError::Connect(format!("TLS setup failed: {}", e)))?;
        Ok(Some(tokio_tungstenite::Connector::NativeTls(tls)))
    }

    fn drop_stream(&mut self) {
        self.stream = None;
    }
}

impl Transport for WebsocketClientTransport {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::WebsocketClient
    }

    fn connect(&mut self) -> Result<()> {
        self.disconnect();
        let runtime = build_runtime("client")?;
        let connector = self.connector()?;
        let url = self.config.url.clone();
        let limit = Duration::from_millis(self.config.connect_timeout_ms);

        let connected = runtime.block_on(async {
            tokio::time::timeout(
                limit,
                tokio_tungstenite::connect_async_tls_with_config(url.as_str(), None, false, connector),
            )
            .await
        });
        let (stream, _response) = match connected {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                return Err(RadapterError::Connect(format!("{}: {}", self.config.url, e)));
            }
            Err(_) => {
                return Err(RadapterError::Timeout(format!(
                    "connecting to {} took longer than {:?}",
                    self.config.url, limit
                )));
            }
        };
        tracing::info!("Connected to {}", self.config.url);
        self.stream = Some(stream);
        self.runtime = Some(runtime);
        Ok(())
    }

    fn disconnect(&mut self) {
        if let (Some(runtime), Some(mut stream)) = (self.runtime.as_ref(), self.stream.take()) {
            let _ = runtime.block_on(async {
                tokio::time::timeout(Duration::from_millis(200), stream.close(None)).await
            });
            tracing::info!("Disconnected from {}", self.config.url);
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_millis(200));
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn send(&mut self, message: &Message) -> Result<()> {
        let frame = to_frame(message)?;
        let (Some(runtime), Some(stream)) = (self.runtime.as_ref(), self.stream.as_mut()) else {
            return Err(RadapterError::Disconnected(self.config.url.clone()));
        };
        let sent = runtime.block_on(stream.send(frame)).map_err(ws_error);
        if let Err(e) = &sent {
            if e.is_connection_loss() {
                self.drop_stream();
            }
        }
        sent
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<Received>> {
        let (Some(runtime), Some(stream)) = (self.runtime.as_ref(), self.stream.as_mut()) else {
            return Err(RadapterError::Disconnected(self.config.url.clone()));
        };
        let next = runtime.block_on(async { tokio::time::timeout(timeout, stream.next()).await });
        let frame = match next {
            Err(_) => return Ok(None),
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                let err = ws_error(e);
                if err.is_connection_loss() {
                    self.drop_stream();
                }
                return Err(err);
            }
            Ok(None) => {
                self.drop_stream();
                return Err(RadapterError::Disconnected(format!(
                    "{} closed the connection",
                    self.config.url
                )));
            }
        };
        if let WsMessage::Close(reason) = &frame {
            tracing::info!("{} sent close: {:?}", self.config.url, reason);
            self.drop_stream();
            return Err(RadapterError::Disconnected(self.config.url.clone()));
        }
        match from_frame(&frame) {
            Some(payload) => {
                let mut received = Received::new(payload?);
                received
                    .metadata
                    .insert("url".to_string(), Scalar::from(self.config.url.as_str()));
                Ok(Some(received))
            }
            None => Ok(None),
        }
    }
}

impl Drop for WebsocketClientTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}
