use super::{build_runtime, from_frame, to_frame};
use crate::config::WebsocketServerConfig;
use crate::error::{RadapterError, Result, ResultExt};
use crate::message::{Message, Scalar};
use crate::transport::{ProtocolKind, Received, Transport};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_native_tls::{native_tls, TlsAcceptor};
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Outbound frames buffered per client before it starts lagging
const CLIENT_BUFFER: usize = 256;
/// Inbound payloads buffered between client tasks and the binding worker
const INBOUND_BUFFER: usize = 1024;

/// State that exists only while the server is listening
struct Listening {
    runtime: Runtime,
    outbound: broadcast::Sender<WsMessage>,
    inbound: mpsc::Receiver<Received>,
    shutdown: watch::Sender<bool>,
    local_addr: SocketAddr,
}

/// Websocket server binding; outbound messages go to every connected client
pub struct WebsocketServerTransport {
    config: WebsocketServerConfig,
    listening: Option<Listening>,
    clients: Arc<AtomicUsize>,
}

impl WebsocketServerTransport {
    pub fn new(config: WebsocketServerConfig) -> Self {
        Self {
            config,
            listening: None,
            clients: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Bound address while listening (useful with port 0)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listening.as_ref().map(|l| l.local_addr)
    }

    /// Number of connected clients
    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    fn tls_acceptor(&self) -> Result<Option<TlsAcceptor>> {
        let (Some(cert_file), Some(key_file)) = (&self.config.cert_file, &self.config.key_file) else {
            return Ok(None);
        };
        let cert = std::fs::read(cert_file)
            .map_err(RadapterError::from)
            .with_context(|| format!("Failed to read certificate {}", cert_file.display()))?;
        let key = std::fs::read(key_file)
            .map_err(RadapterError::from)
            .with_context(|| format!("Failed to read key {}", key_file.display()))?;
        let identity = native_tls::Identity::from_pkcs8(&cert, &key)
            .map_err(|e| RadapterError::Config(format!("invalid TLS identity: {}", e)))?;
        let acceptor = native_tls::TlsAcceptor::new(identity)
            .map_err(|e| RadapterError::Connect(format!("TLS setup failed: {}", e)))?;
        Ok(Some(TlsAcceptor::from(acceptor)))
    }
}

async fn accept_loop(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    outbound: broadcast::Sender<WsMessage>,
    inbound: mpsc::Sender<Received>,
    mut shutdown: watch::Receiver<bool>,
    clients: Arc<AtomicUsize>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (tcp, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        continue;
                    }
                };
                // Subscribe before the handshake so nothing sent after it is missed
                let client = Client {
                    peer,
                    outbound: outbound.subscribe(),
                    inbound: inbound.clone(),
                    shutdown: shutdown.clone(),
                    clients: clients.clone(),
                };
                let tls = tls.clone();
                tokio::spawn(async move {
                    match tls {
                        Some(acceptor) => match acceptor.accept(tcp).await {
                            Ok(stream) => client.serve(stream).await,
                            Err(e) => tracing::warn!("TLS handshake with {} failed: {}", peer, e),
                        },
                        None => client.serve(tcp).await,
                    }
                });
            }
        }
    }
}

struct Client {
    peer: SocketAddr,
    outbound: broadcast::Receiver<WsMessage>,
    inbound: mpsc::Sender<Received>,
    shutdown: watch::Receiver<bool>,
    clients: Arc<AtomicUsize>,
}

impl Client {
    async fn serve<S>(mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                tracing::warn!("Websocket upgrade from {} failed: {}", self.peer, e);
                return;
            }
        };
        self.clients.fetch_add(1, Ordering::SeqCst);
        tracing::info!("Client {} connected", self.peer);
        let (mut sink, mut source) = ws.split();

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
                out = self.outbound.recv() => match out {
                    Ok(frame) => {
                        if let Err(e) = sink.send(frame).await {
                            tracing::debug!("Send to {} failed: {}", self.peer, e);
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Client {} lagging, skipped {} message(s)", self.peer, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                frame = source.next() => match frame {
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(frame)) => {
                        let Some(decoded) = from_frame(&frame) else { continue };
                        match decoded {
                            Ok(payload) => {
                                let mut received = Received::new(payload);
                                received
                                    .metadata
                                    .insert("peer".to_string(), Scalar::from(self.peer.to_string()));
                                if self.inbound.send(received).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => tracing::warn!("Dropped frame from {}: {}", self.peer, e),
                        }
                    }
                    Some(Err(e)) => {
                        tracing::debug!("Client {} error: {}", self.peer, e);
                        break;
                    }
                },
            }
        }
        self.clients.fetch_sub(1, Ordering::SeqCst);
        tracing::info!("Client {} disconnected", self.peer);
    }
}

impl Transport for WebsocketServerTransport {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::WebsocketServer
    }

    fn connect(&mut self) -> Result<()> {
        self.disconnect();
        let tls = self.tls_acceptor()?;
        let runtime = build_runtime("server")?;
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = runtime
            .block_on(TcpListener::bind(addr.as_str()))
            .map_err(|e| RadapterError::Connect(format!("bind {}: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;

        let (outbound, _) = broadcast::channel(CLIENT_BUFFER);
        let (inbound_tx, inbound) = mpsc::channel(INBOUND_BUFFER);
        let (shutdown, shutdown_rx) = watch::channel(false);
        runtime.spawn(accept_loop(
            listener,
            tls.clone(),
            outbound.clone(),
            inbound_tx,
            shutdown_rx,
            self.clients.clone(),
        ));
        tracing::info!(
            "Listening on {}{}",
            local_addr,
            if tls.is_some() { " (TLS)" } else { "" }
        );
        self.listening = Some(Listening {
            runtime,
            outbound,
            inbound,
            shutdown,
            local_addr,
        });
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(listening) = self.listening.take() {
            let _ = listening.shutdown.send(true);
            listening.runtime.shutdown_timeout(Duration::from_millis(500));
            self.clients.store(0, Ordering::SeqCst);
            tracing::info!("Stopped listening on {}", listening.local_addr);
        }
    }

    fn is_connected(&self) -> bool {
        self.listening.is_some()
    }

    fn send(&mut self, message: &Message) -> Result<()> {
        let listening = self
            .listening
            .as_ref()
            .ok_or_else(|| RadapterError::Disconnected("server not listening".to_string()))?;
        let frame = to_frame(message)?;
        if listening.outbound.send(frame).is_err() {
            tracing::debug!("No clients connected to {}, message discarded", listening.local_addr);
        }
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<Received>> {
        let listening = self
            .listening
            .as_mut()
            .ok_or_else(|| RadapterError::Disconnected("server not listening".to_string()))?;
        let inbound = &mut listening.inbound;
        let next = listening
            .runtime
            .block_on(async { tokio::time::timeout(timeout, inbound.recv()).await });
        match next {
            Err(_) => Ok(None),
            Ok(Some(received)) => Ok(Some(received)),
            Ok(None) => Err(RadapterError::Disconnected("accept loop stopped".to_string())),
        }
    }
}

impl Drop for WebsocketServerTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}
