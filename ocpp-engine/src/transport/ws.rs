//! WebSocket transport
//!
//! - `WsClient`: connects upstream (to a CSMS or parent networking node) with
//!   the OCPP sub-protocol header, reconnecting with exponential backoff
//! - `WsListener`: accepts downstream charge points and networking nodes,
//!   identified by the last segment of the URL path
//!
//! Both register a [`WsConnection`] with the node for as long as the socket
//! lives and feed every received frame to [`NetworkingNode::on_frame`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async_with_config, connect_async_with_config, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::{Connection, Delivery, Frame, TransportError};
use crate::node::NetworkingNode;
use crate::routing::NodeId;

/// OCPP sub-protocols offered by default, most preferred first
pub const DEFAULT_SUBPROTOCOLS: &[&str] = &["ocpp2.1", "ocpp2.0.1", "ocpp1.6"];

/// Outgoing frame buffer per connection
const SEND_BUFFER: usize = 64;

/// Configuration for the upstream WebSocket client
#[derive(Debug, Clone)]
pub struct WsClientConfig {
    /// Upstream URL, without the local node identity
    pub url: String,
    /// Identity of the node at the other end
    pub peer_id: NodeId,
    /// Sub-protocols to offer, most preferred first
    pub subprotocols: Vec<String>,
    /// Reconnect delay (initial)
    pub reconnect_delay: Duration,
    /// Maximum reconnect delay
    pub max_reconnect_delay: Duration,
    /// Largest accepted WebSocket message
    pub max_message_size: usize,
}

impl Default for WsClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8180/ocpp".to_string(),
            peer_id: "CSMS".to_string(),
            subprotocols: DEFAULT_SUBPROTOCOLS.iter().map(|s| s.to_string()).collect(),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(300),
            max_message_size: 1024 * 1024,
        }
    }
}

impl WsClientConfig {
    pub fn new(url: impl Into<String>, peer_id: impl Into<NodeId>) -> Self {
        Self {
            url: url.into(),
            peer_id: peer_id.into(),
            ..Default::default()
        }
    }

    pub fn with_subprotocols(mut self, subprotocols: Vec<String>) -> Self {
        if !subprotocols.is_empty() {
            self.subprotocols = subprotocols;
        }
        self
    }
}

/// Configuration for the downstream WebSocket listener
#[derive(Debug, Clone)]
pub struct WsListenerConfig {
    pub bind_addr: SocketAddr,
    /// Sub-protocols accepted, most preferred first
    pub subprotocols: Vec<String>,
    pub max_message_size: usize,
}

impl WsListenerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            subprotocols: DEFAULT_SUBPROTOCOLS.iter().map(|s| s.to_string()).collect(),
            max_message_size: 1024 * 1024,
        }
    }

    pub fn with_subprotocols(mut self, subprotocols: Vec<String>) -> Self {
        if !subprotocols.is_empty() {
            self.subprotocols = subprotocols;
        }
        self
    }
}

/// Connection handle backed by the writer task of one WebSocket
pub struct WsConnection {
    peer_id: NodeId,
    tx: mpsc::Sender<Message>,
}

#[async_trait]
impl Connection for WsConnection {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    async fn send(&self, frame: Frame) -> Result<Delivery, TransportError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(bytes) => Message::Binary(bytes.into()),
        };

        match self.tx.try_send(message) {
            Ok(()) => Ok(Delivery::Sent),
            Err(mpsc::error::TrySendError::Full(message)) => {
                self.tx
                    .send(message)
                    .await
                    .map_err(|_| TransportError::Closed(self.peer_id.clone()))?;
                Ok(Delivery::Queued)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(TransportError::Closed(self.peer_id.clone()))
            }
        }
    }
}

/// Upstream WebSocket client
pub struct WsClient {
    config: WsClientConfig,
    node: NetworkingNode,
}

impl WsClient {
    pub fn new(config: WsClientConfig, node: NetworkingNode) -> Self {
        Self { config, node }
    }

    /// Run the client connection loop
    pub async fn run(self) -> Result<(), TransportError> {
        let mut reconnect_delay = self.config.reconnect_delay;

        loop {
            info!("Connecting to {} ({})", self.config.url, self.config.peer_id);

            match self.connect_and_run().await {
                Ok(()) => {
                    info!("Connection to {} closed", self.config.peer_id);
                    reconnect_delay = self.config.reconnect_delay;
                }
                Err(e) => {
                    error!("Connection error: {}", e);
                }
            }

            // Exponential backoff
            info!("Reconnecting in {:?}", reconnect_delay);
            tokio::time::sleep(reconnect_delay).await;
            reconnect_delay = std::cmp::min(reconnect_delay * 2, self.config.max_reconnect_delay);
        }
    }

    /// Connect and run until disconnection
    async fn connect_and_run(&self) -> Result<(), TransportError> {
        // The upstream identifies us by the last path segment
        let url = build_ocpp_url(&self.config.url, self.node.id());
        let mut request = url.as_str().into_client_request()?;
        let offered = HeaderValue::from_str(&self.config.subprotocols.join(", "))
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        request.headers_mut().insert(header::SEC_WEBSOCKET_PROTOCOL, offered);

        let ws_config = WebSocketConfig {
            max_message_size: Some(self.config.max_message_size),
            ..Default::default()
        };

        let (ws_stream, response) = connect_async_with_config(request, Some(ws_config), false).await?;

        // Verify subprotocol
        let accepted = response
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        match accepted {
            Some(protocol) if self.config.subprotocols.iter().any(|p| p == protocol) => {
                info!("WebSocket connected to {} using {}", url, protocol);
            }
            other => {
                warn!("Upstream accepted none of the offered sub-protocols, got: {:?}", other);
            }
        }

        serve(self.node.clone(), self.config.peer_id.clone(), ws_stream).await;
        Ok(())
    }
}

/// Downstream WebSocket listener
pub struct WsListener {
    config: WsListenerConfig,
    node: NetworkingNode,
}

impl WsListener {
    pub fn new(config: WsListenerConfig, node: NetworkingNode) -> Self {
        Self { config, node }
    }

    /// Accept connections until the listener fails
    pub async fn run(self) -> Result<(), TransportError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("Listening for charge points on {}", listener.local_addr()?);

        let config = Arc::new(self.config);
        loop {
            let (stream, addr) = listener.accept().await?;
            let node = self.node.clone();
            let config = config.clone();
            tokio::spawn(async move {
                if let Err(e) = accept(node, stream, &config).await {
                    warn!("Rejected connection from {}: {}", addr, e);
                }
            });
        }
    }
}

async fn accept(
    node: NetworkingNode,
    stream: TcpStream,
    config: &WsListenerConfig,
) -> Result<(), TransportError> {
    let mut peer_id: Option<NodeId> = None;

    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        let identity = request
            .uri()
            .path()
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty())
            .map(str::to_string);

        let Some(identity) = identity else {
            let mut rejection = ErrorResponse::new(Some("missing node identity in URL path".into()));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            return Err(rejection);
        };

        let offered = request
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        match select_subprotocol(offered, &config.subprotocols) {
            Some(protocol) => {
                if let Ok(value) = HeaderValue::from_str(&protocol) {
                    response.headers_mut().insert(header::SEC_WEBSOCKET_PROTOCOL, value);
                }
            }
            None => warn!("{} offered no supported sub-protocol ({:?})", identity, offered),
        }

        peer_id = Some(identity);
        Ok(response)
    };

    let ws_config = WebSocketConfig {
        max_message_size: Some(config.max_message_size),
        ..Default::default()
    };
    let ws_stream = accept_hdr_async_with_config(stream, callback, Some(ws_config)).await?;
    let peer_id = peer_id.ok_or_else(|| TransportError::Handshake("no node identity".into()))?;

    info!("{} connected", peer_id);
    serve(node, peer_id, ws_stream).await;
    Ok(())
}

/// First of our sub-protocols that the peer offered
pub fn select_subprotocol(offered: &str, supported: &[String]) -> Option<String> {
    let offered: Vec<&str> = offered.split(',').map(str::trim).collect();
    supported
        .iter()
        .find(|protocol| offered.contains(&protocol.as_str()))
        .cloned()
}

/// Build the full OCPP WebSocket URL
pub fn build_ocpp_url(base_url: &str, node_id: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), node_id)
}

/// Register the socket with the node and pump frames until it closes
async fn serve<S>(node: NetworkingNode, peer_id: NodeId, ws_stream: WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (ws_tx, ws_rx) = ws_stream.split();
    let (send_tx, send_rx) = mpsc::channel::<Message>(SEND_BUFFER);

    let connection = node.attach(Arc::new(WsConnection {
        peer_id: peer_id.clone(),
        tx: send_tx,
    }));

    let writer = tokio::spawn(write_loop(ws_tx, send_rx));
    read_loop(&node, &peer_id, ws_rx).await;

    writer.abort();
    node.on_closed(&peer_id, connection);
}

async fn write_loop<S>(mut ws_tx: SplitSink<WebSocketStream<S>, Message>, mut send_rx: mpsc::Receiver<Message>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = send_rx.recv().await {
        if let Err(e) = ws_tx.send(message).await {
            error!("Failed to send WebSocket message: {}", e);
            break;
        }
    }
}

async fn read_loop<S>(node: &NetworkingNode, peer_id: &str, mut ws_rx: SplitStream<WebSocketStream<S>>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = ws_rx.next().await {
        let bytes = match message {
            Ok(Message::Text(text)) => text.as_bytes().to_vec(),
            Ok(Message::Binary(data)) => data.to_vec(),
            Ok(Message::Close(_)) => {
                info!("WebSocket closed by {}", peer_id);
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                error!("WebSocket error from {}: {}", peer_id, e);
                break;
            }
        };

        debug!("Received {} bytes from {}", bytes.len(), peer_id);
        let node = node.clone();
        let peer = peer_id.to_string();
        tokio::spawn(async move {
            node.on_frame(&peer, &bytes).await;
        });
    }
}
