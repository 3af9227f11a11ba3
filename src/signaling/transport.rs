use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::messages::ClientFrame;
use super::types::{OutboundMessage, SignalingError};

pub const RELAY_SUBPROTOCOL: &str = "janus-protocol";

/// Opens the raw frame channel to the relay.
pub trait RelayConnector {
    fn connect(&self, url: &str) -> impl Future<Output = Result<RelayChannel, SignalingError>> + Send;
}

/// Bidirectional text-frame channel to the relay
#[derive(Debug)]
pub struct RelayChannel {
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    inbound: mpsc::UnboundedReceiver<String>,
    pump: Option<JoinHandle<()>>,
}

/// Far end of an in-memory [`RelayChannel`]
#[derive(Debug)]
pub struct RelayRemote {
    pub frames: mpsc::UnboundedReceiver<OutboundMessage>,
    pub replies: mpsc::UnboundedSender<String>,
}

impl RelayChannel {
    pub fn new(
        outbound: mpsc::UnboundedSender<OutboundMessage>,
        inbound: mpsc::UnboundedReceiver<String>,
        pump: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            pump,
        }
    }

    /// Channel whose other end is held in-process (no socket).
    pub fn in_memory() -> (Self, RelayRemote) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Self::new(out_tx, in_rx, None),
            RelayRemote {
                frames: out_rx,
                replies: in_tx,
            },
        )
    }

    pub fn send(&self, frame: &ClientFrame) -> Result<(), SignalingError> {
        let json = serde_json::to_string(frame)?;
        debug!("-> {}", json);
        self.outbound
            .send(OutboundMessage::from(json))
            .map_err(|_| SignalingError::ChannelClosed)
    }

    /// Next inbound text frame; `None` once the relay side is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.inbound.recv().await
    }

    /// Drop the outbound queue. The pump flushes what is queued, sends a
    /// close frame and exits on its own.
    pub fn close(mut self) {
        self.inbound.close();
        self.pump.take();
    }
}

/// WebSocket connector for the relay's JSON signaling API
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl RelayConnector for WsConnector {
    async fn connect(&self, url: &str) -> Result<RelayChannel, SignalingError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| SignalingError::Unreachable(e.to_string()))?;
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(RELAY_SUBPROTOCOL));

        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| SignalingError::Unreachable(e.to_string()))?;
        info!("Relay connected: {}", url);

        let (out_tx, out_rx) = mpsc::unbounded_channel::<OutboundMessage>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
        let pump = tokio::spawn(pump_frames(ws_stream, out_rx, in_tx));

        Ok(RelayChannel::new(out_tx, in_rx, Some(pump)))
    }
}

async fn pump_frames(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    inbound: mpsc::UnboundedSender<String>,
) {
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    loop {
        tokio::select! {
            msg = outbound.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = ws_tx.send(Message::Text(msg.into_inner())).await {
                        warn!("Relay send failed: {}", e);
                        break;
                    }
                }
                None => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            },

            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if inbound.send(text.as_str().to_owned()).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("Relay closed the connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Relay WebSocket error: {}", e);
                    break;
                }
            },
        }
    }

    debug!("Relay pump finished");
}
