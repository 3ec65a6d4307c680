//! Duplex transport seam with a tokio-tungstenite implementation

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connection(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("Transport closed")]
    Closed,
    #[error("Channel send error")]
    ChannelSend,
}

/// One event observed on the inbound side of a transport
#[derive(Debug)]
pub enum TransportEvent {
    /// A complete text frame
    Frame(String),
    /// Pong control frame answering one of our pings
    Pong,
    /// The server initiated a clean close
    Closed,
}

/// Outbound half of an established transport
#[async_trait]
pub trait TransportSink: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;
    async fn ping(&mut self) -> Result<(), TransportError>;
    async fn close(&mut self);
}

/// Inbound half of an established transport
#[async_trait]
pub trait TransportStream: Send {
    /// Next inbound event; `Err` means the transport failed underneath us
    async fn recv(&mut self) -> Result<TransportEvent, TransportError>;
}

/// Both halves of one established duplex connection
pub struct TransportPair {
    pub sink: Box<dyn TransportSink>,
    pub stream: Box<dyn TransportStream>,
}

/// Dials endpoint URLs and produces live transports.
///
/// Injected into the connection manager so tests can substitute an in-memory
/// transport for the real network.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<TransportPair, TransportError>;
}

type WsWrite = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsRead = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Production connector backed by tokio-tungstenite
#[derive(Debug, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<TransportPair, TransportError> {
        // Validate up front so a bad endpoint fails with a parse error
        // instead of a confusing handshake error.
        Url::parse(url)?;

        let (ws_stream, response) = connect_async(url).await?;
        debug!(status = ?response.status(), url, "WebSocket connected");

        let (write, read) = ws_stream.split();
        Ok(TransportPair {
            sink: Box::new(WsSink { write }),
            stream: Box::new(WsStream { read }),
        })
    }
}

struct WsSink {
    write: WsWrite,
}

#[async_trait]
impl TransportSink for WsSink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.write.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.write.send(Message::Ping(Vec::new().into())).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.write.send(Message::Close(None)).await;
        let _ = self.write.close().await;
    }
}

struct WsStream {
    read: WsRead,
}

#[async_trait]
impl TransportStream for WsStream {
    async fn recv(&mut self) -> Result<TransportEvent, TransportError> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(TransportEvent::Frame(text.to_string()))
                }
                Some(Ok(Message::Pong(_))) => return Ok(TransportEvent::Pong),
                Some(Ok(Message::Close(_))) => return Ok(TransportEvent::Closed),
                // Binary frames and inbound pings are protocol noise here
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TransportError::Connection(e)),
                None => return Err(TransportError::Closed),
            }
        }
    }
}
