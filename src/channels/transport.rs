//! Push-channel transport: connect, receive frames, send text, close
//!
//! The channel logic only sees [`Connector`] and [`Connection`]; the
//! WebSocket implementation lives in [`WsConnector`].

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::{Error, Result};

/// Close code for a graceful, client- or server-initiated shutdown
pub const NORMAL_CLOSE: u16 = 1000;

/// Close code reported when the connection dropped without a close frame
pub const ABNORMAL_CLOSE: u16 = 1006;

/// A frame received from the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text frame
    Text(String),
    /// Binary frame
    Binary(Vec<u8>),
    /// Close frame with optional close code
    Close(Option<u16>),
}

/// Opens connections to a URL
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>>;
}

/// An open bidirectional connection
#[async_trait]
pub trait Connection: Send {
    /// Receive the next frame; `None` when the stream ended without a close frame
    async fn recv(&mut self) -> Option<Result<Frame>>;

    /// Send a text frame
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Close with the given code
    async fn close(&mut self, code: u16) -> Result<()>;
}

/// WebSocket connector built on `tokio-tungstenite`
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>> {
        let (stream, response) = connect_async(url)
            .await
            .map_err(|e| Error::Transport(format!("connect to {url} failed: {e}")))?;

        tracing::debug!(url, status = %response.status(), "websocket handshake complete");

        Ok(Box::new(WsConnection { stream }))
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// WebSocket connection
struct WsConnection {
    stream: WsStream,
}

#[async_trait]
impl Connection for WsConnection {
    async fn recv(&mut self) -> Option<Result<Frame>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(m) => m,
                Err(e) => return Some(Err(Error::Transport(e.to_string()))),
            };

            let frame = match message {
                Message::Text(text) => Frame::Text(text.to_string()),
                Message::Binary(data) => Frame::Binary(data.to_vec()),
                Message::Close(frame) => Frame::Close(frame.map(|f| u16::from(f.code))),
                // Control frames are answered by tungstenite itself
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };

            return Some(Ok(frame));
        }
    }

    async fn send_text(&mut self, text: String) -> Result<()> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| Error::Transport(format!("send failed: {e}")))
    }

    async fn close(&mut self, code: u16) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        };
        self.stream
            .close(Some(frame))
            .await
            .map_err(|e| Error::Transport(format!("close failed: {e}")))
    }
}
