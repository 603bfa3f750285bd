use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};

use super::error::{Result, TwitchError};

/// One open EventSub websocket. Only the session that opened it reads or
/// writes it.
#[async_trait]
pub trait WsConnection: Send {
    /// Next text frame, or `None` once the peer has closed the connection
    async fn next_text(&mut self) -> Result<Option<String>>;

    /// Send a close frame
    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait WsConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn WsConnection>>;
}

pub struct TungsteniteConnector;

#[async_trait]
impl WsConnector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn WsConnection>> {
        let (stream, _) = connect_async(url).await?;
        log::debug!("WebSocket connected to {}", url);
        Ok(Box::new(TungsteniteConnection { stream }))
    }
}

struct TungsteniteConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl WsConnection for TungsteniteConnection {
    async fn next_text(&mut self) -> Result<Option<String>> {
        while let Some(message) = self.stream.next().await {
            match message? {
                Message::Text(text) => return Ok(Some(text.as_str().to_owned())),
                Message::Ping(payload) => {
                    // Respond to ping with pong
                    self.stream.send(Message::Pong(payload)).await?;
                }
                Message::Close(frame) => {
                    let code: u16 = frame.as_ref().map(|f| f.code.into()).unwrap_or(1000);
                    let reason = frame
                        .as_ref()
                        .map(|f| f.reason.to_string())
                        .unwrap_or_else(|| "Unknown".to_string());

                    match code {
                        4000..=4007 => log::error!("Twitch close code {}: {}", code, reason),
                        _ => log::warn!("WebSocket closed: code={}, reason={}", code, reason),
                    }
                    return Ok(None);
                }
                _ => {}
            }
        }
        Ok(None)
    }

    async fn close(&mut self) -> Result<()> {
        match self.stream.close(None).await {
            Ok(()) => Ok(()),
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
            | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(TwitchError::from(e)),
        }
    }
}
