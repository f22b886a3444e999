//! WebSocket event source
//!
//! Thin adapter over `tokio-tungstenite` exposing inbound text frames as a
//! [`FrameStream`]. Control frames are handled by the transport and skipped here.

use crate::domain::ports::{EventSource, FrameStream};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Event source reading JSON frames from a WebSocket endpoint
#[derive(Debug, Clone, Default)]
pub struct WebSocketSource;

impl WebSocketSource {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EventSource for WebSocketSource {
    async fn open(&self, url: &str) -> Result<FrameStream> {
        let (ws_stream, response) = tokio_tungstenite::connect_async(url).await?;
        debug!(url = %url, status = %response.status(), "WebSocket handshake complete");

        let frames = ws_stream
            .filter_map(|message| async move {
                match message {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(Message::Binary(bytes)) => {
                        Some(Ok(String::from_utf8_lossy(&bytes).into_owned()))
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "WebSocket close frame received");
                        None
                    }
                    // Ping/pong and raw frames
                    Ok(_) => None,
                    Err(e) => Some(Err(Error::from(e))),
                }
            })
            .boxed();

        Ok(frames)
    }
}
