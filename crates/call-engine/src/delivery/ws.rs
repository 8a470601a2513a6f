//! axum WebSocket halves for the delivery bridge

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tracing::debug;

use super::{AgentSink, AgentSource, ClientFrame, DeliveryMessage};
use crate::error::{CallEngineError, Result};

pub struct WsSink(SplitSink<WebSocket, Message>);

pub struct WsSource(SplitStream<WebSocket>);

/// Split an upgraded socket into bridge halves
pub fn split(socket: WebSocket) -> (WsSink, WsSource) {
    let (sink, stream) = socket.split();
    (WsSink(sink), WsSource(stream))
}

#[async_trait]
impl AgentSink for WsSink {
    async fn send(&mut self, message: &DeliveryMessage) -> Result<()> {
        let json = message.to_json()?;
        self.0
            .send(Message::Text(json))
            .await
            .map_err(|e| CallEngineError::delivery(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.0.send(Message::Close(None)).await {
            debug!("WebSocket close frame not sent: {}", e);
        }
    }
}

#[async_trait]
impl AgentSource for WsSource {
    async fn next_frame(&mut self) -> Option<Result<ClientFrame>> {
        loop {
            let frame = match self.0.next().await? {
                Ok(Message::Text(text)) => ClientFrame::Data(text),
                Ok(Message::Binary(bytes)) => ClientFrame::Data(String::from_utf8_lossy(&bytes).into_owned()),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Close(_)) => ClientFrame::Close,
                Err(e) => return Some(Err(CallEngineError::delivery(e.to_string()))),
            };
            return Some(Ok(frame));
        }
    }
}
