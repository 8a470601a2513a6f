//! In-process agent connection over tokio channels
//!
//! [`channel_connection`] returns the two halves a bridge needs plus a
//! [`ChannelPeer`] standing in for the agent's client: it reads the frames the
//! bridge sent and can close the connection from its side.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{AgentSink, AgentSource, ClientFrame, DeliveryMessage};
use crate::error::{CallEngineError, Result};

pub struct ChannelSink {
    tx: mpsc::UnboundedSender<DeliveryMessage>,
}

pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<ClientFrame>,
}

/// Client end of a channel connection
pub struct ChannelPeer {
    frames: mpsc::UnboundedReceiver<DeliveryMessage>,
    outbound: Option<mpsc::UnboundedSender<ClientFrame>>,
}

pub fn channel_connection() -> (ChannelSink, ChannelSource, ChannelPeer) {
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let (client_tx, client_rx) = mpsc::unbounded_channel();
    (
        ChannelSink { tx: frame_tx },
        ChannelSource { rx: client_rx },
        ChannelPeer {
            frames: frame_rx,
            outbound: Some(client_tx),
        },
    )
}

#[async_trait]
impl AgentSink for ChannelSink {
    async fn send(&mut self, message: &DeliveryMessage) -> Result<()> {
        self.tx
            .send(message.clone())
            .map_err(|_| CallEngineError::delivery("agent connection is closed"))
    }

    async fn close(&mut self) {}
}

#[async_trait]
impl AgentSource for ChannelSource {
    async fn next_frame(&mut self) -> Option<Result<ClientFrame>> {
        self.rx.recv().await.map(Ok)
    }
}

impl ChannelPeer {
    /// Next frame sent by the bridge, `None` once the bridge dropped its sink
    pub async fn recv(&mut self) -> Option<DeliveryMessage> {
        self.frames.recv().await
    }

    pub fn try_recv(&mut self) -> Option<DeliveryMessage> {
        self.frames.try_recv().ok()
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        match &self.outbound {
            Some(tx) => tx.send(ClientFrame::Data(text.into())).is_ok(),
            None => false,
        }
    }

    /// Send a close frame and hang up
    pub fn close(&mut self) {
        if let Some(tx) = self.outbound.take() {
            let _ = tx.send(ClientFrame::Close);
        }
    }

    /// Stop reading frames; further writes by the bridge fail
    pub fn stop_reading(&mut self) {
        self.frames.close();
    }
}
