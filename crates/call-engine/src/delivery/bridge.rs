//! One agent connection's relay from the assigned-call stream

use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    AgentSink, AgentSource, BridgeRegistry, ClientFrame, ConnectionState, DeliveryMessage,
};
use crate::broker::{topics, EventSubscriber, StreamConsumer, SubscriptionSpec};
use crate::types::{AgentId, AssignedCall};

pub const DEFAULT_GROUP_PREFIX: &str = "ws";

const SETUP_FAILED_MESSAGE: &str = "Failed to connect to message stream";

/// Why a bridge reached `Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The subscription or the connected acknowledgement failed
    SetupFailed,
    PeerClosed,
    StreamEnded,
    StreamError,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::SetupFailed => "setup failed",
            CloseReason::PeerClosed => "peer closed",
            CloseReason::StreamEnded => "stream ended",
            CloseReason::StreamError => "stream error",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// What a bridge did over its lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSummary {
    pub agent_id: AgentId,
    pub group_id: String,
    pub delivered: u64,
    /// Calls addressed to other agents
    pub skipped: u64,
    pub malformed: u64,
    pub failed_writes: u64,
    pub reason: CloseReason,
}

enum RelayEnd {
    Cancelled,
    StreamEnded,
    StreamError,
}

pub struct DeliveryBridge {
    agent_id: AgentId,
    group_id: String,
    subscriber: Arc<dyn EventSubscriber>,
    registry: BridgeRegistry,
    shutdown: CancellationToken,
    state: ConnectionState,
}

impl DeliveryBridge {
    /// Prepare a bridge for a freshly authenticated connection
    ///
    /// `shutdown` is the server's token; the bridge runs on a child of it.
    pub fn new(
        agent_id: AgentId,
        subscriber: Arc<dyn EventSubscriber>,
        registry: BridgeRegistry,
        shutdown: CancellationToken,
    ) -> Self {
        let group_id = Self::group_id_for(DEFAULT_GROUP_PREFIX, &agent_id);
        Self {
            agent_id,
            group_id,
            subscriber,
            registry,
            shutdown,
            state: ConnectionState::Connecting,
        }
    }

    pub fn with_group_prefix(mut self, prefix: &str) -> Self {
        self.group_id = Self::group_id_for(prefix, &self.agent_id);
        self
    }

    /// Consumer group unique to one connection
    pub fn group_id_for(prefix: &str, agent_id: &AgentId) -> String {
        format!("{}-{}-{}", prefix, agent_id, Uuid::new_v4())
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!(agent_id = %self.agent_id, "Connection {} -> {}", self.state, next);
        self.state = next;
    }

    fn summary(&self, reason: CloseReason) -> BridgeSummary {
        BridgeSummary {
            agent_id: self.agent_id.clone(),
            group_id: self.group_id.clone(),
            delivered: 0,
            skipped: 0,
            malformed: 0,
            failed_writes: 0,
            reason,
        }
    }

    /// Drive the connection from `Connecting` to `Closed`
    ///
    /// The consumer group is released on every path out of `Open`. If the
    /// future is dropped mid-relay the consumer, the registration and the
    /// peer reader are released by their own drop guards.
    pub async fn run<S, R>(mut self, mut sink: S, source: R) -> BridgeSummary
    where
        S: AgentSink,
        R: AgentSource + 'static,
    {
        let spec = SubscriptionSpec::ephemeral(topics::ASSIGNED_CALLS, self.group_id.clone());
        let mut consumer = match self.subscriber.subscribe(spec).await {
            Ok(consumer) => consumer,
            Err(e) => {
                error!(agent_id = %self.agent_id, error = %e, "Failed to create delivery subscription");
                let frame = DeliveryMessage::Error {
                    message: SETUP_FAILED_MESSAGE.to_string(),
                };
                if let Err(e) = sink.send(&frame).await {
                    debug!(agent_id = %self.agent_id, "Could not send error frame: {}", e);
                }
                sink.close().await;
                self.transition(ConnectionState::Closed);
                return self.summary(CloseReason::SetupFailed);
            }
        };

        if let Err(e) = sink.send(&DeliveryMessage::connected(&self.agent_id)).await {
            warn!(agent_id = %self.agent_id, "Failed to acknowledge connection: {}", e);
            release(consumer.as_mut(), &self.group_id).await;
            sink.close().await;
            self.transition(ConnectionState::Closed);
            return self.summary(CloseReason::SetupFailed);
        }

        self.transition(ConnectionState::Open);
        let registration = self.registry.register(&self.agent_id);
        info!(agent_id = %self.agent_id, group = %self.group_id, "🔌 Agent connected");

        let token = self.shutdown.child_token();
        let reader = AbortOnDropHandle::new(tokio::spawn(watch_peer(
            source,
            token.clone(),
            self.agent_id.clone(),
        )));

        let mut summary = self.summary(CloseReason::StreamEnded);
        let end = self.relay(consumer.as_mut(), &mut sink, &token, &mut summary).await;

        token.cancel();
        let peer_closed = reader.await.unwrap_or(true);
        summary.reason = match end {
            RelayEnd::StreamEnded => CloseReason::StreamEnded,
            RelayEnd::StreamError => CloseReason::StreamError,
            RelayEnd::Cancelled if peer_closed => CloseReason::PeerClosed,
            RelayEnd::Cancelled => CloseReason::Shutdown,
        };

        release(consumer.as_mut(), &self.group_id).await;
        sink.close().await;
        drop(registration);
        self.transition(ConnectionState::Closed);

        info!(
            agent_id = %summary.agent_id,
            delivered = summary.delivered,
            skipped = summary.skipped,
            malformed = summary.malformed,
            failed_writes = summary.failed_writes,
            reason = %summary.reason,
            "Agent disconnected, delivery stopped"
        );
        summary
    }

    async fn relay<S: AgentSink>(
        &self,
        consumer: &mut dyn StreamConsumer,
        sink: &mut S,
        token: &CancellationToken,
        summary: &mut BridgeSummary,
    ) -> RelayEnd {
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => return RelayEnd::Cancelled,
                next = consumer.next() => next,
            };

            let record = match next {
                Some(Ok(record)) => record,
                Some(Err(e)) => {
                    error!(agent_id = %self.agent_id, "Assigned call stream failed: {}", e);
                    return RelayEnd::StreamError;
                }
                None => return RelayEnd::StreamEnded,
            };

            match AssignedCall::decode(&record.payload) {
                Ok(call) if call.is_for(&self.agent_id) => {
                    let call_id = call.call_id.clone();
                    match sink.send(&DeliveryMessage::NewCall { data: call }).await {
                        Ok(()) => {
                            summary.delivered += 1;
                            debug!(agent_id = %self.agent_id, call_id = %call_id, "Delivered call");
                        }
                        Err(e) => {
                            summary.failed_writes += 1;
                            warn!(agent_id = %self.agent_id, call_id = %call_id, "Error sending call to agent: {}", e);
                        }
                    }
                }
                Ok(_) => summary.skipped += 1,
                Err(e) => {
                    summary.malformed += 1;
                    warn!(agent_id = %self.agent_id, offset = record.offset, "Skipping undecodable assigned call: {}", e);
                }
            }

            if let Err(e) = consumer.ack(&record).await {
                debug!("Failed to mark offset {} for {}: {}", record.offset, self.group_id, e);
            }
        }
    }
}

/// Read client frames until the peer goes away or the bridge is cancelled
///
/// Returns `true` if the peer ended the connection.
async fn watch_peer<R: AgentSource>(mut source: R, token: CancellationToken, agent_id: AgentId) -> bool {
    let peer_closed = loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break false,
            frame = source.next_frame() => frame,
        };
        match frame {
            Some(Ok(ClientFrame::Data(text))) => {
                debug!(agent_id = %agent_id, "Ignoring {} byte client frame", text.len());
            }
            Some(Ok(ClientFrame::Close)) | None => break true,
            Some(Err(e)) => {
                debug!(agent_id = %agent_id, "Agent connection read failed: {}", e);
                break true;
            }
        }
    };
    token.cancel();
    peer_closed
}

async fn release(consumer: &mut dyn StreamConsumer, group_id: &str) {
    if let Err(e) = consumer.close().await {
        warn!("Failed to release consumer group {}: {}", group_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{EventPublisher, InMemoryBroker};
    use crate::delivery::channel::channel_connection;
    use crate::types::InboundCall;
    use std::time::Duration;

    async fn publish_for(broker: &InMemoryBroker, call_id: &str, agent: &str) {
        let call = AssignedCall::assign(&InboundCall::new(call_id, "555"), AgentId::from(agent));
        broker
            .publish(topics::ASSIGNED_CALLS, call_id, serde_json::to_vec(&call).unwrap())
            .await
            .unwrap();
    }

    fn bridge(broker: &InMemoryBroker, agent: &str, shutdown: &CancellationToken) -> DeliveryBridge {
        DeliveryBridge::new(
            AgentId::from(agent),
            Arc::new(broker.clone()),
            BridgeRegistry::new(),
            shutdown.clone(),
        )
    }

    #[test]
    fn test_group_ids_are_unique_per_connection() {
        let agent = AgentId::from("100001");
        let a = DeliveryBridge::group_id_for("ws", &agent);
        let b = DeliveryBridge::group_id_for("ws", &agent);
        assert!(a.starts_with("ws-100001-"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_delivers_only_own_calls_in_order() {
        let broker = InMemoryBroker::new();
        let shutdown = CancellationToken::new();
        let (sink, source, mut peer) = channel_connection();
        let task = tokio::spawn(bridge(&broker, "X", &shutdown).run(sink, source));

        assert!(matches!(peer.recv().await, Some(DeliveryMessage::Connected { .. })));
        for (call, agent) in [("c1", "X"), ("c2", "Y"), ("c3", "X"), ("c4", "Z")] {
            publish_for(&broker, call, agent).await;
        }

        let mut delivered = Vec::new();
        for _ in 0..2 {
            match tokio::time::timeout(Duration::from_secs(2), peer.recv()).await.unwrap() {
                Some(DeliveryMessage::NewCall { data }) => delivered.push(data.call_id),
                other => panic!("unexpected frame {:?}", other),
            }
        }
        assert_eq!(delivered, vec!["c1", "c3"]);

        peer.close();
        let summary = task.await.unwrap();
        assert_eq!(summary.delivered, 2);
        assert_eq!(summary.reason, CloseReason::PeerClosed);
        assert_eq!(broker.group_count(topics::ASSIGNED_CALLS), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_bridge() {
        let broker = InMemoryBroker::new();
        let shutdown = CancellationToken::new();
        let (sink, source, mut peer) = channel_connection();
        let task = tokio::spawn(bridge(&broker, "X", &shutdown).run(sink, source));

        assert!(matches!(peer.recv().await, Some(DeliveryMessage::Connected { .. })));
        assert_eq!(broker.group_count(topics::ASSIGNED_CALLS), 1);

        shutdown.cancel();
        let summary = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(summary.reason, CloseReason::Shutdown);
        assert_eq!(broker.group_count(topics::ASSIGNED_CALLS), 0);
    }

    #[tokio::test]
    async fn test_subscription_failure_sends_error_frame() {
        let broker = InMemoryBroker::new();
        broker.shutdown();
        let (sink, source, mut peer) = channel_connection();

        let summary = bridge(&broker, "X", &CancellationToken::new()).run(sink, source).await;
        assert_eq!(summary.reason, CloseReason::SetupFailed);
        match peer.recv().await {
            Some(DeliveryMessage::Error { message }) => assert_eq!(message, SETUP_FAILED_MESSAGE),
            other => panic!("expected error frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_acknowledgement_releases_group() {
        let broker = InMemoryBroker::new();
        let (sink, source, mut peer) = channel_connection();
        peer.stop_reading();

        let summary = bridge(&broker, "X", &CancellationToken::new()).run(sink, source).await;
        assert_eq!(summary.reason, CloseReason::SetupFailed);
        assert_eq!(broker.group_count(topics::ASSIGNED_CALLS), 0);
    }

    #[tokio::test]
    async fn test_write_failure_does_not_end_subscription() {
        let broker = InMemoryBroker::new();
        let shutdown = CancellationToken::new();
        let (sink, source, mut peer) = channel_connection();
        let task = tokio::spawn(bridge(&broker, "X", &shutdown).run(sink, source));

        assert!(matches!(peer.recv().await, Some(DeliveryMessage::Connected { .. })));
        peer.stop_reading();
        publish_for(&broker, "c1", "X").await;
        publish_for(&broker, "c2", "X").await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        peer.close();
        let summary = task.await.unwrap();
        assert_eq!(summary.failed_writes, 2);
        assert_eq!(summary.delivered, 0);
    }

    #[tokio::test]
    async fn test_aborted_bridge_releases_group_and_registration() {
        let broker = InMemoryBroker::new();
        let registry = BridgeRegistry::new();
        let (sink, source, mut peer) = channel_connection();
        let bridge = DeliveryBridge::new(
            AgentId::from("X"),
            Arc::new(broker.clone()),
            registry.clone(),
            CancellationToken::new(),
        );
        let task = tokio::spawn(bridge.run(sink, source));

        assert!(matches!(peer.recv().await, Some(DeliveryMessage::Connected { .. })));
        assert_eq!(broker.group_count(topics::ASSIGNED_CALLS), 1);
        assert_eq!(registry.total(), 1);

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(broker.group_count(topics::ASSIGNED_CALLS), 0);
        assert_eq!(registry.total(), 0);

        assert!(peer.recv().await.is_none());
        // peer reader is aborted with the bridge and stops accepting frames
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while peer.send_text("ping") {
            assert!(tokio::time::Instant::now() < deadline, "peer reader still running");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
