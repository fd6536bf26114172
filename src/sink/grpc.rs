//! Client-streaming gRPC delivery of flushed batches.

use std::time::Duration;

use anyhow::{Context, Result};
use tonic::transport::{Channel, Endpoint};

use super::{DispatchError, DispatchReceipt, Dispatcher};
use crate::proto::traffic_service_client::TrafficServiceClient;
use crate::proto::{ConnectionBatch, ConnectionEvent as WireEvent};
use crate::tracer::event::ConnectionEvent;

/// Delivers each batch as one `SendConnectionEvents` call.
///
/// The call sends the batch as a single message, half-closes the stream and
/// waits for the one response. Connections are multiplexed over one channel
/// created at startup.
pub struct GrpcDispatcher {
    client: TrafficServiceClient<Channel>,
    endpoint: String,
    timeout: Duration,
}

impl GrpcDispatcher {
    /// Connects eagerly to the sink at `address` (`host:port` or a full
    /// `http://` URI). An unreachable sink is an error.
    pub async fn connect(address: &str, timeout: Duration) -> Result<Self> {
        let uri = endpoint_uri(address);
        let channel = Endpoint::from_shared(uri.clone())
            .with_context(|| format!("invalid sink address {address:?}"))?
            .connect_timeout(timeout)
            .connect()
            .await
            .with_context(|| format!("connecting to sink at {uri}"))?;

        tracing::info!(endpoint = %uri, "connected to traffic sink");

        Ok(Self::from_channel(channel, uri, timeout))
    }

    /// Wraps an existing channel.
    pub fn from_channel(channel: Channel, endpoint: String, timeout: Duration) -> Self {
        Self {
            client: TrafficServiceClient::new(channel),
            endpoint,
            timeout,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(&mut self, batch: Vec<ConnectionEvent>) -> Result<DispatchReceipt, DispatchError> {
        let events = batch.len();
        let message = ConnectionBatch {
            events: batch.iter().map(WireEvent::from).collect(),
        };

        let response = self
            .client
            .send_connection_events(tokio_stream::once(message))
            .await
            .map_err(DispatchError::from_status)?
            .into_inner();

        Ok(DispatchReceipt {
            events,
            message: response.message,
            batch_id: response.batch_id,
        })
    }
}

impl Dispatcher for GrpcDispatcher {
    fn name(&self) -> &str {
        "grpc"
    }

    async fn dispatch(
        &mut self,
        batch: Vec<ConnectionEvent>,
    ) -> Result<DispatchReceipt, DispatchError> {
        if batch.is_empty() {
            return Err(DispatchError::EmptyBatch);
        }

        let limit = self.timeout;
        match tokio::time::timeout(limit, self.send(batch)).await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout(limit)),
        }
    }
}

impl From<&ConnectionEvent> for WireEvent {
    fn from(event: &ConnectionEvent) -> Self {
        Self {
            node_id: event.node_id.clone(),
            timestamp: event.timestamp_ns,
            pid: event.pid,
            process_name: event.process_label.clone(),
            saddr: event.src_addr,
            daddr: event.dst_addr,
            sport: u32::from(event.src_port),
            dport: u32::from(event.dst_port),
            protocol: u32::from(event.protocol),
        }
    }
}

/// Prefixes bare `host:port` addresses with `http://`.
fn endpoint_uri(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::event::{process_label, SyscallKind, IPPROTO_TCP};

    #[test]
    fn test_endpoint_uri() {
        assert_eq!(endpoint_uri("localhost:9090"), "http://localhost:9090");
        assert_eq!(endpoint_uri("sink.internal:50051"), "http://sink.internal:50051");
        assert_eq!(endpoint_uri("http://10.0.0.5:9090"), "http://10.0.0.5:9090");
        assert_eq!(endpoint_uri("https://sink:443"), "https://sink:443");
    }

    #[test]
    fn test_wire_event_carries_label_and_widens_ports() {
        let event = ConnectionEvent {
            node_id: "node-a".to_string(),
            timestamp_ns: 1_700_000_000_000_000_000,
            pid: 1234,
            uid: 1000,
            kind: SyscallKind::Connect,
            process_name: "curl".to_string(),
            process_label: process_label("curl", SyscallKind::Connect),
            src_addr: 0x0A00_0001,
            dst_addr: 0x5DB8_D822,
            src_port: 5000,
            dst_port: 443,
            family: 2,
            protocol: IPPROTO_TCP,
        };

        let wire = WireEvent::from(&event);
        assert_eq!(wire.node_id, "node-a");
        assert_eq!(wire.timestamp, 1_700_000_000_000_000_000);
        assert_eq!(wire.pid, 1234);
        assert_eq!(wire.process_name, "curl [connect]");
        assert_eq!(wire.saddr, 0x0A00_0001);
        assert_eq!(wire.daddr, 0x5DB8_D822);
        assert_eq!(wire.sport, 5000);
        assert_eq!(wire.dport, 443);
        assert_eq!(wire.protocol, 6);
    }

    #[tokio::test]
    async fn test_connect_unreachable_sink_fails() {
        // Port 1 on loopback is never served in test environments.
        let result = GrpcDispatcher::connect("127.0.0.1:1", Duration::from_millis(500)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_empty_batch_refused_locally() {
        let channel = Endpoint::from_static("http://127.0.0.1:1").connect_lazy();
        let mut dispatcher =
            GrpcDispatcher::from_channel(channel, "http://127.0.0.1:1".to_string(), Duration::from_secs(1));

        let err = dispatcher.dispatch(Vec::new()).await.unwrap_err();
        assert!(matches!(err, DispatchError::EmptyBatch));
    }
}
