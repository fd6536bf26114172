//! Central sink: the gRPC service that receives, logs and acknowledges
//! batches sent by pumps.

pub mod render;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};

use crate::config::bind_address;
use crate::export::health::HealthMetrics;
use crate::proto::traffic_service_server::{TrafficService, TrafficServiceServer};
use crate::proto::{ConnectionBatch, ConnectionResponse, HealthRequest, HealthResponse};
use render::EventLine;

/// Acknowledgment message for an ingested batch.
pub const ACK_MESSAGE: &str = "OK";

/// Receives batches from pumps.
///
/// Each `SendConnectionEvents` call reads exactly one batch, logs it and
/// answers; any further messages on the same stream are ignored.
#[derive(Clone, Default)]
pub struct TrafficSink {
    health: Option<Arc<HealthMetrics>>,
}

impl TrafficSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records receive counters on `health`.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    fn reject(&self, reason: &str, status: Status) -> Status {
        if let Some(h) = &self.health {
            h.batches_rejected.with_label_values(&[reason]).inc();
        }
        status
    }

    fn ingest(&self, batch: &ConnectionBatch) -> Result<usize, Status> {
        let Some(first) = batch.events.first() else {
            return Err(self.reject("empty", Status::invalid_argument("empty batch")));
        };

        tracing::info!(
            node_id = %first.node_id,
            count = batch.events.len(),
            "received connection batch",
        );
        for event in &batch.events {
            tracing::info!("{}", EventLine(event));
        }

        if let Some(h) = &self.health {
            h.batches_received.inc();
            h.events_ingested.inc_by(batch.events.len() as f64);
        }

        Ok(batch.events.len())
    }
}

#[tonic::async_trait]
impl TrafficService for TrafficSink {
    async fn send_connection_events(
        &self,
        request: Request<Streaming<ConnectionBatch>>,
    ) -> Result<Response<ConnectionResponse>, Status> {
        let mut stream = request.into_inner();

        let batch = match stream.message().await {
            Ok(Some(batch)) => batch,
            Ok(None) => {
                return Err(self.reject(
                    "no_message",
                    Status::invalid_argument("stream closed before a batch was sent"),
                ));
            }
            Err(status) => {
                tracing::warn!(error = %status, "receiving connection batch");
                return Err(self.reject("transport", status));
            }
        };

        self.ingest(&batch)?;

        Ok(Response::new(ConnectionResponse {
            message: ACK_MESSAGE.to_string(),
            batch_id: render::batch_id(&Local::now()),
        }))
    }

    async fn health_check(
        &self,
        _request: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        Ok(Response::new(HealthResponse {
            status: "healthy".to_string(),
            message: "Traffic Sink is running".to_string(),
        }))
    }
}

/// Binds `listen_address` (`:port` means all interfaces) and serves until
/// `cancel` fires.
pub async fn serve(
    listen_address: &str,
    sink: TrafficSink,
    cancel: CancellationToken,
) -> Result<()> {
    let addr = bind_address(listen_address);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("listening on {addr}"))?;

    serve_on(listener, sink, cancel).await
}

/// Serves the sink on an already bound listener until `cancel` fires.
pub async fn serve_on(
    listener: TcpListener,
    sink: TrafficSink,
    cancel: CancellationToken,
) -> Result<()> {
    let local_addr = listener.local_addr().context("getting local address")?;
    tracing::info!(addr = %local_addr, "traffic sink listening");

    Server::builder()
        .add_service(TrafficServiceServer::new(sink))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
            cancel.cancelled().await;
        })
        .await
        .context("serving traffic sink")?;

    tracing::info!("traffic sink stopped");

    Ok(())
}
