pub mod agent;
pub mod config;
pub mod export;
pub mod receiver;
pub mod sink;
pub mod tracer;

/// Generated gRPC types for the `traffic` package.
pub mod proto {
    tonic::include_proto!("traffic");
}
