//! Calculator Load Test Library
//!
//! Drives a fixed pool of virtual users against the gRPC calculator service
//! and tallies a `status is OK` check for every call. Exported for the binary
//! and for integration tests.

pub mod check;
pub mod client;
pub mod config;
pub mod proto;
pub mod runner;
pub mod scenario;
pub mod schema;
pub mod stats;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types
pub use check::{CheckRegistry, CheckTally, STATUS_IS_OK};
pub use client::{Connector, GrpcConnector, RpcClient};
pub use config::{Config, ConnectionScope};
pub use runner::{LoadRunner, RunError};
pub use schema::{MethodPath, ProtoSchema, SchemaError};
pub use stats::RunSummary;
