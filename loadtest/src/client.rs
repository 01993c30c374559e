//! gRPC client used by virtual users
//!
//! A client moves through `Closed -> Connecting -> Open -> Closed`. Methods are
//! invoked by their resolved path rather than through generated stubs, so any
//! unary method found in the loaded protocol definition can be called.

use async_trait::async_trait;
use std::error::Error as StdError;
use std::time::{Duration, Instant};
use thiserror::Error;
use tonic::Code;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tracing::trace;

use crate::config::TargetConfig;
use crate::proto::{Request, Response};
use crate::schema::MethodPath;

/// Client errors that prevent a call from being made at all
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Invalid target address {target}: {message}")]
    InvalidTarget { target: String, message: String },

    #[error("Failed to connect to {target}: {message}")]
    Connect { target: String, message: String },

    #[error("Client is not connected")]
    NotConnected,

    #[error("Invalid method path: {0}")]
    InvalidPath(String),
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
}

/// Outcome of a single unary call
#[derive(Debug, Clone)]
pub struct Invocation {
    /// gRPC status of the call
    pub status: Code,
    /// Status message for failed calls
    pub message: String,
    /// Decoded response, present only for successful calls
    pub payload: Option<Response>,
    /// Time from sending the request to receiving the status
    pub latency: Duration,
}

impl Invocation {
    /// A call succeeded when it carries a payload and an `OK` status
    pub fn is_ok(&self) -> bool {
        self.status == Code::Ok && self.payload.is_some()
    }
}

/// A connection-owning client handle.
///
/// `close` must leave the client `Closed` whatever state it was in, so it can
/// be called unconditionally after every call.
#[async_trait]
pub trait RpcClient: Send {
    /// Current connection state
    fn state(&self) -> ConnectionState;

    /// Open a plaintext connection to `target` (`host:port`)
    async fn connect(&mut self, target: &str) -> Result<(), ClientError>;

    /// Invoke a unary method on the open connection
    async fn invoke(
        &mut self,
        method: &MethodPath,
        request: &Request,
    ) -> Result<Invocation, ClientError>;

    /// Release the connection
    async fn close(&mut self);
}

/// Factory for fresh, unconnected clients
pub trait Connector: Send + Sync {
    fn client(&self) -> Box<dyn RpcClient>;
}

/// Creates tonic-backed clients with the configured timeouts
#[derive(Debug, Clone)]
pub struct GrpcConnector {
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl GrpcConnector {
    pub fn new(config: &TargetConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            request_timeout: config.request_timeout,
        }
    }
}

impl Connector for GrpcConnector {
    fn client(&self) -> Box<dyn RpcClient> {
        Box::new(GrpcClient::new(self.connect_timeout, self.request_timeout))
    }
}

/// Plaintext HTTP/2 gRPC client over a tonic channel
pub struct GrpcClient {
    channel: Option<Channel>,
    state: ConnectionState,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl GrpcClient {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            channel: None,
            state: ConnectionState::Closed,
            connect_timeout,
            request_timeout,
        }
    }

    fn endpoint(&self, target: &str) -> Result<Endpoint, ClientError> {
        let uri = if target.contains("://") {
            target.to_string()
        } else {
            format!("http://{target}")
        };
        let endpoint = Endpoint::from_shared(uri).map_err(|e| ClientError::InvalidTarget {
            target: target.to_string(),
            message: error_chain(&e),
        })?;
        Ok(endpoint
            .connect_timeout(self.connect_timeout)
            .timeout(self.request_timeout))
    }
}

#[async_trait]
impl RpcClient for GrpcClient {
    fn state(&self) -> ConnectionState {
        self.state
    }

    async fn connect(&mut self, target: &str) -> Result<(), ClientError> {
        if self.state != ConnectionState::Closed {
            self.close().await;
        }

        self.state = ConnectionState::Connecting;
        let endpoint = match self.endpoint(target) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.state = ConnectionState::Closed;
                return Err(e);
            }
        };

        match endpoint.connect().await {
            Ok(channel) => {
                trace!("Connected to {}", target);
                self.channel = Some(channel);
                self.state = ConnectionState::Open;
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Closed;
                Err(ClientError::Connect {
                    target: target.to_string(),
                    message: error_chain(&e),
                })
            }
        }
    }

    async fn invoke(
        &mut self,
        method: &MethodPath,
        request: &Request,
    ) -> Result<Invocation, ClientError> {
        let channel = match (&self.channel, self.state) {
            (Some(channel), ConnectionState::Open) => channel.clone(),
            _ => return Err(ClientError::NotConnected),
        };
        let path = PathAndQuery::try_from(method.path())
            .map_err(|_| ClientError::InvalidPath(method.full_name()))?;

        let mut grpc = tonic::client::Grpc::new(channel);
        let start = Instant::now();
        if let Err(e) = grpc.ready().await {
            return Ok(Invocation {
                status: Code::Unavailable,
                message: error_chain(&e),
                payload: None,
                latency: start.elapsed(),
            });
        }

        let codec: ProstCodec<Request, Response> = ProstCodec::default();
        let result = grpc
            .unary(tonic::Request::new(request.clone()), path, codec)
            .await;
        let latency = start.elapsed();

        Ok(match result {
            Ok(response) => Invocation {
                status: Code::Ok,
                message: String::new(),
                payload: Some(response.into_inner()),
                latency,
            },
            Err(status) => Invocation {
                status: status.code(),
                message: status.message().to_string(),
                payload: None,
                latency,
            },
        })
    }

    async fn close(&mut self) {
        // Dropping the last channel handle tears down the HTTP/2 connection
        self.channel = None;
        self.state = ConnectionState::Closed;
    }
}

/// Render an error with its sources, transport errors hide the useful part
fn error_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ProtoSchema;
    use std::path::Path;

    fn add_method() -> MethodPath {
        let proto = concat!(env!("CARGO_MANIFEST_DIR"), "/proto/calculator.proto");
        ProtoSchema::load(&[], Path::new(proto))
            .unwrap()
            .resolve("calculator.Calculator/Add")
            .unwrap()
    }

    #[test]
    fn test_invocation_requires_payload_and_ok_status() {
        let ok = Invocation {
            status: Code::Ok,
            message: String::new(),
            payload: Some(Response { result: 21 }),
            latency: Duration::from_millis(3),
        };
        assert!(ok.is_ok());

        let empty = Invocation {
            payload: None,
            ..ok.clone()
        };
        assert!(!empty.is_ok());

        let failed = Invocation {
            status: Code::Internal,
            ..ok
        };
        assert!(!failed.is_ok());
    }

    #[tokio::test]
    async fn test_invoke_before_connect_is_rejected() {
        let mut client = GrpcClient::new(Duration::from_secs(1), Duration::from_secs(1));
        assert_eq!(client.state(), ConnectionState::Closed);

        let err = client
            .invoke(&add_method(), &Request::operands(18, 3))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_client_closed() {
        // Bind then drop a listener so the port is very likely refused
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut client = GrpcClient::new(Duration::from_millis(500), Duration::from_secs(1));
        let err = client.connect(&addr.to_string()).await.unwrap_err();
        assert!(matches!(err, ClientError::Connect { .. }));
        assert_eq!(client.state(), ConnectionState::Closed);

        client.close().await;
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_invalid_target_is_reported() {
        let mut client = GrpcClient::new(Duration::from_millis(500), Duration::from_secs(1));
        let err = client.connect("not a host:port").await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidTarget { .. }));
        assert_eq!(client.state(), ConnectionState::Closed);
    }
}
