//! Test Utilities Module
//!
//! Provides an in-memory transport that records every connect, invoke and
//! close so scenario and runner tests can assert on call sequences without a
//! network. This module is only compiled when running tests.

#![cfg(test)]

use crate::client::{ClientError, ConnectionState, Connector, Invocation, RpcClient};
use crate::config::{Config, ConnectionScope};
use crate::proto::{Request, Response};
use crate::schema::{MethodPath, ProtoSchema};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tonic::Code;

// ============================================================================
// Fixtures
// ============================================================================

/// Schema compiled from the bundled `proto/calculator.proto`
pub fn calculator_schema() -> ProtoSchema {
    let proto = concat!(env!("CARGO_MANIFEST_DIR"), "/proto/calculator.proto");
    ProtoSchema::load(&[], Path::new(proto)).expect("bundled proto should compile")
}

/// Small, fast configuration for scheduling tests
pub fn test_config(vus: usize, duration: Duration, scope: ConnectionScope) -> Config {
    let mut config = Config::default();
    config.scenario.vus = vus;
    config.scenario.duration = duration;
    config.scenario.graceful_stop = Duration::from_secs(5);
    config.target.address = "mock:6000".to_string();
    config.target.connection_scope = scope;
    config
}

// ============================================================================
// Mock transport
// ============================================================================

/// One recorded transport operation, tagged with the client that made it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connect { client: usize, target: String },
    Invoke { client: usize, method: String },
    Close { client: usize },
}

#[derive(Debug, Default)]
struct Behavior {
    refuse_connections: bool,
    failures: Vec<(String, Code)>,
    call_delay: Duration,
}

/// Connector whose clients compute calculator results in memory
#[derive(Clone, Default)]
pub struct MockConnector {
    behavior: Arc<Behavior>,
    events: Arc<Mutex<Vec<TransportEvent>>>,
    next_client: Arc<AtomicUsize>,
}

impl MockConnector {
    /// Every connection succeeds and every call returns OK
    pub fn healthy() -> Self {
        Self::default()
    }

    /// Every connection attempt is refused
    pub fn unreachable() -> Self {
        Self::with_behavior(Behavior {
            refuse_connections: true,
            ..Default::default()
        })
    }

    /// `method` answers with `code` instead of a result
    pub fn failing(method: &str, code: Code) -> Self {
        Self::with_behavior(Behavior {
            failures: vec![(method.to_string(), code)],
            ..Default::default()
        })
    }

    /// Every call takes `delay` before answering
    pub fn slow(delay: Duration) -> Self {
        Self::with_behavior(Behavior {
            call_delay: delay,
            ..Default::default()
        })
    }

    fn with_behavior(behavior: Behavior) -> Self {
        Self {
            behavior: Arc::new(behavior),
            ..Default::default()
        }
    }

    /// All recorded events, in order
    pub fn events(&self) -> Vec<TransportEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Number of events matching `predicate`
    pub fn count(&self, predicate: impl Fn(&TransportEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }

    /// Number of clients handed out
    pub fn clients_created(&self) -> usize {
        self.next_client.load(Ordering::SeqCst)
    }
}

impl Connector for MockConnector {
    fn client(&self) -> Box<dyn RpcClient> {
        Box::new(MockClient {
            id: self.next_client.fetch_add(1, Ordering::SeqCst),
            state: ConnectionState::Closed,
            behavior: self.behavior.clone(),
            events: self.events.clone(),
        })
    }
}

struct MockClient {
    id: usize,
    state: ConnectionState,
    behavior: Arc<Behavior>,
    events: Arc<Mutex<Vec<TransportEvent>>>,
}

impl MockClient {
    fn push(&self, event: TransportEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl RpcClient for MockClient {
    fn state(&self) -> ConnectionState {
        self.state
    }

    async fn connect(&mut self, target: &str) -> Result<(), ClientError> {
        self.push(TransportEvent::Connect {
            client: self.id,
            target: target.to_string(),
        });
        if self.behavior.refuse_connections {
            self.state = ConnectionState::Closed;
            return Err(ClientError::Connect {
                target: target.to_string(),
                message: "connection refused".to_string(),
            });
        }
        self.state = ConnectionState::Open;
        Ok(())
    }

    async fn invoke(
        &mut self,
        method: &MethodPath,
        request: &Request,
    ) -> Result<Invocation, ClientError> {
        self.push(TransportEvent::Invoke {
            client: self.id,
            method: method.method().to_string(),
        });
        if self.state != ConnectionState::Open {
            return Err(ClientError::NotConnected);
        }
        if !self.behavior.call_delay.is_zero() {
            tokio::time::sleep(self.behavior.call_delay).await;
        }

        let latency = Duration::from_millis(1);
        if let Some((_, code)) = self
            .behavior
            .failures
            .iter()
            .find(|(name, _)| name == method.method())
        {
            return Ok(Invocation {
                status: *code,
                message: "injected failure".to_string(),
                payload: None,
                latency,
            });
        }

        let result = match method.method() {
            "Add" => request.a + request.b,
            "Subtract" => request.a - request.b,
            "Multiply" => request.a * request.b,
            "Divide" if request.b != 0 => request.a / request.b,
            _ => {
                return Ok(Invocation {
                    status: Code::InvalidArgument,
                    message: "unsupported operation".to_string(),
                    payload: None,
                    latency,
                });
            }
        };

        Ok(Invocation {
            status: Code::Ok,
            message: String::new(),
            payload: Some(Response { result }),
            latency,
        })
    }

    async fn close(&mut self) {
        self.push(TransportEvent::Close { client: self.id });
        self.state = ConnectionState::Closed;
    }
}
