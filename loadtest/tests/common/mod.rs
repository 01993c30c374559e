//! Common Test Utilities for Integration Tests
//!
//! Starts an in-process calculator service on an ephemeral port so the runner
//! can be exercised over a real plaintext gRPC connection.

#![allow(dead_code)]

use calculator_loadtest::Config;
use calculator_loadtest::proto::calculator_server::{Calculator, CalculatorServer};
use calculator_loadtest::proto::{Request as CalcRequest, Response as CalcResponse};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{Code, Status};

/// Path of the bundled calculator protocol definition
pub fn bundled_proto() -> PathBuf {
    PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/proto/calculator.proto"))
}

/// An address nothing is listening on
pub fn unused_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// Short run against `target` using the bundled proto
pub fn short_run_config(target: &str, vus: usize) -> Config {
    let mut config = Config::default();
    config.scenario.vus = vus;
    config.scenario.duration = Duration::from_secs(1);
    config.scenario.iteration_pause = Duration::from_millis(100);
    config.scenario.graceful_stop = Duration::from_secs(5);
    config.target.address = target.to_string();
    config.target.proto_file = bundled_proto();
    config.target.import_paths = Vec::new();
    config.target.connect_timeout = Duration::from_millis(500);
    config.target.request_timeout = Duration::from_secs(2);
    config
}

/// Calculator service with optional injected failures
#[derive(Clone, Default)]
pub struct TestCalculator {
    failing: Option<(&'static str, Code)>,
    calls: Arc<AtomicU64>,
}

impl TestCalculator {
    pub fn healthy() -> Self {
        Self::default()
    }

    /// `method` always answers with `code`
    pub fn failing(method: &'static str, code: Code) -> Self {
        Self {
            failing: Some((method, code)),
            ..Default::default()
        }
    }

    fn answer(
        &self,
        method: &str,
        request: tonic::Request<CalcRequest>,
        op: impl FnOnce(i64, i64) -> Option<i64>,
    ) -> Result<tonic::Response<CalcResponse>, Status> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some((name, code)) = self.failing
            && name == method
        {
            return Err(Status::new(code, "injected failure"));
        }

        let CalcRequest { a, b } = request.into_inner();
        op(a, b)
            .map(|result| tonic::Response::new(CalcResponse { result }))
            .ok_or_else(|| Status::invalid_argument("division by zero"))
    }
}

#[tonic::async_trait]
impl Calculator for TestCalculator {
    async fn add(
        &self,
        request: tonic::Request<CalcRequest>,
    ) -> Result<tonic::Response<CalcResponse>, Status> {
        self.answer("Add", request, |a, b| a.checked_add(b))
    }

    async fn subtract(
        &self,
        request: tonic::Request<CalcRequest>,
    ) -> Result<tonic::Response<CalcResponse>, Status> {
        self.answer("Subtract", request, |a, b| a.checked_sub(b))
    }

    async fn multiply(
        &self,
        request: tonic::Request<CalcRequest>,
    ) -> Result<tonic::Response<CalcResponse>, Status> {
        self.answer("Multiply", request, |a, b| a.checked_mul(b))
    }

    async fn divide(
        &self,
        request: tonic::Request<CalcRequest>,
    ) -> Result<tonic::Response<CalcResponse>, Status> {
        self.answer("Divide", request, |a, b| a.checked_div(b))
    }
}

/// Running calculator server, stopped on `shutdown`
pub struct TestServer {
    pub addr: SocketAddr,
    calls: Arc<AtomicU64>,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(calculator: TestCalculator) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let calls = calculator.calls.clone();
        let (shutdown, rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(CalculatorServer::new(calculator))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                    rx.await.ok();
                })
                .await
                .unwrap();
        });

        Self {
            addr,
            calls,
            shutdown,
            handle,
        }
    }

    /// `host:port` target string
    pub fn target(&self) -> String {
        self.addr.to_string()
    }

    /// Calls answered so far, including injected failures
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        let _ = self.handle.await;
    }
}
