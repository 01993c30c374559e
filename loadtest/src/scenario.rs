//! Calculator scenario
//!
//! One iteration calls every configured method in order with the same operand
//! pair, records the `status is OK` check for each call, then pauses.
//!
//! With the default per-call connection scope every method runs as its own
//! connect / invoke / check / close cycle. Failures never abort the iteration:
//! they fail the check and the cycle still closes its connection.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::check::{CheckRegistry, STATUS_IS_OK};
use crate::client::{ConnectionState, Connector, RpcClient};
use crate::config::{Config, ConnectionScope};
use crate::proto::Request;
use crate::schema::{MethodPath, ProtoSchema, SchemaError};
use crate::stats::RunStats;

/// Operand fields of the encoded `Request`, by name and field number
const REQUEST_FIELDS: [(&str, i32); 2] = [("a", 1), ("b", 2)];

/// Per virtual user state carried across iterations
pub struct VirtualUser {
    id: usize,
    iterations: u64,
    /// Connection kept across calls in per-VU scope
    client: Option<Box<dyn RpcClient>>,
}

impl VirtualUser {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            iterations: 0,
            client: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Completed iterations
    pub fn iterations(&self) -> u64 {
        self.iterations
    }
}

/// The calculator workload shared by all virtual users
pub struct CalculatorScenario {
    target: String,
    methods: Vec<MethodPath>,
    request: Request,
    pause: Duration,
    scope: ConnectionScope,
    connector: Arc<dyn Connector>,
    checks: Arc<CheckRegistry>,
    stats: Arc<RunStats>,
}

impl CalculatorScenario {
    /// Resolve every configured method against the loaded schema
    pub fn new(
        config: &Config,
        schema: &ProtoSchema,
        connector: Arc<dyn Connector>,
        checks: Arc<CheckRegistry>,
        stats: Arc<RunStats>,
    ) -> Result<Self, SchemaError> {
        let methods = config
            .target
            .method_names()
            .iter()
            .map(|name| {
                let method = schema.resolve(name)?;
                schema.require_integer_fields(&method, &REQUEST_FIELDS)?;
                Ok(method)
            })
            .collect::<Result<Vec<_>, SchemaError>>()?;

        Ok(Self {
            target: config.target.address.clone(),
            methods,
            request: Request::operands(config.request.a, config.request.b),
            pause: config.scenario.iteration_pause,
            scope: config.target.connection_scope,
            connector,
            checks,
            stats,
        })
    }

    /// Methods in call order
    pub fn methods(&self) -> &[MethodPath] {
        &self.methods
    }

    /// Run one iteration for `vu`.
    ///
    /// The closing pause ends early at `deadline` so a finished run does not
    /// wait out a pause that would start no further iteration.
    pub async fn run_iteration(&self, vu: &mut VirtualUser, deadline: Instant) {
        for method in &self.methods {
            match self.scope {
                ConnectionScope::PerCall => self.perform_operation(vu.id, method).await,
                ConnectionScope::PerVu => self.perform_on_vu_connection(vu, method).await,
            }
        }

        vu.iterations += 1;
        self.stats.record_iteration();

        let resume = (Instant::now() + self.pause).min(deadline);
        tokio::time::sleep_until(resume).await;
    }

    /// Release whatever the virtual user still holds
    pub async fn teardown(&self, vu: &mut VirtualUser) {
        if let Some(mut client) = vu.client.take() {
            let was_open = client.state() == ConnectionState::Open;
            client.close().await;
            if was_open {
                self.stats.record_close();
            }
        }
    }

    /// Connect, invoke, check and close with a fresh client
    async fn perform_operation(&self, vu: usize, method: &MethodPath) {
        let mut client = self.connector.client();
        self.connect(client.as_mut(), vu).await;
        self.invoke_and_check(client.as_mut(), method, vu).await;
        client.close().await;
        self.stats.record_close();
    }

    /// Invoke on the VU's long-lived client, reconnecting when it is not open
    async fn perform_on_vu_connection(&self, vu: &mut VirtualUser, method: &MethodPath) {
        let id = vu.id;
        let client = vu.client.get_or_insert_with(|| self.connector.client());
        if client.state() != ConnectionState::Open {
            self.connect(client.as_mut(), id).await;
        }

        let passed = self.invoke_and_check(client.as_mut(), method, id).await;
        if !passed && client.state() == ConnectionState::Open {
            // Start the next call on a fresh connection
            client.close().await;
            self.stats.record_close();
        }
    }

    async fn connect(&self, client: &mut dyn RpcClient, vu: usize) {
        match client.connect(&self.target).await {
            Ok(()) => self.stats.record_connect(true),
            Err(e) => {
                debug!(vu, "Connection failed: {}", e);
                self.stats.record_connect(false);
            }
        }
    }

    async fn invoke_and_check(
        &self,
        client: &mut dyn RpcClient,
        method: &MethodPath,
        vu: usize,
    ) -> bool {
        let passed = match client.invoke(method, &self.request).await {
            Ok(invocation) => {
                let passed = invocation.is_ok();
                if !passed {
                    debug!(
                        vu,
                        method = %method,
                        "Call failed with {:?}: {}",
                        invocation.status,
                        invocation.message
                    );
                }
                self.stats
                    .record_call(method.method(), Some(invocation.latency), passed);
                passed
            }
            Err(e) => {
                debug!(vu, method = %method, "Call not sent: {}", e);
                self.stats.record_call(method.method(), None, false);
                false
            }
        };

        self.checks.record(STATUS_IS_OK, passed)
    }
}
