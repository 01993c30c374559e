//! Load test configuration
//!
//! Configuration is loaded from environment variables on top of the calculator
//! scenario defaults: 100 virtual users for 30 seconds against `localhost:6000`.

use serde::Serialize;
use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Methods invoked by every iteration, in call order
pub const DEFAULT_METHODS: [&str; 4] = ["Add", "Subtract", "Multiply", "Divide"];

/// Configuration errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("At least one virtual user is required")]
    NoVirtualUsers,

    #[error("Duration must be greater than zero")]
    ZeroDuration,

    #[error("Target address is empty")]
    EmptyTarget,

    #[error("No methods configured")]
    NoMethods,

    #[error("Invalid value for {var}: {value}")]
    InvalidValue { var: &'static str, value: String },

    #[error("Invalid duration: {0}")]
    InvalidDuration(String),

    #[error("Unknown connection scope: {0} (expected per-call or per-vu)")]
    UnknownConnectionScope(String),
}

/// How long a connection lives inside a virtual user.
///
/// `PerCall` opens and closes a connection around every single RPC, so every
/// call also pays for connection setup. `PerVu` keeps one connection for the
/// lifetime of the virtual user and only reconnects after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionScope {
    #[default]
    PerCall,
    PerVu,
}

impl FromStr for ConnectionScope {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "per-call" | "call" => Ok(ConnectionScope::PerCall),
            "per-vu" | "vu" => Ok(ConnectionScope::PerVu),
            other => Err(ConfigError::UnknownConnectionScope(other.to_string())),
        }
    }
}

impl fmt::Display for ConnectionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionScope::PerCall => f.write_str("per-call"),
            ConnectionScope::PerVu => f.write_str("per-vu"),
        }
    }
}

/// Main load test configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Virtual user scheduling
    pub scenario: ScenarioConfig,

    /// Target service and transport
    pub target: TargetConfig,

    /// Operands sent with every call
    pub request: RequestConfig,

    /// Summary and metrics outputs
    pub output: OutputConfig,
}

/// Virtual user scheduling configuration
#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    /// Number of concurrent virtual users
    pub vus: usize,
    /// Total run duration; no iteration starts after it elapses
    pub duration: Duration,
    /// Pause at the end of every iteration
    pub iteration_pause: Duration,
    /// Time in-flight iterations get to finish after the deadline
    pub graceful_stop: Duration,
}

/// Target service configuration
#[derive(Debug, Clone)]
pub struct TargetConfig {
    /// Plaintext `host:port` of the calculator service
    pub address: String,
    /// Protocol definition loaded once before the run
    pub proto_file: PathBuf,
    /// Extra directories searched for the proto file and its imports
    pub import_paths: Vec<PathBuf>,
    /// Fully qualified service name (`package.Service`)
    pub service: String,
    /// Methods invoked by every iteration, in order
    pub methods: Vec<String>,
    /// Connection establishment timeout
    pub connect_timeout: Duration,
    /// Per-call timeout
    pub request_timeout: Duration,
    /// Connection lifetime inside a virtual user
    pub connection_scope: ConnectionScope,
}

/// Request payload configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestConfig {
    pub a: i64,
    pub b: i64,
}

/// Output configuration
#[derive(Debug, Clone, Default)]
pub struct OutputConfig {
    /// Write the JSON summary here after the run
    pub summary_export: Option<PathBuf>,
    /// Serve Prometheus metrics on this address during the run
    pub prometheus_addr: Option<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scenario: ScenarioConfig::default(),
            target: TargetConfig::default(),
            request: RequestConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            vus: 100,
            duration: Duration::from_secs(30),
            iteration_pause: Duration::from_secs(1),
            graceful_stop: Duration::from_secs(30),
        }
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            address: "localhost:6000".to_string(),
            proto_file: PathBuf::from("./calculator.proto"),
            import_paths: vec![PathBuf::from("calculator")],
            service: "calculator.Calculator".to_string(),
            methods: DEFAULT_METHODS.iter().map(|m| m.to_string()).collect(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            connection_scope: ConnectionScope::PerCall,
        }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self { a: 18, b: 3 }
    }
}

impl TargetConfig {
    /// Full method names (`package.Service/Method`) in call order
    pub fn method_names(&self) -> Vec<String> {
        self.methods
            .iter()
            .map(|method| format!("{}/{}", self.service, method))
            .collect()
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// Unset or empty variables keep their defaults; set but malformed values
    /// are rejected.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        // Scenario config
        if let Some(val) = get("LOADTEST_VUS") {
            config.scenario.vus = parse_number("LOADTEST_VUS", &val)?;
        }
        if let Some(val) = get("LOADTEST_DURATION") {
            config.scenario.duration = parse_duration(&val)?;
        }
        if let Some(val) = get("LOADTEST_ITERATION_PAUSE") {
            config.scenario.iteration_pause = parse_duration(&val)?;
        }
        if let Some(val) = get("LOADTEST_GRACEFUL_STOP") {
            config.scenario.graceful_stop = parse_duration(&val)?;
        }

        // Target config
        if let Some(addr) = get("LOADTEST_TARGET") {
            config.target.address = addr.trim().to_string();
        }
        if let Some(path) = get("LOADTEST_PROTO_FILE") {
            config.target.proto_file = PathBuf::from(path);
        }
        if let Some(paths) = get("LOADTEST_IMPORT_PATHS") {
            config.target.import_paths = split_list(&paths).map(PathBuf::from).collect();
        }
        if let Some(service) = get("LOADTEST_SERVICE") {
            config.target.service = service.trim().to_string();
        }
        if let Some(methods) = get("LOADTEST_METHODS") {
            config.target.methods = split_list(&methods).map(str::to_string).collect();
        }
        if let Some(val) = get("LOADTEST_CONNECT_TIMEOUT") {
            config.target.connect_timeout = parse_duration(&val)?;
        }
        if let Some(val) = get("LOADTEST_REQUEST_TIMEOUT") {
            config.target.request_timeout = parse_duration(&val)?;
        }
        if let Some(val) = get("LOADTEST_CONNECTION_SCOPE") {
            config.target.connection_scope = val.parse()?;
        }

        // Request config
        if let Some(val) = get("LOADTEST_OPERAND_A") {
            config.request.a = parse_number("LOADTEST_OPERAND_A", &val)?;
        }
        if let Some(val) = get("LOADTEST_OPERAND_B") {
            config.request.b = parse_number("LOADTEST_OPERAND_B", &val)?;
        }

        // Output config
        if let Some(path) = get("LOADTEST_SUMMARY_EXPORT") {
            config.output.summary_export = Some(PathBuf::from(path));
        }
        if let Some(val) = get("LOADTEST_PROMETHEUS_ADDR") {
            config.output.prometheus_addr = Some(parse_number("LOADTEST_PROMETHEUS_ADDR", &val)?);
        }

        Ok(config)
    }

    /// Reject configurations that cannot produce a run
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scenario.vus == 0 {
            return Err(ConfigError::NoVirtualUsers);
        }
        if self.scenario.duration.is_zero() {
            return Err(ConfigError::ZeroDuration);
        }
        if self.target.address.trim().is_empty() {
            return Err(ConfigError::EmptyTarget);
        }
        if self.target.methods.is_empty() {
            return Err(ConfigError::NoMethods);
        }
        Ok(())
    }
}

fn parse_number<T: FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue {
            var,
            value: value.to_string(),
        })
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Parse a duration such as `30s`, `1m30s`, `500ms` or `2h`.
///
/// A bare integer is taken as seconds.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let s = input.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).map_err(|_| ConfigError::InvalidDuration(input.to_string()))
}
