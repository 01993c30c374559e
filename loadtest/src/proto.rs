//! Protobuf types generated from `proto/calculator.proto`
//!
//! The runner only needs the `Request`/`Response` messages; the server trait
//! backs the in-process calculator used by the integration tests.

include!(concat!(env!("OUT_DIR"), "/calculator.rs"));

impl Request {
    /// Build the operand pair sent to every calculator method
    pub fn operands(a: i64, b: i64) -> Self {
        Self { a, b }
    }
}
