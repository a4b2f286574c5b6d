//! # Capability Bus Test Suite
//!
//! Multi-node tests that wire real dispatchers together over the
//! in-memory network.
//!
//! ## Structure
//!
//! ```text
//! tests/
//! ├── benches/          # Criterion benchmarks for hot paths
//! └── src/integration/
//!     ├── dispatch.rs          # Routing and error replies between nodes
//!     ├── executable_flows.rs  # Client ⇄ server execute across two DONs
//!     └── trigger_flows.rs     # Subscriber ⇄ publisher across two DONs
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p capbus-tests
//! cargo bench -p capbus-tests
//! ```

#![allow(dead_code)]

pub mod integration;
