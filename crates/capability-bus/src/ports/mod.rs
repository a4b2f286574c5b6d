//! Ports (hexagonal architecture).
//!
//! - `inbound`: what the bus offers to workflow engines and capabilities
//! - `outbound`: what the bus needs from the host node

pub mod inbound;
pub mod outbound;

pub use inbound::*;
pub use outbound::*;
