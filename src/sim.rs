//! In-memory cloud and cluster backends implementing the agent's ports,
//! plus a YAML scenario runner. Integration tests and the binary both drive
//! the agent against these instead of real cloud APIs.

pub mod cluster;
pub mod scenario;
