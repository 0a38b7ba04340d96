//! Per-node agent for Kubernetes clusters whose worker fleet mixes a
//! preemptible spot auto-scaling group with an always-available on-demand
//! group. When spot capacity is reclaimed the agent pre-scales replacement
//! capacity (spot first, on-demand as fallback), protects young spot nodes
//! from the external cluster autoscaler, and retires on-demand fallback
//! nodes once the spot fleet is healthy and stable again.
//!
//! Every decision input is consumed through ports ([`client`]); persistent
//! state is carried entirely by node annotations, so an agent restart
//! resumes where its predecessor stopped without any coordination.

pub mod client;
pub mod config;
pub mod core;
pub mod sim;
pub mod spotguard;
