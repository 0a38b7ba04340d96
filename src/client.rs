//! Ports consumed by the agent: cloud auto-scaling, Kubernetes API, node
//! drain routines and the instance metadata service. Production adapters
//! live outside this crate; the in-memory backends in [`crate::sim`]
//! implement the same traits for tests and scenarios.

pub mod asg;
pub mod k8s;
pub mod metadata;
pub mod node_ops;
