//! Pod inventory access
//!
//! This library provides:
//! - The transient, read-only pod snapshot model
//! - The `PodResolver` seam the proxy and API consume
//! - A Kubernetes-backed resolver with identifier-candidate derivation

pub mod pod;
pub mod resolver;

pub use pod::PodInfo;
pub use resolver::{KubePodResolver, PodResolver, PodSelector};
