//! Reverse-proxy core
//!
//! This library provides:
//! - The upstream request forwarder (pooled client, header filtering,
//!   bounded timeout)
//! - The proxy router: identifier lookup, longest-endpoint-prefix match,
//!   live-pod resolution, forwarding

pub mod forwarder;
pub mod router;

pub use forwarder::RequestForwarder;
pub use router::{match_endpoint, ProxyRouter};
