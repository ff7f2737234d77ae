//! Core mapping registry functionality
//!
//! This library provides:
//! - Endpoint and owner-key normalization used as mapping keys
//! - The persisted Mapping data model
//! - The durable, concurrently-safe mapping store
//! - The shared error taxonomy

pub mod endpoint;
pub mod error;
pub mod identity;
pub mod mapping;
pub mod store;

pub use endpoint::normalize_endpoint;
pub use error::{CoreError, Result};
pub use identity::owner_key;
pub use mapping::{Mapping, MappingDocument};
pub use store::{LoadOutcome, MappingStore, StorePaths};
