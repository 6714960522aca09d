//! Strata Cache Storage Layer
//!
//! This crate provides the persisted-record abstraction behind the disk tier,
//! with a local filesystem backend that writes every record atomically.

pub mod backend;
pub mod error;
pub mod local;

pub use backend::StorageBackend;
pub use error::StorageError;
pub use local::LocalStorage;
