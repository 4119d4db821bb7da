//! Port definitions (hexagonal architecture interfaces)
//!
//! Ports are the boundaries the sync engine drives; their implementations
//! live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`RemoteObjectStore`] - GET/PUT/COPY/HEAD/DELETE/LIST against a bucket
//! - [`ParameterStore`] - key/value store for the latest dump location
//! - [`DumpProducer`] - external database client that materializes dumps
//!
//! [`memory`] provides in-process implementations of the store ports.

pub mod dump_producer;
pub mod memory;
pub mod object_store;
pub mod parameter_store;

pub use dump_producer::DumpProducer;
pub use memory::{MemoryObjectStore, MemoryParameterStore, StoreOperation};
pub use object_store::{ObjectLocation, RemoteObjectStore};
pub use parameter_store::ParameterStore;
