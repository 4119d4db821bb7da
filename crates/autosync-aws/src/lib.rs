//! autosync AWS - S3 and SSM Parameter Store adapters
//!
//! Implements the store ports of `autosync-core` on top of the official
//! AWS SDK:
//!
//! - [`s3::S3ObjectStore`] - [`RemoteObjectStore`](autosync_core::ports::RemoteObjectStore)
//! - [`ssm::SsmParameterStore`] - [`ParameterStore`](autosync_core::ports::ParameterStore)
//!
//! ## Modules
//!
//! - [`clients`] - SDK configuration and per-role client cache
//! - [`error`] - Maps SDK failures onto [`StoreError`](autosync_core::domain::errors::StoreError)
//!
//! The adapters never retry on their own; SDK retries are disabled and the
//! sync engine applies its own backoff to transient failures.

pub mod clients;
pub mod error;
pub mod s3;
pub mod ssm;

pub use clients::{endpoint_config, environment_config, ClientCache};
pub use s3::S3ObjectStore;
pub use ssm::SsmParameterStore;
