//! autosync core - domain logic and port definitions
//!
//! This crate contains:
//! - **Configuration** - the YAML/JSON document describing watched folders and
//!   monitored databases, with validation
//! - **Domain types** - `WatchedFolder`, `FilterEngine`, `FileRecord`,
//!   `RemoteObjectRecord`, `SyncDecision`, `BackupRecord`, `DbMonitor`, `DumpJob`
//! - **Port definitions** - traits for adapters: `RemoteObjectStore`,
//!   `ParameterStore`, `DumpProducer`
//!
//! # Architecture
//!
//! The domain module holds pure logic with no I/O. Ports define the
//! boundaries that adapter crates (`autosync-aws`, `autosync-mysql`)
//! implement and that the sync engine drives.

pub mod config;
pub mod domain;
pub mod ports;
