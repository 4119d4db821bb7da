//! autosync MySQL - database dumps and binary log shipping
//!
//! Provides:
//! - [`dump::MysqlDumpProducer`] - runs `mysqldump`, falling back to
//!   replaying the binary logs through `mysqlbinlog`
//! - [`scheduler::MysqlDumpScheduler`] - periodic, coalesced dump jobs and
//!   publication of the latest dump location
//! - [`binlog::BinlogRotationDetector`] - ships sealed binary log segments
//!
//! Produced dumps are ordinary files in a watched folder; they reach the
//! bucket through the same coordinator as everything else.

pub mod binlog;
pub mod dump;
pub mod scheduler;

use std::path::PathBuf;

use thiserror::Error;

use autosync_core::domain::StoreError;

pub use binlog::BinlogRotationDetector;
pub use dump::MysqlDumpProducer;
pub use scheduler::{DumpTrigger, MysqlDumpScheduler};

/// Errors raised while producing or publishing dumps
#[derive(Debug, Error)]
pub enum DumpError {
    /// The client program could not be started
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The client program exited unsuccessfully
    #[error("{program} exited with {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },

    /// No binary log listed in any index file exists on disk
    #[error("No binary logs found under {0}")]
    NoBinaryLogs(PathBuf),

    /// The monitor has no `dumps` section
    #[error("Database {0} has no dump schedule")]
    NotScheduled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Writing the latest dump location failed
    #[error("Parameter store error: {0}")]
    Parameter(#[from] StoreError),
}
