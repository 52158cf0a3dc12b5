//! Error types for the batching pipeline.
//!
//! Every failure is returned as a typed [`Error`] up to the binary, which logs it,
//! lets the staging directory clean itself up and picks the exit code.

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The two external processes a batch runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Process {
    /// The basecaller producing sequence records on stdout.
    Basecaller,
    /// The compressor consuming those records on stdin.
    Compressor,
}

impl std::fmt::Display for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Process::Basecaller => f.write_str("basecaller"),
            Process::Compressor => f.write_str("compressor"),
        }
    }
}

/// Errors produced while discovering, staging and running batches.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration could not be loaded or failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// IO failure outside of staging and relaying.
    #[error("{operation} failed for {}", path.display())]
    Io {
        /// Operation that triggered the failure.
        operation: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },

    /// Discovery found nothing to process.
    #[error("no files found with .{extension} extension under {}", root.display())]
    NoInputFiles {
        /// Root that was scanned.
        root: PathBuf,
        /// Extension that was searched for.
        extension: String,
    },

    /// The staging directory could not be created.
    #[error("could not create staging directory {}", path.display())]
    Setup {
        /// Staging directory path.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },

    /// A symlink could not be created or removed in the staging directory.
    #[error("error staging {}", link.display())]
    Staging {
        /// Link path inside the staging directory.
        link: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },

    /// An external process could not be started.
    #[error("failed to start {process} ({})", program.display())]
    Spawn {
        /// Which process failed.
        process: Process,
        /// Executable that was launched.
        program: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },

    /// An external process exited unsuccessfully.
    #[error("{process} exited with {status}")]
    ProcessFailed {
        /// Which process failed.
        process: Process,
        /// Exit status reported by the OS.
        status: ExitStatus,
    },

    /// Waiting on an external process returned an IO error.
    #[error("error waiting for {process}")]
    Wait {
        /// Which process was being waited on.
        process: Process,
        /// Underlying IO error.
        source: io::Error,
    },

    /// The relay wrote fewer bytes to the compressor than it read from the basecaller.
    #[error("wrote {written} bytes to the compressor but read {expected} from the basecaller")]
    ShortWrite {
        /// Bytes read from the source.
        expected: usize,
        /// Bytes accepted by the sink.
        written: usize,
    },

    /// The relay hit an unexpected read or write failure.
    #[error("error {direction} {process} stream")]
    Relay {
        /// `"reading from"`, `"writing to"` or `"closing"`.
        direction: &'static str,
        /// Process on the other end of the pipe.
        process: Process,
        /// Underlying IO error.
        source: io::Error,
    },

    /// The relay task panicked or was cancelled.
    #[error("stream monitor task failed")]
    MonitorPanicked(#[source] tokio::task::JoinError),

    /// A batch failed; no further batches are run.
    #[error("batch {index} (files {start}..{end}) failed; resume with --resume-from {start}")]
    BatchFailed {
        /// Zero-based batch number.
        index: usize,
        /// First file index of the batch.
        start: usize,
        /// One past the last file index of the batch.
        end: usize,
        /// What went wrong.
        source: Box<Error>,
    },
}

impl Error {
    /// Whether the error means the piped data can no longer be trusted.
    pub fn is_stream_integrity(&self) -> bool {
        match self {
            Error::ShortWrite { .. } | Error::Relay { .. } | Error::MonitorPanicked(_) => true,
            Error::BatchFailed { source, .. } => source.is_stream_integrity(),
            _ => false,
        }
    }
}
