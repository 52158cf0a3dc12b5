//! CSV report of per-chunk relay timings.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// CSV header written at the start of every monitored batch.
pub const REPORT_HEADER: &str = "Read Time (ns), Write Time (ns), Buffer Size (bytes)";

/// Timing of one read/write iteration of the stream monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingSample {
    /// Time blocked reading from the basecaller
    pub read: Duration,
    /// Time blocked writing to the compressor
    pub write: Duration,
    /// Bytes moved in this iteration
    pub bytes: usize,
}

/// Append-only CSV report.
#[derive(Debug, Clone)]
pub struct TimingReport {
    path: PathBuf,
}

impl TimingReport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a header and one row per sample.
    ///
    /// Losing diagnostics must not fail a basecalling run, so errors are logged
    /// and swallowed.
    pub fn append(&self, samples: &[TimingSample]) {
        match self.try_append(samples) {
            Ok(()) => tracing::debug!(
                "Appended {} timing samples to {}",
                samples.len(),
                self.path.display()
            ),
            Err(e) => tracing::warn!(
                "Failed to write timing report {}: {}",
                self.path.display(),
                e
            ),
        }
    }

    fn try_append(&self, samples: &[TimingSample]) -> std::io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut out = BufWriter::new(file);

        writeln!(out, "{}", REPORT_HEADER)?;
        for sample in samples {
            writeln!(
                out,
                "{},{},{}",
                sample.read.as_nanos(),
                sample.write.as_nanos(),
                sample.bytes
            )?;
        }
        out.flush()
    }
}
