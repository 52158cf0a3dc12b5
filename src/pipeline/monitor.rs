//! Timed relay between the basecaller and the compressor.
//!
//! When pipe pressure monitoring is enabled the two processes are not connected
//! directly. Instead a task copies the basecaller's stdout into the compressor's
//! stdin one block at a time, recording how long each read and each write blocked:
//!
//! ```text
//! ┌────────────┐ stdout ┌───────────────┐ stdin ┌────────────┐
//! │ basecaller │───────▶│ StreamMonitor │──────▶│ compressor │
//! └────────────┘        └───────────────┘       └────────────┘
//!                               │
//!                        chan_stats.csv
//! ```
//!
//! Long reads mean the basecaller is the bottleneck; long writes mean the
//! compressor is applying backpressure.

use crate::error::{Error, Process, Result};
use crate::io::{TimingReport, TimingSample};
use crate::pipeline::Metrics;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;

/// Readable end of the relay.
pub trait ByteSource: AsyncRead + Unpin + Send + 'static {}
impl<T: AsyncRead + Unpin + Send + 'static> ByteSource for T {}

/// Writable end of the relay.
pub trait ByteSink: AsyncWrite + Unpin + Send + 'static {}
impl<T: AsyncWrite + Unpin + Send + 'static> ByteSink for T {}

/// Timings collected by one relay, in the order they were taken.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub samples: Vec<TimingSample>,
}

impl RelayStats {
    /// Total bytes relayed.
    pub fn bytes(&self) -> u64 {
        self.samples.iter().map(|s| s.bytes as u64).sum()
    }

    /// Total time blocked reading.
    pub fn read_time(&self) -> Duration {
        self.samples.iter().map(|s| s.read).sum()
    }

    /// Total time blocked writing.
    pub fn write_time(&self) -> Duration {
        self.samples.iter().map(|s| s.write).sum()
    }
}

impl std::fmt::Display for RelayStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} bytes in {} chunks, read {:.3}s, write {:.3}s",
            self.bytes(),
            self.samples.len(),
            self.read_time().as_secs_f64(),
            self.write_time().as_secs_f64()
        )
    }
}

/// Relay that timestamps every read and write.
#[derive(Debug, Clone)]
pub struct StreamMonitor {
    buffer_size: usize,
    report: TimingReport,
    metrics: Option<Arc<Metrics>>,
}

impl StreamMonitor {
    /// Create a monitor reading `buffer_size` bytes at a time and appending to `report`.
    pub fn new(buffer_size: usize, report: TimingReport) -> Self {
        Self {
            buffer_size,
            report,
            metrics: None,
        }
    }

    /// Also feed run-wide metrics.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run [`StreamMonitor::observe`] as an independent task.
    ///
    /// The join handle is the completion signal: once it resolves the sink has
    /// been shut down or dropped.
    pub fn spawn<R, W>(self, source: R, sink: W) -> JoinHandle<Result<RelayStats>>
    where
        R: ByteSource,
        W: ByteSink,
    {
        tokio::spawn(async move { self.observe(source, sink).await })
    }

    /// Copy `source` into `sink` until end of input, then shut the sink down and
    /// write the report.
    ///
    /// Any read or write failure, or a sink that stops accepting bytes, is
    /// returned without writing the report: the relayed stream can no longer be
    /// trusted.
    pub async fn observe<R, W>(&self, mut source: R, mut sink: W) -> Result<RelayStats>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; self.buffer_size];
        let mut samples = Vec::with_capacity(10_000);

        loop {
            let read_mark = Instant::now();
            let nr = source.read(&mut buf).await.map_err(|source| Error::Relay {
                direction: "reading from",
                process: Process::Basecaller,
                source,
            })?;
            let read = read_mark.elapsed();

            if nr == 0 {
                // Close the compressor's input before touching the filesystem.
                sink.shutdown().await.map_err(|source| Error::Relay {
                    direction: "closing",
                    process: Process::Compressor,
                    source,
                })?;
                self.write_report(&samples).await;
                let stats = RelayStats { samples };
                tracing::debug!("Relay finished: {}", stats);
                return Ok(stats);
            }

            let write_mark = Instant::now();
            let nw = write_chunk(&mut sink, &buf[..nr]).await?;
            let write = write_mark.elapsed();

            if nw != nr {
                return Err(Error::ShortWrite {
                    expected: nr,
                    written: nw,
                });
            }

            if let Some(metrics) = &self.metrics {
                metrics.add_relay_chunk(nw as u64, read, write);
            }
            samples.push(TimingSample {
                read,
                write,
                bytes: nw,
            });
        }
    }

    /// Append the samples to the report on the blocking pool.
    async fn write_report(&self, samples: &[TimingSample]) {
        let report = self.report.clone();
        let rows = samples.to_vec();
        if let Err(e) = tokio::task::spawn_blocking(move || report.append(&rows)).await {
            tracing::warn!("Timing report task failed: {}", e);
        }
    }
}

/// Write `chunk` to the sink, returning how many bytes it accepted.
///
/// Pipes may take a large block in several partial writes; the count falls short
/// only when the sink reports it accepted nothing.
async fn write_chunk<W>(sink: &mut W, chunk: &[u8]) -> Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while written < chunk.len() {
        let n = sink.write(&chunk[written..]).await.map_err(|source| Error::Relay {
            direction: "writing to",
            process: Process::Compressor,
            source,
        })?;
        if n == 0 {
            break;
        }
        written += n;
    }
    Ok(written)
}
