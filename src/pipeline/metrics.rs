//! Run-wide counters and progress reporting.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

const MIB: f64 = 1024.0 * 1024.0;

/// Metrics for a run.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Files linked into the staging directory
    pub files_staged: AtomicU64,

    /// Batches whose processes both exited successfully
    pub batches_completed: AtomicU64,

    /// Batches that failed
    pub batches_failed: AtomicU64,

    /// Bytes appended to the output artifact
    pub output_bytes: AtomicU64,

    /// Bytes relayed by the stream monitor
    pub bytes_relayed: AtomicU64,

    /// Read/write iterations performed by the stream monitor
    pub relay_chunks: AtomicU64,

    /// Start time
    start_time: Option<Instant>,

    // Per-component timing (in microseconds for precision)
    /// Time from batch start until the basecaller exited (microseconds)
    pub basecall_us: AtomicU64,

    /// Time the compressor kept running after the basecaller exited (microseconds)
    pub compress_tail_us: AtomicU64,

    /// Time the monitor spent blocked reading (microseconds)
    pub relay_read_us: AtomicU64,

    /// Time the monitor spent blocked writing (microseconds)
    pub relay_write_us: AtomicU64,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    /// Record files staged for a batch.
    pub fn add_files_staged(&self, count: u64) {
        self.files_staged.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a completed batch.
    pub fn add_batch_completed(&self) {
        self.batches_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed batch.
    pub fn add_batch_failed(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record bytes appended to the output artifact.
    pub fn add_output_bytes(&self, bytes: u64) {
        self.output_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record one monitor iteration.
    pub fn add_relay_chunk(&self, bytes: u64, read: Duration, write: Duration) {
        self.relay_chunks.fetch_add(1, Ordering::Relaxed);
        self.bytes_relayed.fetch_add(bytes, Ordering::Relaxed);
        self.relay_read_us.fetch_add(read.as_micros() as u64, Ordering::Relaxed);
        self.relay_write_us.fetch_add(write.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record time until the basecaller exited (in microseconds).
    pub fn add_basecall_time(&self, duration: Duration) {
        self.basecall_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record time the compressor ran after the basecaller exited (in microseconds).
    pub fn add_compress_tail_time(&self, duration: Duration) {
        self.compress_tail_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Get output throughput in MiB/s.
    pub fn output_throughput_mibps(&self) -> f64 {
        let bytes = self.output_bytes.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            bytes as f64 / MIB / elapsed
        } else {
            0.0
        }
    }

    /// Get files basecalled per minute.
    pub fn files_per_minute(&self) -> f64 {
        let files = self.files_staged.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            files as f64 * 60.0 / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let to_secs = |us: &AtomicU64| us.load(Ordering::Relaxed) as f64 / 1_000_000.0;

        MetricsSnapshot {
            files_staged: self.files_staged.load(Ordering::Relaxed),
            batches_completed: self.batches_completed.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            output_bytes: self.output_bytes.load(Ordering::Relaxed),
            bytes_relayed: self.bytes_relayed.load(Ordering::Relaxed),
            relay_chunks: self.relay_chunks.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            output_throughput_mibps: self.output_throughput_mibps(),
            files_per_minute: self.files_per_minute(),
            basecall_secs: to_secs(&self.basecall_us),
            compress_tail_secs: to_secs(&self.compress_tail_us),
            relay_read_secs: to_secs(&self.relay_read_us),
            relay_write_secs: to_secs(&self.relay_write_us),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub files_staged: u64,
    pub batches_completed: u64,
    pub batches_failed: u64,
    pub output_bytes: u64,
    pub bytes_relayed: u64,
    pub relay_chunks: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub output_throughput_mibps: f64,
    pub files_per_minute: f64,
    /// Wall time until the basecaller exited, summed over batches
    pub basecall_secs: f64,
    /// Wall time the compressor outlived the basecaller, summed over batches
    pub compress_tail_secs: f64,
    /// Time the monitor was blocked on the basecaller
    pub relay_read_secs: f64,
    /// Time the monitor was blocked on the compressor
    pub relay_write_secs: f64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }

    /// Share of monitored time spent waiting on the compressor, if anything was relayed.
    pub fn write_pressure_pct(&self) -> Option<f64> {
        let total = self.relay_read_secs + self.relay_write_secs;
        (total > 0.0).then(|| self.relay_write_secs / total * 100.0)
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Batches: {} done, {} failed | Files: {} @ {:.1}/min | \
             Output: {:.1} MiB @ {:.2} MiB/s | Elapsed: {:.1}s",
            self.batches_completed,
            self.batches_failed,
            self.files_staged,
            self.files_per_minute,
            self.output_bytes as f64 / MIB,
            self.output_throughput_mibps,
            self.elapsed.as_secs_f64(),
        )?;

        if let Some(write_pct) = self.write_pressure_pct() {
            write!(
                f,
                " | Relay: {:.1} MiB, blocked on compressor {:.0}%",
                self.bytes_relayed as f64 / MIB,
                write_pct
            )?;
        }
        Ok(())
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
    total_files: u64,
}

impl MetricsReporter {
    /// Create a new metrics reporter.
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64, total_files: u64) -> Self {
        Self {
            metrics,
            interval_secs,
            total_files,
        }
    }

    /// Start the periodic reporter.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs));
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    tracing::info!("[{:.1}%] {}", self.progress_pct(&snapshot), snapshot);
                }
                _ = shutdown.recv() => {
                    break;
                }
            }
        }
    }

    fn progress_pct(&self, snapshot: &MetricsSnapshot) -> f64 {
        if self.total_files > 0 {
            snapshot.files_staged as f64 / self.total_files as f64 * 100.0
        } else {
            0.0
        }
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        let snapshot = self.metrics.snapshot();

        println!("\n=== Basecalling Summary ===");
        println!("Total time: {:.1}s", snapshot.elapsed.as_secs_f64());
        println!("Files: {} of {}", snapshot.files_staged, self.total_files);
        println!("Batches completed: {}", snapshot.batches_completed);
        println!("Batches failed: {}", snapshot.batches_failed);
        println!("Output written: {:.2} MiB", snapshot.output_bytes as f64 / MIB);
        println!("Output throughput: {:.2} MiB/s", snapshot.output_throughput_mibps);
        println!("Rate: {:.1} files/min", snapshot.files_per_minute);

        let total_process = snapshot.basecall_secs + snapshot.compress_tail_secs;
        if total_process > 0.0 {
            println!("\n--- Process Time Breakdown ---");
            println!("Basecaller:       {:>9.1}s ({:>5.1}%)", snapshot.basecall_secs, snapshot.basecall_secs / total_process * 100.0);
            println!("Compressor tail:  {:>9.1}s ({:>5.1}%)", snapshot.compress_tail_secs, snapshot.compress_tail_secs / total_process * 100.0);
        }

        if let Some(write_pct) = snapshot.write_pressure_pct() {
            println!("\n--- Pipe Pressure ---");
            println!("Relayed: {:.2} MiB in {} chunks", snapshot.bytes_relayed as f64 / MIB, snapshot.relay_chunks);
            println!("Blocked reading (basecaller):  {:>9.3}s ({:>5.1}%)", snapshot.relay_read_secs, 100.0 - write_pct);
            println!("Blocked writing (compressor):  {:>9.3}s ({:>5.1}%)", snapshot.relay_write_secs, write_pct);
        }
        println!("===========================\n");
    }
}
