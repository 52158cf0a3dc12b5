//! Batch scheduling over the discovered input files.
//!
//! The scheduler walks a cursor over the file list one chunk at a time:
//! stage the chunk, advance the cursor, run the batch, clear the staging
//! directory, repeat. The first failure stops the run.

use crate::error::{Error, Result};
use crate::io::{SourceFile, StagingArea};
use crate::pipeline::{Metrics, MetricsReporter, RelayStats};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Runs one staged batch to completion.
#[allow(async_fn_in_trait)]
pub trait BatchRunner {
    /// Process every file linked in `staging_dir`.
    ///
    /// Must not return until all work for the batch has finished, so the
    /// staging directory can be cleared afterwards.
    async fn run_batch(&self, batch: &Batch, staging_dir: &Path) -> Result<Option<RelayStats>>;
}

/// A window `[start, end)` of the file list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Batch {
    /// Zero-based batch number within this run
    pub index: usize,
    /// First file index
    pub start: usize,
    /// One past the last file index
    pub end: usize,
}

impl Batch {
    /// Number of files in the batch.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the batch holds no files.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Where the scheduler is in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Staging,
    Running,
    Done,
    Failed,
}

/// Cursor over the discovered files. Owned by the caller and passed into
/// [`Scheduler::run`]; the cursor only moves forward.
#[derive(Debug, Clone)]
pub struct BatchState {
    files: Vec<SourceFile>,
    cursor: usize,
    chunk_size: usize,
    batches_issued: usize,
    phase: Phase,
}

impl BatchState {
    /// Start at the first file. `chunk_size` must be at least 1.
    pub fn new(files: Vec<SourceFile>, chunk_size: usize) -> Self {
        Self {
            files,
            cursor: 0,
            chunk_size: chunk_size.max(1),
            batches_issued: 0,
            phase: Phase::Idle,
        }
    }

    /// Start at file `index` instead, skipping batches already done by an earlier run.
    pub fn resume_from(mut self, index: usize) -> Result<Self> {
        if index >= self.files.len() {
            return Err(Error::Config(format!(
                "resume index {} is past the last file ({} files found)",
                index,
                self.files.len()
            )));
        }
        self.cursor = index;
        Ok(self)
    }

    pub fn files(&self) -> &[SourceFile] {
        &self.files
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether every file has been handed to a batch.
    pub fn is_done(&self) -> bool {
        self.cursor >= self.files.len()
    }

    /// The batch starting at the cursor, if any files remain.
    pub fn peek_batch(&self) -> Option<Batch> {
        if self.is_done() {
            return None;
        }
        Some(Batch {
            index: self.batches_issued,
            start: self.cursor,
            end: (self.cursor + self.chunk_size).min(self.files.len()),
        })
    }

    /// Move the cursor past `batch`.
    pub fn advance(&mut self, batch: &Batch) {
        debug_assert!(batch.end >= self.cursor);
        self.cursor = batch.end.max(self.cursor);
        self.batches_issued += 1;
    }

    /// Files belonging to `batch`.
    pub fn files_in(&self, batch: &Batch) -> &[SourceFile] {
        &self.files[batch.start..batch.end]
    }

    /// Every batch still to run, without running anything.
    pub fn plan(&self) -> Vec<Batch> {
        let total = self.files.len();
        let mut batches = Vec::new();
        let (mut cursor, mut index) = (self.cursor, self.batches_issued);
        while cursor < total {
            let end = (cursor + self.chunk_size).min(total);
            batches.push(Batch {
                index,
                start: cursor,
                end,
            });
            cursor = end;
            index += 1;
        }
        batches
    }
}

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Enable progress reporting
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after run completes
    pub metrics_output_path: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enable_metrics: true,
            metrics_interval_secs: 60,
            metrics_output_path: None,
        }
    }
}

/// Drives batches through a [`BatchRunner`] one at a time.
pub struct Scheduler<'a, R> {
    runner: R,
    staging: &'a StagingArea,
    metrics: Arc<Metrics>,
    config: SchedulerConfig,
}

impl<'a, R: BatchRunner> Scheduler<'a, R> {
    /// Create a new scheduler.
    pub fn new(
        runner: R,
        staging: &'a StagingArea,
        metrics: Arc<Metrics>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            runner,
            staging,
            metrics,
            config,
        }
    }

    /// Process batches until the file list is exhausted or a batch fails.
    pub async fn run(&self, state: &mut BatchState) -> Result<SchedulerStats> {
        let total_files = state.files().len();
        let remaining = total_files - state.cursor();

        tracing::info!(
            "Scheduling {} files in batches of {} ({} batches)",
            remaining,
            state.chunk_size(),
            remaining.div_ceil(state.chunk_size())
        );

        // Start metrics reporter if enabled
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let reporter_handle = if self.config.enable_metrics {
            let reporter = MetricsReporter::new(
                self.metrics.clone(),
                self.config.metrics_interval_secs,
                remaining as u64,
            );
            Some(tokio::spawn(reporter.run(shutdown_rx)))
        } else {
            drop(shutdown_rx);
            None
        };

        let mut stats = SchedulerStats {
            total_files,
            ..Default::default()
        };
        let result = self.drive(state, &mut stats).await;

        // Shutdown metrics reporter
        let _ = shutdown_tx.send(()).await;
        if let Some(handle) = reporter_handle {
            let _ = handle.await;
        }

        if self.config.enable_metrics {
            let reporter = MetricsReporter::new(
                self.metrics.clone(),
                self.config.metrics_interval_secs,
                remaining as u64,
            );
            reporter.print_summary();

            if let Some(ref path) = self.config.metrics_output_path {
                let snapshot = self.metrics.snapshot();
                if let Err(e) = snapshot.save_to_file(path) {
                    tracing::warn!("Failed to save metrics to {}: {}", path, e);
                }
            }
        }

        result.map(|()| stats)
    }

    async fn drive(&self, state: &mut BatchState, stats: &mut SchedulerStats) -> Result<()> {
        let total = state.files().len();

        while let Some(batch) = state.peek_batch() {
            state.phase = Phase::Staging;
            tracing::info!(
                "=== batch {}: basecalling files {}..{} of {} ===",
                batch.index,
                batch.start,
                batch.end,
                total
            );

            if let Err(e) = self.staging.stage(state.files_in(&batch)) {
                return Err(self.fail(state, &batch, e));
            }
            self.metrics.add_files_staged(batch.len() as u64);

            // The cursor moves before the batch runs; a failed batch is not revisited.
            state.advance(&batch);
            state.phase = Phase::Running;

            let started = Instant::now();
            match self.runner.run_batch(&batch, self.staging.path()).await {
                Ok(relay) => {
                    self.metrics.add_batch_completed();
                    stats.batches_completed += 1;
                    stats.files_processed += batch.len();
                    match relay {
                        Some(relay) => tracing::info!(
                            "Batch {} done in {:.1}s, relayed {}",
                            batch.index,
                            started.elapsed().as_secs_f64(),
                            relay
                        ),
                        None => tracing::info!(
                            "Batch {} done in {:.1}s",
                            batch.index,
                            started.elapsed().as_secs_f64()
                        ),
                    }
                }
                Err(e) => return Err(self.fail(state, &batch, e)),
            }

            if !state.is_done() {
                if let Err(e) = self.staging.clear() {
                    state.phase = Phase::Failed;
                    return Err(e);
                }
            }
        }

        state.phase = Phase::Done;
        Ok(())
    }

    fn fail(&self, state: &mut BatchState, batch: &Batch, source: Error) -> Error {
        state.phase = Phase::Failed;
        self.metrics.add_batch_failed();
        Error::BatchFailed {
            index: batch.index,
            start: batch.start,
            end: batch.end,
            source: Box::new(source),
        }
    }
}

/// Statistics from a scheduler run.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    /// Files discovered
    pub total_files: usize,

    /// Batches whose processes exited successfully
    pub batches_completed: usize,

    /// Files in completed batches
    pub files_processed: usize,
}

impl std::fmt::Display for SchedulerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Batches: {}, Files: {} of {}",
            self.batches_completed, self.files_processed, self.total_files
        )
    }
}
