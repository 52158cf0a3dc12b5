//! podpipe
//!
//! Batch basecalling of raw-signal (`.pod5`) files: `dorado basecaller | zstd >> out`,
//! one bounded batch of inputs at a time.
//!
//! # Architecture
//!
//! The pipeline consists of:
//!
//! - **I/O**: input discovery, the symlink staging directory and the timing report
//! - **Pipeline**: the batch scheduler, the basecaller/compressor stage and the
//!   optional stream monitor that measures pipe pressure between them
//!
//! # Usage
//!
//! ```no_run
//! use podpipe::{Config, run_pipeline};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file("podpipe.yaml".as_ref())?;
//!     run_pipeline(config).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod io;
pub mod pipeline;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Config;
pub use error::{Error, Process, Result};
pub use io::{discover, SourceFile, StagingArea, TimingReport, TimingSample};
pub use pipeline::{
    Batch, BatchRunner, BatchState, Metrics, PipelineStage, RelayStats, Scheduler,
    SchedulerConfig, SchedulerStats, StreamMonitor, Wiring,
};

/// Run every batch described by `config`.
///
/// The staging directory is created after discovery succeeds and removed before
/// this returns, whether the run succeeded or not.
pub async fn run_pipeline(config: Config) -> Result<SchedulerStats> {
    config.validate()?;

    tracing::info!("Starting batch basecalling");

    let mut state = initial_state(&config)?;

    let staging = StagingArea::create(&config.output.staging_dir)?;

    let metrics = Metrics::new();
    let stage = PipelineStage::new(&config, metrics.clone());

    match stage.wiring() {
        Wiring::Direct => tracing::info!(
            "Piping {} into {} >> {}",
            config.basecaller_program().display(),
            config.compressor.program.display(),
            config.output_path().display()
        ),
        Wiring::Monitored(_) => tracing::info!(
            "Relaying {} into {} >> {}, pipe timings to {}",
            config.basecaller_program().display(),
            config.compressor.program.display(),
            config.output_path().display(),
            config.monitor.report_path.display()
        ),
    }

    let scheduler_config = SchedulerConfig {
        enable_metrics: config.processing.enable_metrics,
        metrics_interval_secs: config.processing.metrics_interval_secs,
        metrics_output_path: config.processing.metrics_output_path.clone(),
    };
    let scheduler = Scheduler::new(stage, &staging, metrics, scheduler_config);

    let stats = scheduler.run(&mut state).await?;
    tracing::info!("Run complete: {}", stats);

    Ok(stats)
}

/// Discover the inputs and return the batches a run would execute.
pub fn plan_batches(config: &Config) -> Result<(BatchState, Vec<Batch>)> {
    config.validate()?;
    let state = initial_state(config)?;
    let plan = state.plan();
    Ok((state, plan))
}

fn initial_state(config: &Config) -> Result<BatchState> {
    let files = discover(config.input_dir(), &config.input.extension)?;
    let state = BatchState::new(files, config.processing.chunk_size);
    if config.processing.resume_from > 0 {
        tracing::info!("Resuming from file {}", config.processing.resume_from);
        state.resume_from(config.processing.resume_from)
    } else {
        Ok(state)
    }
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> std::io::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    builder.build()
}
