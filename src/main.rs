//! podpipe CLI
//!
//! Basecall a directory of raw-signal files in bounded batches, compressing the
//! records into a single appended artifact.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use podpipe::{build_runtime, plan_batches, run_pipeline, Config, Error};

#[derive(Parser, Debug)]
#[command(name = "podpipe")]
#[command(about = "Basecall raw-signal files in batches and append compressed reads", long_about = None)]
struct Cli {
    /// Directory searched recursively for input files
    #[arg(long = "in", value_name = "DIR")]
    input: Option<PathBuf>,

    /// Path to the basecaller executable
    #[arg(long, value_name = "PATH")]
    dorado: Option<PathBuf>,

    /// Output artifact, appended to by every batch
    #[arg(long, value_name = "PATH")]
    out: Option<PathBuf>,

    /// Files per batch [default: 50]
    #[arg(long, value_name = "N")]
    chunk: Option<usize>,

    /// Relay through the stream monitor and write per-chunk pipe timings
    #[arg(long)]
    monitor_pressure: bool,

    /// Optional YAML or JSON configuration file; flags take precedence
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Compressor executable [default: zstd]
    #[arg(long, value_name = "PATH")]
    compressor: Option<PathBuf>,

    /// Basecaller model [default: hac]
    #[arg(long, value_name = "NAME")]
    model: Option<String>,

    /// Scratch directory for batch symlinks; must not exist [default: tmpdir]
    #[arg(long, value_name = "DIR")]
    staging_dir: Option<PathBuf>,

    /// Pipe timing report [default: chan_stats.csv]
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,

    /// Input file extension, without the dot [default: pod5]
    #[arg(long, value_name = "EXT")]
    extension: Option<String>,

    /// Index of the first file to process
    #[arg(long, value_name = "N")]
    resume_from: Option<usize>,

    /// Save the final metrics snapshot as JSON
    #[arg(long, value_name = "PATH")]
    metrics_output: Option<String>,

    /// Disable periodic progress reporting
    #[arg(long)]
    no_metrics: bool,

    /// Print the batch plan without running anything
    #[arg(long)]
    dry_run: bool,

    /// Print the merged configuration as YAML and exit
    #[arg(long)]
    print_config: bool,
}

impl Cli {
    /// Load the config file, if any, and apply the flags over it.
    fn to_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("loading configuration from {}", path.display()))?,
            None => Config::default(),
        };

        if let Some(dir) = &self.input {
            config.input.dir = Some(dir.clone());
        }
        if let Some(dorado) = &self.dorado {
            config.basecaller.program = Some(dorado.clone());
        }
        if let Some(out) = &self.out {
            config.output.path = Some(out.clone());
        }
        if let Some(chunk) = self.chunk {
            config.processing.chunk_size = chunk;
        }
        if self.monitor_pressure {
            config.monitor.enabled = true;
        }
        if let Some(compressor) = &self.compressor {
            config.compressor.program = compressor.clone();
        }
        if let Some(model) = &self.model {
            config.basecaller.model = model.clone();
        }
        if let Some(dir) = &self.staging_dir {
            config.output.staging_dir = dir.clone();
        }
        if let Some(report) = &self.report {
            config.monitor.report_path = report.clone();
        }
        if let Some(extension) = &self.extension {
            config.input.extension = extension.clone();
        }
        if let Some(index) = self.resume_from {
            config.processing.resume_from = index;
        }
        if let Some(path) = &self.metrics_output {
            config.processing.metrics_output_path = Some(path.clone());
        }
        if self.no_metrics {
            config.processing.enable_metrics = false;
        }

        Ok(config)
    }
}

fn main() -> ExitCode {
    // Logs share stderr with the basecaller's and compressor's own output
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            if stream_untrusted(&e) {
                tracing::error!(
                    "The relayed stream was cut mid-batch; the last frame appended to the output may be truncated"
                );
            }
            exit_code(&e)
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = cli.to_config()?;

    if cli.print_config {
        print!("{}", config.to_yaml()?);
        return Ok(());
    }

    config.validate()?;

    if cli.dry_run {
        tracing::info!("Dry run mode - planning batches without processing");
        return print_plan(&config);
    }

    let runtime = build_runtime(config.processing.worker_threads)
        .context("failed to build Tokio runtime")?;
    runtime.block_on(run_pipeline(config))?;

    Ok(())
}

fn print_plan(config: &Config) -> Result<()> {
    let (state, plan) = plan_batches(config)?;
    let files = state.files();

    println!("\n=== Batch Plan ===");
    println!(
        "Input files: {} (.{} under {})",
        files.len(),
        config.input.extension,
        config.input_dir().display()
    );
    println!("Starting at file: {}", state.cursor());
    println!("Batches: {} of up to {} files", plan.len(), state.chunk_size());
    for batch in &plan {
        let batch_files = state.files_in(batch);
        let first = batch_files.first().map(|f| f.name.as_str()).unwrap_or("");
        let last = batch_files.last().map(|f| f.name.as_str()).unwrap_or("");
        println!(
            "  batch {}: files {}..{} ({} .. {})",
            batch.index, batch.start, batch.end, first, last
        );
    }

    let args = config.basecaller.args(&config.output.staging_dir);
    println!("\n=== Commands ===");
    println!(
        "{} {} | {} {} >> {}",
        config.basecaller_program().display(),
        args.iter()
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" "),
        config.compressor.program.display(),
        config.compressor.args.join(" "),
        config.output_path().display()
    );
    if config.monitor.enabled {
        println!("Pipe timings: {}", config.monitor.report_path.display());
    }
    println!("==================\n");

    Ok(())
}

/// Whether the failure broke the pipe between basecaller and compressor.
fn stream_untrusted(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Error>()
        .is_some_and(Error::is_stream_integrity)
}

/// Configuration problems exit with 2, everything else with 1.
fn exit_code(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<Error>() {
        Some(Error::Config(_)) => ExitCode::from(2),
        _ => ExitCode::FAILURE,
    }
}
