//! One batch through the basecaller and the compressor.
//!
//! ```text
//! Direct:     basecaller ──────────────────▶ compressor >> output
//! Monitored:  basecaller ──▶ StreamMonitor ──▶ compressor >> output
//! ```
//!
//! Both processes inherit our stderr. The output artifact is opened in append
//! mode for every batch, so each batch adds one or more compressed frames to the
//! end of the same file.

use crate::config::{BasecallerConfig, CompressorConfig, Config};
use crate::error::{Error, Process, Result};
use crate::io::TimingReport;
use crate::pipeline::{Batch, BatchRunner, Metrics, RelayStats, StreamMonitor};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Instant;
use tokio::process::{Child, Command};

/// How the basecaller's stdout reaches the compressor's stdin.
#[derive(Debug, Clone)]
pub enum Wiring {
    /// The compressor reads straight from the basecaller's stdout pipe.
    Direct,
    /// A [`StreamMonitor`] task relays and times every block.
    Monitored(StreamMonitor),
}

/// Runs the basecaller/compressor pair for one staged batch.
#[derive(Debug, Clone)]
pub struct PipelineStage {
    basecaller: PathBuf,
    basecaller_config: BasecallerConfig,
    compressor: CompressorConfig,
    output_path: PathBuf,
    wiring: Wiring,
    metrics: Arc<Metrics>,
}

impl PipelineStage {
    /// Build the stage from a validated configuration.
    pub fn new(config: &Config, metrics: Arc<Metrics>) -> Self {
        let wiring = if config.monitor.enabled {
            Wiring::Monitored(
                StreamMonitor::new(
                    config.monitor.buffer_size,
                    TimingReport::new(&config.monitor.report_path),
                )
                .with_metrics(metrics.clone()),
            )
        } else {
            Wiring::Direct
        };

        Self {
            basecaller: config.basecaller_program().to_path_buf(),
            basecaller_config: config.basecaller.clone(),
            compressor: config.compressor.clone(),
            output_path: config.output_path().to_path_buf(),
            wiring,
            metrics,
        }
    }

    pub fn wiring(&self) -> &Wiring {
        &self.wiring
    }

    /// Basecall every file in `staging_dir` and append the compressed records
    /// to the output artifact.
    ///
    /// Returns only after both processes (and the monitor, if any) have
    /// finished, so the batch's output is complete and the artifact closed.
    pub async fn run(&self, staging_dir: &Path) -> Result<Option<RelayStats>> {
        let started = Instant::now();

        let output = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.output_path)
            .map_err(|source| Error::Io {
                operation: "open output",
                path: self.output_path.clone(),
                source,
            })?;
        let size_before = tokio::fs::metadata(&self.output_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        let mut basecaller = Command::new(&self.basecaller)
            .args(self.basecaller_config.args(staging_dir))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| Error::Spawn {
                process: Process::Basecaller,
                program: self.basecaller.clone(),
                source,
            })?;
        tracing::debug!(
            "Started {} (pid {:?}) on {}",
            self.basecaller.display(),
            basecaller.id(),
            staging_dir.display()
        );

        let basecaller_out = match basecaller.stdout.take() {
            Some(stdout) => stdout,
            None => {
                reap(&mut basecaller).await;
                return Err(self.spawn_error(
                    Process::Basecaller,
                    io::Error::other("stdout was not captured"),
                ));
            }
        };

        let wired = match &self.wiring {
            Wiring::Direct => match basecaller_out.try_into() {
                Ok(stdin) => self.spawn_compressor(stdin, output).map(|c| (c, None)),
                Err(e) => Err(self.spawn_error(Process::Compressor, e)),
            },
            Wiring::Monitored(monitor) => {
                self.spawn_compressor(Stdio::piped(), output)
                    .and_then(|mut compressor| match compressor.stdin.take() {
                        Some(stdin) => {
                            let relay = monitor.clone().spawn(basecaller_out, stdin);
                            Ok((compressor, Some(relay)))
                        }
                        None => Err(self.spawn_error(
                            Process::Compressor,
                            io::Error::other("stdin was not captured"),
                        )),
                    })
            }
        };

        let (mut compressor, relay) = match wired {
            Ok(wired) => wired,
            Err(e) => {
                reap(&mut basecaller).await;
                return Err(e);
            }
        };

        let basecaller_status = basecaller.wait().await;
        let basecall_elapsed = started.elapsed();

        // The relay task completes once the basecaller's stdout hits end of
        // input, and has shut down the compressor's stdin by then.
        let relay_result = match relay {
            Some(handle) => Some(match handle.await {
                Ok(result) => result,
                Err(join) => Err(Error::MonitorPanicked(join)),
            }),
            None => None,
        };

        let compressor_status = compressor.wait().await;

        self.metrics.add_basecall_time(basecall_elapsed);
        self.metrics
            .add_compress_tail_time(started.elapsed().saturating_sub(basecall_elapsed));
        if let Ok(meta) = tokio::fs::metadata(&self.output_path).await {
            self.metrics
                .add_output_bytes(meta.len().saturating_sub(size_before));
        }

        // A dying compressor breaks the basecaller's pipe too, so report the
        // downstream side first.
        let mut failures = Vec::new();
        let relay_stats = match relay_result {
            Some(Ok(stats)) => Some(stats),
            Some(Err(e)) => {
                failures.push(e);
                None
            }
            None => None,
        };
        if let Err(e) = check_exit(Process::Compressor, compressor_status) {
            failures.push(e);
        }
        if let Err(e) = check_exit(Process::Basecaller, basecaller_status) {
            failures.push(e);
        }

        let mut failures = failures.into_iter();
        match failures.next() {
            None => Ok(relay_stats),
            Some(first) => {
                for other in failures {
                    tracing::warn!("Also failed in this batch: {}", other);
                }
                Err(first)
            }
        }
    }

    /// Start the compressor. The `Command` is dropped before returning so the
    /// parent holds no copy of the compressor's stdin or of the output file.
    fn spawn_compressor(&self, stdin: Stdio, output: File) -> Result<Child> {
        let mut command = Command::new(&self.compressor.program);
        command
            .args(&self.compressor.args)
            .stdin(stdin)
            .stdout(output)
            .stderr(Stdio::inherit());

        let child = command
            .spawn()
            .map_err(|source| self.spawn_error(Process::Compressor, source))?;
        drop(command);

        tracing::debug!(
            "Started {} (pid {:?}) appending to {}",
            self.compressor.program.display(),
            child.id(),
            self.output_path.display()
        );
        Ok(child)
    }

    fn spawn_error(&self, process: Process, source: io::Error) -> Error {
        let program = match process {
            Process::Basecaller => self.basecaller.clone(),
            Process::Compressor => self.compressor.program.clone(),
        };
        Error::Spawn {
            process,
            program,
            source,
        }
    }
}

impl BatchRunner for PipelineStage {
    async fn run_batch(&self, _batch: &Batch, staging_dir: &Path) -> Result<Option<RelayStats>> {
        self.run(staging_dir).await
    }
}

fn check_exit(process: Process, status: io::Result<ExitStatus>) -> Result<()> {
    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(Error::ProcessFailed { process, status }),
        Err(source) => Err(Error::Wait { process, source }),
    }
}

/// Kill a child that can no longer be wired up and wait for it to exit.
async fn reap(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::debug!("Could not signal child: {}", e);
    }
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fake_config, lock_processes, write_script, ECHO_BASECALLER};
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn staged_dir(temp_dir: &TempDir, files: &[(&str, &str)]) -> PathBuf {
        let dir = temp_dir.path().join("staging");
        fs::create_dir(&dir).unwrap();
        for (name, contents) in files {
            fs::write(dir.join(name), contents).unwrap();
        }
        dir
    }

    #[tokio::test]
    async fn test_direct_wiring_appends_output() {
        let _guard = lock_processes();
        let temp_dir = TempDir::new().unwrap();
        let config = fake_config(&temp_dir, ECHO_BASECALLER);
        let staging = staged_dir(&temp_dir, &[("a.pod5", "ACGT\n"), ("b.pod5", "TTGA\n")]);
        let stage = PipelineStage::new(&config, Metrics::new());
        assert!(matches!(stage.wiring(), Wiring::Direct));

        let relay = stage.run(&staging).await.unwrap();
        assert!(relay.is_none());
        stage.run(&staging).await.unwrap();

        let output = fs::read_to_string(config.output_path()).unwrap();
        let one_batch = "@a.pod5\nACGT\n@b.pod5\nTTGA\n";
        assert_eq!(output, format!("{one_batch}{one_batch}"));
        assert!(!config.monitor.report_path.exists());
    }

    #[tokio::test]
    async fn test_monitored_wiring_records_every_byte() {
        let _guard = lock_processes();
        let temp_dir = TempDir::new().unwrap();
        let mut config = fake_config(&temp_dir, ECHO_BASECALLER);
        config.monitor.enabled = true;
        config.monitor.buffer_size = 8;
        let staging = staged_dir(&temp_dir, &[("a.pod5", "ACGTACGTACGT\n")]);
        let metrics = Metrics::new();
        let stage = PipelineStage::new(&config, metrics.clone());

        let relay = stage.run(&staging).await.unwrap().unwrap();

        let output = fs::read(config.output_path()).unwrap();
        assert_eq!(output, b"@a.pod5\nACGTACGTACGT\n");
        assert_eq!(relay.bytes(), output.len() as u64);

        let csv = fs::read_to_string(&config.monitor.report_path).unwrap();
        assert_eq!(csv.lines().count(), relay.samples.len() + 1);
        assert_eq!(metrics.snapshot().bytes_relayed, output.len() as u64);
        assert_eq!(metrics.snapshot().output_bytes, output.len() as u64);
    }

    #[tokio::test]
    async fn test_basecaller_failure() {
        let _guard = lock_processes();
        let temp_dir = TempDir::new().unwrap();
        let config = fake_config(&temp_dir, "echo partial; exit 3");
        let staging = staged_dir(&temp_dir, &[("a.pod5", "")]);

        let err = PipelineStage::new(&config, Metrics::new())
            .run(&staging)
            .await
            .unwrap_err();

        match err {
            Error::ProcessFailed { process, status } => {
                assert_eq!(process, Process::Basecaller);
                assert_eq!(status.code(), Some(3));
            }
            other => panic!("expected basecaller failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_compressor_failure() {
        let _guard = lock_processes();
        let temp_dir = TempDir::new().unwrap();
        let mut config = fake_config(&temp_dir, ECHO_BASECALLER);
        config.compressor.program = write_script(&temp_dir, "bad-zstd", "cat > /dev/null; exit 1");
        let staging = staged_dir(&temp_dir, &[("a.pod5", "ACGT\n")]);

        let err = PipelineStage::new(&config, Metrics::new())
            .run(&staging)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::ProcessFailed {
                process: Process::Compressor,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_monitored_compressor_exit_reports_relay_error() {
        let _guard = lock_processes();
        let temp_dir = TempDir::new().unwrap();
        let mut config = fake_config(&temp_dir, "head -c 5000000 /dev/zero");
        config.monitor.enabled = true;
        config.compressor.program = write_script(&temp_dir, "dead-zstd", "exit 1");
        let staging = staged_dir(&temp_dir, &[("a.pod5", "")]);
        let stage = PipelineStage::new(&config, Metrics::new());

        // The basecaller dies of the broken pipe as well; the relay error is the one returned.
        let err = tokio::time::timeout(Duration::from_secs(20), stage.run(&staging))
            .await
            .expect("stage hung after the compressor exited")
            .unwrap_err();

        assert!(err.is_stream_integrity());
        match err {
            Error::Relay {
                direction, process, ..
            } => {
                assert_eq!(process, Process::Compressor);
                assert_eq!(direction, "writing to");
            }
            other => panic!("expected relay error, got {other:?}"),
        }
        assert!(!config.monitor.report_path.exists());
    }

    #[tokio::test]
    async fn test_monitored_basecaller_failure() {
        let _guard = lock_processes();
        let temp_dir = TempDir::new().unwrap();
        let mut config = fake_config(&temp_dir, "echo partial; exit 3");
        config.monitor.enabled = true;
        let staging = staged_dir(&temp_dir, &[("a.pod5", "")]);

        let err = tokio::time::timeout(
            Duration::from_secs(20),
            PipelineStage::new(&config, Metrics::new()).run(&staging),
        )
        .await
        .expect("stage hung after the basecaller exited")
        .unwrap_err();

        match err {
            Error::ProcessFailed { process, status } => {
                assert_eq!(process, Process::Basecaller);
                assert_eq!(status.code(), Some(3));
            }
            other => panic!("expected basecaller failure, got {other:?}"),
        }
        // The compressor still received what was printed before the exit.
        assert_eq!(fs::read_to_string(config.output_path()).unwrap(), "partial\n");
    }

    #[tokio::test]
    async fn test_missing_compressor_reaps_basecaller() {
        let _guard = lock_processes();
        let temp_dir = TempDir::new().unwrap();
        let mut config = fake_config(&temp_dir, ECHO_BASECALLER);
        config.compressor.program = temp_dir.path().join("no-such-zstd");
        let staging = staged_dir(&temp_dir, &[("a.pod5", "ACGT\n")]);

        let err = PipelineStage::new(&config, Metrics::new())
            .run(&staging)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Spawn {
                process: Process::Compressor,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_missing_basecaller() {
        let _guard = lock_processes();
        let temp_dir = TempDir::new().unwrap();
        let mut config = fake_config(&temp_dir, ECHO_BASECALLER);
        config.basecaller.program = Some(temp_dir.path().join("no-such-dorado"));
        let staging = staged_dir(&temp_dir, &[]);

        let err = PipelineStage::new(&config, Metrics::new())
            .run(&staging)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Spawn {
                process: Process::Basecaller,
                ..
            }
        ));
    }

    #[test]
    fn test_check_exit() {
        use std::os::unix::process::ExitStatusExt;

        assert!(check_exit(Process::Compressor, Ok(ExitStatus::from_raw(0))).is_ok());
        let err = check_exit(Process::Compressor, Ok(ExitStatus::from_raw(256))).unwrap_err();
        assert!(err.to_string().starts_with("compressor exited with"));
    }
}
