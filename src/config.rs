//! Configuration for the batching pipeline.
//!
//! Every section has serde defaults, so a config file only needs the values it
//! changes. Command-line flags are applied on top of the loaded file.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// zstd's maximum block size; relaying in blocks this size avoids fragmenting its input.
pub const DEFAULT_RELAY_BUFFER: usize = 128 * 1024;

/// Main configuration for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Where raw-signal files are discovered
    #[serde(default)]
    pub input: InputConfig,

    /// Basecaller invocation
    #[serde(default)]
    pub basecaller: BasecallerConfig,

    /// Compressor invocation
    #[serde(default)]
    pub compressor: CompressorConfig,

    /// Output artifact and scratch space
    #[serde(default)]
    pub output: OutputConfig,

    /// Batching and metrics
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Pipe pressure monitoring
    #[serde(default)]
    pub monitor: MonitorConfig,
}

/// Input discovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// Directory scanned recursively for raw-signal files
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// File extension (without the dot) that qualifies a file
    #[serde(default = "default_extension")]
    pub extension: String,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            dir: None,
            extension: default_extension(),
        }
    }
}

/// Basecaller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasecallerConfig {
    /// Path to the basecaller executable
    #[serde(default)]
    pub program: Option<PathBuf>,

    /// Model / accuracy mode passed after `basecaller`
    #[serde(default = "default_model")]
    pub model: String,

    /// Extra arguments inserted before the staging directory
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for BasecallerConfig {
    fn default() -> Self {
        Self {
            program: None,
            model: default_model(),
            extra_args: Vec::new(),
        }
    }
}

impl BasecallerConfig {
    /// Full argument list for one batch.
    pub fn args(&self, staging_dir: &Path) -> Vec<std::ffi::OsString> {
        let mut args: Vec<std::ffi::OsString> = vec![
            "basecaller".into(),
            self.model.clone().into(),
            "-r".into(),
            "--emit-fastq".into(),
        ];
        args.extend(self.extra_args.iter().map(Into::into));
        args.push(staging_dir.as_os_str().to_owned());
        args
    }
}

/// Compressor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressorConfig {
    /// Path or name of the compressor executable
    #[serde(default = "default_compressor")]
    pub program: PathBuf,

    /// Arguments passed to the compressor (default: none)
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            program: default_compressor(),
            args: Vec::new(),
        }
    }
}

/// Output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output artifact, appended to by every batch
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Scratch directory holding symlinks for the current batch.
    /// Must not exist when the run starts; removed when it ends.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: None,
            staging_dir: default_staging_dir(),
        }
    }
}

/// Batching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Files per batch
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Index of the first file to process (resume after a failed batch)
    #[serde(default)]
    pub resume_from: usize,

    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Enable progress reporting and the end-of-run summary
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Progress reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after the run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            resume_from: 0,
            worker_threads: None,
            enable_metrics: true,
            metrics_interval_secs: default_metrics_interval(),
            metrics_output_path: None,
        }
    }
}

/// Pipe pressure monitoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Relay through the stream monitor instead of piping directly
    #[serde(default)]
    pub enabled: bool,

    /// CSV report, appended to at the end of every monitored batch
    #[serde(default = "default_report_path")]
    pub report_path: PathBuf,

    /// Bytes requested per read
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            report_path: default_report_path(),
            buffer_size: default_buffer_size(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| Error::Io {
            operation: "read config",
            path: path.to_path_buf(),
            source,
        })?;

        match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
            "json" => Self::from_json(&contents),
            // YAML is a superset of JSON
            _ => Self::from_yaml(&contents),
        }
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Input directory. Only valid after [`Config::validate`].
    pub fn input_dir(&self) -> &Path {
        self.input.dir.as_deref().unwrap_or(Path::new(""))
    }

    /// Basecaller executable. Only valid after [`Config::validate`].
    pub fn basecaller_program(&self) -> &Path {
        self.basecaller.program.as_deref().unwrap_or(Path::new(""))
    }

    /// Output artifact. Only valid after [`Config::validate`].
    pub fn output_path(&self) -> &Path {
        self.output.path.as_deref().unwrap_or(Path::new(""))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.input.dir.is_none() {
            return Err(Error::Config("missing input directory (--in)".into()));
        }
        if self.basecaller.program.is_none() {
            return Err(Error::Config("missing basecaller executable (--dorado)".into()));
        }
        if self.output.path.is_none() {
            return Err(Error::Config("missing output path (--out)".into()));
        }
        if self.processing.chunk_size == 0 {
            return Err(Error::Config("chunk size must be > 0".into()));
        }
        if self.input.extension.is_empty() || self.input.extension.starts_with('.') {
            return Err(Error::Config(
                "extension must be non-empty and given without the leading dot".into(),
            ));
        }
        if self.monitor.buffer_size == 0 {
            return Err(Error::Config("monitor buffer size must be > 0".into()));
        }
        if self.processing.enable_metrics && self.processing.metrics_interval_secs == 0 {
            return Err(Error::Config("metrics interval must be > 0".into()));
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_extension() -> String { "pod5".to_string() }
fn default_model() -> String { "hac".to_string() }
fn default_compressor() -> PathBuf { PathBuf::from("zstd") }
fn default_staging_dir() -> PathBuf { PathBuf::from("tmpdir") }
fn default_chunk_size() -> usize { 50 }
fn default_true() -> bool { true }
fn default_metrics_interval() -> u64 { 60 }
fn default_report_path() -> PathBuf { PathBuf::from("chan_stats.csv") }
fn default_buffer_size() -> usize { DEFAULT_RELAY_BUFFER }

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_config() -> Config {
        let mut config = Config::default();
        config.input.dir = Some(PathBuf::from("/data/pod5"));
        config.basecaller.program = Some(PathBuf::from("/opt/dorado/bin/dorado"));
        config.output.path = Some(PathBuf::from("calls.fastq.zst"));
        config
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.processing.chunk_size, 50);
        assert_eq!(config.input.extension, "pod5");
        assert_eq!(config.basecaller.model, "hac");
        assert_eq!(config.compressor.program, PathBuf::from("zstd"));
        assert!(config.compressor.args.is_empty());
        assert_eq!(config.output.staging_dir, PathBuf::from("tmpdir"));
        assert!(!config.monitor.enabled);
        assert_eq!(config.monitor.report_path, PathBuf::from("chan_stats.csv"));
        assert_eq!(config.monitor.buffer_size, 128 * 1024);
    }

    #[test]
    fn test_config_validation_complete() {
        assert!(complete_config().validate().is_ok());
    }

    #[test]
    fn test_config_validation_missing_required() {
        let mut config = complete_config();
        config.basecaller.program = None;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("--dorado"));

        let mut config = complete_config();
        config.input.dir = None;
        assert!(config.validate().unwrap_err().to_string().contains("--in"));

        let mut config = complete_config();
        config.output.path = None;
        assert!(config.validate().unwrap_err().to_string().contains("--out"));
    }

    #[test]
    fn test_config_validation_zero_chunk() {
        let mut config = complete_config();
        config.processing.chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_dotted_extension() {
        let mut config = complete_config();
        config.input.extension = ".pod5".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
input:
  dir: /data/run42
basecaller:
  program: /opt/dorado/bin/dorado
  model: sup
output:
  path: run42.fastq.zst
monitor:
  enabled: true
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.basecaller.model, "sup");
        assert_eq!(config.processing.chunk_size, 50);
        assert!(config.monitor.enabled);
        assert_eq!(config.monitor.buffer_size, DEFAULT_RELAY_BUFFER);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_config() {
        let json = r#"{"processing": {"chunk_size": 10}, "compressor": {"args": ["-3", "-T4"]}}"#;
        let config = Config::from_json(json).unwrap();
        assert_eq!(config.processing.chunk_size, 10);
        assert_eq!(config.compressor.args, vec!["-3", "-T4"]);
    }

    #[test]
    fn test_yaml_roundtrip_keeps_values() {
        let config = complete_config();
        let yaml = config.to_yaml().unwrap();
        let parsed = Config::from_yaml(&yaml).unwrap();
        assert_eq!(parsed.input_dir(), Path::new("/data/pod5"));
        assert_eq!(parsed.output_path(), Path::new("calls.fastq.zst"));
    }

    #[test]
    fn test_basecaller_args() {
        let mut config = complete_config();
        config.basecaller.extra_args = vec!["--device".into(), "cuda:0".into()];
        let args = config.basecaller.args(Path::new("tmpdir"));
        let args: Vec<_> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec!["basecaller", "hac", "-r", "--emit-fastq", "--device", "cuda:0", "tmpdir"]
        );
    }
}
