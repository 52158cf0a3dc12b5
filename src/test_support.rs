//! Helpers for tests that run real child processes.
//!
//! A shell script stands in for the basecaller and `cat` for the compressor, so
//! the output artifact is the plain concatenation of what the basecaller printed.

use crate::config::Config;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tempfile::TempDir;

/// Prints `@<name>` followed by the contents of every file in the staging
/// directory (the last argument), after checking the fixed argument prefix.
pub const ECHO_BASECALLER: &str = r#"
[ "$1" = basecaller ] && [ "$3" = -r ] && [ "$4" = --emit-fastq ] || { echo "unexpected args: $*" >&2; exit 64; }
for last; do :; done
for f in "$last"/*; do
  [ -e "$f" ] || continue
  printf '@%s\n' "$(basename "$f")"
  cat "$f"
done
"#;

static PROCESS_LOCK: Mutex<()> = Mutex::new(());

/// Serialise tests that write scripts and spawn processes.
///
/// A fork in one test while another still has a freshly written script open for
/// writing makes exec of that script fail with ETXTBSY.
pub fn lock_processes() -> MutexGuard<'static, ()> {
    PROCESS_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Write an executable `/bin/sh` script.
pub fn write_script(temp_dir: &TempDir, name: &str, body: &str) -> PathBuf {
    let path = temp_dir.path().join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Create `count` input files named `read_NNNN.pod5` holding one record each.
pub fn write_inputs(dir: &Path, count: usize) -> Vec<String> {
    fs::create_dir_all(dir).unwrap();
    (0..count)
        .map(|i| {
            let name = format!("read_{i:04}.pod5");
            fs::write(dir.join(&name), format!("SEQ{i}\n")).unwrap();
            name
        })
        .collect()
}

/// A complete configuration rooted in `temp_dir`, with the basecaller running
/// `basecaller_body` and `cat` as the compressor.
pub fn fake_config(temp_dir: &TempDir, basecaller_body: &str) -> Config {
    let mut config = Config::default();
    config.input.dir = Some(temp_dir.path().join("input"));
    config.basecaller.program = Some(write_script(temp_dir, "dorado", basecaller_body));
    config.compressor.program = PathBuf::from("cat");
    config.output.path = Some(temp_dir.path().join("calls.fastq.zst"));
    config.output.staging_dir = temp_dir.path().join("staging");
    config.monitor.report_path = temp_dir.path().join("chan_stats.csv");
    config.processing.enable_metrics = false;
    config
}
