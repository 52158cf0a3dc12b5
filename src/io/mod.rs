//! Filesystem side of the pipeline: finding inputs, staging them and writing the timing report.

mod discovery;
mod report;
mod staging;

pub use discovery::{discover, SourceFile};
pub use report::{TimingReport, TimingSample, REPORT_HEADER};
pub use staging::StagingArea;
