//! Batch scheduling, process wiring and pipe monitoring.

mod metrics;
mod monitor;
mod scheduler;
mod stage;


pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use monitor::{ByteSink, ByteSource, RelayStats, StreamMonitor};
pub use scheduler::{
    Batch, BatchRunner, BatchState, Phase, Scheduler, SchedulerConfig, SchedulerStats,
};
pub use stage::{PipelineStage, Wiring};
