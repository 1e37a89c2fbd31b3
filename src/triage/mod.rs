pub mod apply;
pub mod batch;
pub mod cycle;
pub mod fetcher;
pub mod prompt;
pub mod runner;
pub mod scheduler;
pub mod validate;
pub mod watermark;

pub use cycle::{run_cycle, BatchOutcome, CycleError, CyclePhase, CycleReport, TriageCycle};
pub use runner::{CycleRunner, WatchOptions, WatchOutcome};
pub use scheduler::TriggerService;
pub use watermark::{KeyValueStore, WatermarkStore, WATERMARK_KEY};
