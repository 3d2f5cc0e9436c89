pub mod preprocess;
pub mod tail;
pub mod worker;

pub use preprocess::preprocess;
pub use tail::{track_tail, TailTrace};
pub use worker::{track_frame, StepOutcome, TrackingStats, TrackingWorker, WorkerOptions};
