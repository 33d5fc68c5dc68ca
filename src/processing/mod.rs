//! # Processing
//!
//! The claim-and-process core: conflict classification, the batch claim
//! engine, the coalescing wake trigger and the scheduler that drives them.

pub mod batch_claimer;
pub mod error_classifier;
pub mod scheduler;
pub mod trigger;

pub use batch_claimer::{
    BatchClaimConfig, BatchClaimEngine, BatchOutcome, BatchProcessor, EngineStatsSnapshot,
};
pub use error_classifier::{ConflictClass, ErrorClassifier, StandardErrorClassifier};
pub use scheduler::{
    DrainOutcome, DrainReport, RunState, Scheduler, SchedulerConfig, SchedulerExit,
    SchedulerStatsSnapshot,
};
pub use trigger::{wake_channel, WakeOutcome, WakeReceiver, WakeSender};
