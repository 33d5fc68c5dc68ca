//! # Domain Models
//!
//! Work items drained by the claim engine and the fixed pipeline of
//! transformation stages applied to every claimed batch.

pub mod pipeline_stage;
pub mod work_item;

pub use pipeline_stage::PipelineStage;
pub use work_item::{Batch, WorkItem};
