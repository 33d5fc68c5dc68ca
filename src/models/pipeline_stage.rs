//! # Pipeline Stages
//!
//! The transformation pipeline run over every claimed batch. Each stage is a
//! single statement operating on exactly the claimed set, executed in the
//! order of [`PipelineStage::ORDERED`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// One step of the per-batch transformation pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    /// Activities without a summary track are finished immediately
    SkipUnmapped,
    /// Record whether the activity passes near the route
    RecordRelevance,
    /// Pairs recorded as irrelevant are finished
    SkipIrrelevant,
    /// Derive the parts of the activity inside the route buffer
    PopulateIntersections,
    /// Derive the route sections covered by those intersections
    PopulateRouteSections,
    /// Row-lock the batch's routes so stats see sections committed by other workers
    LockTouchedRoutes,
    /// Recompute coverage statistics for the routes in the batch
    RefreshRouteStats,
    /// Mark every claimed item done
    MarkComplete,
}

impl PipelineStage {
    /// Execution order. Later stages only see items earlier stages left unfinished.
    pub const ORDERED: [PipelineStage; 8] = [
        PipelineStage::SkipUnmapped,
        PipelineStage::RecordRelevance,
        PipelineStage::SkipIrrelevant,
        PipelineStage::PopulateIntersections,
        PipelineStage::PopulateRouteSections,
        PipelineStage::LockTouchedRoutes,
        PipelineStage::RefreshRouteStats,
        PipelineStage::MarkComplete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::SkipUnmapped => "skip_unmapped",
            PipelineStage::RecordRelevance => "record_relevance",
            PipelineStage::SkipIrrelevant => "skip_irrelevant",
            PipelineStage::PopulateIntersections => "populate_intersections",
            PipelineStage::PopulateRouteSections => "populate_route_sections",
            PipelineStage::LockTouchedRoutes => "lock_touched_routes",
            PipelineStage::RefreshRouteStats => "refresh_route_stats",
            PipelineStage::MarkComplete => "mark_complete",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
