//! # Work Item Model
//!
//! One pending activity/route pair awaiting coverage evaluation.
//!
//! ## Database Schema
//!
//! Maps to the `processing` table written by the upstream ingestion process:
//! ```sql
//! CREATE TABLE processing (
//!   id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
//!   activity_id BIGINT NOT NULL REFERENCES activities(id) ON DELETE CASCADE,
//!   route_id UUID NOT NULL REFERENCES routes(id) ON DELETE CASCADE,
//!   created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!   processing_started_at TIMESTAMPTZ,
//!   processed BOOLEAN NOT NULL DEFAULT false
//! );
//! ```
//!
//! `processing_started_at` is the claim timestamp and `processed` the
//! monotonic completion flag. Neither is ever reset by the worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// A single unit of backlog work: one activity paired with one route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Store-assigned identifier
    pub id: Uuid,
    /// Activity the pair was created for
    pub subject_ref: i64,
    /// Route the activity is evaluated against
    pub target_ref: Uuid,
    /// Creation time, drives oldest-first claiming
    pub created_at: DateTime<Utc>,
    /// Set when a worker takes ownership of the item
    pub claimed_at: Option<DateTime<Utc>>,
    /// Completion flag, only ever goes from false to true
    pub done: bool,
}

impl WorkItem {
    /// Whether the item may be claimed at `now` given the claim lease
    pub fn is_claimable(&self, now: DateTime<Utc>, lease: chrono::Duration) -> bool {
        if self.done {
            return false;
        }
        match self.claimed_at {
            None => true,
            Some(claimed_at) => claimed_at < now - lease,
        }
    }
}

/// Items claimed together for one transactional attempt
///
/// A batch is owned by exactly one transaction and is never reused once that
/// transaction commits or rolls back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    items: Vec<WorkItem>,
}

impl Batch {
    /// Build a batch, ordering items oldest first
    pub fn new(mut items: Vec<WorkItem>) -> Self {
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Self { items }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    /// Identifiers in claim order, used to scope every pipeline statement
    pub fn ids(&self) -> Vec<Uuid> {
        self.items.iter().map(|item| item.id).collect()
    }

    /// Distinct routes touched by this batch
    pub fn target_refs(&self) -> BTreeSet<Uuid> {
        self.items.iter().map(|item| item.target_ref).collect()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.items.iter().any(|item| item.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn item(created_offset_secs: i64) -> WorkItem {
        WorkItem {
            id: Uuid::new_v4(),
            subject_ref: 42,
            target_ref: Uuid::new_v4(),
            created_at: Utc::now() + Duration::seconds(created_offset_secs),
            claimed_at: None,
            done: false,
        }
    }

    #[test]
    fn test_batch_orders_oldest_first() {
        let newest = item(10);
        let oldest = item(-10);
        let middle = item(0);

        let batch = Batch::new(vec![newest.clone(), oldest.clone(), middle.clone()]);

        assert_eq!(batch.ids(), vec![oldest.id, middle.id, newest.id]);
        assert_eq!(batch.len(), 3);
        assert!(batch.contains(middle.id));
    }

    #[test]
    fn test_claimable_respects_lease() {
        let now = Utc::now();
        let lease = Duration::minutes(10);

        let mut fresh = item(0);
        assert!(fresh.is_claimable(now, lease));

        fresh.claimed_at = Some(now - Duration::minutes(1));
        assert!(!fresh.is_claimable(now, lease));

        fresh.claimed_at = Some(now - Duration::minutes(11));
        assert!(fresh.is_claimable(now, lease));

        fresh.done = true;
        assert!(!fresh.is_claimable(now, lease));
    }

    #[test]
    fn test_batch_target_refs_are_distinct() {
        let shared_route = Uuid::new_v4();
        let mut a = item(0);
        let mut b = item(1);
        a.target_ref = shared_route;
        b.target_ref = shared_route;

        let batch = Batch::new(vec![a, b, item(2)]);

        assert_eq!(batch.target_refs().len(), 2);
    }
}
