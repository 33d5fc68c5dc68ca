//! # In-Memory Work Store
//!
//! In-process backend with the same claiming semantics as the PostgreSQL
//! store: claims lock rows until the owning transaction ends, concurrent
//! claims skip locked rows, and nothing a transaction does is visible to
//! others until it commits. Dropping an open transaction rolls it back.
//!
//! Stage outcomes are driven by seeded domain facts: subjects registered as
//! unmapped finish at [`PipelineStage::SkipUnmapped`], pairs registered as
//! irrelevant finish at [`PipelineStage::SkipIrrelevant`], everything else
//! goes through the derivation stages.
//!
//! Faults can be queued per [`FaultPoint`] to simulate serialization
//! failures, deadlocks or connectivity loss.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::{StoreError, StoreResult, StoreTransaction, WorkStore};
use crate::models::{Batch, PipelineStage, WorkItem};

/// Where an injected fault fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Begin,
    Claim,
    Stage(PipelineStage),
    Commit,
}

/// Counters describing what the store has been asked to do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStoreStats {
    pub begins: u64,
    pub claims: u64,
    pub stage_invocations: u64,
    pub commits: u64,
    pub rollbacks: u64,
}

type Pair = (i64, Uuid);

#[derive(Debug, Default)]
struct MemoryState {
    items: BTreeMap<Uuid, WorkItem>,
    locked: HashSet<Uuid>,
    unmapped_subjects: HashSet<i64>,
    irrelevant_pairs: HashSet<Pair>,
    relevance: HashMap<Pair, bool>,
    intersections: HashSet<Pair>,
    route_sections: HashSet<Pair>,
    route_stat_refreshes: HashMap<Uuid, u64>,
    completions: HashMap<Uuid, u32>,
    committed_batches: Vec<Vec<Uuid>>,
    faults: VecDeque<(FaultPoint, StoreError)>,
    stage_delay: Duration,
    seeded: u32,
    stats: MemoryStoreStats,
}

impl MemoryState {
    fn take_fault(&mut self, point: FaultPoint) -> Option<StoreError> {
        let index = self.faults.iter().position(|(p, _)| *p == point)?;
        self.faults.remove(index).map(|(_, err)| err)
    }

    fn release(&mut self, ids: &[Uuid]) {
        for id in ids {
            self.locked.remove(id);
        }
    }

    fn next_created_at(&mut self) -> DateTime<Utc> {
        self.seeded += 1;
        // Strictly increasing creation times keep claim order deterministic
        Utc::now() + chrono::Duration::microseconds(i64::from(self.seeded))
    }
}

/// Shared in-process store; clones share the same data
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an unclaimed item for a subject/target pair
    pub fn seed_item(&self, subject_ref: i64, target_ref: Uuid) -> Uuid {
        let mut state = self.state.lock();
        let item = WorkItem {
            id: Uuid::new_v4(),
            subject_ref,
            target_ref,
            created_at: state.next_created_at(),
            claimed_at: None,
            done: false,
        };
        let id = item.id;
        state.items.insert(id, item);
        id
    }

    /// Add `count` unclaimed items, each with its own subject, spread over
    /// `routes` targets
    pub fn seed_backlog(&self, count: usize, routes: usize) -> Vec<Uuid> {
        let targets: Vec<Uuid> = (0..routes.max(1)).map(|_| Uuid::new_v4()).collect();
        (0..count)
            .map(|n| self.seed_item(n as i64 + 1, targets[n % targets.len()]))
            .collect()
    }

    /// Add an item left behind by a claim that never completed
    pub fn seed_abandoned_claim(
        &self,
        subject_ref: i64,
        target_ref: Uuid,
        claimed_at: DateTime<Utc>,
    ) -> Uuid {
        let id = self.seed_item(subject_ref, target_ref);
        if let Some(item) = self.state.lock().items.get_mut(&id) {
            item.claimed_at = Some(claimed_at);
        }
        id
    }

    /// Subject has no usable geometry
    pub fn mark_unmapped(&self, subject_ref: i64) {
        self.state.lock().unmapped_subjects.insert(subject_ref);
    }

    /// Subject does not pass near the target
    pub fn mark_irrelevant(&self, subject_ref: i64, target_ref: Uuid) {
        self.state
            .lock()
            .irrelevant_pairs
            .insert((subject_ref, target_ref));
    }

    /// Queue a fault for the next time `point` is reached
    pub fn inject_fault(&self, point: FaultPoint, error: StoreError) {
        self.inject_faults(point, error, 1);
    }

    pub fn inject_faults(&self, point: FaultPoint, error: StoreError, times: usize) {
        let mut state = self.state.lock();
        for _ in 0..times {
            state.faults.push_back((point, error.clone()));
        }
    }

    /// Faults queued but not yet fired
    pub fn pending_faults(&self) -> usize {
        self.state.lock().faults.len()
    }

    /// Delay applied after every stage, widening the window in which
    /// concurrent transactions overlap
    pub fn set_stage_delay(&self, delay: Duration) {
        self.state.lock().stage_delay = delay;
    }

    pub fn item(&self, id: Uuid) -> Option<WorkItem> {
        self.state.lock().items.get(&id).cloned()
    }

    pub fn items(&self) -> Vec<WorkItem> {
        self.state.lock().items.values().cloned().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .items
            .values()
            .filter(|item| !item.done)
            .count()
    }

    /// Claimed ids of every committed non-empty batch, in commit order
    pub fn committed_batches(&self) -> Vec<Vec<Uuid>> {
        self.state.lock().committed_batches.clone()
    }

    /// How many committed transactions flipped this item to done
    pub fn completion_count(&self, id: Uuid) -> u32 {
        self.state
            .lock()
            .completions
            .get(&id)
            .copied()
            .unwrap_or(0)
    }

    pub fn relevance(&self, subject_ref: i64, target_ref: Uuid) -> Option<bool> {
        self.state
            .lock()
            .relevance
            .get(&(subject_ref, target_ref))
            .copied()
    }

    pub fn has_intersection(&self, subject_ref: i64, target_ref: Uuid) -> bool {
        self.state
            .lock()
            .intersections
            .contains(&(subject_ref, target_ref))
    }

    pub fn has_route_section(&self, subject_ref: i64, target_ref: Uuid) -> bool {
        self.state
            .lock()
            .route_sections
            .contains(&(subject_ref, target_ref))
    }

    pub fn route_stat_refreshes(&self, target_ref: Uuid) -> u64 {
        self.state
            .lock()
            .route_stat_refreshes
            .get(&target_ref)
            .copied()
            .unwrap_or(0)
    }

    /// Rows currently locked by open transactions
    pub fn locked_count(&self) -> usize {
        self.state.lock().locked.len()
    }

    pub fn stats(&self) -> MemoryStoreStats {
        self.state.lock().stats
    }
}

#[async_trait]
impl WorkStore for InMemoryStore {
    type Transaction = MemoryTransaction;

    async fn begin(&self) -> StoreResult<MemoryTransaction> {
        let mut state = self.state.lock();
        if let Some(err) = state.take_fault(FaultPoint::Begin) {
            return Err(err);
        }
        state.stats.begins += 1;

        Ok(MemoryTransaction {
            state: Arc::clone(&self.state),
            tx_id: Uuid::new_v4(),
            claimed: Vec::new(),
            claimed_at: None,
            finished: HashSet::new(),
            relevance: HashMap::new(),
            intersections: HashSet::new(),
            route_sections: HashSet::new(),
            refreshed_routes: BTreeSet::new(),
            closed: false,
        })
    }

    async fn backlog_size(&self) -> StoreResult<u64> {
        Ok(self.pending_count() as u64)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// Open transaction against an [`InMemoryStore`]
///
/// Stage effects are buffered here and applied atomically on commit.
#[derive(Debug)]
pub struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    tx_id: Uuid,
    claimed: Vec<Uuid>,
    claimed_at: Option<DateTime<Utc>>,
    finished: HashSet<Uuid>,
    relevance: HashMap<Pair, bool>,
    intersections: HashSet<Pair>,
    route_sections: HashSet<Pair>,
    refreshed_routes: BTreeSet<Uuid>,
    closed: bool,
}

impl MemoryTransaction {
    /// Claimed items this transaction has not finished yet
    fn unfinished<'b>(&self, state: &MemoryState, batch: &'b Batch) -> Vec<&'b WorkItem> {
        batch
            .items()
            .iter()
            .filter(|item| self.claimed.contains(&item.id))
            .filter(|item| !self.finished.contains(&item.id))
            .filter(|item| state.items.get(&item.id).is_some_and(|stored| !stored.done))
            .collect()
    }

    fn recorded_relevance(&self, state: &MemoryState, pair: &Pair) -> Option<bool> {
        self.relevance
            .get(pair)
            .or_else(|| state.relevance.get(pair))
            .copied()
    }

    fn apply_stage(&mut self, state: &MemoryState, stage: PipelineStage, batch: &Batch) -> u64 {
        let pending: Vec<(Uuid, Pair)> = self
            .unfinished(state, batch)
            .into_iter()
            .map(|item| (item.id, (item.subject_ref, item.target_ref)))
            .collect();
        let mut affected = 0;

        match stage {
            PipelineStage::SkipUnmapped => {
                for (id, (subject, _)) in &pending {
                    if state.unmapped_subjects.contains(subject) {
                        self.finished.insert(*id);
                        affected += 1;
                    }
                }
            }
            PipelineStage::RecordRelevance => {
                for (_, pair) in &pending {
                    if self.recorded_relevance(state, pair).is_none() {
                        let relevant = !state.irrelevant_pairs.contains(pair);
                        self.relevance.insert(*pair, relevant);
                        affected += 1;
                    }
                }
            }
            PipelineStage::SkipIrrelevant => {
                for (id, pair) in &pending {
                    if self.recorded_relevance(state, pair) == Some(false) {
                        self.finished.insert(*id);
                        affected += 1;
                    }
                }
            }
            PipelineStage::PopulateIntersections => {
                for (_, pair) in &pending {
                    let derived =
                        self.intersections.contains(pair) || state.intersections.contains(pair);
                    if self.recorded_relevance(state, pair) == Some(true) && !derived {
                        self.intersections.insert(*pair);
                        affected += 1;
                    }
                }
            }
            PipelineStage::PopulateRouteSections => {
                for (_, pair) in &pending {
                    let intersected =
                        self.intersections.contains(pair) || state.intersections.contains(pair);
                    let derived =
                        self.route_sections.contains(pair) || state.route_sections.contains(pair);
                    if intersected && !derived {
                        self.route_sections.insert(*pair);
                        affected += 1;
                    }
                }
            }
            PipelineStage::LockTouchedRoutes => {
                affected = batch.target_refs().len() as u64;
            }
            PipelineStage::RefreshRouteStats => {
                for target in batch.target_refs() {
                    self.refreshed_routes.insert(target);
                    affected += 1;
                }
            }
            PipelineStage::MarkComplete => {
                for (id, _) in &pending {
                    self.finished.insert(*id);
                    affected += 1;
                }
            }
        }

        affected
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn claim_batch(&mut self, limit: usize, lease: Duration) -> StoreResult<Batch> {
        let state_handle = Arc::clone(&self.state);
        let mut state = state_handle.lock();
        if let Some(err) = state.take_fault(FaultPoint::Claim) {
            return Err(err);
        }
        state.stats.claims += 1;

        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));

        let mut candidates: Vec<&WorkItem> = state
            .items
            .values()
            .filter(|item| item.is_claimable(now, lease))
            .filter(|item| !state.locked.contains(&item.id))
            .collect();
        candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let claimed: Vec<WorkItem> = candidates
            .into_iter()
            .take(limit)
            .map(|item| WorkItem {
                claimed_at: Some(now),
                ..item.clone()
            })
            .collect();

        for item in &claimed {
            state.locked.insert(item.id);
            self.claimed.push(item.id);
        }
        self.claimed_at = Some(now);

        debug!(tx_id = %self.tx_id, claimed = claimed.len(), "Claimed in-memory batch");
        Ok(Batch::new(claimed))
    }

    async fn run_stage(&mut self, stage: PipelineStage, batch: &Batch) -> StoreResult<u64> {
        let state_handle = Arc::clone(&self.state);
        let (affected, delay) = {
            let mut state = state_handle.lock();
            state.stats.stage_invocations += 1;
            if let Some(err) = state.take_fault(FaultPoint::Stage(stage)) {
                return Err(err);
            }
            (self.apply_stage(&state, stage, batch), state.stage_delay)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(affected)
    }

    async fn commit(mut self) -> StoreResult<()> {
        let state_handle = Arc::clone(&self.state);
        let mut state = state_handle.lock();
        self.closed = true;

        if let Some(err) = state.take_fault(FaultPoint::Commit) {
            state.release(&self.claimed);
            state.stats.rollbacks += 1;
            return Err(err);
        }

        for id in &self.claimed {
            if let Some(item) = state.items.get_mut(id) {
                item.claimed_at = self.claimed_at;
            }
        }
        for id in &self.finished {
            let newly_done = match state.items.get_mut(id) {
                Some(item) if !item.done => {
                    item.done = true;
                    true
                }
                _ => false,
            };
            if newly_done {
                *state.completions.entry(*id).or_insert(0) += 1;
            }
        }
        for (pair, relevant) in self.relevance.drain() {
            state.relevance.entry(pair).or_insert(relevant);
        }
        state.intersections.extend(self.intersections.drain());
        state.route_sections.extend(self.route_sections.drain());
        for target in &self.refreshed_routes {
            *state.route_stat_refreshes.entry(*target).or_insert(0) += 1;
        }
        if !self.claimed.is_empty() {
            state.committed_batches.push(self.claimed.clone());
        }

        state.release(&self.claimed);
        state.stats.commits += 1;
        Ok(())
    }

    async fn rollback(mut self) -> StoreResult<()> {
        let state_handle = Arc::clone(&self.state);
        let mut state = state_handle.lock();
        self.closed = true;
        state.release(&self.claimed);
        state.stats.rollbacks += 1;
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.closed {
            let mut state = self.state.lock();
            state.release(&self.claimed);
            state.stats.rollbacks += 1;
        }
    }
}
