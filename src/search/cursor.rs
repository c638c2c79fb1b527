// Copyright 2025 Rowscan Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Search cursor
//!
//! The central state machine of the row-retrieval engine. A cursor owns an
//! index search over the planned key, an optional data search over the
//! clustering key, the reusable return-key buffers, its visibility window
//! and its lock state. Callers drive it step by step; every outcome is a
//! result code, and the only suspension point is the row lock — a
//! `WaitLock` result parks the caller externally, and the next call
//! retries the identical row instead of advancing.
//!
//! A cursor never blocks and never runs two steps concurrently; registry
//! broadcasts from other threads reach it only through the shared flag
//! block, observed at the start of each step.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::config::ScanConfig;
use crate::core::{
    BlobRef, CursorKind, Error, LockMode, RelationId, RelationKind, Result, ScanDirection,
    StepResult, StorageKind, Tuple, TupleRef, TxId, TxState, Value,
};
use crate::key::CompressedKeyBuf;
use crate::plan::{ResolvedSelect, SearchPlan, SelectSource, SortOrder};
use crate::search::data_search::{DataFetch, DataSearch};
use crate::search::index_search::{IndexSearch, IndexStep};
use crate::search::registry::{SharedCursorState, SlotId, UserSearchRegistry};
use crate::search::return_key::SearchReturnKey;
use crate::search::time_constraint::TimeConstraint;
use crate::traits::{LockReply, TreeKind, TreeSource, TxnSystem};

/// Read-only per-cursor counters
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanStats {
    pub steps: u64,
    pub rows_returned: u64,
    pub data_fetches: u64,
    pub lock_waits: u64,
    pub resyncs: u64,
    pub restarts: u64,
}

/// Outcome of the locking helper
enum LockOutcome {
    Locked,
    Wait,
}

/// The search cursor over one relation's key
pub struct SearchCursor {
    // ---- plan binding ----
    plan: Arc<SearchPlan>,
    resolved: ResolvedSelect,
    kind: CursorKind,
    relation: RelationId,
    storage: StorageKind,
    /// Effective discipline; a nominally pessimistic relation with no
    /// shared locks under relaxed isolation is optimistic for this
    /// cursor's whole life
    effective_kind: RelationKind,

    // ---- collaborators ----
    txn: Arc<dyn TxnSystem>,
    source: Arc<dyn TreeSource>,
    registry: Arc<UserSearchRegistry>,
    slot: SlotId,
    shared: Arc<SharedCursorState>,
    stmt_tx: TxId,

    // ---- visibility / locking ----
    tc: TimeConstraint,
    lock_mode: LockMode,
    lock_timeout_ms: u64,
    optimistic_lock: bool,
    bounce_locks: bool,
    last_change_count: u64,
    relation_locked: bool,

    // ---- scan progress ----
    config: ScanConfig,
    last_direction: Option<ScanDirection>,
    sequential_steps: u32,
    saved_position: CompressedKeyBuf,
    check_lock_pending: bool,
    deferred_data_fetch: bool,
    row_is_placeholder: bool,
    /// Set by resync: the next step skips the already-returned saved row
    skip_saved_once: bool,
    /// Result code of the most recent step
    last_result: StepResult,
    current_tuple: Tuple,
    current_ref: TupleRef,
    has_row: bool,
    closed: bool,
    stats: ScanStats,

    // ---- sub-searches ----
    index_search: IndexSearch,
    data_search: Option<DataSearch>,
}

impl SearchCursor {
    /// Opens a cursor bound to a transaction and plan and registers it
    /// with the connection's registry
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        txn: Arc<dyn TxnSystem>,
        source: Arc<dyn TreeSource>,
        registry: Arc<UserSearchRegistry>,
        stmt_tx: TxId,
        plan: Arc<SearchPlan>,
        kind: CursorKind,
        config: ScanConfig,
        isolation_transparent: bool,
    ) -> Result<SearchCursor> {
        let relation = plan.relation;
        let lock_mode = kind.lock_mode();
        let policy = txn.locking_policy(relation, lock_mode);
        let storage = txn.storage_kind(relation);
        let declared_kind = txn.relation_kind(relation);
        let isolation = txn.isolation_level(stmt_tx);

        // A pessimistic relation that takes no shared locks under relaxed
        // isolation behaves optimistically for the cursor's lifetime
        let effective_kind = if declared_kind == RelationKind::Pessimistic
            && !policy.uses_shared_locks
            && isolation.is_relaxed()
        {
            RelationKind::Optimistic
        } else {
            declared_kind
        };

        // Pessimistic relations and for-update optimistic cursors hold
        // their locks; everything else validates and releases
        let bounce_locks = effective_kind == RelationKind::Optimistic
            && !kind.is_for_update()
            && storage == StorageKind::Disk;

        let lock_mode = if policy.required {
            lock_mode
        } else {
            LockMode::Free
        };

        let tc = TimeConstraint::for_reader(txn.as_ref(), stmt_tx);
        let resolved = plan.resolve_select()?;

        let index_scan = source.open_scan(plan.key.id, TreeKind::Visible)?;
        let index_search = IndexSearch::new(
            plan.key.id,
            index_scan,
            plan.key.parts.clone(),
            plan.key.unique_parts,
            plan.key_constraints.clone(),
            plan.range.clone(),
        );
        let data_search = if resolved.needs_data_fetch {
            Some(DataSearch::open(
                source.as_ref(),
                &plan,
                effective_kind == RelationKind::Pessimistic,
            )?)
        } else {
            None
        };

        let shared = Arc::new(SharedCursorState::new(
            relation,
            plan.key.id,
            stmt_tx,
            isolation_transparent,
        ));
        let slot = registry.register(Arc::clone(&shared));
        let last_change_count = source.change_count(relation);

        debug!(
            relation = relation.0,
            key = plan.key.id.0,
            ?kind,
            ?effective_kind,
            "cursor opened"
        );

        Ok(SearchCursor {
            plan,
            resolved,
            kind,
            relation,
            storage,
            effective_kind,
            txn,
            source,
            registry,
            slot,
            shared,
            stmt_tx,
            tc,
            lock_mode,
            lock_timeout_ms: policy
                .timeout_ms
                .unwrap_or(config.default_lock_timeout_ms),
            optimistic_lock: policy.optimistic,
            bounce_locks,
            last_change_count,
            relation_locked: false,
            config,
            last_direction: None,
            sequential_steps: 0,
            saved_position: CompressedKeyBuf::new(),
            check_lock_pending: false,
            deferred_data_fetch: false,
            row_is_placeholder: false,
            skip_saved_once: false,
            last_result: StepResult::NotFound,
            current_tuple: Tuple::new(),
            current_ref: TupleRef::default(),
            has_row: false,
            closed: false,
            stats: ScanStats::default(),
            index_search,
            data_search,
        })
    }

    // =========================================================================
    // Step protocol
    // =========================================================================

    /// Steps forward to the next row
    pub fn next(&mut self) -> Result<StepResult> {
        self.step(ScanDirection::Forward)
    }

    /// Steps backward to the previous row
    pub fn prev(&mut self) -> Result<StepResult> {
        self.step(ScanDirection::Backward)
    }

    fn step(&mut self, direction: ScanDirection) -> Result<StepResult> {
        if self.closed {
            return Err(Error::CursorClosed);
        }
        self.stats.steps += 1;
        let result = self.step_inner(direction);
        // A rowless return ends this scan burst: leave the relation gate
        // so writers can proceed and the change counter tells us about it
        if matches!(result, Ok(StepResult::NotFound) | Ok(StepResult::End)) {
            self.release_relation_gate();
        }
        if let Ok(code) = result {
            self.last_result = code;
        }
        result
    }

    fn step_inner(&mut self, direction: ScanDirection) -> Result<StepResult> {
        // A pending restart must complete before anything else moves
        if self.shared.needs_restart() {
            self.restart()?;
        }

        // A row-old broadcast invalidates the cached row
        if self.shared.take_row_old() {
            self.has_row = false;
        }

        // Pessimistic relations serialize through the relation gate and
        // watch the change counter between steps
        if self.effective_kind == RelationKind::Pessimistic
            && self.storage == StorageKind::Disk
            && !self.relation_locked
        {
            match self.txn.relation_enter(self.stmt_tx, self.relation) {
                LockReply::Granted => {
                    self.relation_locked = true;
                    let count = self.source.change_count(self.relation);
                    if count != self.last_change_count {
                        self.resync();
                        self.last_change_count = count;
                    }
                }
                LockReply::Wait => return Ok(StepResult::WaitLock),
                LockReply::Timeout => {
                    return Err(Error::LockTimeout {
                        relation: self.relation,
                    })
                }
                LockReply::Deadlock => return Err(Error::Deadlock { tx: self.stmt_tx }),
            }
        }

        if self.shared.is_aborted() {
            return Err(Error::SearchAborted {
                relation: self.relation,
            });
        }
        if self.shared.is_isolation_changed() && !self.shared.is_isolation_transparent() {
            return Err(Error::IsolationChanged);
        }

        // The previous step parked on a row lock: retry the identical row
        // instead of advancing
        if self.check_lock_pending {
            return self.finish_pending_row();
        }

        let mut retries = 0u32;
        loop {
            let step = self
                .index_search
                .step(direction, self.stmt_tx, &self.tc)?;
            self.classify_sequential(direction, step);

            match step {
                IndexStep::Found => {}
                IndexStep::NotFound => {
                    // Pessimistic scans absorb not-found steps up to a
                    // fixed bound so a burst of filtered entries does not
                    // bounce every caller
                    if self.effective_kind == RelationKind::Pessimistic
                        && retries < self.config.max_step_retries
                    {
                        retries += 1;
                        continue;
                    }
                    self.has_row = false;
                    return Ok(StepResult::NotFound);
                }
                IndexStep::End => {
                    self.has_row = false;
                    return Ok(StepResult::End);
                }
                IndexStep::WaitLock => {
                    // Deferred lock check: remember the position and that
                    // the data fetch is still owed, then try the lock now
                    self.build_current_ref()?;
                    self.check_lock_pending = true;
                    self.deferred_data_fetch = self.resolved.needs_data_fetch;
                    self.row_is_placeholder = false;
                    self.stats.lock_waits += 1;
                    return self.finish_pending_row();
                }
                IndexStep::LockPlaceholder => {
                    // A placeholder carries no visible data; lock it if
                    // the plan locks rows, then let the caller loop
                    self.build_current_ref()?;
                    if self.lock_mode.is_locking() {
                        match self.lock_current_row()? {
                            LockOutcome::Locked => {}
                            LockOutcome::Wait => {
                                self.check_lock_pending = true;
                                self.deferred_data_fetch = false;
                                self.row_is_placeholder = true;
                                return Ok(StepResult::WaitLock);
                            }
                        }
                    }
                    self.has_row = false;
                    return Ok(StepResult::NotFound);
                }
            }

            // A visible, constraint-matching entry is loaded
            if self.skip_saved_once {
                self.skip_saved_once = false;
                if self.same_as_saved()? {
                    // The resynced position landed on the row already
                    // returned before the relation changed
                    continue;
                }
            }
            self.build_current_ref()?;

            if self.resolved.needs_data_fetch {
                match self.run_data_fetch()? {
                    Some(result) => return Ok(result),
                    None => {}
                }
            }

            if self.lock_mode.is_locking() {
                match self.lock_current_row()? {
                    LockOutcome::Locked => {}
                    LockOutcome::Wait => {
                        self.check_lock_pending = true;
                        self.deferred_data_fetch = false;
                        self.row_is_placeholder = false;
                        return Ok(StepResult::WaitLock);
                    }
                }
            }

            self.materialize()?;
            self.save_position();
            self.has_row = true;
            self.stats.rows_returned += 1;
            return Ok(StepResult::Found);
        }
    }

    /// Completes the step for the row recorded by a previous wait: retry
    /// the lock, then run any owed data fetch and materialize
    fn finish_pending_row(&mut self) -> Result<StepResult> {
        match self.lock_current_row()? {
            LockOutcome::Wait => Ok(StepResult::WaitLock),
            LockOutcome::Locked => {
                self.check_lock_pending = false;
                if self.row_is_placeholder {
                    self.row_is_placeholder = false;
                    self.has_row = false;
                    return Ok(StepResult::NotFound);
                }
                if self.deferred_data_fetch {
                    self.deferred_data_fetch = false;
                    if let Some(result) = self.run_data_fetch()? {
                        return Ok(result);
                    }
                }
                self.materialize()?;
                self.save_position();
                self.has_row = true;
                self.stats.rows_returned += 1;
                Ok(StepResult::Found)
            }
        }
    }

    /// Runs the clustering fetch for the current index entry. Returns a
    /// step result to surface directly, or `None` to continue the step.
    fn run_data_fetch(&mut self) -> Result<Option<StepResult>> {
        self.stats.data_fetches += 1;
        let data = self
            .data_search
            .as_mut()
            .ok_or_else(|| Error::internal("plan needs data fetch but no data search is open"))?;
        let fetch = data.fetch(self.current_ref.key_values(), self.stmt_tx, &self.tc)?;
        match fetch {
            DataFetch::Found => Ok(None),
            DataFetch::Wait => {
                self.check_lock_pending = true;
                self.deferred_data_fetch = true;
                self.row_is_placeholder = false;
                self.stats.lock_waits += 1;
                Ok(Some(StepResult::WaitLock))
            }
            DataFetch::NotFound => {
                if data.has_constraints() {
                    // The row exists but fails the data constraints
                    self.has_row = false;
                    return Ok(Some(StepResult::NotFound));
                }
                // An unconstrained fetch must find the row the index just
                // returned. Distinguish a producer that went away from
                // true index/data disagreement.
                match self.txn.tx_state(self.index_search.srk_ref().producing_tx()) {
                    TxState::Active | TxState::Aborted => {
                        self.has_row = false;
                        Ok(Some(StepResult::NotFound))
                    }
                    TxState::Committed(_) => Err(Error::DataFetchInconsistency {
                        relation: self.relation,
                    }),
                }
            }
        }
    }

    // =========================================================================
    // Locking helper
    // =========================================================================

    fn lock_current_row(&mut self) -> Result<LockOutcome> {
        let reply = self.txn.lock_row(
            self.stmt_tx,
            self.relation,
            &self.current_ref,
            self.lock_mode,
            self.lock_timeout_ms,
        );
        match reply {
            LockReply::Granted => {
                if self.bounce_locks && self.lock_mode == LockMode::Shared {
                    // Bounce: the grant itself proved visibility; holding
                    // the lock would serialize readers for nothing
                    self.txn
                        .unlock_row(self.stmt_tx, self.relation, &self.current_ref);
                } else if self.kind.is_for_update()
                    && self.effective_kind == RelationKind::Optimistic
                    && self
                        .txn
                        .lost_update_check(self.stmt_tx, self.relation, &self.current_ref)
                {
                    self.txn
                        .unlock_row(self.stmt_tx, self.relation, &self.current_ref);
                    return Err(Error::LostUpdate {
                        relation: self.relation,
                    });
                }
                Ok(LockOutcome::Locked)
            }
            LockReply::Wait => {
                self.stats.lock_waits += 1;
                Ok(LockOutcome::Wait)
            }
            LockReply::Timeout | LockReply::Deadlock => {
                if self.optimistic_lock {
                    // Optimistic conflicts are statement retries, never
                    // hard aborts
                    Err(Error::LostUpdate {
                        relation: self.relation,
                    })
                } else if reply == LockReply::Timeout {
                    Err(Error::LockTimeout {
                        relation: self.relation,
                    })
                } else {
                    Err(Error::Deadlock { tx: self.stmt_tx })
                }
            }
        }
    }

    // =========================================================================
    // Sequential-scan classification
    // =========================================================================

    fn classify_sequential(&mut self, direction: ScanDirection, step: IndexStep) {
        if !matches!(step, IndexStep::Found | IndexStep::NotFound) {
            return;
        }
        match self.last_direction {
            Some(last) if last == direction => {
                self.sequential_steps = self.sequential_steps.saturating_add(1);
                if self.sequential_steps >= self.config.sequential_threshold
                    && !self.index_search.is_long_sequential()
                {
                    self.index_search.set_long_sequential(true);
                    if let Some(data) = self.data_search.as_mut() {
                        data.set_long_sequential(true);
                    }
                }
            }
            Some(_) => {
                self.sequential_steps = 0;
                if self.index_search.is_long_sequential() {
                    self.index_search.set_long_sequential(false);
                    if let Some(data) = self.data_search.as_mut() {
                        data.set_long_sequential(false);
                    }
                }
            }
            None => self.sequential_steps = 0,
        }
        self.last_direction = Some(direction);
    }

    // =========================================================================
    // Materialization
    // =========================================================================

    fn build_current_ref(&mut self) -> Result<()> {
        let stored = self.index_search.srk_ref().decode_values()?;
        let tref = self
            .plan
            .tuple_ref_from_entry(&stored, self.index_search.srk_ref().producing_tx())?;
        self.current_ref = tref;
        Ok(())
    }

    fn materialize(&mut self) -> Result<()> {
        if self.plan.allows_flat_materialization(&self.resolved) {
            return self.materialize_flat();
        }
        self.materialize_general()
    }

    /// Flat path: clustering entry, no BLOBs, no fetch, no descending
    /// parts — values copy across positionally
    fn materialize_flat(&mut self) -> Result<()> {
        self.current_tuple.clear();
        for source in &self.resolved.sources {
            let part = match source {
                SelectSource::Key(part) => *part,
                SelectSource::Data(_) => {
                    return Err(Error::internal("flat materialization with data source"))
                }
            };
            let value = self.index_search.srk().attr_value(part)?;
            self.current_tuple.push(value);
        }
        Ok(())
    }

    /// General path: walk the select list, fix descending parts back to
    /// ascending where the value came from the index entry, and
    /// substitute reference descriptors for BLOB attributes
    fn materialize_general(&mut self) -> Result<()> {
        self.current_tuple.clear();
        for source in &self.resolved.sources {
            let value = match source {
                SelectSource::Key(part) => {
                    let srk = self.index_search.srk();
                    let raw = srk.attr_value(*part)?;
                    if srk.key().is_blob_attr(*part) {
                        blob_ref_value(raw)?
                    } else {
                        let def = &self.plan.key.parts[*part];
                        match def.order {
                            SortOrder::Ascending => raw,
                            SortOrder::Descending => raw.from_descending_stored(def.data_type)?,
                        }
                    }
                }
                SelectSource::Data(part) => {
                    let data = self.data_search.as_mut().ok_or_else(|| {
                        Error::internal("data select source without data search")
                    })?;
                    let srk = data.srk();
                    let raw = srk.attr_value(*part)?;
                    if srk.key().is_blob_attr(*part) {
                        blob_ref_value(raw)?
                    } else {
                        // Data-search values are already normalized; the
                        // clustering tree stores ascending forms
                        raw
                    }
                }
            };
            self.current_tuple.push(value);
        }
        Ok(())
    }

    fn save_position(&mut self) {
        if !self.index_search.last_key(&mut self.saved_position) {
            self.saved_position
                .load(self.index_search.srk_ref().key().as_bytes());
        }
    }

    // =========================================================================
    // Reset / restart / resync
    // =========================================================================

    /// Rebinds the cursor to a new plan in place: sub-searches are reset,
    /// not reallocated, and the registry entry is checked out for the
    /// duration so broadcasts cannot interleave
    pub fn reset(&mut self, plan: Arc<SearchPlan>) -> Result<()> {
        if self.closed {
            return Err(Error::CursorClosed);
        }
        let registry = Arc::clone(&self.registry);
        let checkout = registry.checkout();

        let resolved = plan.resolve_select()?;
        self.index_search.reset(
            Some(plan.range.clone()),
            Some(plan.key_constraints.clone()),
        );
        match (&mut self.data_search, resolved.needs_data_fetch) {
            (Some(data), true) => data.reset(&plan)?,
            (slot @ None, true) => {
                *slot = Some(DataSearch::open(
                    self.source.as_ref(),
                    &plan,
                    self.effective_kind == RelationKind::Pessimistic,
                )?);
            }
            (_, false) => {}
        }

        self.tc.rebuild(self.txn.as_ref(), self.stmt_tx);
        self.clear_scan_progress();
        self.release_relation_gate();
        self.shared.bind_tx(self.stmt_tx);
        self.shared.set_needs_restart(false);
        self.shared.clear_isolation_changed();
        self.shared.set_active(true);
        self.last_change_count = self.source.change_count(self.relation);
        drop(checkout);

        // The old plan is released only after the registry entry is
        // checked back in and the new derivations are in place
        self.resolved = resolved;
        self.plan = plan;
        Ok(())
    }

    /// Reset with an immediate first fetch. The fast path applies only to
    /// lock-free, non-pessimistic, no-data-fetch cursors; anything else
    /// falls back to an ordinary reset and reports not-found.
    pub fn reset_fetch(&mut self, plan: Arc<SearchPlan>) -> Result<StepResult> {
        let fast_path = !self.lock_mode.is_locking()
            && self.effective_kind != RelationKind::Pessimistic
            && !plan.resolve_select()?.needs_data_fetch;
        self.reset(plan)?;
        if !fast_path {
            return Ok(StepResult::NotFound);
        }
        self.step(ScanDirection::Forward)
    }

    /// Re-synchronizes the sub-searches with the tree after a relation
    /// change was detected between steps, preserving the saved position
    fn resync(&mut self) {
        trace!(relation = self.relation.0, "cursor resync after relation change");
        self.index_search.reset(None, None);
        if !self.saved_position.is_empty() {
            self.index_search.set_position(&self.saved_position);
            self.skip_saved_once = true;
        }
        self.stats.resyncs += 1;
    }

    /// Compares the current entry's identifying values with the saved
    /// position's
    fn same_as_saved(&self) -> Result<bool> {
        if self.saved_position.is_empty() {
            return Ok(false);
        }
        let current = self.index_search.srk_ref().decode_values()?;
        let saved = self.saved_position.decode_values()?;
        let n = self.plan.key.unique_parts;
        if current.len() < n || saved.len() < n {
            return Ok(false);
        }
        Ok(current[..n]
            .iter()
            .zip(saved[..n].iter())
            .all(|(a, b)| a.compare(b) == std::cmp::Ordering::Equal))
    }

    fn release_relation_gate(&mut self) {
        if self.relation_locked {
            self.txn.relation_exit(self.stmt_tx, self.relation);
            self.relation_locked = false;
        }
    }

    /// Rebuilds the visibility window after a transaction boundary while
    /// keeping the cursor open on the same plan. A no-op while the cursor
    /// is still bound to an open transaction.
    pub fn restart(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::CursorClosed);
        }
        if self.shared.pending_tx().is_some() {
            return Ok(());
        }
        let registry = Arc::clone(&self.registry);
        let _checkout = registry.checkout();

        self.tc.rebuild(self.txn.as_ref(), self.stmt_tx);
        self.clear_scan_progress();
        self.index_search.reset(None, None);
        if self.resolved.needs_data_fetch {
            // The clustering scan is discarded and reopened, not reset
            self.data_search = Some(DataSearch::open(
                self.source.as_ref(),
                &self.plan,
                self.effective_kind == RelationKind::Pessimistic,
            )?);
        }
        self.shared.set_needs_restart(false);
        self.shared.set_active(true);
        self.stats.restarts += 1;
        debug!(relation = self.relation.0, "cursor restarted");
        Ok(())
    }

    fn clear_scan_progress(&mut self) {
        self.last_direction = None;
        self.sequential_steps = 0;
        self.check_lock_pending = false;
        self.deferred_data_fetch = false;
        self.row_is_placeholder = false;
        self.skip_saved_once = false;
        self.has_row = false;
        self.saved_position.clear();
        if self.index_search.is_long_sequential() {
            self.index_search.set_long_sequential(false);
        }
        if let Some(data) = self.data_search.as_mut() {
            if data.is_long_sequential() {
                data.set_long_sequential(false);
            }
        }
    }

    // =========================================================================
    // Positioning
    // =========================================================================

    /// Positions past the range end (forward) or before its start
    /// (backward); a step in the opposite direction yields the extreme row
    pub fn goto_end(&mut self, direction: ScanDirection) {
        self.index_search.goto_end(direction);
        self.last_direction = None;
        self.sequential_steps = 0;
        self.check_lock_pending = false;
        self.has_row = false;
    }

    /// Positions the scan from a tuple's key-part values; the next step
    /// returns the row matching them exactly
    pub fn set_position(&mut self, key_values: &[Value]) -> Result<()> {
        let mut stored: Vec<Value> = Vec::with_capacity(key_values.len());
        for (i, value) in key_values.iter().enumerate() {
            let part = self.plan.key.parts.get(i).ok_or_else(|| {
                Error::corrupt_key(format!("position value {} has no key part", i))
            })?;
            stored.push(match part.order {
                SortOrder::Ascending => value.clone(),
                SortOrder::Descending => value.to_descending_stored(),
            });
        }
        let key = CompressedKeyBuf::from_values(&stored);
        self.index_search.set_position(&key);
        self.last_direction = None;
        self.sequential_steps = 0;
        self.check_lock_pending = false;
        self.has_row = false;
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The materialized row of the last `Found` step
    pub fn tuple(&self) -> Option<&Tuple> {
        self.has_row.then_some(&self.current_tuple)
    }

    /// Value at a select-list position of the current row
    pub fn attribute_value_at(&self, index: usize) -> Option<&Value> {
        self.tuple().and_then(|t| t.get(index))
    }

    /// The lockable reference of the current row
    pub fn tuple_ref(&self) -> Option<&TupleRef> {
        (self.has_row || self.check_lock_pending).then_some(&self.current_ref)
    }

    /// The clustering entry fetched for the current row, when the plan
    /// ran a data search
    pub fn current_clustering_entry(&self) -> Option<&SearchReturnKey> {
        if !self.has_row {
            return None;
        }
        self.data_search.as_ref().map(|d| d.srk_ref())
    }

    /// Whether the registry has signalled that the plan is stale
    pub fn needs_new_plan(&self) -> bool {
        self.shared.needs_new_plan()
    }

    /// Clears the stale-plan signal, returning whether it was set
    pub fn clear_new_plan(&self) -> bool {
        self.shared.take_new_plan()
    }

    /// Result code of the most recent step
    pub fn last_result(&self) -> StepResult {
        self.last_result
    }

    /// Per-cursor counters
    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    /// The cursor's relation
    pub fn relation(&self) -> RelationId {
        self.relation
    }

    /// The effective concurrency discipline after construction-time
    /// reclassification
    pub fn effective_kind(&self) -> RelationKind {
        self.effective_kind
    }

    /// Whether both sub-searches are currently marked long-sequential
    pub fn is_long_sequential(&self) -> bool {
        self.index_search.is_long_sequential()
            && self
                .data_search
                .as_ref()
                .map_or(true, |d| d.is_long_sequential())
    }

    /// The visibility window in force (diagnostics)
    pub fn time_constraint(&self) -> &TimeConstraint {
        &self.tc
    }

    /// Shared flag block (diagnostics and tests)
    pub fn shared_state(&self) -> &Arc<SharedCursorState> {
        &self.shared
    }

    /// Closes the cursor: deregisters it and leaves the relation gate.
    /// Idempotent; also performed on drop.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.release_relation_gate();
        self.registry.deregister(self.slot);
        debug!(relation = self.relation.0, "cursor closed");
    }
}

impl Drop for SearchCursor {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SearchCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchCursor")
            .field("relation", &self.relation)
            .field("key", &self.plan.key.id)
            .field("kind", &self.kind)
            .field("effective_kind", &self.effective_kind)
            .field("has_row", &self.has_row)
            .field("closed", &self.closed)
            .finish()
    }
}

fn blob_ref_value(raw: Value) -> Result<Value> {
    match raw {
        Value::Blob(bytes) => Ok(Value::BlobRef(BlobRef::from_bytes(&bytes)?)),
        Value::Null => Ok(Value::Null),
        other => Err(Error::corrupt_key(format!(
            "blob-flagged attribute holds {:?}",
            other
        ))),
    }
}

/// Cursor over one relation, dispatching on where its rows live
///
/// Disk and in-memory relations share the step protocol but differ in
/// ambient behavior: an in-memory cursor takes no relation gate and never
/// bounce-locks. The variant is chosen once from the relation's storage
/// kind.
pub enum RelationCursor {
    Disk(SearchCursor),
    MainMemory(SearchCursor),
}

impl RelationCursor {
    /// Opens the cursor variant matching the relation's storage kind
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        txn: Arc<dyn TxnSystem>,
        source: Arc<dyn TreeSource>,
        registry: Arc<UserSearchRegistry>,
        stmt_tx: TxId,
        plan: Arc<SearchPlan>,
        kind: CursorKind,
        config: ScanConfig,
        isolation_transparent: bool,
    ) -> Result<RelationCursor> {
        let storage = txn.storage_kind(plan.relation);
        let cursor = SearchCursor::create(
            txn,
            source,
            registry,
            stmt_tx,
            plan,
            kind,
            config,
            isolation_transparent,
        )?;
        Ok(match storage {
            StorageKind::Disk => RelationCursor::Disk(cursor),
            StorageKind::MainMemory => RelationCursor::MainMemory(cursor),
        })
    }

    /// Where this cursor's relation lives
    pub fn kind(&self) -> StorageKind {
        match self {
            RelationCursor::Disk(_) => StorageKind::Disk,
            RelationCursor::MainMemory(_) => StorageKind::MainMemory,
        }
    }

    /// Steps forward
    pub fn next(&mut self) -> Result<StepResult> {
        match self {
            RelationCursor::Disk(c) | RelationCursor::MainMemory(c) => c.next(),
        }
    }

    /// Steps backward
    pub fn prev(&mut self) -> Result<StepResult> {
        match self {
            RelationCursor::Disk(c) | RelationCursor::MainMemory(c) => c.prev(),
        }
    }

    /// The current row
    pub fn tuple(&self) -> Option<&Tuple> {
        match self {
            RelationCursor::Disk(c) | RelationCursor::MainMemory(c) => c.tuple(),
        }
    }

    /// Rebinds to a new plan
    pub fn reset(&mut self, plan: Arc<SearchPlan>) -> Result<()> {
        match self {
            RelationCursor::Disk(c) | RelationCursor::MainMemory(c) => c.reset(plan),
        }
    }

    /// Closes the cursor
    pub fn close(&mut self) {
        match self {
            RelationCursor::Disk(c) | RelationCursor::MainMemory(c) => c.close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DataType, InvalidationCause, IsolationLevel, KeyId};
    use crate::mem::{MemTree, MemTreeSource, MemTxnSystem, RelationConfig};
    use crate::plan::{KeyPart, KeyRange, SearchKey};

    struct Fixture {
        txn: Arc<MemTxnSystem>,
        source: Arc<MemTreeSource>,
        registry: Arc<UserSearchRegistry>,
        tree: Arc<MemTree>,
    }

    fn fixture(config: RelationConfig) -> Fixture {
        let txn = Arc::new(MemTxnSystem::new());
        let source = Arc::new(MemTreeSource::new());
        let registry = Arc::new(UserSearchRegistry::new());
        txn.configure_relation(RelationId(1), config);
        let tree = source.add_tree(RelationId(1), KeyId(1), 1);
        Fixture {
            txn,
            source,
            registry,
            tree,
        }
    }

    fn plan(range: KeyRange) -> Arc<SearchPlan> {
        let key = SearchKey::clustering(
            KeyId(1),
            vec![
                KeyPart::asc(0, DataType::Integer),
                KeyPart::asc(1, DataType::Text),
            ],
            1,
        );
        Arc::new(SearchPlan {
            relation: RelationId(1),
            key: key.clone(),
            clustering_key: key,
            range,
            key_constraints: Vec::new(),
            data_constraints: Vec::new(),
            select: vec![0, 1],
            clustering_ref_parts: vec![0],
        })
    }

    fn open(f: &Fixture, tx: TxId, kind: CursorKind, p: Arc<SearchPlan>) -> SearchCursor {
        SearchCursor::create(
            Arc::clone(&f.txn) as Arc<dyn TxnSystem>,
            Arc::clone(&f.source) as Arc<dyn TreeSource>,
            Arc::clone(&f.registry),
            tx,
            p,
            kind,
            ScanConfig::default(),
            false,
        )
        .unwrap()
    }

    fn seed(f: &Fixture, rows: &[(i64, &str)]) {
        let writer = f.txn.begin();
        for (id, name) in rows {
            f.tree
                .insert(&[Value::Integer(*id), Value::text(*name)], writer, false, 0);
        }
        f.txn.commit(writer);
    }

    #[test]
    fn test_forward_scan_materializes_rows() {
        let f = fixture(RelationConfig::lock_free());
        seed(&f, &[(1, "a"), (2, "b")]);

        let reader = f.txn.begin();
        let mut cursor = open(&f, reader, CursorKind::Read, plan(KeyRange::all()));

        assert_eq!(cursor.next().unwrap(), StepResult::Found);
        assert_eq!(cursor.tuple().unwrap().get(1), Some(&Value::text("a")));
        assert_eq!(cursor.attribute_value_at(0), Some(&Value::Integer(1)));
        assert!(cursor.tuple_ref().is_some());

        assert_eq!(cursor.next().unwrap(), StepResult::Found);
        assert_eq!(cursor.next().unwrap(), StepResult::End);
        assert!(cursor.tuple().is_none());
        cursor.close();
    }

    #[test]
    fn test_pessimistic_without_shared_locks_is_reclassified() {
        let mut config = RelationConfig::pessimistic();
        config.policy.uses_shared_locks = false;
        let f = fixture(config);
        f.txn.set_isolation(IsolationLevel::ReadCommitted);

        let reader = f.txn.begin();
        let cursor = open(&f, reader, CursorKind::Read, plan(KeyRange::all()));
        assert_eq!(cursor.effective_kind(), RelationKind::Optimistic);
    }

    #[test]
    fn test_pessimistic_survives_under_serializable() {
        let mut config = RelationConfig::pessimistic();
        config.policy.uses_shared_locks = false;
        let f = fixture(config);
        f.txn.set_isolation(IsolationLevel::Serializable);

        let reader = f.txn.begin();
        let cursor = open(&f, reader, CursorKind::Read, plan(KeyRange::all()));
        assert_eq!(cursor.effective_kind(), RelationKind::Pessimistic);
    }

    #[test]
    fn test_goto_end_then_prev_returns_last_row() {
        let f = fixture(RelationConfig::lock_free());
        seed(&f, &[(1, "a"), (2, "b"), (3, "c")]);

        let reader = f.txn.begin();
        let mut cursor = open(&f, reader, CursorKind::Read, plan(KeyRange::all()));
        cursor.goto_end(ScanDirection::Forward);
        assert_eq!(cursor.prev().unwrap(), StepResult::Found);
        assert_eq!(cursor.tuple().unwrap().get(0), Some(&Value::Integer(3)));
    }

    #[test]
    fn test_abort_broadcast_surfaces_as_error() {
        let f = fixture(RelationConfig::lock_free());
        seed(&f, &[(1, "a")]);

        let reader = f.txn.begin();
        let mut cursor = open(&f, reader, CursorKind::Read, plan(KeyRange::all()));
        f.registry.abort_by_relation(RelationId(1));

        assert!(matches!(
            cursor.next(),
            Err(Error::SearchAborted { .. })
        ));
    }

    #[test]
    fn test_isolation_change_surfaces_as_error() {
        let f = fixture(RelationConfig::lock_free());
        seed(&f, &[(1, "a")]);

        let reader = f.txn.begin();
        let mut cursor = open(&f, reader, CursorKind::Read, plan(KeyRange::all()));
        f.registry
            .invalidate_by_tx(reader, InvalidationCause::IsolationChange);

        assert_eq!(cursor.next(), Err(Error::IsolationChanged));
    }

    #[test]
    fn test_isolation_transparent_cursor_keeps_stepping() {
        let f = fixture(RelationConfig::lock_free());
        seed(&f, &[(1, "a")]);

        let reader = f.txn.begin();
        let mut cursor = SearchCursor::create(
            Arc::clone(&f.txn) as Arc<dyn TxnSystem>,
            Arc::clone(&f.source) as Arc<dyn TreeSource>,
            Arc::clone(&f.registry),
            reader,
            plan(KeyRange::all()),
            CursorKind::Read,
            ScanConfig::default(),
            true,
        )
        .unwrap();
        f.registry
            .invalidate_by_tx(reader, InvalidationCause::IsolationChange);

        assert_eq!(cursor.next().unwrap(), StepResult::Found);
    }

    #[test]
    fn test_restart_is_noop_while_bound() {
        let f = fixture(RelationConfig::lock_free());
        seed(&f, &[(1, "a")]);

        let reader = f.txn.begin();
        let mut cursor = open(&f, reader, CursorKind::Read, plan(KeyRange::all()));
        let level_before = cursor.time_constraint().max_version();

        // Move the global version forward
        let writer = f.txn.begin();
        f.txn.commit(writer);

        // Still bound to its transaction: restart must not touch anything
        cursor.restart().unwrap();
        assert_eq!(cursor.time_constraint().max_version(), level_before);
        assert_eq!(cursor.stats().restarts, 0);

        // After the commit broadcast unbinds it, restart takes effect
        f.registry
            .invalidate_by_tx(reader, InvalidationCause::Commit);
        cursor.restart().unwrap();
        assert!(cursor.time_constraint().max_version() > level_before);
        assert_eq!(cursor.stats().restarts, 1);
    }

    #[test]
    fn test_closed_cursor_rejects_steps() {
        let f = fixture(RelationConfig::lock_free());
        let reader = f.txn.begin();
        let mut cursor = open(&f, reader, CursorKind::Read, plan(KeyRange::all()));
        cursor.close();
        assert_eq!(cursor.next(), Err(Error::CursorClosed));
        assert_eq!(f.registry.live_count(), 0);
    }

    #[test]
    fn test_close_is_idempotent_and_runs_on_drop() {
        let f = fixture(RelationConfig::lock_free());
        let reader = f.txn.begin();
        {
            let mut cursor = open(&f, reader, CursorKind::Read, plan(KeyRange::all()));
            cursor.close();
            cursor.close();
            assert_eq!(f.registry.live_count(), 0);
        }
        // Drop after close must not deregister twice
        assert_eq!(f.registry.live_count(), 0);

        {
            let _cursor = open(&f, reader, CursorKind::Read, plan(KeyRange::all()));
            assert_eq!(f.registry.live_count(), 1);
        }
        assert_eq!(f.registry.live_count(), 0);
    }

    #[test]
    fn test_relation_cursor_kind_dispatch() {
        let f = fixture(RelationConfig::lock_free().in_memory());
        seed(&f, &[(1, "a")]);

        let reader = f.txn.begin();
        let mut cursor = RelationCursor::create(
            Arc::clone(&f.txn) as Arc<dyn TxnSystem>,
            Arc::clone(&f.source) as Arc<dyn TreeSource>,
            Arc::clone(&f.registry),
            reader,
            plan(KeyRange::all()),
            CursorKind::Read,
            ScanConfig::default(),
            false,
        )
        .unwrap();

        assert_eq!(cursor.kind(), StorageKind::MainMemory);
        assert_eq!(cursor.next().unwrap(), StepResult::Found);
        assert_eq!(cursor.tuple().unwrap().get(0), Some(&Value::Integer(1)));
        cursor.close();
    }
}
