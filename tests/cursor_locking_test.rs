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

//! Locking scenarios: wait replay, optimistic degradation, deadlocks,
//! bounce locks, placeholders and pessimistic change detection.

use std::sync::Arc;

use rowscan::config::ScanConfig;
use rowscan::core::{
    CursorKind, DataType, Error, IsolationLevel, KeyId, LockMode, RelationId, StepResult,
    TupleRef, TxId, Value,
};
use rowscan::mem::{MemTree, MemTreeSource, MemTxnSystem, RelationConfig};
use rowscan::plan::{KeyPart, KeyRange, SearchKey, SearchPlan};
use rowscan::search::{SearchCursor, UserSearchRegistry};
use rowscan::traits::{TreeSource, TreeStep, TxnSystem};

const REL: RelationId = RelationId(1);
const CLUSTERING: KeyId = KeyId(1);

struct Harness {
    txn: Arc<MemTxnSystem>,
    source: Arc<MemTreeSource>,
    registry: Arc<UserSearchRegistry>,
    tree: Arc<MemTree>,
}

impl Harness {
    fn new(config: RelationConfig) -> Self {
        let txn = Arc::new(MemTxnSystem::new());
        let source = Arc::new(MemTreeSource::new());
        let registry = Arc::new(UserSearchRegistry::new());
        txn.configure_relation(REL, config);
        let tree = source.add_tree(REL, CLUSTERING, 1);
        Self {
            txn,
            source,
            registry,
            tree,
        }
    }

    fn seed(&self, ids: &[i64]) {
        let writer = self.txn.begin();
        for id in ids {
            self.tree
                .insert(&[Value::Integer(*id), Value::text("row")], writer, false, 0);
        }
        self.txn.commit(writer);
    }

    fn plan(&self) -> Arc<SearchPlan> {
        let key = SearchKey::clustering(
            CLUSTERING,
            vec![
                KeyPart::asc(0, DataType::Integer),
                KeyPart::asc(1, DataType::Text),
            ],
            1,
        );
        Arc::new(SearchPlan {
            relation: REL,
            key: key.clone(),
            clustering_key: key,
            range: KeyRange::all(),
            key_constraints: Vec::new(),
            data_constraints: Vec::new(),
            select: vec![0, 1],
            clustering_ref_parts: vec![0],
        })
    }

    fn open(&self, tx: TxId, kind: CursorKind) -> SearchCursor {
        self.open_with_config(tx, kind, ScanConfig::default())
    }

    fn open_with_config(&self, tx: TxId, kind: CursorKind, config: ScanConfig) -> SearchCursor {
        SearchCursor::create(
            Arc::clone(&self.txn) as Arc<dyn TxnSystem>,
            Arc::clone(&self.source) as Arc<dyn TreeSource>,
            Arc::clone(&self.registry),
            tx,
            self.plan(),
            kind,
            config,
            false,
        )
        .unwrap()
    }

    fn row(&self, id: i64) -> TupleRef {
        TupleRef::new([Value::Integer(id)], TxId::NONE)
    }
}

fn current_key(cursor: &SearchCursor) -> i64 {
    cursor.tuple().unwrap().get(0).unwrap().as_integer().unwrap()
}

#[test]
fn test_lock_wait_replays_same_row() {
    let h = Harness::new(RelationConfig::optimistic());
    h.seed(&[1, 2, 3]);

    let holder = h.txn.begin();
    assert_eq!(
        h.txn
            .lock_row(holder, REL, &h.row(2), LockMode::Exclusive, 100),
        rowscan::traits::LockReply::Granted
    );

    let reader = h.txn.begin();
    let mut cursor = h.open(reader, CursorKind::ForUpdate);

    assert_eq!(cursor.next().unwrap(), StepResult::Found);
    assert_eq!(current_key(&cursor), 1);

    // Row 2 is held: the step parks
    assert_eq!(cursor.next().unwrap(), StepResult::WaitLock);
    assert_eq!(cursor.last_result(), StepResult::WaitLock);
    // Re-invoking without the lock released parks again, same position
    assert_eq!(cursor.next().unwrap(), StepResult::WaitLock);
    assert!(cursor.stats().lock_waits >= 2);

    // Once released, the next call returns the row that triggered the
    // wait, not a new position
    h.txn.unlock_row(holder, REL, &h.row(2));
    assert_eq!(cursor.next().unwrap(), StepResult::Found);
    assert_eq!(current_key(&cursor), 2);

    assert_eq!(cursor.next().unwrap(), StepResult::Found);
    assert_eq!(current_key(&cursor), 3);
    assert_eq!(cursor.next().unwrap(), StepResult::End);
}

#[test]
fn test_optimistic_lock_timeout_degrades_to_lost_update() {
    let h = Harness::new(RelationConfig::optimistic().with_timeout_ms(0));
    h.seed(&[1]);

    let holder = h.txn.begin();
    h.txn
        .lock_row(holder, REL, &h.row(1), LockMode::Exclusive, 100);

    let reader = h.txn.begin();
    let mut cursor = h.open(reader, CursorKind::ForUpdate);

    let err = cursor.next().unwrap_err();
    assert!(matches!(err, Error::LostUpdate { .. }));
    assert!(!matches!(err, Error::Deadlock { .. }));
}

#[test]
fn test_for_update_lost_update_check_after_grant() {
    let h = Harness::new(RelationConfig::optimistic());
    h.txn.set_isolation(IsolationLevel::Repeatable);
    h.seed(&[1]);

    let reader = h.txn.begin();

    // The row is modified and committed after the reader's snapshot
    let writer = h.txn.begin();
    let at = h.txn.commit(writer);
    h.txn.note_modified(REL, &[Value::Integer(1)], at);

    let mut cursor = h.open(reader, CursorKind::ForUpdate);
    assert!(matches!(
        cursor.next(),
        Err(Error::LostUpdate { .. })
    ));

    // The failed lock was released on the way out
    let other = h.txn.begin();
    assert_eq!(
        h.txn
            .lock_row(other, REL, &h.row(1), LockMode::Exclusive, 100),
        rowscan::traits::LockReply::Granted
    );
}

#[test]
fn test_pessimistic_deadlock_is_hard_error() {
    let h = Harness::new(RelationConfig::pessimistic());
    h.seed(&[1]);

    let reader = h.txn.begin();
    // The reader already holds row 9; the other transaction holds row 1
    // and is waiting on row 9
    assert_eq!(
        h.txn.lock_row(reader, REL, &h.row(9), LockMode::Exclusive, 100),
        rowscan::traits::LockReply::Granted
    );
    let other = h.txn.begin();
    assert_eq!(
        h.txn.lock_row(other, REL, &h.row(1), LockMode::Exclusive, 100),
        rowscan::traits::LockReply::Granted
    );
    assert_eq!(
        h.txn.lock_row(other, REL, &h.row(9), LockMode::Exclusive, 100),
        rowscan::traits::LockReply::Wait
    );

    let mut cursor = h.open(reader, CursorKind::Read);
    assert!(matches!(cursor.next(), Err(Error::Deadlock { .. })));
}

#[test]
fn test_bounce_lock_releases_after_validation() {
    let h = Harness::new(RelationConfig::optimistic());
    h.seed(&[1]);

    let reader = h.txn.begin();
    let mut cursor = h.open(reader, CursorKind::Read);
    assert_eq!(cursor.next().unwrap(), StepResult::Found);

    // The shared lock bounced: nothing is held on the row now
    let other = h.txn.begin();
    assert_eq!(
        h.txn
            .lock_row(other, REL, &h.row(1), LockMode::Exclusive, 100),
        rowscan::traits::LockReply::Granted
    );
}

#[test]
fn test_for_update_holds_its_lock() {
    let h = Harness::new(RelationConfig::optimistic());
    h.seed(&[1]);

    let reader = h.txn.begin();
    let mut cursor = h.open(reader, CursorKind::ForUpdate);
    assert_eq!(cursor.next().unwrap(), StepResult::Found);

    // No bounce for FOR UPDATE: the update lock stays
    let other = h.txn.begin();
    assert_eq!(
        h.txn
            .lock_row(other, REL, &h.row(1), LockMode::Exclusive, 0),
        rowscan::traits::LockReply::Timeout
    );
}

#[test]
fn test_lock_placeholder_reports_not_found_and_continues() {
    let h = Harness::new(RelationConfig::optimistic());
    h.seed(&[1]);

    let writer = h.txn.begin();
    h.tree
        .insert_placeholder(&[Value::Integer(2), Value::text("pending")], writer);
    h.txn.commit(writer);
    h.seed(&[3]);

    let reader = h.txn.begin();
    let mut cursor = h.open(reader, CursorKind::Read);

    assert_eq!(cursor.next().unwrap(), StepResult::Found);
    assert_eq!(current_key(&cursor), 1);
    // The placeholder yields not-found so the caller loops
    assert_eq!(cursor.next().unwrap(), StepResult::NotFound);
    assert_eq!(cursor.next().unwrap(), StepResult::Found);
    assert_eq!(current_key(&cursor), 3);
}

#[test]
fn test_index_level_wait_arms_deferred_check() {
    let h = Harness::new(RelationConfig::optimistic());
    h.seed(&[1, 2, 3]);

    let reader = h.txn.begin();
    let mut cursor = h.open(reader, CursorKind::Read);
    assert_eq!(cursor.next().unwrap(), StepResult::Found);

    // The tree layer reports a key-level lock on the next entry while
    // another transaction holds the row
    let holder = h.txn.begin();
    h.txn
        .lock_row(holder, REL, &h.row(2), LockMode::Exclusive, 100);
    h.tree.inject_step(TreeStep::WaitLock);

    assert_eq!(cursor.next().unwrap(), StepResult::WaitLock);

    h.txn.unlock_row(holder, REL, &h.row(2));
    // The replay returns the row that triggered the wait
    assert_eq!(cursor.next().unwrap(), StepResult::Found);
    assert_eq!(current_key(&cursor), 2);
}

#[test]
fn test_pessimistic_change_detection_resyncs_preserving_position() {
    let h = Harness::new(RelationConfig::pessimistic());
    h.seed(&[1, 2, 3]);

    let reader = h.txn.begin();
    let config = ScanConfig::default().with_max_step_retries(1);
    let mut cursor = h.open_with_config(reader, CursorKind::Read, config);

    assert_eq!(cursor.next().unwrap(), StepResult::Found);
    assert_eq!(current_key(&cursor), 1);
    assert_eq!(h.txn.gate_depth(REL), 1);

    // Two stand-in not-found steps exhaust the bounded retry
    h.tree.inject_step(TreeStep::NotFound);
    h.tree.inject_step(TreeStep::NotFound);
    assert_eq!(cursor.next().unwrap(), StepResult::NotFound);
    // The rowless return released the relation gate
    assert_eq!(h.txn.gate_depth(REL), 0);

    // The relation changes while the gate is open
    h.tree.bump_change_count();

    // The next step re-enters the gate, detects the change, resyncs at
    // the saved position and carries on with row 2
    assert_eq!(cursor.next().unwrap(), StepResult::Found);
    assert_eq!(current_key(&cursor), 2);
    assert_eq!(cursor.stats().resyncs, 1);
}

#[test]
fn test_pessimistic_retry_loop_is_bounded() {
    let h = Harness::new(RelationConfig::pessimistic());
    h.seed(&[1]);

    let reader = h.txn.begin();
    let config = ScanConfig::default().with_max_step_retries(4);
    let mut cursor = h.open_with_config(reader, CursorKind::Read, config);

    // More stand-ins than the bound: the step must terminate
    for _ in 0..10 {
        h.tree.inject_step(TreeStep::NotFound);
    }
    assert_eq!(cursor.next().unwrap(), StepResult::NotFound);
}

#[test]
fn test_cancel_propagates_immediately() {
    let h = Harness::new(RelationConfig::lock_free());
    h.seed(&[1, 2]);

    let reader = h.txn.begin();
    let mut cursor = h.open(reader, CursorKind::Read);
    assert_eq!(cursor.next().unwrap(), StepResult::Found);

    h.tree.request_cancel();
    assert_eq!(cursor.next(), Err(Error::Cancelled));

    // Cooperative: clearing the request lets the scan continue
    h.tree.clear_cancel();
    assert_eq!(cursor.next().unwrap(), StepResult::Found);
    assert_eq!(current_key(&cursor), 2);
}

#[test]
fn test_unique_violation_surfaces_distinctly() {
    let h = Harness::new(RelationConfig::lock_free());
    h.seed(&[1, 2]);

    let reader = h.txn.begin();
    let mut cursor = h.open(reader, CursorKind::Read);

    h.tree.inject_step(TreeStep::UniqueViolation);
    let err = cursor.next().unwrap_err();
    assert!(matches!(err, Error::UniqueViolation { .. }));
    assert!(!matches!(err, Error::Deadlock { .. }));
}
