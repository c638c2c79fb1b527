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

//! User search registry
//!
//! Per-connection list of live cursors. Administrative events (commit,
//! isolation change, schema drop) arrive on other threads and are
//! broadcast to every registered cursor as flag mutations; the stepping
//! thread observes the flags at its next step. All list mutation and all
//! broadcast flag mutation happens under the registry's exclusive-checkout
//! lock, which the stepping thread also takes around reset and restart —
//! never around an ordinary step.
//!
//! Freed slots are recycled so a connection that churns cursors keeps its
//! registry compact.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::core::{InvalidationCause, KeyId, RelationId, TxId};

/// Cursor state shared between the stepping thread and registry
/// broadcasts. Broadcasts only ever touch these flags, never cursor
/// internals.
#[derive(Debug)]
pub struct SharedCursorState {
    relation: RelationId,
    key: KeyId,
    isolation_transparent: bool,
    active: AtomicBool,
    needs_restart: AtomicBool,
    aborted: AtomicBool,
    isolation_changed: AtomicBool,
    row_old: AtomicBool,
    new_plan_needed: AtomicBool,
    /// Transaction currently bound to the cursor; zero when unbound
    pending_tx: AtomicI64,
}

impl SharedCursorState {
    /// Creates the shared state for a new cursor
    pub fn new(
        relation: RelationId,
        key: KeyId,
        bound_tx: TxId,
        isolation_transparent: bool,
    ) -> Self {
        Self {
            relation,
            key,
            isolation_transparent,
            active: AtomicBool::new(true),
            needs_restart: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            isolation_changed: AtomicBool::new(false),
            row_old: AtomicBool::new(false),
            new_plan_needed: AtomicBool::new(false),
            pending_tx: AtomicI64::new(bound_tx.0),
        }
    }

    /// Relation the cursor scans
    pub fn relation(&self) -> RelationId {
        self.relation
    }

    /// Key the cursor scans
    pub fn key(&self) -> KeyId {
        self.key
    }

    /// Whether the cursor is exempt from isolation-change invalidation
    pub fn is_isolation_transparent(&self) -> bool {
        self.isolation_transparent
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, on: bool) {
        self.active.store(on, Ordering::Release);
    }

    pub fn needs_restart(&self) -> bool {
        self.needs_restart.load(Ordering::Acquire)
    }

    pub fn set_needs_restart(&self, on: bool) {
        self.needs_restart.store(on, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn set_aborted(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn is_isolation_changed(&self) -> bool {
        self.isolation_changed.load(Ordering::Acquire)
    }

    pub fn clear_isolation_changed(&self) {
        self.isolation_changed.store(false, Ordering::Release);
    }

    pub fn is_row_old(&self) -> bool {
        self.row_old.load(Ordering::Acquire)
    }

    /// Consumes the row-old mark, returning whether it was set
    pub fn take_row_old(&self) -> bool {
        self.row_old.swap(false, Ordering::AcqRel)
    }

    pub fn needs_new_plan(&self) -> bool {
        self.new_plan_needed.load(Ordering::Acquire)
    }

    /// Clears the new-plan signal, returning whether it was set
    pub fn take_new_plan(&self) -> bool {
        self.new_plan_needed.swap(false, Ordering::AcqRel)
    }

    /// Transaction the cursor is currently bound to
    pub fn pending_tx(&self) -> TxId {
        TxId(self.pending_tx.load(Ordering::Acquire))
    }

    /// Binds the cursor to a transaction
    pub fn bind_tx(&self, tx: TxId) {
        self.pending_tx.store(tx.0, Ordering::Release);
    }

    /// Clears the transaction binding
    pub fn unbind_tx(&self) {
        self.pending_tx.store(TxId::NONE.0, Ordering::Release);
    }
}

/// Identifier of a registry slot; returned at registration, needed for
/// deregistration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotId(usize);

#[derive(Default)]
struct RegistrySlots {
    entries: Vec<Option<Arc<SharedCursorState>>>,
    free: Vec<usize>,
}

/// Exclusive checkout of the registry; while the guard lives, no
/// broadcast and no other reset/restart can run
pub struct RegistryCheckout<'a> {
    guard: MutexGuard<'a, RegistrySlots>,
}

impl RegistryCheckout<'_> {
    /// Number of live cursors under the checkout
    pub fn live_count(&self) -> usize {
        self.guard.entries.iter().flatten().count()
    }
}

/// Per-connection registry of live cursors
#[derive(Default)]
pub struct UserSearchRegistry {
    slots: Mutex<RegistrySlots>,
}

impl UserSearchRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a cursor, recycling a freed slot when available
    pub fn register(&self, state: Arc<SharedCursorState>) -> SlotId {
        let mut slots = self.slots.lock();
        if let Some(index) = slots.free.pop() {
            slots.entries[index] = Some(state);
            SlotId(index)
        } else {
            slots.entries.push(Some(state));
            SlotId(slots.entries.len() - 1)
        }
    }

    /// Removes a cursor; its slot becomes recyclable
    pub fn deregister(&self, slot: SlotId) {
        let mut slots = self.slots.lock();
        if let Some(entry) = slots.entries.get_mut(slot.0) {
            if entry.take().is_some() {
                slots.free.push(slot.0);
            }
        }
    }

    /// Exclusively checks the registry out. Reset and restart take this
    /// to block concurrent broadcasts while they mutate cursor state.
    pub fn checkout(&self) -> RegistryCheckout<'_> {
        RegistryCheckout {
            guard: self.slots.lock(),
        }
    }

    /// Number of live cursors
    pub fn live_count(&self) -> usize {
        self.slots.lock().entries.iter().flatten().count()
    }

    fn for_each(&self, mut apply: impl FnMut(&SharedCursorState)) {
        let slots = self.slots.lock();
        for state in slots.entries.iter().flatten() {
            apply(state);
        }
    }

    /// Commit-time broadcast: every cursor must rebuild its visibility
    /// window before its next step. Transaction bindings are released.
    pub fn restart_all(&self) {
        debug!("registry broadcast: restart all cursors");
        self.for_each(|state| {
            state.unbind_tx();
            state.set_needs_restart(true);
            state.set_active(false);
        });
    }

    /// Invalidates cursors bound to `tx` for the given cause
    pub fn invalidate_by_tx(&self, tx: TxId, cause: InvalidationCause) {
        debug!(tx = tx.0, ?cause, "registry broadcast: invalidate");
        self.for_each(|state| match cause {
            InvalidationCause::Commit => {
                if state.pending_tx() == tx {
                    state.unbind_tx();
                    state.set_needs_restart(true);
                    state.set_active(false);
                }
            }
            InvalidationCause::IsolationChange => {
                if !state.is_isolation_transparent() {
                    state.isolation_changed.store(true, Ordering::Release);
                    state.set_active(false);
                }
            }
        });
    }

    /// Aborts every cursor scanning the given relation
    pub fn abort_by_relation(&self, relation: RelationId) {
        debug!(relation = relation.0, "registry broadcast: abort by relation");
        self.for_each(|state| {
            if state.relation() == relation {
                state.set_aborted();
                state.set_active(false);
            }
        });
    }

    /// Aborts every cursor scanning the given key
    pub fn abort_by_key(&self, key: KeyId) {
        debug!(key = key.0, "registry broadcast: abort by key");
        self.for_each(|state| {
            if state.key() == key {
                state.set_aborted();
                state.set_active(false);
            }
        });
    }

    /// Marks the current row of every cursor on the relation stale, so
    /// cached tuples are rebuilt before reuse
    pub fn mark_row_old(&self, relation: RelationId) {
        self.for_each(|state| {
            if state.relation() == relation {
                state.row_old.store(true, Ordering::Release);
            }
        });
    }

    /// Signals every cursor on the relation that its plan is stale and
    /// the statement must re-plan before the next execution
    pub fn force_replan(&self, relation: RelationId) {
        debug!(relation = relation.0, "registry broadcast: force replan");
        self.for_each(|state| {
            if state.relation() == relation {
                state.new_plan_needed.store(true, Ordering::Release);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(relation: u32, key: u32, tx: i64) -> Arc<SharedCursorState> {
        Arc::new(SharedCursorState::new(
            RelationId(relation),
            KeyId(key),
            TxId(tx),
            false,
        ))
    }

    #[test]
    fn test_register_recycles_slots() {
        let registry = UserSearchRegistry::new();
        let a = registry.register(state(1, 1, 1));
        let b = registry.register(state(1, 2, 1));
        assert_ne!(a, b);
        assert_eq!(registry.live_count(), 2);

        registry.deregister(a);
        assert_eq!(registry.live_count(), 1);

        // The freed slot is reused
        let c = registry.register(state(1, 3, 1));
        assert_eq!(c, a);
        assert_eq!(registry.live_count(), 2);
    }

    #[test]
    fn test_deregister_twice_is_harmless() {
        let registry = UserSearchRegistry::new();
        let a = registry.register(state(1, 1, 1));
        registry.deregister(a);
        registry.deregister(a);
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_invalidate_by_tx_commit() {
        let registry = UserSearchRegistry::new();
        let bound = state(1, 1, 7);
        let other = state(1, 2, 8);
        registry.register(Arc::clone(&bound));
        registry.register(Arc::clone(&other));

        registry.invalidate_by_tx(TxId(7), InvalidationCause::Commit);

        assert!(bound.needs_restart());
        assert!(!bound.is_active());
        assert_eq!(bound.pending_tx(), TxId::NONE);
        assert!(!other.needs_restart());
        assert!(other.is_active());
    }

    #[test]
    fn test_isolation_change_spares_transparent_cursors() {
        let registry = UserSearchRegistry::new();
        let plain = state(1, 1, 7);
        let transparent = Arc::new(SharedCursorState::new(
            RelationId(1),
            KeyId(2),
            TxId(7),
            true,
        ));
        registry.register(Arc::clone(&plain));
        registry.register(Arc::clone(&transparent));

        registry.invalidate_by_tx(TxId(7), InvalidationCause::IsolationChange);

        assert!(plain.is_isolation_changed());
        assert!(!plain.is_active());
        assert!(!transparent.is_isolation_changed());
        assert!(transparent.is_active());
    }

    #[test]
    fn test_abort_broadcasts_filter_by_target() {
        let registry = UserSearchRegistry::new();
        let on_rel = state(1, 1, 7);
        let off_rel = state(2, 9, 7);
        registry.register(Arc::clone(&on_rel));
        registry.register(Arc::clone(&off_rel));

        registry.abort_by_relation(RelationId(1));
        assert!(on_rel.is_aborted());
        assert!(!off_rel.is_aborted());

        registry.abort_by_key(KeyId(9));
        assert!(off_rel.is_aborted());
    }

    #[test]
    fn test_row_old_and_replan_flags() {
        let registry = UserSearchRegistry::new();
        let s = state(3, 1, 7);
        registry.register(Arc::clone(&s));

        registry.mark_row_old(RelationId(3));
        assert!(s.is_row_old());
        assert!(s.take_row_old());
        assert!(!s.is_row_old());

        registry.force_replan(RelationId(3));
        assert!(s.needs_new_plan());
        assert!(s.take_new_plan());
        assert!(!s.needs_new_plan());
    }

    #[test]
    fn test_restart_all() {
        let registry = UserSearchRegistry::new();
        let a = state(1, 1, 7);
        let b = state(2, 2, 8);
        registry.register(Arc::clone(&a));
        registry.register(Arc::clone(&b));

        registry.restart_all();

        for s in [&a, &b] {
            assert!(s.needs_restart());
            assert!(!s.is_active());
            assert_eq!(s.pending_tx(), TxId::NONE);
        }
    }

    #[test]
    fn test_checkout_blocks_broadcasts() {
        let registry = Arc::new(UserSearchRegistry::new());
        let s = state(1, 1, 7);
        registry.register(Arc::clone(&s));

        let checkout = registry.checkout();
        assert_eq!(checkout.live_count(), 1);

        // A broadcast from another thread must wait for the checkout
        let registry2 = Arc::clone(&registry);
        let handle = std::thread::spawn(move || {
            registry2.abort_by_relation(RelationId(1));
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!s.is_aborted());

        drop(checkout);
        handle.join().unwrap();
        assert!(s.is_aborted());
    }
}
