//! Multigranularity lock manager: S/X/IS/IX modes, strict two-phase
//! locking, and a wait-for graph checked for cycles synchronously on every
//! blocked acquire so a deadlock fails fast rather than being found later
//! by a polling detector.

use std::collections::{HashMap, HashSet};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::common::TransactionId;

pub type ResourceId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    S,
    X,
    IS,
    IX,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Growing,
    Shrinking,
}

#[derive(Error, Debug, Clone)]
pub enum LockError {
    #[error("transaction {transaction} attempted to acquire a lock after its shrinking phase began")]
    PhaseViolation { transaction: TransactionId },

    #[error("transaction {transaction} deadlocked waiting for {resource} in mode {mode:?}")]
    Deadlock {
        transaction: TransactionId,
        resource: ResourceId,
        mode: LockMode,
    },

    #[error("transaction {transaction} does not hold a lock on {resource}")]
    NotHeld {
        transaction: TransactionId,
        resource: ResourceId,
    },
}

fn compatible(held: LockMode, requested: LockMode) -> bool {
    use LockMode::*;
    matches!(
        (held, requested),
        (S, S) | (S, IS) | (IS, S) | (IS, IS) | (IS, IX) | (IX, IS) | (IX, IX)
    )
}

#[derive(Default)]
struct ResourceEntry {
    s: HashSet<TransactionId>,
    x: HashSet<TransactionId>,
    is_: HashSet<TransactionId>,
    ix: HashSet<TransactionId>,
}

impl ResourceEntry {
    fn is_empty(&self) -> bool {
        self.s.is_empty() && self.x.is_empty() && self.is_.is_empty() && self.ix.is_empty()
    }

    fn set_for_mut(&mut self, mode: LockMode) -> &mut HashSet<TransactionId> {
        match mode {
            LockMode::S => &mut self.s,
            LockMode::X => &mut self.x,
            LockMode::IS => &mut self.is_,
            LockMode::IX => &mut self.ix,
        }
    }

    fn can_grant(&self, mode: LockMode, tid: TransactionId) -> bool {
        [
            (LockMode::S, &self.s),
            (LockMode::X, &self.x),
            (LockMode::IS, &self.is_),
            (LockMode::IX, &self.ix),
        ]
        .into_iter()
        .all(|(held_mode, set)| {
            set.iter().all(|&holder| holder == tid || compatible(held_mode, mode))
        })
    }

    fn holders_excluding(&self, tid: TransactionId) -> Vec<TransactionId> {
        self.s
            .iter()
            .chain(self.x.iter())
            .chain(self.is_.iter())
            .chain(self.ix.iter())
            .copied()
            .filter(|&t| t != tid)
            .collect()
    }
}

/// Directed graph of "waiting for" edges, scanned for a cycle every time an
/// edge would be added.
#[derive(Default)]
struct WaitForGraph {
    edges: HashMap<TransactionId, HashSet<TransactionId>>,
}

impl WaitForGraph {
    /// Adds `from -> to` and returns `false` (without keeping the edge) if
    /// doing so would create a cycle.
    fn add_edge(&mut self, from: TransactionId, to: TransactionId) -> bool {
        if from == to {
            return true;
        }
        self.edges.entry(from).or_default().insert(to);
        if self.has_cycle(from) {
            self.edges.get_mut(&from).unwrap().remove(&to);
            false
        } else {
            true
        }
    }

    fn has_cycle(&self, start: TransactionId) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            if let Some(next) = self.edges.get(&node) {
                for &n in next {
                    if n == start {
                        return true;
                    }
                    if visited.insert(n) {
                        stack.push(n);
                    }
                }
            }
        }
        false
    }

    fn remove_transaction(&mut self, tid: TransactionId) {
        self.edges.remove(&tid);
        for set in self.edges.values_mut() {
            set.remove(&tid);
        }
    }
}

struct LockState {
    resources: HashMap<ResourceId, ResourceEntry>,
    txn_locks: HashMap<TransactionId, HashMap<ResourceId, LockMode>>,
    phase: HashMap<TransactionId, Phase>,
}

/// Shared lock table for one database. One instance is used by every
/// transaction running against it.
pub struct LockManager {
    state: Mutex<LockState>,
    condvar: Condvar,
    wait_for: Mutex<WaitForGraph>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState {
                resources: HashMap::new(),
                txn_locks: HashMap::new(),
                phase: HashMap::new(),
            }),
            condvar: Condvar::new(),
            wait_for: Mutex::new(WaitForGraph::default()),
        }
    }

    pub fn acquire(
        &self,
        tid: TransactionId,
        resource: impl Into<ResourceId>,
        mode: LockMode,
    ) -> Result<(), LockError> {
        let resource = resource.into();
        let mut state = self.state.lock();
        loop {
            if matches!(state.phase.get(&tid), Some(Phase::Shrinking)) {
                return Err(LockError::PhaseViolation { transaction: tid });
            }
            let existing_mode = state.txn_locks.get(&tid).and_then(|m| m.get(&resource)).copied();
            if let Some(existing) = existing_mode {
                if existing == mode {
                    return Ok(());
                }
            }

            let entry = state.resources.entry(resource.clone()).or_default();
            if entry.can_grant(mode, tid) {
                if let Some(existing) = existing_mode {
                    entry.set_for_mut(existing).remove(&tid);
                }
                entry.set_for_mut(mode).insert(tid);
                state
                    .txn_locks
                    .entry(tid)
                    .or_default()
                    .insert(resource.clone(), mode);
                state.phase.entry(tid).or_insert(Phase::Growing);
                self.wait_for.lock().remove_transaction(tid);
                return Ok(());
            }

            let blockers = entry.holders_excluding(tid);
            {
                let mut wf = self.wait_for.lock();
                for blocker in blockers {
                    if !wf.add_edge(tid, blocker) {
                        wf.remove_transaction(tid);
                        return Err(LockError::Deadlock {
                            transaction: tid,
                            resource,
                            mode,
                        });
                    }
                }
            }
            self.condvar.wait(&mut state);
        }
    }

    /// Upgrades an already-held lock to a stronger mode, waiting if
    /// necessary. Fails with `Deadlock` rather than silently blocking
    /// forever if the wait would cycle back to `tid`.
    pub fn upgrade(
        &self,
        tid: TransactionId,
        resource: impl Into<ResourceId>,
        to: LockMode,
    ) -> Result<(), LockError> {
        let resource = resource.into();
        let mut state = self.state.lock();
        loop {
            if matches!(state.phase.get(&tid), Some(Phase::Shrinking)) {
                return Err(LockError::PhaseViolation { transaction: tid });
            }
            let current = state
                .txn_locks
                .get(&tid)
                .and_then(|m| m.get(&resource))
                .copied()
                .ok_or_else(|| LockError::NotHeld {
                    transaction: tid,
                    resource: resource.clone(),
                })?;
            if current == to {
                return Ok(());
            }

            let entry = state.resources.get_mut(&resource).expect("held lock implies resource entry exists");
            if entry.can_grant(to, tid) {
                entry.set_for_mut(current).remove(&tid);
                entry.set_for_mut(to).insert(tid);
                state.txn_locks.get_mut(&tid).unwrap().insert(resource.clone(), to);
                self.wait_for.lock().remove_transaction(tid);
                return Ok(());
            }

            let blockers = entry.holders_excluding(tid);
            {
                let mut wf = self.wait_for.lock();
                for blocker in blockers {
                    if !wf.add_edge(tid, blocker) {
                        wf.remove_transaction(tid);
                        return Err(LockError::Deadlock {
                            transaction: tid,
                            resource,
                            mode: to,
                        });
                    }
                }
            }
            self.condvar.wait(&mut state);
        }
    }

    /// Releases every lock `tid` holds, transitions it to the shrinking
    /// phase permanently, and wakes any transaction that might now be
    /// grantable.
    pub fn release_all(&self, tid: TransactionId) {
        let mut state = self.state.lock();
        if let Some(held) = state.txn_locks.remove(&tid) {
            for (resource, mode) in held {
                if let Some(entry) = state.resources.get_mut(&resource) {
                    entry.set_for_mut(mode).remove(&tid);
                    if entry.is_empty() {
                        state.resources.remove(&resource);
                    }
                }
            }
        }
        state.phase.insert(tid, Phase::Shrinking);
        drop(state);
        self.wait_for.lock().remove_transaction(tid);
        self.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_locks_are_compatible() {
        let mgr = LockManager::new();
        mgr.acquire(1, "row:1", LockMode::S).unwrap();
        mgr.acquire(2, "row:1", LockMode::S).unwrap();
    }

    #[test]
    fn exclusive_lock_rejects_after_shrinking() {
        let mgr = LockManager::new();
        mgr.acquire(1, "row:1", LockMode::X).unwrap();
        mgr.release_all(1);
        let err = mgr.acquire(1, "row:2", LockMode::S).unwrap_err();
        assert!(matches!(err, LockError::PhaseViolation { .. }));
    }

    #[test]
    fn upgrade_shared_to_exclusive_when_sole_holder() {
        let mgr = LockManager::new();
        mgr.acquire(1, "row:1", LockMode::S).unwrap();
        mgr.upgrade(1, "row:1", LockMode::X).unwrap();
    }

    #[test]
    fn two_cycle_wait_reports_deadlock_for_the_second_requester() {
        let mgr = LockManager::new();
        mgr.acquire(1, "row:a", LockMode::X).unwrap();
        mgr.acquire(2, "row:b", LockMode::X).unwrap();
        // 2 waits on 1 via row:a — fine, not yet a cycle.
        {
            let mut wf = mgr.wait_for.lock();
            assert!(wf.add_edge(2, 1));
        }
        // 1 waiting on 2 would close the cycle.
        let mut wf = mgr.wait_for.lock();
        assert!(!wf.add_edge(1, 2));
    }

    #[test]
    fn intention_locks_compose_with_shared() {
        let mgr = LockManager::new();
        mgr.acquire(1, "table:t", LockMode::IS).unwrap();
        mgr.acquire(2, "table:t", LockMode::IX).unwrap();
        // IS/IX both present — compatible per the multigranularity matrix.
    }
}
