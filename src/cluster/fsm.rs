//! The replicated state machine: membership and slot ownership.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::cluster::router::SLOT_COUNT;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigratingTask {
    pub id: String,
    pub src_node: String,
    pub target_node: String,
    pub slots: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Join {
        redis_addr: String,
        raft_addr: String,
    },
    StartMigrate(MigratingTask),
    FinishMigrate(MigratingTask),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub event: Event,
}

/// The replicated view: which nodes exist, who owns each slot, and which
/// migrations are in flight.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FsmState {
    pub slot_to_node: HashMap<u32, String>,
    pub node_to_slots: HashMap<String, Vec<u32>>,
    /// node id (advertised data address) -> advertised transport address
    pub nodes: HashMap<String, String>,
    pub migratings: HashMap<String, MigratingTask>,
}

pub struct Fsm {
    state: RwLock<FsmState>,
    committed: AtomicU64,
}

impl Fsm {
    pub fn new() -> Self {
        Fsm {
            state: RwLock::new(FsmState::default()),
            committed: AtomicU64::new(0),
        }
    }

    /// Seeds a single-node cluster owning every slot.
    pub fn bootstrap(&self, self_id: &str, raft_addr: &str) {
        let mut state = self.state.write();
        let all_slots: Vec<u32> = (0..SLOT_COUNT).collect();
        for slot in &all_slots {
            state.slot_to_node.insert(*slot, self_id.to_string());
        }
        state.node_to_slots.insert(self_id.to_string(), all_slots);
        state
            .nodes
            .insert(self_id.to_string(), raft_addr.to_string());
    }

    pub fn committed_index(&self) -> u64 {
        self.committed.load(Ordering::SeqCst)
    }

    /// Applies one committed entry. Entries at or below the committed index
    /// are ignored so duplicated deliveries are harmless.
    pub fn apply(&self, entry: &LogEntry) {
        if entry.index <= self.committed_index() {
            return;
        }
        let mut state = self.state.write();
        match &entry.event {
            Event::Join {
                redis_addr,
                raft_addr,
            } => {
                state
                    .nodes
                    .insert(redis_addr.clone(), raft_addr.clone());
                state.node_to_slots.entry(redis_addr.clone()).or_default();
            }
            Event::StartMigrate(task) => {
                state.migratings.insert(task.id.clone(), task.clone());
            }
            Event::FinishMigrate(task) => {
                for slot in &task.slots {
                    state.slot_to_node.insert(*slot, task.target_node.clone());
                }
                if let Some(slots) = state.node_to_slots.get_mut(&task.src_node) {
                    slots.retain(|slot| !task.slots.contains(slot));
                }
                state
                    .node_to_slots
                    .entry(task.target_node.clone())
                    .or_default()
                    .extend(task.slots.iter().copied());
                state.migratings.remove(&task.id);
            }
        }
        self.committed.store(entry.index, Ordering::SeqCst);
    }

    pub fn with_read_lock<R>(&self, f: impl FnOnce(&FsmState) -> R) -> R {
        f(&self.state.read())
    }

    /// The node currently serving a slot. While a migration is in flight the
    /// exporter keeps serving until the route change commits.
    pub fn pick_node(&self, slot: u32) -> Option<String> {
        let state = self.state.read();
        for task in state.migratings.values() {
            if task.slots.contains(&slot) {
                return Some(task.src_node.clone());
            }
        }
        state.slot_to_node.get(&slot).cloned()
    }

    pub fn node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.read().nodes.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn get_migrating_task(&self, id: &str) -> Option<MigratingTask> {
        self.state.read().migratings.get(id).cloned()
    }

    /// Full copy for shipping to a joining node.
    pub fn snapshot(&self) -> (FsmState, u64) {
        (self.state.read().clone(), self.committed_index())
    }

    pub fn install(&self, state: FsmState, committed: u64) {
        *self.state.write() = state;
        self.committed.store(committed, Ordering::SeqCst);
    }
}

impl Default for Fsm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, src: &str, target: &str, slots: Vec<u32>) -> MigratingTask {
        MigratingTask {
            id: id.to_string(),
            src_node: src.to_string(),
            target_node: target.to_string(),
            slots,
        }
    }

    #[test]
    fn test_bootstrap_owns_all_slots() {
        let fsm = Fsm::new();
        fsm.bootstrap("n1:6379", "n1:16379");
        assert_eq!(fsm.pick_node(0), Some("n1:6379".to_string()));
        assert_eq!(fsm.pick_node(SLOT_COUNT - 1), Some("n1:6379".to_string()));
        fsm.with_read_lock(|state| {
            assert_eq!(state.node_to_slots["n1:6379"].len(), SLOT_COUNT as usize);
        });
    }

    #[test]
    fn test_migration_routes_to_exporter_until_commit() {
        let fsm = Fsm::new();
        fsm.bootstrap("n1", "r1");
        fsm.apply(&LogEntry {
            index: 1,
            event: Event::Join {
                redis_addr: "n2".to_string(),
                raft_addr: "r2".to_string(),
            },
        });
        let migration = task("t1", "n1", "n2", vec![7, 8]);
        fsm.apply(&LogEntry {
            index: 2,
            event: Event::StartMigrate(migration.clone()),
        });
        // Mid-migration reads keep landing on the exporter.
        assert_eq!(fsm.pick_node(7), Some("n1".to_string()));

        fsm.apply(&LogEntry {
            index: 3,
            event: Event::FinishMigrate(migration),
        });
        assert_eq!(fsm.pick_node(7), Some("n2".to_string()));
        assert_eq!(fsm.pick_node(8), Some("n2".to_string()));
        fsm.with_read_lock(|state| {
            assert!(state.migratings.is_empty());
            assert!(!state.node_to_slots["n1"].contains(&7));
            assert!(state.node_to_slots["n2"].contains(&7));
        });
        assert_eq!(fsm.committed_index(), 3);
    }

    #[test]
    fn test_apply_is_idempotent_by_index() {
        let fsm = Fsm::new();
        fsm.bootstrap("n1", "r1");
        let entry = LogEntry {
            index: 1,
            event: Event::Join {
                redis_addr: "n2".to_string(),
                raft_addr: "r2".to_string(),
            },
        };
        fsm.apply(&entry);
        fsm.apply(&entry);
        assert_eq!(fsm.committed_index(), 1);
        assert_eq!(fsm.node_ids().len(), 2);
    }

    #[test]
    fn test_snapshot_install_round_trip() {
        let fsm = Fsm::new();
        fsm.bootstrap("n1", "r1");
        let (state, committed) = fsm.snapshot();

        let other = Fsm::new();
        other.install(state, committed);
        assert_eq!(other.pick_node(3), Some("n1".to_string()));
        assert_eq!(other.committed_index(), committed);
    }
}
