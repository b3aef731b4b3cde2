//! The rebalance planner and the route-change commit path.

use std::sync::Arc;
use std::time::Duration;

use rand::distr::{Alphanumeric, SampleString};
use tracing::{error, info};

use crate::cluster::fsm::{Event, FsmState, MigratingTask};
use crate::cluster::raft::{Role, COMMITTED_INDEX_COMMAND};
use crate::cluster::router::SLOT_COUNT;
use crate::cluster::{Cluster, ClusterError, CHANGE_ROUTE_COMMAND, START_MIGRATION_COMMAND};
use crate::resp::{make_cmd_line, CmdLine, RespValue};

const WAIT_COMMITTED_ATTEMPTS: u32 = 50;
const WAIT_COMMITTED_INTERVAL: Duration = Duration::from_millis(100);

/// Pairs overloaded nodes with underloaded ones. A node exporting slots
/// owns more than `avg + 1`, an importer owns fewer than `avg - 1`, where
/// `avg = ceil(slots / nodes)`. Node ids are walked in sorted order so the
/// plan is deterministic for a given view.
pub fn make_rebalance_plan(state: &FsmState) -> Vec<MigratingTask> {
    let node_count = state.nodes.len();
    if node_count == 0 {
        return Vec::new();
    }
    let avg = (SLOT_COUNT as usize).div_ceil(node_count);

    let mut node_ids: Vec<&String> = state.nodes.keys().collect();
    node_ids.sort();

    let mut exporting_nodes = Vec::new();
    let mut importing_nodes = Vec::new();
    for node_id in node_ids {
        let owned = state
            .node_to_slots
            .get(node_id)
            .map(|slots| slots.len())
            .unwrap_or(0);
        if owned > avg + 1 {
            exporting_nodes.push(node_id.clone());
        }
        if owned + 1 < avg {
            importing_nodes.push(node_id.clone());
        }
    }

    let mut tasks = Vec::new();
    let mut import_index = 0;
    let mut export_index = 0;
    let mut export_slots: Vec<u32> = Vec::new();
    while import_index < importing_nodes.len() && export_index < exporting_nodes.len() {
        let export_node = &exporting_nodes[export_index];
        if export_slots.is_empty() {
            let owned = state
                .node_to_slots
                .get(export_node)
                .cloned()
                .unwrap_or_default();
            let export_count = owned.len().saturating_sub(avg);
            export_slots = owned[..export_count].to_vec();
        }
        let import_node = &importing_nodes[import_index];
        let owned_by_importer = state
            .node_to_slots
            .get(import_node)
            .map(|slots| slots.len())
            .unwrap_or(0);
        let requirement = avg - owned_by_importer;

        let mut task = MigratingTask {
            id: Alphanumeric.sample_string(&mut rand::rng(), 20),
            src_node: export_node.clone(),
            target_node: import_node.clone(),
            slots: Vec::new(),
        };
        if requirement <= export_slots.len() {
            // This exporter can satisfy the importer in full.
            task.slots = export_slots[..requirement].to_vec();
            export_slots.drain(..requirement);
            import_index += 1;
        } else {
            // Exporter exhausted; move on to the next one.
            task.slots = std::mem::take(&mut export_slots);
            export_index += 1;
        }
        if !task.slots.is_empty() {
            tasks.push(task);
        }
    }
    tasks
}

impl Cluster {
    /// One planner round: compute the plan and trigger each migration.
    /// Leader-only; serialized by the rebalance mutex.
    pub async fn do_rebalance(self: &Arc<Self>) {
        let _guard = self.rebalance_mu.lock().await;
        let tasks = self
            .raft_node()
            .fsm
            .with_read_lock(|state| make_rebalance_plan(state));
        if tasks.is_empty() {
            return;
        }
        info!(count = tasks.len(), "rebalance plan generated");
        for task in tasks {
            match self.trigger_migration_task(&task).await {
                Ok(()) => info!(task = %task.id, "migration triggered"),
                Err(err) => error!(task = %task.id, %err, "migration trigger failed"),
            }
        }
    }

    /// Proposes the migration through the replicated log, then tells the
    /// target node to start pulling.
    async fn trigger_migration_task(self: &Arc<Self>, task: &MigratingTask) -> Result<(), ClusterError> {
        self.raft_node()
            .propose(Event::StartMigrate(task.clone()))
            .await?;

        let mut cmdline: CmdLine = vec![
            START_MIGRATION_COMMAND.to_string(),
            task.id.clone(),
            task.src_node.clone(),
        ];
        cmdline.extend(task.slots.iter().map(|slot| slot.to_string()));

        if task.target_node == self.self_id() {
            // The leader can also be the importer.
            let reply = self.exec_start_migration(&cmdline[1..].to_vec());
            if reply.is_error() {
                return Err(ClusterError::Peer(format!("{:?}", reply)));
            }
            return Ok(());
        }
        let reply = self.factory().send_to(&task.target_node, &cmdline).await?;
        if reply.is_error() {
            return Err(ClusterError::Peer(format!("{:?}", reply)));
        }
        Ok(())
    }

    /// `cluster.migration.changeroute <taskID>`; non-leaders forward; the
    /// leader proposes the route change and blocks until both the source
    /// and the target node have committed it.
    pub(crate) async fn exec_change_route(self: &Arc<Self>, cmdline: &CmdLine) -> RespValue {
        if cmdline.len() != 2 {
            return RespValue::Error(format!(
                "ERR wrong number of arguments for '{}' command",
                CHANGE_ROUTE_COMMAND
            ));
        }
        if self.raft_node().state() != Role::Leader {
            return self.forward_to_leader(cmdline).await;
        }
        let task_id = &cmdline[1];
        let Some(task) = self.raft_node().fsm.get_migrating_task(task_id) else {
            return RespValue::Error("ERR task not found".to_string());
        };
        let log_index = match self
            .raft_node()
            .propose(Event::FinishMigrate(task.clone()))
            .await
        {
            Ok(index) => index,
            Err(err) => return RespValue::Error(format!("ERR {}", err)),
        };
        // Both ends must have observed the route change before we answer.
        if let Err(err) = self.wait_committed(&task.src_node, log_index).await {
            return RespValue::Error(format!("ERR {}", err));
        }
        if let Err(err) = self.wait_committed(&task.target_node, log_index).await {
            return RespValue::Error(format!("ERR {}", err));
        }
        RespValue::ok()
    }

    /// Polls one node until its committed index reaches `log_index`.
    pub(crate) async fn wait_committed(
        self: &Arc<Self>,
        peer: &str,
        log_index: u64,
    ) -> Result<(), ClusterError> {
        if peer == self.self_id() {
            // The local state machine applied it during propose.
            if self.raft_node().committed_index() >= log_index {
                return Ok(());
            }
        }
        let probe = make_cmd_line(COMMITTED_INDEX_COMMAND, &[]);
        for _ in 0..WAIT_COMMITTED_ATTEMPTS {
            if peer == self.self_id() {
                if self.raft_node().committed_index() >= log_index {
                    return Ok(());
                }
            } else {
                match self.factory().send_to(peer, &probe).await {
                    Ok(RespValue::Integer(index)) if index as u64 >= log_index => return Ok(()),
                    Ok(_) => {}
                    Err(err) => error!(%peer, %err, "committed index probe failed"),
                }
            }
            tokio::time::sleep(WAIT_COMMITTED_INTERVAL).await;
        }
        Err(ClusterError::WaitCommittedTimeout)
    }
}
