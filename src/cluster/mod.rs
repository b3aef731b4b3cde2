//! Cluster mode: slot partitioning, routing, membership and migration.
//!
//! Every key hashes to one of 1024 slots; each slot is owned by exactly one
//! node in the committed view of the replicated state machine. A node
//! serves a command locally when it owns the slot, and relays it to the
//! owner otherwise. Slot movement is coordinated through the replicated
//! log: the planner proposes a migration, the importer pulls a snapshot of
//! the slot's keys, keys dirtied during the transfer are re-copied, and the
//! route change commits only after both sides have observed it.

pub mod fsm;
pub mod peer;
pub mod raft;
mod rebalance;
pub mod router;

pub use rebalance::make_rebalance_plan;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

use crate::aof::marshal::{entity_to_cmds, make_expire_cmd};
use crate::aof::Persister;
use crate::cluster::fsm::{Event, LogEntry, MigratingTask};
use crate::cluster::peer::ConnectionFactory;
use crate::cluster::raft::{RaftNode, Role};
use crate::cluster::router::slot_of;
use crate::config::ServerConfig;
use crate::connection::Session;
use crate::datastruct::set::Set;
use crate::db::command::lookup;
use crate::db::engine::DbEngine;
use crate::resp::{make_cmd_line, CmdLine, RespValue};

pub const JOIN_COMMAND: &str = "cluster.join";
pub const CHANGE_ROUTE_COMMAND: &str = "cluster.migration.changeroute";
pub const START_MIGRATION_COMMAND: &str = "startmigration";
pub const DUMP_SLOTS_COMMAND: &str = "cluster.dumpslots";
pub const DUMP_DIRTY_COMMAND: &str = "cluster.dumpdirty";

const REBALANCE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("cannot connect to {0}: {1}")]
    Connect(String, String),
    #[error("peer error: {0}")]
    Peer(String),
    #[error("not the leader; leader is {0}")]
    NotLeader(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("wait committed timeout")]
    WaitCommittedTimeout,
    #[error("leader unknown")]
    LeaderUnknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Hosting,
    Importing,
    Exporting,
}

struct SlotInner {
    state: SlotState,
    /// Keys currently stored in this slot on this node.
    keys: Set,
    /// Copied at export start; the transfer works off this set.
    export_snapshot: Set,
    /// Keys touched while exporting; re-copied before the route commits.
    dirty_keys: Set,
}

struct SlotStatus {
    inner: Mutex<SlotInner>,
}

impl SlotStatus {
    fn new() -> Arc<SlotStatus> {
        Arc::new(SlotStatus {
            inner: Mutex::new(SlotInner {
                state: SlotState::Hosting,
                keys: Set::new(),
                export_snapshot: Set::new(),
                dirty_keys: Set::new(),
            }),
        })
    }
}

struct SlotsManager {
    slots: RwLock<HashMap<u32, Arc<SlotStatus>>>,
}

impl SlotsManager {
    fn new() -> SlotsManager {
        SlotsManager {
            slots: RwLock::new(HashMap::new()),
        }
    }

    fn get_slot(&self, index: u32) -> Arc<SlotStatus> {
        if let Some(slot) = self.slots.read().get(&index) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write();
        Arc::clone(slots.entry(index).or_insert_with(SlotStatus::new))
    }

    fn remove_slot(&self, index: u32) {
        self.slots.write().remove(&index);
    }
}

pub struct Cluster {
    pub config: Arc<ServerConfig>,
    pub engine: Arc<DbEngine>,
    raft: Arc<RaftNode>,
    connections: Arc<ConnectionFactory>,
    slots: SlotsManager,
    rebalance_mu: AsyncMutex<()>,
}

impl Cluster {
    pub fn self_id(&self) -> &str {
        &self.raft.self_id
    }

    /// Builds the cluster node: seed nodes bootstrap the state machine,
    /// other nodes send `cluster.join` to the configured seed. Installs the
    /// key callbacks that maintain per-slot key sets and starts the
    /// rebalance loop.
    pub async fn new(
        config: Arc<ServerConfig>,
        engine: Arc<DbEngine>,
    ) -> Result<Arc<Cluster>, ClusterError> {
        let connections = ConnectionFactory::new(Arc::clone(&config));
        let self_id = config.announce_address();
        let raft = if config.cluster_as_seed {
            RaftNode::new_seed(
                self_id,
                config.raft_advertise_addr.clone(),
                Arc::clone(&connections),
            )
        } else {
            RaftNode::new_follower(self_id, Arc::clone(&connections))
        };

        let cluster = Arc::new(Cluster {
            config: Arc::clone(&config),
            engine: Arc::clone(&engine),
            raft,
            connections,
            slots: SlotsManager::new(),
            rebalance_mu: AsyncMutex::new(()),
        });

        cluster.install_key_callbacks();
        cluster.install_apply_hook();

        if !config.cluster_as_seed && config.cluster_seed.is_empty() {
            return Err(ClusterError::LeaderUnknown);
        }

        let looper = Arc::clone(&cluster);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REBALANCE_INTERVAL);
            loop {
                interval.tick().await;
                if looper.raft.state() == Role::Leader {
                    looper.do_rebalance().await;
                }
            }
        });

        Ok(cluster)
    }

    /// Sends `cluster.join` to the configured seed. Called once the local
    /// listener is accepting, because the leader answers the join with a
    /// state snapshot pushed back over a fresh connection.
    pub async fn join_seed(&self) -> Result<(), ClusterError> {
        if self.config.cluster_as_seed {
            return Ok(());
        }
        let join = make_cmd_line(
            JOIN_COMMAND,
            &[
                &self.config.announce_address(),
                &self.config.raft_advertise_addr,
            ],
        );
        let mut last_err = ClusterError::LeaderUnknown;
        for _ in 0..5 {
            match self.connections.send_to(&self.config.cluster_seed, &join).await {
                Ok(reply) if !reply.is_error() => {
                    info!(seed = %self.config.cluster_seed, "joined cluster");
                    return Ok(());
                }
                Ok(reply) => last_err = ClusterError::Peer(format!("join rejected: {:?}", reply)),
                Err(err) => last_err = err,
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Err(last_err)
    }

    /// Slot bookkeeping runs inside the key event callbacks, under the
    /// data shard lock of the key that changed.
    fn install_key_callbacks(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.engine.set_key_inserted_callback(Some(Arc::new(
            move |db_index: usize, key: &str| {
                if db_index != 0 {
                    return;
                }
                if let Some(cluster) = weak.upgrade() {
                    let status = cluster.slots.get_slot(slot_of(key));
                    let mut inner = status.inner.lock();
                    inner.keys.add(key);
                    if inner.state == SlotState::Exporting {
                        inner.dirty_keys.add(key);
                    }
                }
            },
        )));
        let weak = Arc::downgrade(self);
        self.engine.set_key_deleted_callback(Some(Arc::new(
            move |db_index: usize, key: &str| {
                if db_index != 0 {
                    return;
                }
                if let Some(cluster) = weak.upgrade() {
                    let status = cluster.slots.get_slot(slot_of(key));
                    let mut inner = status.inner.lock();
                    inner.keys.remove(key);
                    if inner.state == SlotState::Exporting {
                        inner.dirty_keys.add(key);
                    }
                }
            },
        )));
    }

    /// Reacts to committed log entries: exporters mark slots, and a
    /// finished migration hands the data over and cleans up.
    fn install_apply_hook(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.raft.set_apply_hook(Arc::new(move |entry: &LogEntry| {
            let Some(cluster) = weak.upgrade() else { return };
            match &entry.event {
                Event::StartMigrate(task) => {
                    if task.src_node == cluster.self_id() {
                        cluster.begin_export(task);
                    }
                }
                Event::FinishMigrate(task) => {
                    if task.src_node == cluster.self_id() {
                        let cluster = Arc::clone(&cluster);
                        let task = task.clone();
                        tokio::spawn(async move {
                            cluster.finish_export(&task).await;
                        });
                    }
                    if task.target_node == cluster.self_id() {
                        for slot in &task.slots {
                            let status = cluster.slots.get_slot(*slot);
                            status.inner.lock().state = SlotState::Hosting;
                        }
                        info!(task = %task.id, "import committed; slots now hosted");
                    }
                }
                Event::Join { .. } => {}
            }
        }));
    }

    /// Marks the task's slots exporting and snapshots their key sets.
    fn begin_export(&self, task: &MigratingTask) {
        for slot in &task.slots {
            let status = self.slots.get_slot(*slot);
            let mut inner = status.inner.lock();
            inner.state = SlotState::Exporting;
            inner.export_snapshot = inner.keys.shallow_copy();
            inner.dirty_keys = Set::new();
        }
        info!(task = %task.id, slots = task.slots.len(), "slots marked exporting");
    }

    /// After the route change commits: push any keys still dirty straight
    /// to the new owner, then drop the local copies.
    async fn finish_export(&self, task: &MigratingTask) {
        let Some(db) = self.engine.db(0) else { return };
        for slot in &task.slots {
            let status = self.slots.get_slot(*slot);
            let (dirty, keys) = {
                let inner = status.inner.lock();
                (inner.dirty_keys.to_slice(), inner.keys.to_slice())
            };
            for key in dirty {
                for cmdline in self.dump_key_cmds(&key) {
                    if let Err(err) = self.connections.send_to(&task.target_node, &cmdline).await {
                        warn!(%key, %err, "final dirty push failed");
                    }
                }
            }
            for key in keys {
                db.remove_key(&key);
            }
            self.slots.remove_slot(*slot);
        }
        info!(task = %task.id, "export finished, local copies dropped");
    }

    /// The command sequence that recreates `key` on another node.
    fn dump_key_cmds(&self, key: &str) -> Vec<CmdLine> {
        let Some(db) = self.engine.db(0) else {
            return Vec::new();
        };
        let mut cmds = vec![make_cmd_line("DEL", &[key])];
        if let Some(entity) = db.get_entity_clone(key) {
            cmds.extend(entity_to_cmds(key, &entity));
            if let Some(at_ms) = db.ttl_at(key) {
                cmds.push(make_expire_cmd(key, at_ms));
            }
        }
        cmds
    }

    fn dump_entry(&self, key: &str) -> RespValue {
        RespValue::Array(
            self.dump_key_cmds(key)
                .iter()
                .map(|cmdline| RespValue::from_cmd_line(cmdline))
                .collect(),
        )
    }

    /// Entry point for every client and peer command in cluster mode.
    pub async fn exec(self: &Arc<Self>, session: &mut Session, cmdline: &CmdLine) -> RespValue {
        let name = cmdline[0].to_lowercase();
        let args = &cmdline[1..];
        match name.as_str() {
            JOIN_COMMAND => return self.exec_join(cmdline).await,
            CHANGE_ROUTE_COMMAND => return self.exec_change_route(cmdline).await,
            START_MIGRATION_COMMAND => return self.exec_start_migration(args),
            DUMP_SLOTS_COMMAND => return self.exec_dump_slots(args),
            DUMP_DIRTY_COMMAND => return self.exec_dump_dirty(args),
            raft::APPEND_COMMAND => {
                if args.len() != 1 {
                    return RespValue::Error(
                        "ERR wrong number of arguments for 'raft.append'".to_string(),
                    );
                }
                return self.raft.handle_append(&args[0]);
            }
            raft::SNAPSHOT_COMMAND => {
                if args.len() != 1 {
                    return RespValue::Error(
                        "ERR wrong number of arguments for 'raft.snapshot'".to_string(),
                    );
                }
                return self.raft.handle_snapshot(&args[0]);
            }
            raft::COMMITTED_INDEX_COMMAND => {
                return RespValue::Integer(self.raft.committed_index() as i64);
            }
            _ => {}
        }

        // Commands without keys, and everything connection-scoped, run
        // locally. Keyed commands route by slot.
        let keys = match lookup(&name) {
            Some(spec) if spec.arity_matches(cmdline.len()) => {
                let (mut write_keys, read_keys) = (spec.prepare)(args);
                write_keys.extend(read_keys);
                write_keys
            }
            _ => Vec::new(),
        };
        if keys.is_empty() {
            return self.engine.exec(session, cmdline);
        }

        let mut slots: Vec<u32> = keys.iter().map(|key| slot_of(key)).collect();
        slots.sort_unstable();
        slots.dedup();
        if slots.len() > 1 {
            return RespValue::Error(
                "CROSSSLOT Keys in request don't hash to the same slot".to_string(),
            );
        }
        let slot = slots[0];
        let Some(owner) = self.raft.fsm.pick_node(slot) else {
            return RespValue::Error("CLUSTERDOWN Hash slot not served".to_string());
        };
        if owner == self.self_id() {
            return self.engine.exec(session, cmdline);
        }
        if session.in_multi() {
            if let Some(multi) = session.multi.as_mut() {
                multi.has_error = true;
            }
            return RespValue::Error(
                "ERR transaction keys must hash to a slot served by this node".to_string(),
            );
        }
        match self.connections.send_to(&owner, cmdline).await {
            Ok(reply) => reply,
            Err(err) => RespValue::Error(format!("ERR relay to {} failed: {}", owner, err)),
        }
    }

    /// `cluster.join <redisAddr> <raftAddr>`; non-leaders forward.
    async fn exec_join(&self, cmdline: &CmdLine) -> RespValue {
        if cmdline.len() != 3 {
            return RespValue::Error(
                "ERR wrong number of arguments for 'cluster.join' command".to_string(),
            );
        }
        if self.raft.state() != Role::Leader {
            return self.forward_to_leader(cmdline).await;
        }
        match self.raft.handle_join(&cmdline[1], &cmdline[2]).await {
            Ok(()) => RespValue::ok(),
            Err(err) => RespValue::Error(format!("ERR {}", err)),
        }
    }

    pub(crate) async fn forward_to_leader(&self, cmdline: &CmdLine) -> RespValue {
        let leader = self.raft.leader_addr();
        if leader.is_empty() {
            return RespValue::Error("ERR leader unknown".to_string());
        }
        match self.connections.send_to(&leader, cmdline).await {
            Ok(reply) => reply,
            Err(err) => RespValue::Error(format!("ERR forward to leader failed: {}", err)),
        }
    }

    /// `startMigration <taskID> <srcNode> <slot...>` runs on the target,
    /// which marks the slots importing and drives the transfer in the
    /// background.
    fn exec_start_migration(self: &Arc<Self>, args: &[String]) -> RespValue {
        if args.len() < 3 {
            return RespValue::Error(
                "ERR wrong number of arguments for 'startMigration' command".to_string(),
            );
        }
        let task_id = args[0].clone();
        let src_node = args[1].clone();
        let mut slots = Vec::with_capacity(args.len() - 2);
        for raw in &args[2..] {
            match raw.parse::<u32>() {
                Ok(slot) => slots.push(slot),
                Err(_) => return RespValue::Error("ERR invalid slot id".to_string()),
            }
        }
        for slot in &slots {
            let status = self.slots.get_slot(*slot);
            status.inner.lock().state = SlotState::Importing;
        }
        info!(task = %task_id, from = %src_node, slots = slots.len(), "import starting");
        let importer = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = importer.run_import(&task_id, &src_node, &slots).await {
                error!(task = %task_id, %err, "import failed");
            }
        });
        RespValue::ok()
    }

    /// `cluster.dumpslots <taskID> <slot...>`, exporter side: snapshot the
    /// slots and reply with every key's recreate sequence.
    fn exec_dump_slots(&self, args: &[String]) -> RespValue {
        if args.len() < 2 {
            return RespValue::Error(
                "ERR wrong number of arguments for 'cluster.dumpslots' command".to_string(),
            );
        }
        let mut entries = Vec::new();
        for raw in &args[1..] {
            let Ok(slot) = raw.parse::<u32>() else {
                return RespValue::Error("ERR invalid slot id".to_string());
            };
            let status = self.slots.get_slot(slot);
            let snapshot = {
                let mut inner = status.inner.lock();
                if inner.state != SlotState::Exporting {
                    inner.state = SlotState::Exporting;
                    inner.export_snapshot = inner.keys.shallow_copy();
                    inner.dirty_keys = Set::new();
                }
                inner.export_snapshot.to_slice()
            };
            for key in snapshot {
                entries.push(self.dump_entry(&key));
            }
        }
        RespValue::Array(entries)
    }

    /// `cluster.dumpdirty <taskID> <slot...>`, exporter side: drain and
    /// return the keys dirtied since the snapshot.
    fn exec_dump_dirty(&self, args: &[String]) -> RespValue {
        if args.is_empty() {
            return RespValue::Error(
                "ERR wrong number of arguments for 'cluster.dumpdirty' command".to_string(),
            );
        }
        let mut entries = Vec::new();
        for raw in &args[1..] {
            let Ok(slot) = raw.parse::<u32>() else {
                return RespValue::Error("ERR invalid slot id".to_string());
            };
            let status = self.slots.get_slot(slot);
            let dirty = {
                let mut inner = status.inner.lock();
                let dirty = inner.dirty_keys.to_slice();
                inner.dirty_keys = Set::new();
                dirty
            };
            for key in dirty {
                entries.push(self.dump_entry(&key));
            }
        }
        RespValue::Array(entries)
    }

    /// Importer driver: pull the snapshot, re-pull dirty keys, then ask the
    /// leader to commit the route change.
    pub async fn run_import(
        self: &Arc<Self>,
        task_id: &str,
        src_node: &str,
        slots: &[u32],
    ) -> Result<(), ClusterError> {
        let slot_args: Vec<String> = slots.iter().map(|slot| slot.to_string()).collect();

        let mut dump_cmd = vec![DUMP_SLOTS_COMMAND.to_string(), task_id.to_string()];
        dump_cmd.extend(slot_args.clone());
        let reply = self.connections.send_to(src_node, &dump_cmd).await?;
        self.apply_dump_reply(reply)?;

        let mut dirty_cmd = vec![DUMP_DIRTY_COMMAND.to_string(), task_id.to_string()];
        dirty_cmd.extend(slot_args);
        let reply = self.connections.send_to(src_node, &dirty_cmd).await?;
        self.apply_dump_reply(reply)?;

        // Commit the route change through the leader; it returns once both
        // sides have observed the new route.
        let change = make_cmd_line(CHANGE_ROUTE_COMMAND, &[task_id]);
        let reply = if self.raft.state() == Role::Leader {
            self.exec_change_route(&change).await
        } else {
            self.forward_to_leader(&change).await
        };
        if reply.is_error() {
            return Err(ClusterError::Peer(format!("changeroute failed: {:?}", reply)));
        }
        info!(task = %task_id, "migration complete");
        Ok(())
    }

    fn apply_dump_reply(&self, reply: RespValue) -> Result<(), ClusterError> {
        let RespValue::Array(entries) = reply else {
            return Err(ClusterError::Peer(format!("bad dump reply: {:?}", reply)));
        };
        for entry in entries {
            let RespValue::Array(frames) = entry else {
                return Err(ClusterError::Peer("bad dump entry".to_string()));
            };
            for frame in frames {
                let Some(cmdline) = frame.as_cmd_line() else {
                    return Err(ClusterError::Peer("bad dump frame".to_string()));
                };
                let reply = self.engine.exec_normal(0, &cmdline);
                if reply.is_error() {
                    error!(cmd = %cmdline[0], ?reply, "import apply failed");
                }
            }
        }
        Ok(())
    }

    pub fn close(&self) {
        self.engine.close();
    }

    pub(crate) fn raft_node(&self) -> &Arc<RaftNode> {
        &self.raft
    }

    pub(crate) fn factory(&self) -> &Arc<ConnectionFactory> {
        &self.connections
    }

    /// Attaches the persister once it exists; cluster nodes persist like
    /// standalone ones.
    pub fn set_persister(&self, persister: Arc<Persister>) {
        self.engine.set_persister(persister);
    }
}
