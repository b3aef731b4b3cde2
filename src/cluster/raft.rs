//! The replicated log.
//!
//! A single leader sequences cluster events: it assigns the next log index,
//! applies the entry to its own state machine, and replicates it to every
//! member as a `raft.append` command over the peer connections. Followers
//! apply entries strictly in index order and answer `raft.committedindex`
//! probes; a follower that detects a gap reports it and receives a full
//! snapshot instead. Joining nodes are bootstrapped the same way. Leadership
//! is static: the seed node leads and other nodes forward proposals to it.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::cluster::fsm::{Event, Fsm, FsmState, LogEntry};
use crate::cluster::peer::ConnectionFactory;
use crate::cluster::ClusterError;
use crate::resp::{make_cmd_line, RespValue};

pub const APPEND_COMMAND: &str = "raft.append";
pub const SNAPSHOT_COMMAND: &str = "raft.snapshot";
pub const COMMITTED_INDEX_COMMAND: &str = "raft.committedindex";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct Snapshot {
    leader: String,
    committed: u64,
    state: FsmState,
}

pub struct RaftNode {
    /// This node's id: its advertised data address.
    pub self_id: String,
    pub fsm: Arc<Fsm>,
    role: RwLock<Role>,
    leader: RwLock<String>,
    /// Leader-side log; retained for inspection and future catch-up.
    log: Mutex<Vec<LogEntry>>,
    connections: Arc<ConnectionFactory>,
    apply_hook: RwLock<Option<Arc<dyn Fn(&LogEntry) + Send + Sync>>>,
}

impl RaftNode {
    /// Starts the seed node: leader of a fresh single-node cluster.
    pub fn new_seed(
        self_id: String,
        raft_addr: String,
        connections: Arc<ConnectionFactory>,
    ) -> Arc<RaftNode> {
        let fsm = Arc::new(Fsm::new());
        fsm.bootstrap(&self_id, &raft_addr);
        info!(node = %self_id, "bootstrapped as cluster seed");
        Arc::new(RaftNode {
            leader: RwLock::new(self_id.clone()),
            self_id,
            fsm,
            role: RwLock::new(Role::Leader),
            log: Mutex::new(Vec::new()),
            connections,
            apply_hook: RwLock::new(None),
        })
    }

    /// Starts a follower with an empty state machine; the snapshot arrives
    /// once the join commits.
    pub fn new_follower(self_id: String, connections: Arc<ConnectionFactory>) -> Arc<RaftNode> {
        Arc::new(RaftNode {
            self_id,
            fsm: Arc::new(Fsm::new()),
            role: RwLock::new(Role::Follower),
            leader: RwLock::new(String::new()),
            log: Mutex::new(Vec::new()),
            connections,
            apply_hook: RwLock::new(None),
        })
    }

    pub fn state(&self) -> Role {
        *self.role.read()
    }

    pub fn leader_addr(&self) -> String {
        self.leader.read().clone()
    }

    /// Called after every applied entry, on leader and followers alike.
    pub fn set_apply_hook(&self, hook: Arc<dyn Fn(&LogEntry) + Send + Sync>) {
        *self.apply_hook.write() = Some(hook);
    }

    fn apply(&self, entry: &LogEntry) {
        self.fsm.apply(entry);
        if let Some(hook) = self.apply_hook.read().clone() {
            hook(entry);
        }
    }

    /// Leader-only: commits an event and replicates it. Returns the log
    /// index the event was committed at.
    pub async fn propose(&self, event: Event) -> Result<u64, ClusterError> {
        if self.state() != Role::Leader {
            return Err(ClusterError::NotLeader(self.leader_addr()));
        }
        let mut log = self.log.lock().await;
        let index = self.fsm.committed_index() + 1;
        let entry = LogEntry { index, event };
        self.apply(&entry);
        log.push(entry.clone());

        let payload =
            serde_json::to_string(&entry).map_err(|err| ClusterError::Codec(err.to_string()))?;
        let append = make_cmd_line(APPEND_COMMAND, &[&payload]);
        for peer in self.fsm.node_ids() {
            if peer == self.self_id {
                continue;
            }
            match self.connections.send_to(&peer, &append).await {
                Ok(reply) if !reply.is_error() => {}
                Ok(_) => {
                    // The follower is behind; ship it the whole state.
                    if let Err(err) = self.send_snapshot(&peer).await {
                        warn!(%peer, %err, "snapshot after append gap failed");
                    }
                }
                Err(err) => warn!(%peer, %err, "append replication failed"),
            }
        }
        Ok(index)
    }

    /// Ships the full state machine to one peer.
    pub async fn send_snapshot(&self, peer: &str) -> Result<(), ClusterError> {
        let (state, committed) = self.fsm.snapshot();
        let snapshot = Snapshot {
            leader: self.self_id.clone(),
            committed,
            state,
        };
        let payload =
            serde_json::to_string(&snapshot).map_err(|err| ClusterError::Codec(err.to_string()))?;
        let reply = self
            .connections
            .send_to(peer, &make_cmd_line(SNAPSHOT_COMMAND, &[&payload]))
            .await?;
        if reply.is_error() {
            return Err(ClusterError::Peer(format!("snapshot rejected by {}", peer)));
        }
        Ok(())
    }

    /// Follower side of `raft.append`.
    pub fn handle_append(&self, payload: &str) -> RespValue {
        let entry: LogEntry = match serde_json::from_str(payload) {
            Ok(entry) => entry,
            Err(err) => return RespValue::Error(format!("ERR bad log entry: {}", err)),
        };
        let committed = self.fsm.committed_index();
        if entry.index <= committed {
            return RespValue::ok();
        }
        if entry.index != committed + 1 {
            return RespValue::Error(format!(
                "ERR log gap: have {}, got {}",
                committed, entry.index
            ));
        }
        self.apply(&entry);
        RespValue::ok()
    }

    /// Follower side of `raft.snapshot`.
    pub fn handle_snapshot(&self, payload: &str) -> RespValue {
        let snapshot: Snapshot = match serde_json::from_str(payload) {
            Ok(snapshot) => snapshot,
            Err(err) => return RespValue::Error(format!("ERR bad snapshot: {}", err)),
        };
        self.fsm.install(snapshot.state, snapshot.committed);
        *self.leader.write() = snapshot.leader;
        info!(committed = snapshot.committed, "installed cluster snapshot");
        RespValue::ok()
    }

    /// Leader-only: commits the membership change for a joining node and
    /// bootstraps it with a snapshot.
    pub async fn handle_join(
        &self,
        redis_addr: &str,
        raft_addr: &str,
    ) -> Result<(), ClusterError> {
        self.propose(Event::Join {
            redis_addr: redis_addr.to_string(),
            raft_addr: raft_addr.to_string(),
        })
        .await?;
        self.send_snapshot(redis_addr).await
    }

    pub fn committed_index(&self) -> u64 {
        self.fsm.committed_index()
    }
}
