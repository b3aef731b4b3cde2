//! The append-only log writer.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex as StdMutex};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::aof::load::load_aof;
use crate::aof::AofError;
use crate::config::{FsyncPolicy, ServerConfig};
use crate::db::engine::DbEngine;
use crate::resp::{make_cmd_line, CmdLine, RespValue};

/// Receives every serialized batch as it reaches the file; replication
/// hooks implement this. Callbacks must tolerate duplicated entries.
pub trait Listener: Send + Sync {
    fn callback(&self, cmds: &[CmdLine]);
}

pub(crate) struct Payload {
    pub db_index: usize,
    pub cmdline: CmdLine,
}

pub(crate) struct AofState {
    pub file: File,
    pub current_db: usize,
}

pub struct Persister {
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) engine: Arc<DbEngine>,
    pub(crate) aof_path: PathBuf,
    fsync_policy: FsyncPolicy,
    tx: Mutex<Option<UnboundedSender<Payload>>>,
    pub(crate) state: Mutex<AofState>,
    listeners: Mutex<Vec<Arc<dyn Listener>>>,
    finished: Arc<(StdMutex<bool>, Condvar)>,
    shutdown: watch::Sender<bool>,
}

impl Persister {
    /// Opens (creating if needed) the log, optionally replays it into
    /// `engine` first, and starts the writer task plus the everysec fsync
    /// ticker. Must run inside a tokio runtime.
    pub fn new(
        config: Arc<ServerConfig>,
        engine: Arc<DbEngine>,
        load: bool,
    ) -> Result<Arc<Persister>, AofError> {
        let aof_path = config.aof_path();
        if let Some(parent) = aof_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if load {
            load_aof(&aof_path, None, &engine);
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&aof_path)?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Payload>();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let persister = Arc::new(Persister {
            fsync_policy: config.append_fsync,
            config,
            engine,
            aof_path,
            tx: Mutex::new(Some(tx)),
            state: Mutex::new(AofState {
                file,
                current_db: 0,
            }),
            listeners: Mutex::new(Vec::new()),
            finished: Arc::new((StdMutex::new(false), Condvar::new())),
            shutdown,
        });

        let writer = Arc::clone(&persister);
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                writer.write_payload(&payload);
            }
            let (lock, cvar) = &*writer.finished;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
        });

        if persister.fsync_policy == FsyncPolicy::EverySec {
            let ticker = Arc::clone(&persister);
            let mut shutdown_rx = shutdown_rx;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(1));
                loop {
                    tokio::select! {
                        _ = interval.tick() => ticker.fsync(),
                        _ = shutdown_rx.changed() => return,
                    }
                }
            });
        }

        Ok(persister)
    }

    pub fn add_listener(&self, listener: Arc<dyn Listener>) {
        self.listeners.lock().push(listener);
    }

    pub fn remove_listeners(&self) {
        self.listeners.lock().clear();
    }

    /// Queues one command for the log. Under the `always` policy the write
    /// happens synchronously in the caller, including the fsync.
    pub fn save_cmd_line(&self, db_index: usize, cmdline: CmdLine) {
        if self.fsync_policy == FsyncPolicy::Always {
            self.write_payload(&Payload { db_index, cmdline });
            return;
        }
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(Payload { db_index, cmdline });
        }
    }

    pub(crate) fn write_payload(&self, payload: &Payload) {
        let mut state = self.state.lock();
        let mut batch: Vec<CmdLine> = Vec::with_capacity(2);

        if payload.db_index != state.current_db {
            let select = make_cmd_line("SELECT", &[&payload.db_index.to_string()]);
            let encoded = RespValue::from_cmd_line(&select).encode();
            if let Err(err) = state.file.write_all(encoded.as_bytes()) {
                warn!(%err, "aof select write failed");
                return;
            }
            state.current_db = payload.db_index;
            batch.push(select);
        }

        let encoded = RespValue::from_cmd_line(&payload.cmdline).encode();
        batch.push(payload.cmdline.clone());
        if let Err(err) = state.file.write_all(encoded.as_bytes()) {
            warn!(%err, "aof write failed");
            return;
        }

        for listener in self.listeners.lock().iter() {
            listener.callback(&batch);
        }

        if self.fsync_policy == FsyncPolicy::Always {
            if let Err(err) = state.file.sync_data() {
                warn!(%err, "aof fsync failed");
            }
        }
    }

    pub fn fsync(&self) {
        let state = self.state.lock();
        if let Err(err) = state.file.sync_data() {
            warn!(%err, "fsync failed");
        }
    }

    /// Replays the log (or its first `max_bytes`) into the engine.
    pub fn load(&self, max_bytes: Option<usize>) {
        load_aof(&self.aof_path, max_bytes, &self.engine);
    }

    /// Stops the writer: closes the channel, waits for the drain, and syncs.
    pub fn close(&self) {
        let tx = self.tx.lock().take();
        if tx.is_some() {
            drop(tx);
            let (lock, cvar) = &*self.finished;
            let guard = lock.lock().unwrap();
            let (_guard, timeout) = cvar
                .wait_timeout_while(guard, Duration::from_secs(5), |done| !*done)
                .unwrap();
            if timeout.timed_out() {
                warn!("aof writer did not drain in time");
            }
        }
        let _ = self.shutdown.send(true);
        self.fsync();
        info!("aof persister closed");
    }
}
