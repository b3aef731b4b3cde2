//! Append-only-file durability: load, idempotence, rewrite equivalence.

mod common;

use std::sync::Arc;

use common::{bulk, bulk_array, exec, session};
use rudis::aof::{load_aof, Persister};
use rudis::config::ServerConfig;
use rudis::connection::Session;
use rudis::db::engine::DbEngine;
use rudis::resp::RespValue;
use tempfile::TempDir;

fn aof_config(dir: &TempDir, preamble: bool) -> Arc<ServerConfig> {
    let content = format!(
        "dir {}\nappendonly yes\nappendfsync always\naof-use-rdb-preamble {}\n",
        dir.path().display(),
        if preamble { "yes" } else { "no" }
    );
    Arc::new(ServerConfig::parse(&content))
}

fn engine_with_persister(config: &Arc<ServerConfig>) -> (Arc<DbEngine>, Arc<Persister>) {
    let engine = DbEngine::new(Arc::clone(config));
    let persister =
        Persister::new(Arc::clone(config), Arc::clone(&engine), true).expect("open aof");
    engine.set_persister(Arc::clone(&persister));
    (engine, persister)
}

fn reload(config: &Arc<ServerConfig>) -> Arc<DbEngine> {
    let engine = DbEngine::new(Arc::clone(config));
    load_aof(&config.aof_path(), None, &engine);
    engine
}

#[tokio::test(flavor = "multi_thread")]
async fn test_load_restores_written_state() {
    let dir = TempDir::new().unwrap();
    let config = aof_config(&dir, false);
    {
        let (engine, persister) = engine_with_persister(&config);
        let mut session = session();
        exec(&engine, &mut session, &["SET", "s", "v"]);
        exec(&engine, &mut session, &["RPUSH", "l", "a", "b", "c"]);
        exec(&engine, &mut session, &["HSET", "h", "f", "v"]);
        exec(&engine, &mut session, &["ZADD", "z", "1", "m"]);
        exec(&engine, &mut session, &["SADD", "st", "x", "y"]);
        exec(&engine, &mut session, &["SELECT", "3"]);
        exec(&engine, &mut session, &["SET", "other", "db3"]);
        persister.close();
    }

    let engine = reload(&config);
    let mut session = session();
    assert_eq!(exec(&engine, &mut session, &["GET", "s"]), bulk("v"));
    assert_eq!(
        exec(&engine, &mut session, &["LRANGE", "l", "0", "-1"]),
        bulk_array(&["a", "b", "c"])
    );
    assert_eq!(exec(&engine, &mut session, &["HGET", "h", "f"]), bulk("v"));
    assert_eq!(exec(&engine, &mut session, &["ZSCORE", "z", "m"]), bulk("1"));
    assert_eq!(exec(&engine, &mut session, &["SCARD", "st"]), RespValue::Integer(2));
    exec(&engine, &mut session, &["SELECT", "3"]);
    assert_eq!(exec(&engine, &mut session, &["GET", "other"]), bulk("db3"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_deletes_and_expires_replay() {
    let dir = TempDir::new().unwrap();
    let config = aof_config(&dir, false);
    {
        let (engine, persister) = engine_with_persister(&config);
        let mut session = session();
        exec(&engine, &mut session, &["SET", "keep", "1"]);
        exec(&engine, &mut session, &["SET", "gone", "1"]);
        exec(&engine, &mut session, &["DEL", "gone"]);
        exec(&engine, &mut session, &["SET", "dead", "1"]);
        // Absolute past deadline; the key must not come back.
        exec(&engine, &mut session, &["PEXPIREAT", "dead", "10"]);
        persister.close();
    }

    let engine = reload(&config);
    let mut session = session();
    assert_eq!(exec(&engine, &mut session, &["GET", "keep"]), bulk("1"));
    assert_eq!(exec(&engine, &mut session, &["GET", "gone"]), RespValue::Null);
    assert_eq!(exec(&engine, &mut session, &["GET", "dead"]), RespValue::Null);
}

fn fill_many(engine: &Arc<DbEngine>, session: &mut Session, count: usize) {
    for i in 0..count {
        exec(
            engine,
            session,
            &["SET", &format!("key:{:05}", i), &format!("value:{}", i)],
        );
    }
}

fn assert_many(engine: &Arc<DbEngine>, session: &mut Session, count: usize) {
    for i in 0..count {
        assert_eq!(
            exec(engine, session, &["GET", &format!("key:{:05}", i)]),
            bulk(&format!("value:{}", i)),
            "key:{:05} after reload",
            i
        );
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rewrite_compacts_and_preserves_state() {
    let dir = TempDir::new().unwrap();
    let config = aof_config(&dir, false);
    let (engine, persister) = engine_with_persister(&config);
    let mut session = session();

    // Overwrite the same keys repeatedly so the log has plenty to compact.
    for round in 0..5 {
        for i in 0..200 {
            exec(
                &engine,
                &mut session,
                &["SET", &format!("key:{:05}", i), &format!("round:{}", round)],
            );
        }
    }
    fill_many(&engine, &mut session, 1000);
    let before = std::fs::metadata(config.aof_path()).unwrap().len();

    persister.rewrite().expect("rewrite");
    let after = std::fs::metadata(config.aof_path()).unwrap().len();
    assert!(after < before, "rewrite must shrink the log: {} -> {}", before, after);

    // Writes after the rewrite keep appending to the new file.
    exec(&engine, &mut session, &["SET", "post-rewrite", "yes"]);
    persister.close();

    let reloaded = reload(&config);
    let mut session = common::session();
    assert_many(&reloaded, &mut session, 1000);
    assert_eq!(
        exec(&reloaded, &mut session, &["GET", "post-rewrite"]),
        bulk("yes")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rewrite_with_rdb_preamble() {
    let dir = TempDir::new().unwrap();
    let config = aof_config(&dir, true);
    let (engine, persister) = engine_with_persister(&config);
    let mut session = session();

    fill_many(&engine, &mut session, 300);
    exec(&engine, &mut session, &["RPUSH", "l", "a", "b"]);
    exec(&engine, &mut session, &["ZADD", "z", "2.5", "m"]);
    persister.rewrite().expect("rewrite");
    exec(&engine, &mut session, &["SET", "tail", "after"]);
    persister.close();

    // The file now starts with an RDB payload followed by commands.
    let raw = std::fs::read(config.aof_path()).unwrap();
    assert!(raw.starts_with(b"REDIS"), "rewritten file carries the preamble");

    let reloaded = reload(&config);
    let mut session = common::session();
    assert_many(&reloaded, &mut session, 300);
    assert_eq!(
        exec(&reloaded, &mut session, &["LRANGE", "l", "0", "-1"]),
        bulk_array(&["a", "b"])
    );
    assert_eq!(exec(&reloaded, &mut session, &["ZSCORE", "z", "m"]), bulk("2.5"));
    assert_eq!(exec(&reloaded, &mut session, &["GET", "tail"]), bulk("after"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_listeners_see_logged_batches() {
    struct Capture(std::sync::Mutex<Vec<Vec<String>>>);
    impl rudis::aof::Listener for Capture {
        fn callback(&self, cmds: &[Vec<String>]) {
            self.0.lock().unwrap().extend(cmds.iter().cloned());
        }
    }

    let dir = TempDir::new().unwrap();
    let config = aof_config(&dir, false);
    let (engine, persister) = engine_with_persister(&config);
    let capture = Arc::new(Capture(std::sync::Mutex::new(Vec::new())));
    persister.add_listener(capture.clone());

    let mut session = session();
    exec(&engine, &mut session, &["SET", "a", "1"]);
    exec(&engine, &mut session, &["SELECT", "2"]);
    exec(&engine, &mut session, &["SET", "b", "2"]);
    persister.close();

    let seen = capture.0.lock().unwrap().clone();
    // The SELECT the writer emitted for the db switch reaches listeners too.
    assert!(seen.iter().any(|cmd| cmd[0] == "SET" && cmd[1] == "a"));
    assert!(seen.iter().any(|cmd| cmd[0] == "SELECT" && cmd[1] == "2"));
    assert!(seen.iter().any(|cmd| cmd[0] == "SET" && cmd[1] == "b"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_everysec_channel_drains_on_close() {
    let dir = TempDir::new().unwrap();
    let content = format!(
        "dir {}\nappendonly yes\nappendfsync everysec\n",
        dir.path().display()
    );
    let config = Arc::new(ServerConfig::parse(&content));
    {
        let (engine, persister) = engine_with_persister(&config);
        let mut session = session();
        for i in 0..100 {
            exec(&engine, &mut session, &["SET", &format!("k{}", i), "v"]);
        }
        // Close waits for the writer task to drain the queue.
        persister.close();
    }
    let reloaded = reload(&config);
    let mut session = common::session();
    for i in 0..100 {
        assert_eq!(
            exec(&reloaded, &mut session, &["GET", &format!("k{}", i)]),
            bulk("v")
        );
    }
}
