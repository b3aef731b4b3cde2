//! MULTI/EXEC semantics: queueing, watches, rollback, atomicity.

mod common;

use common::{bulk, exec, session, test_engine};
use rudis::resp::RespValue;

#[test]
fn test_multi_exec_happy_path() {
    let engine = test_engine();
    let mut session = session();

    assert_eq!(exec(&engine, &mut session, &["MULTI"]), RespValue::ok());
    assert_eq!(
        exec(&engine, &mut session, &["SET", "k", "v"]),
        RespValue::SimpleString("QUEUED".to_string())
    );
    assert_eq!(
        exec(&engine, &mut session, &["INCR", "counter"]),
        RespValue::SimpleString("QUEUED".to_string())
    );
    // Nothing executed yet.
    assert!(!session.watching.contains_key("k"));
    let reply = exec(&engine, &mut session, &["EXEC"]);
    assert_eq!(
        reply,
        RespValue::Array(vec![RespValue::ok(), RespValue::Integer(1)])
    );
    assert_eq!(exec(&engine, &mut session, &["GET", "k"]), bulk("v"));
}

#[test]
fn test_discard_drops_queue() {
    let engine = test_engine();
    let mut session = session();

    exec(&engine, &mut session, &["MULTI"]);
    exec(&engine, &mut session, &["SET", "k", "v"]);
    assert_eq!(exec(&engine, &mut session, &["DISCARD"]), RespValue::ok());
    assert_eq!(exec(&engine, &mut session, &["GET", "k"]), RespValue::Null);
    assert!(exec(&engine, &mut session, &["EXEC"]).is_error());
}

#[test]
fn test_queue_error_aborts_exec() {
    let engine = test_engine();
    let mut session = session();

    exec(&engine, &mut session, &["MULTI"]);
    assert!(exec(&engine, &mut session, &["NOSUCH", "x"]).is_error());
    exec(&engine, &mut session, &["SET", "k", "v"]);
    let RespValue::Error(message) = exec(&engine, &mut session, &["EXEC"]) else {
        panic!("EXEC after a queue error must abort");
    };
    assert!(message.starts_with("EXECABORT"), "got: {}", message);
    assert_eq!(exec(&engine, &mut session, &["GET", "k"]), RespValue::Null);
}

#[test]
fn test_watch_aborts_on_conflict() {
    let engine = test_engine();
    let mut watcher = session();
    let mut writer = session();

    exec(&engine, &mut watcher, &["SET", "k", "1"]);
    assert_eq!(exec(&engine, &mut watcher, &["WATCH", "k"]), RespValue::ok());
    // Another client touches the watched key before EXEC.
    exec(&engine, &mut writer, &["SET", "k", "2"]);

    exec(&engine, &mut watcher, &["MULTI"]);
    exec(&engine, &mut watcher, &["SET", "k", "3"]);
    assert_eq!(exec(&engine, &mut watcher, &["EXEC"]), RespValue::NullArray);
    assert_eq!(exec(&engine, &mut watcher, &["GET", "k"]), bulk("2"));
}

#[test]
fn test_watch_passes_without_conflict() {
    let engine = test_engine();
    let mut session = session();

    exec(&engine, &mut session, &["SET", "k", "1"]);
    exec(&engine, &mut session, &["WATCH", "k"]);
    exec(&engine, &mut session, &["MULTI"]);
    exec(&engine, &mut session, &["INCR", "k"]);
    assert_eq!(
        exec(&engine, &mut session, &["EXEC"]),
        RespValue::Array(vec![RespValue::Integer(2)])
    );
}

#[test]
fn test_failed_command_rolls_back_batch() {
    let engine = test_engine();
    let mut session = session();

    exec(&engine, &mut session, &["SET", "k", "before"]);
    exec(&engine, &mut session, &["MULTI"]);
    exec(&engine, &mut session, &["SET", "k", "after"]);
    // Runtime failure: LPUSH against a string key.
    exec(&engine, &mut session, &["LPUSH", "k", "x"]);
    let reply = exec(&engine, &mut session, &["EXEC"]);
    assert!(reply.is_error(), "got: {:?}", reply);
    // The first SET was rolled back.
    assert_eq!(exec(&engine, &mut session, &["GET", "k"]), bulk("before"));
}

#[test]
fn test_concurrent_multi_incr_is_atomic() {
    // Two clients each run MULTI; INCR k; EXEC a thousand times.
    let engine = test_engine();
    let mut handles = Vec::new();
    for _ in 0..2 {
        let engine = std::sync::Arc::clone(&engine);
        handles.push(std::thread::spawn(move || {
            let mut session = rudis::connection::Session::new("worker:0".to_string());
            for _ in 0..1000 {
                assert_eq!(exec(&engine, &mut session, &["MULTI"]), RespValue::ok());
                exec(&engine, &mut session, &["INCR", "k"]);
                let reply = exec(&engine, &mut session, &["EXEC"]);
                assert!(matches!(reply, RespValue::Array(_)), "got: {:?}", reply);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    let mut session = session();
    assert_eq!(exec(&engine, &mut session, &["GET", "k"]), bulk("2000"));
}
