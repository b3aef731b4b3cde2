//! Shared helpers for the integration suite.
#![allow(dead_code)]

use std::sync::Arc;

use rudis::config::ServerConfig;
use rudis::connection::Session;
use rudis::db::engine::DbEngine;
use rudis::resp::RespValue;

pub fn test_engine() -> Arc<DbEngine> {
    DbEngine::new(Arc::new(ServerConfig::default()))
}

pub fn exec(engine: &Arc<DbEngine>, session: &mut Session, parts: &[&str]) -> RespValue {
    let cmdline: Vec<String> = parts.iter().map(|part| part.to_string()).collect();
    engine.exec(session, &cmdline)
}

pub fn bulk(value: &str) -> RespValue {
    RespValue::BulkString(value.to_string())
}

pub fn bulk_array(values: &[&str]) -> RespValue {
    RespValue::Array(values.iter().map(|value| bulk(value)).collect())
}

pub fn session() -> Session {
    Session::new("test:0".to_string())
}
