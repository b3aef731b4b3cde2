//! Append-only file persistence.
//!
//! Mutating commands are serialized as RESP multi-bulk frames and appended
//! to a single log file. A dedicated writer task drains a channel of
//! payloads in FIFO order, so the log preserves the commit order the shard
//! locks established. Three fsync policies control durability; `always`
//! bypasses the channel entirely and writes under the persister lock in the
//! calling task. Rewrite compacts the log to the minimum command form in
//! three phases that bracket the live tail with the same lock.

mod load;
pub mod marshal;
mod persister;
mod rewrite;

pub use load::load_aof;
pub use persister::{Listener, Persister};
pub use rewrite::RewriteCtx;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AofError {
    #[error("aof io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("aof rdb preamble error: {0}")]
    Rdb(#[from] crate::rdb::RdbError),
    #[error("aof file path error: {0}")]
    Persist(String),
}
