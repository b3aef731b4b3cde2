//! Per-client session state and the connection read loop.

use std::collections::HashMap;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::resp::{CmdLine, RespValue};
use crate::server::Backend;

/// Queued state for an open MULTI block.
#[derive(Debug, Default)]
pub struct MultiState {
    pub queue: Vec<CmdLine>,
    /// Set when a queued command failed validation; EXEC aborts.
    pub has_error: bool,
}

/// Connection-scoped state: the selected database, authentication, an open
/// transaction and the watched-key versions backing it.
#[derive(Debug)]
pub struct Session {
    pub addr: String,
    pub db_index: usize,
    pub authenticated: bool,
    pub multi: Option<MultiState>,
    pub watching: HashMap<String, u64>,
    /// In-process sessions (AOF replay, migration transfers) skip auth.
    pub fake: bool,
}

impl Session {
    pub fn new(addr: String) -> Self {
        Session {
            addr,
            db_index: 0,
            authenticated: false,
            multi: None,
            watching: HashMap::new(),
            fake: false,
        }
    }

    /// A session for internal command execution.
    pub fn fake() -> Self {
        let mut session = Session::new("fake:0".to_string());
        session.fake = true;
        session
    }

    pub fn in_multi(&self) -> bool {
        self.multi.is_some()
    }
}

/// Serves one client: reads frames, executes them against the backend and
/// writes replies. Returns when the peer disconnects, sends a malformed
/// frame, or the server shuts down.
pub async fn handle_client(mut stream: TcpStream, addr: String, backend: Backend) {
    let mut session = Session::new(addr);
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        let value = loop {
            match RespValue::decode(&mut buf) {
                Ok(Some(value)) => break value,
                Ok(None) => match stream.read_buf(&mut buf).await {
                    Ok(0) => {
                        debug!(addr = %session.addr, "client disconnected");
                        return;
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        debug!(addr = %session.addr, %err, "read failed");
                        return;
                    }
                },
                Err(err) => {
                    // Protocol errors close the connection.
                    let reply = RespValue::Error(format!("ERR Protocol error: {}", err));
                    let _ = stream.write_all(reply.encode().as_bytes()).await;
                    return;
                }
            }
        };

        let reply = match value.as_cmd_line() {
            Some(cmdline) => backend.exec(&mut session, &cmdline).await,
            None => RespValue::Error("ERR invalid command frame".to_string()),
        };
        if stream.write_all(reply.encode().as_bytes()).await.is_err() {
            return;
        }
    }
}
