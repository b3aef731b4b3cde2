//! RESP client pool for node-to-node commands.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::cluster::ClusterError;
use crate::config::ServerConfig;
use crate::resp::{make_cmd_line, RespValue};

pub struct PeerClient {
    stream: TcpStream,
    buf: BytesMut,
}

impl PeerClient {
    pub async fn connect(addr: &str, config: &ServerConfig) -> Result<PeerClient, ClusterError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| ClusterError::Connect(addr.to_string(), err.to_string()))?;
        let mut client = PeerClient {
            stream,
            buf: BytesMut::with_capacity(4096),
        };
        if !config.require_pass.is_empty() {
            let reply = client
                .send(&make_cmd_line("AUTH", &[&config.require_pass]))
                .await?;
            if reply.is_error() {
                return Err(ClusterError::Peer(format!("auth rejected by {}", addr)));
            }
        }
        Ok(client)
    }

    /// Sends one command and reads one reply frame.
    pub async fn send(&mut self, cmdline: &[String]) -> Result<RespValue, ClusterError> {
        let frame = RespValue::from_cmd_line(cmdline).encode();
        self.stream
            .write_all(frame.as_bytes())
            .await
            .map_err(|err| ClusterError::Peer(err.to_string()))?;
        loop {
            match RespValue::decode(&mut self.buf) {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {
                    let read = self
                        .stream
                        .read_buf(&mut self.buf)
                        .await
                        .map_err(|err| ClusterError::Peer(err.to_string()))?;
                    if read == 0 {
                        return Err(ClusterError::Peer("peer closed connection".to_string()));
                    }
                }
                Err(err) => return Err(ClusterError::Peer(err.to_string())),
            }
        }
    }
}

/// Pools one connection per peer and hands it out exclusively.
pub struct ConnectionFactory {
    config: Arc<ServerConfig>,
    pools: Mutex<HashMap<String, Vec<PeerClient>>>,
}

impl ConnectionFactory {
    pub fn new(config: Arc<ServerConfig>) -> Arc<ConnectionFactory> {
        Arc::new(ConnectionFactory {
            config,
            pools: Mutex::new(HashMap::new()),
        })
    }

    pub async fn borrow(&self, addr: &str) -> Result<PeerClient, ClusterError> {
        if let Some(client) = self
            .pools
            .lock()
            .await
            .get_mut(addr)
            .and_then(|pool| pool.pop())
        {
            return Ok(client);
        }
        PeerClient::connect(addr, &self.config).await
    }

    pub async fn give_back(&self, addr: &str, client: PeerClient) {
        self.pools
            .lock()
            .await
            .entry(addr.to_string())
            .or_default()
            .push(client);
    }

    /// Borrows, runs one command, and returns the client to the pool.
    pub async fn send_to(&self, addr: &str, cmdline: &[String]) -> Result<RespValue, ClusterError> {
        let mut client = self.borrow(addr).await?;
        let reply = client.send(cmdline).await;
        if reply.is_ok() {
            self.give_back(addr, client).await;
        }
        reply
    }
}
