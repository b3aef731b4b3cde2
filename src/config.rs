//! Server configuration.
//!
//! Configuration comes from a Redis-style key-value file: one `key value`
//! pair per line, `#` comments, `yes`/`no` booleans. Unknown keys and
//! malformed values are ignored so a config written for a richer server
//! still loads.

use std::io;
use std::path::{Path, PathBuf};

use rand::distr::{Alphanumeric, SampleString};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// fsync after every write; writes bypass the async queue.
    Always,
    /// fsync on a one second tick.
    EverySec,
    /// Leave syncing to the operating system.
    No,
}

impl FsyncPolicy {
    fn parse(value: &str) -> FsyncPolicy {
        match value.to_lowercase().as_str() {
            "always" => FsyncPolicy::Always,
            "no" => FsyncPolicy::No,
            _ => FsyncPolicy::EverySec,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub run_id: String,
    pub bind: String,
    pub port: u16,
    pub dir: String,
    pub announce_host: String,

    pub append_only: bool,
    pub append_filename: String,
    pub append_fsync: FsyncPolicy,
    pub aof_use_rdb_preamble: bool,
    pub db_filename: String,

    pub databases: usize,
    pub max_clients: usize,
    pub require_pass: String,

    pub cluster_enable: bool,
    pub cluster_as_seed: bool,
    pub cluster_seed: String,
    pub raft_listen_addr: String,
    pub raft_advertise_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            run_id: Alphanumeric.sample_string(&mut rand::rng(), 40),
            bind: "127.0.0.1".to_string(),
            port: 6379,
            dir: ".".to_string(),
            announce_host: String::new(),
            append_only: false,
            append_filename: "appendonly.aof".to_string(),
            append_fsync: FsyncPolicy::EverySec,
            aof_use_rdb_preamble: false,
            db_filename: "dump.rdb".to_string(),
            databases: 16,
            max_clients: 0,
            require_pass: String::new(),
            cluster_enable: false,
            cluster_as_seed: false,
            cluster_seed: String::new(),
            raft_listen_addr: String::new(),
            raft_advertise_addr: String::new(),
        }
    }
}

fn parse_bool(value: &str) -> bool {
    value == "yes"
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<ServerConfig, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> ServerConfig {
        let mut config = ServerConfig::default();
        for line in content.lines() {
            let line = line.trim_start();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some(pivot) = line.find(' ') else { continue };
            let key = line[..pivot].to_lowercase();
            let value = line[pivot + 1..].trim();
            if value.is_empty() {
                continue;
            }
            match key.as_str() {
                "bind" => config.bind = value.to_string(),
                "port" => {
                    if let Ok(port) = value.parse() {
                        config.port = port;
                    }
                }
                "dir" => config.dir = value.to_string(),
                "announce-host" => config.announce_host = value.to_string(),
                "appendonly" => config.append_only = parse_bool(value),
                "appendfilename" => config.append_filename = value.to_string(),
                "appendfsync" => config.append_fsync = FsyncPolicy::parse(value),
                "aof-use-rdb-preamble" => config.aof_use_rdb_preamble = parse_bool(value),
                "dbfilename" => config.db_filename = value.to_string(),
                "databases" => {
                    if let Ok(databases) = value.parse::<usize>() {
                        if databases > 0 {
                            config.databases = databases;
                        }
                    }
                }
                "maxclients" => {
                    if let Ok(max_clients) = value.parse() {
                        config.max_clients = max_clients;
                    }
                }
                "requirepass" => config.require_pass = value.to_string(),
                "cluster-enable" => config.cluster_enable = parse_bool(value),
                "cluster-as-seed" => config.cluster_as_seed = parse_bool(value),
                "cluster-seed" => config.cluster_seed = value.to_string(),
                "raft-listen-address" => config.raft_listen_addr = value.to_string(),
                "raft-advertise-address" => config.raft_advertise_addr = value.to_string(),
                _ => {}
            }
        }
        config
    }

    /// The TCP endpoint to listen on.
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// The address other nodes should use to reach this one.
    pub fn announce_address(&self) -> String {
        if self.announce_host.is_empty() {
            self.address()
        } else {
            format!("{}:{}", self.announce_host, self.port)
        }
    }

    pub fn aof_path(&self) -> PathBuf {
        Path::new(&self.dir).join(&self.append_filename)
    }

    /// Scratch directory for rewrite temp files.
    pub fn tmp_dir(&self) -> PathBuf {
        Path::new(&self.dir).join("tmp")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 6379);
        assert_eq!(config.databases, 16);
        assert_eq!(config.append_fsync, FsyncPolicy::EverySec);
        assert!(!config.append_only);
        assert_eq!(config.run_id.len(), 40);
    }

    #[test]
    fn test_parse_full_file() {
        let content = "\
# sample config
bind 0.0.0.0
port 7000
dir /tmp/rudis
appendonly yes
appendfilename data.aof
appendfsync always
aof-use-rdb-preamble yes
databases 4
maxclients 100
requirepass secret
cluster-enable yes
cluster-as-seed no
cluster-seed 10.0.0.1:7000
raft-listen-address 0.0.0.0:17000
raft-advertise-address 10.0.0.2:17000
";
        let config = ServerConfig::parse(content);
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.port, 7000);
        assert_eq!(config.dir, "/tmp/rudis");
        assert!(config.append_only);
        assert_eq!(config.append_filename, "data.aof");
        assert_eq!(config.append_fsync, FsyncPolicy::Always);
        assert!(config.aof_use_rdb_preamble);
        assert_eq!(config.databases, 4);
        assert_eq!(config.max_clients, 100);
        assert_eq!(config.require_pass, "secret");
        assert!(config.cluster_enable);
        assert!(!config.cluster_as_seed);
        assert_eq!(config.cluster_seed, "10.0.0.1:7000");
        assert_eq!(config.address(), "0.0.0.0:7000");
        assert_eq!(config.tmp_dir(), PathBuf::from("/tmp/rudis/tmp"));
    }

    #[test]
    fn test_parse_ignores_junk() {
        let test_cases = vec![
            ("port notanumber\n", 6379),
            ("unknown-key value\nport 6400\n", 6400),
            ("   # indented comment\nport 6401\n", 6401),
            ("port\n", 6379),
        ];
        for (content, expected_port) in test_cases {
            let config = ServerConfig::parse(content);
            assert_eq!(config.port, expected_port, "parsing {:?}", content);
        }
    }
}
