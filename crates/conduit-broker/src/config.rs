//! Broker configuration, sourced entirely from `CONN_SERVER_*` environment
//! variables with per-OS defaults matching the deployed VM images.

use std::{path::PathBuf, time::Duration};

use conduit_ring::SyncPolicy;
use conduit_utils::env::{env_flag, env_or};

pub const DEFAULT_SOCKET: &str = "/tmp/conn_server.sock";
/// Size a file-backed region is created with when the path doesn't already
/// exist (device nodes come pre-sized).
pub const DEFAULT_REGION_LEN: u64 = 4 * 1024 * 1024;

#[cfg(target_os = "macos")]
mod defaults {
    pub const H2G_FILE: &str = "/dev/rdisk4";
    pub const G2H_FILE: &str = "/dev/rdisk5";
    pub const IS_GUEST: bool = false;
}

#[cfg(not(target_os = "macos"))]
mod defaults {
    pub const H2G_FILE: &str = "/dev/disk/by-id/virtio-conn-h2g";
    pub const G2H_FILE: &str = "/dev/disk/by-id/virtio-conn-g2h";
    pub const IS_GUEST: bool = true;
}

/// Broker Socket path, shared with the client library.
pub fn broker_socket_path() -> PathBuf {
    PathBuf::from(env_or("CONN_SERVER_SOCKET", DEFAULT_SOCKET.to_string()))
}

#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub is_guest: bool,
    /// Heartbeat endpoint: the guest connects here, the host accepts here.
    pub server_address: String,
    pub server_port: u16,
    pub h2g_file: PathBuf,
    pub g2h_file: PathBuf,
    pub socket_path: PathBuf,
    pub region_len: u64,
    pub poll_interval: Duration,
    pub sync_policy: SyncPolicy,
    /// Optional core to pin the ring pump to.
    pub pump_core: Option<usize>,
}

impl BrokerConfig {
    pub fn from_env() -> Self {
        let sync_policy = match std::env::var("CONN_SERVER_SYNC").as_deref() {
            Ok("fence") => SyncPolicy::Fence,
            Ok("file") => SyncPolicy::FileSync,
            _ => SyncPolicy::default_for_os(),
        };
        Self {
            is_guest: env_flag("CONN_SERVER_IS_GUEST", defaults::IS_GUEST),
            server_address: env_or("CONN_SERVER_ADDRESS", "192.168.64.1".to_string()),
            server_port: env_or("CONN_SERVER_PORT", 4000),
            h2g_file: PathBuf::from(env_or(
                "CONN_SERVER_H2G_FILE",
                defaults::H2G_FILE.to_string(),
            )),
            g2h_file: PathBuf::from(env_or(
                "CONN_SERVER_G2H_FILE",
                defaults::G2H_FILE.to_string(),
            )),
            socket_path: broker_socket_path(),
            region_len: env_or("CONN_SERVER_REGION_SIZE", DEFAULT_REGION_LEN),
            poll_interval: Duration::from_micros(env_or("CONN_SERVER_POLL_US", 10)),
            sync_policy,
            pump_core: std::env::var("CONN_SERVER_PUMP_CORE")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }

    /// Region this peer produces into.
    pub fn outbound_file(&self) -> &PathBuf {
        if self.is_guest { &self.g2h_file } else { &self.h2g_file }
    }

    /// Region this peer consumes from.
    pub fn inbound_file(&self) -> &PathBuf {
        if self.is_guest { &self.h2g_file } else { &self.g2h_file }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_follows_role() {
        let mut config = BrokerConfig::from_env();
        config.h2g_file = PathBuf::from("/h2g");
        config.g2h_file = PathBuf::from("/g2h");

        config.is_guest = true;
        assert_eq!(config.outbound_file(), &PathBuf::from("/g2h"));
        assert_eq!(config.inbound_file(), &PathBuf::from("/h2g"));

        config.is_guest = false;
        assert_eq!(config.outbound_file(), &PathBuf::from("/h2g"));
        assert_eq!(config.inbound_file(), &PathBuf::from("/g2h"));
    }
}
