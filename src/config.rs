use std::fs;
use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

// Defaults match the wire protocol: every node on the LAN has to agree on
// the discovery port and the multicast group, so overriding them only makes
// sense for test setups.

pub const DISCOVERY_PORT: u16 = 44700;
pub const LISTING_PORT: u16 = 44701;
pub const TRANSFER_PORT: u16 = 44702;

/// Link-local multicast group the discovery service joins. `ff02` is the
/// link-local scope, `14:2857` is just this protocol's group identifier.
pub const MULTICAST_GROUP: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0x14, 0x2857);

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub discovery_port: u16,
    pub listing_port: u16,
    pub transfer_port: u16,
    /// Root of the mirrored directory tree. Created at startup if absent.
    pub sync_root: PathBuf,
    pub log_dir: PathBuf,
    /// Ceiling for a single file transfer; larger files are abandoned.
    pub max_file_bytes: u32,
    /// Ceiling for one directory-listing reply.
    pub max_listing_bytes: u32,
    pub connect_timeout_secs: u64,
    /// Seconds between discovery rebroadcasts, measured from the last send.
    pub broadcast_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_port: DISCOVERY_PORT,
            listing_port: LISTING_PORT,
            transfer_port: TRANSFER_PORT,
            sync_root: PathBuf::from("./sync_files"),
            log_dir: PathBuf::from("./log"),
            max_file_bytes: 20_000_000,
            max_listing_bytes: 8096 * 8,
            connect_timeout_secs: 5,
            broadcast_interval_secs: 10,
        }
    }
}

impl Config {
    /// Loads the config from a JSON file, falling back to the defaults if
    /// the file is missing or unparseable. A broken config file should not
    /// keep the daemon from starting.
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<Config>(&content) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("failed to parse {}: {}, using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("failed to read {}: {}, using defaults", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_secs(self.broadcast_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_use_wire_ports() {
        let config = Config::default();
        assert_eq!(config.discovery_port, 44700);
        assert_eq!(config.listing_port, 44701);
        assert_eq!(config.transfer_port, 44702);
        assert_eq!(config.sync_root, PathBuf::from("./sync_files"));
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"sync_root": "/tmp/mirror", "connect_timeout_secs": 2}}"#).unwrap();
        let config = Config::load(Some(file.path()));
        assert_eq!(config.sync_root, PathBuf::from("/tmp/mirror"));
        assert_eq!(config.connect_timeout_secs, 2);
        assert_eq!(config.discovery_port, 44700);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load(Some(Path::new("/nonexistent/driftsync.json")));
        assert_eq!(config.listing_port, LISTING_PORT);
    }
}
