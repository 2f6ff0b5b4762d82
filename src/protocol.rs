use std::collections::BTreeMap;
use std::path::Path;

use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};

use crate::constants::STORAGE_PROTOCOL_VERSION;
use crate::error::{GridError, Result};
use crate::hashutil;

/// Announcement published by a storage server and consumed by the peer ring.
///
/// # Fields
///
/// * `address` - Where the server's storage service can be reached.
/// * `permutation_seed` - Base32 seed the ring hashes to place this server. Servers
///   that predate seeds leave it out, and their identity is used instead.
/// * `protocol_version` - Storage protocol marker.
/// * `nickname` - Free-form operator label.
///
/// # Examples
///
/// ```rust
/// use sharegrid::protocol::StorageAnnouncement;
///
/// let ann: StorageAnnouncement = serde_json::from_str(
///     r#"{"storage-address": "/ip4/10.0.0.1/tcp/3457", "permutation-seed-base32": "nbswy3dp"}"#,
/// ).unwrap();
/// assert_eq!(ann.seed_bytes().unwrap(), Some(b"hello".to_vec()));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageAnnouncement {
    #[serde(rename = "storage-address", default)]
    pub address: Option<Multiaddr>,
    #[serde(rename = "permutation-seed-base32", default)]
    pub permutation_seed: Option<String>,
    #[serde(rename = "protocol-version", default = "default_protocol_version")]
    pub protocol_version: String,
    #[serde(default)]
    pub nickname: Option<String>,
}

fn default_protocol_version() -> String {
    STORAGE_PROTOCOL_VERSION.to_string()
}

impl StorageAnnouncement {
    pub fn new(address: Option<Multiaddr>, permutation_seed: &[u8]) -> Self {
        StorageAnnouncement {
            address,
            permutation_seed: Some(hashutil::b2a(permutation_seed)),
            protocol_version: default_protocol_version(),
            nickname: None,
        }
    }

    /// Decoded permutation seed, or `None` for a server that never announced one.
    pub fn seed_bytes(&self) -> Result<Option<Vec<u8>>> {
        self.permutation_seed
            .as_deref()
            .map(|seed| {
                hashutil::a2b(seed)
                    .map_err(|e| GridError::configuration("permutation-seed-base32", e.to_string()))
            })
            .transpose()
    }
}

/// One entry of the operator-supplied static peer list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticServer {
    pub ann: StorageAnnouncement,
}

/// Contents of `private/servers.toml`: server identity to announcement.
///
/// ```toml
/// [storage."12D3KooW..".ann]
/// storage-address = "/ip4/10.0.0.1/tcp/3457"
/// permutation-seed-base32 = "..."
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticServers {
    #[serde(default)]
    pub storage: BTreeMap<String, StaticServer>,
}

impl StaticServers {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Loads the static peer list, treating a missing file as an empty list.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(StaticServers::default());
        }
        Self::parse(&std::fs::read_to_string(path)?)
    }
}
