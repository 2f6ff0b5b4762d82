//! The set of known storage servers and the per-file ordering over them.
//!
//! Every storage index induces its own permutation of the servers: each server
//! is keyed by `SHA256(storage index ‖ permutation seed)` and the ring is
//! sorted by that key. Uploaders and downloaders compute the same ordering
//! independently, so a reader finds shares without any lookup table.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use libp2p::PeerId;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::client::StorageClient;
use crate::error::{GridError, Result};
use crate::hashutil::{self, StorageIndex};
use crate::protocol::{StaticServers, StorageAnnouncement};

/// Identity of a storage server, the libp2p peer id of its node key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ServerId(PeerId);

impl ServerId {
    pub fn from_peer_id(peer_id: PeerId) -> Self {
        ServerId(peer_id)
    }

    pub fn random() -> Self {
        ServerId(PeerId::random())
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.0
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes()
    }
}

impl Ord for ServerId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_bytes().cmp(&other.to_bytes())
    }
}

impl PartialOrd for ServerId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerId({})", self.0)
    }
}

impl FromStr for ServerId {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self> {
        PeerId::from_str(s)
            .map(ServerId)
            .map_err(|e| GridError::UnknownServer(format!("{s}: {e}")))
    }
}

/// Where a server is in its lifecycle. A server the ring has never heard of
/// has no descriptor at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Announced,
    Connected,
    Disconnected,
}

/// Everything the ring knows about one server.
#[derive(Debug, Clone)]
pub struct ServerDescriptor {
    pub server_id: ServerId,
    pub permutation_seed: Vec<u8>,
    pub announcement: StorageAnnouncement,
    pub state: ServerState,
    pub connection: Option<StorageClient>,
    pub is_static: bool,
}

impl ServerDescriptor {
    /// Builds an announced descriptor. A server that announces no permutation
    /// seed is placed by its identity bytes, which is where servers placed
    /// shares before seeds existed.
    pub fn new(server_id: ServerId, announcement: StorageAnnouncement) -> Result<Self> {
        let permutation_seed = announcement
            .seed_bytes()?
            .unwrap_or_else(|| server_id.to_bytes());
        Ok(ServerDescriptor {
            server_id,
            permutation_seed,
            announcement,
            state: ServerState::Announced,
            connection: None,
            is_static: false,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.state == ServerState::Connected && self.connection.is_some()
    }

    pub fn nickname(&self) -> &str {
        self.announcement.nickname.as_deref().unwrap_or("<unnamed>")
    }

    fn permutation_key(&self, si: &StorageIndex) -> [u8; 32] {
        hashutil::permute_server_hash(si, &self.permutation_seed)
    }
}

/// Live registry of storage servers.
///
/// All mutation goes through the ring; readers get snapshots. The number of
/// connected servers is published on a watch channel so
/// [`PeerRing::when_connected_enough`] resumes the moment the threshold is
/// crossed.
pub struct PeerRing {
    servers: RwLock<BTreeMap<ServerId, ServerDescriptor>>,
    preferred: Vec<ServerId>,
    connected: watch::Sender<usize>,
}

impl Default for PeerRing {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl PeerRing {
    /// # Arguments
    ///
    /// * `preferred` - Servers to try ahead of the rest, for example the ones
    ///   on the local network.
    pub fn new(preferred: Vec<ServerId>) -> Self {
        let (connected, _) = watch::channel(0);
        PeerRing {
            servers: RwLock::new(BTreeMap::new()),
            preferred,
            connected,
        }
    }

    fn publish_connected(&self, servers: &BTreeMap<ServerId, ServerDescriptor>) {
        let count = servers.values().filter(|s| s.is_connected()).count();
        self.connected.send_replace(count);
    }

    /// Inserts or replaces the descriptor for `descriptor.server_id`.
    ///
    /// A server stays static once it has been registered as static.
    pub fn register(&self, mut descriptor: ServerDescriptor) {
        let mut servers = self.servers.write();
        if let Some(existing) = servers.get(&descriptor.server_id) {
            descriptor.is_static |= existing.is_static;
        }
        debug!(
            "registering server {} ({:?})",
            descriptor.server_id, descriptor.state
        );
        servers.insert(descriptor.server_id.clone(), descriptor);
        self.publish_connected(&servers);
    }

    /// Records an announcement. New and disconnected servers become
    /// `Announced`; a connected server keeps its connection.
    pub fn announce(&self, server_id: ServerId, announcement: StorageAnnouncement) -> Result<()> {
        let fresh = ServerDescriptor::new(server_id.clone(), announcement)?;
        let mut servers = self.servers.write();
        match servers.get_mut(&server_id) {
            Some(existing) => {
                existing.permutation_seed = fresh.permutation_seed;
                existing.announcement = fresh.announcement;
                if existing.state == ServerState::Disconnected {
                    existing.state = ServerState::Announced;
                }
            }
            None => {
                info!("new storage server announced: {}", server_id);
                servers.insert(server_id, fresh);
            }
        }
        self.publish_connected(&servers);
        Ok(())
    }

    pub fn connect(&self, server_id: &ServerId, connection: StorageClient) -> Result<()> {
        let mut servers = self.servers.write();
        let descriptor = servers
            .get_mut(server_id)
            .ok_or_else(|| GridError::UnknownServer(server_id.to_string()))?;
        descriptor.state = ServerState::Connected;
        descriptor.connection = Some(connection);
        debug!("connected to storage server {}", server_id);
        self.publish_connected(&servers);
        Ok(())
    }

    pub fn disconnect(&self, server_id: &ServerId) -> Result<()> {
        let mut servers = self.servers.write();
        let descriptor = servers
            .get_mut(server_id)
            .ok_or_else(|| GridError::UnknownServer(server_id.to_string()))?;
        descriptor.state = ServerState::Disconnected;
        descriptor.connection = None;
        debug!("lost storage server {}", server_id);
        self.publish_connected(&servers);
        Ok(())
    }

    /// Forgets a server. Static servers are never forgotten.
    pub fn remove(&self, server_id: &ServerId) -> bool {
        let mut servers = self.servers.write();
        let removable = servers.get(server_id).map_or(false, |s| !s.is_static);
        if removable {
            servers.remove(server_id);
            self.publish_connected(&servers);
        }
        removable
    }

    /// Merges an operator-supplied peer list into the ring.
    pub fn set_static_servers(&self, static_servers: &StaticServers) -> Result<()> {
        for (id, server) in &static_servers.storage {
            let server_id: ServerId = id.parse()?;
            let mut descriptor = ServerDescriptor::new(server_id, server.ann.clone())?;
            descriptor.is_static = true;
            self.register(descriptor);
        }
        info!("loaded {} static servers", static_servers.storage.len());
        Ok(())
    }

    pub fn get(&self, server_id: &ServerId) -> Option<ServerDescriptor> {
        self.servers.read().get(server_id).cloned()
    }

    pub fn servers(&self) -> Vec<ServerDescriptor> {
        self.servers.read().values().cloned().collect()
    }

    pub fn connected_servers(&self) -> BTreeSet<ServerId> {
        self.servers
            .read()
            .values()
            .filter(|s| s.is_connected())
            .map(|s| s.server_id.clone())
            .collect()
    }

    /// Resolves once at least `threshold` servers are connected. Never times
    /// out; wrap it in `tokio::time::timeout` to bound the wait.
    pub async fn when_connected_enough(&self, threshold: usize) -> Result<()> {
        let mut receiver = self.connected.subscribe();
        receiver
            .wait_for(|connected| *connected >= threshold)
            .await
            .map_err(|_| GridError::ServerUnavailable)?;
        Ok(())
    }

    /// Every known server in the order they should be tried for `si`.
    ///
    /// Preferred servers come first, then the rest. Both groups keep the
    /// permuted order, with the server id breaking ties between equal keys.
    pub fn permuted_servers(&self, si: &StorageIndex) -> Vec<ServerDescriptor> {
        let mut servers: Vec<(bool, [u8; 32], ServerDescriptor)> = self
            .servers
            .read()
            .values()
            .map(|s| {
                let preferred = self.preferred.contains(&s.server_id);
                (!preferred, s.permutation_key(si), s.clone())
            })
            .collect();
        servers.sort_by(|a, b| {
            (a.0, a.1)
                .cmp(&(b.0, b.1))
                .then_with(|| a.2.server_id.cmp(&b.2.server_id))
        });
        servers.into_iter().map(|(_, _, s)| s).collect()
    }

    pub fn permuted_peer_list(&self, si: &StorageIndex) -> Vec<ServerId> {
        self.permuted_servers(si)
            .into_iter()
            .map(|s| s.server_id)
            .collect()
    }
}
