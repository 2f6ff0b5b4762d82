//! In-process grids for tests: storage servers on tokio tasks, wired into a
//! [`PeerRing`] as connected peers.

use std::sync::Arc;

use futures::channel::oneshot;

use crate::client::StorageClient;
use crate::error::{GridError, Result};
use crate::hashutil::StorageIndex;
use crate::keygen::KeyGenerator;
use crate::lease::ManualClock;
use crate::nodemaker::NodeMaker;
use crate::protocol::StorageAnnouncement;
use crate::provider::Unlimited;
use crate::repository::{HashMapShareStore, ShareRecord, ShareStore};
use crate::ring::{PeerRing, ServerId};
use crate::secret::{ConvergenceSecret, RootSecret, SecretHolder};
use crate::server::{StorageServer, StorageSettings};
use crate::upload::{EncodingParameters, Uploader};

/// Grid start time used by every test clock.
pub(crate) const GRID_EPOCH: u64 = 1_700_000_000;

/// Small keys keep mutable file tests fast.
pub(crate) const TEST_KEYSIZE: usize = 768;

struct TestServer {
    server_id: ServerId,
    client: StorageClient,
    store: Arc<dyn ShareStore>,
    stop: Option<oneshot::Sender<()>>,
}

pub(crate) struct TestGrid {
    pub ring: Arc<PeerRing>,
    pub secrets: Arc<SecretHolder>,
    pub keygen: Arc<KeyGenerator>,
    pub clock: Arc<ManualClock>,
    servers: Vec<TestServer>,
}

impl TestGrid {
    pub async fn with_servers(count: usize) -> Self {
        Self::with_settings(vec![StorageSettings::default(); count]).await
    }

    /// One in-memory server per entry of `settings`, all connected.
    pub async fn with_settings(settings: Vec<StorageSettings>) -> Self {
        let servers = settings
            .into_iter()
            .map(|settings| {
                let store: Arc<dyn ShareStore> = Arc::new(HashMapShareStore::new());
                (settings, store)
            })
            .collect();
        Self::build(servers)
    }

    /// One default server per store, all connected.
    pub async fn with_stores(stores: Vec<Arc<dyn ShareStore>>) -> Self {
        let servers = stores
            .into_iter()
            .map(|store| (StorageSettings::default(), store))
            .collect();
        Self::build(servers)
    }

    fn build(configured: Vec<(StorageSettings, Arc<dyn ShareStore>)>) -> Self {
        let ring = Arc::new(PeerRing::default());
        let clock = Arc::new(ManualClock::new(GRID_EPOCH));
        let mut servers = Vec::with_capacity(configured.len());
        for (settings, store) in configured {
            let server_id = ServerId::random();
            let (server, client) = StorageServer::new(
                server_id.clone(),
                Box::new(Arc::clone(&store)),
                settings,
                Box::new(Unlimited),
                clock.clone(),
            );
            let (stop, shutdown) = oneshot::channel();
            tokio::spawn(server.run(shutdown));

            let announcement = StorageAnnouncement::new(None, &server_id.to_bytes());
            ring.announce(server_id.clone(), announcement)
                .expect("announce test server");
            ring.connect(&server_id, client.clone())
                .expect("connect test server");
            servers.push(TestServer {
                server_id,
                client,
                store,
                stop: Some(stop),
            });
        }

        let keygen = KeyGenerator::new();
        keygen.set_default_strength(TEST_KEYSIZE);
        TestGrid {
            ring,
            secrets: Arc::new(SecretHolder::new(&RootSecret::generate())),
            keygen: Arc::new(keygen),
            clock,
            servers,
        }
    }

    pub fn clients(&self) -> Vec<StorageClient> {
        self.servers.iter().map(|s| s.client.clone()).collect()
    }

    pub fn server_ids(&self) -> Vec<ServerId> {
        self.servers.iter().map(|s| s.server_id.clone()).collect()
    }

    pub fn client_for(&self, server_id: &ServerId) -> Option<StorageClient> {
        self.servers
            .iter()
            .find(|s| &s.server_id == server_id)
            .map(|s| s.client.clone())
    }

    /// The store behind one server, for tampering with what it holds.
    pub fn store_for(&self, server_id: &ServerId) -> Option<Arc<dyn ShareStore>> {
        self.servers
            .iter()
            .find(|s| &s.server_id == server_id)
            .map(|s| Arc::clone(&s.store))
    }

    /// Stops one server but leaves it connected in the ring, so callers see
    /// it fail rather than disappear.
    pub async fn stop_server(&mut self, index: usize) {
        let server = &mut self.servers[index];
        if let Some(stop) = server.stop.take() {
            let _ = stop.send(());
        }
        while server.client.have_shares().await.is_ok() {
            tokio::task::yield_now().await;
        }
    }

    pub fn uploader(&self) -> Uploader {
        Uploader::new(self.ring.clone(), self.secrets.clone())
    }

    /// A different client that shares this grid's convergence secret.
    pub fn uploader_with_convergence(&self, convergence: ConvergenceSecret) -> Uploader {
        let secrets = SecretHolder::with_convergence(&RootSecret::generate(), convergence);
        Uploader::new(self.ring.clone(), Arc::new(secrets))
    }

    /// A different client with its own secrets.
    pub fn fresh_uploader(&self) -> Uploader {
        let secrets = SecretHolder::new(&RootSecret::generate());
        Uploader::new(self.ring.clone(), Arc::new(secrets))
    }

    pub fn node_maker(&self, params: EncodingParameters) -> NodeMaker {
        NodeMaker::new(
            self.ring.clone(),
            self.secrets.clone(),
            Arc::new(self.uploader()),
            self.keygen.clone(),
            params,
        )
    }
}

/// A store whose every record fails to decode.
pub(crate) struct UndecodableStore;

impl UndecodableStore {
    fn garbled<T>() -> Result<T> {
        let err = serde_json::from_slice::<ShareRecord>(b"{garbled").unwrap_err();
        Err(GridError::Serialization(err))
    }
}

impl ShareStore for UndecodableStore {
    fn insert(&self, _: &ShareRecord) -> Result<()> {
        Self::garbled()
    }

    fn get(&self, _: &StorageIndex, _: u8) -> Result<Option<ShareRecord>> {
        Self::garbled()
    }

    fn get_for_index(&self, _: &StorageIndex) -> Result<Vec<ShareRecord>> {
        Self::garbled()
    }

    fn get_all(&self) -> Result<Vec<ShareRecord>> {
        Self::garbled()
    }

    fn write_data(&self, _: &StorageIndex, _: u8, _: &[u8]) -> Result<()> {
        Self::garbled()
    }

    fn read_data(&self, _: &StorageIndex, _: u8) -> Result<Option<Vec<u8>>> {
        Self::garbled()
    }

    fn delete(&self, _: &StorageIndex, _: u8) -> Result<()> {
        Self::garbled()
    }

    fn is_empty(&self) -> Result<bool> {
        Self::garbled()
    }
}
