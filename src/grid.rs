//! Node assembly: builds every component in dependency order and tears them
//! down in reverse.

use std::fs;
use std::sync::Arc;

use futures::channel::oneshot;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capability::Capability;
use crate::client::StorageClient;
use crate::config::GridConfig;
use crate::error::Result;
use crate::keygen::KeyGenerator;
use crate::lease::SystemClock;
use crate::nodemaker::{Node, NodeMaker};
use crate::protocol::{StaticServers, StorageAnnouncement};
use crate::provider::{self, DiskSpace};
use crate::ring::PeerRing;
use crate::secret::SecretHolder;
use crate::server::StorageServer;
use crate::upload::Uploader;

/// Owns every background task of a node together with its stop handle.
#[derive(Default)]
pub struct Terminator {
    tasks: Vec<(&'static str, oneshot::Sender<()>, JoinHandle<()>)>,
}

impl Terminator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &'static str, stop: oneshot::Sender<()>, handle: JoinHandle<()>) {
        debug!("started {}", name);
        self.tasks.push((name, stop, handle));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Stops the tasks last-started first and waits for each to finish.
    pub async fn shutdown(mut self) {
        while let Some((name, stop, handle)) = self.tasks.pop() {
            let _ = stop.send(());
            match handle.await {
                Ok(()) => debug!("stopped {}", name),
                Err(e) => warn!("{} ended abnormally: {}", name, e),
            }
        }
    }
}

/// A running node: client components plus, when enabled, a local storage
/// server with its expiration sweeper.
///
/// # Fields
///
/// * `secrets` - Lease and convergence secrets from `private/`.
/// * `keygen` - Key generator for new mutable files.
/// * `ring` - Known storage servers, including the local one.
/// * `uploader` - Share placement.
/// * `node_maker` - Capability dispatch.
/// * `storage` - Handle to the local storage server, if any.
/// * `terminator` - Background tasks.
pub struct GridClient {
    config: GridConfig,
    pub secrets: Arc<SecretHolder>,
    pub keygen: Arc<KeyGenerator>,
    pub ring: Arc<PeerRing>,
    pub uploader: Arc<Uploader>,
    pub node_maker: NodeMaker,
    storage: Option<StorageClient>,
    terminator: Terminator,
}

impl GridClient {
    /// Builds and starts a node.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let config = GridConfig::new(Path::new(".grid"))?;
    /// let client = GridClient::start(config).await?;
    /// client.when_connected_enough(7).await?;
    /// let cap = client.upload(b"hello").await?;
    /// client.shutdown().await;
    /// ```
    pub async fn start(config: GridConfig) -> Result<Self> {
        config.validate()?;
        let secrets = Arc::new(SecretHolder::load_or_create(&config.private_dir())?);

        let keygen = KeyGenerator::new();
        if let Some(bits) = config.client.mutable_keysize {
            keygen.set_default_strength(bits);
        }
        let keygen = Arc::new(keygen);

        let ring = Arc::new(PeerRing::new(config.preferred_peers()?));
        ring.set_static_servers(&StaticServers::load(&config.static_servers_path())?)?;

        let mut terminator = Terminator::new();
        let storage = if config.storage.enabled {
            Some(Self::start_storage(&config, &ring, &mut terminator)?)
        } else {
            None
        };

        let uploader = Arc::new(Uploader::new(ring.clone(), secrets.clone()));
        let node_maker = NodeMaker::new(
            ring.clone(),
            secrets.clone(),
            uploader.clone(),
            keygen.clone(),
            config.encoding_parameters()?,
        );
        info!(
            "node {:?} started with {} known servers",
            config.nickname,
            ring.servers().len()
        );
        Ok(GridClient {
            config,
            secrets,
            keygen,
            ring,
            uploader,
            node_maker,
            storage,
            terminator,
        })
    }

    fn start_storage(config: &GridConfig, ring: &PeerRing, terminator: &mut Terminator) -> Result<StorageClient> {
        let server_id = config.server_id()?;
        let settings = config.storage_settings()?;
        let storage_dir = config.storage_dir();
        fs::create_dir_all(&storage_dir)?;

        let store = provider::dao(Some(&storage_dir.join("shares")))?;
        let seed = config.permutation_seed(!store.is_empty()?)?;
        let (server, client) = StorageServer::new(
            server_id.clone(),
            store,
            settings,
            Box::new(DiskSpace::new(&storage_dir)),
            Arc::new(SystemClock),
        );
        let (stop, shutdown) = oneshot::channel();
        terminator.register("storage server", stop, tokio::spawn(server.run(shutdown)));

        let mut interval = provider::sweep_interval(config.sweep_interval()?);
        let sweeper = client.clone();
        let (stop, shutdown) = oneshot::channel::<()>();
        terminator.register(
            "expiration sweeper",
            stop,
            tokio::spawn(async move {
                futures::select! {
                    _ = provider::sweep_loop(&mut interval, sweeper).fuse() => {},
                    _ = shutdown.fuse() => {},
                }
            }),
        );

        ring.announce(server_id.clone(), StorageAnnouncement::new(config.listen_address()?, &seed))?;
        ring.connect(&server_id, client.clone())?;
        Ok(client)
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    /// The local storage server, when this node runs one.
    pub fn storage(&self) -> Option<&StorageClient> {
        self.storage.as_ref()
    }

    pub async fn when_connected_enough(&self, threshold: usize) -> Result<()> {
        self.ring.when_connected_enough(threshold).await
    }

    pub async fn upload(&self, contents: &[u8]) -> Result<Capability> {
        Ok(self.node_maker.upload(contents).await?.capability())
    }

    pub fn create_node_from_uri(&self, write_uri: Option<&str>, read_uri: Option<&str>) -> Node {
        self.node_maker.create_from_capability(write_uri, read_uri)
    }

    /// Stops background tasks in reverse start order.
    pub async fn shutdown(self) {
        info!("shutting down {} tasks", self.terminator.len());
        self.terminator.shutdown().await;
    }
}
