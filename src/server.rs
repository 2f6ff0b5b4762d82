use std::sync::Arc;

use futures::channel::{mpsc, oneshot};
use futures::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::client::StorageClient;
use crate::command::{command_handler, Command};
use crate::constants::DEFAULT_LEASE_DURATION_SECONDS;
use crate::expiration::ExpirationPolicy;
use crate::lease::Clock;
use crate::provider::SpaceProbe;
use crate::repository::ShareStore;
use crate::ring::ServerId;

/// Admission and expiration settings of one storage server.
#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub readonly: bool,
    /// Free bytes the server keeps for everything else on the disk.
    pub reserved_space: u64,
    /// Lease duration granted on store, add and renew, in seconds.
    pub lease_duration: u64,
    pub expiration: ExpirationPolicy,
    /// Keep lease records but throw share bytes away. Test grids only.
    #[cfg(any(test, feature = "debug-discard"))]
    pub discard_storage: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            readonly: false,
            reserved_space: 0,
            lease_duration: DEFAULT_LEASE_DURATION_SECONDS,
            expiration: ExpirationPolicy::default(),
            #[cfg(any(test, feature = "debug-discard"))]
            discard_storage: false,
        }
    }
}

impl StorageSettings {
    pub(crate) fn discards_storage(&self) -> bool {
        #[cfg(any(test, feature = "debug-discard"))]
        {
            self.discard_storage
        }
        #[cfg(not(any(test, feature = "debug-discard")))]
        {
            false
        }
    }
}

/// Snapshot of a server's holdings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub shares: usize,
    pub storage_indexes: usize,
    pub leases: usize,
    pub bytes_stored: u64,
    /// `None` when the backing store cannot measure free space.
    pub available_space: Option<u64>,
    pub reserved_space: u64,
    pub readonly: bool,
}

/// The storage server event loop.
///
/// The server owns its share store outright. Every operation arrives as a
/// [`Command`] from a [`StorageClient`] and is applied to completion before
/// the next one is taken, which linearizes stores, renewals, cancellations
/// and sweeps against each other.
///
/// # Fields
///
/// * `server_id` - Identity used to derive per-server lease secrets and write enablers.
/// * `store` - Where shares and their leases live.
/// * `settings` - Admission control and expiration policy.
/// * `space` - Measures free space for admission control.
/// * `clock` - Time source for lease grants and sweeps.
/// * `command_receiver` - Receiver for incoming commands.
///
/// # Examples
///
/// ```ignore
/// let (server, client) = StorageServer::new(server_id, store, settings, space, clock);
/// let (stop, shutdown) = oneshot::channel();
/// tokio::spawn(server.run(shutdown));
/// client.store_share(si, 0, share, renew, cancel).await?;
/// ```
pub struct StorageServer {
    pub server_id: ServerId,
    pub(crate) store: Box<dyn ShareStore>,
    pub(crate) settings: StorageSettings,
    pub(crate) space: Box<dyn SpaceProbe>,
    pub(crate) clock: Arc<dyn Clock>,
    command_receiver: mpsc::Receiver<Command>,
}

impl StorageServer {
    /// Constructs a new server and the first handle to it.
    pub fn new(
        server_id: ServerId,
        store: Box<dyn ShareStore>,
        settings: StorageSettings,
        space: Box<dyn SpaceProbe>,
        clock: Arc<dyn Clock>,
    ) -> (Self, StorageClient) {
        if settings.discards_storage() {
            warn!("storage server {} discards share data, nothing it accepts is durable", server_id);
        }
        let (sender, command_receiver) = mpsc::channel(32);
        let server = StorageServer {
            server_id,
            store,
            settings,
            space,
            clock,
            command_receiver,
        };
        (server, StorageClient { sender })
    }

    /// Runs the event loop until `shutdown` fires or every handle is dropped.
    ///
    /// Dropping the shutdown sender without firing it does not stop the loop.
    pub async fn run(mut self, shutdown: oneshot::Receiver<()>) {
        info!("storage server {} running", self.server_id);
        let mut shutdown = shutdown.fuse();
        loop {
            futures::select! {
                command = self.command_receiver.next() => match command {
                    Some(c) => command_handler(&mut self, c),
                    // all handles dropped
                    None => break,
                },
                stop = shutdown => match stop {
                    Ok(()) => break,
                    Err(oneshot::Canceled) => debug!("shutdown handle dropped"),
                },
            }
        }
        info!("storage server {} stopped", self.server_id);
    }
}
