use std::collections::{BTreeMap, BTreeSet};

use futures::channel::{mpsc, oneshot};
use futures::prelude::*;

use crate::command::Command;
use crate::error::{GridError, Result};
use crate::expiration::SweepReport;
use crate::hashutil::StorageIndex;
use crate::secret::{CancelSecret, RenewalSecret, WriteEnabler};
use crate::server::StorageStats;

/// Handle for issuing commands to a storage server.
///
/// Cloning is cheap and every clone talks to the same server. The server's
/// event loop applies commands one at a time, so each call is atomic with
/// respect to the shares and leases it touches.
///
/// # Fields
///
/// * `sender` - A channel sender used to send commands to the server's event loop.
///
/// # Examples
///
/// ```rust
/// use futures::channel::mpsc;
/// use sharegrid::client::StorageClient;
/// use sharegrid::command::Command;
///
/// let (sender, receiver) = mpsc::channel::<Command>(10);
/// let client = StorageClient { sender };
/// ```
#[derive(Clone, Debug)]
pub struct StorageClient {
    pub sender: mpsc::Sender<Command>,
}

impl StorageClient {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (sender, receiver) = oneshot::channel();
        self.sender
            .clone()
            .send(command(sender))
            .await
            .map_err(|_| GridError::ServerUnavailable)?;
        match receiver.await.map_err(|_| GridError::ServerUnavailable)? {
            Err(GridError::Serialization(e)) => Err(GridError::ServerFailure(e.to_string())),
            reply => reply,
        }
    }

    /// Stores one immutable share and attaches a lease to it in the same step.
    ///
    /// Immutable shares are write-once: if the server already holds this share
    /// number the bytes are left alone and only the lease is added or renewed.
    ///
    /// # Arguments
    ///
    /// * `storage_index` - The file the share belongs to.
    /// * `share_number` - Which share this is.
    /// * `data` - The share bytes.
    /// * `renew_secret` - Bucket renewal secret for this server.
    /// * `cancel_secret` - Bucket cancel secret for this server.
    ///
    /// # Returns
    ///
    /// `AdmissionRejected` if the server is read-only or short on space.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// client.store_share(si, 0, share, renew, cancel).await?;
    /// ```
    pub async fn store_share(
        &self,
        storage_index: StorageIndex,
        share_number: u8,
        data: Vec<u8>,
        renew_secret: RenewalSecret,
        cancel_secret: CancelSecret,
    ) -> Result<()> {
        self.request(|sender| Command::StoreShare {
            storage_index,
            share_number,
            data,
            renew_secret,
            cancel_secret,
            sender,
        })
        .await
    }

    /// Creates or overwrites one mutable share.
    ///
    /// The first write records `write_enabler`; later writes must present the
    /// same one or fail with `Authorization`.
    pub async fn store_mutable_share(
        &self,
        storage_index: StorageIndex,
        share_number: u8,
        data: Vec<u8>,
        write_enabler: WriteEnabler,
        renew_secret: RenewalSecret,
        cancel_secret: CancelSecret,
    ) -> Result<()> {
        self.request(|sender| Command::StoreMutableShare {
            storage_index,
            share_number,
            data,
            write_enabler,
            renew_secret,
            cancel_secret,
            sender,
        })
        .await
    }

    /// Share numbers the server holds for `storage_index`.
    pub async fn list_shares(&self, storage_index: StorageIndex) -> Result<BTreeSet<u8>> {
        self.request(|sender| Command::ListShares {
            storage_index,
            sender,
        })
        .await
    }

    pub async fn read_shares(&self, storage_index: StorageIndex) -> Result<BTreeMap<u8, Vec<u8>>> {
        self.request(|sender| Command::ReadShares {
            storage_index,
            sender,
        })
        .await
    }

    /// Adds a lease to every share held for `storage_index`, or renews the
    /// lease already recorded under `renew_secret`.
    ///
    /// # Returns
    ///
    /// The number of shares the lease now covers.
    pub async fn add_lease(
        &self,
        storage_index: StorageIndex,
        renew_secret: RenewalSecret,
        cancel_secret: CancelSecret,
    ) -> Result<usize> {
        self.request(|sender| Command::AddLease {
            storage_index,
            renew_secret,
            cancel_secret,
            sender,
        })
        .await
    }

    /// Extends the lease recorded under `renew_secret`.
    ///
    /// `new_expiration` is capped at the server's lease duration from now;
    /// `None` asks for exactly that. A renewal never shortens a lease.
    pub async fn renew_lease(
        &self,
        storage_index: StorageIndex,
        renew_secret: RenewalSecret,
        new_expiration: Option<u64>,
    ) -> Result<()> {
        self.request(|sender| Command::RenewLease {
            storage_index,
            renew_secret,
            new_expiration,
            sender,
        })
        .await
    }

    /// Revokes the lease recorded under `cancel_secret`. The share itself is
    /// left for the expiration sweep.
    pub async fn cancel_lease(&self, storage_index: StorageIndex, cancel_secret: CancelSecret) -> Result<()> {
        self.request(|sender| Command::CancelLease {
            storage_index,
            cancel_secret,
            sender,
        })
        .await
    }

    pub async fn run_expiration_sweep(&self) -> Result<SweepReport> {
        self.request(|sender| Command::RunSweep { sender }).await
    }

    /// Whether the server holds any share at all.
    pub async fn have_shares(&self) -> Result<bool> {
        self.request(|sender| Command::HaveShares { sender }).await
    }

    pub async fn stats(&self) -> Result<StorageStats> {
        self.request(|sender| Command::Stats { sender }).await
    }
}
