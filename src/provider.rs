use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::{self, Interval};
use tracing::{debug, error, info, warn};

use crate::client::StorageClient;
use crate::error::{AdmissionReason, GridError, Result};
use crate::expiration::{self, SweepReport};
use crate::hashutil::StorageIndex;
use crate::lease::LeaseInfo;
use crate::repository::{HashMapShareStore, ShareRecord, ShareStore, ShareType, SledShareStore};
use crate::secret::{CancelSecret, RenewalSecret, WriteEnabler};
use crate::server::{StorageServer, StorageStats};

/// Measures how many bytes may still be written.
pub trait SpaceProbe: Send + Sync + fmt::Debug {
    /// `None` means the probe cannot tell, and admission ignores the reservation.
    fn available(&self) -> Result<Option<u64>>;
}

/// Free space of the filesystem holding `path`, via `fs2`.
#[derive(Debug)]
pub struct DiskSpace {
    path: PathBuf,
}

impl DiskSpace {
    pub fn new(path: &Path) -> Self {
        DiskSpace {
            path: path.to_path_buf(),
        }
    }
}

impl SpaceProbe for DiskSpace {
    fn available(&self) -> Result<Option<u64>> {
        Ok(Some(fs2::available_space(&self.path)?))
    }
}

#[derive(Debug, Default)]
pub struct Unlimited;

impl SpaceProbe for Unlimited {
    fn available(&self) -> Result<Option<u64>> {
        Ok(None)
    }
}

/// A fixed amount of space that can be changed at runtime.
#[derive(Debug, Default)]
pub struct FixedSpace(AtomicU64);

impl FixedSpace {
    pub fn new(bytes: u64) -> Self {
        FixedSpace(AtomicU64::new(bytes))
    }

    pub fn set(&self, bytes: u64) {
        self.0.store(bytes, Ordering::SeqCst);
    }
}

impl SpaceProbe for FixedSpace {
    fn available(&self) -> Result<Option<u64>> {
        Ok(Some(self.0.load(Ordering::SeqCst)))
    }
}

impl<T: SpaceProbe + ?Sized> SpaceProbe for std::sync::Arc<T> {
    fn available(&self) -> Result<Option<u64>> {
        (**self).available()
    }
}

/// Checks that a write of `requested` new bytes may go ahead.
///
/// # Returns
///
/// `AdmissionRejected` when the server is read-only, or when the write would
/// eat into the reserved space.
fn admit(server: &StorageServer, requested: u64) -> Result<()> {
    if server.settings.readonly {
        warn!("refusing write to read-only server {}", server.server_id);
        return Err(GridError::AdmissionRejected {
            reason: AdmissionReason::ReadOnly,
        });
    }
    if let Some(available) = server.space.available()? {
        let reserved = server.settings.reserved_space;
        if available.saturating_sub(reserved) < requested {
            let reason = AdmissionReason::InsufficientSpace {
                available,
                reserved,
                requested,
            };
            warn!("refusing write to {}: {}", server.server_id, reason);
            return Err(GridError::AdmissionRejected { reason });
        }
    }
    Ok(())
}

fn stored_size(server: &StorageServer, data: &[u8]) -> u64 {
    if server.settings.discards_storage() {
        0
    } else {
        data.len() as u64
    }
}

/// Writes the share bytes, then the record that points at them.
fn persist(server: &StorageServer, record: &ShareRecord, data: &[u8]) -> Result<()> {
    if !server.settings.discards_storage() {
        server
            .store
            .write_data(&record.storage_index, record.share_number, data)?;
    }
    server.store.insert(record)
}

/// Adds a lease under `renew_secret`, or renews it if the share already has one.
fn attach_lease(
    record: &mut ShareRecord,
    renew_secret: &RenewalSecret,
    cancel_secret: &CancelSecret,
    now: u64,
    duration: u64,
) {
    match record
        .leases
        .iter_mut()
        .find(|lease| &lease.renew_secret == renew_secret)
    {
        Some(lease) => lease.renew(now, now.saturating_add(duration)),
        None => record.leases.push(LeaseInfo::new(
            renew_secret.clone(),
            cancel_secret.clone(),
            now,
            duration,
        )),
    }
}

/// Stores an immutable share together with its first lease.
///
/// Immutable shares are write-once. A second store of the same share number
/// leaves the bytes alone and only adds or renews the lease, so a client that
/// re-uploads identical content still ends up protecting it.
///
/// # Arguments
/// * `server` - The server applying the command.
/// * `storage_index` - The file the share belongs to.
/// * `share_number` - Which share this is.
/// * `data` - Share bytes.
/// * `renew_secret` - Secret that will renew the lease.
/// * `cancel_secret` - Secret that will cancel the lease.
///
/// # Returns
/// `AdmissionRejected` when a new share does not fit.
pub fn execute_store_share(
    server: &mut StorageServer,
    storage_index: StorageIndex,
    share_number: u8,
    data: Vec<u8>,
    renew_secret: RenewalSecret,
    cancel_secret: CancelSecret,
) -> Result<()> {
    let now = server.clock.now();
    let duration = server.settings.lease_duration;

    if let Some(mut existing) = server.store.get(&storage_index, share_number)? {
        debug!("share {} of {} already stored", share_number, storage_index);
        attach_lease(&mut existing, &renew_secret, &cancel_secret, now, duration);
        return server.store.insert(&existing);
    }

    let lease = LeaseInfo::new(renew_secret, cancel_secret, now, duration);
    let record = ShareRecord::new(
        storage_index,
        share_number,
        ShareType::Immutable,
        stored_size(server, &data),
        lease,
    );
    admit(server, record.footprint()?)?;
    persist(server, &record, &data)?;
    debug!("stored share {} of {}", share_number, storage_index);
    Ok(())
}

/// Creates or overwrites a mutable share.
///
/// The first write records the write enabler. Any later write must present
/// the same enabler, otherwise it fails with `Authorization` and the share is
/// untouched.
pub fn execute_store_mutable_share(
    server: &mut StorageServer,
    storage_index: StorageIndex,
    share_number: u8,
    data: Vec<u8>,
    write_enabler: WriteEnabler,
    renew_secret: RenewalSecret,
    cancel_secret: CancelSecret,
) -> Result<()> {
    let now = server.clock.now();
    let duration = server.settings.lease_duration;

    let record = match server.store.get(&storage_index, share_number)? {
        Some(mut existing) => {
            if existing.write_enabler.as_ref() != Some(&write_enabler) {
                warn!("bad write enabler for mutable share {} of {}", share_number, storage_index);
                return Err(GridError::Authorization { storage_index });
            }
            let before = existing.footprint()?;
            existing.size = stored_size(server, &data);
            attach_lease(&mut existing, &renew_secret, &cancel_secret, now, duration);
            admit(server, existing.footprint()?.saturating_sub(before))?;
            existing
        }
        None => {
            let lease = LeaseInfo::new(renew_secret, cancel_secret, now, duration);
            let mut record = ShareRecord::new(
                storage_index,
                share_number,
                ShareType::Mutable,
                stored_size(server, &data),
                lease,
            );
            record.write_enabler = Some(write_enabler);
            admit(server, record.footprint()?)?;
            record
        }
    };
    persist(server, &record, &data)?;
    debug!("wrote mutable share {} of {}", share_number, storage_index);
    Ok(())
}

pub fn execute_list_shares(server: &StorageServer, storage_index: &StorageIndex) -> Result<BTreeSet<u8>> {
    Ok(server
        .store
        .get_for_index(storage_index)?
        .into_iter()
        .map(|r| r.share_number)
        .collect())
}

pub fn execute_read_shares(
    server: &StorageServer,
    storage_index: &StorageIndex,
) -> Result<BTreeMap<u8, Vec<u8>>> {
    let mut shares = BTreeMap::new();
    for record in server.store.get_for_index(storage_index)? {
        let data = server
            .store
            .read_data(storage_index, record.share_number)?
            .unwrap_or_default();
        shares.insert(record.share_number, data);
    }
    Ok(shares)
}

/// Adds (or renews) a lease on every share held for `storage_index`.
///
/// # Returns
/// How many shares the lease covers; zero if the server holds none.
pub fn execute_add_lease(
    server: &mut StorageServer,
    storage_index: &StorageIndex,
    renew_secret: RenewalSecret,
    cancel_secret: CancelSecret,
) -> Result<usize> {
    let now = server.clock.now();
    let duration = server.settings.lease_duration;
    let records = server.store.get_for_index(storage_index)?;
    for mut record in records.iter().cloned() {
        attach_lease(&mut record, &renew_secret, &cancel_secret, now, duration);
        server.store.insert(&record)?;
    }
    Ok(records.len())
}

/// Extends every lease recorded under `renew_secret` for `storage_index`.
///
/// The new expiration is the requested one capped at the lease duration from
/// now. A lease never moves to an earlier expiration.
///
/// # Returns
/// `Authorization` if no lease on the index matches the secret.
pub fn execute_renew_lease(
    server: &mut StorageServer,
    storage_index: &StorageIndex,
    renew_secret: &RenewalSecret,
    new_expiration: Option<u64>,
) -> Result<()> {
    let now = server.clock.now();
    let limit = now.saturating_add(server.settings.lease_duration);
    let expiration = new_expiration.map_or(limit, |requested| requested.min(limit));

    let mut matched = false;
    for mut record in server.store.get_for_index(storage_index)? {
        let mut touched = false;
        for lease in record
            .leases
            .iter_mut()
            .filter(|lease| &lease.renew_secret == renew_secret)
        {
            lease.renew(now, expiration);
            touched = true;
        }
        if touched {
            server.store.insert(&record)?;
            matched = true;
        }
    }

    if !matched {
        warn!("renewal of {} refused: no matching lease", storage_index);
        return Err(GridError::Authorization {
            storage_index: *storage_index,
        });
    }
    Ok(())
}

/// Removes every lease recorded under `cancel_secret` for `storage_index`.
///
/// Shares are not deleted here even when their last lease goes; the
/// expiration sweep reclaims them under the configured policy.
///
/// # Returns
/// `Authorization` if no lease on the index matches the secret.
pub fn execute_cancel_lease(
    server: &mut StorageServer,
    storage_index: &StorageIndex,
    cancel_secret: &CancelSecret,
) -> Result<()> {
    let mut matched = false;
    for mut record in server.store.get_for_index(storage_index)? {
        let before = record.leases.len();
        record
            .leases
            .retain(|lease| &lease.cancel_secret != cancel_secret);
        if record.leases.len() != before {
            server.store.insert(&record)?;
            matched = true;
        }
    }

    if !matched {
        warn!("cancellation on {} refused: no matching lease", storage_index);
        return Err(GridError::Authorization {
            storage_index: *storage_index,
        });
    }
    debug!("cancelled lease on {}", storage_index);
    Ok(())
}

pub fn execute_sweep(server: &mut StorageServer) -> Result<SweepReport> {
    let now = server.clock.now();
    expiration::sweep(server.store.as_ref(), &server.settings.expiration, now)
}

pub fn execute_have_shares(server: &StorageServer) -> Result<bool> {
    Ok(!server.store.is_empty()?)
}

pub fn execute_stats(server: &StorageServer) -> Result<StorageStats> {
    let records = server.store.get_all()?;
    let storage_indexes: BTreeSet<StorageIndex> = records.iter().map(|r| r.storage_index).collect();
    Ok(StorageStats {
        shares: records.len(),
        storage_indexes: storage_indexes.len(),
        leases: records.iter().map(|r| r.leases.len()).sum(),
        bytes_stored: records.iter().map(|r| r.size).sum(),
        available_space: server.space.available()?,
        reserved_space: server.settings.reserved_space,
        readonly: server.settings.readonly,
    })
}

/// Creates the share store for a server.
///
/// If a path is provided a sled database is opened there; otherwise shares
/// are kept in memory and lost on exit.
///
/// # Arguments
/// * `db_path` - Optional directory for the sled database.
pub fn dao(db_path: Option<&Path>) -> Result<Box<dyn ShareStore>> {
    let store: Box<dyn ShareStore> = match db_path {
        Some(path) => {
            debug!("Using Sled DB at {:?}", path);
            Box::new(SledShareStore::new(path)?)
        }
        None => {
            debug!("Using HashMap DB");
            Box::new(HashMapShareStore::new())
        }
    };
    Ok(store)
}

/// Periodically asks the server to run an expiration sweep.
///
/// Sweeps go through the server's command channel like any other request,
/// so they never interleave with a store or lease operation. Returns once
/// the server is gone.
///
/// # Arguments
/// * `interval` - Time between sweeps.
/// * `client` - Handle to the server to sweep.
pub async fn sweep_loop(interval: &mut Interval, client: StorageClient) {
    loop {
        interval.tick().await;
        debug!("Starting expiration sweep.");
        match client.run_expiration_sweep().await {
            Ok(report) => info!("periodic sweep: {}", report),
            Err(GridError::ServerUnavailable) => {
                debug!("storage server gone, stopping sweeps");
                return;
            }
            Err(e) => error!("expiration sweep failed: {}", e),
        }
    }
}

/// Builds the interval for [`sweep_loop`]. The first tick is one full
/// period away rather than immediate.
pub fn sweep_interval(seconds: u64) -> Interval {
    let period = Duration::from_secs(seconds.max(1));
    time::interval_at(time::Instant::now() + period, period)
}
