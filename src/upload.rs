//! Share placement.
//!
//! The uploader walks the permuted ring for a storage index, giving each
//! server in turn the lowest share number nobody holds yet. Servers that
//! already hold shares from an earlier upload of the same content get a lease
//! added instead and count towards the result as they are. When every share
//! is already held but too few servers hold them, empty servers get a copy of
//! the least replicated share. Once the walk is over, any shares still
//! unplaced are spread round-robin over the servers that accepted something.
//!
//! The upload only succeeds if at least `happy` distinct servers end up
//! holding a share. A server that refuses or fails is skipped, never fatal.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::capability::{Capability, ChkRead};
use crate::client::StorageClient;
use crate::codec::{Codec, LagrangeCodec};
use crate::constants::{
    DEFAULT_MAX_SEGMENT_SIZE, DEFAULT_SHARES_HAPPY, DEFAULT_SHARES_NEEDED, DEFAULT_SHARES_TOTAL,
    MAX_SEGMENT_SIZE, MAX_SHARES_TOTAL, UPLOAD_ATTEMPTS_PER_SERVER,
};
use crate::crypto::ContentKey;
use crate::error::{GridError, Result};
use crate::hashutil::{self, StorageIndex};
use crate::ring::{PeerRing, ServerId};
use crate::secret::{SecretHolder, WriteEnabler};

/// k-of-n encoding plus the `happy` placement threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodingParameters {
    pub needed: usize,
    pub happy: usize,
    pub total: usize,
    pub max_segment_size: usize,
}

impl Default for EncodingParameters {
    fn default() -> Self {
        EncodingParameters {
            needed: DEFAULT_SHARES_NEEDED,
            happy: DEFAULT_SHARES_HAPPY,
            total: DEFAULT_SHARES_TOTAL,
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
        }
    }
}

impl EncodingParameters {
    pub fn new(needed: usize, happy: usize, total: usize, max_segment_size: usize) -> Result<Self> {
        let params = EncodingParameters {
            needed,
            happy,
            total,
            max_segment_size,
        };
        params.validate()?;
        Ok(params)
    }

    /// Enforces `1 <= k <= happy <= n <= 255` and a segment size that fits a share header.
    pub fn validate(&self) -> Result<()> {
        if self.needed == 0 {
            return Err(GridError::configuration("client.shares_needed", "must be at least 1"));
        }
        if self.needed > self.happy {
            return Err(GridError::configuration(
                "client.shares_happy",
                format!("{} is less than shares_needed {}", self.happy, self.needed),
            ));
        }
        if self.happy > self.total {
            return Err(GridError::configuration(
                "client.shares_happy",
                format!("{} is more than shares_total {}", self.happy, self.total),
            ));
        }
        if self.total > MAX_SHARES_TOTAL {
            return Err(GridError::configuration(
                "client.shares_total",
                format!("at most {MAX_SHARES_TOTAL} shares are supported"),
            ));
        }
        if self.max_segment_size == 0 {
            return Err(GridError::configuration("client.max_segment_size", "must be positive"));
        }
        if self.max_segment_size > MAX_SEGMENT_SIZE {
            return Err(GridError::configuration(
                "client.max_segment_size",
                format!("at most {MAX_SEGMENT_SIZE} bytes"),
            ));
        }
        Ok(())
    }
}

/// Where the shares of one upload ended up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadResults {
    /// Share number to the servers holding it.
    pub sharemap: BTreeMap<u8, BTreeSet<ServerId>>,
    pub servers_with_shares: BTreeSet<ServerId>,
    /// Shares some server already held before this upload.
    pub preexisting_shares: usize,
    pub pushed_shares: usize,
}

impl UploadResults {
    fn record(&mut self, share_number: u8, server_id: &ServerId) {
        self.sharemap
            .entry(share_number)
            .or_default()
            .insert(server_id.clone());
        self.servers_with_shares.insert(server_id.clone());
    }

    fn is_placed(&self, share_number: u8) -> bool {
        self.sharemap.contains_key(&share_number)
    }

    /// The share held by the fewest servers, lowest number first.
    fn share_to_spread(&self) -> Option<u8> {
        self.sharemap
            .iter()
            .min_by_key(|(_, holders)| holders.len())
            .map(|(&share_number, _)| share_number)
    }
}

/// How shares are written to a server.
#[derive(Clone, Copy)]
enum WriteMode<'a> {
    Immutable,
    /// Mutable shares overwrite older versions, authorised by a per-server
    /// write enabler derived from the write key.
    Mutable { writekey: &'a [u8] },
}

/// Places encoded shares on the grid.
pub struct Uploader {
    ring: Arc<PeerRing>,
    secrets: Arc<SecretHolder>,
}

impl Uploader {
    pub fn new(ring: Arc<PeerRing>, secrets: Arc<SecretHolder>) -> Self {
        Uploader { ring, secrets }
    }

    pub fn ring(&self) -> &Arc<PeerRing> {
        &self.ring
    }

    pub fn secrets(&self) -> &Arc<SecretHolder> {
        &self.secrets
    }

    /// Encrypts, encodes and places an immutable file.
    ///
    /// The key is derived from the content and the convergence secret, so
    /// uploading the same bytes twice lands on the same storage index and the
    /// second upload only adds leases.
    ///
    /// # Returns
    ///
    /// The read capability, or `InsufficientRedundancy` when fewer than
    /// `happy` servers took a share.
    pub async fn upload(&self, content: &[u8], params: &EncodingParameters) -> Result<Capability> {
        params.validate()?;
        let key = ContentKey::from(hashutil::content_hash_key(
            self.secrets.convergence_secret().as_bytes(),
            params.needed,
            params.total,
            params.max_segment_size,
            content,
        ));
        let storage_index = hashutil::storage_index_hash(key.as_bytes());
        let crypttext = key.encrypt_convergent(content)?;
        let crypttext_hash = hashutil::crypttext_hash(&crypttext);

        let shares = LagrangeCodec::new(params.max_segment_size).encode(
            &crypttext,
            params.needed,
            params.total,
        )?;
        let results = self
            .place_shares(storage_index, &shares, params, WriteMode::Immutable)
            .await?;
        info!(
            "uploaded {} ({} bytes) to {} servers, {} shares already present",
            storage_index,
            content.len(),
            results.servers_with_shares.len(),
            results.preexisting_shares
        );

        Ok(Capability::ImmutableRead(ChkRead {
            key: *key.as_bytes(),
            crypttext_hash,
            needed: params.needed,
            total: params.total,
            size: content.len() as u64,
        }))
    }

    /// Publishes already-encoded mutable shares, overwriting older versions
    /// wherever they are held.
    pub async fn publish_mutable(
        &self,
        storage_index: StorageIndex,
        shares: &[Vec<u8>],
        writekey: &[u8],
        params: &EncodingParameters,
    ) -> Result<UploadResults> {
        self.place_shares(storage_index, shares, params, WriteMode::Mutable { writekey })
            .await
    }

    async fn write_share(
        &self,
        client: &StorageClient,
        server_id: &ServerId,
        storage_index: StorageIndex,
        share_number: u8,
        data: Vec<u8>,
        mode: WriteMode<'_>,
    ) -> Result<()> {
        let renew = self.secrets.bucket_renewal_secret(&storage_index, server_id);
        let cancel = self.secrets.bucket_cancel_secret(&storage_index, server_id);
        match mode {
            WriteMode::Immutable => {
                client
                    .store_share(storage_index, share_number, data, renew, cancel)
                    .await
            }
            WriteMode::Mutable { writekey } => {
                let enabler = WriteEnabler::derive(writekey, server_id);
                client
                    .store_mutable_share(storage_index, share_number, data, enabler, renew, cancel)
                    .await
            }
        }
    }

    /// Brings the shares a server already holds up to date: a fresh lease
    /// for immutable shares, the new version for mutable ones.
    async fn refresh_existing(
        &self,
        client: &StorageClient,
        server_id: &ServerId,
        storage_index: StorageIndex,
        existing: &BTreeSet<u8>,
        shares: &[Vec<u8>],
        mode: WriteMode<'_>,
    ) -> Result<()> {
        match mode {
            WriteMode::Immutable => {
                let renew = self.secrets.bucket_renewal_secret(&storage_index, server_id);
                let cancel = self.secrets.bucket_cancel_secret(&storage_index, server_id);
                client.add_lease(storage_index, renew, cancel).await?;
            }
            WriteMode::Mutable { .. } => {
                for &share_number in existing {
                    let data = shares[share_number as usize].clone();
                    self.write_share(client, server_id, storage_index, share_number, data, mode)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn place_shares(
        &self,
        storage_index: StorageIndex,
        shares: &[Vec<u8>],
        params: &EncodingParameters,
        mode: WriteMode<'_>,
    ) -> Result<UploadResults> {
        let total = shares.len();
        let candidates: Vec<(ServerId, StorageClient)> = self
            .ring
            .permuted_servers(&storage_index)
            .into_iter()
            .filter(|s| s.is_connected())
            .filter_map(|s| s.connection.map(|c| (s.server_id, c)))
            .collect();
        debug!(
            "placing {} shares of {} over {} connected servers",
            total,
            storage_index,
            candidates.len()
        );

        let mut results = UploadResults::default();
        let mut accepting: Vec<(ServerId, StorageClient)> = Vec::new();
        let mut attempts = 0;
        let max_attempts = total + UPLOAD_ATTEMPTS_PER_SERVER * candidates.len();

        for (server_id, client) in candidates {
            let existing: BTreeSet<u8> = match client.list_shares(storage_index).await {
                Ok(found) => found.into_iter().filter(|&s| (s as usize) < total).collect(),
                Err(e) if e.is_per_server() => {
                    warn!("skipping server {}: {}", server_id, e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            if !existing.is_empty() {
                match self
                    .refresh_existing(&client, &server_id, storage_index, &existing, shares, mode)
                    .await
                {
                    Ok(()) => {
                        for &share_number in &existing {
                            if !results.is_placed(share_number) {
                                results.preexisting_shares += 1;
                            }
                            results.record(share_number, &server_id);
                        }
                        accepting.push((server_id, client));
                    }
                    Err(e) if e.is_per_server() => {
                        warn!("server {} holds shares but refused them: {}", server_id, e);
                    }
                    Err(e) => return Err(e),
                }
                continue;
            }

            let unplaced = (0..total as u8).find(|&s| !results.is_placed(s));
            let next = match unplaced {
                Some(next) => next,
                None if results.servers_with_shares.len() < params.happy => {
                    match results.share_to_spread() {
                        Some(next) => next,
                        None => continue,
                    }
                }
                None => continue,
            };
            attempts += 1;
            match self
                .write_share(&client, &server_id, storage_index, next, shares[next as usize].clone(), mode)
                .await
            {
                Ok(()) => {
                    results.record(next, &server_id);
                    results.pushed_shares += 1;
                    accepting.push((server_id, client));
                }
                Err(e) if e.is_per_server() => warn!("server {} refused share {}: {}", server_id, next, e),
                Err(e) => return Err(e),
            }
        }

        // second pass: spread what is left over the servers that said yes
        let mut turn = 0;
        while !accepting.is_empty() && attempts < max_attempts {
            let Some(next) = (0..total as u8).find(|&s| !results.is_placed(s)) else {
                break;
            };
            turn %= accepting.len();
            let (server_id, client) = accepting[turn].clone();
            attempts += 1;
            match self
                .write_share(&client, &server_id, storage_index, next, shares[next as usize].clone(), mode)
                .await
            {
                Ok(()) => {
                    results.record(next, &server_id);
                    results.pushed_shares += 1;
                    turn += 1;
                }
                Err(e) if e.is_per_server() => {
                    warn!("server {} refused share {}: {}", server_id, next, e);
                    accepting.remove(turn);
                }
                Err(e) => return Err(e),
            }
        }

        let placed = results.sharemap.len();
        if results.servers_with_shares.len() < params.happy || placed < params.needed {
            return Err(GridError::InsufficientRedundancy {
                storage_index,
                happy: params.happy,
                servers_with_shares: results.servers_with_shares.len(),
                shares_placed: placed,
                total,
            });
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{HashMapShareStore, ShareStore};
    use crate::server::StorageSettings;
    use crate::testkit::{TestGrid, UndecodableStore};

    fn params(needed: usize, happy: usize, total: usize) -> EncodingParameters {
        EncodingParameters::new(needed, happy, total, 1024).unwrap()
    }

    #[test]
    fn test_parameter_validation() {
        assert!(EncodingParameters::default().validate().is_ok());
        assert!(EncodingParameters::new(0, 1, 1, 10).is_err());
        assert!(EncodingParameters::new(3, 2, 10, 10).is_err());
        assert!(EncodingParameters::new(3, 11, 10, 10).is_err());
        assert!(EncodingParameters::new(3, 7, 256, 10).is_err());
        assert!(EncodingParameters::new(3, 7, 10, 0).is_err());
        assert!(matches!(
            EncodingParameters::new(4, 3, 10, 10),
            Err(GridError::Configuration { .. })
        ));
        assert!(EncodingParameters::new(3, 7, 10, MAX_SEGMENT_SIZE).is_ok());
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_segment_size_must_fit_header() {
        match EncodingParameters::new(3, 7, 10, MAX_SEGMENT_SIZE + 1) {
            Err(GridError::Configuration { field, .. }) => assert_eq!(field, "client.max_segment_size"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_happy_threshold_not_met() {
        let grid = TestGrid::with_servers(2).await;
        let result = grid.uploader().upload(b"some content", &params(1, 3, 4)).await;
        match result {
            Err(GridError::InsufficientRedundancy {
                happy,
                servers_with_shares,
                ..
            }) => assert_eq!((happy, servers_with_shares), (3, 2)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_happy_threshold_met() {
        let grid = TestGrid::with_servers(3).await;
        let cap = grid
            .uploader()
            .upload(b"some content", &params(1, 3, 4))
            .await
            .unwrap();
        assert!(matches!(cap, Capability::ImmutableRead(_)));

        let si = cap.storage_index().unwrap();
        let mut total = 0;
        for client in grid.clients() {
            let held = client.list_shares(si).await.unwrap();
            assert!(!held.is_empty());
            total += held.len();
        }
        assert_eq!(total, 4);
    }

    fn readonly_first(readonly: usize, total: usize) -> Vec<StorageSettings> {
        (0..total)
            .map(|i| StorageSettings {
                readonly: i < readonly,
                ..StorageSettings::default()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_refusing_servers_are_skipped() {
        let grid = TestGrid::with_settings(readonly_first(2, 5)).await;
        let cap = grid
            .uploader()
            .upload(b"content", &params(2, 3, 5))
            .await
            .unwrap();
        let si = cap.storage_index().unwrap();
        let holding = futures::future::join_all(grid.clients().iter().map(|c| c.list_shares(si)))
            .await
            .into_iter()
            .filter(|r| r.as_ref().map_or(false, |s| !s.is_empty()))
            .count();
        assert_eq!(holding, 3);

        let grid = TestGrid::with_settings(readonly_first(3, 5)).await;
        assert!(matches!(
            grid.uploader().upload(b"content", &params(2, 3, 5)).await,
            Err(GridError::InsufficientRedundancy { .. })
        ));
    }

    #[tokio::test]
    async fn test_unreachable_servers_are_skipped() {
        let mut grid = TestGrid::with_servers(4).await;
        grid.stop_server(0).await;
        let cap = grid
            .uploader()
            .upload(b"still fine", &params(2, 3, 4))
            .await
            .unwrap();
        assert!(cap.storage_index().is_some());
    }

    #[tokio::test]
    async fn test_convergent_reupload_adds_leases() {
        let grid = TestGrid::with_servers(4).await;
        let uploader = grid.uploader();
        let first = uploader.upload(b"same bytes", &params(2, 3, 4)).await.unwrap();
        let second = uploader.upload(b"same bytes", &params(2, 3, 4)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.storage_index(), second.storage_index());

        // same client, so the lease is renewed rather than duplicated
        let mut leases = 0;
        for client in grid.clients() {
            leases += client.stats().await.unwrap().leases;
        }
        assert_eq!(leases, 4);

        // a different client converging on the same content adds its own lease
        let other = grid.uploader_with_convergence(grid.secrets.convergence_secret().clone());
        let third = other.upload(b"same bytes", &params(2, 3, 4)).await.unwrap();
        assert_eq!(third.storage_index(), first.storage_index());
        let mut leases = 0;
        for client in grid.clients() {
            leases += client.stats().await.unwrap().leases;
        }
        assert_eq!(leases, 8);
    }

    #[tokio::test]
    async fn test_different_convergence_secrets_do_not_converge() {
        let grid = TestGrid::with_servers(4).await;
        let a = grid.uploader().upload(b"data", &params(2, 3, 4)).await.unwrap();
        let b = grid
            .fresh_uploader()
            .upload(b"data", &params(2, 3, 4))
            .await
            .unwrap();
        assert_ne!(a.storage_index(), b.storage_index());
    }

    #[tokio::test]
    async fn test_full_holder_first_still_spreads() {
        let grid = TestGrid::with_servers(5).await;
        let uploader = grid.uploader();
        let content = b"held in one place";
        let key = hashutil::content_hash_key(
            grid.secrets.convergence_secret().as_bytes(),
            1,
            4,
            1024,
            content,
        );
        let si = hashutil::storage_index_hash(&key);
        let order = grid.ring.permuted_peer_list(&si);
        for server_id in &order[1..] {
            grid.ring.disconnect(server_id).unwrap();
        }
        uploader.upload(content, &params(1, 1, 4)).await.unwrap();
        let first = grid.client_for(&order[0]).unwrap();
        assert_eq!(first.list_shares(si).await.unwrap().len(), 4);

        for server_id in &order[1..] {
            grid.ring
                .connect(server_id, grid.client_for(server_id).unwrap())
                .unwrap();
        }
        let cap = uploader.upload(content, &params(1, 3, 4)).await.unwrap();
        assert_eq!(cap.storage_index(), Some(si));

        let mut holding = 0;
        for client in grid.clients() {
            if !client.list_shares(si).await.unwrap().is_empty() {
                holding += 1;
            }
        }
        assert!(holding >= 3);
    }

    #[tokio::test]
    async fn test_undecodable_server_is_skipped() {
        let stores: Vec<Arc<dyn ShareStore>> = vec![
            Arc::new(UndecodableStore),
            Arc::new(HashMapShareStore::new()),
            Arc::new(HashMapShareStore::new()),
            Arc::new(HashMapShareStore::new()),
        ];
        let grid = TestGrid::with_stores(stores).await;
        let cap = grid
            .uploader()
            .upload(b"one bad store", &params(2, 3, 4))
            .await
            .unwrap();
        assert!(cap.storage_index().is_some());
    }

    #[tokio::test]
    async fn test_extra_shares_go_round_robin() {
        let grid = TestGrid::with_servers(3).await;
        let cap = grid
            .uploader()
            .upload(b"round robin", &params(2, 3, 7))
            .await
            .unwrap();
        let si = cap.storage_index().unwrap();
        let mut counts = Vec::new();
        for client in grid.clients() {
            counts.push(client.list_shares(si).await.unwrap().len());
        }
        counts.sort();
        assert_eq!(counts, vec![2, 2, 3]);
    }
}
