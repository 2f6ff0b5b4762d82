//! Handles for immutable and mutable files.
//!
//! Both kinds locate their shares the same way the uploader placed them: by
//! walking the permuted ring for the file's storage index.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::capability::{Capability, ChkRead, ChkVerify, SskRead, SskWrite};
use crate::client::StorageClient;
use crate::codec::{Codec, LagrangeCodec};
use crate::constants::HASH_SIZE;
use crate::crypto::ContentKey;
use crate::error::{GridError, Result};
use crate::hashutil::{self, StorageIndex};
use crate::keygen::{SigningKey, VerifyingKey};
use crate::ring::{PeerRing, ServerId};
use crate::secret::SecretHolder;
use crate::upload::{EncodingParameters, Uploader};

/// Connected servers in ring order for `storage_index`.
fn connected(ring: &PeerRing, storage_index: &StorageIndex) -> Vec<(ServerId, StorageClient)> {
    ring.permuted_servers(storage_index)
        .into_iter()
        .filter(|s| s.is_connected())
        .filter_map(|s| s.connection.map(|c| (s.server_id, c)))
        .collect()
}

/// Reads every share each connected server holds for `storage_index`, in
/// ring order. Stops early once `enough` distinct share numbers were seen.
///
/// Servers that fail are skipped.
async fn fetch_shares(
    ring: &PeerRing,
    storage_index: StorageIndex,
    enough: Option<usize>,
) -> Result<Vec<(ServerId, BTreeMap<u8, Vec<u8>>)>> {
    let mut found = Vec::new();
    let mut seen = BTreeSet::new();
    for (server_id, client) in connected(ring, &storage_index) {
        match client.read_shares(storage_index).await {
            Ok(shares) if shares.is_empty() => {}
            Ok(shares) => {
                seen.extend(shares.keys().copied());
                found.push((server_id, shares));
                if enough.map_or(false, |n| seen.len() >= n) {
                    break;
                }
            }
            Err(e) if e.is_per_server() => warn!("read from {} failed: {}", server_id, e),
            Err(e) => return Err(e),
        }
    }
    Ok(found)
}

/// Merges what several servers returned, keeping the first copy of each share.
fn merge_shares(found: Vec<(ServerId, BTreeMap<u8, Vec<u8>>)>) -> BTreeMap<u8, Vec<u8>> {
    let mut shares = BTreeMap::new();
    for (_, held) in found {
        for (share_number, data) in held {
            shares.entry(share_number).or_insert(data);
        }
    }
    shares
}

/// Decodes from `needed` shares at a time until the result matches
/// `crypttext_hash`.
///
/// Subsets are windows over the share numbers, each starting one share later,
/// so a read survives any single bad share when a spare exists.
fn decode_verified(
    shares: &BTreeMap<u8, Vec<u8>>,
    needed: usize,
    total: usize,
    crypttext_hash: &[u8; HASH_SIZE],
) -> Option<Vec<u8>> {
    let numbers: Vec<u8> = shares.keys().copied().collect();
    if needed == 0 || numbers.len() < needed {
        return None;
    }
    let windows = if numbers.len() == needed { 1 } else { numbers.len() };
    let codec = LagrangeCodec::default();
    for start in 0..windows {
        let subset: BTreeMap<u8, Vec<u8>> = (0..needed)
            .map(|i| numbers[(start + i) % numbers.len()])
            .filter_map(|n| shares.get(&n).map(|data| (n, data.clone())))
            .collect();
        match codec.decode(&subset, needed, total) {
            Ok(crypttext) if hashutil::timing_safe_eq(&hashutil::crypttext_hash(&crypttext), crypttext_hash) => {
                return Some(crypttext);
            }
            Ok(_) => debug!("shares {:?} fail the crypttext hash", subset.keys().collect::<Vec<_>>()),
            Err(e) => debug!("shares {:?} do not decode: {}", subset.keys().collect::<Vec<_>>(), e),
        }
    }
    None
}

/// Result of a share census.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckResults {
    pub storage_index: Option<StorageIndex>,
    pub shares_found: usize,
    pub servers_with_shares: usize,
    pub needed: usize,
    pub total: usize,
}

impl CheckResults {
    /// Enough distinct shares survive to rebuild the file.
    pub fn is_recoverable(&self) -> bool {
        self.shares_found >= self.needed
    }

    pub fn is_healthy(&self) -> bool {
        self.shares_found >= self.total
    }
}

async fn check_index(
    ring: &PeerRing,
    storage_index: StorageIndex,
    needed: usize,
    total: usize,
) -> Result<CheckResults> {
    let mut shares = BTreeSet::new();
    let mut servers = 0;
    for (server_id, client) in connected(ring, &storage_index) {
        match client.list_shares(storage_index).await {
            Ok(held) if !held.is_empty() => {
                servers += 1;
                shares.extend(held);
            }
            Ok(_) => {}
            Err(e) if e.is_per_server() => warn!("check of {} failed: {}", server_id, e),
            Err(e) => return Err(e),
        }
    }
    Ok(CheckResults {
        storage_index: Some(storage_index),
        shares_found: shares.len(),
        servers_with_shares: servers,
        needed,
        total,
    })
}

/// Adds or renews this client's lease on every server holding shares.
///
/// # Returns
///
/// How many servers now carry the lease.
async fn renew_leases(ring: &PeerRing, secrets: &SecretHolder, storage_index: StorageIndex) -> Result<usize> {
    let mut renewed = 0;
    for (server_id, client) in connected(ring, &storage_index) {
        let renew = secrets.bucket_renewal_secret(&storage_index, &server_id);
        let cancel = secrets.bucket_cancel_secret(&storage_index, &server_id);
        match client.add_lease(storage_index, renew, cancel).await {
            Ok(0) => {}
            Ok(_) => renewed += 1,
            Err(e) if e.is_per_server() => warn!("lease on {} not renewed: {}", server_id, e),
            Err(e) => return Err(e),
        }
    }
    debug!("renewed leases for {} on {} servers", storage_index, renewed);
    Ok(renewed)
}

/// Cancels this client's lease wherever it has one. The shares stay until an
/// expiration sweep finds them without any lease.
async fn cancel_leases(ring: &PeerRing, secrets: &SecretHolder, storage_index: StorageIndex) -> Result<usize> {
    let mut cancelled = 0;
    for (server_id, client) in connected(ring, &storage_index) {
        let cancel = secrets.bucket_cancel_secret(&storage_index, &server_id);
        match client.cancel_lease(storage_index, cancel).await {
            Ok(()) => cancelled += 1,
            // no lease of ours there
            Err(GridError::Authorization { .. }) => {}
            Err(e) if e.is_per_server() => warn!("lease on {} not cancelled: {}", server_id, e),
            Err(e) => return Err(e),
        }
    }
    Ok(cancelled)
}

/// Handle for an immutable file.
#[derive(Clone)]
pub struct ImmutableFileNode {
    cap: ChkRead,
    ring: Arc<PeerRing>,
    secrets: Arc<SecretHolder>,
}

impl ImmutableFileNode {
    pub fn new(cap: ChkRead, ring: Arc<PeerRing>, secrets: Arc<SecretHolder>) -> Self {
        ImmutableFileNode { cap, ring, secrets }
    }

    pub fn capability(&self) -> Capability {
        Capability::ImmutableRead(self.cap.clone())
    }

    pub fn storage_index(&self) -> StorageIndex {
        self.cap.storage_index()
    }

    pub fn size(&self) -> u64 {
        self.cap.size
    }

    /// The servers to ask for this file, in the order they are asked.
    pub fn permuted_peer_list(&self) -> Vec<ServerId> {
        self.ring.permuted_peer_list(&self.storage_index())
    }

    /// Downloads, verifies and decrypts the file.
    ///
    /// # Returns
    ///
    /// `NotEnoughShares` if fewer than `k` distinct shares are reachable,
    /// `Integrity` if the rebuilt ciphertext does not match the capability.
    pub async fn read(&self) -> Result<Vec<u8>> {
        let storage_index = self.storage_index();
        let (needed, total) = (self.cap.needed, self.cap.total);
        let shares = merge_shares(fetch_shares(&self.ring, storage_index, Some(needed)).await?);
        if shares.len() < needed {
            return Err(GridError::NotEnoughShares {
                storage_index,
                found: shares.len(),
                needed,
            });
        }

        let crypttext = match decode_verified(&shares, needed, total, &self.cap.crypttext_hash) {
            Some(crypttext) => crypttext,
            None => {
                warn!("first {} shares of {} are bad, fetching the rest", shares.len(), storage_index);
                let shares = merge_shares(fetch_shares(&self.ring, storage_index, None).await?);
                decode_verified(&shares, needed, total, &self.cap.crypttext_hash).ok_or_else(|| {
                    GridError::Integrity {
                        storage_index,
                        reason: format!("no {needed} of {} shares match the crypttext hash", shares.len()),
                    }
                })?
            }
        };
        let plaintext = ContentKey::from(self.cap.key).decrypt_convergent(&crypttext)?;
        if plaintext.len() as u64 != self.cap.size {
            return Err(GridError::Integrity {
                storage_index,
                reason: format!("expected {} bytes, got {}", self.cap.size, plaintext.len()),
            });
        }
        Ok(plaintext)
    }

    pub async fn check(&self) -> Result<CheckResults> {
        check_index(&self.ring, self.storage_index(), self.cap.needed, self.cap.total).await
    }

    pub async fn renew_leases(&self) -> Result<usize> {
        renew_leases(&self.ring, &self.secrets, self.storage_index()).await
    }

    pub async fn cancel_leases(&self) -> Result<usize> {
        cancel_leases(&self.ring, &self.secrets, self.storage_index()).await
    }
}

/// Verify-only handle for an immutable file: can count shares, cannot read.
#[derive(Clone)]
pub struct VerifierNode {
    cap: ChkVerify,
    ring: Arc<PeerRing>,
}

impl VerifierNode {
    pub fn new(cap: ChkVerify, ring: Arc<PeerRing>) -> Self {
        VerifierNode { cap, ring }
    }

    pub fn capability(&self) -> Capability {
        Capability::ImmutableVerify(self.cap.clone())
    }

    pub fn storage_index(&self) -> StorageIndex {
        self.cap.storage_index
    }

    pub fn permuted_peer_list(&self) -> Vec<ServerId> {
        self.ring.permuted_peer_list(&self.cap.storage_index)
    }

    pub async fn check(&self) -> Result<CheckResults> {
        check_index(&self.ring, self.cap.storage_index, self.cap.needed, self.cap.total).await
    }
}

/// One share of one version of a mutable file, as stored on a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MutableShare {
    seqnum: u64,
    needed: u8,
    total: u8,
    share_number: u8,
    /// Hash of the nonce-prefixed ciphertext.
    crypttext_hash: [u8; HASH_SIZE],
    signature: Vec<u8>,
    verification_key: Vec<u8>,
    /// Private key DER, encrypted under the write key.
    encrypted_private_key: Vec<u8>,
    block: Vec<u8>,
}

impl MutableShare {
    /// The bytes covered by the signature.
    fn signed_prefix(seqnum: u64, needed: u8, total: u8, crypttext_hash: &[u8; HASH_SIZE]) -> [u8; HASH_SIZE] {
        let mut prefix = Vec::with_capacity(8 + 2 + HASH_SIZE);
        prefix.extend_from_slice(&seqnum.to_be_bytes());
        prefix.push(needed);
        prefix.push(total);
        prefix.extend_from_slice(crypttext_hash);
        hashutil::ssk_signature_prefix_hash(&prefix)
    }

    /// Checks that the share was signed by the key the capability names.
    fn verify(&self, fingerprint: &[u8; HASH_SIZE]) -> Result<()> {
        let actual = hashutil::ssk_pubkey_fingerprint_hash(&self.verification_key);
        if !hashutil::timing_safe_eq(&actual, fingerprint) {
            return Err(GridError::Crypto("verification key does not match fingerprint".to_string()));
        }
        let prefix = Self::signed_prefix(self.seqnum, self.needed, self.total, &self.crypttext_hash);
        VerifyingKey::from_der(&self.verification_key)?.verify(&prefix, &self.signature)
    }
}

/// A version of a mutable file that can be rebuilt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub seqnum: u64,
    pub contents: Vec<u8>,
}

struct Survey {
    highest_seqnum: u64,
    /// (seqnum, crypttext hash) to its shares.
    versions: BTreeMap<(u64, [u8; HASH_SIZE]), BTreeMap<u8, MutableShare>>,
    any_share: Option<MutableShare>,
}

/// Handle for a mutable file.
///
/// Holding the write capability allows [`MutableFileNode::overwrite`]; a
/// read-only handle can only read.
#[derive(Clone)]
pub struct MutableFileNode {
    write: Option<SskWrite>,
    read: SskRead,
    ring: Arc<PeerRing>,
    uploader: Arc<Uploader>,
    params: EncodingParameters,
}

impl MutableFileNode {
    pub fn from_write_cap(
        cap: SskWrite,
        ring: Arc<PeerRing>,
        uploader: Arc<Uploader>,
        params: EncodingParameters,
    ) -> Self {
        MutableFileNode {
            read: cap.readonly(),
            write: Some(cap),
            ring,
            uploader,
            params,
        }
    }

    pub fn from_read_cap(
        cap: SskRead,
        ring: Arc<PeerRing>,
        uploader: Arc<Uploader>,
        params: EncodingParameters,
    ) -> Self {
        MutableFileNode {
            write: None,
            read: cap,
            ring,
            uploader,
            params,
        }
    }

    pub fn is_readonly(&self) -> bool {
        self.write.is_none()
    }

    pub fn write_cap(&self) -> Option<&SskWrite> {
        self.write.as_ref()
    }

    pub fn read_cap(&self) -> &SskRead {
        &self.read
    }

    pub fn capability(&self) -> Capability {
        match &self.write {
            Some(w) => Capability::MutableWrite(w.clone()),
            None => Capability::MutableRead(self.read.clone()),
        }
    }

    pub fn storage_index(&self) -> StorageIndex {
        self.read.storage_index()
    }

    pub fn permuted_peer_list(&self) -> Vec<ServerId> {
        self.ring.permuted_peer_list(&self.storage_index())
    }

    async fn survey(&self) -> Result<Survey> {
        let mut survey = Survey {
            highest_seqnum: 0,
            versions: BTreeMap::new(),
            any_share: None,
        };
        for (server_id, held) in fetch_shares(&self.ring, self.storage_index(), None).await? {
            for (share_number, data) in held {
                let share: MutableShare = match serde_json::from_slice(&data) {
                    Ok(share) => share,
                    Err(e) => {
                        warn!("unparseable mutable share {} on {}: {}", share_number, server_id, e);
                        continue;
                    }
                };
                if let Err(e) = share.verify(&self.read.fingerprint) {
                    warn!("bad signature on share {} from {}: {}", share_number, server_id, e);
                    continue;
                }
                survey.highest_seqnum = survey.highest_seqnum.max(share.seqnum);
                survey
                    .versions
                    .entry((share.seqnum, share.crypttext_hash))
                    .or_default()
                    .insert(share.share_number, share.clone());
                survey.any_share.get_or_insert(share);
            }
        }
        Ok(survey)
    }

    /// Reads the newest version that at least `k` shares agree on.
    pub async fn read_version(&self) -> Result<Version> {
        let storage_index = self.storage_index();
        let survey = self.survey().await?;
        let mut best_found = 0;
        // newest first
        for ((seqnum, crypttext_hash), shares) in survey.versions.iter().rev() {
            let Some(first) = shares.values().next() else {
                continue;
            };
            let needed = first.needed as usize;
            best_found = best_found.max(shares.len());
            if shares.len() < needed {
                debug!("version {} of {} has only {} shares", seqnum, storage_index, shares.len());
                continue;
            }
            let blocks: BTreeMap<u8, Vec<u8>> = shares
                .iter()
                .map(|(&n, share)| (n, share.block.clone()))
                .collect();
            let Some(crypttext) = decode_verified(&blocks, needed, first.total as usize, crypttext_hash) else {
                warn!("version {} of {} fails its crypttext hash", seqnum, storage_index);
                continue;
            };
            let contents = ContentKey::from(self.read.readkey).decrypt(&crypttext)?;
            return Ok(Version {
                seqnum: *seqnum,
                contents,
            });
        }
        Err(GridError::NotEnoughShares {
            storage_index,
            found: best_found,
            needed: self.params.needed,
        })
    }

    pub async fn read(&self) -> Result<Vec<u8>> {
        Ok(self.read_version().await?.contents)
    }

    /// Publishes `contents` as the next version.
    ///
    /// # Returns
    ///
    /// The new sequence number, or `NotWriteable` on a read-only handle.
    pub async fn overwrite(&self, contents: &[u8]) -> Result<u64> {
        let write = self.write.as_ref().ok_or(GridError::NotWriteable)?;
        let survey = self.survey().await?;
        let share = survey.any_share.ok_or_else(|| GridError::NotEnoughShares {
            storage_index: self.storage_index(),
            found: 0,
            needed: self.params.needed,
        })?;
        let signing_key = self.recover_signing_key(write, &share)?;
        let seqnum = survey.highest_seqnum + 1;
        self.publish(&signing_key, seqnum, contents).await?;
        Ok(seqnum)
    }

    fn recover_signing_key(&self, write: &SskWrite, share: &MutableShare) -> Result<SigningKey> {
        let der = ContentKey::from(write.writekey).decrypt(&share.encrypted_private_key)?;
        if !hashutil::timing_safe_eq(&hashutil::ssk_writekey_hash(&der), &write.writekey) {
            return Err(GridError::Integrity {
                storage_index: self.storage_index(),
                reason: "private key does not match write key".to_string(),
            });
        }
        SigningKey::from_der(&der)
    }

    /// Encrypts, encodes, signs and places one version.
    pub(crate) async fn publish(&self, signing_key: &SigningKey, seqnum: u64, contents: &[u8]) -> Result<()> {
        let write = self.write.as_ref().ok_or(GridError::NotWriteable)?;
        let params = &self.params;
        let storage_index = self.storage_index();

        let crypttext = ContentKey::from(self.read.readkey).encrypt(contents)?;
        let crypttext_hash = hashutil::crypttext_hash(&crypttext);
        let blocks = LagrangeCodec::new(params.max_segment_size).encode(&crypttext, params.needed, params.total)?;

        let (needed, total) = (params.needed as u8, params.total as u8);
        let signature = signing_key.sign(&MutableShare::signed_prefix(seqnum, needed, total, &crypttext_hash))?;
        let verification_key = signing_key.verifying_key().to_der()?;
        let encrypted_private_key = ContentKey::from(write.writekey).encrypt(&signing_key.to_der()?)?;

        let shares = blocks
            .into_iter()
            .enumerate()
            .map(|(share_number, block)| {
                let share = MutableShare {
                    seqnum,
                    needed,
                    total,
                    share_number: share_number as u8,
                    crypttext_hash,
                    signature: signature.clone(),
                    verification_key: verification_key.clone(),
                    encrypted_private_key: encrypted_private_key.clone(),
                    block,
                };
                serde_json::to_vec(&share).map_err(GridError::from)
            })
            .collect::<Result<Vec<_>>>()?;

        let results = self
            .uploader
            .publish_mutable(storage_index, &shares, &write.writekey, params)
            .await?;
        info!(
            "published version {} of {} to {} servers",
            seqnum,
            storage_index,
            results.servers_with_shares.len()
        );
        Ok(())
    }

    pub async fn check(&self) -> Result<CheckResults> {
        check_index(&self.ring, self.storage_index(), self.params.needed, self.params.total).await
    }

    pub async fn renew_leases(&self) -> Result<usize> {
        renew_leases(&self.ring, self.uploader.secrets(), self.storage_index()).await
    }

    pub async fn cancel_leases(&self) -> Result<usize> {
        cancel_leases(&self.ring, self.uploader.secrets(), self.storage_index()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expiration::ExpirationPolicy;
    use crate::repository::ShareStore;
    use crate::server::StorageSettings;
    use crate::testkit::TestGrid;

    fn params(needed: usize, happy: usize, total: usize) -> EncodingParameters {
        EncodingParameters::new(needed, happy, total, 64).unwrap()
    }

    async fn upload(grid: &TestGrid, content: &[u8]) -> ImmutableFileNode {
        let cap = grid.uploader().upload(content, &params(2, 3, 5)).await.unwrap();
        match cap {
            Capability::ImmutableRead(cap) => ImmutableFileNode::new(cap, grid.ring.clone(), grid.secrets.clone()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_immutable_round_trip() {
        let grid = TestGrid::with_servers(5).await;
        let content: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let node = upload(&grid, &content).await;
        assert_eq!(node.size(), 1000);
        assert_eq!(node.read().await.unwrap(), content);

        let check = node.check().await.unwrap();
        assert_eq!(check.shares_found, 5);
        assert!(check.is_healthy());
    }

    #[tokio::test]
    async fn test_immutable_read_survives_lost_servers() {
        let mut grid = TestGrid::with_servers(5).await;
        let node = upload(&grid, b"survivor").await;
        grid.stop_server(0).await;
        grid.stop_server(1).await;
        grid.stop_server(2).await;
        assert_eq!(node.read().await.unwrap(), b"survivor");

        grid.stop_server(3).await;
        assert!(matches!(
            node.read().await,
            Err(GridError::NotEnoughShares { found: 1, needed: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_immutable_wrong_hash_is_integrity_error() {
        let grid = TestGrid::with_servers(5).await;
        let node = upload(&grid, b"genuine").await;
        let mut cap = node.cap.clone();
        cap.crypttext_hash[0] ^= 1;
        let forged = ImmutableFileNode::new(cap, grid.ring.clone(), grid.secrets.clone());
        assert!(matches!(forged.read().await, Err(GridError::Integrity { .. })));
    }

    fn corrupt_share(grid: &TestGrid, storage_index: &StorageIndex, share_number: u8) {
        for server_id in grid.server_ids() {
            let store = grid.store_for(&server_id).unwrap();
            if let Some(mut data) = store.read_data(storage_index, share_number).unwrap() {
                // first byte after the 12 byte codec header
                data[12] ^= 0xff;
                store.write_data(storage_index, share_number, &data).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_immutable_read_skips_corrupt_shares() {
        let grid = TestGrid::with_servers(5).await;
        let content: Vec<u8> = (0..200u32).map(|i| (i * 7) as u8).collect();
        let node = upload(&grid, &content).await;
        let si = node.storage_index();

        for share_number in 0..3 {
            corrupt_share(&grid, &si, share_number);
        }
        assert_eq!(node.read().await.unwrap(), content);

        corrupt_share(&grid, &si, 3);
        assert!(matches!(node.read().await, Err(GridError::Integrity { .. })));
    }

    #[tokio::test]
    async fn test_leases_keep_shares_through_sweeps() {
        const HOUR: u64 = 60 * 60;
        let settings = StorageSettings {
            lease_duration: 24 * HOUR,
            expiration: ExpirationPolicy {
                enabled: true,
                ..ExpirationPolicy::default()
            },
            ..StorageSettings::default()
        };
        let grid = TestGrid::with_settings(vec![settings; 5]).await;
        let node = upload(&grid, b"kept alive").await;
        let sweep = |grid: &TestGrid| {
            let clients = grid.clients();
            async move {
                let mut removed = 0;
                for client in clients {
                    removed += client.run_expiration_sweep().await.unwrap().shares_removed;
                }
                removed
            }
        };

        grid.clock.advance(20 * HOUR);
        assert_eq!(node.renew_leases().await.unwrap(), 5);
        grid.clock.advance(10 * HOUR);
        assert_eq!(sweep(&grid).await, 0);
        assert_eq!(node.read().await.unwrap(), b"kept alive");

        assert_eq!(node.cancel_leases().await.unwrap(), 5);
        assert_eq!(sweep(&grid).await, 5);
        assert!(matches!(
            node.read().await,
            Err(GridError::NotEnoughShares { found: 0, .. })
        ));
        assert!(!node.check().await.unwrap().is_recoverable());
    }

    #[tokio::test]
    async fn test_verifier_counts_shares() {
        let grid = TestGrid::with_servers(5).await;
        let node = upload(&grid, b"count me").await;
        let verifier = VerifierNode::new(node.cap.verifier(), grid.ring.clone());
        let check = verifier.check().await.unwrap();
        assert_eq!(check.servers_with_shares, 5);
        assert!(check.is_recoverable());
        assert_eq!(verifier.storage_index(), node.storage_index());
    }

    #[tokio::test]
    async fn test_lease_renew_and_cancel() {
        let grid = TestGrid::with_servers(5).await;
        let node = upload(&grid, b"leased").await;
        assert_eq!(node.renew_leases().await.unwrap(), 5);
        assert_eq!(node.cancel_leases().await.unwrap(), 5);
        // nothing left to cancel
        assert_eq!(node.cancel_leases().await.unwrap(), 0);
        // shares are still there until a sweep
        assert_eq!(node.read().await.unwrap(), b"leased");
    }

    #[tokio::test]
    async fn test_mutable_share_rejects_foreign_fingerprint() {
        let grid = TestGrid::with_servers(1).await;
        let (verifying, signing) = grid.keygen.generate(None).await.unwrap();
        let crypttext_hash = [7u8; HASH_SIZE];
        let share = MutableShare {
            seqnum: 1,
            needed: 1,
            total: 1,
            share_number: 0,
            crypttext_hash,
            signature: signing
                .sign(&MutableShare::signed_prefix(1, 1, 1, &crypttext_hash))
                .unwrap(),
            verification_key: verifying.to_der().unwrap(),
            encrypted_private_key: Vec::new(),
            block: Vec::new(),
        };
        let fingerprint = hashutil::ssk_pubkey_fingerprint_hash(&share.verification_key);
        share.verify(&fingerprint).unwrap();
        assert!(share.verify(&[0u8; HASH_SIZE]).is_err());

        let mut tampered = share.clone();
        tampered.seqnum = 2;
        assert!(tampered.verify(&fingerprint).is_err());
    }
}
