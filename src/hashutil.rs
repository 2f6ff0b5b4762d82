//! Tagged hashes and the encodings shared by every derivation in the grid.
//!
//! Every derived value is a double SHA-256 over a netstring-framed purpose tag
//! followed by its inputs. Distinct tags keep derivations for different
//! purposes from ever colliding, even when fed the same bytes.

use std::fmt;
use std::str::FromStr;

use data_encoding::BASE32_NOPAD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::constants::{HASH_SIZE, STORAGE_INDEX_SIZE};

const LEASE_SECRET_TAG: &[u8] = b"sharegrid_lease_secret_v1";
const CONVERGENCE_SECRET_TAG: &[u8] = b"sharegrid_convergence_secret_v1";
const CLIENT_RENEWAL_TAG: &[u8] = b"sharegrid_client_renewal_secret_v1";
const CLIENT_CANCEL_TAG: &[u8] = b"sharegrid_client_cancel_secret_v1";
const FILE_RENEWAL_TAG: &[u8] = b"sharegrid_file_renewal_secret_v1";
const FILE_CANCEL_TAG: &[u8] = b"sharegrid_file_cancel_secret_v1";
const BUCKET_RENEWAL_TAG: &[u8] = b"sharegrid_bucket_renewal_secret_v1";
const BUCKET_CANCEL_TAG: &[u8] = b"sharegrid_bucket_cancel_secret_v1";
const CONTENT_KEY_TAG: &[u8] = b"sharegrid_immutable_content_to_key_with_added_secret_v1+";
const STORAGE_INDEX_TAG: &[u8] = b"sharegrid_immutable_key_to_storage_index_v1";
const CRYPTTEXT_TAG: &[u8] = b"sharegrid_crypttext_v1";
const SSK_WRITEKEY_TAG: &[u8] = b"sharegrid_mutable_privkey_to_writekey_v1";
const SSK_READKEY_TAG: &[u8] = b"sharegrid_mutable_writekey_to_readkey_v1";
const SSK_STORAGE_INDEX_TAG: &[u8] = b"sharegrid_mutable_readkey_to_storage_index_v1";
const SSK_FINGERPRINT_TAG: &[u8] = b"sharegrid_mutable_pubkey_to_fingerprint_v1";
const SSK_WRITE_ENABLER_TAG: &[u8] = b"sharegrid_mutable_write_enabler_v1";
const SSK_SIGNATURE_TAG: &[u8] = b"sharegrid_mutable_signed_prefix_v1";

/// Encodes bytes as lowercase, unpadded RFC 4648 base32.
pub fn b2a(data: &[u8]) -> String {
    BASE32_NOPAD.encode(data).to_ascii_lowercase()
}

/// Decodes lowercase, unpadded RFC 4648 base32. Non-canonical trailing bits are rejected.
pub fn a2b(data: &str) -> Result<Vec<u8>, data_encoding::DecodeError> {
    BASE32_NOPAD.decode(data.to_ascii_uppercase().as_bytes())
}

pub fn netstring(data: &[u8]) -> Vec<u8> {
    let mut out = format!("{}:", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.push(b',');
    out
}

/// Streaming double SHA-256 keyed by a purpose tag.
pub struct TaggedHasher {
    inner: Sha256,
}

impl TaggedHasher {
    pub fn new(tag: &[u8]) -> Self {
        let mut inner = Sha256::new();
        inner.update(netstring(tag));
        TaggedHasher { inner }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finalize(self) -> [u8; HASH_SIZE] {
        let first = self.inner.finalize();
        Sha256::digest(first).into()
    }
}

pub fn tagged_hash(tag: &[u8], val: &[u8]) -> [u8; HASH_SIZE] {
    let mut hasher = TaggedHasher::new(tag);
    hasher.update(val);
    hasher.finalize()
}

pub fn tagged_pair_hash(tag: &[u8], a: &[u8], b: &[u8]) -> [u8; HASH_SIZE] {
    let mut hasher = TaggedHasher::new(tag);
    hasher.update(&netstring(a));
    hasher.update(&netstring(b));
    hasher.finalize()
}

/// Compares two byte strings in time independent of where they differ.
pub fn timing_safe_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Fixed-length address of one logical file's share set.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorageIndex([u8; STORAGE_INDEX_SIZE]);

impl StorageIndex {
    pub fn from_bytes(bytes: [u8; STORAGE_INDEX_SIZE]) -> Self {
        StorageIndex(bytes)
    }

    pub fn from_slice(data: &[u8]) -> Option<Self> {
        let bytes: [u8; STORAGE_INDEX_SIZE] = data.try_into().ok()?;
        Some(StorageIndex(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; STORAGE_INDEX_SIZE] {
        &self.0
    }

    fn truncate(hash: [u8; HASH_SIZE]) -> Self {
        let mut bytes = [0u8; STORAGE_INDEX_SIZE];
        bytes.copy_from_slice(&hash[..STORAGE_INDEX_SIZE]);
        StorageIndex(bytes)
    }
}

impl fmt::Display for StorageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&b2a(&self.0))
    }
}

impl fmt::Debug for StorageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorageIndex({})", self)
    }
}

impl FromStr for StorageIndex {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = a2b(s).map_err(|e| e.to_string())?;
        StorageIndex::from_slice(&bytes)
            .ok_or_else(|| format!("storage index must be {STORAGE_INDEX_SIZE} bytes"))
    }
}

impl Serialize for StorageIndex {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for StorageIndex {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

pub fn lease_secret_hash(root: &[u8]) -> [u8; HASH_SIZE] {
    tagged_hash(LEASE_SECRET_TAG, root)
}

pub fn convergence_secret_hash(root: &[u8]) -> [u8; HASH_SIZE] {
    tagged_hash(CONVERGENCE_SECRET_TAG, root)
}

pub fn client_renewal_secret_hash(lease_secret: &[u8]) -> [u8; HASH_SIZE] {
    tagged_hash(CLIENT_RENEWAL_TAG, lease_secret)
}

pub fn client_cancel_secret_hash(lease_secret: &[u8]) -> [u8; HASH_SIZE] {
    tagged_hash(CLIENT_CANCEL_TAG, lease_secret)
}

pub fn file_renewal_secret_hash(client_secret: &[u8], si: &StorageIndex) -> [u8; HASH_SIZE] {
    tagged_pair_hash(FILE_RENEWAL_TAG, client_secret, si.as_bytes())
}

pub fn file_cancel_secret_hash(client_secret: &[u8], si: &StorageIndex) -> [u8; HASH_SIZE] {
    tagged_pair_hash(FILE_CANCEL_TAG, client_secret, si.as_bytes())
}

pub fn bucket_renewal_secret_hash(file_secret: &[u8], server_id: &[u8]) -> [u8; HASH_SIZE] {
    tagged_pair_hash(BUCKET_RENEWAL_TAG, file_secret, server_id)
}

pub fn bucket_cancel_secret_hash(file_secret: &[u8], server_id: &[u8]) -> [u8; HASH_SIZE] {
    tagged_pair_hash(BUCKET_CANCEL_TAG, file_secret, server_id)
}

/// Derives the convergent encryption key for `plaintext`.
///
/// The encoding parameters are mixed in so that the same content uploaded with
/// different `k`/`n`/segment size lands on a different storage index instead of
/// colliding with incompatible shares.
pub fn content_hash_key(
    convergence: &[u8],
    needed: usize,
    total: usize,
    segment_size: usize,
    plaintext: &[u8],
) -> [u8; HASH_SIZE] {
    let params = format!("{needed},{total},{segment_size}");
    let mut tag = CONTENT_KEY_TAG.to_vec();
    tag.extend(netstring(convergence));
    tag.extend(netstring(params.as_bytes()));
    let mut hasher = TaggedHasher::new(&tag);
    hasher.update(plaintext);
    hasher.finalize()
}

pub fn storage_index_hash(key: &[u8]) -> StorageIndex {
    StorageIndex::truncate(tagged_hash(STORAGE_INDEX_TAG, key))
}

pub fn crypttext_hash(crypttext: &[u8]) -> [u8; HASH_SIZE] {
    tagged_hash(CRYPTTEXT_TAG, crypttext)
}

pub fn ssk_writekey_hash(privkey_der: &[u8]) -> [u8; HASH_SIZE] {
    tagged_hash(SSK_WRITEKEY_TAG, privkey_der)
}

pub fn ssk_readkey_hash(writekey: &[u8]) -> [u8; HASH_SIZE] {
    tagged_hash(SSK_READKEY_TAG, writekey)
}

pub fn ssk_storage_index_hash(readkey: &[u8]) -> StorageIndex {
    StorageIndex::truncate(tagged_hash(SSK_STORAGE_INDEX_TAG, readkey))
}

pub fn ssk_pubkey_fingerprint_hash(pubkey_der: &[u8]) -> [u8; HASH_SIZE] {
    tagged_hash(SSK_FINGERPRINT_TAG, pubkey_der)
}

pub fn ssk_write_enabler_hash(writekey: &[u8], server_id: &[u8]) -> [u8; HASH_SIZE] {
    tagged_pair_hash(SSK_WRITE_ENABLER_TAG, writekey, server_id)
}

pub fn ssk_signature_prefix_hash(prefix: &[u8]) -> [u8; HASH_SIZE] {
    tagged_hash(SSK_SIGNATURE_TAG, prefix)
}

/// Sort key of one server in the ring for one storage index.
pub fn permute_server_hash(si: &StorageIndex, permutation_seed: &[u8]) -> [u8; HASH_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(si.as_bytes());
    hasher.update(permutation_seed);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base32_is_lowercase_and_reversible() {
        assert_eq!(b2a(b"hello"), "nbswy3dp");
        assert_eq!(a2b("nbswy3dp").unwrap(), b"hello");
        assert!(a2b("not base32!").is_err());
    }

    #[test]
    fn test_netstring_framing() {
        assert_eq!(netstring(b"abc"), b"3:abc,".to_vec());
        assert_eq!(netstring(b""), b"0:,".to_vec());
    }

    #[test]
    fn test_tags_separate_purposes() {
        let root = [7u8; 32];
        assert_ne!(lease_secret_hash(&root), convergence_secret_hash(&root));
        assert_ne!(
            client_renewal_secret_hash(&root),
            client_cancel_secret_hash(&root)
        );
    }

    #[test]
    fn test_pair_hash_is_not_concatenation() {
        // netstring framing keeps ("ab", "c") and ("a", "bc") apart
        let tag = b"test";
        assert_ne!(
            tagged_pair_hash(tag, b"ab", b"c"),
            tagged_pair_hash(tag, b"a", b"bc")
        );
    }

    #[test]
    fn test_content_key_depends_on_parameters_and_convergence() {
        let data = b"some file contents";
        let base = content_hash_key(b"conv", 3, 10, 1024, data);
        assert_eq!(base, content_hash_key(b"conv", 3, 10, 1024, data));
        assert_ne!(base, content_hash_key(b"other", 3, 10, 1024, data));
        assert_ne!(base, content_hash_key(b"conv", 2, 10, 1024, data));
        assert_ne!(base, content_hash_key(b"conv", 3, 10, 1024, b"different"));
    }

    #[test]
    fn test_storage_index_display_parse() {
        let si = storage_index_hash(b"key");
        let parsed: StorageIndex = si.to_string().parse().unwrap();
        assert_eq!(parsed, si);
        assert!("aaaa".parse::<StorageIndex>().is_err());
    }

    #[test]
    fn test_timing_safe_eq() {
        assert!(timing_safe_eq(b"secret", b"secret"));
        assert!(!timing_safe_eq(b"secret", b"secreT"));
        assert!(!timing_safe_eq(b"secret", b"secret2"));
    }
}
