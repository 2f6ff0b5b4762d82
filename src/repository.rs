use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use crate::error::Result;
use crate::hashutil::StorageIndex;
use crate::lease::LeaseInfo;
use crate::secret::WriteEnabler;

const LEASE_TREE: &str = "leases";
const DATA_TREE: &str = "shares";

/// Whether a share belongs to an immutable or a mutable file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShareType {
    Immutable,
    Mutable,
}

/// Represents one stored share and the leases protecting it.
///
/// The share bytes live apart from the record, so sweeps and statistics
/// never have to load them.
///
/// # Fields
///
/// * `storage_index` - The file this share belongs to.
/// * `share_number` - Which of the file's `n` shares this is.
/// * `share_type` - Immutable or mutable.
/// * `size` - Length of the stored share bytes. Zero when the server discards storage.
/// * `leases` - Every client lease on the share. The share may only be reclaimed once this is empty.
/// * `write_enabler` - For mutable shares, the secret later writes must present.
///
/// # Examples
///
/// ```ignore
/// let record = ShareRecord::new(si, 0, ShareType::Immutable, 3, lease);
/// assert_eq!(record.key(), format!("{}/000", si));
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ShareRecord {
    pub storage_index: StorageIndex,
    pub share_number: u8,
    pub share_type: ShareType,
    pub size: u64,
    pub leases: Vec<LeaseInfo>,
    pub write_enabler: Option<WriteEnabler>,
}

impl ShareRecord {
    pub fn new(
        storage_index: StorageIndex,
        share_number: u8,
        share_type: ShareType,
        size: u64,
        lease: LeaseInfo,
    ) -> Self {
        ShareRecord {
            storage_index,
            share_number,
            share_type,
            size,
            leases: vec![lease],
            write_enabler: None,
        }
    }

    pub fn key(&self) -> String {
        share_key(&self.storage_index, self.share_number)
    }

    /// Bytes this share occupies on disk: the share itself plus its encoded record.
    pub fn footprint(&self) -> Result<u64> {
        Ok(self.size + serde_json::to_vec(self)?.len() as u64)
    }
}

pub fn share_key(storage_index: &StorageIndex, share_number: u8) -> String {
    format!("{}/{:03}", storage_index_prefix(storage_index), share_number)
}

fn storage_index_prefix(storage_index: &StorageIndex) -> String {
    storage_index.to_string()
}

/// Defines the storage trait for shares and their `ShareRecord`s.
///
/// Records and share bytes are written and read separately. Only the storage
/// server's event loop holds a store, so implementations need not coordinate
/// concurrent writers themselves.
pub trait ShareStore: Send + Sync {
    /// Inserts or replaces a `ShareRecord`.
    ///
    /// # Arguments
    ///
    /// * `record` - The record to store. Its key is derived from its storage index and share number.
    ///
    /// # Returns
    ///
    /// A `Result` indicating the success or failure of the operation.
    fn insert(&self, record: &ShareRecord) -> Result<()>;

    /// Retrieves a single record.
    ///
    /// # Returns
    ///
    /// `None` if the share does not exist.
    fn get(&self, storage_index: &StorageIndex, share_number: u8) -> Result<Option<ShareRecord>>;

    /// Retrieves every record held for a storage index, ordered by share number.
    fn get_for_index(&self, storage_index: &StorageIndex) -> Result<Vec<ShareRecord>>;

    /// Every record in the store. Share bytes are not loaded.
    fn get_all(&self) -> Result<Vec<ShareRecord>>;

    /// Stores the bytes of one share, replacing earlier bytes.
    fn write_data(&self, storage_index: &StorageIndex, share_number: u8, data: &[u8]) -> Result<()>;

    fn read_data(&self, storage_index: &StorageIndex, share_number: u8) -> Result<Option<Vec<u8>>>;

    /// Deletes a share's record and bytes.
    fn delete(&self, storage_index: &StorageIndex, share_number: u8) -> Result<()>;

    fn is_empty(&self) -> Result<bool>;
}

impl<T: ShareStore + ?Sized> ShareStore for Arc<T> {
    fn insert(&self, record: &ShareRecord) -> Result<()> {
        (**self).insert(record)
    }

    fn get(&self, storage_index: &StorageIndex, share_number: u8) -> Result<Option<ShareRecord>> {
        (**self).get(storage_index, share_number)
    }

    fn get_for_index(&self, storage_index: &StorageIndex) -> Result<Vec<ShareRecord>> {
        (**self).get_for_index(storage_index)
    }

    fn get_all(&self) -> Result<Vec<ShareRecord>> {
        (**self).get_all()
    }

    fn write_data(&self, storage_index: &StorageIndex, share_number: u8, data: &[u8]) -> Result<()> {
        (**self).write_data(storage_index, share_number, data)
    }

    fn read_data(&self, storage_index: &StorageIndex, share_number: u8) -> Result<Option<Vec<u8>>> {
        (**self).read_data(storage_index, share_number)
    }

    fn delete(&self, storage_index: &StorageIndex, share_number: u8) -> Result<()> {
        (**self).delete(storage_index, share_number)
    }

    fn is_empty(&self) -> Result<bool> {
        (**self).is_empty()
    }
}

/// A `ShareStore` implementation using Sled, an embedded database.
///
/// Records are stored as JSON in the `leases` tree and share bytes verbatim
/// in the `shares` tree, both under `<storage index>/<share number>`, so the
/// shares of one file sit next to each other and can be found by prefix scan.
pub struct SledShareStore {
    db: Db,
    leases: Tree,
    shares: Tree,
}

impl SledShareStore {
    /// Opens (or creates) the sled database at `db_path`.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// use sharegrid::repository::SledShareStore;
    ///
    /// let store = SledShareStore::new("path/to/db")?;
    /// ```
    pub fn new(db_path: &std::path::Path) -> Result<Self> {
        let db = sled::open(db_path)?;
        let leases = db.open_tree(LEASE_TREE)?;
        let shares = db.open_tree(DATA_TREE)?;
        Ok(SledShareStore { db, leases, shares })
    }
}

impl ShareStore for SledShareStore {
    fn insert(&self, record: &ShareRecord) -> Result<()> {
        let serialized = serde_json::to_vec(record)?;
        self.leases.insert(record.key(), serialized)?;
        self.db.flush()?;
        Ok(())
    }

    fn get(&self, storage_index: &StorageIndex, share_number: u8) -> Result<Option<ShareRecord>> {
        match self.leases.get(share_key(storage_index, share_number))? {
            Some(found) => Ok(Some(serde_json::from_slice(&found)?)),
            None => Ok(None),
        }
    }

    fn get_for_index(&self, storage_index: &StorageIndex) -> Result<Vec<ShareRecord>> {
        let prefix = format!("{}/", storage_index_prefix(storage_index));
        let mut records = Vec::new();
        for entry in self.leases.scan_prefix(prefix) {
            let (_, value) = entry?;
            records.push(serde_json::from_slice(&value)?);
        }
        Ok(records)
    }

    fn get_all(&self) -> Result<Vec<ShareRecord>> {
        let mut records = Vec::new();
        for entry in self.leases.iter() {
            let (_, value) = entry?;
            records.push(serde_json::from_slice(&value)?);
        }
        Ok(records)
    }

    fn write_data(&self, storage_index: &StorageIndex, share_number: u8, data: &[u8]) -> Result<()> {
        self.shares.insert(share_key(storage_index, share_number), data)?;
        self.db.flush()?;
        Ok(())
    }

    fn read_data(&self, storage_index: &StorageIndex, share_number: u8) -> Result<Option<Vec<u8>>> {
        Ok(self
            .shares
            .get(share_key(storage_index, share_number))?
            .map(|bytes| bytes.to_vec()))
    }

    fn delete(&self, storage_index: &StorageIndex, share_number: u8) -> Result<()> {
        let key = share_key(storage_index, share_number);
        self.leases.remove(&key)?;
        self.shares.remove(&key)?;
        self.db.flush()?;
        Ok(())
    }

    fn is_empty(&self) -> Result<bool> {
        Ok(self.leases.is_empty())
    }
}

/// In-memory `ShareStore`, used when no storage directory is configured and in tests.
#[derive(Default)]
pub struct HashMapShareStore {
    records: Mutex<HashMap<String, ShareRecord>>,
    shares: Mutex<HashMap<String, Vec<u8>>>,
}

impl HashMapShareStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ShareStore for HashMapShareStore {
    fn insert(&self, record: &ShareRecord) -> Result<()> {
        self.records.lock().insert(record.key(), record.clone());
        Ok(())
    }

    fn get(&self, storage_index: &StorageIndex, share_number: u8) -> Result<Option<ShareRecord>> {
        Ok(self
            .records
            .lock()
            .get(&share_key(storage_index, share_number))
            .cloned())
    }

    fn get_for_index(&self, storage_index: &StorageIndex) -> Result<Vec<ShareRecord>> {
        let mut records: Vec<ShareRecord> = self
            .records
            .lock()
            .values()
            .filter(|r| &r.storage_index == storage_index)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.share_number);
        Ok(records)
    }

    fn get_all(&self) -> Result<Vec<ShareRecord>> {
        Ok(self.records.lock().values().cloned().collect())
    }

    fn write_data(&self, storage_index: &StorageIndex, share_number: u8, data: &[u8]) -> Result<()> {
        self.shares
            .lock()
            .insert(share_key(storage_index, share_number), data.to_vec());
        Ok(())
    }

    fn read_data(&self, storage_index: &StorageIndex, share_number: u8) -> Result<Option<Vec<u8>>> {
        Ok(self
            .shares
            .lock()
            .get(&share_key(storage_index, share_number))
            .cloned())
    }

    fn delete(&self, storage_index: &StorageIndex, share_number: u8) -> Result<()> {
        let key = share_key(storage_index, share_number);
        self.records.lock().remove(&key);
        self.shares.lock().remove(&key);
        Ok(())
    }

    fn is_empty(&self) -> Result<bool> {
        Ok(self.records.lock().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::HASH_SIZE;
    use crate::hashutil::storage_index_hash;
    use crate::secret::{CancelSecret, RenewalSecret};
    use tempfile::TempDir;

    fn record(si: StorageIndex, shnum: u8) -> ShareRecord {
        let lease = LeaseInfo::new(
            RenewalSecret::from_bytes([shnum; HASH_SIZE]),
            CancelSecret::from_bytes([shnum + 1; HASH_SIZE]),
            1_000,
            100,
        );
        ShareRecord::new(si, shnum, ShareType::Immutable, 4, lease)
    }

    fn exercise(store: &dyn ShareStore) {
        let a = storage_index_hash(b"a");
        let b = storage_index_hash(b"b");
        assert!(store.is_empty().unwrap());

        store.insert(&record(a, 2)).unwrap();
        store.insert(&record(a, 0)).unwrap();
        store.insert(&record(b, 1)).unwrap();
        store.write_data(&a, 0, b"zero").unwrap();
        store.write_data(&a, 0, b"0000").unwrap();

        let for_a = store.get_for_index(&a).unwrap();
        assert_eq!(
            for_a.iter().map(|r| r.share_number).collect::<Vec<_>>(),
            vec![0, 2]
        );
        assert_eq!(store.get(&b, 1).unwrap(), Some(record(b, 1)));
        assert_eq!(store.get(&b, 0).unwrap(), None);
        assert_eq!(store.get_all().unwrap().len(), 3);

        assert_eq!(store.read_data(&a, 0).unwrap(), Some(b"0000".to_vec()));
        assert_eq!(store.read_data(&a, 2).unwrap(), None);

        store.delete(&a, 0).unwrap();
        assert_eq!(store.get_for_index(&a).unwrap().len(), 1);
        assert_eq!(store.read_data(&a, 0).unwrap(), None);
        assert!(!store.is_empty().unwrap());
    }

    #[test]
    fn test_hashmap_store() {
        exercise(&HashMapShareStore::new());
    }

    #[test]
    fn test_sled_store() {
        let dir = TempDir::new().unwrap();
        exercise(&SledShareStore::new(&dir.path().join("shares")).unwrap());
    }

    #[test]
    fn test_sled_store_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shares");
        let si = storage_index_hash(b"persist");
        {
            let store = SledShareStore::new(&path).unwrap();
            store.insert(&record(si, 3)).unwrap();
            store.write_data(&si, 3, &[7; 4]).unwrap();
        }
        let store = SledShareStore::new(&path).unwrap();
        assert_eq!(store.get(&si, 3).unwrap(), Some(record(si, 3)));
        assert_eq!(store.read_data(&si, 3).unwrap(), Some(vec![7; 4]));
    }

    #[test]
    fn test_sled_keeps_share_bytes_raw() {
        let dir = TempDir::new().unwrap();
        let store = SledShareStore::new(&dir.path().join("shares")).unwrap();
        let si = storage_index_hash(b"raw");
        let data = vec![0xffu8; 4096];
        store.write_data(&si, 0, &data).unwrap();
        store.insert(&record(si, 0)).unwrap();

        let stored = store.shares.get(share_key(&si, 0)).unwrap().unwrap();
        assert_eq!(stored.len(), data.len());
        // the record tree holds no share bytes
        let encoded = store.leases.get(share_key(&si, 0)).unwrap().unwrap();
        assert!(encoded.len() < 1024);
    }

    #[test]
    fn test_sled_undecodable_record() {
        let dir = TempDir::new().unwrap();
        let store = SledShareStore::new(&dir.path().join("shares")).unwrap();
        let si = storage_index_hash(b"garbled");
        store.leases.insert(share_key(&si, 0), &b"{garbled"[..]).unwrap();

        assert!(matches!(
            store.get_for_index(&si),
            Err(crate::error::GridError::Serialization(_))
        ));
    }

    #[test]
    fn test_footprint_counts_record_and_bytes() {
        let record = record(storage_index_hash(b"size"), 0);
        let encoded = serde_json::to_vec(&record).unwrap().len() as u64;
        assert_eq!(record.footprint().unwrap(), 4 + encoded);
    }
}
