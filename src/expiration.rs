use std::fmt;

use chrono::{NaiveDate, NaiveTime};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{GridError, Result};
use crate::lease::LeaseInfo;
use crate::repository::{ShareStore, ShareType};

/// How the sweep decides that a lease has run out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirationMode {
    /// A lease expires at its recorded expiration time, or, with an override,
    /// a fixed number of seconds after it was granted or last renewed.
    Age { override_lease_duration: Option<u64> },
    /// Every lease granted before `cutoff` (Unix seconds) is expired,
    /// whatever its recorded expiration.
    CutoffDate { cutoff: u64 },
}

impl ExpirationMode {
    /// Parses a `YYYY-MM-DD` cutoff date, taken as midnight UTC.
    pub fn cutoff_from_date(date: &str) -> Result<Self> {
        let day = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d")
            .map_err(|e| GridError::configuration("storage.expire.cutoff_date", e.to_string()))?;
        let cutoff = day.and_time(NaiveTime::MIN).and_utc().timestamp();
        Ok(ExpirationMode::CutoffDate {
            cutoff: cutoff.max(0) as u64,
        })
    }
}

/// Reclamation policy of one storage server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirationPolicy {
    /// When false the sweep only reports what it would remove.
    pub enabled: bool,
    pub mode: ExpirationMode,
    pub immutable: bool,
    pub mutable: bool,
}

impl Default for ExpirationPolicy {
    fn default() -> Self {
        ExpirationPolicy {
            enabled: false,
            mode: ExpirationMode::Age {
                override_lease_duration: None,
            },
            immutable: true,
            mutable: true,
        }
    }
}

impl ExpirationPolicy {
    pub fn applies_to(&self, share_type: ShareType) -> bool {
        match share_type {
            ShareType::Immutable => self.immutable,
            ShareType::Mutable => self.mutable,
        }
    }

    pub fn is_expired(&self, lease: &LeaseInfo, now: u64) -> bool {
        match self.mode {
            ExpirationMode::Age {
                override_lease_duration: Some(duration),
            } => now > lease.granted_at.saturating_add(duration),
            ExpirationMode::Age {
                override_lease_duration: None,
            } => now > lease.expires_at,
            ExpirationMode::CutoffDate { cutoff } => lease.granted_at < cutoff,
        }
    }
}

/// Outcome of one expiration sweep. In a dry run the counts describe what
/// the sweep would have done.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub shares_examined: usize,
    pub leases_expired: usize,
    pub shares_removed: usize,
    pub bytes_reclaimed: u64,
    pub dry_run: bool,
}

impl fmt::Display for SweepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = if self.dry_run { "would remove" } else { "removed" };
        write!(
            f,
            "examined {} shares, {} leases expired, {} {} shares ({} bytes)",
            self.shares_examined, self.leases_expired, verb, self.shares_removed, self.bytes_reclaimed
        )
    }
}

/// Walks every share in `store`, drops expired leases, and deletes shares
/// left with no lease.
///
/// Shares of a type the policy exempts are examined but never touched. A
/// share keeps living as long as any one lease on it is unexpired, whoever
/// holds that lease.
pub fn sweep(store: &dyn ShareStore, policy: &ExpirationPolicy, now: u64) -> Result<SweepReport> {
    let mut report = SweepReport {
        dry_run: !policy.enabled,
        ..SweepReport::default()
    };

    for mut record in store.get_all()? {
        report.shares_examined += 1;
        if !policy.applies_to(record.share_type) {
            continue;
        }

        let before = record.leases.len();
        record.leases.retain(|lease| !policy.is_expired(lease, now));
        let expired = before - record.leases.len();
        report.leases_expired += expired;

        if record.leases.is_empty() {
            report.shares_removed += 1;
            report.bytes_reclaimed += record.size;
            if policy.enabled {
                debug!(
                    "removing share {} of {}",
                    record.share_number, record.storage_index
                );
                store.delete(&record.storage_index, record.share_number)?;
            }
        } else if expired > 0 && policy.enabled {
            store.insert(&record)?;
        }
    }

    info!("expiration sweep: {}", report);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::HASH_SIZE;
    use crate::hashutil::{storage_index_hash, StorageIndex};
    use crate::repository::{HashMapShareStore, ShareRecord};
    use crate::secret::{CancelSecret, RenewalSecret};

    const HOUR: u64 = 60 * 60;
    const DAY: u64 = 24 * HOUR;
    const T: u64 = 1_700_000_000;

    fn lease(tag: u8, granted_at: u64, duration: u64) -> LeaseInfo {
        LeaseInfo::new(
            RenewalSecret::from_bytes([tag; HASH_SIZE]),
            CancelSecret::from_bytes([tag.wrapping_add(100); HASH_SIZE]),
            granted_at,
            duration,
        )
    }

    fn store_share(store: &dyn ShareStore, si: StorageIndex, share_type: ShareType, lease: LeaseInfo) {
        store.write_data(&si, 0, &[0u8; 100]).unwrap();
        store
            .insert(&ShareRecord::new(si, 0, share_type, 100, lease))
            .unwrap();
    }

    /// Refuses to hand out share bytes.
    #[derive(Default)]
    struct RecordsOnly(HashMapShareStore);

    impl ShareStore for RecordsOnly {
        fn insert(&self, record: &ShareRecord) -> Result<()> {
            self.0.insert(record)
        }

        fn get(&self, storage_index: &StorageIndex, share_number: u8) -> Result<Option<ShareRecord>> {
            self.0.get(storage_index, share_number)
        }

        fn get_for_index(&self, storage_index: &StorageIndex) -> Result<Vec<ShareRecord>> {
            self.0.get_for_index(storage_index)
        }

        fn get_all(&self) -> Result<Vec<ShareRecord>> {
            self.0.get_all()
        }

        fn write_data(&self, storage_index: &StorageIndex, share_number: u8, data: &[u8]) -> Result<()> {
            self.0.write_data(storage_index, share_number, data)
        }

        fn read_data(&self, _: &StorageIndex, _: u8) -> Result<Option<Vec<u8>>> {
            panic!("sweep read share bytes")
        }

        fn delete(&self, storage_index: &StorageIndex, share_number: u8) -> Result<()> {
            self.0.delete(storage_index, share_number)
        }

        fn is_empty(&self) -> Result<bool> {
            self.0.is_empty()
        }
    }

    fn age_policy() -> ExpirationPolicy {
        ExpirationPolicy {
            enabled: true,
            ..ExpirationPolicy::default()
        }
    }

    #[test]
    fn test_one_day_lease_in_age_mode() {
        let store = HashMapShareStore::new();
        let si = storage_index_hash(b"one day");
        store_share(&store, si, ShareType::Immutable, lease(1, T, DAY));

        let report = sweep(&store, &age_policy(), T + 23 * HOUR).unwrap();
        assert_eq!(report.shares_removed, 0);
        assert_eq!(store.get_for_index(&si).unwrap().len(), 1);

        let report = sweep(&store, &age_policy(), T + 25 * HOUR).unwrap();
        assert_eq!(report.leases_expired, 1);
        assert_eq!(report.shares_removed, 1);
        assert_eq!(report.bytes_reclaimed, 100);
        assert!(store.get_for_index(&si).unwrap().is_empty());
        assert!(store.read_data(&si, 0).unwrap().is_none());
    }

    #[test]
    fn test_sweep_reads_records_only() {
        let store = RecordsOnly::default();
        let kept = storage_index_hash(b"kept");
        let gone = storage_index_hash(b"gone");
        store_share(&store, kept, ShareType::Immutable, lease(1, T, 30 * DAY));
        store_share(&store, gone, ShareType::Mutable, lease(2, T, HOUR));

        let report = sweep(&store, &age_policy(), T + DAY).unwrap();
        assert_eq!(report.shares_examined, 2);
        assert_eq!(report.shares_removed, 1);
        assert_eq!(report.bytes_reclaimed, 100);
        assert!(store.get(&kept, 0).unwrap().is_some());
    }

    #[test]
    fn test_live_lease_from_another_client_protects_share() {
        let store = HashMapShareStore::new();
        let si = storage_index_hash(b"shared");
        let mut record = ShareRecord::new(si, 0, ShareType::Immutable, 10, lease(1, T, DAY));
        record.leases.push(lease(2, T, 30 * DAY));
        store.insert(&record).unwrap();

        for days in [2, 10, 29] {
            let report = sweep(&store, &age_policy(), T + days * DAY).unwrap();
            assert_eq!(report.shares_removed, 0);
        }
        let kept = store.get(&si, 0).unwrap().unwrap();
        assert_eq!(kept.leases, vec![lease(2, T, 30 * DAY)]);
    }

    #[test]
    fn test_override_duration() {
        let policy = ExpirationPolicy {
            mode: ExpirationMode::Age {
                override_lease_duration: Some(HOUR),
            },
            ..age_policy()
        };
        let long = lease(1, T, 30 * DAY);
        assert!(!policy.is_expired(&long, T + HOUR));
        assert!(policy.is_expired(&long, T + HOUR + 1));
    }

    #[test]
    fn test_cutoff_date_mode() {
        let mode = ExpirationMode::cutoff_from_date("2023-11-15").unwrap();
        assert_eq!(mode, ExpirationMode::CutoffDate { cutoff: 1_700_006_400 });
        let policy = ExpirationPolicy {
            mode,
            ..age_policy()
        };

        // recorded expiration does not matter, only when the lease was granted
        assert!(policy.is_expired(&lease(1, 1_700_006_399, 365 * DAY), 0));
        assert!(!policy.is_expired(&lease(1, 1_700_006_400, 1), u64::MAX));
        assert!(ExpirationMode::cutoff_from_date("15/11/2023").is_err());
    }

    #[test]
    fn test_share_type_exemption() {
        let store = HashMapShareStore::new();
        let immutable = storage_index_hash(b"immutable");
        let mutable = storage_index_hash(b"mutable");
        store_share(&store, immutable, ShareType::Immutable, lease(1, T, HOUR));
        store_share(&store, mutable, ShareType::Mutable, lease(2, T, HOUR));

        let policy = ExpirationPolicy {
            mutable: false,
            ..age_policy()
        };
        let report = sweep(&store, &policy, T + DAY).unwrap();
        assert_eq!(report.shares_examined, 2);
        assert_eq!(report.shares_removed, 1);
        assert!(store.get(&immutable, 0).unwrap().is_none());
        assert!(store.get(&mutable, 0).unwrap().is_some());
    }

    #[test]
    fn test_disabled_policy_is_a_dry_run() {
        let store = HashMapShareStore::new();
        let si = storage_index_hash(b"dry");
        store_share(&store, si, ShareType::Immutable, lease(1, T, HOUR));

        let report = sweep(&store, &ExpirationPolicy::default(), T + DAY).unwrap();
        assert!(report.dry_run);
        assert_eq!(report.shares_removed, 1);
        assert_eq!(store.get(&si, 0).unwrap().unwrap().leases.len(), 1);
    }
}
