//! Grid-wide defaults and fixed sizes.

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;
pub const TIB: u64 = 1024 * GIB;

/// Size of every derived secret and hash output, in bytes.
pub const HASH_SIZE: usize = 32;

/// Size of a storage index, in bytes.
pub const STORAGE_INDEX_SIZE: usize = 16;

/// Shares needed to reconstruct a file.
pub const DEFAULT_SHARES_NEEDED: usize = 3;
/// Distinct servers that must hold a share before an upload counts as successful.
pub const DEFAULT_SHARES_HAPPY: usize = 7;
/// Shares produced by encoding.
pub const DEFAULT_SHARES_TOTAL: usize = 10;
/// Largest share count the GF(2^8) codec can address.
pub const MAX_SHARES_TOTAL: usize = 255;
pub const DEFAULT_MAX_SEGMENT_SIZE: usize = 128 * 1024;
/// Largest segment size a share header can record.
pub const MAX_SEGMENT_SIZE: usize = u32::MAX as usize;

/// Default RSA modulus size for mutable file keys.
pub const DEFAULT_KEYSIZE: usize = 2048;

/// Lease duration granted by a storage server on store or renewal.
pub const DEFAULT_LEASE_DURATION_SECONDS: u64 = 31 * 24 * 60 * 60;

/// Interval between expiration sweeps.
pub const DEFAULT_SWEEP_SECONDS: u64 = 60 * 60;

/// Version marker carried in storage announcements.
pub const STORAGE_PROTOCOL_VERSION: &str = "sharegrid-storage-v1";

/// Bound on write attempts for a single upload, as a multiple of the ring size.
pub const UPLOAD_ATTEMPTS_PER_SERVER: usize = 2;
