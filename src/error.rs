use std::fmt;

use thiserror::Error;

use crate::hashutil::StorageIndex;

pub type Result<T> = std::result::Result<T, GridError>;

/// Why a storage server refused a share write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionReason {
    ReadOnly,
    InsufficientSpace {
        available: u64,
        reserved: u64,
        requested: u64,
    },
}

impl fmt::Display for AdmissionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionReason::ReadOnly => write!(f, "server is read-only"),
            AdmissionReason::InsufficientSpace {
                available,
                reserved,
                requested,
            } => write!(
                f,
                "{requested} bytes requested, {available} available, {reserved} reserved"
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum GridError {
    #[error("configuration error in `{field}`: {reason}")]
    Configuration { field: String, reason: String },

    #[error(
        "insufficient redundancy for {storage_index}: {servers_with_shares} servers hold shares, \
         {happy} required ({shares_placed} of {total} shares placed)"
    )]
    InsufficientRedundancy {
        storage_index: StorageIndex,
        happy: usize,
        servers_with_shares: usize,
        shares_placed: usize,
        total: usize,
    },

    #[error("lease operation on {storage_index} not authorized")]
    Authorization { storage_index: StorageIndex },

    #[error("share write rejected: {reason}")]
    AdmissionRejected { reason: AdmissionReason },

    #[error("malformed capability `{uri}`: {reason}")]
    MalformedCapability { uri: String, reason: String },

    #[error("found {found} shares of {storage_index}, need {needed}")]
    NotEnoughShares {
        storage_index: StorageIndex,
        found: usize,
        needed: usize,
    },

    #[error("integrity check failed for {storage_index}: {reason}")]
    Integrity {
        storage_index: StorageIndex,
        reason: String,
    },

    #[error("node is read-only")]
    NotWriteable,

    #[error("capability grants no read access")]
    NotReadable,

    #[error("unknown server {0}")]
    UnknownServer(String),

    #[error("storage server unavailable")]
    ServerUnavailable,

    #[error("storage server failed: {0}")]
    ServerFailure(String),

    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("share store error: {0}")]
    Store(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("toml error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("toml error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GridError {
    pub fn configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        GridError::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn malformed(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        GridError::MalformedCapability {
            uri: uri.into(),
            reason: reason.into(),
        }
    }

    /// Per-server failures the uploader absorbs by moving on to the next ring candidate.
    pub fn is_per_server(&self) -> bool {
        matches!(
            self,
            GridError::AdmissionRejected { .. }
                | GridError::ServerUnavailable
                | GridError::ServerFailure(_)
                | GridError::Authorization { .. }
                | GridError::Store(_)
                | GridError::Io(_)
        )
    }
}
