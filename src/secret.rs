//! Client secrets and the derivations that bind a client to its leases.
//!
//! A single [`RootSecret`] is created when a node directory is initialised and
//! never leaves the node. Everything else is a one-way function of it:
//!
//! ```text
//! RootSecret ─┬─ LeaseSecret ─┬─ client renewal secret ── file renewal secret(si) ── bucket renewal secret(si, server)
//!             │               └─ client cancel secret  ── file cancel secret(si)  ── bucket cancel secret(si, server)
//!             └─ ConvergenceSecret (unless overridden by the operator)
//! ```
//!
//! Because the chain is deterministic the client never needs to remember
//! per-upload secrets: it can recompute the renewal or cancel secret for any
//! storage index on demand.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::HASH_SIZE;
use crate::error::{GridError, Result};
use crate::hashutil::{self, StorageIndex};
use crate::ring::ServerId;

macro_rules! secret_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Serialize, Deserialize)]
        pub struct $name([u8; HASH_SIZE]);

        impl $name {
            pub fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
                $name(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
                &self.0
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                hashutil::timing_safe_eq(&self.0, &other.0)
            }
        }

        impl Eq for $name {}

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "(<redacted>)"))
            }
        }
    };
}

secret_type!(
    /// Random per-client secret, persisted once and never transmitted.
    RootSecret
);
secret_type!(LeaseSecret);
secret_type!(
    /// Salts content hashing so identical plaintext from the same client converges.
    ConvergenceSecret
);
secret_type!(
    /// Presented to a storage server to extend a lease.
    RenewalSecret
);
secret_type!(
    /// Presented to a storage server to revoke a lease.
    CancelSecret
);
secret_type!(
    /// Per-server secret that authorises writes to a mutable share.
    WriteEnabler
);

impl RootSecret {
    pub fn generate() -> Self {
        let mut bytes = [0u8; HASH_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        RootSecret(bytes)
    }
}

fn decode_secret(field: &str, encoded: &str) -> Result<[u8; HASH_SIZE]> {
    let bytes = hashutil::a2b(encoded.trim())
        .map_err(|e| GridError::configuration(field, e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| GridError::configuration(field, format!("expected {HASH_SIZE} bytes")))
}

/// Reads the base32 secret stored at `path`, creating it with `make` first if it does not exist.
fn get_or_create_secret(path: &Path, make: impl FnOnce() -> [u8; HASH_SIZE]) -> Result<[u8; HASH_SIZE]> {
    if !path.exists() {
        let mut file = fs::File::create(path)?;
        file.write_all(format!("{}\n", hashutil::b2a(&make())).as_bytes())?;
        debug!("created secret file {:?}", path);
    }
    decode_secret(&path.display().to_string(), &fs::read_to_string(path)?)
}

/// Derives every lease and convergence secret this client uses.
pub struct SecretHolder {
    lease_secret: LeaseSecret,
    convergence_secret: ConvergenceSecret,
}

impl SecretHolder {
    pub fn new(root: &RootSecret) -> Self {
        SecretHolder {
            lease_secret: LeaseSecret(hashutil::lease_secret_hash(&root.0)),
            convergence_secret: ConvergenceSecret(hashutil::convergence_secret_hash(&root.0)),
        }
    }

    /// Uses an operator-supplied convergence secret instead of the derived one,
    /// so cooperating clients can deduplicate each other's uploads.
    pub fn with_convergence(root: &RootSecret, convergence: ConvergenceSecret) -> Self {
        SecretHolder {
            convergence_secret: convergence,
            ..SecretHolder::new(root)
        }
    }

    /// Loads `secret` (and the optional `convergence` override) from a private
    /// directory, creating the root secret on first use.
    pub fn load_or_create(private_dir: &Path) -> Result<Self> {
        fs::create_dir_all(private_dir)?;
        let root = RootSecret(get_or_create_secret(&private_dir.join("secret"), || {
            RootSecret::generate().0
        })?);

        let convergence_path = private_dir.join("convergence");
        if convergence_path.exists() {
            let bytes = decode_secret("convergence", &fs::read_to_string(&convergence_path)?)?;
            debug!("using operator-supplied convergence secret");
            return Ok(SecretHolder::with_convergence(&root, ConvergenceSecret(bytes)));
        }
        Ok(SecretHolder::new(&root))
    }

    pub fn client_renewal_secret(&self) -> RenewalSecret {
        RenewalSecret(hashutil::client_renewal_secret_hash(&self.lease_secret.0))
    }

    pub fn client_cancel_secret(&self) -> CancelSecret {
        CancelSecret(hashutil::client_cancel_secret_hash(&self.lease_secret.0))
    }

    pub fn convergence_secret(&self) -> &ConvergenceSecret {
        &self.convergence_secret
    }

    /// File-level renewal secret for one storage index.
    pub fn derive_renewal_secret(&self, si: &StorageIndex) -> RenewalSecret {
        RenewalSecret(hashutil::file_renewal_secret_hash(
            &self.client_renewal_secret().0,
            si,
        ))
    }

    /// File-level cancel secret for one storage index.
    pub fn derive_cancel_secret(&self, si: &StorageIndex) -> CancelSecret {
        CancelSecret(hashutil::file_cancel_secret_hash(
            &self.client_cancel_secret().0,
            si,
        ))
    }

    /// The renewal secret actually handed to `server`.
    pub fn bucket_renewal_secret(&self, si: &StorageIndex, server: &ServerId) -> RenewalSecret {
        RenewalSecret(hashutil::bucket_renewal_secret_hash(
            &self.derive_renewal_secret(si).0,
            &server.to_bytes(),
        ))
    }

    /// The cancel secret actually handed to `server`.
    pub fn bucket_cancel_secret(&self, si: &StorageIndex, server: &ServerId) -> CancelSecret {
        CancelSecret(hashutil::bucket_cancel_secret_hash(
            &self.derive_cancel_secret(si).0,
            &server.to_bytes(),
        ))
    }
}

impl WriteEnabler {
    pub fn derive(writekey: &[u8], server: &ServerId) -> Self {
        WriteEnabler(hashutil::ssk_write_enabler_hash(writekey, &server.to_bytes()))
    }
}
