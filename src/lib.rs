//! # Capability-Secured Erasure-Coded Storage Grid
//!
//! This library is the client-side core of a storage grid in which files are
//! encrypted, split into redundant shares, spread over independently run
//! storage servers and later put back together using nothing but a short
//! capability string.
//!
//! ## Capabilities
//!
//! A capability is both the name of a file and the authority to use it. An
//! immutable file's read capability carries the content key, the hash of the
//! ciphertext and the encoding parameters:
//!
//! ```ignore
//! URI:CHK:<key>:<crypttext hash>:<k>:<n>:<size>
//! ```
//!
//! Mutable files and directories have write capabilities (`URI:SSK:`,
//! `URI:DIR2:`) from which the read capabilities (`URI:SSK-RO:`,
//! `URI:DIR2-RO:`) are derived by hashing, so handing out a read capability
//! never leaks write access.
//!
//! ## Placement
//!
//! Every file has a 16 byte storage index derived from its key. The index
//! induces a permutation of the known servers, `SHA256(storage index ‖
//! permutation seed)`, and shares are placed by walking that permutation.
//! A reader computes the same permutation and asks the same servers first, so
//! no lookup service is needed. An upload only succeeds once `happy` distinct
//! servers hold a share.
//!
//! ## Leases
//!
//! Servers keep a share only while some client holds an unexpired lease on
//! it. Lease secrets are derived per client, per file and per server from one
//! root secret, so only the uploading client can renew or cancel its own
//! leases, and one server cannot replay a secret to another.
//!
//! ### Example: Uploading and Reading
//!
//! ```ignore
//! use std::path::Path;
//! use sharegrid::config::GridConfig;
//! use sharegrid::grid::GridClient;
//!
//! let client = GridClient::start(GridConfig::new(Path::new(".grid"))?).await?;
//! client.when_connected_enough(7).await?;
//!
//! let cap = client.upload(b"hello grid").await?;
//! let node = client.create_node_from_uri(None, Some(&cap.to_string()));
//! assert_eq!(node.read().await?, b"hello grid");
//! ```
//!
//! ## Modules
//!
//! - `secret`: Root, lease and convergence secrets.
//! - `keygen`: RSA keypairs for mutable files.
//! - `ring`: Known servers and the per-file permutation over them.
//! - `upload`: Share placement and the happiness threshold.
//! - `server`, `client`, `command`, `provider`: The storage server and its handles.
//! - `expiration`: Lease expiration policy and the reclamation sweep.
//! - `nodemaker`, `filenode`, `dirnode`: Handles built from capabilities.
//! - `grid`: Node assembly and shutdown.

/// The `capability` module parses and prints capability strings.
pub mod capability;

/// The `client` module defines `StorageClient`, the cloneable handle through which every
/// storage server operation is requested.
pub mod client;

/// The erasure code that turns a ciphertext into `n` shares of which any `k` suffice.
pub mod codec;

/// The `command` module contains the commands a storage server's event loop processes, and the
/// handler that dispatches them.
pub mod command;

/// The `config` module loads node configuration from `conf.toml` and the environment.
pub mod config;

/// The `constants` module defines various constants used in the library.
pub mod constants;

/// Symmetric encryption of file contents.
pub mod crypto;

/// Directories stored as mutable files.
pub mod dirnode;

/// The crate error type.
pub mod error;

/// The `expiration` module decides which leases have run out and reclaims shares left without one.
pub mod expiration;

/// Immutable and mutable file handles.
pub mod filenode;

/// The `grid` module assembles a running node and stops it again.
pub mod grid;

/// Tagged hashes and every secret derivation built on them.
pub mod hashutil;

pub mod keygen;

/// Leases and the clocks that time them.
pub mod lease;

/// The `nodemaker` module turns capability strings into typed file and directory handles.
pub mod nodemaker;

/// The `protocol` module defines storage announcements and the static peer list format.
pub mod protocol;

/// The `provider` module implements each storage server operation against the share store, and
/// the periodic expiration sweep.
pub mod provider;

/// The `repository` module persists shares and their leases.
pub mod repository;

/// The `ring` module tracks storage servers and orders them per storage index.
pub mod ring;

/// The `secret` module derives every per-client secret from one root secret.
pub mod secret;

/// The `server` module defines the storage server event loop.
pub mod server;

/// The `upload` module places shares on the ring.
pub mod upload;

#[cfg(test)]
pub(crate) mod testkit;
