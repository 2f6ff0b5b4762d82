use std::collections::{BTreeMap, BTreeSet};

use futures::channel::oneshot;
use tracing::debug;

use crate::error::Result;
use crate::expiration::SweepReport;
use crate::hashutil::StorageIndex;
use crate::provider::{
    execute_add_lease, execute_cancel_lease, execute_have_shares, execute_list_shares,
    execute_read_shares, execute_renew_lease, execute_stats, execute_store_mutable_share,
    execute_store_share, execute_sweep,
};
use crate::secret::{CancelSecret, RenewalSecret, WriteEnabler};
use crate::server::{StorageServer, StorageStats};

/// Represents commands that can be issued to a storage server.
///
/// Each variant carries a oneshot sender on which the server replies once
/// the command has been applied.
///
/// # Variants
///
/// * `StoreShare` - Store an immutable share and attach a lease.
/// * `StoreMutableShare` - Create or overwrite a mutable share, guarded by a write enabler.
/// * `ListShares` - List the share numbers held for a storage index.
/// * `ReadShares` - Read every share held for a storage index.
/// * `AddLease` - Add or renew a lease on every share of a storage index.
/// * `RenewLease` - Extend the lease matching a renewal secret.
/// * `CancelLease` - Revoke the lease matching a cancel secret.
/// * `RunSweep` - Run one expiration sweep.
/// * `HaveShares` - Whether the server stores anything.
/// * `Stats` - Report share counts and space.
#[derive(Debug)]
pub enum Command {
    StoreShare {
        storage_index: StorageIndex,
        share_number: u8,
        data: Vec<u8>,
        renew_secret: RenewalSecret,
        cancel_secret: CancelSecret,
        sender: oneshot::Sender<Result<()>>,
    },
    StoreMutableShare {
        storage_index: StorageIndex,
        share_number: u8,
        data: Vec<u8>,
        write_enabler: WriteEnabler,
        renew_secret: RenewalSecret,
        cancel_secret: CancelSecret,
        sender: oneshot::Sender<Result<()>>,
    },
    ListShares {
        storage_index: StorageIndex,
        sender: oneshot::Sender<Result<BTreeSet<u8>>>,
    },
    ReadShares {
        storage_index: StorageIndex,
        sender: oneshot::Sender<Result<BTreeMap<u8, Vec<u8>>>>,
    },
    AddLease {
        storage_index: StorageIndex,
        renew_secret: RenewalSecret,
        cancel_secret: CancelSecret,
        sender: oneshot::Sender<Result<usize>>,
    },
    RenewLease {
        storage_index: StorageIndex,
        renew_secret: RenewalSecret,
        new_expiration: Option<u64>,
        sender: oneshot::Sender<Result<()>>,
    },
    CancelLease {
        storage_index: StorageIndex,
        cancel_secret: CancelSecret,
        sender: oneshot::Sender<Result<()>>,
    },
    RunSweep {
        sender: oneshot::Sender<Result<SweepReport>>,
    },
    HaveShares {
        sender: oneshot::Sender<Result<bool>>,
    },
    Stats {
        sender: oneshot::Sender<Result<StorageStats>>,
    },
}

/// Applies one command to the server and sends the reply.
///
/// A caller that has gone away is not an error; the reply is dropped.
///
/// # Examples
///
/// ```ignore
/// command_handler(&mut server, command);
/// ```
pub fn command_handler(server: &mut StorageServer, command: Command) {
    match command {
        Command::StoreShare {
            storage_index,
            share_number,
            data,
            renew_secret,
            cancel_secret,
            sender,
        } => {
            debug!("store share {} of {}", share_number, storage_index);
            let _ = sender.send(execute_store_share(
                server,
                storage_index,
                share_number,
                data,
                renew_secret,
                cancel_secret,
            ));
        }
        Command::StoreMutableShare {
            storage_index,
            share_number,
            data,
            write_enabler,
            renew_secret,
            cancel_secret,
            sender,
        } => {
            debug!("store mutable share {} of {}", share_number, storage_index);
            let _ = sender.send(execute_store_mutable_share(
                server,
                storage_index,
                share_number,
                data,
                write_enabler,
                renew_secret,
                cancel_secret,
            ));
        }
        Command::ListShares {
            storage_index,
            sender,
        } => {
            let _ = sender.send(execute_list_shares(server, &storage_index));
        }
        Command::ReadShares {
            storage_index,
            sender,
        } => {
            let _ = sender.send(execute_read_shares(server, &storage_index));
        }
        Command::AddLease {
            storage_index,
            renew_secret,
            cancel_secret,
            sender,
        } => {
            let _ = sender.send(execute_add_lease(
                server,
                &storage_index,
                renew_secret,
                cancel_secret,
            ));
        }
        Command::RenewLease {
            storage_index,
            renew_secret,
            new_expiration,
            sender,
        } => {
            let _ = sender.send(execute_renew_lease(
                server,
                &storage_index,
                &renew_secret,
                new_expiration,
            ));
        }
        Command::CancelLease {
            storage_index,
            cancel_secret,
            sender,
        } => {
            let _ = sender.send(execute_cancel_lease(server, &storage_index, &cancel_secret));
        }
        Command::RunSweep { sender } => {
            let _ = sender.send(execute_sweep(server));
        }
        Command::HaveShares { sender } => {
            let _ = sender.send(execute_have_shares(server));
        }
        Command::Stats { sender } => {
            let _ = sender.send(execute_stats(server));
        }
    }
}
