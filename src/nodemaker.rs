//! Turns capability strings into typed handles.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::capability::{Capability, SskWrite};
use crate::dirnode::DirectoryNode;
use crate::error::{GridError, Result};
use crate::filenode::{CheckResults, ImmutableFileNode, MutableFileNode, VerifierNode};
use crate::hashutil::{self, StorageIndex};
use crate::keygen::{KeyGenerator, SigningKey};
use crate::ring::{PeerRing, ServerId};
use crate::secret::SecretHolder;
use crate::upload::{EncodingParameters, Uploader};

/// A capability this client cannot use.
///
/// Building one never fails. Every operation on it does, with
/// `MalformedCapability`, so a directory holding such an entry can still be
/// listed and rewritten without losing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownNode {
    write_uri: Option<String>,
    read_uri: Option<String>,
    reason: String,
}

impl UnknownNode {
    pub fn new(write_uri: Option<&str>, read_uri: Option<&str>, reason: impl Into<String>) -> Self {
        UnknownNode {
            write_uri: write_uri.map(str::to_string),
            read_uri: read_uri.map(str::to_string),
            reason: reason.into(),
        }
    }

    pub fn write_uri(&self) -> Option<&str> {
        self.write_uri.as_deref()
    }

    pub fn read_uri(&self) -> Option<&str> {
        self.read_uri.as_deref()
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// The error every operation on this node fails with.
    pub fn error(&self) -> GridError {
        let uri = self
            .write_uri
            .as_deref()
            .or(self.read_uri.as_deref())
            .unwrap_or_default();
        GridError::malformed(uri, self.reason.clone())
    }
}

/// A typed handle produced by [`NodeMaker::create_from_capability`].
#[derive(Clone)]
pub enum Node {
    ImmutableFile(ImmutableFileNode),
    Verifier(VerifierNode),
    MutableFile(MutableFileNode),
    Directory(DirectoryNode),
    Unknown(UnknownNode),
}

impl Node {
    pub fn is_unknown(&self) -> bool {
        matches!(self, Node::Unknown(_))
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, Node::Directory(_))
    }

    pub fn is_mutable(&self) -> bool {
        matches!(self, Node::MutableFile(_) | Node::Directory(_))
    }

    pub fn is_readonly(&self) -> bool {
        match self {
            Node::MutableFile(m) => m.is_readonly(),
            Node::Directory(d) => d.is_readonly(),
            _ => true,
        }
    }

    /// The most powerful capability held, `None` for an unknown node.
    pub fn capability(&self) -> Option<Capability> {
        match self {
            Node::ImmutableFile(f) => Some(f.capability()),
            Node::Verifier(v) => Some(v.capability()),
            Node::MutableFile(m) => Some(m.capability()),
            Node::Directory(d) => Some(d.capability()),
            Node::Unknown(_) => None,
        }
    }

    /// Write capability string, for mutable nodes holding one.
    pub fn write_uri(&self) -> Option<String> {
        match self {
            Node::Unknown(u) => u.write_uri().map(str::to_string),
            _ => self
                .capability()
                .filter(Capability::is_writeable)
                .map(|c| c.to_string()),
        }
    }

    /// Least powerful capability string that still reads (or, for a
    /// verifier, checks) the node.
    pub fn read_uri(&self) -> Option<String> {
        match self {
            Node::Unknown(u) => u.read_uri().map(str::to_string),
            Node::Verifier(v) => Some(v.capability().to_string()),
            _ => self
                .capability()
                .and_then(|c| c.read_only())
                .map(|c| c.to_string()),
        }
    }

    pub fn storage_index(&self) -> Result<StorageIndex> {
        match self {
            Node::ImmutableFile(f) => Ok(f.storage_index()),
            Node::Verifier(v) => Ok(v.storage_index()),
            Node::MutableFile(m) => Ok(m.storage_index()),
            Node::Directory(d) => Ok(d.storage_index()),
            Node::Unknown(u) => Err(u.error()),
        }
    }

    /// The servers a download of this node asks, in order.
    pub fn permuted_peer_list(&self) -> Result<Vec<ServerId>> {
        match self {
            Node::ImmutableFile(f) => Ok(f.permuted_peer_list()),
            Node::MutableFile(m) => Ok(m.permuted_peer_list()),
            Node::Directory(d) => Ok(d.file().permuted_peer_list()),
            Node::Verifier(v) => Ok(v.permuted_peer_list()),
            Node::Unknown(u) => Err(u.error()),
        }
    }

    /// File contents. Directories return their serialized child table.
    pub async fn read(&self) -> Result<Vec<u8>> {
        match self {
            Node::ImmutableFile(f) => f.read().await,
            Node::MutableFile(m) => m.read().await,
            Node::Directory(d) => d.file().read().await,
            Node::Verifier(_) => Err(GridError::NotReadable),
            Node::Unknown(u) => Err(u.error()),
        }
    }

    pub async fn check(&self) -> Result<CheckResults> {
        match self {
            Node::ImmutableFile(f) => f.check().await,
            Node::Verifier(v) => v.check().await,
            Node::MutableFile(m) => m.check().await,
            Node::Directory(d) => d.file().check().await,
            Node::Unknown(u) => Err(u.error()),
        }
    }

    pub fn as_directory(&self) -> Option<&DirectoryNode> {
        match self {
            Node::Directory(d) => Some(d),
            _ => None,
        }
    }
}

/// Builds file and directory handles bound to this client's ring, secrets
/// and uploader.
///
/// # Fields
///
/// * `ring` - Where shares are looked for.
/// * `secrets` - Lease secrets for renewals and cancellations.
/// * `uploader` - Places new files and new mutable versions.
/// * `keygen` - Creates keypairs for new mutable files.
/// * `params` - Encoding used for everything this maker creates.
#[derive(Clone)]
pub struct NodeMaker {
    ring: Arc<PeerRing>,
    secrets: Arc<SecretHolder>,
    uploader: Arc<Uploader>,
    keygen: Arc<KeyGenerator>,
    params: EncodingParameters,
}

impl NodeMaker {
    pub fn new(
        ring: Arc<PeerRing>,
        secrets: Arc<SecretHolder>,
        uploader: Arc<Uploader>,
        keygen: Arc<KeyGenerator>,
        params: EncodingParameters,
    ) -> Self {
        NodeMaker {
            ring,
            secrets,
            uploader,
            keygen,
            params,
        }
    }

    pub fn params(&self) -> &EncodingParameters {
        &self.params
    }

    /// Builds the handle for a write and/or read capability string.
    ///
    /// The write capability wins when both parse. Never fails: anything
    /// unusable becomes [`Node::Unknown`], which keeps both strings.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let node = maker.create_from_capability(None, Some("URI:CHK:..."));
    /// let contents = node.read().await?;
    /// ```
    pub fn create_from_capability(&self, write_uri: Option<&str>, read_uri: Option<&str>) -> Node {
        let write = write_uri.map(Capability::parse);
        let read = read_uri.map(Capability::parse);

        let chosen = match (&write, &read) {
            (Some(w), Some(r)) if !w.is_unknown() && !r.is_unknown() => {
                if w.storage_index() != r.storage_index() {
                    return Node::Unknown(UnknownNode::new(
                        write_uri,
                        read_uri,
                        "write and read capabilities name different files",
                    ));
                }
                w.clone()
            }
            (Some(w), _) if !w.is_unknown() => w.clone(),
            (_, Some(r)) if !r.is_unknown() => r.clone(),
            (Some(Capability::Unknown { reason, .. }), _) | (None, Some(Capability::Unknown { reason, .. })) => {
                debug!("unusable capability: {}", reason);
                return Node::Unknown(UnknownNode::new(write_uri, read_uri, reason.clone()));
            }
            _ => return Node::Unknown(UnknownNode::new(write_uri, read_uri, "no capability given")),
        };
        self.node_for(chosen, write_uri, read_uri)
    }

    fn node_for(&self, cap: Capability, write_uri: Option<&str>, read_uri: Option<&str>) -> Node {
        match cap {
            Capability::ImmutableRead(c) => {
                Node::ImmutableFile(ImmutableFileNode::new(c, self.ring.clone(), self.secrets.clone()))
            }
            Capability::ImmutableVerify(c) => Node::Verifier(VerifierNode::new(c, self.ring.clone())),
            Capability::MutableWrite(c) => Node::MutableFile(self.mutable_from_write(c)),
            Capability::MutableRead(c) => Node::MutableFile(MutableFileNode::from_read_cap(
                c,
                self.ring.clone(),
                self.uploader.clone(),
                self.params,
            )),
            Capability::DirectoryWrite(c) => {
                Node::Directory(DirectoryNode::new(self.mutable_from_write(c), self.clone()))
            }
            Capability::DirectoryRead(c) => Node::Directory(DirectoryNode::new(
                MutableFileNode::from_read_cap(c, self.ring.clone(), self.uploader.clone(), self.params),
                self.clone(),
            )),
            Capability::Unknown { reason, .. } => Node::Unknown(UnknownNode::new(write_uri, read_uri, reason)),
        }
    }

    fn mutable_from_write(&self, cap: SskWrite) -> MutableFileNode {
        MutableFileNode::from_write_cap(cap, self.ring.clone(), self.uploader.clone(), self.params)
    }

    /// Uploads `contents` as an immutable file.
    pub async fn upload(&self, contents: &[u8]) -> Result<ImmutableFileNode> {
        match self.uploader.upload(contents, &self.params).await? {
            Capability::ImmutableRead(cap) => Ok(ImmutableFileNode::new(cap, self.ring.clone(), self.secrets.clone())),
            other => Err(GridError::malformed(other.to_string(), "uploader returned a non-immutable capability")),
        }
    }

    async fn new_write_cap(&self, keysize: Option<usize>) -> Result<(SskWrite, SigningKey)> {
        let (verifying, signing) = self.keygen.generate(keysize).await?;
        let cap = SskWrite {
            writekey: hashutil::ssk_writekey_hash(&signing.to_der()?),
            fingerprint: hashutil::ssk_pubkey_fingerprint_hash(&verifying.to_der()?),
        };
        Ok((cap, signing))
    }

    /// Creates a mutable file holding `contents` as version 1.
    ///
    /// # Arguments
    ///
    /// * `contents` - Initial contents.
    /// * `keysize` - RSA key size in bits; `None` uses the key generator's default.
    pub async fn create_mutable_file(&self, contents: &[u8], keysize: Option<usize>) -> Result<MutableFileNode> {
        let (cap, signing) = self.new_write_cap(keysize).await?;
        let node = self.mutable_from_write(cap);
        node.publish(&signing, 1, contents).await?;
        Ok(node)
    }

    /// Creates an empty directory.
    pub async fn create_new_mutable_directory(&self) -> Result<DirectoryNode> {
        let (cap, signing) = self.new_write_cap(None).await?;
        let file = self.mutable_from_write(cap);
        file.publish(&signing, 1, DirectoryNode::EMPTY).await?;
        Ok(DirectoryNode::new(file, self.clone()))
    }
}

impl std::fmt::Debug for NodeMaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeMaker").field("params", &self.params).finish()
    }
}

/// Logs a child that turned out unusable.
pub(crate) fn note_unknown(name: &str, node: &Node) {
    if let Node::Unknown(u) = node {
        warn!("child {:?} is unusable: {}", name, u.reason());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::TestGrid;

    fn small() -> EncodingParameters {
        EncodingParameters::new(2, 3, 4, 256).unwrap()
    }

    #[tokio::test]
    async fn test_end_to_end_scenario() {
        let grid = TestGrid::with_servers(10).await;
        let maker = grid.node_maker(EncodingParameters::new(3, 7, 10, 4096).unwrap());
        let content: Vec<u8> = (0..10_000u32).map(|i| (i * 7 % 256) as u8).collect();
        let uploaded = maker.upload(&content).await.unwrap();
        let cap = uploaded.capability().to_string();

        let node = maker.create_from_capability(None, Some(&cap));
        assert!(matches!(node, Node::ImmutableFile(_)));
        let si = node.storage_index().unwrap();
        assert_eq!(si, uploaded.storage_index());
        assert_eq!(node.permuted_peer_list().unwrap(), grid.ring.permuted_peer_list(&si));
        assert_eq!(node.permuted_peer_list().unwrap().len(), 10);
        assert_eq!(node.read().await.unwrap(), content);

        let check = node.check().await.unwrap();
        assert_eq!(check.shares_found, 10);
        assert_eq!(check.servers_with_shares, 10);
    }

    #[tokio::test]
    async fn test_unknown_capabilities_fail_lazily() {
        let grid = TestGrid::with_servers(1).await;
        let maker = grid.node_maker(EncodingParameters::new(1, 1, 1, 256).unwrap());

        let node = maker.create_from_capability(None, Some("URI:FUTURE:abc"));
        let Node::Unknown(unknown) = &node else {
            panic!("expected an unknown node");
        };
        assert_eq!(unknown.read_uri(), Some("URI:FUTURE:abc"));
        assert_eq!(node.read_uri().as_deref(), Some("URI:FUTURE:abc"));
        assert!(node.capability().is_none());
        assert!(matches!(node.read().await, Err(GridError::MalformedCapability { .. })));
        assert!(matches!(node.storage_index(), Err(GridError::MalformedCapability { .. })));

        let node = maker.create_from_capability(Some("URI:CHK:not-base32"), None);
        assert!(node.is_unknown());
        assert!(maker.create_from_capability(None, None).is_unknown());
    }

    #[tokio::test]
    async fn test_mismatched_write_and_read_caps() {
        let grid = TestGrid::with_servers(4).await;
        let maker = grid.node_maker(small());
        let a = maker.create_mutable_file(b"a", None).await.unwrap();
        let b = maker.create_mutable_file(b"b", None).await.unwrap();
        let write = a.capability().to_string();
        let read = b.capability().read_only().unwrap().to_string();
        assert!(maker.create_from_capability(Some(&write), Some(&read)).is_unknown());

        // a broken read cap next to a good write cap is ignored
        let node = maker.create_from_capability(Some(&write), Some("URI:junk"));
        assert!(matches!(node, Node::MutableFile(_)));
        assert!(!node.is_readonly());
    }

    #[tokio::test]
    async fn test_mutable_file_versions() {
        let grid = TestGrid::with_servers(4).await;
        let maker = grid.node_maker(small());
        let file = maker.create_mutable_file(b"version one", None).await.unwrap();
        let version = file.read_version().await.unwrap();
        assert_eq!(version.seqnum, 1);
        assert_eq!(version.contents, b"version one");

        assert_eq!(file.overwrite(b"version two").await.unwrap(), 2);
        let write_uri = file.capability().to_string();
        let read_uri = file.capability().read_only().unwrap().to_string();

        let writer = maker.create_from_capability(Some(&write_uri), None);
        assert_eq!(writer.read().await.unwrap(), b"version two");

        let reader = maker.create_from_capability(None, Some(&read_uri));
        assert!(reader.is_readonly());
        assert_eq!(reader.read().await.unwrap(), b"version two");
        let Node::MutableFile(reader) = reader else {
            panic!("expected a mutable file");
        };
        assert!(matches!(reader.overwrite(b"nope").await, Err(GridError::NotWriteable)));

        let Node::MutableFile(writer) = writer else {
            panic!("expected a mutable file");
        };
        assert_eq!(writer.overwrite(b"version three").await.unwrap(), 3);
        assert_eq!(reader.read_version().await.unwrap().seqnum, 3);
    }

    #[tokio::test]
    async fn test_mutable_shares_need_the_write_enabler() {
        let grid = TestGrid::with_servers(4).await;
        let maker = grid.node_maker(small());
        let file = maker.create_mutable_file(b"mine", None).await.unwrap();
        let si = file.storage_index();
        let server = grid.server_ids().into_iter().next().unwrap();
        let client = grid.client_for(&server).unwrap();
        let held = client.list_shares(si).await.unwrap();
        let share_number = *held.iter().next().unwrap();

        let forged = crate::secret::WriteEnabler::derive(&[9u8; 32], &server);
        let result = client
            .store_mutable_share(
                si,
                share_number,
                b"garbage".to_vec(),
                forged,
                grid.secrets.bucket_renewal_secret(&si, &server),
                grid.secrets.bucket_cancel_secret(&si, &server),
            )
            .await;
        assert!(matches!(result, Err(GridError::Authorization { .. })));
        assert_eq!(file.read().await.unwrap(), b"mine");
    }

    #[tokio::test]
    async fn test_mutable_read_skips_corrupt_shares() {
        let grid = TestGrid::with_servers(4).await;
        let maker = grid.node_maker(small());
        let file = maker.create_mutable_file(b"authentic", None).await.unwrap();
        let si = file.storage_index();
        let writekey = file.write_cap().unwrap().writekey;

        let server = file.permuted_peer_list()[0].clone();
        let client = grid.client_for(&server).unwrap();
        let share_number = *client.list_shares(si).await.unwrap().iter().next().unwrap();
        client
            .store_mutable_share(
                si,
                share_number,
                b"{not a share".to_vec(),
                crate::secret::WriteEnabler::derive(&writekey, &server),
                grid.secrets.bucket_renewal_secret(&si, &server),
                grid.secrets.bucket_cancel_secret(&si, &server),
            )
            .await
            .unwrap();

        assert_eq!(file.read().await.unwrap(), b"authentic");
        // the next version repairs the damaged share in place
        assert_eq!(file.overwrite(b"repaired").await.unwrap(), 2);
        assert_eq!(file.read().await.unwrap(), b"repaired");
    }
}
