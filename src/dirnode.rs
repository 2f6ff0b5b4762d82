//! Directories: mutable files holding a JSON table of named children.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::capability::Capability;
use crate::error::{GridError, Result};
use crate::filenode::{ImmutableFileNode, MutableFileNode};
use crate::hashutil::StorageIndex;
use crate::nodemaker::{note_unknown, Node, NodeMaker};

/// One child as stored in the directory's table.
///
/// The strings are kept exactly as written, even when this client cannot
/// parse them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rw_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ro_uri: Option<String>,
}

impl DirEntry {
    fn for_node(node: &Node) -> Self {
        DirEntry {
            rw_uri: node.write_uri(),
            ro_uri: node.read_uri(),
        }
    }
}

type ChildTable = BTreeMap<String, DirEntry>;

/// Handle for a directory.
///
/// A read-only directory lists its children as read-only nodes and refuses
/// every change with `NotWriteable`.
#[derive(Clone)]
pub struct DirectoryNode {
    file: MutableFileNode,
    maker: NodeMaker,
}

impl DirectoryNode {
    /// Contents of a directory with no children.
    pub(crate) const EMPTY: &'static [u8] = b"{}";

    pub fn new(file: MutableFileNode, maker: NodeMaker) -> Self {
        DirectoryNode { file, maker }
    }

    /// The mutable file that holds the child table.
    pub fn file(&self) -> &MutableFileNode {
        &self.file
    }

    pub fn is_readonly(&self) -> bool {
        self.file.is_readonly()
    }

    pub fn capability(&self) -> Capability {
        match self.file.write_cap() {
            Some(w) => Capability::DirectoryWrite(w.clone()),
            None => Capability::DirectoryRead(self.file.read_cap().clone()),
        }
    }

    pub fn storage_index(&self) -> StorageIndex {
        self.file.storage_index()
    }

    async fn read_table(&self) -> Result<ChildTable> {
        let data = self.file.read().await?;
        Ok(serde_json::from_slice(&data)?)
    }

    async fn write_table(&self, table: &ChildTable) -> Result<()> {
        self.file.overwrite(&serde_json::to_vec(table)?).await?;
        Ok(())
    }

    fn child(&self, name: &str, entry: &DirEntry) -> Node {
        // a read-only directory must not hand out write access
        let write = if self.is_readonly() { None } else { entry.rw_uri.as_deref() };
        let node = self.maker.create_from_capability(write, entry.ro_uri.as_deref());
        note_unknown(name, &node);
        node
    }

    /// The raw child table.
    pub async fn entries(&self) -> Result<BTreeMap<String, DirEntry>> {
        self.read_table().await
    }

    /// Every child, mapped to a handle. Children this client cannot use show
    /// up as [`Node::Unknown`] instead of failing the listing.
    pub async fn list(&self) -> Result<BTreeMap<String, Node>> {
        let table = self.read_table().await?;
        Ok(table
            .iter()
            .map(|(name, entry)| (name.clone(), self.child(name, entry)))
            .collect())
    }

    pub async fn get(&self, name: &str) -> Result<Option<Node>> {
        let table = self.read_table().await?;
        Ok(table.get(name).map(|entry| self.child(name, entry)))
    }

    /// Links a child by its capability strings, replacing any child of the
    /// same name. The strings are stored as given.
    pub async fn set_uri(&self, name: &str, write_uri: Option<&str>, read_uri: Option<&str>) -> Result<()> {
        if self.is_readonly() {
            return Err(GridError::NotWriteable);
        }
        let mut table = self.read_table().await?;
        table.insert(
            name.to_string(),
            DirEntry {
                rw_uri: write_uri.map(str::to_string),
                ro_uri: read_uri.map(str::to_string),
            },
        );
        debug!("linking {:?} in {}", name, self.storage_index());
        self.write_table(&table).await
    }

    pub async fn set_node(&self, name: &str, node: &Node) -> Result<()> {
        let entry = DirEntry::for_node(node);
        self.set_uri(name, entry.rw_uri.as_deref(), entry.ro_uri.as_deref())
            .await
    }

    /// Uploads `contents` as an immutable file and links it under `name`.
    pub async fn add_file(&self, name: &str, contents: &[u8]) -> Result<ImmutableFileNode> {
        if self.is_readonly() {
            return Err(GridError::NotWriteable);
        }
        let file = self.maker.upload(contents).await?;
        self.set_node(name, &Node::ImmutableFile(file.clone())).await?;
        Ok(file)
    }

    pub async fn create_subdirectory(&self, name: &str) -> Result<DirectoryNode> {
        if self.is_readonly() {
            return Err(GridError::NotWriteable);
        }
        let child = self.maker.create_new_mutable_directory().await?;
        self.set_node(name, &Node::Directory(child.clone())).await?;
        Ok(child)
    }

    /// Unlinks `name`. The child itself is untouched.
    ///
    /// # Returns
    ///
    /// Whether there was such a child.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        if self.is_readonly() {
            return Err(GridError::NotWriteable);
        }
        let mut table = self.read_table().await?;
        if table.remove(name).is_none() {
            return Ok(false);
        }
        self.write_table(&table).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::TestGrid;
    use crate::upload::EncodingParameters;

    async fn directory(grid: &TestGrid) -> (NodeMaker, DirectoryNode) {
        let maker = grid.node_maker(EncodingParameters::new(2, 3, 4, 512).unwrap());
        let dir = maker.create_new_mutable_directory().await.unwrap();
        (maker, dir)
    }

    #[tokio::test]
    async fn test_new_directory_is_empty() {
        let grid = TestGrid::with_servers(4).await;
        let (_, dir) = directory(&grid).await;
        assert!(dir.list().await.unwrap().is_empty());
        assert!(dir.get("missing").await.unwrap().is_none());
        assert!(matches!(dir.capability(), Capability::DirectoryWrite(_)));
    }

    #[tokio::test]
    async fn test_add_list_and_delete() {
        let grid = TestGrid::with_servers(4).await;
        let (_, dir) = directory(&grid).await;
        dir.add_file("readme", b"hello").await.unwrap();
        let sub = dir.create_subdirectory("docs").await.unwrap();
        sub.add_file("inner", b"nested").await.unwrap();

        let children = dir.list().await.unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children["readme"].read().await.unwrap(), b"hello");
        let docs = children["docs"].as_directory().unwrap();
        assert!(!docs.is_readonly());
        let inner = docs.get("inner").await.unwrap().unwrap();
        assert_eq!(inner.read().await.unwrap(), b"nested");

        assert!(dir.delete("readme").await.unwrap());
        assert!(!dir.delete("readme").await.unwrap());
        assert_eq!(dir.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_children_are_listed_and_preserved() {
        let grid = TestGrid::with_servers(4).await;
        let (_, dir) = directory(&grid).await;
        dir.set_uri("future", Some("URI:FUTURE-RW:xyz"), Some("URI:FUTURE-RO:xyz"))
            .await
            .unwrap();
        dir.add_file("known", b"plain").await.unwrap();

        let children = dir.list().await.unwrap();
        assert!(children["future"].is_unknown());
        assert!(matches!(
            children["future"].read().await,
            Err(GridError::MalformedCapability { .. })
        ));
        assert_eq!(children["known"].read().await.unwrap(), b"plain");

        // rewriting the table through another change keeps the unknown entry verbatim
        dir.delete("known").await.unwrap();
        let entries = dir.entries().await.unwrap();
        assert_eq!(
            entries["future"],
            DirEntry {
                rw_uri: Some("URI:FUTURE-RW:xyz".to_string()),
                ro_uri: Some("URI:FUTURE-RO:xyz".to_string()),
            }
        );

        // and relinking the unknown node under a new name copies both strings
        dir.set_node("copy", &children["future"]).await.unwrap();
        assert_eq!(dir.entries().await.unwrap()["copy"], entries["future"]);
    }

    #[tokio::test]
    async fn test_readonly_directory() {
        let grid = TestGrid::with_servers(4).await;
        let (maker, dir) = directory(&grid).await;
        let sub = dir.create_subdirectory("sub").await.unwrap();
        dir.add_file("file", b"x").await.unwrap();

        let read_uri = dir.capability().read_only().unwrap().to_string();
        let node = maker.create_from_capability(None, Some(&read_uri));
        let readonly = node.as_directory().unwrap();
        assert!(readonly.is_readonly());
        assert!(matches!(
            readonly.add_file("nope", b"y").await,
            Err(GridError::NotWriteable)
        ));
        assert!(matches!(readonly.delete("file").await, Err(GridError::NotWriteable)));

        // children of a read-only directory come back read-only
        let children = readonly.list().await.unwrap();
        assert!(children["sub"].is_readonly());
        assert_eq!(
            children["sub"].storage_index().unwrap(),
            sub.storage_index()
        );
    }
}
