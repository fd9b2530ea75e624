//! Sync rows
//!
//! The reconciliation unit: one name's view across the cloud, the
//! last-synced state, and the live filesystem. Rows are computed per folder
//! by grouping the three child sets under cloud-normalized name keys;
//! same-side duplicates become clash lists on the row, never extra rows.

use std::collections::BTreeMap;

use cirrus_cloud::CloudNode;
use cirrus_fs::FsNode;

use crate::name::normalized_key;
use crate::tree::{LnId, LocalTree};

/// C(cloud) S(synced) F(filesystem): presence of each triplet element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowType {
    /// Nothing anywhere; a programming error.
    Xxx,
    /// New locally.
    Xxf,
    /// Deleted on both sides.
    Xsx,
    /// Cloud side disappeared.
    Xsf,
    /// New remotely.
    Cxx,
    /// Appeared on both sides, never synced.
    Cxf,
    /// Local side disappeared.
    Csx,
    /// Present everywhere.
    Csf,
}

#[derive(Debug, Default)]
pub struct SyncRow {
    pub cloud: Option<CloudNode>,
    pub node: Option<LnId>,
    pub fs: Option<FsNode>,
    /// All cloud entries under this key when more than one collides; the
    /// plain `cloud` slot is empty in that case.
    pub cloud_clashes: Vec<CloudNode>,
    /// Likewise for filesystem entries.
    pub fs_clashes: Vec<FsNode>,
    pub item_processed: bool,
    pub suppress_recursion: bool,
}

impl SyncRow {
    pub fn row_type(&self) -> RowType {
        match (
            self.cloud.is_some(),
            self.node.is_some(),
            self.fs.is_some(),
        ) {
            (false, false, false) => RowType::Xxx,
            (false, false, true) => RowType::Xxf,
            (false, true, false) => RowType::Xsx,
            (false, true, true) => RowType::Xsf,
            (true, false, false) => RowType::Cxx,
            (true, false, true) => RowType::Cxf,
            (true, true, false) => RowType::Csx,
            (true, true, true) => RowType::Csf,
        }
    }

    pub fn has_clashes(&self) -> bool {
        !self.cloud_clashes.is_empty() || !self.fs_clashes.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.cloud.is_none()
            && self.node.is_none()
            && self.fs.is_none()
            && !self.has_clashes()
    }

    /// Display name for logging, preferring the side that exists.
    pub fn name<'a>(&'a self, tree: &'a LocalTree) -> &'a str {
        if let Some(fs) = &self.fs {
            return &fs.name;
        }
        if let Some(id) = self.node {
            return &tree.node(id).name;
        }
        if let Some(cloud) = &self.cloud {
            return &cloud.name;
        }
        if let Some(fs) = self.fs_clashes.first() {
            return &fs.name;
        }
        if let Some(cloud) = self.cloud_clashes.first() {
            return &cloud.name;
        }
        ""
    }
}

/// Join the three child sets of one folder under normalized name keys.
/// The result is ordered by key, so one pass handles chained renames
/// (`a -> b`, `b -> c`) deterministically.
pub fn compute_triplets(
    cloud_children: Vec<CloudNode>,
    tree: &LocalTree,
    folder: LnId,
    fs_children: Vec<FsNode>,
) -> Vec<SyncRow> {
    let case_insensitive = tree.case_insensitive();
    let mut rows: BTreeMap<String, SyncRow> = BTreeMap::new();

    for (key, node_id) in &tree.node(folder).children {
        rows.entry(key.clone()).or_default().node = Some(*node_id);
    }

    for cloud_node in cloud_children {
        let key = normalized_key(&cloud_node.name, case_insensitive);
        let row = rows.entry(key).or_default();
        if row.cloud.is_none() && row.cloud_clashes.is_empty() {
            row.cloud = Some(cloud_node);
        } else {
            // second entry under this key: demote the first into the clash
            // list too, the row no longer has a usable cloud side
            if let Some(first) = row.cloud.take() {
                row.cloud_clashes.push(first);
            }
            row.cloud_clashes.push(cloud_node);
        }
    }

    for fs_node in fs_children {
        let key = normalized_key(&fs_node.cloud_name, case_insensitive);
        let row = rows.entry(key).or_default();
        if row.fs.is_none() && row.fs_clashes.is_empty() {
            row.fs = Some(fs_node);
        } else {
            if let Some(first) = row.fs.take() {
                row.fs_clashes.push(first);
            }
            row.fs_clashes.push(fs_node);
        }
    }

    rows.into_values().filter(|row| !row.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_cloud::NodeHandle;
    use cirrus_fs::NodeKind;
    use crate::tree::LocalNode;

    fn cloud_node(name: &str, handle: u64) -> CloudNode {
        CloudNode {
            handle: NodeHandle(handle),
            parent: NodeHandle(1),
            kind: NodeKind::File,
            name: name.into(),
            fingerprint: None,
            owner_user: 1,
            in_share: false,
            has_pending_changes: false,
        }
    }

    fn fs_node(name: &str, fsid: u64) -> FsNode {
        FsNode {
            name: name.into(),
            cloud_name: name.into(),
            fsid,
            kind: NodeKind::File,
            size: 1,
            mtime: 1,
            fingerprint: None,
            is_symlink: false,
            is_blocked: false,
            shortname: None,
        }
    }

    #[test]
    fn groups_all_three_sides_by_name() {
        let mut tree = LocalTree::new(false);
        let root = tree.root();
        tree.add_child(root, LocalNode::new(NodeKind::File, "b.txt"));

        let rows = compute_triplets(
            vec![cloud_node("a.txt", 10), cloud_node("b.txt", 11)],
            &tree,
            root,
            vec![fs_node("b.txt", 5), fs_node("c.txt", 6)],
        );

        assert_eq!(rows.len(), 3);
        let a = &rows[0];
        assert_eq!(a.row_type(), RowType::Cxx);
        let b = &rows[1];
        assert_eq!(b.row_type(), RowType::Csf);
        let c = &rows[2];
        assert_eq!(c.row_type(), RowType::Xxf);
    }

    #[test]
    fn case_insensitive_same_key_is_one_row() {
        let tree = LocalTree::new(true);
        let root = tree.root();
        let rows = compute_triplets(
            vec![cloud_node("Readme.MD", 10)],
            &tree,
            root,
            vec![fs_node("readme.md", 5)],
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].row_type(), RowType::Cxf);
    }

    #[test]
    fn same_side_duplicates_become_clashes() {
        let tree = LocalTree::new(true);
        let root = tree.root();
        let rows = compute_triplets(
            Vec::new(),
            &tree,
            root,
            vec![fs_node("Cover.jpg", 5), fs_node("cover.JPG", 6)],
        );
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert!(row.fs.is_none());
        assert_eq!(row.fs_clashes.len(), 2);
        assert!(row.has_clashes());
    }

    #[test]
    fn rows_are_sorted_by_key() {
        let tree = LocalTree::new(false);
        let root = tree.root();
        let rows = compute_triplets(
            Vec::new(),
            &tree,
            root,
            vec![fs_node("zeta", 1), fs_node("alpha", 2), fs_node("mid", 3)],
        );
        let names: Vec<_> = rows.iter().map(|r| r.fs.as_ref().unwrap().name.clone()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }
}
