//! Persisted state cache
//!
//! The LocalNode tree is shadowed on disk in a key-value table: the key is a
//! 32-bit row id assigned by the table, the value a versioned record for one
//! node. Writes happen in one transaction per reconciliation batch, so a
//! crash loses only work since the last commit; the post-load rescan
//! restores correctness.

use std::collections::HashMap;
use std::path::Path;

use bytes::{Buf, BufMut};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use cirrus_cloud::NodeHandle;
use cirrus_fs::{FileFingerprint, NodeKind};

use crate::errors::{Result, SyncError};
use crate::tree::{LnId, LocalNode, LocalTree};

/// Abstract table interface; blobs are opaque to the backend.
pub trait StateTable: Send {
    fn rewind(&mut self) -> Result<()>;
    fn next(&mut self) -> Result<Option<(u32, Vec<u8>)>>;
    fn get(&mut self, id: u32) -> Result<Option<Vec<u8>>>;
    /// Insert (id `None`, a fresh id is assigned) or update.
    fn put(&mut self, id: Option<u32>, blob: &[u8]) -> Result<u32>;
    fn del(&mut self, id: u32) -> Result<()>;
    fn truncate(&mut self) -> Result<()>;
    fn begin(&mut self) -> Result<()>;
    fn commit(&mut self) -> Result<()>;
    fn abort(&mut self) -> Result<()>;
}

pub struct SqliteStateTable {
    conn: Connection,
    cursor: Vec<(u32, Vec<u8>)>,
    in_transaction: bool,
}

impl SqliteStateTable {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS statecache (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                content BLOB NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn,
            cursor: Vec::new(),
            in_transaction: false,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS statecache (id INTEGER PRIMARY KEY AUTOINCREMENT, content BLOB NOT NULL);",
        )?;
        Ok(Self {
            conn,
            cursor: Vec::new(),
            in_transaction: false,
        })
    }
}

impl StateTable for SqliteStateTable {
    fn rewind(&mut self) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, content FROM statecache ORDER BY id")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)? as u32, row.get(1)?)))?;
        self.cursor = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        self.cursor.reverse();
        Ok(())
    }

    fn next(&mut self) -> Result<Option<(u32, Vec<u8>)>> {
        Ok(self.cursor.pop())
    }

    fn get(&mut self, id: u32) -> Result<Option<Vec<u8>>> {
        let blob = self
            .conn
            .query_row(
                "SELECT content FROM statecache WHERE id = ?1",
                params![id as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(blob)
    }

    fn put(&mut self, id: Option<u32>, blob: &[u8]) -> Result<u32> {
        match id {
            Some(id) => {
                self.conn.execute(
                    "INSERT INTO statecache (id, content) VALUES (?1, ?2)
                     ON CONFLICT(id) DO UPDATE SET content = excluded.content",
                    params![id as i64, blob],
                )?;
                Ok(id)
            }
            None => {
                self.conn.execute(
                    "INSERT INTO statecache (content) VALUES (?1)",
                    params![blob],
                )?;
                Ok(self.conn.last_insert_rowid() as u32)
            }
        }
    }

    fn del(&mut self, id: u32) -> Result<()> {
        self.conn
            .execute("DELETE FROM statecache WHERE id = ?1", params![id as i64])?;
        Ok(())
    }

    fn truncate(&mut self) -> Result<()> {
        self.conn.execute("DELETE FROM statecache", [])?;
        Ok(())
    }

    fn begin(&mut self) -> Result<()> {
        if !self.in_transaction {
            self.conn.execute_batch("BEGIN")?;
            self.in_transaction = true;
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if self.in_transaction {
            self.conn.execute_batch("COMMIT")?;
            self.in_transaction = false;
        }
        Ok(())
    }

    fn abort(&mut self) -> Result<()> {
        if self.in_transaction {
            self.conn.execute_batch("ROLLBACK")?;
            self.in_transaction = false;
        }
        Ok(())
    }
}

// --- record encoding ---

/// Record type tag.
const RECORD_TAG_NODE: u8 = 0x4e;
/// Major in the high half, minor in the low half. Unknown majors are
/// refused; minors may add trailing fields.
pub const STATE_RECORD_VERSION: u32 = 0x0001_0000;

#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub kind: NodeKind,
    /// Row id of the parent; 0 marks the sync root.
    pub parent_row: u32,
    pub fsid: u64,
    pub handle: NodeHandle,
    pub fingerprint: Option<FileFingerprint>,
    pub name: String,
    pub shortname: Option<String>,
}

pub fn encode_record(record: &NodeRecord) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64 + record.name.len());
    buf.put_u8(RECORD_TAG_NODE);
    buf.put_u32_le(STATE_RECORD_VERSION);
    buf.put_u8(match record.kind {
        NodeKind::File => 0,
        NodeKind::Folder => 1,
    });
    buf.put_u32_le(record.parent_row);
    buf.put_u64_le(record.fsid);
    buf.put_u64_le(record.handle.0);
    match record.fingerprint {
        None => buf.put_u8(0),
        Some(fp) => {
            buf.put_u8(1);
            buf.put_u64_le(fp.size);
            buf.put_i64_le(fp.mtime);
            for word in fp.crc {
                buf.put_u32_le(word);
            }
        }
    }
    buf.put_u16_le(record.name.len() as u16);
    buf.put_slice(record.name.as_bytes());
    match &record.shortname {
        None => buf.put_u16_le(u16::MAX),
        Some(s) => {
            buf.put_u16_le(s.len() as u16);
            buf.put_slice(s.as_bytes());
        }
    }
    buf
}

pub fn decode_record(blob: &[u8]) -> Result<NodeRecord> {
    let mut buf = blob;
    if buf.remaining() < 5 || buf.get_u8() != RECORD_TAG_NODE {
        return Err(SyncError::CorruptCacheRecord);
    }
    let version = buf.get_u32_le();
    if version >> 16 != STATE_RECORD_VERSION >> 16 {
        return Err(SyncError::UnsupportedCacheVersion(version));
    }
    if buf.remaining() < 1 + 4 + 8 + 8 + 1 {
        return Err(SyncError::CorruptCacheRecord);
    }
    let kind = match buf.get_u8() {
        0 => NodeKind::File,
        1 => NodeKind::Folder,
        _ => return Err(SyncError::CorruptCacheRecord),
    };
    let parent_row = buf.get_u32_le();
    let fsid = buf.get_u64_le();
    let handle = NodeHandle(buf.get_u64_le());
    let fingerprint = match buf.get_u8() {
        0 => None,
        1 => {
            if buf.remaining() < 8 + 8 + 16 {
                return Err(SyncError::CorruptCacheRecord);
            }
            let size = buf.get_u64_le();
            let mtime = buf.get_i64_le();
            let mut crc = [0u32; 4];
            for word in &mut crc {
                *word = buf.get_u32_le();
            }
            Some(FileFingerprint { size, mtime, crc })
        }
        _ => return Err(SyncError::CorruptCacheRecord),
    };
    let name = read_string(&mut buf)?.ok_or(SyncError::CorruptCacheRecord)?;
    let shortname = read_string(&mut buf)?;
    Ok(NodeRecord {
        kind,
        parent_row,
        fsid,
        handle,
        fingerprint,
        name,
        shortname,
    })
}

fn read_string(buf: &mut &[u8]) -> Result<Option<String>> {
    if buf.remaining() < 2 {
        return Err(SyncError::CorruptCacheRecord);
    }
    let len = buf.get_u16_le();
    if len == u16::MAX {
        return Ok(None);
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(SyncError::CorruptCacheRecord);
    }
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec())
        .map(Some)
        .map_err(|_| SyncError::CorruptCacheRecord)
}

pub fn record_for(tree: &LocalTree, id: LnId) -> NodeRecord {
    let node = tree.node(id);
    let parent_row = node
        .parent
        .and_then(|p| tree.node(p).row_id)
        .unwrap_or(0);
    NodeRecord {
        kind: node.kind,
        parent_row,
        fsid: node.synced_fsid,
        handle: node.synced_cloud_handle,
        fingerprint: node.fingerprint,
        name: node.name.clone(),
        shortname: node.slocalname.clone(),
    }
}

/// Depth of one attachment batch when rebuilding the tree.
const ATTACH_BATCH_DEPTH: u32 = 100;

/// Rebuild a LocalNode tree from a populated table.
///
/// Rows are read into a parent-row-indexed multimap, then attached
/// depth-first from the root, at most `ATTACH_BATCH_DEPTH` levels per
/// batch; nodes at the batch boundary seed the next batch, iterating until
/// the tree is complete, so per-batch work stays bounded on very deep
/// trees. Returns `None` for an empty table (fresh sync; the caller begins
/// with an initial scan). Corrupt or version-refused rows abandon the
/// cache entirely rather than load half a tree.
pub fn load_tree(table: &mut dyn StateTable, case_insensitive: bool) -> Result<Option<LocalTree>> {
    table.rewind()?;
    let mut by_parent: HashMap<u32, Vec<(u32, NodeRecord)>> = HashMap::new();
    let mut total = 0usize;
    while let Some((row_id, blob)) = table.next()? {
        let record = decode_record(&blob)?;
        by_parent.entry(record.parent_row).or_default().push((row_id, record));
        total += 1;
    }
    if total == 0 {
        return Ok(None);
    }

    let roots = by_parent.remove(&0).unwrap_or_default();
    if roots.len() != 1 {
        warn!("state cache has {} root rows; discarding", roots.len());
        return Err(SyncError::CorruptCacheRecord);
    }
    let (root_row, root_record) = roots.into_iter().next().unwrap();

    let mut tree = LocalTree::new(case_insensitive);
    {
        let root_id = tree.root();
        let root = tree.node_mut(root_id);
        root.row_id = Some(root_row);
        root.synced_fsid = root_record.fsid;
        root.synced_cloud_handle = root_record.handle;
    }

    // Depth-first attachment, at most ATTACH_BATCH_DEPTH levels per batch;
    // deeper rows wait for the next batch.
    let mut batch_roots = vec![(root_row, tree.root())];
    let mut attached = 1usize;
    while !batch_roots.is_empty() {
        let mut next_batch = Vec::new();
        let mut stack: Vec<(u32, LnId, u32)> = batch_roots
            .drain(..)
            .map(|(row, id)| (row, id, 0))
            .collect();
        while let Some((parent_row, parent_id, depth)) = stack.pop() {
            if depth >= ATTACH_BATCH_DEPTH {
                next_batch.push((parent_row, parent_id));
                continue;
            }
            let Some(children) = by_parent.remove(&parent_row) else {
                continue;
            };
            for (row_id, record) in children {
                if tree.child_by_name(parent_id, &record.name).is_some() {
                    warn!("duplicate cached sibling {:?}; discarding cache", record.name);
                    return Err(SyncError::CorruptCacheRecord);
                }
                let mut node = LocalNode::new(record.kind, record.name);
                node.row_id = Some(row_id);
                node.synced_fsid = record.fsid;
                node.synced_cloud_handle = record.handle;
                node.fingerprint = record.fingerprint;
                node.slocalname = record.shortname;
                let id = tree.add_child(parent_id, node);
                stack.push((row_id, id, depth + 1));
                attached += 1;
            }
        }
        batch_roots = next_batch;
    }

    if attached != total {
        // Orphan rows reference parents that no longer exist.
        warn!(
            "state cache had {} orphan rows of {}; discarding",
            total - attached,
            total
        );
        return Err(SyncError::CorruptCacheRecord);
    }

    info!("state cache loaded: {} nodes", attached);
    debug!("root row id {:?}", tree.node(tree.root()).row_id);
    Ok(Some(tree))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_fs::NodeKind;

    fn sample_record() -> NodeRecord {
        NodeRecord {
            kind: NodeKind::File,
            parent_row: 3,
            fsid: 77,
            handle: NodeHandle(0x1234),
            fingerprint: Some(FileFingerprint {
                size: 10,
                mtime: 1700000000,
                crc: [1, 2, 3, 4],
            }),
            name: "report.pdf".into(),
            shortname: Some("REPORT~1.PDF".into()),
        }
    }

    #[test]
    fn record_roundtrip() {
        let record = sample_record();
        let decoded = decode_record(&encode_record(&record)).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn unknown_major_version_is_refused() {
        let mut blob = encode_record(&sample_record());
        // bump the major half of the version
        blob[3] = 0x02;
        match decode_record(&blob) {
            Err(SyncError::UnsupportedCacheVersion(_)) => {}
            other => panic!("expected version refusal, got {:?}", other),
        }
    }

    #[test]
    fn table_assigns_and_reuses_ids() {
        let mut table = SqliteStateTable::open_in_memory().unwrap();
        let id = table.put(None, b"one").unwrap();
        assert!(table.get(id).unwrap().is_some());

        table.put(Some(id), b"two").unwrap();
        assert_eq!(table.get(id).unwrap().unwrap(), b"two");

        table.del(id).unwrap();
        assert!(table.get(id).unwrap().is_none());
    }

    #[test]
    fn abort_discards_uncommitted_rows() {
        let mut table = SqliteStateTable::open_in_memory().unwrap();
        table.begin().unwrap();
        let id = table.put(None, b"volatile").unwrap();
        table.abort().unwrap();
        assert!(table.get(id).unwrap().is_none());
    }

    #[test]
    fn load_rebuilds_nested_tree() {
        let mut table = SqliteStateTable::open_in_memory().unwrap();

        let root_row = table
            .put(
                None,
                &encode_record(&NodeRecord {
                    kind: NodeKind::Folder,
                    parent_row: 0,
                    fsid: 1,
                    handle: NodeHandle(100),
                    fingerprint: None,
                    name: "".into(),
                    shortname: None,
                }),
            )
            .unwrap();
        let folder_row = table
            .put(
                None,
                &encode_record(&NodeRecord {
                    kind: NodeKind::Folder,
                    parent_row: root_row,
                    fsid: 2,
                    handle: NodeHandle(101),
                    fingerprint: None,
                    name: "sub".into(),
                    shortname: None,
                }),
            )
            .unwrap();
        table
            .put(
                None,
                &encode_record(&NodeRecord {
                    kind: NodeKind::File,
                    parent_row: folder_row,
                    fsid: 3,
                    handle: NodeHandle(102),
                    fingerprint: Some(FileFingerprint {
                        size: 5,
                        mtime: 50,
                        crc: [9, 9, 9, 9],
                    }),
                    name: "leaf.txt".into(),
                    shortname: None,
                }),
            )
            .unwrap();

        let tree = load_tree(&mut table, false).unwrap().unwrap();
        assert_eq!(tree.len(), 3);
        let sub = tree.child_by_name(tree.root(), "sub").unwrap();
        let leaf = tree.child_by_name(sub, "leaf.txt").unwrap();
        assert_eq!(tree.node(leaf).synced_cloud_handle, NodeHandle(102));
        assert_eq!(tree.node(leaf).synced_fsid, 3);
    }

    #[test]
    fn empty_table_means_initial_scan() {
        let mut table = SqliteStateTable::open_in_memory().unwrap();
        assert!(load_tree(&mut table, false).unwrap().is_none());
    }

    #[test]
    fn chains_deeper_than_one_batch_load_fully() {
        let mut table = SqliteStateTable::open_in_memory().unwrap();

        let mut parent_row = table
            .put(
                None,
                &encode_record(&NodeRecord {
                    kind: NodeKind::Folder,
                    parent_row: 0,
                    fsid: 1,
                    handle: NodeHandle(100),
                    fingerprint: None,
                    name: "".into(),
                    shortname: None,
                }),
            )
            .unwrap();

        // A chain well past the per-batch depth cap.
        let depth = ATTACH_BATCH_DEPTH * 2 + 13;
        for level in 0..depth {
            parent_row = table
                .put(
                    None,
                    &encode_record(&NodeRecord {
                        kind: NodeKind::Folder,
                        parent_row,
                        fsid: 1000 + level as u64,
                        handle: NodeHandle(1000 + level as u64),
                        fingerprint: None,
                        name: format!("d{}", level),
                        shortname: None,
                    }),
                )
                .unwrap();
        }

        let tree = load_tree(&mut table, false).unwrap().unwrap();
        assert_eq!(tree.len(), depth as usize + 1);

        // The deepest node made it in with its identity intact.
        let mut current = tree.root();
        for level in 0..depth {
            current = tree.child_by_name(current, &format!("d{}", level)).unwrap();
        }
        assert_eq!(
            tree.node(current).synced_cloud_handle,
            NodeHandle(1000 + depth as u64 - 1)
        );
    }

    #[test]
    fn orphan_rows_discard_cache() {
        let mut table = SqliteStateTable::open_in_memory().unwrap();
        table
            .put(
                None,
                &encode_record(&NodeRecord {
                    kind: NodeKind::Folder,
                    parent_row: 0,
                    fsid: 1,
                    handle: NodeHandle(100),
                    fingerprint: None,
                    name: "".into(),
                    shortname: None,
                }),
            )
            .unwrap();
        table
            .put(
                None,
                &encode_record(&NodeRecord {
                    kind: NodeKind::File,
                    parent_row: 999,
                    fsid: 2,
                    handle: NodeHandle(101),
                    fingerprint: None,
                    name: "orphan".into(),
                    shortname: None,
                }),
            )
            .unwrap();
        assert!(load_tree(&mut table, false).is_err());
    }
}
