//! Cached entries
//!
//! One `Node` per path currently observed: the last metadata seen, the
//! validity flags, and either file bytes or an ordered children map.
//! Every node carries its own async mutex; callers hold it for every
//! operation here except the consuming `get_data`/`put_data`, which
//! release it before moving bytes.
//!
//! Validity flags:
//! - `meta_ok`  - cached metadata is authoritative
//! - `data_ok`  - content (listing or bytes) matches the metadata
//! - `dirty`    - local changes not yet pushed to the remote
//! - `gone`     - tombstone: the remote reported not-exist

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, trace};

use zxc_core::{Dir, EntryKind, FsError};

use crate::remote::{byte_stream, ByteSink, ByteStream, Remote};
use crate::STREAM_CHUNK;

/// One cached entry. Share as `Arc<Node>`; all mutable state lives
/// behind the node's own lock.
pub struct Node {
    name: String,
    path: String,
    state: Arc<Mutex<NodeState>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").field("path", &self.path).finish()
    }
}

pub(crate) struct NodeState {
    dir: Dir,
    meta_ok: bool,
    data_ok: bool,
    dirty: bool,
    gone: bool,
    /// Content was populated at least once; stale fallback is allowed.
    loaded: bool,
    content: Content,
}

enum Content {
    Empty,
    Bytes(Vec<u8>),
    Children(BTreeMap<String, Arc<Node>>),
}

fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

impl NodeState {
    /// Accept metadata from the remote. A type or size change means the
    /// cached content no longer matches.
    fn accept_meta(&mut self, node_path: &str, node_name: &str, mut d: Dir) {
        d.set("name", node_name);
        d.set("path", node_path);
        d.rewrite_addr();
        if d.uget("type") != self.dir.uget("type") || d.uget("size") != self.dir.uget("size") {
            self.data_ok = false;
        }
        self.dir = d;
        self.meta_ok = true;
    }
}

impl Node {
    fn build(name: String, path: String, dir: Dir, dirty: bool, content: Content) -> Arc<Node> {
        let loaded = !matches!(content, Content::Empty);
        Arc::new(Node {
            name,
            path,
            state: Arc::new(Mutex::new(NodeState {
                dir,
                meta_ok: true,
                data_ok: loaded,
                dirty,
                gone: false,
                loaded,
                content,
            })),
        })
    }

    /// A node seen in a remote stat or listing: metadata only.
    pub(crate) fn from_meta(parent: &str, mut d: Dir) -> Arc<Node> {
        let name = d.name().to_string();
        let path = child_path(parent, &name);
        d.set("path", path.clone());
        d.rewrite_addr();
        Node::build(name, path, d, false, Content::Empty)
    }

    /// The cache root, from the remote's root stat.
    pub(crate) fn root(mut d: Dir) -> Arc<Node> {
        d.set("name", "/");
        d.set("path", "/");
        d.rewrite_addr();
        Node::build("/".into(), "/".into(), d, false, Content::Empty)
    }

    /// A synthetic entry (the `/Ctl` sentinel): always valid, never dirty.
    pub(crate) fn synthetic(d: Dir) -> Arc<Node> {
        let name = d.name().to_string();
        let path = d.path().to_string();
        Node::build(name, path, d, false, Content::Bytes(Vec::new()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Acquire this node's lock.
    pub async fn lock(self: &Arc<Node>) -> LockedNode {
        let state = self.state.clone().lock_owned().await;
        LockedNode {
            node: self.clone(),
            state,
        }
    }
}

/// A node with its lock held. Dropping it releases the lock.
pub struct LockedNode {
    node: Arc<Node>,
    state: OwnedMutexGuard<NodeState>,
}

impl std::fmt::Debug for LockedNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedNode")
            .field("path", &self.node.path)
            .finish()
    }
}

impl LockedNode {
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn path(&self) -> &str {
        self.node.path()
    }

    pub fn name(&self) -> &str {
        self.node.name()
    }

    pub fn dir(&self) -> &Dir {
        &self.state.dir
    }

    pub fn meta_ok(&self) -> bool {
        self.state.meta_ok
    }

    pub fn data_ok(&self) -> bool {
        self.state.data_ok
    }

    pub fn is_del(&self) -> bool {
        self.state.gone
    }

    pub fn is_dirty(&self) -> bool {
        self.state.dirty
    }

    /// Is there older content to fall back on while the remote is away?
    pub fn old_data_ok(&self) -> bool {
        self.state.loaded
    }

    /// Tombstone this node: the remote says it does not exist.
    pub(crate) fn set_gone(&mut self) {
        trace!("tombstone {}", self.path());
        self.state.gone = true;
    }

    /// Accept metadata from a remote stat.
    pub(crate) fn got_meta(&mut self, d: Dir) {
        let (path, name) = (self.node.path.clone(), self.node.name.clone());
        self.state.accept_meta(&path, &name, d);
    }

    /// Accept a remote directory listing, reconciling children by name.
    ///
    /// Surviving children keep their identity; children missing from
    /// the listing are tombstoned and collected; new names get fresh
    /// metadata-only nodes. Local edits win: dirty children keep their
    /// metadata and are never collected, and locally removed ones are
    /// not resurrected.
    pub(crate) async fn got_dir(&mut self, ds: Vec<Dir>) {
        let mut old = match std::mem::replace(&mut self.state.content, Content::Empty) {
            Content::Children(m) => m,
            _ => BTreeMap::new(),
        };
        let mut children = BTreeMap::new();
        for d in ds {
            let name = d.name().to_string();
            if name.is_empty() {
                continue;
            }
            match old.remove(&name) {
                Some(child) => {
                    let mut cs = child.state.lock().await;
                    if !cs.dirty && !cs.gone {
                        let (cp, cn) = (child.path.clone(), child.name.clone());
                        cs.accept_meta(&cp, &cn, d);
                    }
                    drop(cs);
                    children.insert(name, child);
                }
                None => {
                    let child = Node::from_meta(self.path(), d);
                    children.insert(name, child);
                }
            }
        }
        // Names the remote no longer lists: keep local edits, tombstone
        // the rest so stragglers holding them see not-exist.
        for (name, child) in old {
            let mut cs = child.state.lock().await;
            if cs.dirty {
                drop(cs);
                children.insert(name, child);
            } else {
                cs.gone = true;
            }
        }
        self.state.content = Content::Children(children);
        self.state.data_ok = true;
        self.state.loaded = true;
    }

    /// Consume a remote byte stream into the content buffer. An error
    /// before EOF leaves `data_ok` clear.
    pub(crate) async fn got_data(&mut self, mut stream: ByteStream) -> Result<(), FsError> {
        let mut buf = Vec::new();
        while let Some(chunk) = stream.recv().await {
            buf.extend_from_slice(&chunk?);
        }
        self.state.dir.set_size(buf.len() as u64);
        self.state.content = Content::Bytes(buf);
        self.state.data_ok = true;
        self.state.loaded = true;
        Ok(())
    }

    /// Apply a metadata delta. Identity keys (`name`, `path`, `type`,
    /// `addr`) never change through wstat; a `size` resizes loaded file
    /// content.
    pub(crate) fn wstat(&mut self, nd: &Dir) -> Result<(), FsError> {
        for (key, val) in nd.iter() {
            match key {
                "name" | "path" | "type" | "addr" => {}
                "size" => {
                    let size: usize = val
                        .parse()
                        .map_err(|_| FsError::BadCtl(format!("size {:?}", val)))?;
                    if let Content::Bytes(b) = &mut self.state.content {
                        b.resize(size, 0);
                    }
                    self.state.dir.set_size(size as u64);
                }
                _ => self.state.dir.set(key, val),
            }
        }
        self.state.dirty = true;
        Ok(())
    }

    /// Child by name. Tombstoned children report not-exist so that a
    /// create can replace them before the deletion is synced.
    pub(crate) async fn walk1(&self, name: &str) -> Result<Arc<Node>, FsError> {
        let cp = child_path(self.path(), name);
        let children = match &self.state.content {
            Content::Children(m) => m,
            _ => return Err(FsError::NotDir(self.path().to_string())),
        };
        match children.get(name) {
            Some(child) => {
                if child.state.lock().await.gone {
                    Err(FsError::NotExist(cp))
                } else {
                    Ok(child.clone())
                }
            }
            None => Err(FsError::NotExist(cp)),
        }
    }

    /// Create a child with metadata `d`, dirty, returned locked.
    pub(crate) async fn new_file(&mut self, mut d: Dir) -> Result<LockedNode, FsError> {
        let name = d.name().to_string();
        if name.is_empty() || name.contains('/') {
            return Err(FsError::BadPath(name));
        }
        let kind = d
            .kind()
            .ok_or_else(|| FsError::BadPath(child_path(self.path(), &name)))?;
        let cp = child_path(self.path(), &name);
        d.set("path", cp.clone());
        d.rewrite_addr();
        let content = match kind {
            EntryKind::Dir => Content::Children(BTreeMap::new()),
            EntryKind::File | EntryKind::Ctl => Content::Bytes(Vec::new()),
        };
        let child = Node::build(name.clone(), cp, d, true, content);
        match &mut self.state.content {
            Content::Children(m) => {
                m.insert(name, child.clone());
            }
            _ => return Err(FsError::NotDir(self.path().to_string())),
        }
        debug!("new file {}", child.path());
        Ok(child.lock().await)
    }

    /// Stream file bytes to `sink`, releasing the lock first.
    pub async fn get_data(self, off: i64, count: i64, sink: &ByteSink) -> Result<(), FsError> {
        let bytes = match &self.state.content {
            Content::Bytes(b) => {
                let len = b.len();
                let start = off.clamp(0, len as i64) as usize;
                let avail = len - start;
                let n = if count < 0 {
                    avail
                } else {
                    avail.min(count as usize)
                };
                b[start..start + n].to_vec()
            }
            _ => return Err(FsError::IsDir(self.path().to_string())),
        };
        drop(self);
        for chunk in bytes.chunks(STREAM_CHUNK) {
            if sink.send(Ok(chunk.to_vec())).await.is_err() {
                // consumer went away
                return Ok(());
            }
        }
        Ok(())
    }

    /// Write bytes at `off` (negative appends), releasing the lock
    /// while the stream drains. Updates size, stamps `mtime` (the
    /// caller's time when given, else now), marks dirty, and returns
    /// the resulting metadata.
    pub(crate) async fn put_data(
        self,
        off: i64,
        data: Option<ByteStream>,
        umtime: Option<u64>,
    ) -> Result<Dir, FsError> {
        let node = self.node.clone();
        drop(self);
        let buf = match data {
            Some(stream) => crate::remote::collect(stream).await?,
            None => Vec::new(),
        };
        let mut f = node.lock().await;
        let path = f.path().to_string();
        let bytes = match &mut f.state.content {
            Content::Bytes(b) => b,
            _ => return Err(FsError::IsDir(path)),
        };
        let start = if off < 0 { bytes.len() } else { off as usize };
        let end = start + buf.len();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(&buf);
        let size = bytes.len() as u64;
        f.state.dir.set_size(size);
        match umtime {
            Some(t) => f.state.dir.set_mtime(t),
            None => f.state.dir.set_mtime_now(),
        }
        f.state.dirty = true;
        Ok(f.state.dir.clone())
    }

    /// Names in the cached listing, tombstones excluded, name order.
    pub(crate) async fn dir_entries(&self) -> Result<Vec<Dir>, FsError> {
        let children = match &self.state.content {
            Content::Children(m) => m,
            _ => return Err(FsError::NotDir(self.path().to_string())),
        };
        let mut ds = Vec::with_capacity(children.len());
        for child in children.values() {
            let cs = child.state.lock().await;
            if !cs.gone {
                ds.push(cs.dir.clone());
            }
        }
        Ok(ds)
    }

    /// Snapshot of the child nodes, tombstones included.
    pub(crate) fn children(&self) -> Vec<Arc<Node>> {
        match &self.state.content {
            Content::Children(m) => m.values().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Mark this entry removed. Directories must be empty unless `all`.
    pub(crate) async fn remove(&mut self, all: bool) -> Result<(), FsError> {
        if self.dir().is_dir() && !all {
            if let Content::Children(m) = &self.state.content {
                for child in m.values() {
                    if !child.state.lock().await.gone {
                        return Err(FsError::NotEmpty(self.path().to_string()));
                    }
                }
            }
        }
        self.state.gone = true;
        self.state.dirty = true;
        Ok(())
    }

    /// Drop validity: the next walk re-fetches from the remote.
    pub(crate) fn inval(&mut self) {
        self.state.meta_ok = false;
        self.state.data_ok = false;
    }
}

/// Push one node's local state to the remote and clear its dirty bit.
///
/// Tombstones become removals; directories push metadata; files push
/// metadata plus content. Capabilities the remote lacks are skipped -
/// the local state simply stays ahead.
pub(crate) async fn sync(node: &Arc<Node>, remote: &Arc<dyn Remote>) -> Result<(), FsError> {
    let mut f = node.lock().await;
    if !f.state.dirty {
        return Ok(());
    }
    let path = node.path().to_string();
    if f.state.gone {
        if remote.supports_remove() {
            match remote.remove_all(&path).await {
                Ok(()) | Err(FsError::NotExist(_)) => {}
                Err(e) => return Err(e),
            }
        }
        f.state.dirty = false;
        debug!("synced removal of {}", path);
        return Ok(());
    }
    let d = f.state.dir.clone();
    match &f.state.content {
        Content::Children(_) => {
            if remote.supports_put() {
                remote.put(&path, &d, 0, None).await?;
            }
        }
        Content::Bytes(b) => {
            if remote.supports_put() {
                remote.put(&path, &d, 0, Some(byte_stream(b.clone()))).await?;
            }
        }
        Content::Empty => {
            if remote.supports_wstat() {
                remote.wstat(&path, &d).await?;
            }
        }
    }
    f.state.dirty = false;
    debug!("synced {}", path);
    Ok(())
}
