//! Cache store
//!
//! Holds the root of the node tree and implements the two bulk
//! operations: recursive invalidation and a depth-first flush of every
//! dirty node. The root node is installed once from the remote's root
//! stat and is never collected.

use std::sync::Arc;

use tracing::{debug, warn};

use zxc_core::{Dir, FsError};

use crate::node::{self, Node};
use crate::remote::Remote;

/// Root holder for the cached tree. Cheap to clone; all clones share
/// the same nodes.
#[derive(Clone)]
pub struct Cache {
    root: Arc<Node>,
}

impl Cache {
    /// Install the root node from a remote stat of `/`.
    pub fn new(root_dir: Dir) -> Cache {
        Cache {
            root: Node::root(root_dir),
        }
    }

    pub fn root(&self) -> Arc<Node> {
        self.root.clone()
    }

    /// Clear `meta_ok`/`data_ok` across the whole tree. Nodes keep
    /// their identity and content; the next walk re-fetches.
    pub async fn inval(&self) {
        debug!("invalidating cache");
        let mut pending = vec![self.root.clone()];
        while let Some(n) = pending.pop() {
            let mut f = n.lock().await;
            f.inval();
            pending.extend(f.children());
        }
    }

    /// Depth-first walk flushing every dirty node, parents first so
    /// creations exist upstream before their content and children.
    pub async fn sync(&self, remote: &Arc<dyn Remote>) -> Result<(), FsError> {
        let mut pending = vec![self.root.clone()];
        while let Some(n) = pending.pop() {
            if let Err(e) = node::sync(&n, remote).await {
                warn!("sync {}: {}", n.path(), e);
                return Err(e);
            }
            let f = n.lock().await;
            if !f.is_del() {
                pending.extend(f.children());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testfs::MemRemote;
    use zxc_core::EntryKind;

    fn meta(name: &str, kind: &str) -> Dir {
        Dir::from_iter([
            ("name", name),
            ("type", kind),
            ("mode", "0644"),
            ("size", "0"),
            ("uid", "ana"),
            ("gid", "ana"),
        ])
    }

    fn root_dir() -> Dir {
        let mut d = meta("/", "d");
        d.set("mode", "0755");
        d
    }

    #[tokio::test]
    async fn test_inval_clears_whole_tree() {
        let cache = Cache::new(root_dir());
        let root = cache.root();
        let mut f = root.lock().await;
        f.got_dir(vec![meta("a", "d"), meta("b", "-")]).await;
        let a = f.walk1("a").await.unwrap();
        a.lock().await.got_dir(vec![meta("x", "-")]).await;
        drop(f);

        cache.inval().await;

        for n in [root.clone(), a.clone()] {
            let f = n.lock().await;
            assert!(!f.meta_ok());
            assert!(!f.data_ok());
            assert!(f.old_data_ok());
        }
    }

    #[tokio::test]
    async fn test_sync_flushes_dirty_subtree() {
        let remote = MemRemote::shared();
        let cache = Cache::new(root_dir());
        let root = cache.root();

        // Create /d and /d/f locally, then flush.
        let mut f = root.lock().await;
        f.got_dir(Vec::new()).await;
        let mut nd = f.new_file(meta("d", "d")).await.unwrap();
        drop(f);
        let nf = nd.new_file(meta("f", "-")).await.unwrap();
        drop(nd);
        nf.put_data(0, Some(crate::remote::byte_stream(b"hi".to_vec())), None)
            .await
            .unwrap();

        let r: Arc<dyn Remote> = remote.clone();
        cache.sync(&r).await.unwrap();

        let got = remote.stat("/d/f").await.unwrap();
        assert_eq!(got.kind(), Some(EntryKind::File));
        assert_eq!(got.size(), 2);
        assert!(remote.stat("/d").await.unwrap().is_dir());

        // Nothing dirty remains.
        let f = root.lock().await;
        let d = f.walk1("d").await.unwrap();
        assert!(!d.lock().await.is_dirty());
    }

    #[tokio::test]
    async fn test_sync_pushes_removals() {
        let remote = MemRemote::shared();
        remote.add_dir("/d");
        remote.add_file("/d/f", b"x");

        let cache = Cache::new(root_dir());
        let root = cache.root();
        let mut f = root.lock().await;
        f.got_dir(remote.get_dir("/").await.unwrap()).await;
        let d = f.walk1("d").await.unwrap();
        drop(f);
        let mut fd = d.lock().await;
        fd.got_dir(remote.get_dir("/d").await.unwrap()).await;
        fd.remove(true).await.unwrap();
        drop(fd);

        let r: Arc<dyn Remote> = remote.clone();
        cache.sync(&r).await.unwrap();
        assert!(remote.stat("/d").await.unwrap_err().is_not_exist());
        assert!(remote.stat("/d/f").await.unwrap_err().is_not_exist());
    }
}
