//! Path resolution
//!
//! Walks resolve a path element by element from the root, locking
//! parent before child and releasing the parent as they descend, so a
//! walk holds exactly one node lock at any instant. Metadata and
//! directory data missing from the cache are fetched from the remote
//! under the node's lock.
//!
//! The walk mode decides the checks and fetches applied along the way
//! and at the terminal, and whether a missing terminal is an error
//! (plain walks), means "return the parent" (creation and link walks),
//! or is synthesized on the spot (`CreatAll` intermediate elements).

use tracing::trace;

use zxc_core::{AuthInfo, Dir, FsError, ALL};

use crate::fs::FsInner;
use crate::node::LockedNode;

/// Why a path is being walked; drives per-mode checks and fetches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkMode {
    Stat,
    Get,
    Put,
    Del,
    Creat,
    Link,
    CreatAll,
}

impl FsInner {
    /// Refresh a node's metadata from the remote.
    ///
    /// An I/O failure with redial enabled keeps the old metadata and
    /// signals the syncer; not-exist tombstones the node.
    pub(crate) async fn get_meta(&self, f: &mut LockedNode) -> Result<(), FsError> {
        match self.remote.stat(f.path()).await {
            Ok(d) => {
                f.got_meta(d);
                Ok(())
            }
            Err(e) if e.is_io() && self.redial_ok => {
                // have old meta; use that
                self.need_redial();
                Ok(())
            }
            Err(e) => {
                if e.is_not_exist() {
                    f.set_gone();
                }
                Err(e)
            }
        }
    }

    /// Load a directory's listing from the remote.
    pub(crate) async fn get_dir_data(&self, f: &mut LockedNode) -> Result<(), FsError> {
        match self.remote.get_dir(f.path()).await {
            Ok(ds) => {
                f.got_dir(ds).await;
                Ok(())
            }
            Err(e) if e.is_io() && self.redial_ok && f.old_data_ok() => {
                // use the old listing
                self.need_redial();
                Ok(())
            }
            Err(e) => {
                if e.is_not_exist() {
                    f.set_gone();
                }
                Err(e)
            }
        }
    }

    /// Load a file's bytes from the remote.
    pub(crate) async fn get_file_data(&self, f: &mut LockedNode) -> Result<(), FsError> {
        let res = match self.remote.get(f.path(), 0, ALL).await {
            Ok(stream) => f.got_data(stream).await,
            Err(e) => Err(e),
        };
        match res {
            Err(e) if e.is_io() && self.redial_ok && f.old_data_ok() => {
                // use the old bytes
                self.need_redial();
                Ok(())
            }
            other => other,
        }
    }

    /// Resolve `els` from the root; on success the terminal node comes
    /// back locked. `nd` is the client template for `CreatAll`.
    pub(crate) async fn walk(
        &self,
        why: WalkMode,
        ai: Option<&AuthInfo>,
        nd: Option<&Dir>,
        els: &[String],
    ) -> Result<LockedNode, FsError> {
        let mut f = self.cache.root().lock().await;
        let mut els = els;
        loop {
            trace!("walk {:?} {}", why, f.path());
            if !f.meta_ok() {
                self.get_meta(&mut f).await.map_err(|e| e.at(f.path()))?;
            }
            if f.is_del() {
                return Err(FsError::NotExist(f.path().to_string()));
            }
            if els.is_empty() {
                return self.walk_terminal(why, ai, f).await;
            }
            if !f.dir().is_dir() {
                return Err(FsError::NotDir(f.path().to_string()));
            }
            if self.perms_on() && !f.dir().can_walk(ai) {
                return Err(FsError::Perm(f.path().to_string()));
            }
            if !f.data_ok() {
                self.get_dir_data(&mut f).await.map_err(|e| e.at(f.path()))?;
            }
            if els.len() == 1 {
                match why {
                    WalkMode::Stat => {
                        if self.perms_on() && !f.dir().can_get(ai) {
                            return Err(FsError::Perm(f.path().to_string()));
                        }
                    }
                    WalkMode::Del | WalkMode::Creat | WalkMode::CreatAll | WalkMode::Link => {
                        if self.perms_on() && !f.dir().can_put(ai) {
                            return Err(FsError::Perm(f.path().to_string()));
                        }
                    }
                    _ => {}
                }
            }
            match f.walk1(&els[0]).await {
                Ok(child) => {
                    drop(f);
                    f = child.lock().await;
                    els = &els[1..];
                }
                Err(e) if e.is_not_exist() => {
                    if why == WalkMode::CreatAll && els.len() > 1 {
                        let child = self.mkdir_step(&mut f, ai, nd, &els[0]).await?;
                        drop(f);
                        f = child;
                        els = &els[1..];
                        continue;
                    }
                    if els.len() == 1
                        && matches!(why, WalkMode::Creat | WalkMode::CreatAll | WalkMode::Link)
                    {
                        // The caller completes the creation in the parent.
                        return Ok(f);
                    }
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Synthesize an intermediate directory for a `CreatAll` descent,
    /// inheriting the parent's mode and ownership (the subject's uid
    /// when one is set).
    async fn mkdir_step(
        &self,
        f: &mut LockedNode,
        ai: Option<&AuthInfo>,
        nd: Option<&Dir>,
        name: &str,
    ) -> Result<LockedNode, FsError> {
        let od = f.dir();
        let uid = match ai {
            Some(ai) => ai.uid.clone(),
            None => od.uget("uid").to_string(),
        };
        let gid = od.uget("gid").to_string();
        let mode = od.uget("mode").to_string();
        let mut dd = nd.cloned().unwrap_or_default();
        dd.set("type", "d");
        dd.set("name", name);
        dd.set("size", "0");
        dd.set("uid", uid.clone());
        dd.set("gid", gid);
        dd.set("mode", mode);
        dd.set("wuid", uid);
        dd.set_mtime_now();
        f.new_file(dd).await
    }

    /// Mode-specific checks and fetches once the path is consumed.
    async fn walk_terminal(
        &self,
        why: WalkMode,
        ai: Option<&AuthInfo>,
        mut f: LockedNode,
    ) -> Result<LockedNode, FsError> {
        match why {
            WalkMode::Stat => {}
            WalkMode::Get => {
                if self.perms_on() && !f.dir().can_get(ai) {
                    return Err(FsError::Perm(f.path().to_string()));
                }
                if !f.data_ok() {
                    if f.dir().is_dir() {
                        self.get_dir_data(&mut f).await.map_err(|e| e.at(f.path()))?;
                    } else {
                        self.get_file_data(&mut f).await.map_err(|e| e.at(f.path()))?;
                    }
                }
            }
            WalkMode::Put => {
                if f.dir().is_dir() {
                    return Err(FsError::IsDir(f.path().to_string()));
                }
                if !f.data_ok() {
                    self.get_file_data(&mut f).await.map_err(|e| e.at(f.path()))?;
                }
            }
            WalkMode::Del => {
                if !f.data_ok() && f.dir().is_dir() {
                    self.get_dir_data(&mut f).await.map_err(|e| e.at(f.path()))?;
                }
            }
            WalkMode::Creat | WalkMode::CreatAll => {
                // An existing terminal is acceptable here; the caller's
                // type check decides whether it may be reused.
            }
            WalkMode::Link => {
                return Err(FsError::Exists(f.path().to_string()));
            }
        }
        Ok(f)
    }
}
