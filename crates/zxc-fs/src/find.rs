//! Streaming find
//!
//! `find` walks the tree under a path and streams every entry a
//! predicate accepts, rewriting paths from a source prefix to a
//! destination prefix when they differ. The recursion follows the same
//! lock discipline as the walker: a node's lock is released before its
//! children are visited, and each child is re-looked-up under the
//! parent's lock so concurrent reconciliation cannot be bypassed.
//!
//! `find_get` extends the stream with the content of every matching
//! regular file.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use tokio::sync::mpsc;
use tracing::debug;

use zxc_core::{path, Dir, FsError, ALL, CTL_PATH};

use crate::ctl::{ctl_dir, Op};
use crate::fs::Fs;
use crate::node::{LockedNode, Node};
use crate::walk::WalkMode;
use crate::STREAM_DEPTH;

/// What a predicate says about one entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Verdict {
    /// The entry satisfies the predicate and should be reported.
    pub matches: bool,
    /// Do not descend below this entry.
    pub prune: bool,
}

/// Entry predicate evaluated during find, depth-aware.
pub trait Pred: Send + Sync + 'static {
    fn eval_at(&self, d: &Dir, depth: i32) -> Result<Verdict, FsError>;
}

/// Matches every entry, never prunes.
pub struct MatchAll;

impl Pred for MatchAll {
    fn eval_at(&self, _d: &Dir, _depth: i32) -> Result<Verdict, FsError> {
        Ok(Verdict {
            matches: true,
            prune: false,
        })
    }
}

impl<F> Pred for F
where
    F: Fn(&Dir, i32) -> Result<Verdict, FsError> + Send + Sync + 'static,
{
    fn eval_at(&self, d: &Dir, depth: i32) -> Result<Verdict, FsError> {
        self(d, depth)
    }
}

/// Stream of directory entries; an `Err` item is terminal.
pub type DirStream = mpsc::Receiver<Result<Dir, FsError>>;

type DirSink = mpsc::Sender<Result<Dir, FsError>>;

/// One item of a `find_get` stream. Errors ride in-band: a failing
/// file read reports an `Error` item and the stream continues with the
/// next entry.
#[derive(Debug)]
pub enum FindItem {
    Entry(Dir),
    Data(Vec<u8>),
    Error(FsError),
}

/// Shared sentinel node for `/Ctl` during find traversal; its content
/// is read-only for find's purposes.
fn ctl_node() -> Arc<Node> {
    static CTL_NODE: OnceLock<Arc<Node>> = OnceLock::new();
    CTL_NODE.get_or_init(|| Node::synthetic(ctl_dir())).clone()
}

// Distinguishes "consumer hung up" from real faults; never reaches the
// consumer, who by definition is gone.
fn consumer_gone() -> FsError {
    FsError::Io("find".to_string(), "consumer gone".to_string())
}

impl Fs {
    /// Stream the entries under `p` accepted by `pred`.
    ///
    /// When `spref` and `dpref` differ, each reported path has `spref`
    /// stripped and `dpref` prepended. `depth` is the depth reported
    /// for `p` itself.
    pub fn find(
        &self,
        p: &str,
        pred: Arc<dyn Pred>,
        spref: &str,
        dpref: &str,
        depth: i32,
    ) -> DirStream {
        let (tx, rx) = mpsc::channel(STREAM_DEPTH);
        let fs = self.clone();
        let (p, spref, dpref) = (p.to_string(), spref.to_string(), dpref.to_string());
        tokio::spawn(async move {
            fs.inner.stats.count(Op::Find);
            if let Err(e) = fs.find_impl(&p, pred.as_ref(), &spref, &dpref, depth, &tx).await {
                debug!("find {}: {}", p, e);
                let _ = tx.send(Err(e)).await;
            }
        });
        rx
    }

    /// `find`, with the bytes of every matching regular file streamed
    /// after its entry.
    pub fn find_get(
        &self,
        p: &str,
        pred: Arc<dyn Pred>,
        spref: &str,
        dpref: &str,
        depth: i32,
    ) -> mpsc::Receiver<FindItem> {
        let (tx, rx) = mpsc::channel(STREAM_DEPTH);
        let fs = self.clone();
        let mut dc = self.find(p, pred, spref, dpref, depth);
        tokio::spawn(async move {
            while let Some(item) = dc.recv().await {
                match item {
                    Ok(d) => {
                        let fetch = !d.is_dir() && d.uget("err").is_empty();
                        let data_path = d.addr_path().to_string();
                        if tx.send(FindItem::Entry(d)).await.is_err() {
                            return;
                        }
                        if !fetch {
                            continue;
                        }
                        let mut bc = fs.get(&data_path, 0, ALL);
                        while let Some(chunk) = bc.recv().await {
                            let item = match chunk {
                                Ok(b) => FindItem::Data(b),
                                Err(e) => FindItem::Error(e),
                            };
                            let stop = matches!(item, FindItem::Error(_));
                            if tx.send(item).await.is_err() {
                                return;
                            }
                            if stop {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(FindItem::Error(e)).await;
                        return;
                    }
                }
            }
        });
        rx
    }

    async fn find_impl(
        &self,
        p: &str,
        pred: &dyn Pred,
        spref: &str,
        dpref: &str,
        depth: i32,
        tx: &DirSink,
    ) -> Result<(), FsError> {
        let p = path::use_abs_path(p)?;
        let (f, mut d) = if p == CTL_PATH {
            let n = ctl_node();
            (n.lock().await, ctl_dir())
        } else {
            let els = path::elems(&p);
            let f = self.inner.walk(WalkMode::Get, self.ai(), None, &els).await?;
            let d = f.dir().clone();
            (f, d)
        };
        let (spref, dpref) = if spref.is_empty() && dpref.is_empty() {
            ("/".to_string(), "/".to_string())
        } else {
            (path::use_abs_path(spref)?, path::use_abs_path(dpref)?)
        };
        if spref != dpref {
            match path::suffix(&p, &spref) {
                Some(s) => d.set("path", path::join(&dpref, &s)),
                None => return Err(FsError::BadPath(p)),
            }
        }
        let res = self.findr(f, d, pred, &spref, &dpref, depth, tx).await;
        match res {
            // The consumer hanging up ends the walk, not an error.
            Err(e) if e == consumer_gone() => Ok(()),
            other => other,
        }
    }

    /// Recursive step. `f` is locked on entry and released before the
    /// children are visited; each child is locked only while its own
    /// subtree is walked.
    #[allow(clippy::too_many_arguments)]
    fn findr<'a>(
        &'a self,
        f: LockedNode,
        mut d: Dir,
        pred: &'a dyn Pred,
        spref: &'a str,
        dpref: &'a str,
        lvl: i32,
        tx: &'a DirSink,
    ) -> Pin<Box<dyn Future<Output = Result<(), FsError>> + Send + 'a>> {
        Box::pin(async move {
            let verdict = match pred.eval_at(&d, lvl) {
                Ok(v) => v,
                Err(e) => return Err(e),
            };
            if verdict.prune {
                drop(f);
                if !verdict.matches {
                    d.set("err", "pruned");
                }
                if tx.send(Ok(d)).await.is_err() {
                    return Err(consumer_gone());
                }
                return Ok(());
            }
            let mut ds = Vec::new();
            if d.is_dir() {
                match f.dir_entries().await {
                    Ok(mut got) => {
                        if f.path() == "/" {
                            got.insert(0, ctl_dir());
                        }
                        ds = got;
                    }
                    Err(e) => d.set("err", e.to_string()),
                }
            }
            let parent = f.node().clone();
            drop(f);

            let had_err = !d.uget("err").is_empty();
            if verdict.matches || had_err {
                if tx.send(Ok(d)).await.is_err() {
                    return Err(consumer_gone());
                }
            }

            for mut cd in ds {
                let cf = if cd.path() == CTL_PATH {
                    ctl_node()
                } else {
                    let pf = parent.lock().await;
                    match pf.walk1(cd.name()).await {
                        Ok(c) => c,
                        Err(_) => continue,
                    }
                };
                if spref != dpref {
                    let cpath = cd.path().to_string();
                    match path::suffix(&cpath, spref) {
                        Some(s) => cd.set("path", path::join(dpref, &s)),
                        None => return Err(FsError::BadPath(cpath)),
                    }
                }
                let mut cf = cf.lock().await;
                if cd.is_dir() && !cf.data_ok() {
                    if let Err(e) = self.inner.get_dir_data(&mut cf).await {
                        return Err(e.at(cf.path()));
                    }
                }
                self.findr(cf, cd, pred, spref, dpref, lvl + 1, tx).await?;
            }
            Ok(())
        })
    }
}
