//! The caching filesystem
//!
//! `Fs` is the public face: a cheap clone-able handle over one shared
//! cache, remote binding and background syncer. Operations resolve
//! their path through the walker, mutate the terminal node under its
//! lock, and either push the change straight to the remote
//! (`writesync` on) or signal the syncer and return.
//!
//! The synthetic `/Ctl` file never reaches the remote: reads render
//! the local flags and counters plus a best-effort copy of the
//! remote's own control file, writes drive the flags registry, and the
//! `pass ` prefix forwards the rest upstream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use zxc_core::{path, AuthInfo, Config, Dir, FsError, ALL, CTL_PATH, HIDDEN_NAMES};

use crate::ctl::{ctl_dir, Flags, Op, Stats};
use crate::node::{self, Node};
use crate::remote::{byte_stream, collect, get_all, stream_pair, ByteSink, ByteStream, Remote};
use crate::store::Cache;
use crate::syncer::Syncer;
use crate::walk::WalkMode;
use crate::SYS_UID;

pub(crate) struct FsInner {
    pub(crate) tag: String,
    pub(crate) remote: Arc<dyn Remote>,
    pub(crate) cache: Cache,
    pub(crate) flags: Flags,
    pub(crate) stats: Stats,
    write_sync: Arc<AtomicBool>,
    perms: Arc<AtomicBool>,
    pub(crate) redial_ok: bool,
    sync_tx: Mutex<Option<mpsc::Sender<()>>>,
    redial_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl FsInner {
    pub(crate) fn perms_on(&self) -> bool {
        self.perms.load(Ordering::Relaxed)
    }

    fn write_through(&self) -> bool {
        self.write_sync.load(Ordering::Relaxed)
    }

    /// Ask the syncer for a round, without blocking or stacking up.
    pub(crate) fn need_sync(&self) {
        if let Some(tx) = self.sync_tx.lock().as_ref() {
            let _ = tx.try_send(());
        }
    }

    /// Ask the syncer to redial, without blocking or stacking up.
    pub(crate) fn need_redial(&self) {
        if !self.redial_ok {
            return;
        }
        if let Some(tx) = self.redial_tx.lock().as_ref() {
            let _ = tx.try_send(());
        }
    }
}

/// A caching filesystem over a remote file service.
///
/// Handles are cheap to clone and share one cache; [`Fs::auth`] makes
/// a handle that runs as a different subject.
#[derive(Clone)]
pub struct Fs {
    pub(crate) inner: Arc<FsInner>,
    ai: Option<Arc<AuthInfo>>,
}

impl Fs {
    /// Build a filesystem over `remote`, stat its root, and start the
    /// background syncer.
    pub async fn new(remote: Arc<dyn Remote>, config: &Config) -> Result<Fs, FsError> {
        let rd = remote.stat("/").await?;
        let tag = format!("zxc!{}", remote.name());
        let cache = Cache::new(rd);

        let write_sync = Arc::new(AtomicBool::new(config.sync.write_through));
        let perms = Arc::new(AtomicBool::new(config.cache.perms));
        let redial_ok = config.cache.redial && remote.supports_redial();

        let flags = Flags::default();
        flags.add("debug", Arc::new(AtomicBool::new(false)));
        flags.add("writesync", write_sync.clone());
        flags.add_ro("perms", perms.clone());
        flags.add_ro("redialok", Arc::new(AtomicBool::new(redial_ok)));
        flags.add("cachedebug", Arc::new(AtomicBool::new(false)));
        flags.add("verb", Arc::new(AtomicBool::new(false)));
        flags.add("cachestats", Arc::new(AtomicBool::new(false)));

        let (sync_tx, sync_rx) = mpsc::channel(1);
        let (redial_tx, redial_rx) = mpsc::channel(1);
        let syncer = Syncer::new(
            remote.clone(),
            cache.clone(),
            Duration::from_secs(config.sync.sync_interval_secs),
            Duration::from_secs(config.sync.redial_interval_secs),
            redial_ok,
        );
        tokio::spawn(syncer.run(sync_rx, redial_rx));

        info!("{}: up (write-through {})", tag, config.sync.write_through);
        Ok(Fs {
            inner: Arc::new(FsInner {
                tag,
                remote,
                cache,
                flags,
                stats: Stats::default(),
                write_sync,
                perms,
                redial_ok,
                sync_tx: Mutex::new(Some(sync_tx)),
                redial_tx: Mutex::new(Some(redial_tx)),
            }),
            ai: None,
        })
    }

    /// A view of the same filesystem running as `ai`.
    pub fn auth(&self, ai: Option<AuthInfo>) -> Fs {
        if let Some(ai) = &ai {
            debug!("{}: auth for {}", self.inner.tag, ai.uid);
        }
        Fs {
            inner: self.inner.clone(),
            ai: ai.map(Arc::new),
        }
    }

    pub(crate) fn ai(&self) -> Option<&AuthInfo> {
        self.ai.as_deref()
    }

    /// The uid this handle writes as, falling back past `fallback`.
    fn euid(&self, fallback: &str) -> String {
        match self.ai() {
            Some(ai) if !ai.uid.is_empty() => ai.uid.clone(),
            _ if !fallback.is_empty() => fallback.to_string(),
            _ => SYS_UID.to_string(),
        }
    }

    /// Sync the mutated node now (write-through) or schedule it.
    async fn after_write(&self, node: &Arc<Node>) {
        if self.inner.write_through() {
            if let Err(e) = node::sync(node, &self.inner.remote).await {
                warn!("{}: write-through {}: {}", self.inner.tag, node.path(), e);
            }
        } else {
            self.inner.need_sync();
        }
    }

    /// Metadata for one path.
    pub async fn stat(&self, p: &str) -> Result<Dir, FsError> {
        self.inner.stats.count(Op::Stat);
        let p = path::use_abs_path(p)?;
        if p == CTL_PATH {
            return Ok(ctl_dir());
        }
        let els = path::elems(&p);
        let f = self.inner.walk(WalkMode::Stat, self.ai(), None, &els).await?;
        Ok(f.dir().clone())
    }

    /// Apply a metadata delta. `/Ctl` accepts and ignores it.
    pub async fn wstat(&self, p: &str, mut nd: Dir) -> Result<Dir, FsError> {
        self.inner.stats.count(Op::Wstat);
        let p = path::use_abs_path(p)?;
        if p == CTL_PATH {
            return Ok(ctl_dir());
        }
        let why = if nd.contains("size") {
            WalkMode::Put
        } else {
            WalkMode::Stat
        };
        let els = path::elems(&p);
        let mut f = self.inner.walk(why, self.ai(), None, &els).await?;
        let ai = if self.inner.perms_on() { self.ai() } else { None };
        if f.dir().is_dir() {
            nd.remove("size");
        }
        nd.remove("wuid");
        f.dir().can_wstat(ai, &nd)?;
        if nd.contains("size") {
            // resizing rewrites content
            nd.set("wuid", self.euid(f.dir().uget("uid")));
        }
        f.wstat(&nd)?;
        let d = f.dir().clone();
        let n = f.node().clone();
        drop(f);
        self.after_write(&n).await;
        Ok(d)
    }

    /// Stream an entry. Files yield raw bytes; directories yield
    /// serialized entries, with the synthetic `/Ctl` injected first in
    /// the root listing and bookkeeping names skipped. `count < 0`
    /// means everything.
    pub fn get(&self, p: &str, off: i64, count: i64) -> ByteStream {
        let (tx, rx) = stream_pair();
        let fs = self.clone();
        let p = p.to_string();
        tokio::spawn(async move {
            fs.inner.stats.count(Op::Get);
            if let Err(e) = fs.get_impl(&p, off, count, &tx).await {
                debug!("get {}: {}", p, e);
                let _ = tx.send(Err(e)).await;
            }
        });
        rx
    }

    async fn get_impl(&self, p: &str, off: i64, count: i64, tx: &ByteSink) -> Result<(), FsError> {
        let p = path::use_abs_path(p)?;
        if p == CTL_PATH {
            return self.get_ctl(off, count, tx).await;
        }
        let els = path::elems(&p);
        let f = self.inner.walk(WalkMode::Get, self.ai(), None, &els).await?;
        if !f.dir().is_dir() {
            // unlocks before sending anything
            return f.get_data(off, count, tx).await;
        }
        let ds = f.dir_entries().await?;
        drop(f);

        let mut entries = Vec::with_capacity(ds.len() + 1);
        if p == "/" {
            entries.push(ctl_dir());
        }
        entries.extend(ds);
        let mut off = off;
        let mut count = count;
        for d in entries {
            if off > 0 {
                off -= 1;
                continue;
            }
            if count == 0 {
                break;
            }
            if count != ALL {
                count -= 1;
            }
            // bookkeeping names occupy their slot but are never sent
            if HIDDEN_NAMES.contains(&d.name()) {
                continue;
            }
            if tx.send(Ok(d.to_bytes())).await.is_err() {
                return Ok(());
            }
        }
        Ok(())
    }

    async fn get_ctl(&self, off: i64, count: i64, tx: &ByteSink) -> Result<(), FsError> {
        let mut resp = format!("lfs {}:\n", self.inner.tag).into_bytes();
        resp.extend_from_slice(self.inner.flags.render().as_bytes());
        resp.extend_from_slice(self.inner.stats.render().as_bytes());
        if let Ok(rctl) = get_all(&self.inner.remote, CTL_PATH).await {
            resp.extend_from_slice(&rctl);
        }
        let o = (off.max(0) as usize).min(resp.len());
        let rest = &resp[o..];
        let n = if count < 0 {
            rest.len()
        } else {
            (count as usize).min(rest.len())
        };
        let _ = tx.send(Ok(rest[..n].to_vec())).await;
        Ok(())
    }

    /// Create or write an entry.
    ///
    /// The `type` in `d` classifies the request: empty writes an
    /// existing file, `-`/`d` create one entry, and `F`/`D` create
    /// with parents. Creation fills defaults from the parent and the
    /// subject and stamps `wuid`.
    pub async fn put(
        &self,
        p: &str,
        mut d: Dir,
        off: i64,
        data: Option<ByteStream>,
    ) -> Result<Dir, FsError> {
        self.inner.stats.count(Op::Put);
        let p = path::use_abs_path(p)?;
        if p == "/" {
            return Err(FsError::IsDir(p));
        }
        if p == CTL_PATH {
            self.put_ctl(data).await?;
            return Ok(ctl_dir());
        }
        let els = path::elems(&p);
        let typ = d.uget("type").to_string();
        let mut f = match typ.as_str() {
            "" => self.inner.walk(WalkMode::Put, self.ai(), None, &els).await?,
            "d" | "-" => {
                if typ == "d" {
                    d.remove("size");
                } else if d.uget("size").is_empty() {
                    d.set("size", "0");
                }
                self.inner.walk(WalkMode::Creat, self.ai(), None, &els).await?
            }
            "D" | "F" => {
                if typ == "D" {
                    d.remove("size");
                    d.set("type", "d");
                } else {
                    d.set("type", "-");
                    if d.uget("size").is_empty() {
                        d.set("size", "0");
                    }
                }
                let tmpl = d.clone();
                self.inner
                    .walk(WalkMode::CreatAll, self.ai(), Some(&tmpl), &els)
                    .await?
            }
            _ => return Err(FsError::BadPath(p)),
        };
        let typ = d.uget("type").to_string();
        let wd = f.dir().clone();
        if wd.path() == p && !typ.is_empty() && wd.uget("type") != typ {
            return Err(FsError::Exists(p));
        }

        let mut uid = wd.uget("uid").to_string();
        if uid.is_empty() {
            uid = self.euid("");
        }
        let mut gid = wd.uget("gid").to_string();
        if gid.is_empty() {
            gid = uid.clone();
        }
        let creating = wd.path() != p;
        let wd = if creating {
            Dir::from_iter([
                ("type", typ.as_str()),
                ("mode", wd.uget("mode")),
                ("uid", uid.as_str()),
                ("gid", gid.as_str()),
                ("path", p.as_str()),
            ])
        } else {
            wd
        };
        let ai = if self.inner.perms_on() { self.ai() } else { None };
        wd.can_wstat(ai, &d)?;

        let umtime: Option<u64> = d.get("mtime").and_then(|s| s.parse().ok());
        if umtime.is_none() {
            d.set_mtime_now();
        }
        d.set("wuid", self.euid(&uid));

        if creating {
            d.set("type", typ.as_str());
            if d.uget("uid").is_empty() {
                d.set("uid", uid);
            }
            if d.uget("gid").is_empty() {
                d.set("gid", gid);
            }
            d.set("name", path::basename(&p));
            d.set("path", p.as_str());
            d.rewrite_addr();
            if d.uget("mode").is_empty() {
                d.set("mode", wd.uget("mode"));
            }
            if d.uget("size").is_empty() {
                d.set("size", "0");
            }
            let nf = f.new_file(d.clone()).await?;
            if typ == "d" {
                let n = nf.node().clone();
                drop(nf);
                drop(f);
                self.after_write(&n).await;
                return Ok(d);
            }
            drop(f);
            f = nf;
        } else if typ == "-" {
            // recreating an existing file truncates it
            f.wstat(&Dir::from_iter([("size", "0")]))?;
        }
        f.wstat(&d)?;
        if typ == "d" {
            let dd = f.dir().clone();
            let n = f.node().clone();
            drop(f);
            self.after_write(&n).await;
            return Ok(dd);
        }
        let n = f.node().clone();
        let res = f.put_data(off, data, umtime).await;
        self.after_write(&n).await;
        res
    }

    async fn put_ctl(&self, data: Option<ByteStream>) -> Result<(), FsError> {
        let buf = match data {
            Some(stream) => collect(stream).await?,
            None => Vec::new(),
        };
        let text = String::from_utf8_lossy(&buf).to_string();
        if let Some(rest) = text.strip_prefix("pass ") {
            if !self.inner.remote.supports_put() {
                return Err(FsError::Unsupported(CTL_PATH.to_string()));
            }
            let stream = byte_stream(rest.as_bytes().to_vec());
            self.inner
                .remote
                .put(CTL_PATH, &Dir::new(), 0, Some(stream))
                .await?;
            return Ok(());
        }
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line {
                "clear" => self.inner.stats.clear(),
                "sync" => {
                    self.inner.cache.sync(&self.inner.remote).await?;
                }
                "inval" => {
                    let cache = self.inner.cache.clone();
                    tokio::spawn(async move { cache.inval().await });
                }
                _ => self.inner.flags.ctl(line)?,
            }
        }
        Ok(())
    }

    /// Remove one entry; directories must be empty.
    pub async fn remove(&self, p: &str) -> Result<(), FsError> {
        self.remove_impl(p, false).await
    }

    /// Remove an entry and everything below it.
    pub async fn remove_all(&self, p: &str) -> Result<(), FsError> {
        self.remove_impl(p, true).await
    }

    async fn remove_impl(&self, p: &str, all: bool) -> Result<(), FsError> {
        self.inner.stats.count(Op::Remove);
        let p = path::use_abs_path(p)?;
        if p == "/" || p == CTL_PATH {
            return Err(FsError::Perm(p));
        }
        let els = path::elems(&p);
        let mut f = self.inner.walk(WalkMode::Del, self.ai(), None, &els).await?;
        let res = f.remove(all).await;
        let n = f.node().clone();
        drop(f);
        self.after_write(&n).await;
        res
    }

    /// Move `from` to `to` on the remote, invalidating both ends.
    ///
    /// The remote must support it. Both parents are invalidated under
    /// their locks, walked in descending lexicographic path order: a
    /// walk passes through every ancestor of its target, so when one
    /// parent contains the other the deeper path must be taken first.
    pub async fn move_(&self, from: &str, to: &str) -> Result<(), FsError> {
        self.inner.stats.count(Op::Move);
        if !self.inner.remote.supports_move() {
            return Err(FsError::Unsupported(self.inner.tag.clone()));
        }
        let from = path::use_abs_path(from)?;
        let to = path::use_abs_path(to)?;
        if from == to {
            return Ok(());
        }
        if from == "/" || from == CTL_PATH {
            return Err(FsError::Perm(from));
        }
        if to == "/" || to == CTL_PATH {
            return Err(FsError::Perm(to));
        }
        if path::has_prefix(&to, &from) {
            // a tree cannot move into itself
            return Err(FsError::BadPath(from));
        }
        if let Err(e) = self.inner.cache.sync(&self.inner.remote).await {
            debug!("move: pre-sync: {}", e);
        }
        let ai = self.ai();
        let fromels = path::elems(&from);
        let toels = path::elems(&to);
        {
            let mut ff = self.inner.walk(WalkMode::Del, ai, None, &fromels).await?;
            ff.inval();
        }
        {
            // parent-or-self, depending on whether `to` exists
            let mut ft = self.inner.walk(WalkMode::Creat, ai, None, &toels).await?;
            ft.inval();
        }
        let pfrom = path::dirname(&from);
        let pto = path::dirname(&to);
        let pfromels = path::elems(&pfrom);
        let ptoels = path::elems(&pto);
        if pfrom == pto {
            let mut fa = self.inner.walk(WalkMode::Stat, ai, None, &pfromels).await?;
            fa.inval();
            self.inner.remote.move_(&from, &to).await?;
        } else if pfrom > pto {
            let mut fa = self.inner.walk(WalkMode::Stat, ai, None, &pfromels).await?;
            let mut fb = self.inner.walk(WalkMode::Stat, ai, None, &ptoels).await?;
            fa.inval();
            fb.inval();
            self.inner.remote.move_(&from, &to).await?;
        } else {
            let mut fb = self.inner.walk(WalkMode::Stat, ai, None, &ptoels).await?;
            let mut fa = self.inner.walk(WalkMode::Stat, ai, None, &pfromels).await?;
            fa.inval();
            fb.inval();
            self.inner.remote.move_(&from, &to).await?;
        }
        debug!("move {} {}: ok", from, to);
        Ok(())
    }

    /// Create `from` as a link to `to` on the remote.
    ///
    /// The cache does not model links; the call is forwarded and the
    /// target's parent listing is refreshed, so the cache simply sees
    /// one more entry.
    pub async fn link(&self, to: &str, from: &str) -> Result<(), FsError> {
        self.inner.stats.count(Op::Link);
        if !self.inner.remote.supports_link() {
            return Err(FsError::Unsupported(self.inner.tag.clone()));
        }
        let from = path::use_abs_path(from)?;
        let to = path::use_abs_path(to)?;
        if from == to {
            return Ok(());
        }
        if from == "/" || from == CTL_PATH {
            return Err(FsError::Perm(from));
        }
        if to == "/" || to == CTL_PATH {
            return Err(FsError::Perm(to));
        }
        if path::has_prefix(&from, &to) {
            // a link below its own source loops
            return Err(FsError::BadPath(from));
        }
        if let Err(e) = self.inner.cache.sync(&self.inner.remote).await {
            debug!("link: pre-sync: {}", e);
        }
        let ai = self.ai();
        let toels = path::elems(&to);
        let ft = self.inner.walk(WalkMode::Stat, ai, None, &toels).await?;
        drop(ft);
        let fromels = path::elems(&from);
        let mut ff = self.inner.walk(WalkMode::Link, ai, None, &fromels).await?;
        ff.inval();
        let res = self.inner.remote.link(&to, &from).await;
        if let Err(e) = self.inner.get_dir_data(&mut ff).await {
            debug!("link: refresh {}: {}", ff.path(), e);
        }
        res
    }

    /// Flush every dirty node, then the remote itself.
    pub async fn sync(&self) -> Result<(), FsError> {
        let res = self.inner.cache.sync(&self.inner.remote).await;
        if self.inner.remote.supports_sync() {
            match self.inner.remote.sync().await {
                Ok(()) => res,
                Err(e) => res.and(Err(e)),
            }
        } else {
            res
        }
    }

    /// Stop the syncer, perform a final sync, and close the remote.
    pub async fn close(&self) -> Result<(), FsError> {
        *self.inner.sync_tx.lock() = None;
        *self.inner.redial_tx.lock() = None;
        let res = self.sync().await;
        match self.inner.remote.close().await {
            Ok(()) => res,
            Err(e) => res.and(Err(e)),
        }
    }
}
