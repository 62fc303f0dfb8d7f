//! In-memory remote used by the tests
//!
//! A flat path-keyed store with the full capability set, plus the
//! knobs the tests need: an offline switch that turns every call into
//! an I/O error, optional healing on redial, per-operation call
//! counters, and selective capability disabling.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use zxc_core::{path, Dir, FsError, CTL_PATH};

use crate::remote::{byte_stream, collect, ByteStream, Remote};

struct MemEntry {
    dir: Dir,
    data: Vec<u8>,
}

#[derive(Default)]
struct MemState {
    entries: BTreeMap<String, MemEntry>,
    calls: BTreeMap<String, u64>,
    ctl_writes: Vec<Vec<u8>>,
    disabled: HashSet<String>,
}

/// Fake upstream file service.
pub(crate) struct MemRemote {
    state: Mutex<MemState>,
    offline: AtomicBool,
    heal_on_redial: AtomicBool,
}

fn entry_dir(p: &str, kind: &str, mode: &str, size: usize) -> Dir {
    let mut d = Dir::new();
    d.set("name", path::basename(p));
    d.set("path", p);
    d.set("addr", format!("mem!{}", p));
    d.set("type", kind);
    d.set("mode", mode);
    d.set("size", size.to_string());
    d.set("mtime", "1");
    d.set("uid", "ana");
    d.set("gid", "ana");
    d.set("wuid", "ana");
    d
}

impl MemRemote {
    pub fn shared() -> Arc<MemRemote> {
        let remote = MemRemote {
            state: Mutex::new(MemState::default()),
            offline: AtomicBool::new(false),
            heal_on_redial: AtomicBool::new(false),
        };
        remote.state.lock().entries.insert(
            "/".to_string(),
            MemEntry {
                dir: entry_dir("/", "d", "0755", 0),
                data: Vec::new(),
            },
        );
        Arc::new(remote)
    }

    pub fn add_dir(&self, p: &str) {
        self.state.lock().entries.insert(
            p.to_string(),
            MemEntry {
                dir: entry_dir(p, "d", "0755", 0),
                data: Vec::new(),
            },
        );
    }

    pub fn add_file(&self, p: &str, data: &[u8]) {
        self.state.lock().entries.insert(
            p.to_string(),
            MemEntry {
                dir: entry_dir(p, "-", "0644", data.len()),
                data: data.to_vec(),
            },
        );
    }

    pub fn set_mode(&self, p: &str, mode: &str) {
        if let Some(e) = self.state.lock().entries.get_mut(p) {
            e.dir.set("mode", mode);
        }
    }

    pub fn set_offline(&self, v: bool) {
        self.offline.store(v, Ordering::SeqCst);
    }

    pub fn set_heal_on_redial(&self, v: bool) {
        self.heal_on_redial.store(v, Ordering::SeqCst);
    }

    /// Make one capability report as unsupported.
    pub fn disable(&self, cap: &str) {
        self.state.lock().disabled.insert(cap.to_string());
    }

    /// How many times `op` was called.
    pub fn calls(&self, op: &str) -> u64 {
        *self.state.lock().calls.get(op).unwrap_or(&0)
    }

    /// Raw payloads written through `pass` to our control file.
    pub fn ctl_writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().ctl_writes.clone()
    }

    /// Non-async stat used from wait loops in tests.
    pub fn stat_sync(&self, p: &str) -> Result<Dir, FsError> {
        self.check(p)?;
        let state = self.state.lock();
        state
            .entries
            .get(p)
            .map(|e| e.dir.clone())
            .ok_or_else(|| FsError::NotExist(p.to_string()))
    }

    fn check(&self, p: &str) -> Result<(), FsError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(FsError::Io(p.to_string(), "remote down".to_string()))
        } else {
            Ok(())
        }
    }

    fn count(&self, op: &str) {
        *self.state.lock().calls.entry(op.to_string()).or_insert(0) += 1;
    }

    fn enabled(&self, cap: &str) -> bool {
        !self.state.lock().disabled.contains(cap)
    }

    /// Create any directories missing between `/` and `p`.
    fn mk_parents(state: &mut MemState, p: &str) {
        let mut cur = String::new();
        for el in path::elems(&path::dirname(p)) {
            cur.push('/');
            cur.push_str(&el);
            state.entries.entry(cur.clone()).or_insert_with(|| MemEntry {
                dir: entry_dir(&cur, "d", "0755", 0),
                data: Vec::new(),
            });
        }
    }
}

#[async_trait]
impl Remote for MemRemote {
    fn name(&self) -> &str {
        "mem"
    }

    async fn stat(&self, p: &str) -> Result<Dir, FsError> {
        self.count("stat");
        self.stat_sync(p)
    }

    async fn get_dir(&self, p: &str) -> Result<Vec<Dir>, FsError> {
        self.count("get_dir");
        self.check(p)?;
        let state = self.state.lock();
        let e = state
            .entries
            .get(p)
            .ok_or_else(|| FsError::NotExist(p.to_string()))?;
        if !e.dir.is_dir() {
            return Err(FsError::NotDir(p.to_string()));
        }
        Ok(state
            .entries
            .iter()
            .filter(|(k, _)| k.as_str() != "/" && path::dirname(k) == p)
            .map(|(_, e)| e.dir.clone())
            .collect())
    }

    async fn get(&self, p: &str, off: i64, count: i64) -> Result<ByteStream, FsError> {
        self.count("get");
        self.check(p)?;
        let state = self.state.lock();
        let e = state
            .entries
            .get(p)
            .ok_or_else(|| FsError::NotExist(p.to_string()))?;
        if e.dir.is_dir() {
            return Err(FsError::IsDir(p.to_string()));
        }
        let start = (off.max(0) as usize).min(e.data.len());
        let avail = e.data.len() - start;
        let n = if count < 0 {
            avail
        } else {
            avail.min(count as usize)
        };
        Ok(byte_stream(e.data[start..start + n].to_vec()))
    }

    fn supports_put(&self) -> bool {
        self.enabled("put")
    }

    async fn put(
        &self,
        p: &str,
        d: &Dir,
        off: i64,
        data: Option<ByteStream>,
    ) -> Result<Dir, FsError> {
        self.count("put");
        self.check(p)?;
        let buf = match data {
            Some(stream) => Some(collect(stream).await?),
            None => None,
        };
        if p == CTL_PATH {
            let mut state = self.state.lock();
            state.ctl_writes.push(buf.unwrap_or_default());
            return Ok(entry_dir(p, "c", "0644", 0));
        }
        let mut state = self.state.lock();
        if !state.entries.contains_key(p) {
            let kind = d.uget("type");
            if kind.is_empty() {
                return Err(FsError::NotExist(p.to_string()));
            }
            Self::mk_parents(&mut state, p);
            state.entries.insert(
                p.to_string(),
                MemEntry {
                    dir: entry_dir(p, kind, "0644", 0),
                    data: Vec::new(),
                },
            );
        }
        let e = state.entries.get_mut(p).expect("entry just ensured");
        for (k, v) in d.iter() {
            match k {
                "name" | "path" | "addr" | "type" | "size" => {}
                _ => e.dir.set(k, v),
            }
        }
        if let Some(buf) = buf {
            if !e.dir.is_dir() {
                let start = if off < 0 { e.data.len() } else { off as usize };
                let end = start + buf.len();
                if e.data.len() < end {
                    e.data.resize(end, 0);
                }
                e.data[start..end].copy_from_slice(&buf);
            }
        }
        if !e.dir.is_dir() {
            let size = e.data.len() as u64;
            e.dir.set_size(size);
        }
        Ok(e.dir.clone())
    }

    fn supports_wstat(&self) -> bool {
        self.enabled("wstat")
    }

    async fn wstat(&self, p: &str, nd: &Dir) -> Result<(), FsError> {
        self.count("wstat");
        self.check(p)?;
        let mut state = self.state.lock();
        let e = state
            .entries
            .get_mut(p)
            .ok_or_else(|| FsError::NotExist(p.to_string()))?;
        for (k, v) in nd.iter() {
            match k {
                "name" | "path" | "addr" | "type" => {}
                _ => e.dir.set(k, v),
            }
        }
        Ok(())
    }

    fn supports_remove(&self) -> bool {
        self.enabled("remove")
    }

    async fn remove_all(&self, p: &str) -> Result<(), FsError> {
        self.count("remove_all");
        self.check(p)?;
        let mut state = self.state.lock();
        if !state.entries.contains_key(p) {
            return Err(FsError::NotExist(p.to_string()));
        }
        state
            .entries
            .retain(|k, _| k != p && !path::has_prefix(k, p));
        Ok(())
    }

    fn supports_move(&self) -> bool {
        self.enabled("move")
    }

    async fn move_(&self, from: &str, to: &str) -> Result<(), FsError> {
        self.count("move");
        self.check(from)?;
        let mut state = self.state.lock();
        if !state.entries.contains_key(from) {
            return Err(FsError::NotExist(from.to_string()));
        }
        let moved: Vec<String> = state
            .entries
            .keys()
            .filter(|k| k.as_str() == from || path::has_prefix(k, from))
            .cloned()
            .collect();
        for old in moved {
            let mut e = state.entries.remove(&old).expect("listed above");
            let new = format!("{}{}", to, &old[from.len()..]);
            e.dir.set("name", path::basename(&new));
            e.dir.set("path", new.clone());
            e.dir.set("addr", format!("mem!{}", new));
            state.entries.insert(new, e);
        }
        Ok(())
    }

    fn supports_link(&self) -> bool {
        self.enabled("link")
    }

    async fn link(&self, to: &str, from: &str) -> Result<(), FsError> {
        self.count("link");
        self.check(from)?;
        let mut state = self.state.lock();
        let src = state
            .entries
            .get(to)
            .ok_or_else(|| FsError::NotExist(to.to_string()))?;
        let mut dir = src.dir.clone();
        let data = src.data.clone();
        dir.set("name", path::basename(from));
        dir.set("path", from);
        dir.set("addr", format!("mem!{}", from));
        state
            .entries
            .insert(from.to_string(), MemEntry { dir, data });
        Ok(())
    }

    fn supports_sync(&self) -> bool {
        self.enabled("sync")
    }

    async fn sync(&self) -> Result<(), FsError> {
        self.count("sync");
        self.check("/")
    }

    fn supports_redial(&self) -> bool {
        self.enabled("redial")
    }

    async fn redial(&self) -> Result<(), FsError> {
        self.count("redial");
        if self.heal_on_redial.load(Ordering::SeqCst) {
            self.offline.store(false, Ordering::SeqCst);
        }
        if self.offline.load(Ordering::SeqCst) {
            Err(FsError::Io("/".to_string(), "still down".to_string()))
        } else {
            Ok(())
        }
    }

    async fn close(&self) -> Result<(), FsError> {
        self.count("close");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zxc_core::ALL;

    #[tokio::test]
    async fn test_mem_remote_basics() {
        let r = MemRemote::shared();
        r.add_dir("/d");
        r.add_file("/d/f", b"hello");

        assert!(r.stat("/d").await.unwrap().is_dir());
        assert_eq!(r.stat("/d/f").await.unwrap().size(), 5);

        let ds = r.get_dir("/").await.unwrap();
        assert_eq!(ds.len(), 1);
        assert_eq!(ds[0].name(), "d");

        let bytes = collect(r.get("/d/f", 1, 3).await.unwrap()).await.unwrap();
        assert_eq!(bytes, b"ell");
    }

    #[tokio::test]
    async fn test_mem_remote_offline_and_redial() {
        let r = MemRemote::shared();
        r.set_offline(true);
        assert!(r.stat("/").await.unwrap_err().is_io());
        assert!(r.redial().await.is_err());

        r.set_heal_on_redial(true);
        r.redial().await.unwrap();
        assert!(r.stat("/").await.is_ok());
    }

    #[tokio::test]
    async fn test_mem_remote_move_subtree() {
        let r = MemRemote::shared();
        r.add_dir("/a");
        r.add_file("/a/f", b"x");
        r.move_("/a", "/b").await.unwrap();

        assert!(r.stat("/a").await.unwrap_err().is_not_exist());
        assert_eq!(r.stat("/b/f").await.unwrap().path(), "/b/f");
    }

    #[tokio::test]
    async fn test_mem_remote_put_creates_parents() {
        let r = MemRemote::shared();
        let d = Dir::from_iter([("type", "-")]);
        r.put("/x/y/f", &d, 0, Some(byte_stream(b"z".to_vec())))
            .await
            .unwrap();
        assert!(r.stat("/x").await.unwrap().is_dir());
        assert_eq!(r.stat("/x/y/f").await.unwrap().size(), 1);

        let ds = r.get_dir("/x").await.unwrap();
        assert_eq!(ds[0].name(), "y");
    }

    #[tokio::test]
    async fn test_mem_remote_get_range() {
        let r = MemRemote::shared();
        r.add_file("/f", b"0123456789");
        let all = collect(r.get("/f", 0, ALL).await.unwrap()).await.unwrap();
        assert_eq!(all, b"0123456789");
        let tail = collect(r.get("/f", 8, ALL).await.unwrap()).await.unwrap();
        assert_eq!(tail, b"89");
        let past = collect(r.get("/f", 20, ALL).await.unwrap()).await.unwrap();
        assert!(past.is_empty());
    }
}
