//! Control surface
//!
//! The flags registry and the per-operation counters behind the
//! synthetic `/Ctl` file. Reading `/Ctl` concatenates the flag lines,
//! the counter lines, and a best-effort read of the remote's own
//! control file; writing it accepts `name on|off` lines, the command
//! words `clear`, `sync` and `inval`, and a `pass ` passthrough.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use zxc_core::{Dir, FsError, CTL_NAME, CTL_PATH};

use crate::SYS_UID;

/// The synthetic `/Ctl` entry, as listed in the root directory.
pub fn ctl_dir() -> Dir {
    Dir::from_iter([
        ("name", CTL_NAME),
        ("path", CTL_PATH),
        ("addr", "zxc!/Ctl"),
        ("type", "c"),
        ("mode", "0644"),
        ("size", "0"),
        ("mtime", "0"),
        ("uid", SYS_UID),
        ("gid", SYS_UID),
        ("wuid", SYS_UID),
    ])
}

enum FlagVal {
    Rw(Arc<AtomicBool>),
    Ro(Arc<AtomicBool>),
}

impl FlagVal {
    fn get(&self) -> bool {
        match self {
            FlagVal::Rw(b) | FlagVal::Ro(b) => b.load(Ordering::Relaxed),
        }
    }
}

/// Named boolean flags, rendered and toggled through `/Ctl`.
#[derive(Default)]
pub struct Flags {
    vals: RwLock<BTreeMap<String, FlagVal>>,
}

impl Flags {
    pub fn add(&self, name: &str, b: Arc<AtomicBool>) {
        self.vals.write().insert(name.to_string(), FlagVal::Rw(b));
    }

    /// Register a flag that `/Ctl` reports but refuses to change.
    pub fn add_ro(&self, name: &str, b: Arc<AtomicBool>) {
        self.vals.write().insert(name.to_string(), FlagVal::Ro(b));
    }

    pub fn get(&self, name: &str) -> Option<bool> {
        self.vals.read().get(name).map(FlagVal::get)
    }

    pub fn set(&self, name: &str, on: bool) -> Result<(), FsError> {
        match self.vals.read().get(name) {
            Some(FlagVal::Rw(b)) => {
                b.store(on, Ordering::Relaxed);
                Ok(())
            }
            Some(FlagVal::Ro(_)) => Err(FsError::BadCtl(format!("flag {} is read-only", name))),
            None => Err(FsError::BadCtl(format!("unknown flag {}", name))),
        }
    }

    /// Handle one `name on|off` control line.
    pub fn ctl(&self, line: &str) -> Result<(), FsError> {
        let mut words = line.split_whitespace();
        match (words.next(), words.next(), words.next()) {
            (Some(name), Some(v @ ("on" | "off")), None) => self.set(name, v == "on"),
            _ => Err(FsError::BadCtl(line.to_string())),
        }
    }

    /// One `name on|off` line per flag, name order.
    pub fn render(&self) -> String {
        let vals = self.vals.read();
        let mut out = String::new();
        for (name, val) in vals.iter() {
            out.push_str(name);
            out.push_str(if val.get() { " on\n" } else { " off\n" });
        }
        out
    }
}

/// Public API operations, one counter each.
#[derive(Clone, Copy, Debug)]
pub enum Op {
    Stat,
    Get,
    Put,
    Wstat,
    Remove,
    Move,
    Link,
    Find,
}

const OP_NAMES: [&str; 8] = [
    "stat", "get", "put", "wstat", "remove", "move", "link", "find",
];

/// Lock-free per-operation call counters.
pub struct Stats {
    counts: [AtomicU64; 8],
}

impl Default for Stats {
    fn default() -> Stats {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Stats { counts: [ZERO; 8] }
    }
}

impl Stats {
    pub fn count(&self, op: Op) {
        self.counts[op as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, op: Op) -> u64 {
        self.counts[op as usize].load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        for c in &self.counts {
            c.store(0, Ordering::Relaxed);
        }
    }

    /// One `name count` line per operation.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, count) in OP_NAMES.iter().zip(&self.counts) {
            out.push_str(name);
            out.push(' ');
            out.push_str(&count.load(Ordering::Relaxed).to_string());
            out.push('\n');
        }
        out
    }
}
