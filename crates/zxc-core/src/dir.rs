//! Directory entries
//!
//! A `Dir` is an ordered map of small string keys to string values
//! describing one filesystem entry. Every materialized entry carries
//! `name`, `path`, `type`, `mode`, `size`, `mtime`, `uid`, `gid`,
//! `wuid` and `addr`. The entry type is an enum internally and a
//! one-character string at the boundary; listing streams carry entries
//! serialized with bincode behind a 4-byte little-endian length prefix.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::FsError;
use crate::ADDR_SCHEME;

/// Type of a filesystem entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    /// Directory (`d`).
    Dir,
    /// Regular file (`-`).
    File,
    /// Control file (`c`).
    Ctl,
}

impl EntryKind {
    /// Parse the boundary form. `D` and `F` are the client-side
    /// create-with-parents discriminators and are not accepted here;
    /// the put boundary normalizes them first.
    pub fn parse(s: &str) -> Option<EntryKind> {
        match s {
            "d" => Some(EntryKind::Dir),
            "-" => Some(EntryKind::File),
            "c" => Some(EntryKind::Ctl),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Dir => "d",
            EntryKind::File => "-",
            EntryKind::Ctl => "c",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One directory entry: an ordered attribute map.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dir(BTreeMap<String, String>);

impl Dir {
    pub fn new() -> Dir {
        Dir(BTreeMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Attribute value, or `""` when absent.
    pub fn uget(&self, key: &str) -> &str {
        self.get(key).unwrap_or("")
    }

    pub fn set(&mut self, key: impl Into<String>, val: impl Into<String>) {
        self.0.insert(key.into(), val.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn name(&self) -> &str {
        self.uget("name")
    }

    pub fn path(&self) -> &str {
        self.uget("path")
    }

    /// Entry type, when the `type` attribute holds a valid form.
    pub fn kind(&self) -> Option<EntryKind> {
        EntryKind::parse(self.uget("type"))
    }

    pub fn set_kind(&mut self, kind: EntryKind) {
        self.set("type", kind.as_str());
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == Some(EntryKind::Dir)
    }

    /// Size in bytes; unparseable or missing reads as 0.
    pub fn size(&self) -> u64 {
        self.uget("size").parse().unwrap_or(0)
    }

    pub fn set_size(&mut self, size: u64) {
        self.set("size", size.to_string());
    }

    /// Permission bits, parsed from the octal `mode` attribute.
    pub fn mode(&self) -> u32 {
        u32::from_str_radix(self.uget("mode").trim_start_matches("0o"), 8).unwrap_or(0)
    }

    pub fn set_mode(&mut self, mode: u32) {
        self.set("mode", format!("{:04o}", mode));
    }

    /// Modification time in nanoseconds since the epoch.
    pub fn mtime(&self) -> u64 {
        self.uget("mtime").parse().unwrap_or(0)
    }

    pub fn set_mtime(&mut self, nanos: u64) {
        self.set("mtime", nanos.to_string());
    }

    pub fn set_mtime_now(&mut self) {
        self.set_mtime(now_nanos());
    }

    /// Stamp the cache address: `zxc!<path>`.
    pub fn rewrite_addr(&mut self) {
        let addr = format!("{}!{}", ADDR_SCHEME, self.path());
        self.set("addr", addr);
    }

    /// The path component of the `addr` attribute (`scheme!path`).
    pub fn addr_path(&self) -> &str {
        let addr = self.uget("addr");
        match addr.rfind('!') {
            Some(i) => &addr[i + 1..],
            None => addr,
        }
    }

    /// Wire form for listing streams: bincode behind a 4-byte
    /// little-endian length prefix.
    pub fn to_bytes(&self) -> Vec<u8> {
        let body = bincode::serialize(&self.0).expect("dir serialization");
        let mut buf = Vec::with_capacity(4 + body.len());
        buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
        buf.extend_from_slice(&body);
        buf
    }

    /// Decode one wire-form entry, returning it and the bytes consumed.
    pub fn from_bytes(buf: &[u8]) -> Result<(Dir, usize), FsError> {
        if buf.len() < 4 {
            return Err(FsError::Io(String::new(), "short dir entry".into()));
        }
        let n = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if buf.len() < 4 + n {
            return Err(FsError::Io(String::new(), "short dir entry".into()));
        }
        let map = bincode::deserialize(&buf[4..4 + n])
            .map_err(|e| FsError::Io(String::new(), e.to_string()))?;
        Ok((Dir(map), 4 + n))
    }
}

impl fmt::Display for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        for (k, v) in self.iter() {
            write!(f, "{}{}={:?}", sep, k, v)?;
            sep = " ";
        }
        Ok(())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Dir {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Dir {
        Dir(iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect())
    }
}

/// Current time in nanoseconds since the epoch.
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Dir {
        Dir::from_iter([
            ("name", "f"),
            ("path", "/d/f"),
            ("type", "-"),
            ("mode", "0644"),
            ("size", "5"),
            ("uid", "ana"),
        ])
    }

    #[test]
    fn test_kind_boundary_forms() {
        assert_eq!(EntryKind::parse("d"), Some(EntryKind::Dir));
        assert_eq!(EntryKind::parse("-"), Some(EntryKind::File));
        assert_eq!(EntryKind::parse("c"), Some(EntryKind::Ctl));
        assert_eq!(EntryKind::parse("D"), None);
        assert_eq!(EntryKind::parse("F"), None);
        assert_eq!(EntryKind::Dir.as_str(), "d");
    }

    #[test]
    fn test_typed_accessors() {
        let d = sample();
        assert_eq!(d.kind(), Some(EntryKind::File));
        assert!(!d.is_dir());
        assert_eq!(d.size(), 5);
        assert_eq!(d.mode(), 0o644);
        assert_eq!(d.name(), "f");
        assert_eq!(d.uget("missing"), "");
    }

    #[test]
    fn test_addr_rewrite() {
        let mut d = sample();
        d.set("addr", "lfs!/tmp/d/f");
        d.rewrite_addr();
        assert_eq!(d.uget("addr"), "zxc!/d/f");
        assert_eq!(d.addr_path(), "/d/f");
    }

    #[test]
    fn test_wire_roundtrip() {
        let d = sample();
        let buf = d.to_bytes();
        let (got, used) = Dir::from_bytes(&buf).unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(got, d);

        // Two entries back to back decode one at a time.
        let mut two = d.to_bytes();
        two.extend_from_slice(&sample().to_bytes());
        let (_, used) = Dir::from_bytes(&two).unwrap();
        let (second, _) = Dir::from_bytes(&two[used..]).unwrap();
        assert_eq!(second, d);
    }

    #[test]
    fn test_wire_short_input() {
        assert!(Dir::from_bytes(&[1, 0]).is_err());
        let mut buf = sample().to_bytes();
        buf.truncate(buf.len() - 1);
        assert!(Dir::from_bytes(&buf).is_err());
    }
}
