//! ZXC Core - Shared types for the zxc caching filesystem
//!
//! This crate contains the foundational types used by the cache engine:
//! directory entries, the error taxonomy, path handling, permission
//! predicates, and configuration. It has no dependency on the async
//! runtime or on any remote adapter.

pub mod auth;
pub mod config;
pub mod dir;
pub mod error;
pub mod path;

pub use auth::AuthInfo;
pub use config::{CacheConfig, Config, SyncConfig};
pub use dir::{Dir, EntryKind};
pub use error::FsError;

/// Address scheme stamped on every cached entry (`zxc!<path>`).
pub const ADDR_SCHEME: &str = "zxc";

/// Name of the synthetic control file.
pub const CTL_NAME: &str = "Ctl";

/// Absolute path of the synthetic control file.
pub const CTL_PATH: &str = "/Ctl";

/// Count value meaning "no limit" in get/find requests.
pub const ALL: i64 = -1;

/// Hidden bookkeeping names skipped in directory listings.
pub const HIDDEN_NAMES: &[&str] = &[".zx", ".#zx"];
