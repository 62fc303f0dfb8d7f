//! ZXC - Caching filesystem front-end
//!
//! Sits between a client and a remote hierarchical file service and
//! serves the full filesystem API (stat, get, put, wstat, remove, move,
//! link, find) from an in-memory cache of metadata and file contents,
//! writing through or back to the remote as configured and riding out
//! transient remote outages by redialing.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       Fs (public API)                    │
//! │   stat · get · put · wstat · remove · move · link · find │
//! └───────────────┬──────────────────────────┬───────────────┘
//!                 │ walk (hand-over-hand     │ schedule
//!                 │ per-node locks)          │ write-back
//!                 ▼                          ▼
//! ┌──────────────────────────┐   ┌──────────────────────────┐
//! │   Cache (tree of Nodes)  │   │   Syncer (single task)   │
//! │   meta/data/dirty/gone   │   │   coalesce · redial      │
//! └───────────────┬──────────┘   └──────────┬───────────────┘
//!                 │ fetch on miss           │ flush dirty
//!                 ▼                         ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │              Remote (upstream file service)              │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Every cached entry carries its own async mutex; walks lock parent
//! then child and release the parent before descending, so no two
//! non-ancestor locks are ever held together except for the
//! deterministic two-parent ordering used by move.

pub mod ctl;
pub mod find;
pub mod fs;
pub mod node;
pub mod remote;
pub mod store;
pub mod syncer;
pub mod walk;

#[cfg(test)]
pub(crate) mod testfs;

pub use find::{DirStream, FindItem, MatchAll, Pred, Verdict};
pub use fs::Fs;
pub use remote::{ByteSink, ByteStream, Remote};
pub use walk::WalkMode;

pub use zxc_core::{AuthInfo, Config, Dir, EntryKind, FsError, ALL, CTL_NAME, CTL_PATH};

/// Bound on in-flight chunks in every byte or entry stream.
pub const STREAM_DEPTH: usize = 16;

/// Chunk size used when streaming cached file content.
pub const STREAM_CHUNK: usize = 64 * 1024;

/// Owner recorded for entries created with no authenticated subject.
pub const SYS_UID: &str = "sys";
