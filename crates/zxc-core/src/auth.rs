//! Permission subjects and predicates
//!
//! An `AuthInfo` names the subject an operation runs as. Permission
//! checks evaluate the subject against an entry's `mode`/`uid`/`gid`
//! attributes, Unix-style. A missing subject (or permission checking
//! disabled at the filesystem level) always passes.

use crate::dir::Dir;
use crate::error::FsError;

/// Authenticated subject: a user id and its groups.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthInfo {
    pub uid: String,
    pub gids: Vec<String>,
}

impl AuthInfo {
    pub fn new(uid: impl Into<String>) -> AuthInfo {
        AuthInfo {
            uid: uid.into(),
            gids: Vec::new(),
        }
    }

    pub fn with_gids(uid: impl Into<String>, gids: &[&str]) -> AuthInfo {
        AuthInfo {
            uid: uid.into(),
            gids: gids.iter().map(|g| g.to_string()).collect(),
        }
    }

    fn in_group(&self, gid: &str) -> bool {
        self.gids.iter().any(|g| g == gid)
    }
}

// Bit offsets into the mode word for the three permission classes.
const OWNER: u32 = 6;
const GROUP: u32 = 3;
const OTHER: u32 = 0;

fn class_for(d: &Dir, ai: &AuthInfo) -> u32 {
    if ai.uid == d.uget("uid") {
        OWNER
    } else if ai.in_group(d.uget("gid")) {
        GROUP
    } else {
        OTHER
    }
}

fn has_bit(d: &Dir, ai: Option<&AuthInfo>, bit: u32) -> bool {
    let ai = match ai {
        Some(ai) => ai,
        None => return true,
    };
    d.mode() >> class_for(d, ai) & bit != 0
}

impl Dir {
    /// May the subject descend through this directory? (execute bit)
    pub fn can_walk(&self, ai: Option<&AuthInfo>) -> bool {
        has_bit(self, ai, 0o1)
    }

    /// May the subject read this entry's data? (read bit)
    pub fn can_get(&self, ai: Option<&AuthInfo>) -> bool {
        has_bit(self, ai, 0o4)
    }

    /// May the subject write this entry? (write bit)
    pub fn can_put(&self, ai: Option<&AuthInfo>) -> bool {
        has_bit(self, ai, 0o2)
    }

    /// May the subject apply the metadata delta `nd` to this entry?
    ///
    /// Keys equal to the current value are ignored. Ownership and mode
    /// changes need the owner; size and mtime need write permission;
    /// identity keys cannot be changed through wstat at all.
    pub fn can_wstat(&self, ai: Option<&AuthInfo>, nd: &Dir) -> Result<(), FsError> {
        let path = self.path().to_string();
        for (key, val) in nd.iter() {
            if self.uget(key) == val {
                continue;
            }
            match key {
                "mode" | "uid" | "gid" => {
                    if let Some(ai) = ai {
                        if ai.uid != self.uget("uid") {
                            return Err(FsError::Perm(path));
                        }
                    }
                }
                "size" | "mtime" => {
                    if !self.can_put(ai) {
                        return Err(FsError::Perm(path));
                    }
                }
                "name" | "path" | "type" | "addr" => {
                    return Err(FsError::Perm(path));
                }
                // unknown attributes ride along with write permission
                _ => {
                    if !self.can_put(ai) {
                        return Err(FsError::Perm(path));
                    }
                }
            }
        }
        Ok(())
    }
}
