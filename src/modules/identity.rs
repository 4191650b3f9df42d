//! Substitute identity mapping.
//!
//! A remote export is often owned by a single service account. When a
//! substitute uid/gid is configured, objects owned by it are shown as owned
//! by whoever is asking, and ownership the caller asks for is sent to the
//! server as the substitute. The two directions swap the substitute id and
//! the caller id, so each is the inverse of the other.

/// Identity of the process behind one kernel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    /// Effective user id of the caller
    pub uid: u32,
    /// Effective group id of the caller
    pub gid: u32,
    /// Process id of the caller
    pub pid: u32,
}

impl Caller {
    /// Creates a caller identity.
    pub fn new(uid: u32, gid: u32, pid: u32) -> Self {
        Self { uid, gid, pid }
    }

    /// Identity of the current process.
    pub fn current() -> Self {
        Self {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            pid: std::process::id(),
        }
    }
}

impl From<&fuser::Request<'_>> for Caller {
    fn from(req: &fuser::Request<'_>) -> Self {
        Self::new(req.uid(), req.gid(), req.pid())
    }
}

/// Configured substitute identity. `None` means unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdentityMap {
    /// Substitute user id
    pub uid: Option<u32>,
    /// Substitute group id
    pub gid: Option<u32>,
}

fn swap(substitute: Option<u32>, ours: u32, theirs: u32) -> u32 {
    match substitute {
        Some(sub) if theirs == sub => ours,
        Some(sub) if theirs == ours => sub,
        _ => theirs,
    }
}

impl IdentityMap {
    /// Creates a map from the optional substitute ids.
    pub fn new(uid: Option<u32>, gid: Option<u32>) -> Self {
        Self { uid, gid }
    }

    /// Remote uid to the uid reported to `caller`.
    pub fn to_local_uid(&self, caller: &Caller, uid: u32) -> u32 {
        swap(self.uid, caller.uid, uid)
    }

    /// Remote gid to the gid reported to `caller`.
    pub fn to_local_gid(&self, caller: &Caller, gid: u32) -> u32 {
        swap(self.gid, caller.gid, gid)
    }

    /// Uid requested by `caller` to the uid sent to the server.
    pub fn to_remote_uid(&self, caller: &Caller, uid: u32) -> u32 {
        swap(self.uid, caller.uid, uid)
    }

    /// Gid requested by `caller` to the gid sent to the server.
    pub fn to_remote_gid(&self, caller: &Caller, gid: u32) -> u32 {
        swap(self.gid, caller.gid, gid)
    }

    /// Credentials the client should present on behalf of `caller`.
    pub fn rpc_credentials(&self, caller: &Caller) -> (u32, u32) {
        (
            self.uid.unwrap_or(caller.uid),
            self.gid.unwrap_or(caller.gid),
        )
    }
}
