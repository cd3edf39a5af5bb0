//! 4.K I/O-RPC surface.
//!
//! The filesystem-facing read/write/select/stat/identity verbs every
//! trivfs-style node answers, layered over the same stack sockets the
//! socket-RPC surface (4.J) uses. Grounded in `hurdtunif.c`'s
//! `trivfs_S_io_*` handlers for the blocking/non-blocking and select
//! semantics, generalized from "one TUN queue" to "whatever object the
//! capability resolved to".

use std::time::Duration;

use crate::api::NetError;
use crate::capability::ObjRef;
use crate::context::{Translator, CLASS_USER_VIEW, USER_VIEW_BUCKET};
use crate::rpc::socket;
use crate::socket::{make_user, UserView};

pub const OPENMODE_NONBLOCK: u32 = 0x1;

/// `seek`: spec.md §4.K -- "always fails with invalid seek; socket handles
/// are not seekable."
pub fn seek() -> Result<(), NetError> {
    Err(NetError::Unsupported)
}

pub fn read(tl: &Translator, view: ObjRef, buf: &mut [u8], open_modes: u32) -> Result<usize, NetError> {
    socket::recv(tl, view, buf, open_modes & OPENMODE_NONBLOCK != 0)
}

pub fn write(tl: &Translator, view: ObjRef, data: &[u8], open_modes: u32) -> Result<usize, NetError> {
    socket::send(tl, view, data, open_modes & OPENMODE_NONBLOCK != 0)
}

pub fn readable(tl: &Translator, view: ObjRef) -> usize {
    let mut buf = [0u8; 0];
    match socket::recv(tl, view, &mut buf, true) {
        Ok(_) => 1,
        Err(_) => 0,
    }
}

/// `get-openmodes`/`set-all-openmodes`/`set-some-openmodes`/`clear-some-openmodes`:
/// only the non-blocking bit has stack-visible meaning (spec.md §4.K);
/// every other requested bit is accepted and stored but otherwise inert.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenModes(pub u32);

impl OpenModes {
    pub fn set_all(&mut self, modes: u32) {
        self.0 = modes;
    }
    pub fn set_some(&mut self, bits: u32) {
        self.0 |= bits;
    }
    pub fn clear_some(&mut self, bits: u32) {
        self.0 &= !bits;
    }
    pub fn is_nonblocking(&self) -> bool {
        self.0 & OPENMODE_NONBLOCK != 0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SelectMask {
    pub read: bool,
    pub write: bool,
}

/// `select[_timeout]`: spec.md §4.K -- translate the requested mask,
/// delegate, translate back. `timeout` is `None` for an indefinite wait,
/// `Some(Duration::ZERO)` for a poll, `Some(d)` otherwise (both the
/// absolute- and relative-time overloads convert down to this before
/// calling in, matching §4.K's "the implementation converts").
///
/// "check-after-arm" (spec.md §9): each iteration re-checks readiness
/// before parking, so a wakeup racing the check is never missed. The wait
/// itself parks on the owning interface's [`crate::iface::Stack::wake`]
/// condvar, the same one `Stack::poll` notifies after every poll tick,
/// instead of spinning; `inner` stands in as the condvar's paired mutex
/// since `recv`/`send` never lock it (only `sockets`), so waiting here
/// can't deadlock against a concurrent read/write on the same socket.
pub fn select(tl: &Translator, view: ObjRef, requested: SelectMask, timeout: Option<Duration>) -> SelectMask {
    let deadline = timeout.map(|d| std::time::Instant::now() + d);
    let iface_idx = match tl.users.with_value(view, |v| v.socket.lock().unwrap().iface_idx) {
        Some(idx) => idx,
        None => return SelectMask::default(),
    };
    let stack = match tl.registry.lock().unwrap().interfaces.get(iface_idx) {
        Some(iface) => iface.stack.clone(),
        None => return SelectMask::default(),
    };

    loop {
        let mut result = SelectMask::default();
        if requested.read {
            result.read = readable(tl, view) > 0;
        }
        if requested.write {
            // TCP/UDP sockets backing the socket-RPC surface are always
            // writable from this crate's point of view (the stack buffers
            // internally); only the TUN queue's own select path (4.F) has
            // a real backpressure signal, exposed separately via
            // `TunDriver::select_writable`.
            result.write = true;
        }
        if (result.read && requested.read) || (result.write && requested.write) {
            return result;
        }

        let guard = stack.inner.lock().unwrap();
        let wait_for = match deadline {
            Some(d) => {
                let now = std::time::Instant::now();
                if now >= d {
                    return SelectMask::default();
                }
                (d - now).min(Duration::from_millis(200))
            }
            None => Duration::from_millis(200),
        };
        let _ = stack.wake.wait_timeout(guard, wait_for).unwrap();
    }
}

pub struct StatInfo {
    pub file_id: u64,
    pub mode: u32,
    pub block_size: u32,
}

pub const S_IFSOCK: u32 = 0o140000;

pub fn stat(tl: &Translator, view: ObjRef) -> Result<StatInfo, NetError> {
    let handle = tl.users.with_value(view, |v| v.socket.lock().unwrap().handle).ok_or(NetError::Invalid)?;
    Ok(StatInfo { file_id: handle_as_u64(handle), mode: S_IFSOCK | 0o777, block_size: 512 })
}

fn handle_as_u64(handle: smoltcp::iface::SocketHandle) -> u64 {
    // SocketHandle doesn't expose its index publicly; Debug-format it and
    // hash it down rather than transmuting. Good enough for an opaque
    // "file id" clients only ever compare for equality.
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut h = DefaultHasher::new();
    format!("{:?}", handle).hash(&mut h);
    h.finish()
}

/// `reauthenticate`: spec.md §4.K -- build a shadow view with `noinstall`,
/// recompute isroot once the authentication server's answer is in hand,
/// then install it. The authentication-server round trip itself lives
/// outside the core surface (it is an RPC to another translator, not
/// stack-facing logic); callers pass in the already-resolved uid/gid sets.
pub fn reauthenticate(tl: &Translator, view: ObjRef, caller_uid: u32, caller_gid: u32) -> Result<ObjRef, NetError> {
    let (socket, prior_isroot) = tl.users.with_value(view, |v| (v.socket.clone(), v.isroot)).ok_or(NetError::Invalid)?;
    let isroot = tl.isroot_for(prior_isroot, caller_uid, caller_gid);
    let shadow = make_user(socket, isroot, true);
    Ok(tl.users.create_port(USER_VIEW_BUCKET, CLASS_USER_VIEW, shadow))
}

/// `restrict-auth`: same recomputation, no authentication-server round
/// trip.
pub fn restrict_auth(tl: &Translator, view: ObjRef, uids: &[u32], gids: &[u32]) -> Result<ObjRef, NetError> {
    let (socket, prior_isroot) = tl.users.with_value(view, |v| (v.socket.clone(), v.isroot)).ok_or(NetError::Invalid)?;
    let isroot = prior_isroot && uids.iter().any(|&u| u == tl.owner.uid) && gids.iter().any(|&g| g == tl.owner.gid);
    let narrowed = make_user(socket, isroot, false);
    Ok(tl.users.create_port(USER_VIEW_BUCKET, CLASS_USER_VIEW, narrowed))
}

pub fn duplicate(tl: &Translator, view: ObjRef) -> Result<ObjRef, NetError> {
    let (socket, isroot) = tl.users.with_value(view, |v: &UserView| (v.socket.clone(), v.isroot)).ok_or(NetError::Invalid)?;
    let dup = make_user(socket, isroot, false);
    Ok(tl.users.create_port(USER_VIEW_BUCKET, CLASS_USER_VIEW, dup))
}

/// `identity`: lazy-allocate the socket's identity port if needed.
/// `alloc_port` mints a fresh kernel port name the caller's capability
/// table owns.
pub fn identity(tl: &Translator, view: ObjRef, alloc_port: impl FnOnce() -> u64) -> Result<(u64, u64, u64), NetError> {
    let socket = tl.users.with_value(view, |v| v.socket.clone()).ok_or(NetError::Invalid)?;
    let mut s = socket.lock().unwrap();
    let id = s.identity(alloc_port);
    let fs_identity = id; // same port doubles as the filesystem identity, per spec.md §4.K
    let descriptor = handle_as_u64(s.handle);
    Ok((id, fs_identity, descriptor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Family, SockType};
    use crate::context::Owner;
    use crate::rpc::socket as sock_rpc;

    fn fresh_translator() -> Translator {
        Translator::new(Family::Inet, Owner { uid: 10, gid: 10 })
    }

    #[test]
    fn seek_is_always_unsupported() {
        assert_eq!(seek(), Err(NetError::Unsupported));
    }

    #[test]
    fn duplicate_preserves_socket_identity() {
        let tl = fresh_translator();
        let view = sock_rpc::create(&tl, 0, SockType::Datagram, false, 1, 1).unwrap();
        let dup = duplicate(&tl, view).unwrap();
        let h1 = tl.users.with_value(view, |v| v.socket.lock().unwrap().handle).unwrap();
        let h2 = tl.users.with_value(dup, |v| v.socket.lock().unwrap().handle).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn identity_is_allocated_once_and_stable() {
        let tl = fresh_translator();
        let view = sock_rpc::create(&tl, 0, SockType::Datagram, false, 1, 1).unwrap();
        let mut next = 1000u64;
        let (id1, _, _) = identity(&tl, view, || {
            next += 1;
            next
        })
        .unwrap();
        let (id2, _, _) = identity(&tl, view, || panic!("must not allocate twice")).unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn restrict_auth_without_owner_match_drops_isroot() {
        let tl = fresh_translator();
        let view = sock_rpc::create(&tl, 0, SockType::Datagram, true, 10, 10).unwrap();
        let narrowed = restrict_auth(&tl, view, &[1, 2], &[1, 2]).unwrap();
        assert!(!tl.users.with_value(narrowed, |v| v.isroot).unwrap());
    }

    #[test]
    fn select_for_write_returns_immediately_without_parking() {
        let tl = fresh_translator();
        let view = sock_rpc::create(&tl, 0, SockType::Datagram, false, 1, 1).unwrap();
        let requested = SelectMask { read: false, write: true };
        let start = std::time::Instant::now();
        let result = select(&tl, view, requested, Some(Duration::from_secs(5)));
        assert!(result.write);
        assert!(start.elapsed() < Duration::from_millis(100), "write-ready select must not park");
    }

    #[test]
    fn select_for_read_times_out_when_nothing_arrives() {
        let tl = fresh_translator();
        let view = sock_rpc::create(&tl, 0, SockType::Datagram, false, 1, 1).unwrap();
        let requested = SelectMask { read: true, write: false };
        let result = select(&tl, view, requested, Some(Duration::from_millis(50)));
        assert!(!result.read);
    }
}
