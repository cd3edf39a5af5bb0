//! 4.B Socket object and 4.C user view.
//!
//! Generalizes the teacher's single `SocketHandle` entries in
//! `main.rs::process_sockets` into the two-layer shared-ownership shape
//! spec.md §3/§4.B/§4.C calls for: one [`Socket`] per stack-level descriptor,
//! shared by possibly many [`UserView`] capabilities (duplicate,
//! restrict-auth, reauthenticate all mint a new view over the same socket).

use std::sync::{Arc, Mutex};

use smoltcp::iface::SocketHandle;
use smoltcp::wire::IpEndpoint;

use crate::api::SockType;
use crate::capability::PortName;

/// Sentinel used before an identity port has ever been requested. spec.md
/// §4.B: "The identity port is lazily allocated on the first `identity` RPC
/// so that sockets that never need an identity pay nothing."
const NO_IDENTITY: PortName = 0;

/// Wraps one stack-level socket. `users` is the view refcount described in
/// spec.md §3 ("a reference count separate from capability-table refcount
/// to allow multiple *user views* to share one underlying socket").
///
/// Generic over the handle type so the refcount/identity bookkeeping can be
/// unit-tested without constructing a real [`SocketHandle`] (smoltcp only
/// hands those out via `Interface::add_socket`). Production code always
/// uses the default `H = SocketHandle`.
pub struct Socket<H = SocketHandle> {
    pub handle: H,
    /// Index into the translator's interface registry this socket's stack
    /// instance lives under, so a handle can be resolved without scanning
    /// every interface's socket set (see [`crate::iface::Registry::route_for`]).
    pub iface_idx: usize,
    /// What this handle was created as. `SocketSet::get::<T>` panics if `T`
    /// doesn't match the socket's actual stored type, so every RPC handler
    /// must branch on this before touching the stack (stream vs datagram
    /// sockets are two disjoint smoltcp types sharing one `SocketHandle`
    /// space).
    pub kind: SockType,
    /// Local endpoint requested by a prior `bind` on a stream socket.
    /// smoltcp's `TcpSocket` has no standalone bind; the endpoint is held
    /// here until the subsequent `listen`/`connect` applies it.
    pub pending_local: Option<IpEndpoint>,
    /// Peer endpoint established by `connect` on a datagram socket (POSIX
    /// UDP connect semantics: a default destination for `send`, and the
    /// most recent sender's address otherwise used by `peername`).
    pub pending_peer: Option<IpEndpoint>,
    identity: PortName,
    users: u32,
}

impl<H> Socket<H> {
    pub fn new(handle: H, iface_idx: usize, kind: SockType) -> Arc<Mutex<Socket<H>>> {
        Arc::new(Mutex::new(Socket {
            handle,
            iface_idx,
            kind,
            pending_local: None,
            pending_peer: None,
            identity: NO_IDENTITY,
            users: 0,
        }))
    }

    /// Lazily allocates an identity port the first time it's asked for.
    /// `alloc` mints a fresh port name (owned by the caller's capability
    /// table); subsequent calls return the same value.
    pub fn identity(&mut self, alloc: impl FnOnce() -> PortName) -> PortName {
        if self.identity == NO_IDENTITY {
            self.identity = alloc();
        }
        self.identity
    }

    pub fn has_identity(&self) -> bool {
        self.identity != NO_IDENTITY
    }

    pub fn identity_port(&self) -> PortName {
        self.identity
    }
}

/// A client-facing capability over a shared [`Socket`]. Created by
/// `make_user`; `noinstall` mirrors spec.md §4.C's "asks the table to skip
/// registering the port in the listening set", used for the transient
/// handoff during `reauthenticate`.
pub struct UserView<H = SocketHandle> {
    pub socket: Arc<Mutex<Socket<H>>>,
    pub isroot: bool,
}

/// Factory described in spec.md §4.C. Bumps the socket's user-refcount;
/// `release_view` (called from the capability table's class cleanup when a
/// view's port is destroyed) drops it and closes the socket on the last
/// release.
pub fn make_user<H>(socket: Arc<Mutex<Socket<H>>>, isroot: bool, _noinstall: bool) -> UserView<H> {
    socket.lock().unwrap().users += 1;
    UserView { socket, isroot }
}

/// Releases one user-refcount from `socket`. Returns `true` when this was
/// the last view, signaling the caller to close the underlying stack
/// socket and destroy the identity port (spec.md §3: "destroyed when the
/// last user view is released").
pub fn release_view<H>(socket: &Arc<Mutex<Socket<H>>>) -> bool {
    let mut s = socket.lock().unwrap();
    s.users -= 1;
    s.users == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_lazy_and_stable() {
        let socket = Socket::new(7u32, 0, SockType::Datagram);
        assert!(!socket.lock().unwrap().has_identity());
        let mut calls = 0;
        let first = socket.lock().unwrap().identity(|| { calls += 1; 99 });
        let second = socket.lock().unwrap().identity(|| { calls += 1; 100 });
        assert_eq!(first, 99);
        assert_eq!(second, 99, "identity must be stable once allocated");
        assert_eq!(calls, 1, "allocator must only run once");
    }

    #[test]
    fn last_view_release_reports_true() {
        let socket = Socket::new(7u32, 0, SockType::Datagram);
        let v1 = make_user(socket.clone(), false, false);
        let v2 = make_user(socket.clone(), false, false);
        assert!(!release_view(&v1.socket));
        assert!(release_view(&v2.socket));
    }
}
