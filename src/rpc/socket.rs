//! 4.J Socket-RPC surface.
//!
//! Thin forwards onto the stack's socket API, the way `std_glue.rs`'s
//! helpers and `main.rs`'s `Opcode::StdTcpConnect`/`StdTcpTx` arms forward
//! into smoltcp -- generalized from the teacher's "one process, one
//! HashMap<SocketHandle>" bookkeeping into operations against a shared
//! [`Translator`] and the capability-table-backed [`UserView`].

use smoltcp::socket::{TcpSocket, TcpSocketBuffer, TcpState, UdpPacketMetadata, UdpSocket, UdpSocketBuffer};
use smoltcp::wire::IpEndpoint;

use crate::address::Address;
use crate::api::{Family, NetError, SockType};
use crate::capability::ObjRef;
use crate::context::{Translator, ADDRESS_BUCKET, CLASS_ADDRESS, CLASS_USER_VIEW, USER_VIEW_BUCKET};
use crate::socket::{make_user, Socket, UserView};

const TCP_BUFFER_LEN: usize = 16384;
const UDP_BUFFER_LEN: usize = 16384;
const UDP_METADATA_SLOTS: usize = 32;

fn new_tcp_socket() -> TcpSocket<'static> {
    TcpSocket::new(
        TcpSocketBuffer::new(vec![0u8; TCP_BUFFER_LEN]),
        TcpSocketBuffer::new(vec![0u8; TCP_BUFFER_LEN]),
    )
}

fn new_udp_socket() -> UdpSocket<'static> {
    UdpSocket::new(
        UdpSocketBuffer::new(vec![UdpPacketMetadata::EMPTY; UDP_METADATA_SLOTS], vec![0u8; UDP_BUFFER_LEN]),
        UdpSocketBuffer::new(vec![UdpPacketMetadata::EMPTY; UDP_METADATA_SLOTS], vec![0u8; UDP_BUFFER_LEN]),
    )
}

/// `create(master, type, proto) -> port`. spec.md §4.J: types restricted to
/// {stream, datagram, raw}; domain comes from the control node's bound
/// family, not a per-call argument.
pub fn create(tl: &Translator, iface_idx: usize, kind: SockType, master_isroot: bool, caller_uid: u32, caller_gid: u32) -> Result<ObjRef, NetError> {
    if tl.domain != Family::Inet && tl.domain != Family::Inet6 {
        return Err(NetError::InvalidFamily);
    }
    let registry = tl.registry.lock().unwrap();
    let iface = registry.interfaces.get(iface_idx).ok_or(NetError::NoSuchDevice)?;
    let mut sockets = iface.stack.sockets.lock().unwrap();
    let handle = match kind {
        SockType::Stream => sockets.add(new_tcp_socket()),
        SockType::Datagram => sockets.add(new_udp_socket()),
        SockType::Raw => return Err(NetError::Unsupported),
    };
    drop(sockets);
    drop(registry);

    let socket = Socket::new(handle, iface_idx, kind);
    let isroot = tl.isroot_for(master_isroot, caller_uid, caller_gid);
    let view = make_user(socket, isroot, false);
    Ok(tl.users.create_port(USER_VIEW_BUCKET, CLASS_USER_VIEW, view))
}

fn with_view<R>(tl: &Translator, view: ObjRef, f: impl FnOnce(&UserView) -> R) -> Result<R, NetError> {
    tl.users.with_value(view, f).ok_or(NetError::Invalid)
}

/// Resolves a view down to the stack-facing triple every handler below
/// needs before it can touch a `SocketSet`: the handle, which concrete
/// smoltcp socket type it was created as, and which interface's stack
/// instance owns it.
fn socket_meta(tl: &Translator, view: ObjRef) -> Result<(smoltcp::iface::SocketHandle, SockType, usize), NetError> {
    with_view(tl, view, |v| {
        let s = v.socket.lock().unwrap();
        (s.handle, s.kind, s.iface_idx)
    })
}

/// `bind`: a datagram socket binds directly against the stack; a stream
/// socket has no standalone bind in smoltcp, so the endpoint is held on the
/// `Socket` until the following `listen`/`connect` applies it.
pub fn bind(tl: &Translator, view: ObjRef, local: IpEndpoint) -> Result<(), NetError> {
    let (handle, kind, idx) = socket_meta(tl, view)?;
    match kind {
        SockType::Datagram => {
            let registry = tl.registry.lock().unwrap();
            let iface = registry.interfaces.get(idx).ok_or(NetError::Invalid)?;
            let mut sockets = iface.stack.sockets.lock().unwrap();
            let mut socket = sockets.get::<UdpSocket>(handle);
            socket.bind(local).map_err(|_| NetError::AddressInUse)
        }
        SockType::Stream => {
            tl.users.with_value_mut(view, |v| v.socket.lock().unwrap().pending_local = Some(local)).ok_or(NetError::Invalid)
        }
        SockType::Raw => Err(NetError::Unsupported),
    }
}

/// `connect`: opens a TCP connection for a stream socket. For a datagram
/// socket this instead records the default peer for `send`/`peername`
/// (POSIX UDP connect), since smoltcp's `UdpSocket` has no connection
/// state of its own.
pub fn connect(tl: &Translator, view: ObjRef, remote: IpEndpoint, local_port: u16) -> Result<(), NetError> {
    let (handle, kind, idx) = socket_meta(tl, view)?;
    match kind {
        SockType::Stream => {
            let registry = tl.registry.lock().unwrap();
            let iface = registry.interfaces.get(idx).ok_or(NetError::Invalid)?;
            let mut iface_stack = iface.stack.inner.lock().unwrap();
            let cx = iface_stack.context();
            let mut sockets = iface.stack.sockets.lock().unwrap();
            let mut socket = sockets.get::<TcpSocket>(handle);
            socket.connect(cx, remote, local_port).map_err(|_| NetError::InvalidValue)
        }
        SockType::Datagram => {
            tl.users.with_value_mut(view, |v| v.socket.lock().unwrap().pending_peer = Some(remote)).ok_or(NetError::Invalid)
        }
        SockType::Raw => Err(NetError::Unsupported),
    }
}

pub fn listen(tl: &Translator, view: ObjRef, local: IpEndpoint) -> Result<(), NetError> {
    let (handle, kind, idx) = socket_meta(tl, view)?;
    if kind != SockType::Stream {
        return Err(NetError::Unsupported);
    }
    let registry = tl.registry.lock().unwrap();
    let iface = registry.interfaces.get(idx).ok_or(NetError::Invalid)?;
    let mut sockets = iface.stack.sockets.lock().unwrap();
    let mut socket = sockets.get::<TcpSocket>(handle);
    socket.listen(local).map_err(|_| NetError::AddressInUse)
}

/// `accept`: delegate to the stack; on success wrap the descriptor in a
/// fresh user view (inheriting isroot) and the peer sockaddr in a fresh
/// address object. This crate's TCP sockets are each bound individually
/// (no listen-backlog fan-out), so "accept" here means: the listening
/// socket transitioned to `Established`; hand its handle to a fresh view
/// and replace the listener slot with a freshly allocated one so the next
/// `listen` has a socket to bind.
pub fn accept(tl: &Translator, listener: ObjRef) -> Result<(ObjRef, ObjRef), NetError> {
    let listener_isroot = with_view(tl, listener, |v| v.isroot)?;
    let (listener_handle, kind, idx) = socket_meta(tl, listener)?;
    if kind != SockType::Stream {
        return Err(NetError::Unsupported);
    }

    let registry = tl.registry.lock().unwrap();
    let iface = registry.interfaces.get(idx).ok_or(NetError::Invalid)?;
    let peer = {
        let mut sockets = iface.stack.sockets.lock().unwrap();
        let socket = sockets.get::<TcpSocket>(listener_handle);
        if socket.state() != TcpState::Established {
            return Err(NetError::WouldBlock);
        }
        socket.remote_endpoint()
    };

    let new_handle = {
        let mut sockets = iface.stack.sockets.lock().unwrap();
        sockets.add(new_tcp_socket())
    };
    drop(registry);

    let accepted_socket = Socket::new(listener_handle, idx, SockType::Stream);
    let accepted_view = make_user(accepted_socket, listener_isroot, false);
    let accepted_ref = tl.users.create_port(USER_VIEW_BUCKET, CLASS_USER_VIEW, accepted_view);

    let fresh_listener_socket = Socket::new(new_handle, idx, SockType::Stream);
    let fresh_view = make_user(fresh_listener_socket, listener_isroot, false);
    tl.users.with_value_mut(listener, |v| v.socket = fresh_view.socket.clone());

    let addr = Address::from_endpoint(peer);
    let addr_ref = tl.addresses.create_port(ADDRESS_BUCKET, CLASS_ADDRESS, addr);

    Ok((accepted_ref, addr_ref))
}

/// `shutdown`: closes a TCP connection. UDP sockets are connectionless, so
/// there's no stack-level state to tear down; the RPC still succeeds.
pub fn shutdown(tl: &Translator, view: ObjRef) -> Result<(), NetError> {
    let (handle, kind, idx) = socket_meta(tl, view)?;
    if kind != SockType::Stream {
        return Ok(());
    }
    let registry = tl.registry.lock().unwrap();
    let iface = registry.interfaces.get(idx).ok_or(NetError::Invalid)?;
    let mut sockets = iface.stack.sockets.lock().unwrap();
    let mut socket = sockets.get::<TcpSocket>(handle);
    socket.close();
    Ok(())
}

pub fn send(tl: &Translator, view: ObjRef, data: &[u8], nonblock: bool) -> Result<usize, NetError> {
    let (handle, kind, idx) = socket_meta(tl, view)?;
    match kind {
        SockType::Stream => {
            let registry = tl.registry.lock().unwrap();
            let iface = registry.interfaces.get(idx).ok_or(NetError::Invalid)?;
            let mut sockets = iface.stack.sockets.lock().unwrap();
            let mut socket = sockets.get::<TcpSocket>(handle);
            if !socket.can_send() {
                let _ = nonblock;
                return Err(NetError::WouldBlock);
            }
            socket.send_slice(data).map_err(|_| NetError::LibraryError)
        }
        SockType::Datagram => {
            let peer = tl
                .users
                .with_value(view, |v| v.socket.lock().unwrap().pending_peer)
                .flatten()
                .ok_or(NetError::InvalidValue)?;
            let registry = tl.registry.lock().unwrap();
            let iface = registry.interfaces.get(idx).ok_or(NetError::Invalid)?;
            let mut sockets = iface.stack.sockets.lock().unwrap();
            let mut socket = sockets.get::<UdpSocket>(handle);
            if !socket.can_send() {
                let _ = nonblock;
                return Err(NetError::WouldBlock);
            }
            socket.send_slice(data, peer).map_err(|_| NetError::LibraryError)?;
            Ok(data.len())
        }
        SockType::Raw => Err(NetError::Unsupported),
    }
}

pub fn recv(tl: &Translator, view: ObjRef, buf: &mut [u8], nonblock: bool) -> Result<usize, NetError> {
    let (handle, kind, idx) = socket_meta(tl, view)?;
    match kind {
        SockType::Stream => {
            let registry = tl.registry.lock().unwrap();
            let iface = registry.interfaces.get(idx).ok_or(NetError::Invalid)?;
            let mut sockets = iface.stack.sockets.lock().unwrap();
            let mut socket = sockets.get::<TcpSocket>(handle);
            if !socket.can_recv() {
                let _ = nonblock;
                return Err(NetError::WouldBlock);
            }
            socket.recv_slice(buf).map_err(|_| NetError::LibraryError)
        }
        SockType::Datagram => {
            let (n, peer) = {
                let registry = tl.registry.lock().unwrap();
                let iface = registry.interfaces.get(idx).ok_or(NetError::Invalid)?;
                let mut sockets = iface.stack.sockets.lock().unwrap();
                let mut socket = sockets.get::<UdpSocket>(handle);
                if !socket.can_recv() {
                    let _ = nonblock;
                    return Err(NetError::WouldBlock);
                }
                socket.recv_slice(buf).map_err(|_| NetError::LibraryError)?
            };
            tl.users.with_value_mut(view, |v| v.socket.lock().unwrap().pending_peer = Some(peer));
            Ok(n)
        }
        SockType::Raw => Err(NetError::Unsupported),
    }
}

pub fn name(tl: &Translator, view: ObjRef) -> Result<ObjRef, NetError> {
    let (handle, kind, idx) = socket_meta(tl, view)?;
    let registry = tl.registry.lock().unwrap();
    let iface = registry.interfaces.get(idx).ok_or(NetError::Invalid)?;
    let sockets = iface.stack.sockets.lock().unwrap();
    let ep = match kind {
        SockType::Stream => sockets.get::<TcpSocket>(handle).local_endpoint(),
        SockType::Datagram => sockets.get::<UdpSocket>(handle).endpoint().into(),
        SockType::Raw => return Err(NetError::Unsupported),
    };
    drop(sockets);
    drop(registry);
    let addr = Address::from_endpoint(ep);
    Ok(tl.addresses.create_port(ADDRESS_BUCKET, CLASS_ADDRESS, addr))
}

/// `peername`: the remote endpoint of a TCP connection, or the last peer a
/// UDP socket `connect`ed to or received from (smoltcp's `UdpSocket` keeps
/// no remote state of its own, so this crate tracks it on the `Socket`).
pub fn peername(tl: &Translator, view: ObjRef) -> Result<ObjRef, NetError> {
    let (handle, kind, idx) = socket_meta(tl, view)?;
    let ep = match kind {
        SockType::Stream => {
            let registry = tl.registry.lock().unwrap();
            let iface = registry.interfaces.get(idx).ok_or(NetError::Invalid)?;
            let sockets = iface.stack.sockets.lock().unwrap();
            sockets.get::<TcpSocket>(handle).remote_endpoint()
        }
        SockType::Datagram => tl
            .users
            .with_value(view, |v| v.socket.lock().unwrap().pending_peer)
            .flatten()
            .ok_or(NetError::InvalidValue)?,
        SockType::Raw => return Err(NetError::Unsupported),
    };
    let addr = Address::from_endpoint(ep);
    Ok(tl.addresses.create_port(ADDRESS_BUCKET, CLASS_ADDRESS, addr))
}

/// `create-address(family, bytes)`. spec.md §4.J: "family must be INET or
/// AF-unspec".
pub fn create_address(tl: &Translator, family: u8, len: u8, bytes: [u8; 18]) -> Result<ObjRef, NetError> {
    let addr = Address::from_wire(family, len, bytes).ok_or(NetError::InvalidFamily)?;
    Ok(tl.addresses.create_port(ADDRESS_BUCKET, CLASS_ADDRESS, addr))
}

pub fn whatis_address(tl: &Translator, addr_ref: ObjRef) -> Result<Address, NetError> {
    tl.addresses.with_value(addr_ref, |a| *a).ok_or(NetError::Invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Owner;

    fn fresh_translator() -> Translator {
        Translator::new(Family::Inet, Owner { uid: 0, gid: 0 })
    }

    #[test]
    fn create_then_lookup_resolves_the_same_socket() {
        let tl = fresh_translator();
        let view = create(&tl, 0, SockType::Datagram, false, 1, 1).unwrap();
        let idx = with_view(&tl, view, |v| v.socket.lock().unwrap().iface_idx).unwrap();
        assert_eq!(idx, 0);
    }

    #[test]
    fn raw_sockets_are_unsupported() {
        let tl = fresh_translator();
        assert_eq!(create(&tl, 0, SockType::Raw, false, 1, 1), Err(NetError::Unsupported));
    }

    #[test]
    fn isroot_promotes_on_owner_match() {
        let tl = Translator::new(Family::Inet, Owner { uid: 500, gid: 500 });
        assert!(tl.isroot_for(false, 500, 999));
        assert!(!tl.isroot_for(false, 1, 1));
    }

    #[test]
    fn create_address_rejects_bad_family() {
        let tl = fresh_translator();
        assert_eq!(create_address(&tl, 77, 8, [0; 18]), Err(NetError::InvalidFamily));
    }
}
