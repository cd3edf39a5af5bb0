//! Wire-level constants, opcodes and payload shapes for the translator's RPC surfaces.
//!
//! Mirrors the style of a small, hand-written Xous `api.rs`: a server name
//! constant, an `Opcode` enum dispatched by `FromPrimitive`, and a handful of
//! `#[repr(C)]` structs that cross the IPC boundary via `xous_ipc::Buffer`.

pub const SERVER_NAME_NETXLATE: &str = "_TCP/IP translator_";

/// spec.md §4.H: the ingest thread's own server, distinct from the main
/// RPC loop so a device-delivery message can never queue behind a client
/// socket call (and vice versa).
pub const SERVER_NAME_NETXLATE_INGEST: &str = "_TCP/IP translator ingest_";

/// Bit OR'd into an opcode's scalar id by clients that want a non-blocking
/// variant of an otherwise-blocking call. Mirrors the teacher's own
/// `NONBLOCKING_FLAG` convention for encoding a caller-supplied flag in the
/// high bits of the message id rather than adding a parallel opcode.
pub const NONBLOCKING_FLAG: usize = 0x8000;

#[allow(dead_code)]
#[derive(num_derive::FromPrimitive, num_derive::ToPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    // --- socket-RPC surface (4.J) ---
    SocketCreate,
    SocketBind,
    SocketConnect,
    SocketConnect2,
    SocketListen,
    SocketAccept,
    SocketShutdown,
    SocketGetOpt,
    SocketSetOpt,
    SocketSend,
    SocketRecv,
    SocketName,
    SocketPeerName,
    SocketCreateAddress,
    SocketWhatIsAddress,

    // --- I/O-RPC surface (4.K) ---
    IoRead,
    IoWrite,
    IoSeek,
    IoReadable,
    IoGetOpenModes,
    IoSetAllOpenModes,
    IoSetSomeOpenModes,
    IoClearSomeOpenModes,
    IoSelect,
    IoSelectTimeout,
    IoStat,
    IoReauthenticate,
    IoRestrictAuth,
    IoDuplicate,
    IoIdentity,
    /// Catch-all for the surface-level "unsupported" stubs enumerated in
    /// spec.md §6 (revoke, async, mod_owner, get_owner, icky_async_id,
    /// server_version, pathconf, map, map_cntl, conch, eofnotify,
    /// pre/post_notify, readnotify, readsleep, sigio).
    IoUnsupportedStub,

    // --- interface-ioctl surface (4.L) ---
    IfIoctl,

    // --- control / trivfs surface ---
    RootIoRead,
    RootIoWrite,
    RootStat,
    Goaway,
    /// spec.md §6: runtime query that re-emits the `--interface`/-a/-m/-g/-A
    /// flags needed to reconstruct every currently configured non-loopback
    /// interface, so a supervisor can persist configuration across a restart.
    AppendArgs,

    // --- internal, not client-visible ---
    /// Fired by the ingest thread (or a device callback) to tell the main
    /// loop to poll the stack and service any pending timers.
    NetPump,
}

/// Errors returned to clients in an RPC reply, per spec.md §7's taxonomy.
/// Kept as a plain `Copy` enum encodable in a scalar reply slot, the way the
/// teacher's own (unpublished-in-this-pack) `NetError` is used throughout
/// `main.rs`/`std_glue.rs` -- this crate doesn't reach for `thiserror` or
/// `anyhow` because nothing in the retrieved corpus does either.
#[derive(num_derive::FromPrimitive, num_derive::ToPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    Ok = 0,
    Unsupported,
    AccessDenied,
    NoSuchDevice,
    AddressInUse,
    InvalidFamily,
    InvalidValue,
    Busy,
    WouldBlock,
    Interrupted,
    TimedOut,
    OutOfMemory,
    Invalid,
    LibraryError,
}

/// Socket type requested by `SocketCreate`. Only these three survive from
/// the POSIX `SOCK_*` space; spec.md §1 excludes arbitrary UNIX-domain
/// semantics so the family is tracked separately (see [`Family`]).
#[derive(num_derive::FromPrimitive, num_derive::ToPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockType {
    Stream,
    Datagram,
    Raw,
}

/// Address family honored by the translator. spec.md §1: "only INET and
/// INET6 families are honored".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Inet,
    Inet6,
}

/// `#[repr(C)]` payload for `SocketCreateAddress` / returned by `SocketName`,
/// `SocketPeerName`, `SocketAccept`. Mirrors spec.md §3's Address object: an
/// immutable family byte, length byte, and up to 14 payload bytes -- enough
/// for a `sockaddr_in` or `sockaddr_in6`.
#[repr(C)]
#[derive(Debug, Clone, Copy, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct WireAddress {
    pub family: u8,
    pub len: u8,
    /// port(2) + up to a full 16-byte IPv6 address, wide enough to carry
    /// `sockaddr_in6` without truncating the address (see `address.rs`).
    pub bytes: [u8; 18],
}

impl WireAddress {
    pub const EMPTY: WireAddress = WireAddress { family: 0, len: 0, bytes: [0; 18] };
}

/// Largest single `send`/`write` payload this translator accepts per call.
/// Callers making a larger write loop it across multiple RPCs, the way the
/// teacher's own `std_glue.rs` senders cap a single lend to one packet.
pub const MAX_RPC_PAYLOAD: usize = 1500;

/// Largest raw frame the ingest thread (4.H) accepts from a device-delivery
/// message: MTU plus room for an Ethernet header, matching
/// `iface::ethernet::Filter`'s own accept-length calculation.
pub const MAX_FRAME_LEN: usize = 1514;

/// Payload of a device-delivery message landing on the ingest thread's own
/// server (4.H): which interface's receive port the frame is destined for,
/// and the frame bytes themselves. The device-open/delivery RPC that
/// produces this message is out of this crate's core scope; this struct is
/// only the shape the ingest thread decodes once such a message arrives.
#[repr(C)]
#[derive(Debug, Clone, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct DeviceDeliver {
    pub port: u64,
    pub len: u16,
    pub frame: [u8; MAX_FRAME_LEN],
}

impl DeviceDeliver {
    pub const EMPTY: DeviceDeliver = DeviceDeliver { port: 0, len: 0, frame: [0; MAX_FRAME_LEN] };
}

/// Shared request envelope for every socket-RPC (4.J) and I/O-RPC (4.K) op
/// that needs more than fits in a blocking-scalar message: an address (for
/// bind/connect/listen), a byte payload (for send/write), or an openmodes
/// word (for read/write/select). Not every field is meaningful for every
/// opcode; `main.rs`'s dispatcher reads only the ones the opcode in
/// question defines. One shared shape keeps the `xous_ipc::Buffer` glue in
/// one place instead of duplicating a near-identical struct per opcode.
#[repr(C)]
#[derive(Debug, Clone, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct RpcRequest {
    /// A `USER_VIEW_BUCKET` port for every socket-RPC/I-O-RPC opcode except
    /// `SocketWhatIsAddress`, which instead carries an `ADDRESS_BUCKET`
    /// port (the address object being resolved, not a socket view).
    pub view_port: u64,
    pub addr: WireAddress,
    pub open_modes: u32,
    pub len: u16,
    /// `IfIoctl` only: the [`crate::rpc::ifioctl::IoctlCode`] discriminant
    /// and whether the caller's view carries isroot.
    pub ioctl_code: u16,
    pub is_root: u8,
    /// `IfIoctl` only: zero-terminated interface name.
    pub name: [u8; 16],
    pub data: [u8; MAX_RPC_PAYLOAD],
}

impl RpcRequest {
    pub const EMPTY: RpcRequest = RpcRequest {
        view_port: 0,
        addr: WireAddress::EMPTY,
        open_modes: 0,
        len: 0,
        ioctl_code: 0,
        is_root: 0,
        name: [0; 16],
        data: [0; MAX_RPC_PAYLOAD],
    };
}

/// Reply counterpart to [`RpcRequest`]. `error` is a [`NetError`] discriminant;
/// `NetError::Ok as u8` signals success.
#[repr(C)]
#[derive(Debug, Clone, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct RpcReply {
    pub error: u8,
    pub new_view_port: u64,
    pub addr: WireAddress,
    pub len: u16,
    /// `IoGetOpenModes`/`IoSelect[Timeout]`/`IfIoctl` (`SIOCGIFFLAGS`) only.
    pub open_modes: u32,
    pub data: [u8; MAX_RPC_PAYLOAD],
}

impl RpcReply {
    pub const EMPTY: RpcReply = RpcReply {
        error: 0,
        new_view_port: 0,
        addr: WireAddress::EMPTY,
        len: 0,
        open_modes: 0,
        data: [0; MAX_RPC_PAYLOAD],
    };

    pub fn err(code: NetError) -> RpcReply {
        RpcReply { error: code as u8, ..RpcReply::EMPTY }
    }
}
