#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

use num_traits::*;
use std::thread;
use std::time::Duration as StdDuration;

use xous_ipc::Buffer;

use netxlate::address::Address;
use netxlate::api::{self, NetError, Opcode, RpcReply, RpcRequest, SockType};
use netxlate::capability::{BucketId, ObjRef};
use netxlate::config::{self, ParseHook};
use netxlate::context::{Owner, Translator, ADDRESS_BUCKET, CLASS_ADDRESS, CLASS_CONTROL, CONTROL_BUCKET, USER_VIEW_BUCKET};
use netxlate::demux::{self, Surfaces};
use netxlate::rpc::ifioctl::{self, IfReq, IoctlResult};
use netxlate::rpc::{io as io_rpc, socket as socket_rpc};

mod cli;

fn main() -> ! {
    log_server::init_wait().unwrap();
    log::set_max_level(log::LevelFilter::Info);
    log::info!("my PID is {}", xous::process::id());

    let xns = xous_names::XousNames::new().unwrap();
    let net_sid = xns
        .register_name(api::SERVER_NAME_NETXLATE, None)
        .expect("can't register server");
    log::trace!("registered with NS -- {:?}", net_sid);

    let ingest_sid = xns
        .register_name(api::SERVER_NAME_NETXLATE_INGEST, None)
        .expect("can't register ingest server");

    let args = cli::parse_args(std::env::args().skip(1)).unwrap_or_else(|e| fatal(&format!("option-parse failure: {}", e)));

    let owner = Owner { uid: 0, gid: 0 };
    let translator = Translator::new(args.domain, owner);

    apply_interfaces(&translator, args.hook).unwrap_or_else(|e| fatal(&format!("interface configuration failed: {:?}", e)));

    let ticktimer = ticktimer_server::Ticktimer::new().unwrap();
    spawn_pump_thread(net_sid);
    spawn_ingest_thread(ingest_sid, translator.ingest.clone());

    log::info!("translator ready, entering RPC loop");
    loop {
        let mut msg = xous::receive_message(net_sid).unwrap();
        match FromPrimitive::from_usize(msg.body.id() & !(api::NONBLOCKING_FLAG)) {
            Some(Opcode::NetPump) => {
                let now = smoltcp::time::Instant::from_millis(ticktimer.elapsed_ms() as i64);
                let registry = translator.registry.lock().unwrap();
                for iface in registry.interfaces.iter() {
                    iface.stack.poll(now);
                }
            }
            Some(Opcode::SocketCreate) => xous::msg_blocking_scalar_unpack!(msg, kind, isroot, uid, gid, {
                let kind = match kind {
                    0 => SockType::Stream,
                    1 => SockType::Datagram,
                    _ => SockType::Raw,
                };
                let iface_idx = translator.registry.lock().unwrap().route_for(None).unwrap_or(0);
                let result = netxlate::rpc::socket::create(&translator, iface_idx, kind, isroot != 0, uid as u32, gid as u32);
                let code = match result {
                    Ok(obj) => obj.port as usize,
                    Err(e) => usize::MAX - (e.to_usize().unwrap()),
                };
                xous::return_scalar(msg.sender, code).ok();
            }),
            Some(Opcode::Goaway) => {
                log::info!("goaway received, exiting");
                std::process::exit(0);
            }
            Some(Opcode::AppendArgs) => {
                if let Some(mem) = msg.body.memory_message_mut() {
                    let mut buf = unsafe { Buffer::from_memory_message_mut(mem) };
                    let args = translator.registry.lock().unwrap().append_args().join(" ");
                    let mut reply = RpcReply::EMPTY;
                    let bytes = args.as_bytes();
                    let n = bytes.len().min(reply.data.len());
                    reply.data[..n].copy_from_slice(&bytes[..n]);
                    reply.len = n as u16;
                    reply.error = NetError::Ok as u8;
                    buf.replace(reply).ok();
                }
            }
            // The remaining socket-RPC, I/O-RPC and interface-ioctl opcodes are dispatched
            // through the ordered demuxer (4.M) rather than matched here one at a time; see
            // `dispatch_via_demuxer`. This arm list only breaks out the opcodes that need the
            // translator-global state (NetPump, AppendArgs) or that never carry a socket-user
            // owner (SocketCreate, Goaway).
            Some(_) => dispatch_via_demuxer(&translator, &mut msg),
            None => log::warn!("received unknown opcode {}", msg.body.id()),
        }
    }
}

/// spec.md §4.I "Apply": construct interfaces in reverse argument order so
/// the stack's internal list ends up in the order given on the command
/// line.
fn apply_interfaces(translator: &Translator, hook: ParseHook) -> Result<(), config::ConfigError> {
    let mut registry = translator.registry.lock().unwrap();
    for parsed in hook.interfaces.into_iter().rev() {
        if parsed.addr == netxlate::iface::SENTINEL_V4 {
            log::info!("interface {} has no address, skipping", parsed.name);
            continue;
        }
        config::validate(&parsed)?;
        // Driver-factory selection by name prefix (4.I): tun* -> TUN,
        // "lo" -> loopback (already installed and never recreated),
        // otherwise -> Ethernet. The device port an Ethernet interface
        // talks to is opened during the bootstrap handshake with the
        // parent translator (out of this crate's core scope, per spec.md
        // §1); `Registry::install` seeds a `NullPort` until that handshake
        // replaces it, so the socket-RPC/ioctl surfaces have a live stack
        // instance to read immediately. An Ethernet interface's ingest
        // route (4.H) is registered as part of the same call, under a port
        // minted from the translator's own ingest-port table.
        if parsed.name != netxlate::iface::LOOPBACK_NAME {
            let ingest_ports = translator.ingest_ports.clone();
            let idx = registry.install(&parsed, &translator.ingest, || ingest_ports.create_port(CONTROL_BUCKET, CLASS_CONTROL, ()).port);
            log::info!("configured interface {} (index {}) addr={} mask={}", parsed.name, idx, parsed.addr, parsed.mask);
        }
    }
    drop(registry);
    Ok(())
}

/// Dedicated worker that periodically asks the main loop to poll the
/// stack, in the spirit of the teacher's `MAX_DELAY_THREADS` pool of
/// delayed-wakeup workers (here collapsed to one steady heartbeat, since
/// this crate's suspension points re-arm on socket/queue events rather
/// than needing N independent timers).
fn spawn_pump_thread(sid: xous::SID) {
    let cid = xous::connect(sid).unwrap();
    thread::spawn(move || loop {
        thread::sleep(StdDuration::from_millis(50));
        xous::send_message(cid, xous::Message::new_scalar(Opcode::NetPump.to_usize().unwrap(), 0, 0, 0, 0)).ok();
    });
}

/// 4.H packet-ingest thread: the sole code path that drives interface RX,
/// bound to its own server so a device-delivery message never queues
/// behind an ordinary client call. Blocks on `ingest_sid`, decodes a
/// [`api::DeviceDeliver`] payload, and hands it to [`IngestRoutes::deliver`]
/// -- which silently drops frames for a port that's since been closed.
fn spawn_ingest_thread(ingest_sid: xous::SID, ingest: netxlate::ingest::IngestRoutes) {
    thread::spawn(move || loop {
        let mut msg = xous::receive_message(ingest_sid).unwrap();
        let mem = match msg.body.memory_message_mut() {
            Some(m) => m,
            None => continue,
        };
        let mut buf = unsafe { Buffer::from_memory_message_mut(mem) };
        if let Ok(req) = buf.to_original::<api::DeviceDeliver, _>() {
            let len = (req.len as usize).min(req.frame.len());
            ingest.deliver(req.port, req.frame[..len].to_vec());
        }
    });
}

/// Every socket-RPC (4.J), I/O-RPC (4.K) and interface-ioctl (4.L) opcode
/// lands here via a mutable memory message carrying one [`RpcRequest`] /
/// [`RpcReply`] pair. The ordered demuxer (4.M) only decides which *surface*
/// a message id belongs to; since this crate answers every reachable
/// surface through the same envelope shape, classification collapses to
/// "is this id one we handle" and the actual opcode match below does the
/// real routing.
fn dispatch_via_demuxer(translator: &Translator, msg: &mut xous::MessageEnvelope) {
    let msg_id = msg.body.id() as u32;
    let io_ids = Opcode::IoRead as u32..=Opcode::IoUnsupportedStub as u32;
    let socket_ids = Opcode::SocketBind as u32..=Opcode::SocketWhatIsAddress as u32;
    let ifioctl_ids = Opcode::IfIoctl as u32..=Opcode::IfIoctl as u32;
    let control_ids = Opcode::RootIoRead as u32..=Opcode::Goaway as u32;

    let io = |id: u32| io_ids.contains(&id);
    let socket = |id: u32| socket_ids.contains(&id) || ifioctl_ids.contains(&id);
    let control = |id: u32| control_ids.contains(&id);
    let trivfs = |_: u32| false;
    let surfaces = Surfaces { io: &io, socket: &socket, control: &control, trivfs: &trivfs };

    // The capability lookup that decides `owner_exists` (4.A: payload
    // lookup, falling back to name lookup, restricted to the socket-user
    // class) is folded into each handler's own `ObjRef` reconstruction
    // below; every opcode reachable here besides `SocketCreate`/`Goaway`
    // requires a resolved owner, so the demuxer is always consulted with
    // `owner_exists = true`.
    match demux::classify(true, msg_id, &surfaces) {
        Some(demux::Surface::Io) | Some(demux::Surface::Socket) => dispatch_rpc(translator, msg),
        Some(demux::Surface::Control) => reply_with(msg, RpcReply::err(NetError::Unsupported)),
        Some(demux::Surface::Trivfs) | None => reply_with(msg, RpcReply::err(NetError::Unsupported)),
    }
}

fn view_ref(port: u64) -> ObjRef {
    ObjRef { bucket: USER_VIEW_BUCKET as BucketId, port }
}

fn addr_ref(port: u64) -> ObjRef {
    ObjRef { bucket: ADDRESS_BUCKET as BucketId, port }
}

fn address_to_reply(addr: Address) -> RpcReply {
    RpcReply { error: NetError::Ok as u8, addr: addr.to_wire(), ..RpcReply::EMPTY }
}

fn name_from_bytes(bytes: &[u8; 16]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn ioctl_result_to_reply(result: Result<IoctlResult, NetError>) -> RpcReply {
    match result {
        Err(e) => RpcReply::err(e),
        Ok(IoctlResult::Addr(a)) => address_to_reply(a),
        Ok(IoctlResult::Flags(f)) => RpcReply { open_modes: f as u32, ..RpcReply::EMPTY }.tap_ok(),
        Ok(IoctlResult::Mtu(m)) => RpcReply { len: m as u16, ..RpcReply::EMPTY }.tap_ok(),
        Ok(IoctlResult::HwAddr(hw, family)) => {
            let mut addr = api::WireAddress::EMPTY;
            addr.family = family;
            addr.bytes[..6].copy_from_slice(&hw);
            RpcReply { addr, ..RpcReply::EMPTY }.tap_ok()
        }
        Ok(IoctlResult::Metric(m)) => RpcReply { len: m as u16, ..RpcReply::EMPTY }.tap_ok(),
        Ok(IoctlResult::Unit) => RpcReply { error: NetError::Ok as u8, ..RpcReply::EMPTY },
        Ok(IoctlResult::Conf(entries)) => RpcReply { len: entries.len() as u16, ..RpcReply::EMPTY }.tap_ok(),
    }
}

trait TapOk {
    fn tap_ok(self) -> Self;
}
impl TapOk for RpcReply {
    fn tap_ok(mut self) -> Self {
        self.error = NetError::Ok as u8;
        self
    }
}

/// Decodes the shared [`RpcRequest`]/[`RpcReply`] envelope, dispatches by
/// opcode to the typed socket-RPC/I/O-RPC/interface-ioctl functions, and
/// writes the result back into the lent buffer.
fn dispatch_rpc(translator: &Translator, msg: &mut xous::MessageEnvelope) {
    let opcode = FromPrimitive::from_usize(msg.body.id() & !(api::NONBLOCKING_FLAG));
    let nonblock = (msg.body.id() & api::NONBLOCKING_FLAG) != 0;

    let mem = match msg.body.memory_message_mut() {
        Some(m) => m,
        None => return,
    };
    let mut buf = unsafe { Buffer::from_memory_message_mut(mem) };
    let req = match buf.to_original::<RpcRequest, _>() {
        Ok(r) => r,
        Err(_) => {
            buf.replace(RpcReply::err(NetError::InvalidValue)).ok();
            return;
        }
    };

    let view = view_ref(req.view_port);
    let endpoint = || Address::from_wire(req.addr.family, req.addr.len, req.addr.bytes).and_then(Address::to_endpoint);
    let reply = match opcode {
        Some(Opcode::SocketBind) => match endpoint() {
            Some(ep) => match socket_rpc::bind(translator, view, ep) {
                Ok(()) => RpcReply { error: NetError::Ok as u8, ..RpcReply::EMPTY },
                Err(e) => RpcReply::err(e),
            },
            None => RpcReply::err(NetError::InvalidFamily),
        },
        Some(Opcode::SocketConnect) | Some(Opcode::SocketConnect2) => match endpoint() {
            Some(ep) => match socket_rpc::connect(translator, view, ep, req.len) {
                Ok(()) => RpcReply { error: NetError::Ok as u8, ..RpcReply::EMPTY },
                Err(e) => RpcReply::err(e),
            },
            None => RpcReply::err(NetError::InvalidFamily),
        },
        Some(Opcode::SocketListen) => match endpoint() {
            Some(ep) => match socket_rpc::listen(translator, view, ep) {
                Ok(()) => RpcReply { error: NetError::Ok as u8, ..RpcReply::EMPTY },
                Err(e) => RpcReply::err(e),
            },
            None => RpcReply::err(NetError::InvalidFamily),
        },
        Some(Opcode::SocketAccept) => match socket_rpc::accept(translator, view) {
            Ok((accepted, addr_obj)) => {
                let addr = translator.addresses.with_value(addr_obj, |a| *a).unwrap_or(Address::from_wire(0, 0, [0; 18]).unwrap());
                RpcReply { error: NetError::Ok as u8, new_view_port: accepted.port, addr: addr.to_wire(), ..RpcReply::EMPTY }
            }
            Err(e) => RpcReply::err(e),
        },
        Some(Opcode::SocketShutdown) => match socket_rpc::shutdown(translator, view) {
            Ok(()) => RpcReply { error: NetError::Ok as u8, ..RpcReply::EMPTY },
            Err(e) => RpcReply::err(e),
        },
        Some(Opcode::SocketGetOpt) | Some(Opcode::SocketSetOpt) => RpcReply::err(NetError::Unsupported),
        Some(Opcode::SocketSend) => {
            let n = (req.len as usize).min(api::MAX_RPC_PAYLOAD);
            match socket_rpc::send(translator, view, &req.data[..n], nonblock) {
                Ok(sent) => RpcReply { error: NetError::Ok as u8, len: sent as u16, ..RpcReply::EMPTY },
                Err(e) => RpcReply::err(e),
            }
        }
        Some(Opcode::SocketRecv) => {
            let mut reply = RpcReply::EMPTY;
            match socket_rpc::recv(translator, view, &mut reply.data, nonblock) {
                Ok(n) => {
                    reply.len = n as u16;
                    reply.error = NetError::Ok as u8;
                }
                Err(e) => reply.error = e as u8,
            }
            reply
        }
        Some(Opcode::SocketName) => match socket_rpc::name(translator, view) {
            Ok(addr_obj) => {
                let addr = translator.addresses.with_value(addr_obj, |a| *a).unwrap();
                address_to_reply(addr)
            }
            Err(e) => RpcReply::err(e),
        },
        Some(Opcode::SocketPeerName) => match socket_rpc::peername(translator, view) {
            Ok(addr_obj) => {
                let addr = translator.addresses.with_value(addr_obj, |a| *a).unwrap();
                address_to_reply(addr)
            }
            Err(e) => RpcReply::err(e),
        },
        Some(Opcode::SocketCreateAddress) => {
            match socket_rpc::create_address(translator, req.addr.family, req.addr.len, req.addr.bytes) {
                Ok(obj) => RpcReply { error: NetError::Ok as u8, new_view_port: obj.port, ..RpcReply::EMPTY },
                Err(e) => RpcReply::err(e),
            }
        }
        Some(Opcode::SocketWhatIsAddress) => match socket_rpc::whatis_address(translator, addr_ref(req.view_port)) {
            Ok(addr) => address_to_reply(addr),
            Err(e) => RpcReply::err(e),
        },
        Some(Opcode::IoRead) => {
            let mut reply = RpcReply::EMPTY;
            match io_rpc::read(translator, view, &mut reply.data, req.open_modes) {
                Ok(n) => {
                    reply.len = n as u16;
                    reply.error = NetError::Ok as u8;
                }
                Err(e) => reply.error = e as u8,
            }
            reply
        }
        Some(Opcode::IoWrite) => {
            let n = (req.len as usize).min(api::MAX_RPC_PAYLOAD);
            match io_rpc::write(translator, view, &req.data[..n], req.open_modes) {
                Ok(written) => RpcReply { error: NetError::Ok as u8, len: written as u16, ..RpcReply::EMPTY },
                Err(e) => RpcReply::err(e),
            }
        }
        Some(Opcode::IoSeek) => RpcReply::err(io_rpc::seek().unwrap_err()),
        Some(Opcode::IoReadable) => {
            RpcReply { error: NetError::Ok as u8, len: io_rpc::readable(translator, view) as u16, ..RpcReply::EMPTY }
        }
        Some(Opcode::IoGetOpenModes)
        | Some(Opcode::IoSetAllOpenModes)
        | Some(Opcode::IoSetSomeOpenModes)
        | Some(Opcode::IoClearSomeOpenModes) => {
            // Only the non-blocking bit has stack-visible meaning (4.K);
            // echo the requested word back as the effective mode.
            RpcReply { error: NetError::Ok as u8, open_modes: req.open_modes, ..RpcReply::EMPTY }
        }
        Some(Opcode::IoSelect) | Some(Opcode::IoSelectTimeout) => {
            let requested = io_rpc::SelectMask { read: req.open_modes & 0x1 != 0, write: req.open_modes & 0x2 != 0 };
            let timeout = if req.len == 0 { None } else { Some(StdDuration::from_millis(req.len as u64)) };
            let result = io_rpc::select(translator, view, requested, timeout);
            let mut mode = 0u32;
            if result.read {
                mode |= 0x1;
            }
            if result.write {
                mode |= 0x2;
            }
            RpcReply { error: NetError::Ok as u8, open_modes: mode, ..RpcReply::EMPTY }
        }
        Some(Opcode::IoStat) => match io_rpc::stat(translator, view) {
            Ok(info) => RpcReply { error: NetError::Ok as u8, new_view_port: info.file_id, len: info.mode as u16, ..RpcReply::EMPTY },
            Err(e) => RpcReply::err(e),
        },
        Some(Opcode::IoReauthenticate) | Some(Opcode::IoRestrictAuth) => {
            let uid = u32::from_be_bytes([req.addr.bytes[0], req.addr.bytes[1], req.addr.bytes[2], req.addr.bytes[3]]);
            let gid = u32::from_be_bytes([req.addr.bytes[4], req.addr.bytes[5], req.addr.bytes[6], req.addr.bytes[7]]);
            let result = if opcode == Some(Opcode::IoReauthenticate) {
                io_rpc::reauthenticate(translator, view, uid, gid)
            } else {
                io_rpc::restrict_auth(translator, view, &[uid], &[gid])
            };
            match result {
                Ok(obj) => RpcReply { error: NetError::Ok as u8, new_view_port: obj.port, ..RpcReply::EMPTY },
                Err(e) => RpcReply::err(e),
            }
        }
        Some(Opcode::IoDuplicate) => match io_rpc::duplicate(translator, view) {
            Ok(obj) => RpcReply { error: NetError::Ok as u8, new_view_port: obj.port, ..RpcReply::EMPTY },
            Err(e) => RpcReply::err(e),
        },
        Some(Opcode::IoIdentity) => {
            let addresses = translator.addresses.clone();
            let result = io_rpc::identity(translator, view, || addresses.create_port(ADDRESS_BUCKET, CLASS_ADDRESS, Address::from_wire(0, 0, [0; 18]).unwrap()).port);
            match result {
                Ok((id, _fs_identity, descriptor)) => {
                    RpcReply { error: NetError::Ok as u8, new_view_port: id, len: (descriptor & 0xffff) as u16, ..RpcReply::EMPTY }
                }
                Err(e) => RpcReply::err(e),
            }
        }
        Some(Opcode::IoUnsupportedStub) => RpcReply::err(NetError::Unsupported),
        Some(Opcode::IfIoctl) => {
            let code = FromPrimitive::from_u16(req.ioctl_code);
            let name = name_from_bytes(&req.name);
            let ifreq = IfReq { name, is_root: req.is_root != 0 };
            let set_addr = if req.addr.family == netxlate::address::AF_INET {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&req.addr.bytes[2..6]);
                Some(smoltcp::wire::Ipv4Address(octets))
            } else {
                None
            };
            match code {
                Some(code) => {
                    let mut registry = translator.registry.lock().unwrap();
                    ioctl_result_to_reply(ifioctl::dispatch(&mut registry, code, &ifreq, set_addr))
                }
                None => RpcReply::err(NetError::InvalidValue),
            }
        }
        _ => RpcReply::err(NetError::Unsupported),
    };

    buf.replace(reply).ok();
}

fn reply_with(msg: &mut xous::MessageEnvelope, reply: RpcReply) {
    if let Some(mem) = msg.body.memory_message_mut() {
        let mut buf = unsafe { Buffer::from_memory_message_mut(mem) };
        buf.replace(reply).ok();
    } else if let Some(scalar) = msg.body.scalar_message() {
        xous::return_scalar(scalar.sender, reply.error as usize).ok();
    }
}

/// spec.md §6: "Exit codes: ... non-zero on bootstrap failure, option-parse
/// failure, or fatal device-open failure." Logs then exits rather than
/// panicking, so a fatal startup error never takes down other clients
/// already connected through this process's address space.
fn fatal(msg: &str) -> ! {
    log::error!("fatal: {}", msg);
    std::process::exit(1);
}
