//! 4.D Network-interface manager.
//!
//! Owns the runtime-mutable, ordered set of interfaces (spec.md §3's
//! Interface list) and the device abstraction each driver variant plugs
//! into smoltcp through. Generalizes the teacher's single `device::NetPhy`
//! (one WLAN EC device) into a `DriverDevice` enum covering the three
//! variants spec.md §2 names: Ethernet (4.E), TUN (4.F) and loopback (4.G).
//!
//! Each [`Interface`] owns an independent `smoltcp::iface::Interface`
//! (and socket set). The original lwIP-hurd source drives every netif
//! through one global socket layer with its own route table; smoltcp's
//! `Interface` is device-at-a-time, so this crate's socket-RPC surface
//! (4.J) picks *which* interface's stack instance backs a new socket at
//! `bind`/`connect` time (see `Registry::route_for`). Recorded as an Open
//! Question resolution in DESIGN.md.

pub mod ethernet;
pub mod loopback;
pub mod tun;

use std::sync::{Arc, Condvar, Mutex};

use smoltcp::iface::{Interface as SmolInterface, InterfaceBuilder, NeighborCache, Routes};
use smoltcp::phy::{self, Device, DeviceCapabilities, Medium};
use smoltcp::socket::SocketSet;
use smoltcp::time::Instant;
use smoltcp::wire::{EthernetAddress, IpCidr, Ipv4Address, Ipv4Cidr};
use std::collections::BTreeMap;

use crate::api::NetError;
use crate::capability::PortName;
use crate::ingest::IngestRoutes;
use ethernet::EthernetDriver;
use loopback::LoopbackDriver;
use tun::TunDriver;

/// Two printable chars, per spec.md §3: "a short system name".
pub type IfName = [u8; 2];

pub const LOOPBACK_NAME: &str = "lo";

/// IPv4 sentinel: the all-ones value meaning "unset". spec.md glossary:
/// "Sentinel address".
pub const SENTINEL_V4: Ipv4Address = Ipv4Address([255, 255, 255, 255]);

pub enum Driver {
    Ethernet(Arc<EthernetDriver>),
    Tun(TunDriver),
    Loopback(LoopbackDriver),
}

/// One configured network interface: link state plus IPv4/IPv6
/// configuration, per spec.md §3.
pub struct Interface {
    pub name: IfName,
    pub device_name: String,
    pub driver: Driver,
    pub mtu: usize,
    pub hwaddr: [u8; 6],
    pub flags: u16,
    pub v4_addr: Ipv4Address,
    pub v4_mask: Ipv4Address,
    pub v4_gateway: Ipv4Address,
    pub v6_addrs: Vec<(smoltcp::wire::Ipv6Address, u8, bool /* tentative */)>,
    pub stack: Arc<Stack>,
    /// Port name this interface's receive route was registered under in the
    /// ingest bucket (4.H), if it's an Ethernet interface that has been
    /// opened. `None` for TUN/loopback, which don't go through the ingest
    /// thread.
    pub ingest_port: Option<PortName>,
}

/// The smoltcp engine plus the condvar used for "check-after-arm" blocking
/// waits (spec.md §9's select-cancellation discipline, and §5's suspension
/// points for blocking connect/accept/read/write/select). A coarse
/// interface-wide mutex stands in for the "stack's own per-socket lock"
/// spec.md §5 assumes the embedded stack provides, since the opaque
/// collaborator here (smoltcp) doesn't actually expose one.
pub struct Stack {
    pub inner: Mutex<SmolInterface<'static, DriverDevice>>,
    pub sockets: Mutex<SocketSet<'static>>,
    pub wake: Condvar,
}

impl Stack {
    pub fn poll(&self, now: Instant) {
        let mut iface = self.inner.lock().unwrap();
        let mut sockets = self.sockets.lock().unwrap();
        match iface.poll(&mut sockets, now) {
            Ok(_) => {}
            Err(e) => log::debug!("poll error: {}", e),
        }
        self.wake.notify_all();
    }
}

/// Flattened device used by every smoltcp `Interface` instance this crate
/// creates. Generalizes `device::NetPhy` into a variant-dispatching device,
/// the same way a C `netif->output`/`netif->input` function pointer would
/// be swapped per driver.
pub enum DriverDevice {
    Ethernet(ethernet::EthernetPhy),
    Tun(tun::TunPhy),
    Loopback(loopback::LoopbackPhy),
}

pub enum DriverRxToken {
    Ethernet(ethernet::EthernetRxToken),
    Tun(tun::TunRxToken),
    Loopback(loopback::LoopbackRxToken),
}

pub enum DriverTxToken {
    Ethernet(ethernet::EthernetTxToken),
    Tun(tun::TunTxToken),
    Loopback(loopback::LoopbackTxToken),
}

impl<'a> phy::Device<'a> for DriverDevice {
    type RxToken = DriverRxToken;
    type TxToken = DriverTxToken;

    fn receive(&'a mut self) -> Option<(Self::RxToken, Self::TxToken)> {
        match self {
            DriverDevice::Ethernet(p) => p.receive().map(|(r, t)| (DriverRxToken::Ethernet(r), DriverTxToken::Ethernet(t))),
            DriverDevice::Tun(p) => p.receive().map(|(r, t)| (DriverRxToken::Tun(r), DriverTxToken::Tun(t))),
            DriverDevice::Loopback(p) => p.receive().map(|(r, t)| (DriverRxToken::Loopback(r), DriverTxToken::Loopback(t))),
        }
    }

    fn transmit(&'a mut self) -> Option<Self::TxToken> {
        match self {
            DriverDevice::Ethernet(p) => p.transmit().map(DriverTxToken::Ethernet),
            DriverDevice::Tun(p) => p.transmit().map(DriverTxToken::Tun),
            DriverDevice::Loopback(p) => p.transmit().map(DriverTxToken::Loopback),
        }
    }

    fn capabilities(&self) -> DeviceCapabilities {
        match self {
            DriverDevice::Ethernet(p) => p.capabilities(),
            DriverDevice::Tun(p) => p.capabilities(),
            DriverDevice::Loopback(p) => p.capabilities(),
        }
    }
}

impl phy::RxToken for DriverRxToken {
    fn consume<R, F>(self, timestamp: Instant, f: F) -> smoltcp::Result<R>
    where
        F: FnOnce(&mut [u8]) -> smoltcp::Result<R>,
    {
        match self {
            DriverRxToken::Ethernet(t) => t.consume(timestamp, f),
            DriverRxToken::Tun(t) => t.consume(timestamp, f),
            DriverRxToken::Loopback(t) => t.consume(timestamp, f),
        }
    }
}

impl phy::TxToken for DriverTxToken {
    fn consume<R, F>(self, timestamp: Instant, len: usize, f: F) -> smoltcp::Result<R>
    where
        F: FnOnce(&mut [u8]) -> smoltcp::Result<R>,
    {
        match self {
            DriverTxToken::Ethernet(t) => t.consume(timestamp, len, f),
            DriverTxToken::Tun(t) => t.consume(timestamp, len, f),
            DriverTxToken::Loopback(t) => t.consume(timestamp, len, f),
        }
    }
}

/// The ordered interface list (spec.md §3's invariant: loopback is always
/// first and is never removed by reconfiguration).
pub struct Registry {
    pub interfaces: Vec<Interface>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry { interfaces: Vec::new() }
    }

    /// Builds and installs the always-present loopback interface. Called
    /// once at startup before any `--interface` is applied, so
    /// `interfaces[0]` is always loopback per spec.md §3.
    pub fn install_loopback(&mut self) {
        let device = DriverDevice::Loopback(loopback::LoopbackPhy::new());
        let stack = build_stack(device, Some(EthernetAddress([0; 6])), Medium::Ip);
        self.interfaces.push(Interface {
            name: *b"lo",
            device_name: LOOPBACK_NAME.to_string(),
            driver: Driver::Loopback(LoopbackDriver::new()),
            mtu: 65535,
            hwaddr: [0; 6],
            flags: loopback::FLAGS,
            v4_addr: Ipv4Address::new(127, 0, 0, 1),
            v4_mask: Ipv4Address::new(255, 0, 0, 0),
            v4_gateway: SENTINEL_V4,
            v6_addrs: Vec::new(),
            stack,
            ingest_port: None,
        });
    }

    /// Builds and installs a configured, non-loopback interface (spec.md
    /// §4.I's "Apply"). Driver selection is by name prefix: `tun*` gets a
    /// TUN queue, anything else an Ethernet device -- mirroring
    /// `options.c`'s own dispatch on the interface name string. An Ethernet
    /// interface's Open procedure (4.E) runs immediately, registering its
    /// receive route with `ingest` under a port `alloc_port` mints.
    pub fn install(
        &mut self,
        parsed: &crate::config::ParseInterface,
        ingest: &IngestRoutes,
        alloc_port: impl FnOnce() -> PortName,
    ) -> usize {
        let mask = prefix_len_of(parsed.mask);
        let (driver, device, medium, hwaddr) = if parsed.name.starts_with("tun") {
            let (phy, queue) = tun::TunPhy::new(1500);
            let driver = TunDriver::new(queue);
            (Driver::Tun(driver), DriverDevice::Tun(phy), Medium::Ip, None)
        } else {
            let port: Arc<dyn ethernet::DevicePort> = Arc::new(ethernet::NullPort);
            let driver = Arc::new(EthernetDriver::new(port));
            let phy = ethernet::EthernetPhy::new(driver.clone());
            (Driver::Ethernet(driver), DriverDevice::Ethernet(phy), Medium::Ethernet, Some(EthernetAddress([0; 6])))
        };
        let stack = build_stack(device, hwaddr, medium);
        {
            let mut iface = stack.inner.lock().unwrap();
            iface.update_ip_addrs(|addrs| {
                addrs.clear();
                addrs.push(IpCidr::new(parsed.addr.into(), mask)).ok();
                for v6 in &parsed.addr6 {
                    addrs.push(IpCidr::new((*v6).into(), 64)).ok();
                }
            });
            if parsed.gateway != SENTINEL_V4 {
                iface.routes_mut().add_default_ipv4_route(parsed.gateway).ok();
            }
        }
        let flags = match &driver {
            Driver::Tun(_) => tun::FLAGS,
            Driver::Ethernet(_) => ethernet::FLAGS,
            Driver::Loopback(_) => loopback::FLAGS,
        };
        let ingest_port = if let Driver::Ethernet(eth) = &driver { Some(eth.open(ingest, stack.clone(), alloc_port)) } else { None };
        self.interfaces.push(Interface {
            name: name_bytes(&parsed.name),
            device_name: parsed.name.clone(),
            driver,
            mtu: 1500,
            hwaddr: [0; 6],
            flags,
            v4_addr: parsed.addr,
            v4_mask: parsed.mask,
            v4_gateway: parsed.gateway,
            v6_addrs: parsed.addr6.iter().map(|a| (*a, 64u8, false)).collect(),
            stack,
            ingest_port,
        });
        self.interfaces.len() - 1
    }

    pub fn by_name(&self, name: &str) -> Option<usize> {
        self.interfaces.iter().position(|i| i.device_name == name || std::str::from_utf8(&i.name).map(|s| s == name).unwrap_or(false))
    }

    /// Interface that should host a socket bound/connected against `addr`.
    /// Loopback for loopback-range addresses, otherwise the first
    /// non-loopback interface whose CIDR contains the address, falling
    /// back to the first non-loopback interface (or loopback alone, if
    /// that's all there is) for an unspecified/unroutable address.
    pub fn route_for(&self, addr: Option<Ipv4Address>) -> Option<usize> {
        if let Some(a) = addr {
            if a.is_loopback() {
                return Some(0);
            }
            for (idx, iface) in self.interfaces.iter().enumerate().skip(1) {
                let cidr = Ipv4Cidr::new(iface.v4_addr, prefix_len_of(iface.v4_mask));
                if cidr.contains_addr(&a) {
                    return Some(idx);
                }
            }
        }
        if self.interfaces.len() > 1 { Some(1) } else { Some(0) }
    }

    pub fn remove(&mut self, idx: usize, ingest: &IngestRoutes) -> Option<Interface> {
        if idx == 0 || idx >= self.interfaces.len() {
            // spec.md §3: loopback "is never removed by reconfiguration".
            return None;
        }
        let iface = self.interfaces.remove(idx);
        if let (Driver::Ethernet(eth), Some(port)) = (&iface.driver, iface.ingest_port) {
            eth.close(ingest, port);
        }
        Some(iface)
    }

    /// spec.md §6: "a runtime `append-args` query that re-emits
    /// `--interface/--address/--netmask/--gateway/--address6` for every
    /// non-sentinel value." Loopback is skipped -- it was never accepted as
    /// a `--interface` argument, so it has nothing to re-emit.
    pub fn append_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for iface in self.interfaces.iter().skip(1) {
            args.push("--interface".to_string());
            args.push(iface.device_name.clone());
            if iface.v4_addr != SENTINEL_V4 {
                args.push("--address".to_string());
                args.push(iface.v4_addr.to_string());
            }
            if iface.v4_mask != SENTINEL_V4 {
                args.push("--netmask".to_string());
                args.push(iface.v4_mask.to_string());
            }
            if iface.v4_gateway != SENTINEL_V4 {
                args.push("--gateway".to_string());
                args.push(iface.v4_gateway.to_string());
            }
            for (addr6, _, _) in &iface.v6_addrs {
                args.push("--address6".to_string());
                args.push(addr6.to_string());
            }
        }
        args
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Truncates/pads a device name down to the two-byte short form spec.md §3
/// stores alongside the full `device_name` string (used by ioctl replies
/// that expect a fixed-width `ifr_name`-like field).
fn name_bytes(name: &str) -> IfName {
    let bytes = name.as_bytes();
    [bytes.first().copied().unwrap_or(b'?'), bytes.get(1).copied().unwrap_or(b'0')]
}

pub fn prefix_len_of(mask: Ipv4Address) -> u8 {
    u32::from_be_bytes(mask.0).count_ones() as u8
}

/// Shared constructor used by all three drivers: wraps a `DriverDevice` in
/// a fresh smoltcp `Interface` + empty `SocketSet`, seeded with the
/// loopback + unspecified CIDRs the teacher's `main()` uses before a real
/// address is known (`main.rs`'s `ip_addrs` local).
pub fn build_stack(device: DriverDevice, hwaddr: Option<EthernetAddress>, medium: Medium) -> Arc<Stack> {
    let neighbor_cache = NeighborCache::new(BTreeMap::new());
    let ip_addrs = [IpCidr::new(Ipv4Address::UNSPECIFIED.into(), 0)];
    let routes = Routes::new(BTreeMap::new());
    let mut builder = InterfaceBuilder::new(device, vec![]).ip_addrs(ip_addrs).routes(routes);
    if medium == Medium::Ethernet {
        if let Some(hw) = hwaddr {
            builder = builder.hardware_addr(hw.into()).neighbor_cache(neighbor_cache);
        }
    }
    Arc::new(Stack { inner: Mutex::new(builder.finalize()), sockets: Mutex::new(SocketSet::new(vec![])), wake: Condvar::new() })
}

pub fn device_error_to_neterror(_e: smoltcp::Error) -> NetError {
    NetError::LibraryError
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_is_always_first_and_not_removable() {
        let mut reg = Registry::new();
        reg.install_loopback();
        assert_eq!(reg.interfaces.len(), 1);
        assert!(reg.remove(0, &IngestRoutes::new()).is_none());
        assert_eq!(reg.interfaces.len(), 1, "loopback must survive a remove(0)");
    }

    #[test]
    fn prefix_len_counts_contiguous_ones() {
        assert_eq!(prefix_len_of(Ipv4Address::new(255, 255, 255, 0)), 24);
        assert_eq!(prefix_len_of(Ipv4Address::new(255, 255, 0, 0)), 16);
    }

    #[test]
    fn append_args_skips_loopback_and_sentinel_fields() {
        let mut reg = Registry::new();
        reg.install_loopback();
        let mut parsed = crate::config::ParseInterface::new("eth0".to_string());
        parsed.addr = Ipv4Address::new(10, 0, 0, 5);
        parsed.mask = Ipv4Address::new(255, 255, 255, 0);
        let ingest = IngestRoutes::new();
        reg.install(&parsed, &ingest, || 1);
        let args = reg.append_args();
        assert_eq!(args, vec!["--interface", "eth0", "--address", "10.0.0.5", "--netmask", "255.255.255.0"]);
    }
}
