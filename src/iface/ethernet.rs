//! 4.E Ethernet driver.
//!
//! Bridges a kernel Ethernet device port to smoltcp, generalizing
//! `device.rs`'s `NetPhy` (which talks to the one WLAN EC the teacher's
//! hardware exposes) into a driver that can be opened against any named
//! device port. `hurdethif.c` is the original's analogue: open the named
//! device master, install a filter, and wire `receive`/`transmit` through
//! to kernel read/write calls.

use std::sync::{Arc, Mutex};

use smoltcp::phy::{DeviceCapabilities, Medium};
use smoltcp::time::Instant;
use smoltcp::wire::EthernetAddress;

use crate::api::NetError;
use crate::capability::PortName;
use crate::iface::Stack;
use crate::ingest::{IngestRoutes, IngestTarget};

const ETHERNET_HEADER_LEN: usize = 14;

/// Calling side of the (out-of-scope, assumed-present) kernel device
/// server. spec.md's Non-goals exclude "kernel device drivers" themselves;
/// this trait is the thin RPC-calling edge the translator owns.
pub trait DevicePort: Send + Sync {
    fn write_frame(&self, frame: &[u8]) -> Result<(), NetError>;
    fn hwaddr(&self) -> EthernetAddress;
    fn mtu(&self) -> usize;
    /// Device-reported link flags (up/running/broadcast/multicast), used to
    /// answer `SIOCGIFFLAGS`.
    fn flags(&self) -> u16;
}

/// `IFF_UP|IFF_RUNNING|IFF_BROADCAST|IFF_MULTICAST`, reported until a real
/// device port's own `flags()` replaces it (see `Interface::flags`).
pub const FLAGS: u16 = 0x0001 | 0x0040 | 0x0002 | 0x1000;

/// Open-but-unconfigured state before `--interface` names a real device
/// port (spec.md §4.I's "device has not been opened yet" case).
pub struct NullPort;

impl DevicePort for NullPort {
    fn write_frame(&self, _frame: &[u8]) -> Result<(), NetError> {
        Err(NetError::NoSuchDevice)
    }
    fn hwaddr(&self) -> EthernetAddress {
        EthernetAddress([0; 6])
    }
    fn mtu(&self) -> usize {
        1500
    }
    fn flags(&self) -> u16 {
        0
    }
}

/// `Closed -> Opening -> Open -> Closing -> Closed`, per spec.md §4.E. Only
/// `Open` delivers received frames or accepts transmits; the others exist
/// so `SIOCGIFFLAGS`/diagnostics can tell an interface mid-handshake from
/// one that failed to come up at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Closed,
    Opening,
    Open,
    Closing,
}

/// BPF-style accept filter: drops anything that isn't ARP/IPv4/IPv6, and
/// anything longer than the interface's current MTU plus one Ethernet
/// header. `update_mtu` is how `SIOCSIFMTU` (4.L) reaches this filter.
pub struct Filter {
    pub accept_len: usize,
}

impl Filter {
    pub fn new(mtu: usize) -> Filter {
        Filter { accept_len: mtu + ETHERNET_HEADER_LEN }
    }

    pub fn update_mtu(&mut self, mtu: usize) {
        self.accept_len = mtu + ETHERNET_HEADER_LEN;
    }

    pub fn accepts(&self, frame: &[u8]) -> bool {
        if frame.len() < ETHERNET_HEADER_LEN || frame.len() > self.accept_len {
            return false;
        }
        let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
        matches!(ethertype, 0x0806 | 0x0800 | 0x86DD)
    }
}

/// Interface counters spec.md §4.E asks the driver to keep: total bytes in
/// each direction, and a unicast/broadcast-or-multicast split of frame
/// counts (read off the low bit of the destination MAC's first octet).
#[derive(Debug, Default, Clone, Copy)]
pub struct Mib {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub unicast: u64,
    pub broadcast_multicast: u64,
}

impl Mib {
    fn is_unicast(frame: &[u8]) -> bool {
        frame.first().map(|b| b & 0x01 == 0).unwrap_or(true)
    }
}

pub struct EthernetDriver {
    port: Arc<dyn DevicePort>,
    state: Mutex<LinkState>,
    filter: Mutex<Filter>,
    mib: Mutex<Mib>,
    rx_avail: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl EthernetDriver {
    pub fn new(port: Arc<dyn DevicePort>) -> EthernetDriver {
        let mtu = port.mtu();
        EthernetDriver {
            port,
            state: Mutex::new(LinkState::Closed),
            filter: Mutex::new(Filter::new(mtu)),
            mib: Mutex::new(Mib::default()),
            rx_avail: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock().unwrap()
    }

    pub fn mib(&self) -> Mib {
        *self.mib.lock().unwrap()
    }

    pub fn update_mtu(&self, mtu: usize) {
        self.filter.lock().unwrap().update_mtu(mtu);
    }

    /// Open procedure (4.E): registers this interface's receive queue under
    /// a freshly allocated port in the ingest bucket so the dedicated
    /// ingest thread (4.H) can find it, then transitions to `Open`.
    /// `alloc_port` mints that port name; the device-open RPC that would
    /// hand this driver a live, non-`NullPort` device is out of this
    /// crate's core scope (spec.md Non-goals).
    pub fn open(&self, ingest: &IngestRoutes, stack: Arc<Stack>, alloc_port: impl FnOnce() -> PortName) -> PortName {
        *self.state.lock().unwrap() = LinkState::Opening;
        let port = alloc_port();
        ingest.register(port, IngestTarget { rx_avail: self.rx_avail.clone(), stack });
        *self.state.lock().unwrap() = LinkState::Open;
        port
    }

    /// Close procedure: unregisters the receive port. Frames that arrive
    /// for it afterward are dropped by `IngestRoutes::deliver` itself
    /// (spec.md §4.H).
    pub fn close(&self, ingest: &IngestRoutes, port: PortName) {
        *self.state.lock().unwrap() = LinkState::Closing;
        ingest.unregister(port);
        *self.state.lock().unwrap() = LinkState::Closed;
    }

    fn record_tx(&self, frame: &[u8]) {
        let mut mib = self.mib.lock().unwrap();
        mib.tx_bytes += frame.len() as u64;
        if Mib::is_unicast(frame) {
            mib.unicast += 1;
        } else {
            mib.broadcast_multicast += 1;
        }
    }

    fn record_rx(&self, frame: &[u8]) {
        let mut mib = self.mib.lock().unwrap();
        mib.rx_bytes += frame.len() as u64;
        if Mib::is_unicast(frame) {
            mib.unicast += 1;
        } else {
            mib.broadcast_multicast += 1;
        }
    }

    /// TX (4.E): one frame, never chained. A single write failure ("invalid
    /// destination"/"server died" in the original) gets one retry before
    /// giving up and marking the link closed; smoltcp will see the next
    /// `transmit()` call fail until a fresh `open` replaces this driver's
    /// device port.
    pub fn write_with_retry(&self, frame: &[u8]) -> Result<(), NetError> {
        match self.port.write_frame(frame) {
            Ok(()) => {
                self.record_tx(frame);
                Ok(())
            }
            Err(first_err) => {
                log::debug!("ethernet: tx failed ({:?}), retrying once before aborting", first_err);
                match self.port.write_frame(frame) {
                    Ok(()) => {
                        self.record_tx(frame);
                        Ok(())
                    }
                    Err(e) => {
                        *self.state.lock().unwrap() = LinkState::Closed;
                        Err(e)
                    }
                }
            }
        }
    }
}

/// Raw frame buffer handed from the ingest thread (4.H) to the device once
/// a receive-completion message arrives, mirroring `NetPhy::push_rx_avail`
/// queuing a length until the next `receive()` call actually fetches bytes.
pub struct EthernetPhy {
    driver: Arc<EthernetDriver>,
}

impl EthernetPhy {
    pub fn new(driver: Arc<EthernetDriver>) -> EthernetPhy {
        EthernetPhy { driver }
    }

    pub fn receive(&mut self) -> Option<(EthernetRxToken, EthernetTxToken)> {
        loop {
            let frame = self.driver.rx_avail.lock().unwrap().pop()?;
            if self.driver.filter.lock().unwrap().accepts(&frame) {
                self.driver.record_rx(&frame);
                return Some((EthernetRxToken { frame }, EthernetTxToken { driver: self.driver.clone() }));
            }
            log::debug!("ethernet: dropping frame rejected by filter");
        }
    }

    pub fn transmit(&mut self) -> Option<EthernetTxToken> {
        Some(EthernetTxToken { driver: self.driver.clone() })
    }

    pub fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ethernet;
        caps.max_transmission_unit = self.driver.port.mtu();
        caps
    }
}

pub struct EthernetRxToken {
    frame: Vec<u8>,
}

impl smoltcp::phy::RxToken for EthernetRxToken {
    fn consume<R, F>(mut self, _timestamp: Instant, f: F) -> smoltcp::Result<R>
    where
        F: FnOnce(&mut [u8]) -> smoltcp::Result<R>,
    {
        f(&mut self.frame)
    }
}

pub struct EthernetTxToken {
    driver: Arc<EthernetDriver>,
}

impl smoltcp::phy::TxToken for EthernetTxToken {
    fn consume<R, F>(self, _timestamp: Instant, len: usize, f: F) -> smoltcp::Result<R>
    where
        F: FnOnce(&mut [u8]) -> smoltcp::Result<R>,
    {
        let mut buffer = vec![0u8; len];
        let result = f(&mut buffer)?;
        self.driver.write_with_retry(&buffer).map_err(|_| smoltcp::Error::Illegal)?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::{build_stack, DriverDevice};
    use crate::iface::loopback::LoopbackPhy;
    use smoltcp::phy::{Medium, RxToken, TxToken};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakePort {
        sent: Mutex<Vec<Vec<u8>>>,
        fail_once: AtomicBool,
    }

    impl DevicePort for FakePort {
        fn write_frame(&self, frame: &[u8]) -> Result<(), NetError> {
            if self.fail_once.swap(false, Ordering::SeqCst) {
                return Err(NetError::NoSuchDevice);
            }
            self.sent.lock().unwrap().push(frame.to_vec());
            Ok(())
        }
        fn hwaddr(&self) -> EthernetAddress {
            EthernetAddress([2, 0, 0, 0, 0, 1])
        }
        fn mtu(&self) -> usize {
            1500
        }
        fn flags(&self) -> u16 {
            0x0043
        }
    }

    fn frame_of(ethertype: u16, len: usize) -> Vec<u8> {
        let mut f = vec![0u8; len];
        f[12..14].copy_from_slice(&ethertype.to_be_bytes());
        f
    }

    #[test]
    fn filter_rejects_unknown_ethertype_and_oversize_frames() {
        let filter = Filter::new(1500);
        assert!(filter.accepts(&frame_of(0x0800, 64)));
        assert!(!filter.accepts(&frame_of(0x9999, 64)), "non IP/ARP ethertype must be dropped");
        assert!(!filter.accepts(&frame_of(0x0800, 1515)), "frame past MTU+header must be dropped");
    }

    #[test]
    fn rx_skips_filtered_frames_and_records_mib_for_the_rest() {
        let port: Arc<dyn DevicePort> = Arc::new(FakePort { sent: Mutex::new(Vec::new()), fail_once: AtomicBool::new(false) });
        let driver = Arc::new(EthernetDriver::new(port));
        driver.rx_avail.lock().unwrap().push(frame_of(0x9999, 64));
        driver.rx_avail.lock().unwrap().push(frame_of(0x0800, 64));

        let mut phy = EthernetPhy::new(driver.clone());
        let (rx, _tx) = phy.receive().expect("the accepted frame must still surface");
        RxToken::consume(rx, Instant::from_millis(0), |buf| {
            assert_eq!(buf.len(), 64);
            Ok(())
        })
        .unwrap();
        assert!(phy.receive().is_none(), "both queued frames must be consumed");
        assert_eq!(driver.mib().rx_bytes, 64, "only the accepted frame counts toward the MIB");
    }

    #[test]
    fn transmit_reaches_the_device_port_and_records_mib() {
        let port = Arc::new(FakePort { sent: Mutex::new(Vec::new()), fail_once: AtomicBool::new(false) });
        let driver = Arc::new(EthernetDriver::new(port.clone()));
        let mut phy = EthernetPhy::new(driver.clone());
        let tok = phy.transmit().unwrap();
        TxToken::consume(tok, Instant::from_millis(0), 3, |buf| {
            buf.copy_from_slice(&[9, 9, 9]);
            Ok(())
        })
        .unwrap();
        assert_eq!(port.sent.lock().unwrap()[0], vec![9, 9, 9]);
        assert_eq!(driver.mib().tx_bytes, 3);
    }

    #[test]
    fn write_retries_once_before_giving_up() {
        let port = Arc::new(FakePort { sent: Mutex::new(Vec::new()), fail_once: AtomicBool::new(true) });
        let driver = EthernetDriver::new(port.clone());
        driver.write_with_retry(&[1, 2, 3]).expect("one retry must recover from a single failure");
        assert_eq!(port.sent.lock().unwrap().len(), 1);
        assert_eq!(driver.mib().tx_bytes, 3);
    }

    #[test]
    fn open_registers_an_ingest_route_and_close_unregisters_it() {
        let port: Arc<dyn DevicePort> = Arc::new(FakePort { sent: Mutex::new(Vec::new()), fail_once: AtomicBool::new(false) });
        let driver = EthernetDriver::new(port);
        let ingest = IngestRoutes::new();
        let stack = build_stack(DriverDevice::Loopback(LoopbackPhy::new()), None, Medium::Ip);

        let assigned = driver.open(&ingest, stack, || 42);
        assert_eq!(assigned, 42);
        assert_eq!(driver.state(), LinkState::Open);
        assert!(ingest.deliver(42, vec![1, 2, 3]), "registered port must accept a delivery");

        driver.close(&ingest, assigned);
        assert_eq!(driver.state(), LinkState::Closed);
        assert!(!ingest.deliver(42, vec![1]), "closed port must drop further deliveries");
    }
}
