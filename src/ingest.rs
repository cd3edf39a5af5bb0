//! 4.H Packet-ingest thread.
//!
//! A single dedicated thread bound to the ingest bucket (a [`CapTable`]
//! bucket reserved for device receive-ports). It never touches sockets
//! directly: it demultiplexes a device-delivery message to the right
//! interface's [`EthernetPhy`] receive queue and nudges the stack to poll.
//! Grounded in the teacher's WLAN interrupt handling in `main.rs` (the
//! `ComInterrupt`/`WlanRxEmpty` arms), generalized from "the one WLAN
//! device" to "whichever interface's receive port this message named".

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant as StdInstant;

use smoltcp::time::Instant;

use crate::capability::PortName;
use crate::iface::Stack;

/// One registered receive port, installed by the Ethernet driver's Open
/// procedure (4.E) when an interface comes up.
pub struct IngestTarget {
    pub rx_avail: Arc<Mutex<Vec<Vec<u8>>>>,
    pub stack: Arc<Stack>,
}

/// Routing table the ingest thread consults. Mutated only by interface
/// open/close (spec.md §5: "Ingest port: single-owner thread; no external
/// concurrent access" — the table itself is guarded by a mutex because
/// open/close can race the ingest thread, but nothing else ever touches
/// it).
#[derive(Clone, Default)]
pub struct IngestRoutes {
    targets: Arc<Mutex<HashMap<PortName, IngestTarget>>>,
}

impl IngestRoutes {
    pub fn new() -> IngestRoutes {
        IngestRoutes::default()
    }

    pub fn register(&self, port: PortName, target: IngestTarget) {
        self.targets.lock().unwrap().insert(port, target);
    }

    /// Interface close: messages that still arrive afterward are dropped
    /// silently, per spec.md §4.H.
    pub fn unregister(&self, port: PortName) {
        self.targets.lock().unwrap().remove(&port);
    }

    /// Core routing/delivery step, factored out of the blocking receive
    /// loop so it's testable without a real kernel message. Returns `true`
    /// if the frame was delivered to a live interface.
    pub fn deliver(&self, port: PortName, frame: Vec<u8>) -> bool {
        let targets = self.targets.lock().unwrap();
        match targets.get(&port) {
            Some(target) => {
                target.rx_avail.lock().unwrap().push(frame);
                let elapsed = StdInstant::now().elapsed().as_millis() as i64;
                target.stack.poll(Instant::from_millis(elapsed));
                true
            }
            None => {
                log::debug!("ingest: dropping frame for dead port {}", port);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::{DriverDevice, build_stack};
    use crate::iface::loopback::LoopbackPhy;
    use smoltcp::phy::Medium;

    #[test]
    fn frame_for_unknown_port_is_dropped_not_delivered() {
        let routes = IngestRoutes::new();
        assert!(!routes.deliver(42, vec![1, 2, 3]));
    }

    #[test]
    fn frame_for_registered_port_reaches_its_queue() {
        let routes = IngestRoutes::new();
        let rx_avail = Arc::new(Mutex::new(Vec::new()));
        let stack = build_stack(DriverDevice::Loopback(LoopbackPhy::new()), None, Medium::Ip);
        routes.register(7, IngestTarget { rx_avail: rx_avail.clone(), stack });
        assert!(routes.deliver(7, vec![9, 9]));
        assert_eq!(rx_avail.lock().unwrap().len(), 1);
    }

    #[test]
    fn unregistered_port_stops_delivery() {
        let routes = IngestRoutes::new();
        let rx_avail = Arc::new(Mutex::new(Vec::new()));
        let stack = build_stack(DriverDevice::Loopback(LoopbackPhy::new()), None, Medium::Ip);
        routes.register(7, IngestTarget { rx_avail: rx_avail.clone(), stack });
        routes.unregister(7);
        assert!(!routes.deliver(7, vec![1]));
        assert!(rx_avail.lock().unwrap().is_empty());
    }
}
