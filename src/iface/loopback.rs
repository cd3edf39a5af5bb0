//! 4.G Loopback driver.
//!
//! The simplest of the three: whatever the stack transmits is immediately
//! available to receive again, no kernel device and no queue-overflow
//! policy. Grounded in `hurdloopif.c`'s trivial `netif->input ==
//! netif->output` wiring, generalized to smoltcp's token-based `Device`
//! trait the way `device.rs`'s `NetPhy` wires up the WLAN EC.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use smoltcp::phy::{DeviceCapabilities, Medium};
use smoltcp::time::Instant;

/// Always up, running, loopback. Matches `IFF_LOOPBACK|IFF_UP|IFF_RUNNING`
/// the way `iioctl-ops.c`'s `siocgifflags` reports a real loopback netif.
pub const FLAGS: u16 = 0x0001 | 0x0040 | 0x0008;

pub struct LoopbackDriver;

impl LoopbackDriver {
    pub fn new() -> LoopbackDriver {
        LoopbackDriver
    }
}

impl Default for LoopbackDriver {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LoopbackPhy {
    queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

impl LoopbackPhy {
    pub fn new() -> LoopbackPhy {
        LoopbackPhy { queue: Arc::new(Mutex::new(VecDeque::new())) }
    }

    pub fn receive(&mut self) -> Option<(LoopbackRxToken, LoopbackTxToken)> {
        let has_data = !self.queue.lock().unwrap().is_empty();
        if has_data {
            Some((LoopbackRxToken { queue: self.queue.clone() }, LoopbackTxToken { queue: self.queue.clone() }))
        } else {
            None
        }
    }

    pub fn transmit(&mut self) -> Option<LoopbackTxToken> {
        Some(LoopbackTxToken { queue: self.queue.clone() })
    }

    pub fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = 65535;
        caps
    }
}

impl Default for LoopbackPhy {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LoopbackRxToken {
    queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

impl smoltcp::phy::RxToken for LoopbackRxToken {
    fn consume<R, F>(self, _timestamp: Instant, f: F) -> smoltcp::Result<R>
    where
        F: FnOnce(&mut [u8]) -> smoltcp::Result<R>,
    {
        let mut frame = self.queue.lock().unwrap().pop_front().ok_or(smoltcp::Error::Exhausted)?;
        f(&mut frame)
    }
}

pub struct LoopbackTxToken {
    queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

impl smoltcp::phy::TxToken for LoopbackTxToken {
    fn consume<R, F>(self, _timestamp: Instant, len: usize, f: F) -> smoltcp::Result<R>
    where
        F: FnOnce(&mut [u8]) -> smoltcp::Result<R>,
    {
        let mut buffer = vec![0u8; len];
        let result = f(&mut buffer)?;
        self.queue.lock().unwrap().push_back(buffer);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smoltcp::phy::{RxToken, TxToken};

    #[test]
    fn transmitted_frame_is_immediately_receivable() {
        let mut phy = LoopbackPhy::new();
        let tx = phy.transmit().unwrap();
        tx.consume(Instant::from_millis(0), 4, |buf| {
            buf.copy_from_slice(b"ping");
            Ok(())
        })
        .unwrap();

        let (rx, _tx2) = phy.receive().expect("loopback must report the frame it just sent");
        rx.consume(Instant::from_millis(0), |buf| {
            assert_eq!(buf, b"ping");
            Ok(())
        })
        .unwrap();
    }
}
