//! 4.F TUN driver.
//!
//! A point-to-point pseudo-interface whose "wire" is a translator node: a
//! client opens the node, writes raw packets in (fed to the stack as
//! received frames) and reads packets the stack wants to transmit back
//! out. Grounded directly in `port/netif/hurdtunif.c`: the 128-entry
//! bounded queue with oldest-drop on overflow, the mutex + two condition
//! variables (one for "data available", one to wake a pending `select`),
//! the `read_blocked` flag, and exclusive single-opener enforcement.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant as StdInstant};

use smoltcp::phy::{DeviceCapabilities, Medium};
use smoltcp::time::Instant;

use crate::api::NetError;

/// `hurdtunif.c`'s `#define QUEUE_MAX_LEN 128`.
const QUEUE_MAX_LEN: usize = 128;

pub const FLAGS: u16 = 0x0008 | 0x0001 | 0x0010; // IFF_RUNNING|IFF_UP|IFF_POINTOPOINT

struct QueueState {
    /// Frames the stack transmitted, waiting for a client `read`.
    to_client: VecDeque<Vec<u8>>,
    /// Frames a client `write` handed the stack, waiting for the next
    /// `Device::receive()` call during a poll.
    from_client: VecDeque<Vec<u8>>,
    read_blocked: bool,
    opened: bool,
}

/// Shared between the [`TunDriver`] (the I/O-RPC surface's view, 4.K) and
/// the [`TunPhy`] (the `Device` impl smoltcp polls). Exactly one of each
/// exists per TUN interface.
pub struct TunQueue {
    state: Mutex<QueueState>,
    data_available: Condvar,
    select_wake: Condvar,
}

impl TunQueue {
    fn new() -> Arc<TunQueue> {
        Arc::new(TunQueue {
            state: Mutex::new(QueueState { to_client: VecDeque::new(), from_client: VecDeque::new(), read_blocked: false, opened: false }),
            data_available: Condvar::new(),
            select_wake: Condvar::new(),
        })
    }
}

pub struct TunDriver {
    queue: Arc<TunQueue>,
}

impl TunDriver {
    pub fn new(queue: Arc<TunQueue>) -> TunDriver {
        TunDriver { queue }
    }

    /// Enforces the single-opener rule `check_open_hook` implements in
    /// `hurdtunif.c`: a second concurrent open fails with `Busy` (EBUSY).
    pub fn open(&self) -> Result<(), NetError> {
        let mut state = self.queue.state.lock().unwrap();
        if state.opened {
            return Err(NetError::Busy);
        }
        state.opened = true;
        Ok(())
    }

    /// `pi_destroy_hook`: releases the exclusive opener and drops any
    /// still-queued frames.
    pub fn close(&self) {
        let mut state = self.queue.state.lock().unwrap();
        state.opened = false;
        state.to_client.clear();
        state.from_client.clear();
        self.data_available_notify();
    }

    fn data_available_notify(&self) {
        self.queue.data_available.notify_all();
        self.queue.select_wake.notify_all();
    }

    /// Client write: enqueues raw bytes for the stack's next `receive()`.
    /// `hurdtunif_output` in the original calls `netif->input` synchronously
    /// from the write handler; callers here are expected to follow this
    /// with an immediate `Stack::poll` so the effect is just as synchronous.
    pub fn write(&self, frame: Vec<u8>) {
        let mut state = self.queue.state.lock().unwrap();
        state.from_client.push_back(frame);
    }

    /// Client read: `trivfs_S_io_read`'s blocking behavior. Blocks on
    /// `data_available` until a frame shows up, `deadline` elapses (EINTR
    /// analogue: returns `TimedOut`), or `cancel` flips to `true` from
    /// another thread (a `select`/`io_write` close racing this reader).
    pub fn read(&self, deadline: Option<StdInstant>, cancel: &std::sync::atomic::AtomicBool) -> Result<Vec<u8>, NetError> {
        use std::sync::atomic::Ordering;
        let mut state = self.queue.state.lock().unwrap();
        loop {
            if let Some(frame) = state.to_client.pop_front() {
                state.read_blocked = false;
                return Ok(frame);
            }
            if cancel.load(Ordering::SeqCst) {
                return Err(NetError::Interrupted);
            }
            if !state.opened {
                return Err(NetError::NoSuchDevice);
            }
            state.read_blocked = true;
            state = match deadline {
                None => self.queue.data_available.wait(state).unwrap(),
                Some(d) => {
                    let now = StdInstant::now();
                    if now >= d {
                        state.read_blocked = false;
                        return Err(NetError::TimedOut);
                    }
                    let (s, timeout) = self.queue.data_available.wait_timeout(state, d - now).unwrap();
                    if timeout.timed_out() && s.to_client.is_empty() {
                        let mut s = s;
                        s.read_blocked = false;
                        return Err(NetError::TimedOut);
                    }
                    s
                }
            };
        }
    }

    pub fn readable(&self) -> bool {
        !self.queue.state.lock().unwrap().to_client.is_empty()
    }

    /// `io_select_common`'s `SELECT_READ` branch: wait up to `timeout` for
    /// data, or return immediately if some is already queued.
    pub fn select_readable(&self, timeout: Option<Duration>) -> bool {
        let mut state = self.queue.state.lock().unwrap();
        if !state.to_client.is_empty() {
            return true;
        }
        match timeout {
            None => false,
            Some(d) => {
                let (s, _) = self.queue.select_wake.wait_timeout(state, d).unwrap();
                state = s;
                !state.to_client.is_empty()
            }
        }
    }

    /// `SELECT_WRITE` is always immediately satisfiable, per
    /// `io_select_common`'s write branch (the queue toward the stack never
    /// blocks a writer).
    pub fn select_writable(&self) -> bool {
        true
    }
}

pub struct TunPhy {
    queue: Arc<TunQueue>,
    mtu: usize,
}

impl TunPhy {
    pub fn new(mtu: usize) -> (TunPhy, Arc<TunQueue>) {
        let queue = TunQueue::new();
        (TunPhy { queue: queue.clone(), mtu }, queue)
    }

    pub fn receive(&mut self) -> Option<(TunRxToken, TunTxToken)> {
        let has_data = !self.queue.state.lock().unwrap().from_client.is_empty();
        if has_data {
            Some((TunRxToken { queue: self.queue.clone() }, TunTxToken { queue: self.queue.clone() }))
        } else {
            None
        }
    }

    pub fn transmit(&mut self) -> Option<TunTxToken> {
        Some(TunTxToken { queue: self.queue.clone() })
    }

    pub fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps
    }
}

pub struct TunRxToken {
    queue: Arc<TunQueue>,
}

impl smoltcp::phy::RxToken for TunRxToken {
    fn consume<R, F>(self, _timestamp: Instant, f: F) -> smoltcp::Result<R>
    where
        F: FnOnce(&mut [u8]) -> smoltcp::Result<R>,
    {
        let mut frame = self.queue.state.lock().unwrap().from_client.pop_front().ok_or(smoltcp::Error::Exhausted)?;
        f(&mut frame)
    }
}

pub struct TunTxToken {
    queue: Arc<TunQueue>,
}

impl smoltcp::phy::TxToken for TunTxToken {
    fn consume<R, F>(self, _timestamp: Instant, len: usize, f: F) -> smoltcp::Result<R>
    where
        F: FnOnce(&mut [u8]) -> smoltcp::Result<R>,
    {
        let mut buffer = vec![0u8; len];
        let result = f(&mut buffer)?;
        let mut state = self.queue.state.lock().unwrap();
        // `hurdtunif_output`: drop the oldest entry once the queue is full
        // rather than reject the send.
        if state.to_client.len() >= QUEUE_MAX_LEN {
            state.to_client.pop_front();
        }
        state.to_client.push_back(buffer);
        let was_blocked = state.read_blocked;
        drop(state);
        if was_blocked {
            self.queue.data_available.notify_all();
        }
        self.queue.select_wake.notify_all();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smoltcp::phy::TxToken;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn open_is_exclusive() {
        let (_, queue) = TunPhy::new(1500);
        let driver = TunDriver::new(queue);
        assert!(driver.open().is_ok());
        assert!(matches!(driver.open(), Err(NetError::Busy)));
        driver.close();
        assert!(driver.open().is_ok());
    }

    #[test]
    fn overflow_drops_oldest_not_newest() {
        let (mut phy, queue) = TunPhy::new(1500);
        let driver = TunDriver::new(queue);
        driver.open().unwrap();
        for i in 0..(QUEUE_MAX_LEN + 1) {
            let tok = phy.transmit().unwrap();
            let byte = (i % 256) as u8;
            tok.consume(Instant::from_millis(0), 1, |buf| {
                buf[0] = byte;
                Ok(())
            })
            .unwrap();
        }
        let cancel = AtomicBool::new(false);
        let first = driver.read(None, &cancel).unwrap();
        // entry 0 was dropped to keep the queue at QUEUE_MAX_LEN; entry 1 survives as the oldest.
        assert_eq!(first[0], 1u8);
    }

    #[test]
    fn read_reports_interrupted_when_cancelled() {
        let (_, queue) = TunPhy::new(1500);
        let driver = TunDriver::new(queue);
        driver.open().unwrap();
        let cancel = AtomicBool::new(true);
        assert!(matches!(driver.read(None, &cancel), Err(NetError::Interrupted)));
    }
}
