//! Client-facing connection wrapper for the translator server, in the same
//! spirit as the teacher's own `lib.rs`: a thin, refcounted handle other
//! Xous processes use to reach the server by name, without exposing the
//! server's internal state machine.

pub mod address;
pub mod api;
pub mod capability;
pub mod config;
pub mod context;
pub mod demux;
pub mod iface;
pub mod ingest;
pub mod rpc;
pub mod socket;

use core::sync::atomic::{AtomicU32, Ordering};
use xous::CID;

static REFCOUNT: AtomicU32 = AtomicU32::new(0);

/// Counts live connections from this process to the translator server so
/// the last one to drop is the one that actually disconnects.
pub(crate) struct NetConn {
    conn: CID,
}

impl NetConn {
    pub(crate) fn new(xns: &xous_names::XousNames) -> Result<Self, xous::Error> {
        REFCOUNT.fetch_add(1, Ordering::Relaxed);
        let conn = xns
            .request_connection_blocking(api::SERVER_NAME_NETXLATE)
            .expect("can't connect to translator server");
        Ok(NetConn { conn })
    }

    pub(crate) fn conn(&self) -> CID {
        self.conn
    }
}

impl Drop for NetConn {
    fn drop(&mut self) {
        if REFCOUNT.fetch_sub(1, Ordering::Relaxed) == 1 {
            unsafe {
                xous::disconnect(self.conn).ok();
            }
        }
    }
}
