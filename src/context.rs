//! Translator-wide state, replacing the teacher's scattered process
//! globals (capability bucket ids, owner/group uids, the default domain)
//! with the single scoped value spec.md §9 calls for under "Global state →
//! scoped state": one [`Translator`] threaded through the demuxer and
//! every RPC surface instead of `static`s.

use std::sync::{Arc, Mutex};

use crate::address::Address;
use crate::api::Family;
use crate::capability::{BucketId, CapTable, ObjRef};
use crate::iface::Registry;
use crate::ingest::IngestRoutes;
use crate::socket::UserView;

pub const USER_VIEW_BUCKET: BucketId = 0;
pub const ADDRESS_BUCKET: BucketId = 1;
pub const CONTROL_BUCKET: BucketId = 2;

pub const CLASS_USER_VIEW: u32 = 0;
pub const CLASS_ADDRESS: u32 = 0;
pub const CLASS_CONTROL: u32 = 0;

/// The owning uid/gid pair a node was bound with, used to compute
/// `isroot` on `create`/`reauthenticate`/`restrict-auth` (spec.md §4.J,
/// §4.K).
#[derive(Clone, Copy, Debug)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

pub struct Translator {
    pub registry: Arc<Mutex<Registry>>,
    pub users: CapTable<UserView>,
    pub addresses: CapTable<Address>,
    pub ingest: IngestRoutes,
    /// Port-name source for the ingest bucket (4.H): every Ethernet
    /// interface's Open procedure mints its receive-route port from here,
    /// so allocation stays a capability-table concern rather than a
    /// hand-rolled counter.
    pub ingest_ports: CapTable<()>,
    pub owner: Owner,
    pub domain: Family,
}

impl Translator {
    pub fn new(domain: Family, owner: Owner) -> Translator {
        let mut registry_inner = Registry::new();
        registry_inner.install_loopback();
        let registry = Arc::new(Mutex::new(registry_inner));

        let addresses = CapTable::new();
        addresses.create_bucket(ADDRESS_BUCKET);
        addresses.create_class(ADDRESS_BUCKET, CLASS_ADDRESS, Box::new(|_: &mut Address| {}));

        let users = CapTable::new();
        users.create_bucket(USER_VIEW_BUCKET);
        let cleanup_registry = registry.clone();
        let cleanup_addresses = addresses.clone();
        users.create_class(
            USER_VIEW_BUCKET,
            CLASS_USER_VIEW,
            Box::new(move |view: &mut UserView| {
                if crate::socket::release_view(&view.socket) {
                    let s = view.socket.lock().unwrap();
                    if let Some(iface) = cleanup_registry.lock().unwrap().interfaces.get(s.iface_idx) {
                        iface.stack.sockets.lock().unwrap().remove(s.handle);
                    }
                    if s.has_identity() {
                        cleanup_addresses.destroy_right(ObjRef { bucket: ADDRESS_BUCKET, port: s.identity_port() });
                    }
                    log::debug!("last user view released; closed stack socket and identity port");
                }
            }),
        );

        let ingest_ports = CapTable::new();
        ingest_ports.create_bucket(CONTROL_BUCKET);
        ingest_ports.create_class(CONTROL_BUCKET, CLASS_CONTROL, Box::new(|_: &mut ()| {}));

        Translator { registry, users, addresses, ingest: IngestRoutes::new(), ingest_ports, owner, domain }
    }

    /// Root promotion described in spec.md §4.J: "propagate isroot from
    /// master, additionally promoting when the caller's authentication
    /// matches the owning user."
    pub fn isroot_for(&self, master_isroot: bool, caller_uid: u32, caller_gid: u32) -> bool {
        master_isroot || (caller_uid == self.owner.uid) || (caller_gid == self.owner.gid)
    }
}
