//! 4.A Capability table.
//!
//! A typed, refcounted object table keyed by bucket + class, generalizing
//! the teacher's per-process `HashMap<Option<PID>, Vec<Option<SocketHandle>>>`
//! bookkeeping (`main.rs`'s `process_sockets`) into the capability-table
//! shape spec.md §4.A describes: objects are looked up either by a payload
//! id embedded in the message (a "protected payload") or by the kernel port
//! name itself, and every successful lookup increments a refcount that the
//! caller must balance with `deref`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub type BucketId = u32;
pub type ClassId = u32;
pub type PayloadId = u64;
/// A kernel-allocated name usable as a reply destination. In Xous terms this
/// is a `CID`/`SID`; kept as an opaque integer here so the capability table
/// doesn't need to know which kernel primitive backs it.
pub type PortName = u64;

/// Per-class cleanup: runs exactly once, when an object's refcount reaches
/// zero, per spec.md §3's capability-table invariant.
pub type Cleanup<T> = Box<dyn Fn(&mut T) + Send + Sync>;

struct Class<T> {
    cleanup: Cleanup<T>,
}

struct Object<T> {
    class: ClassId,
    port: PortName,
    payload: PayloadId,
    refcount: u32,
    value: T,
}

struct Bucket<T> {
    classes: HashMap<ClassId, Class<T>>,
    objects: HashMap<PortName, Object<T>>,
    by_payload: HashMap<PayloadId, PortName>,
    next_payload: PayloadId,
    next_port: PortName,
}

impl<T> Bucket<T> {
    fn new() -> Self {
        Bucket {
            classes: HashMap::new(),
            objects: HashMap::new(),
            by_payload: HashMap::new(),
            next_payload: 1,
            next_port: 1,
        }
    }
}

/// Reference returned by a lookup: wraps the port name so the caller is
/// forced to thread it back through `deref` to balance the increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjRef {
    pub bucket: BucketId,
    pub port: PortName,
}

/// The capability table itself. Cloned cheaply (an `Arc`) and shared across
/// the RPC-pool threads and the dedicated ingest thread (4.H).
#[derive(Clone)]
pub struct CapTable<T> {
    buckets: Arc<Mutex<HashMap<BucketId, Bucket<T>>>>,
}

impl<T> CapTable<T> {
    pub fn new() -> Self {
        CapTable { buckets: Arc::new(Mutex::new(HashMap::new())) }
    }

    pub fn create_bucket(&self, id: BucketId) {
        self.buckets.lock().unwrap().entry(id).or_insert_with(Bucket::new);
    }

    pub fn create_class(&self, bucket: BucketId, class: ClassId, cleanup: Cleanup<T>) {
        let mut buckets = self.buckets.lock().unwrap();
        let b = buckets.entry(bucket).or_insert_with(Bucket::new);
        b.classes.insert(class, Class { cleanup });
    }

    /// Allocates a fresh object with one outstanding reference, per
    /// spec.md §4.A: "`create-port` returns an object with one outstanding
    /// reference."
    pub fn create_port(&self, bucket: BucketId, class: ClassId, value: T) -> ObjRef {
        let mut buckets = self.buckets.lock().unwrap();
        let b = buckets.entry(bucket).or_insert_with(Bucket::new);
        let port = b.next_port;
        b.next_port += 1;
        let payload = b.next_payload;
        b.next_payload += 1;
        b.objects.insert(port, Object { class, port, payload, refcount: 1, value });
        b.by_payload.insert(payload, port);
        ObjRef { bucket, port }
    }

    pub fn payload_of(&self, obj: ObjRef) -> Option<PayloadId> {
        let buckets = self.buckets.lock().unwrap();
        buckets.get(&obj.bucket)?.objects.get(&obj.port).map(|o| o.payload)
    }

    /// Looks up by payload id, restricted to `expected_class`, and
    /// increments the refcount. The caller must balance with [`Self::deref`].
    pub fn lookup_by_payload(
        &self,
        bucket: BucketId,
        payload: PayloadId,
        expected_class: ClassId,
    ) -> Option<ObjRef> {
        let mut buckets = self.buckets.lock().unwrap();
        let b = buckets.get_mut(&bucket)?;
        let port = *b.by_payload.get(&payload)?;
        let obj = b.objects.get_mut(&port)?;
        if obj.class != expected_class {
            return None;
        }
        obj.refcount += 1;
        Some(ObjRef { bucket, port })
    }

    /// Looks up by port name, restricted to `expected_class`, and increments
    /// the refcount.
    pub fn lookup_by_name(
        &self,
        bucket: BucketId,
        port: PortName,
        expected_class: ClassId,
    ) -> Option<ObjRef> {
        let mut buckets = self.buckets.lock().unwrap();
        let b = buckets.get_mut(&bucket)?;
        let obj = b.objects.get_mut(&port)?;
        if obj.class != expected_class {
            return None;
        }
        obj.refcount += 1;
        Some(ObjRef { bucket, port })
    }

    pub fn with_value<R>(&self, obj: ObjRef, f: impl FnOnce(&T) -> R) -> Option<R> {
        let buckets = self.buckets.lock().unwrap();
        let o = buckets.get(&obj.bucket)?.objects.get(&obj.port)?;
        Some(f(&o.value))
    }

    pub fn with_value_mut<R>(&self, obj: ObjRef, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut buckets = self.buckets.lock().unwrap();
        let o = buckets.get_mut(&obj.bucket)?.objects.get_mut(&obj.port)?;
        Some(f(&mut o.value))
    }

    /// Adds one reference without performing a lookup (used when handing a
    /// second send right to an already-resolved object, e.g. duplicate()).
    pub fn add_ref(&self, obj: ObjRef) {
        let mut buckets = self.buckets.lock().unwrap();
        if let Some(b) = buckets.get_mut(&obj.bucket) {
            if let Some(o) = b.objects.get_mut(&obj.port) {
                o.refcount += 1;
            }
        }
    }

    /// Balances a `lookup_by_payload`/`lookup_by_name`/`add_ref`. Runs the
    /// class cleanup and releases the port name once the count hits zero.
    pub fn deref(&self, obj: ObjRef) {
        let mut buckets = self.buckets.lock().unwrap();
        let cleanup_needed = {
            let b = match buckets.get_mut(&obj.bucket) {
                Some(b) => b,
                None => return,
            };
            let done = match b.objects.get_mut(&obj.port) {
                Some(o) => {
                    o.refcount -= 1;
                    o.refcount == 0
                }
                None => false,
            };
            done
        };
        if cleanup_needed {
            self.destroy_right(obj);
        }
    }

    /// Unconditionally tears an object down, running its class cleanup.
    /// Used both by `deref` reaching zero and by explicit port-death
    /// handling (ingest thread noticing a closed device, trivfs
    /// destruction callbacks).
    pub fn destroy_right(&self, obj: ObjRef) {
        let mut buckets = self.buckets.lock().unwrap();
        let b = match buckets.get_mut(&obj.bucket) {
            Some(b) => b,
            None => return,
        };
        let mut removed = match b.objects.remove(&obj.port) {
            Some(o) => o,
            None => return,
        };
        b.by_payload.remove(&removed.payload);
        if let Some(class) = b.classes.get(&removed.class) {
            (class.cleanup)(&mut removed.value);
        }
    }
}

impl<T> Default for CapTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn refcount_balances_and_cleanup_runs_once() {
        let table: CapTable<u32> = CapTable::new();
        table.create_bucket(0);
        let cleanups = Arc::new(AtomicU32::new(0));
        let cleanups2 = cleanups.clone();
        table.create_class(0, 1, Box::new(move |_| { cleanups2.fetch_add(1, Ordering::SeqCst); }));

        let obj = table.create_port(0, 1, 42);
        let payload = table.payload_of(obj).unwrap();

        let looked_up = table.lookup_by_payload(0, payload, 1).unwrap();
        assert_eq!(looked_up, obj);
        assert_eq!(cleanups.load(Ordering::SeqCst), 0);

        table.deref(looked_up);
        assert_eq!(cleanups.load(Ordering::SeqCst), 0, "original ref still outstanding");

        table.deref(obj);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1, "cleanup must run exactly once");
    }

    #[test]
    fn lookup_rejects_wrong_class() {
        let table: CapTable<u32> = CapTable::new();
        table.create_bucket(0);
        table.create_class(0, 1, Box::new(|_| {}));
        table.create_class(0, 2, Box::new(|_| {}));
        let obj = table.create_port(0, 1, 7);
        let payload = table.payload_of(obj).unwrap();
        assert!(table.lookup_by_payload(0, payload, 2).is_none());
    }
}
