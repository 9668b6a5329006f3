//! Adapters and krings: the kernel-side view of an interface's rings.
//!
//! An [`Adapter`] represents one netmap-capable interface; a [`Kring`] is
//! the kernel-side shadow of a shared [`crate::abi::NetmapRing`]. Krings
//! carry the hardware-facing indices (`nr_hwcur`, `nr_hwtail`), the
//! user-reported indices, mode and flag state, a users count, a notify
//! callback, and (for pipe/veth endpoints) a handle to the peer kring.
//!
//! Index fields crossed by the data plane are atomics: txsync on one
//! endpoint and rxsync on the other read each other's advances under the
//! acquire/release discipline described in [`crate::pipe`]. Everything
//! else is control-plane state, serialized by the caller's registration
//! lock and the domain mutex.

use crate::mem::MemAllocator;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::abi::RingPtr;

/// Ring direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    /// Transmit.
    Tx = 0,
    /// Receive.
    Rx = 1,
}

impl Dir {
    /// Both directions, TX first.
    pub const ALL: [Dir; 2] = [Dir::Tx, Dir::Rx];

    /// The opposite direction.
    pub fn swap(self) -> Dir {
        match self {
            Dir::Tx => Dir::Rx,
            Dir::Rx => Dir::Tx,
        }
    }
}

/// Kring flag: the peer requires this kring's ring to exist even when the
/// local side has no users.
pub const NKR_NEEDRING: u32 = 0x1;

/// Kring mode: off, not carrying traffic.
pub const NKR_NETMAP_OFF: u32 = 0;
/// Kring mode: on, owned by the netmap data path.
pub const NKR_NETMAP_ON: u32 = 1;

/// Callback invoked to wake whoever waits on a kring.
pub type NotifyFn = Arc<dyn Fn(&Kring) + Send + Sync>;

/// Kernel-side descriptor of one shared ring.
pub struct Kring {
    name: String,
    dir: Dir,
    ring_id: u16,
    num_slots: u32,
    adapter: Weak<Adapter>,

    // Hardware-facing indices, shared with the peer's data plane.
    nr_hwcur: AtomicU32,
    nr_hwtail: AtomicU32,

    // User-reported indices.
    rhead: AtomicU32,
    rcur: AtomicU32,
    rtail: AtomicU32,

    mode: AtomicU32,
    pending_mode: AtomicU32,
    kflags: AtomicU32,
    users: AtomicU32,

    ring: RwLock<Option<RingPtr>>,
    pipe: RwLock<Option<Weak<Kring>>>,
    notify: RwLock<Option<NotifyFn>>,
}

impl Kring {
    fn new(name: String, dir: Dir, ring_id: u16, num_slots: u32, adapter: Weak<Adapter>) -> Self {
        // A TX ring starts full of free slots: its tail sits one slot
        // behind the head. An RX ring starts empty.
        let tail = match dir {
            Dir::Tx => num_slots - 1,
            Dir::Rx => 0,
        };
        Self {
            name,
            dir,
            ring_id,
            num_slots,
            adapter,
            nr_hwcur: AtomicU32::new(0),
            nr_hwtail: AtomicU32::new(tail),
            rhead: AtomicU32::new(0),
            rcur: AtomicU32::new(0),
            rtail: AtomicU32::new(tail),
            mode: AtomicU32::new(NKR_NETMAP_OFF),
            pending_mode: AtomicU32::new(NKR_NETMAP_OFF),
            kflags: AtomicU32::new(0),
            users: AtomicU32::new(0),
            ring: RwLock::new(None),
            pipe: RwLock::new(None),
            notify: RwLock::new(None),
        }
    }

    /// Kring name, `"<adapter> TX0"` style.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ring direction.
    pub fn dir(&self) -> Dir {
        self.dir
    }

    /// Ring number within its direction.
    pub fn ring_id(&self) -> u16 {
        self.ring_id
    }

    /// Number of slots.
    pub fn num_slots(&self) -> u32 {
        self.num_slots
    }

    /// The owning adapter, if still alive.
    pub fn adapter(&self) -> Option<Arc<Adapter>> {
        self.adapter.upgrade()
    }

    /// The backing shared ring, once created.
    pub fn ring(&self) -> Option<RingPtr> {
        *self.ring.read().unwrap()
    }

    /// Install or clear the backing shared ring.
    pub fn set_ring(&self, ring: Option<RingPtr>) {
        *self.ring.write().unwrap() = ring;
    }

    /// Resolve the peer kring to an owning handle.
    ///
    /// The handle keeps the peer alive for the duration of the caller's
    /// critical section; a concurrently torn-down peer resolves to `None`.
    pub fn pipe(&self) -> Option<Arc<Kring>> {
        self.pipe.read().unwrap().as_ref().and_then(Weak::upgrade)
    }

    /// Cross-link this kring with a peer.
    pub fn set_pipe(&self, peer: &Arc<Kring>) {
        *self.pipe.write().unwrap() = Some(Arc::downgrade(peer));
    }

    /// Next slot the kernel will hand over.
    pub fn hwcur(&self) -> u32 {
        self.nr_hwcur.load(Ordering::Relaxed)
    }

    /// First slot not yet handed over.
    pub fn hwtail(&self) -> u32 {
        self.nr_hwtail.load(Ordering::Relaxed)
    }

    pub(crate) fn hwcur_atomic(&self) -> &AtomicU32 {
        &self.nr_hwcur
    }

    pub(crate) fn hwtail_atomic(&self) -> &AtomicU32 {
        &self.nr_hwtail
    }

    /// User-reported head.
    pub fn rhead(&self) -> u32 {
        self.rhead.load(Ordering::Relaxed)
    }

    /// User-reported cur.
    pub fn rcur(&self) -> u32 {
        self.rcur.load(Ordering::Relaxed)
    }

    /// User-reported tail.
    pub fn rtail(&self) -> u32 {
        self.rtail.load(Ordering::Relaxed)
    }

    /// Record the user's view of `head` and `cur`, as the sync prologue
    /// does when userspace enters the kernel.
    pub fn set_user_view(&self, head: u32, cur: u32) {
        self.rhead.store(head, Ordering::Relaxed);
        self.rcur.store(cur, Ordering::Relaxed);
    }

    /// Record the user's `tail` snapshot.
    pub fn set_rtail(&self, tail: u32) {
        self.rtail.store(tail, Ordering::Relaxed);
    }

    /// Current mode ([`NKR_NETMAP_ON`] or [`NKR_NETMAP_OFF`]).
    pub fn mode(&self) -> u32 {
        self.mode.load(Ordering::Relaxed)
    }

    /// Set the current mode.
    pub fn set_mode(&self, mode: u32) {
        self.mode.store(mode, Ordering::Relaxed);
    }

    /// Mode requested by the next register transition.
    pub fn pending_mode(&self) -> u32 {
        self.pending_mode.load(Ordering::Relaxed)
    }

    /// Request a mode for the next register transition.
    pub fn set_pending_mode(&self, mode: u32) {
        self.pending_mode.store(mode, Ordering::Relaxed);
    }

    /// True if the next register transition should switch this kring on.
    pub fn pending_on(&self) -> bool {
        self.pending_mode() == NKR_NETMAP_ON && self.mode() == NKR_NETMAP_OFF
    }

    /// True if the next register transition should switch this kring off.
    pub fn pending_off(&self) -> bool {
        self.pending_mode() == NKR_NETMAP_OFF && self.mode() == NKR_NETMAP_ON
    }

    /// True if the peer holds this kring's ring alive.
    pub fn needring(&self) -> bool {
        self.kflags.load(Ordering::Relaxed) & NKR_NEEDRING != 0
    }

    /// Mark this kring's ring as needed by the peer.
    pub fn set_needring(&self) {
        self.kflags.fetch_or(NKR_NEEDRING, Ordering::Relaxed);
    }

    /// Drop the peer's claim on this kring's ring.
    pub fn clear_needring(&self) {
        self.kflags.fetch_and(!NKR_NEEDRING, Ordering::Relaxed);
    }

    /// Number of clients using this kring.
    pub fn users(&self) -> u32 {
        self.users.load(Ordering::Relaxed)
    }

    /// Add a client.
    pub fn users_add(&self) {
        self.users.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove a client.
    pub fn users_sub(&self) {
        self.users.fetch_sub(1, Ordering::Relaxed);
    }

    /// Install the wakeup callback.
    pub fn set_notify(&self, notify: NotifyFn) {
        *self.notify.write().unwrap() = Some(notify);
    }

    /// Invoke the wakeup callback, if any.
    pub fn notify(&self) {
        let cb = self.notify.read().unwrap().clone();
        if let Some(cb) = cb {
            cb(self);
        }
    }
}

impl std::fmt::Debug for Kring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kring")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("num_slots", &self.num_slots)
            .field("hwcur", &self.hwcur())
            .field("hwtail", &self.hwtail())
            .field("mode", &self.mode())
            .field("users", &self.users())
            .finish()
    }
}

/// Adapter flag: the adapter mirrors the host stack with an extra fake
/// ring per direction.
pub const NAF_HOST_RINGS: u32 = 0x1;

/// Opaque device identity an adapter hands to the allocator for DMA
/// grouping.
#[derive(Debug, Clone, Copy)]
pub struct DeviceHandle {
    /// IOMMU group of the device.
    pub iommu_group: i32,
}

/// Client view of an adapter: the ring range a file descriptor selected.
///
/// Rings outside `[first, last)` get a zero offset entry in the client's
/// interface block.
#[derive(Debug, Clone, Copy)]
pub struct RingSpan {
    /// First selected ring, per direction.
    pub first: [u32; 2],
    /// One past the last selected ring, per direction.
    pub last: [u32; 2],
}

impl RingSpan {
    /// Select every ring of `na`, host rings included.
    pub fn all(na: &Adapter) -> Self {
        Self {
            first: [0, 0],
            last: [na.nrings(Dir::Tx) + 1, na.nrings(Dir::Rx) + 1],
        }
    }
}

/// Construction parameters for an [`Adapter`].
pub struct AdapterConfig {
    /// Interface name.
    pub name: String,
    /// Memory domain backing the adapter.
    pub mem: Arc<dyn MemAllocator>,
    /// Hardware TX rings.
    pub num_tx_rings: u32,
    /// Hardware RX rings.
    pub num_rx_rings: u32,
    /// Descriptors per TX ring.
    pub num_tx_desc: u32,
    /// Descriptors per RX ring.
    pub num_rx_desc: u32,
    /// Adapter flags ([`NAF_HOST_RINGS`]).
    pub flags: u32,
    /// DMA device identity, if the adapter fronts hardware.
    pub device: Option<DeviceHandle>,
}

/// One netmap-capable interface.
pub struct Adapter {
    name: String,
    mem: Arc<dyn MemAllocator>,
    num_tx_rings: u32,
    num_rx_rings: u32,
    num_tx_desc: u32,
    num_rx_desc: u32,
    flags: u32,
    device: Option<DeviceHandle>,

    krings: RwLock<Option<[Vec<Arc<Kring>>; 2]>>,
    peer: RwLock<Weak<Adapter>>,
    carrier: AtomicBool,
    native: AtomicBool,
    active_fds: AtomicI32,
    phys_lut: RwLock<Option<Arc<Vec<u64>>>>,
}

impl Adapter {
    /// Create an adapter over a memory domain.
    pub fn new(cfg: AdapterConfig) -> Arc<Self> {
        Arc::new(Self {
            name: cfg.name,
            mem: cfg.mem,
            num_tx_rings: cfg.num_tx_rings,
            num_rx_rings: cfg.num_rx_rings,
            num_tx_desc: cfg.num_tx_desc,
            num_rx_desc: cfg.num_rx_desc,
            flags: cfg.flags,
            device: cfg.device,
            krings: RwLock::new(None),
            peer: RwLock::new(Weak::new()),
            carrier: AtomicBool::new(true),
            native: AtomicBool::new(false),
            active_fds: AtomicI32::new(0),
            phys_lut: RwLock::new(None),
        })
    }

    /// Link two adapters as the ends of a virtual-ethernet pair.
    pub fn link_peers(a: &Arc<Adapter>, b: &Arc<Adapter>) {
        *a.peer.write().unwrap() = Arc::downgrade(b);
        *b.peer.write().unwrap() = Arc::downgrade(a);
    }

    /// Detach this adapter from its peer (one direction only; the peer
    /// notices through failing lookups).
    pub fn unlink_peer(&self) {
        *self.peer.write().unwrap() = Weak::new();
    }

    /// Resolve the peer adapter to an owning handle.
    pub fn peer(&self) -> Option<Arc<Adapter>> {
        self.peer.read().unwrap().upgrade()
    }

    /// Interface name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The memory domain backing this adapter.
    pub fn mem(&self) -> &Arc<dyn MemAllocator> {
        &self.mem
    }

    /// Number of hardware rings in `dir` (host ring excluded).
    pub fn nrings(&self, dir: Dir) -> u32 {
        match dir {
            Dir::Tx => self.num_tx_rings,
            Dir::Rx => self.num_rx_rings,
        }
    }

    /// Descriptors per ring in `dir`.
    pub fn ndesc(&self, dir: Dir) -> u32 {
        match dir {
            Dir::Tx => self.num_tx_desc,
            Dir::Rx => self.num_rx_desc,
        }
    }

    /// True if the adapter carries host rings.
    pub fn host_rings(&self) -> bool {
        self.flags & NAF_HOST_RINGS != 0
    }

    /// DMA device identity.
    pub fn device(&self) -> Option<DeviceHandle> {
        self.device
    }

    /// IOMMU group of the device; `0` for software adapters, mirroring
    /// devices that sit outside any group.
    pub fn iommu_group(&self) -> i32 {
        self.device.map(|d| d.iommu_group).unwrap_or(0)
    }

    /// Link carrier state (software model of the interface being up).
    pub fn carrier_ok(&self) -> bool {
        self.carrier.load(Ordering::Relaxed)
    }

    /// Raise or drop the carrier.
    pub fn set_carrier(&self, up: bool) {
        self.carrier.store(up, Ordering::Relaxed);
    }

    /// True while the adapter is in native netmap mode.
    pub fn native_on(&self) -> bool {
        self.native.load(Ordering::Relaxed)
    }

    /// Flip native netmap mode.
    pub fn set_native(&self, on: bool) {
        self.native.store(on, Ordering::Relaxed);
    }

    /// Number of open file descriptors bound to the adapter.
    pub fn active_fds(&self) -> i32 {
        self.active_fds.load(Ordering::Relaxed)
    }

    /// Account a descriptor open.
    pub fn fd_opened(&self) {
        self.active_fds.fetch_add(1, Ordering::Relaxed);
    }

    /// Account a descriptor close.
    pub fn fd_closed(&self) {
        self.active_fds.fetch_sub(1, Ordering::Relaxed);
    }

    /// Create the kring arrays, one extra host kring per direction.
    /// Idempotent: krings that already exist are kept.
    pub fn krings_create(self: &Arc<Self>) -> crate::error::Result<()> {
        let mut guard = self.krings.write().unwrap();
        if guard.is_some() {
            return Ok(());
        }
        let mut arrays: [Vec<Arc<Kring>>; 2] = [Vec::new(), Vec::new()];
        for dir in Dir::ALL {
            let n = self.nrings(dir) + 1;
            let ndesc = self.ndesc(dir);
            let label = match dir {
                Dir::Tx => "TX",
                Dir::Rx => "RX",
            };
            arrays[dir as usize] = (0..n)
                .map(|i| {
                    Arc::new(Kring::new(
                        format!("{} {label}{i}", self.name),
                        dir,
                        i as u16,
                        ndesc,
                        Arc::downgrade(self),
                    ))
                })
                .collect();
        }
        *guard = Some(arrays);
        tracing::debug!(adapter = %self.name, "created krings");
        Ok(())
    }

    /// Drop the kring arrays.
    pub fn krings_delete(&self) {
        *self.krings.write().unwrap() = None;
        tracing::debug!(adapter = %self.name, "deleted krings");
    }

    /// True if the kring arrays exist.
    pub fn has_krings(&self) -> bool {
        self.krings.read().unwrap().is_some()
    }

    /// Kring `i` of direction `dir` (index `nrings` is the host kring).
    pub fn kring(&self, dir: Dir, i: u32) -> Option<Arc<Kring>> {
        self.krings
            .read()
            .unwrap()
            .as_ref()
            .and_then(|arr| arr[dir as usize].get(i as usize).cloned())
    }

    /// All krings of one direction, host kring last.
    pub fn krings_of(&self, dir: Dir) -> Vec<Arc<Kring>> {
        self.krings
            .read()
            .unwrap()
            .as_ref()
            .map(|arr| arr[dir as usize].clone())
            .unwrap_or_default()
    }

    /// Install the adapter-local physical lookup table built by the
    /// domain's DMA mapping step.
    pub fn set_phys_lut(&self, lut: Vec<u64>) {
        *self.phys_lut.write().unwrap() = Some(Arc::new(lut));
    }

    /// Drop the adapter-local physical lookup table.
    pub fn clear_phys_lut(&self) {
        *self.phys_lut.write().unwrap() = None;
    }

    /// The adapter-local physical lookup table, if installed.
    pub fn phys_lut(&self) -> Option<Arc<Vec<u64>>> {
        self.phys_lut.read().unwrap().clone()
    }
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter")
            .field("name", &self.name)
            .field("tx_rings", &self.num_tx_rings)
            .field("rx_rings", &self.num_rx_rings)
            .field("native", &self.native_on())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemRegistry;

    fn test_adapter(name: &str) -> Arc<Adapter> {
        let registry = MemRegistry::new();
        Adapter::new(AdapterConfig {
            name: name.into(),
            mem: registry.global(),
            num_tx_rings: 2,
            num_rx_rings: 2,
            num_tx_desc: 16,
            num_rx_desc: 32,
            flags: 0,
            device: None,
        })
    }

    #[test]
    fn krings_layout() {
        let na = test_adapter("veth0");
        na.krings_create().unwrap();
        assert_eq!(na.krings_of(Dir::Tx).len(), 3); // 2 + host
        assert_eq!(na.krings_of(Dir::Rx).len(), 3);

        let tx = na.kring(Dir::Tx, 0).unwrap();
        assert_eq!(tx.num_slots(), 16);
        assert_eq!(tx.hwtail(), 15); // full of free slots
        let rx = na.kring(Dir::Rx, 0).unwrap();
        assert_eq!(rx.num_slots(), 32);
        assert_eq!(rx.hwtail(), 0); // empty

        assert!(na.kring(Dir::Tx, 3).is_none());
    }

    #[test]
    fn krings_create_is_idempotent() {
        let na = test_adapter("veth0");
        na.krings_create().unwrap();
        let before = na.kring(Dir::Tx, 0).unwrap();
        na.krings_create().unwrap();
        assert!(Arc::ptr_eq(&before, &na.kring(Dir::Tx, 0).unwrap()));
    }

    #[test]
    fn peer_linking() {
        let a = test_adapter("veth0");
        let b = test_adapter("veth1");
        Adapter::link_peers(&a, &b);
        assert!(Arc::ptr_eq(&a.peer().unwrap(), &b));
        assert!(Arc::ptr_eq(&b.peer().unwrap(), &a));
        a.unlink_peer();
        assert!(a.peer().is_none());
        assert!(b.peer().is_some());
    }

    #[test]
    fn pending_transitions() {
        let na = test_adapter("veth0");
        na.krings_create().unwrap();
        let k = na.kring(Dir::Tx, 0).unwrap();

        assert!(!k.pending_on());
        k.set_pending_mode(NKR_NETMAP_ON);
        assert!(k.pending_on());
        k.set_mode(NKR_NETMAP_ON);
        assert!(!k.pending_on());

        k.set_pending_mode(NKR_NETMAP_OFF);
        assert!(k.pending_off());
    }

    #[test]
    fn notify_callback() {
        let na = test_adapter("veth0");
        na.krings_create().unwrap();
        let k = na.kring(Dir::Rx, 0).unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        let hits2 = Arc::clone(&hits);
        k.notify(); // no callback installed: no-op
        k.set_notify(Arc::new(move |_| {
            hits2.fetch_add(1, Ordering::Relaxed);
        }));
        k.notify();
        k.notify();
        assert_eq!(hits.load(Ordering::Relaxed), 2);
    }
}
