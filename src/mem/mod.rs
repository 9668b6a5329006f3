//! Memory domains: the three-pool allocator behind every netmap interface.
//!
//! A *memory domain* bundles three [`ObjPool`]s (interface blocks, rings,
//! packet buffers) behind one identity, one lock, and one reference
//! count. Userspace maps the three pool regions as a single run
//! `[IF | RING | BUF]` and navigates it purely by offsets (see
//! [`crate::abi`]).
//!
//! # Architecture
//!
//! - [`MemAllocator`]: the operations vtable every domain implements
//! - [`GlobalMem`]: the owning variant (allocates its own clusters)
//! - [`PassthroughMem`]: the guest variant (lookup table over a region
//!   mapped and owned by a host)
//! - [`MemRegistry`]: process-wide table of domains keyed by 16-bit id
//!
//! Dispatch is dynamic (`Arc<dyn MemAllocator>`): adapters backed by
//! owning and passthrough domains coexist in one process.
//!
//! # Example
//!
//! ```rust,ignore
//! use netmap_mem::mem::{MemRegistry, PrivateSpec};
//!
//! let registry = MemRegistry::new();
//! let mem = registry.create_private(&PrivateSpec {
//!     tx_rings: 1, tx_descs: 256,
//!     rx_rings: 1, rx_descs: 256,
//!     extra_bufs: 0, n_pipes: 0,
//! })?;
//! ```

mod cluster;
mod global;
mod passthrough;
mod pool;
mod registry;

pub use cluster::{Cluster, ClusterBackend, MmapBackend, PhysAddr};
pub use global::{GlobalMem, PoolStats};
pub use passthrough::{PassthroughMem, PtMapping, PtMemDev, PtReg};
pub use pool::{LutEntry, ObjPool, PoolLimits};
pub use registry::MemRegistry;

use crate::abi::{self, IfPtr};
use crate::adapter::{Adapter, RingSpan};
use crate::error::Result;
use std::sync::Arc;

/// Page size assumed by the cluster geometry and the shared layout.
pub const PAGE_SIZE: usize = 4096;

/// Cache-line multiple every object size is rounded up to.
pub const CACHE_ALIGN: usize = 64;

/// Largest cluster a pool will use (4 MiB).
pub const MAX_CLUSTSIZE: usize = 1 << 22;

/// Default number of packet buffers in the global domain.
pub const BUF_MAX_NUM: u32 = 20 * 4096 * 2;

/// Number of pools in a domain.
pub const POOLS_NR: usize = 3;

/// Identifies one of the three pools of a domain, in region order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// Interface blocks (`netmap_if` + ring offsets).
    If = 0,
    /// Rings (`netmap_ring` + slots).
    Ring = 1,
    /// Packet buffers.
    Buf = 2,
}

impl PoolKind {
    /// All pools in shared-region order.
    pub const ALL: [PoolKind; POOLS_NR] = [PoolKind::If, PoolKind::Ring, PoolKind::Buf];
}

/// Domain flag: pools are finalized (clusters allocated, bitmaps built).
pub const MEM_FINALIZED: u32 = 0x1;
/// Domain flag: private per-port allocator.
pub const MEM_PRIVATE: u32 = 0x2;
/// Domain flag: the region is device I/O memory owned elsewhere.
pub const MEM_IO: u32 = 0x4;
/// Domain flag: still being prepared; hidden from registry lookups.
pub const MEM_HIDDEN: u32 = 0x8;

/// Requested size/count pair for one pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolParams {
    /// Requested object size in bytes.
    pub size: u32,
    /// Requested number of objects.
    pub num: u32,
    last_size: u32,
    last_num: u32,
}

impl PoolParams {
    /// New parameter pair.
    pub const fn new(size: u32, num: u32) -> Self {
        Self {
            size,
            num,
            last_size: 0,
            last_num: 0,
        }
    }

    /// True if the pair differs from the last observed value; observes it.
    pub(crate) fn refresh(&mut self) -> bool {
        let changed = self.last_size != self.size || self.last_num != self.num;
        self.last_size = self.size;
        self.last_num = self.num;
        changed
    }
}

/// Default parameters of the global domain.
pub const DEFAULT_GLOBAL_PARAMS: [PoolParams; POOLS_NR] = [
    PoolParams::new(1024, 100),
    PoolParams::new(9 * PAGE_SIZE as u32, 200),
    PoolParams::new(2048, BUF_MAX_NUM),
];

/// Floor parameters of private domains.
pub(crate) const MIN_PRIVATE_PARAMS: [PoolParams; POOLS_NR] = [
    PoolParams::new(1024, 2),
    PoolParams::new(5 * PAGE_SIZE as u32, 4),
    PoolParams::new(2048, 4098),
];

/// Pool limits of the global domain.
pub(crate) const GLOBAL_POOL_LIMITS: [PoolLimits; POOLS_NR] = [
    PoolLimits {
        objminsize: std::mem::size_of::<abi::NetmapIf>() as u32,
        objmaxsize: 4096,
        nummin: 10,
        nummax: 10000,
    },
    PoolLimits {
        objminsize: std::mem::size_of::<abi::NetmapRing>() as u32,
        objmaxsize: 32 * PAGE_SIZE as u32,
        nummin: 2,
        nummax: 1024,
    },
    PoolLimits {
        objminsize: 64,
        objmaxsize: 65536,
        nummin: 4,
        nummax: 1_000_000,
    },
];

/// Pool limits of private domains.
pub(crate) const PRIVATE_POOL_LIMITS: [PoolLimits; POOLS_NR] = [
    PoolLimits {
        objminsize: std::mem::size_of::<abi::NetmapIf>() as u32,
        objmaxsize: 4096,
        nummin: 1,
        nummax: 100,
    },
    PoolLimits {
        objminsize: std::mem::size_of::<abi::NetmapRing>() as u32,
        objmaxsize: 32 * PAGE_SIZE as u32,
        nummin: 2,
        nummax: 1024,
    },
    PoolLimits {
        objminsize: 64,
        objmaxsize: 65536,
        nummin: 4,
        nummax: 1_000_000,
    },
];

/// Port geometry a private domain is sized for.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrivateSpec {
    /// Hardware TX rings (the host ring is accounted for automatically).
    pub tx_rings: u32,
    /// Descriptors per TX ring.
    pub tx_descs: u32,
    /// Hardware RX rings.
    pub rx_rings: u32,
    /// Descriptors per RX ring.
    pub rx_descs: u32,
    /// Extra buffers beyond the ring slots.
    pub extra_bufs: u32,
    /// Pipes the port may open.
    pub n_pipes: u32,
}

impl PrivateSpec {
    /// Compute the per-pool parameters for this port, starting from the
    /// private floor values and growing them to fit the request.
    pub fn pool_params(&self) -> [PoolParams; POOLS_NR] {
        // Account for the fake host rings.
        let txr = self.tx_rings + 1;
        let rxr = self.rx_rings + 1;

        let mut p = MIN_PRIVATE_PARAMS;

        let v = abi::if_block_len((txr + rxr) as usize) as u32;
        p[PoolKind::If as usize].size = p[PoolKind::If as usize].size.max(v);
        let v = 2 + 4 * self.n_pipes;
        p[PoolKind::If as usize].num = p[PoolKind::If as usize].num.max(v);

        let maxd = self.tx_descs.max(self.rx_descs);
        let v = abi::ring_block_len(maxd as usize) as u32;
        p[PoolKind::Ring as usize].size = p[PoolKind::Ring as usize].size.max(v);
        // Each pipe endpoint needs two tx rings (one normal, one fake
        // host) and two rx rings.
        let v = txr + rxr + 8 * self.n_pipes;
        p[PoolKind::Ring as usize].num = p[PoolKind::Ring as usize].num.max(v);

        // Buffers for the four real rings of each pipe, both port
        // directions, the two reserved buffers, and the extra pool.
        let v = (4 * self.n_pipes + rxr) * self.rx_descs
            + (4 * self.n_pipes + txr) * self.tx_descs
            + 2
            + self.extra_bufs;
        p[PoolKind::Buf as usize].num = p[PoolKind::Buf as usize].num.max(v);

        p
    }
}

/// Buffer lookup table exported to adapters.
#[derive(Debug, Clone)]
pub struct Lut {
    /// Number of buffers.
    pub objtotal: u32,
    /// Size of each buffer.
    pub objsize: u32,
    /// Per-buffer addresses.
    pub entries: Arc<[LutEntry]>,
}

/// Size, flags, and identity of a domain.
#[derive(Debug, Clone, Copy)]
pub struct MemInfo {
    /// Total bytes of the shared region (projected if not finalized).
    pub size: usize,
    /// Domain flags.
    pub flags: u32,
    /// Domain id.
    pub id: u16,
}

/// Snapshot of one pool inside the shared region.
#[derive(Debug, Clone, Copy)]
pub struct PoolSnapshot {
    /// Offset of the pool region from the start of the shared region.
    pub offset: usize,
    /// Bytes of the pool region.
    pub memtotal: usize,
    /// Number of objects.
    pub objtotal: u32,
    /// Object size.
    pub objsize: u32,
}

/// Snapshot of the whole shared region, one entry per pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolsInfo {
    /// Per-pool snapshots in region order.
    pub pools: [PoolSnapshot; POOLS_NR],
    /// Total bytes of the region.
    pub memsize: usize,
    /// Domain id.
    pub id: u16,
}

/// Operations every memory domain implements.
///
/// The owning [`GlobalMem`] and the guest [`PassthroughMem`] both expose
/// this set; callers hold `Arc<dyn MemAllocator>` and never know which
/// variant is behind an adapter.
pub trait MemAllocator: Send + Sync {
    /// Domain id, unique across the registry.
    fn id(&self) -> u16;

    /// Domain name.
    fn name(&self) -> &str;

    /// Current domain flags.
    fn flags(&self) -> u32;

    /// Buffer lookup table, available once finalized.
    fn get_lut(&self) -> Result<Lut>;

    /// Region size, flags, and id.
    fn get_info(&self) -> Result<MemInfo>;

    /// Translate a region offset to a bus address.
    fn ofstophys(&self, off: u64) -> Result<PhysAddr>;

    /// Re-read the requested parameters and reconfigure the pools if
    /// nothing holds them in place.
    fn config(&self) -> Result<()>;

    /// Allocate all clusters and take one active reference on behalf of
    /// `na`.
    fn finalize(&self, na: &Adapter) -> Result<()>;

    /// Drop one active reference taken by [`MemAllocator::finalize`].
    fn deref(&self, na: &Adapter);

    /// Release every pool resource. Called by the registry when the last
    /// reference goes away.
    fn delete(&self);

    /// Offset of an interface block inside the shared region.
    fn if_offset(&self, nifp: IfPtr) -> Result<i64>;

    /// Allocate and fill the per-client interface block.
    fn if_new(&self, na: &Adapter, span: &RingSpan) -> Result<IfPtr>;

    /// Release an interface block (and any extra buffers it heads).
    fn if_delete(&self, na: &Adapter, nifp: IfPtr);

    /// Create the shared rings every kring of `na` needs.
    fn rings_create(&self, na: &Adapter) -> Result<()>;

    /// Release the rings of `na` that no one needs anymore.
    fn rings_delete(&self, na: &Adapter);

    /// Host-side domain id, for passthrough guests only.
    fn pt_host_id(&self) -> Option<u16> {
        None
    }

    /// Downcast to the passthrough variant, for registry lookups keyed by
    /// host id.
    fn as_passthrough(self: Arc<Self>) -> Option<Arc<PassthroughMem>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_spec_grows_floor_params() {
        let spec = PrivateSpec {
            tx_rings: 1,
            tx_descs: 1024,
            rx_rings: 1,
            rx_descs: 1024,
            extra_bufs: 16,
            n_pipes: 2,
        };
        let p = spec.pool_params();
        assert_eq!(p[PoolKind::If as usize].num, 2 + 4 * 2);
        assert!(p[PoolKind::Ring as usize].size as usize >= abi::ring_block_len(1024));
        assert_eq!(p[PoolKind::Ring as usize].num, 2 + 2 + 8 * 2);
        assert_eq!(
            p[PoolKind::Buf as usize].num,
            (8 + 2) * 1024 + (8 + 2) * 1024 + 2 + 16
        );
    }

    #[test]
    fn private_spec_keeps_floor_for_tiny_ports() {
        let p = PrivateSpec::default().pool_params();
        assert_eq!(p[PoolKind::If as usize].size, 1024);
        assert_eq!(p[PoolKind::If as usize].num, 2);
        assert_eq!(p[PoolKind::Buf as usize].num, 4098);
    }

    #[test]
    fn params_refresh_detects_changes() {
        let mut p = PoolParams::new(2048, 64);
        assert!(p.refresh());
        assert!(!p.refresh());
        p.num = 128;
        assert!(p.refresh());
        assert!(!p.refresh());
    }
}
