//! Object pool: bitmap slab allocator for one class of pool objects.
//!
//! A pool owns a set of [`Cluster`]s, a lookup table from object index to
//! `(vaddr, paddr)`, and a free bitmap. Object size and count are rounded
//! during [`ObjPool::configure`] so that `clustentries * objsize` is an
//! exact multiple of the page size: userspace maps the pool as one run of
//! clusters, so there can be no gap at the end of a cluster.
//!
//! The pool itself is not synchronized; the owning memory domain holds a
//! mutex across every call, mirroring the `NMA_LOCK` discipline of the
//! in-kernel allocator.

use super::cluster::{Cluster, ClusterBackend, PhysAddr};
use super::{CACHE_ALIGN, MAX_CLUSTSIZE, PAGE_SIZE};
use crate::error::{Error, Result};
use std::ptr::NonNull;

/// Hard limits a pool enforces on requested configurations.
#[derive(Debug, Clone, Copy)]
pub struct PoolLimits {
    /// Minimum object size in bytes.
    pub objminsize: u32,
    /// Maximum object size in bytes.
    pub objmaxsize: u32,
    /// Minimum number of objects.
    pub nummin: u32,
    /// Maximum number of objects.
    pub nummax: u32,
}

/// One lookup-table entry: where object `i` lives.
#[derive(Debug, Clone, Copy)]
pub struct LutEntry {
    /// Virtual address of the object, `None` for never-allocated slots.
    pub vaddr: Option<NonNull<u8>>,
    /// Bus address of the object.
    pub paddr: u64,
}

impl LutEntry {
    const NULL: LutEntry = LutEntry {
        vaddr: None,
        paddr: 0,
    };
}

// SAFETY: a lut entry is only addresses; access to the memory they name
// is guarded by the owning domain's lock and the ring protocol.
unsafe impl Send for LutEntry {}
unsafe impl Sync for LutEntry {}

/// Slab allocator for one object class (IF, RING, or BUF).
#[derive(Debug)]
pub struct ObjPool {
    name: String,
    limits: PoolLimits,

    // Requested values, kept so reconfiguration can detect no-op changes.
    r_objtotal: u32,
    r_objsize: u32,

    // Geometry chosen by configure(); survives reset().
    cfg_objtotal: u32,
    cfg_objsize: u32,
    cfg_clustsize: u32,
    cfg_clustentries: u32,
    cfg_numclusters: u32,

    // Live state, only meaningful once the pool is finalized.
    objtotal: u32,
    numclusters: u32,
    memtotal: usize,
    objfree: u32,
    lut: Vec<LutEntry>,
    bitmap: Vec<u32>,
    clusters: Vec<Option<Cluster>>,
}

impl ObjPool {
    /// Create an empty, unconfigured pool.
    pub fn new(name: impl Into<String>, limits: PoolLimits) -> Self {
        Self {
            name: name.into(),
            limits,
            r_objtotal: 0,
            r_objsize: 0,
            cfg_objtotal: 0,
            cfg_objsize: 0,
            cfg_clustsize: 0,
            cfg_clustentries: 0,
            cfg_numclusters: 0,
            objtotal: 0,
            numclusters: 0,
            memtotal: 0,
            objfree: 0,
            lut: Vec::new(),
            bitmap: Vec::new(),
            clusters: Vec::new(),
        }
    }

    /// Compute the cluster geometry for a request of `objtotal` objects of
    /// `objsize` bytes each.
    ///
    /// `objsize` is rounded up to a cache-line multiple and must stay in
    /// the pool limits; the number of objects may be rounded up so that the
    /// last cluster is completely covered.
    pub fn configure(&mut self, objtotal: u32, mut objsize: u32) -> Result<()> {
        self.r_objtotal = objtotal;
        self.r_objsize = objsize;

        if objsize as usize >= MAX_CLUSTSIZE {
            return Err(Error::InvalidConfig(format!(
                "{}: unsupported object size {objsize}",
                self.name
            )));
        }
        let misaligned = objsize % CACHE_ALIGN as u32;
        if misaligned != 0 {
            tracing::debug!(
                pool = %self.name,
                pad = CACHE_ALIGN as u32 - misaligned,
                "aligning object size to cache line"
            );
            objsize += CACHE_ALIGN as u32 - misaligned;
        }
        if objsize < self.limits.objminsize || objsize > self.limits.objmaxsize {
            return Err(Error::InvalidConfig(format!(
                "{}: object size {objsize} out of range [{}, {}]",
                self.name, self.limits.objminsize, self.limits.objmaxsize
            )));
        }
        if objtotal < self.limits.nummin || objtotal > self.limits.nummax {
            return Err(Error::InvalidConfig(format!(
                "{}: object count {objtotal} out of range [{}, {}]",
                self.name, self.limits.nummin, self.limits.nummax
            )));
        }

        // Smallest cluster that ends exactly on a page boundary.
        let mut clustentries = 0u32;
        let mut i = 1u32;
        loop {
            let used = i as usize * objsize as usize;
            if used > MAX_CLUSTSIZE {
                break;
            }
            if used % PAGE_SIZE == 0 {
                clustentries = i;
                break;
            }
            i += 1;
        }
        if clustentries == 0 {
            return Err(Error::InvalidConfig(format!(
                "{}: no page-aligned cluster for object size {objsize}",
                self.name
            )));
        }

        self.cfg_clustentries = clustentries;
        self.cfg_clustsize = clustentries * objsize;
        self.cfg_numclusters = objtotal.div_ceil(clustentries);
        self.cfg_objsize = objsize;
        self.cfg_objtotal = self.cfg_numclusters * clustentries;

        Ok(())
    }

    /// Allocate the clusters and build the lookup table.
    ///
    /// On a shortage mid-way, the already-allocated clusters are halved and
    /// the smaller pool is accepted; with fewer than two clusters obtained
    /// the finalize fails instead.
    pub fn finalize(&mut self, backend: &dyn ClusterBackend) -> Result<()> {
        self.numclusters = self.cfg_numclusters;
        self.objtotal = self.cfg_objtotal;
        self.lut = vec![LutEntry::NULL; self.cfg_objtotal as usize];
        self.clusters = Vec::with_capacity(self.cfg_numclusters as usize);

        let entries = self.cfg_clustentries as usize;
        let objsize = self.cfg_objsize as usize;

        for c in 0..self.cfg_numclusters as usize {
            let clust = match backend.alloc(self.cfg_clustsize as usize) {
                Ok(clust) => clust,
                Err(err) => {
                    tracing::warn!(
                        pool = %self.name,
                        cluster = c,
                        %err,
                        "cluster allocation failed, halving the pool"
                    );
                    if c < 2 {
                        self.reset();
                        return Err(Error::OutOfMemory(format!(
                            "{}: unable to obtain the initial clusters",
                            self.name
                        )));
                    }
                    let keep = c / 2;
                    for entry in &mut self.lut[keep * entries..c * entries] {
                        *entry = LutEntry::NULL;
                    }
                    self.clusters.truncate(keep);
                    self.numclusters = keep as u32;
                    self.objtotal = (keep * entries) as u32;
                    break;
                }
            };

            let base = clust.as_ptr();
            let pbase = clust.paddr().0;
            for k in 0..entries {
                self.lut[c * entries + k] = LutEntry {
                    // SAFETY: k * objsize < clustsize, inside the cluster.
                    vaddr: NonNull::new(unsafe { base.add(k * objsize) }),
                    paddr: pbase + (k * objsize) as u64,
                };
            }
            self.clusters.push(Some(clust));
        }

        self.memtotal = self.numclusters as usize * self.cfg_clustsize as usize;
        tracing::debug!(
            pool = %self.name,
            clusters = self.numclusters,
            kib = self.memtotal >> 10,
            "pre-allocated clusters"
        );
        Ok(())
    }

    /// Rebuild the free bitmap from the lookup table: bit `i` is set iff
    /// object `i` has a backing address.
    pub fn init_bitmap(&mut self) -> Result<()> {
        self.bitmap = vec![0u32; (self.objtotal as usize).div_ceil(32)];
        self.objfree = 0;
        for j in 0..self.objtotal as usize {
            if self.lut[j].vaddr.is_some() {
                self.bitmap[j >> 5] |= 1 << (j & 31);
                self.objfree += 1;
            }
        }
        if self.objfree == 0 {
            return Err(Error::OutOfMemory(format!(
                "{}: no objects available",
                self.name
            )));
        }
        Ok(())
    }

    /// Permanently mark object `idx` as busy (used for the reserved
    /// buffers). No-op if the object is already busy.
    pub fn mark_busy(&mut self, idx: u32) {
        let word = (idx >> 5) as usize;
        let mask = 1u32 << (idx & 31);
        if word < self.bitmap.len() && self.bitmap[word] & mask != 0 {
            self.bitmap[word] &= !mask;
            self.objfree -= 1;
        }
    }

    /// Allocate one object of at most `len` bytes.
    ///
    /// `start` is an in/out scan hint in bitmap words; without it buffer
    /// allocation rescans the bitmap prefix on every call. Returns the
    /// object address and its index, or `None` when the pool is exhausted.
    pub fn alloc(&mut self, len: u32, mut start: Option<&mut u32>) -> Option<(NonNull<u8>, u32)> {
        if len > self.cfg_objsize {
            tracing::warn!(pool = %self.name, len, objsize = self.cfg_objsize, "request too large");
            return None;
        }
        if self.objfree == 0 {
            tracing::debug!(pool = %self.name, "no more objects");
            return None;
        }

        let mut i = start.as_deref().copied().unwrap_or(0) as usize;
        while i < self.bitmap.len() {
            let cur = self.bitmap[i];
            if cur == 0 {
                i += 1;
                continue;
            }
            let j = cur.trailing_zeros();
            self.bitmap[i] &= !(1u32 << j);
            self.objfree -= 1;
            let idx = (i as u32) << 5 | j;
            if let Some(s) = start.as_deref_mut() {
                *s = i as u32;
            }
            let vaddr = self.lut[idx as usize]
                .vaddr
                .expect("set bitmap bit implies a backing address");
            return Some((vaddr, idx));
        }

        if let Some(s) = start {
            *s = i as u32;
        }
        None
    }

    /// Free an object by index.
    pub fn free_index(&mut self, idx: u32) -> Result<()> {
        if idx >= self.objtotal {
            tracing::warn!(pool = %self.name, idx, max = self.objtotal, "free of invalid index");
            return Err(Error::BadIndex(idx));
        }
        let word = (idx >> 5) as usize;
        let mask = 1u32 << (idx & 31);
        if self.bitmap[word] & mask != 0 {
            tracing::warn!(pool = %self.name, idx, "double free");
            return Err(Error::DoubleFree(idx));
        }
        self.bitmap[word] |= mask;
        self.objfree += 1;
        Ok(())
    }

    /// Free an object by address: locate the owning cluster by linear
    /// scan, then free by index. Slow, used only for rarely-freed objects
    /// (rings and interface blocks).
    pub fn free_vaddr(&mut self, vaddr: NonNull<u8>) -> Result<()> {
        let entries = self.cfg_clustentries as usize;
        for c in 0..self.numclusters as usize {
            let Some(base) = self.lut[c * entries].vaddr else {
                continue;
            };
            let p = vaddr.as_ptr() as usize;
            let b = base.as_ptr() as usize;
            if p < b || p - b >= self.cfg_clustsize as usize {
                continue;
            }
            let idx = (c * entries + (p - b) / self.cfg_objsize as usize) as u32;
            return self.free_index(idx);
        }
        tracing::warn!(pool = %self.name, ptr = ?vaddr, "address not contained in any cluster");
        Err(Error::BadOffset(vaddr.as_ptr() as u64))
    }

    /// Pool-relative byte offset of an object address, for export to the
    /// shared layout.
    pub fn obj_offset(&self, vaddr: NonNull<u8>) -> Result<usize> {
        let entries = self.cfg_clustentries as usize;
        let mut ofs = 0usize;
        let mut i = 0usize;
        while i < self.objtotal as usize {
            if let Some(base) = self.lut[i].vaddr {
                let p = vaddr.as_ptr() as usize;
                let b = base.as_ptr() as usize;
                if p >= b && p - b < self.cfg_clustsize as usize {
                    return Ok(ofs + (p - b));
                }
            }
            i += entries;
            ofs += self.cfg_clustsize as usize;
        }
        tracing::warn!(pool = %self.name, ptr = ?vaddr, "address not contained in any cluster");
        Err(Error::BadOffset(vaddr.as_ptr() as u64))
    }

    /// Resolve a pool-relative offset back to a virtual address.
    pub fn offset_to_vaddr(&self, off: usize) -> Result<NonNull<u8>> {
        if off >= self.memtotal {
            return Err(Error::BadOffset(off as u64));
        }
        let idx = off / self.cfg_objsize as usize;
        let entry = self.lut[idx].vaddr.ok_or(Error::BadOffset(off as u64))?;
        // SAFETY: the remainder stays inside the object.
        Ok(unsafe {
            NonNull::new_unchecked(entry.as_ptr().add(off % self.cfg_objsize as usize))
        })
    }

    /// Resolve a pool-relative offset to a bus address.
    pub fn offset_to_phys(&self, off: usize) -> Result<PhysAddr> {
        if off >= self.memtotal {
            return Err(Error::BadOffset(off as u64));
        }
        let idx = off / self.cfg_objsize as usize;
        let entry = &self.lut[idx];
        if entry.vaddr.is_none() {
            return Err(Error::BadOffset(off as u64));
        }
        Ok(PhysAddr(entry.paddr + (off % self.cfg_objsize as usize) as u64))
    }

    /// Virtual address of object `idx`, if it has backing memory.
    pub fn vaddr_of(&self, idx: u32) -> Option<NonNull<u8>> {
        self.lut.get(idx as usize).and_then(|e| e.vaddr)
    }

    /// True if object `idx` is currently free.
    pub fn is_free(&self, idx: u32) -> bool {
        let word = (idx >> 5) as usize;
        word < self.bitmap.len() && self.bitmap[word] & (1 << (idx & 31)) != 0
    }

    /// Free all clusters and clear the live state. The configured geometry
    /// survives, so a later finalize rebuilds the same pool.
    pub fn reset(&mut self) {
        self.clusters.clear();
        self.lut.clear();
        self.bitmap.clear();
        self.objtotal = 0;
        self.memtotal = 0;
        self.numclusters = 0;
        self.objfree = 0;
    }

    /// True once the requested parameters equal the current request.
    pub fn request_unchanged(&self, objtotal: u32, objsize: u32) -> bool {
        self.r_objtotal == objtotal && self.r_objsize == objsize
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Actual number of objects after finalize.
    pub fn objtotal(&self) -> u32 {
        self.objtotal
    }

    /// Configured (rounded) object size.
    pub fn objsize(&self) -> u32 {
        self.cfg_objsize
    }

    /// Configured total before finalize may shrink it.
    pub fn cfg_objtotal(&self) -> u32 {
        self.cfg_objtotal
    }

    /// Number of free objects.
    pub fn objfree(&self) -> u32 {
        self.objfree
    }

    /// Total bytes of cluster memory after finalize.
    pub fn memtotal(&self) -> usize {
        self.memtotal
    }

    /// Configured cluster size in bytes.
    pub fn clustsize(&self) -> u32 {
        self.cfg_clustsize
    }

    /// Objects per cluster.
    pub fn clustentries(&self) -> u32 {
        self.cfg_clustentries
    }

    /// Actual number of clusters after finalize.
    pub fn numclusters(&self) -> u32 {
        self.numclusters
    }

    /// Projected total bytes for the configured geometry, used for size
    /// queries before finalize.
    pub fn cfg_memtotal(&self) -> usize {
        self.cfg_numclusters as usize * self.cfg_clustsize as usize
    }

    /// Lookup-table snapshot.
    pub fn lut(&self) -> &[LutEntry] {
        &self.lut
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::cluster::MmapBackend;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn limits() -> PoolLimits {
        PoolLimits {
            objminsize: 64,
            objmaxsize: 65536,
            nummin: 4,
            nummax: 1_000_000,
        }
    }

    fn small_pool(objtotal: u32, objsize: u32) -> ObjPool {
        let mut p = ObjPool::new("test_buf", limits());
        p.configure(objtotal, objsize).unwrap();
        p.finalize(&MmapBackend).unwrap();
        p.init_bitmap().unwrap();
        p
    }

    /// Backend that fails from the n-th allocation onwards.
    struct FailAfter {
        inner: MmapBackend,
        fail_from: u32,
        count: AtomicU32,
    }

    impl FailAfter {
        fn new(fail_from: u32) -> Self {
            Self {
                inner: MmapBackend,
                fail_from,
                count: AtomicU32::new(0),
            }
        }
    }

    impl ClusterBackend for FailAfter {
        fn alloc(&self, len: usize) -> Result<Cluster> {
            let n = self.count.fetch_add(1, Ordering::Relaxed);
            if n >= self.fail_from {
                return Err(Error::OutOfMemory("injected".into()));
            }
            self.inner.alloc(len)
        }
    }

    #[test]
    fn configure_rounds_to_page_clusters() {
        let mut p = ObjPool::new("test_buf", limits());
        p.configure(100, 2048).unwrap();
        // 2 * 2048 = 4096: smallest page-aligned cluster.
        assert_eq!(p.clustentries(), 2);
        assert_eq!(p.clustsize(), 4096);
        assert_eq!(p.cfg_objtotal(), 100);

        // 100 objects of 1024 need 4-object clusters, rounded to 100.
        p.configure(101, 1024).unwrap();
        assert_eq!(p.clustentries(), 4);
        assert_eq!(p.cfg_objtotal(), 104);
    }

    #[test]
    fn configure_aligns_to_cache_line() {
        let mut p = ObjPool::new("test_buf", limits());
        p.configure(16, 100).unwrap();
        assert_eq!(p.objsize(), 128);
    }

    #[test]
    fn configure_rejects_out_of_range() {
        let mut p = ObjPool::new("test_buf", limits());
        assert!(matches!(
            p.configure(16, 1 << 22),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            p.configure(16, 65600),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(p.configure(2, 2048), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn bitmap_and_lut_stay_coherent() {
        let mut p = small_pool(64, 2048);
        assert_eq!(p.objfree(), 64);

        let mut held = Vec::new();
        for _ in 0..10 {
            let (_, idx) = p.alloc(2048, None).unwrap();
            assert!(!held.contains(&idx), "index {idx} handed out twice");
            held.push(idx);
        }
        for idx in held.drain(5..) {
            p.free_index(idx).unwrap();
        }
        // objfree must mirror the popcount at every step.
        let popcount: u32 = (0..p.objtotal()).map(|i| p.is_free(i) as u32).sum();
        assert_eq!(p.objfree(), popcount);
        for i in 0..p.objtotal() {
            if p.is_free(i) {
                assert!(p.vaddr_of(i).is_some());
            }
        }
    }

    #[test]
    fn offset_round_trip() {
        let p = small_pool(64, 2048);
        for i in 0..p.objtotal() {
            let vaddr = p.vaddr_of(i).unwrap();
            let off = p.obj_offset(vaddr).unwrap();
            assert_eq!(off, i as usize * 2048);
            assert_eq!(p.offset_to_vaddr(off).unwrap(), vaddr);
            assert_eq!(
                p.offset_to_phys(off).unwrap(),
                PhysAddr(p.lut()[i as usize].paddr)
            );
        }
        assert!(p.offset_to_vaddr(p.memtotal()).is_err());
    }

    #[test]
    fn clusters_are_arithmetic_progressions() {
        let p = small_pool(64, 2048);
        let entries = p.clustentries();
        for c in 0..p.numclusters() {
            let base = p.vaddr_of(c * entries).unwrap().as_ptr() as usize;
            for k in 0..entries {
                let v = p.vaddr_of(c * entries + k).unwrap().as_ptr() as usize;
                assert_eq!(v, base + k as usize * 2048);
                assert!(v + 2048 <= base + p.clustsize() as usize);
            }
        }
    }

    #[test]
    fn double_free_is_reported() {
        let mut p = small_pool(16, 2048);
        let (_, idx) = p.alloc(2048, None).unwrap();
        let before = p.objfree();
        p.free_index(idx).unwrap();
        assert_eq!(p.objfree(), before + 1);
        assert!(matches!(p.free_index(idx), Err(Error::DoubleFree(i)) if i == idx));
        assert_eq!(p.objfree(), before + 1);
        assert!(matches!(p.free_index(9999), Err(Error::BadIndex(_))));
    }

    #[test]
    fn free_by_address() {
        let mut p = small_pool(16, 2048);
        let (vaddr, idx) = p.alloc(2048, None).unwrap();
        p.free_vaddr(vaddr).unwrap();
        assert!(p.is_free(idx));
        let outside = NonNull::new(0x1000 as *mut u8).unwrap();
        assert!(p.free_vaddr(outside).is_err());
    }

    #[test]
    fn alloc_hint_skips_scanned_words() {
        let mut p = small_pool(128, 2048);
        let mut hint = 0u32;
        // Drain the first word entirely.
        for _ in 0..32 {
            p.alloc(2048, Some(&mut hint)).unwrap();
        }
        let (_, idx) = p.alloc(2048, Some(&mut hint)).unwrap();
        assert_eq!(idx, 32);
        assert_eq!(hint, 1);
    }

    #[test]
    fn alloc_rejects_oversized_requests() {
        let mut p = small_pool(16, 2048);
        assert!(p.alloc(4096, None).is_none());
    }

    #[test]
    fn halving_keeps_whole_clusters() {
        // 10 clusters requested (20 objects, 2 per cluster), failure on
        // the 5th: the four allocated clusters are halved down to two.
        let mut p = ObjPool::new("test_buf", limits());
        p.configure(20, 2048).unwrap();
        p.finalize(&FailAfter::new(4)).unwrap();
        assert_eq!(p.numclusters(), 2);
        assert_eq!(p.objtotal(), p.numclusters() * p.clustentries());
        p.init_bitmap().unwrap();
        assert_eq!(p.objfree(), p.objtotal());
        // The surviving objects are still addressable.
        for i in 0..p.objtotal() {
            assert!(p.vaddr_of(i).is_some());
        }
        for i in p.objtotal()..p.cfg_objtotal() {
            assert!(p.vaddr_of(i).is_none());
        }
    }

    #[test]
    fn finalize_fails_below_two_clusters() {
        let mut p = ObjPool::new("test_buf", limits());
        p.configure(20, 2048).unwrap();
        assert!(matches!(
            p.finalize(&FailAfter::new(1)),
            Err(Error::OutOfMemory(_))
        ));
        assert_eq!(p.objtotal(), 0);
        assert_eq!(p.memtotal(), 0);
    }

    #[test]
    fn reset_preserves_geometry() {
        let mut p = small_pool(16, 2048);
        p.reset();
        assert_eq!(p.objtotal(), 0);
        assert_eq!(p.clustentries(), 2);
        p.finalize(&MmapBackend).unwrap();
        p.init_bitmap().unwrap();
        assert_eq!(p.objtotal(), 16);
    }

    #[test]
    fn mark_busy_reserves_objects() {
        let mut p = small_pool(16, 2048);
        p.mark_busy(0);
        p.mark_busy(1);
        p.mark_busy(1); // second call is a no-op
        assert_eq!(p.objfree(), 14);
        assert!(!p.is_free(0));
        assert!(!p.is_free(1));
        let (_, idx) = p.alloc(2048, None).unwrap();
        assert_eq!(idx, 2);
    }
}
