//! The owning memory domain: three pools backed by its own clusters.
//!
//! `GlobalMem` implements the full [`MemAllocator`] operation set over
//! pools it allocates itself. One instance (id 1) backs every physical
//! interface; virtual ports get private instances sized by
//! [`PrivateSpec`](super::PrivateSpec).
//!
//! A single mutex guards the pools and all mutable domain state, held
//! across configure, finalize, deref, every object allocation, and the
//! ring-fabric calls. The registry lock may be taken while creating a
//! domain, never the other way around.

use super::cluster::{ClusterBackend, PhysAddr};
use super::pool::ObjPool;
use super::{
    Lut, MemAllocator, MemInfo, PoolKind, PoolParams, PoolSnapshot, PoolsInfo, MEM_FINALIZED,
    POOLS_NR,
};
use crate::abi::{self, IfPtr, NetmapIf, NetmapRing, NetmapSlot, RingPtr, RESERVED_BUFS};
use crate::adapter::{Adapter, Dir, RingSpan};
use crate::error::{Error, Result};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

const IF: usize = PoolKind::If as usize;
const RING: usize = PoolKind::Ring as usize;
const BUF: usize = PoolKind::Buf as usize;

/// Live counters of one pool, for inspection and tests.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    /// Actual number of objects.
    pub objtotal: u32,
    /// Object size after rounding.
    pub objsize: u32,
    /// Free objects.
    pub objfree: u32,
    /// Bytes of cluster memory.
    pub memtotal: usize,
    /// Number of clusters.
    pub numclusters: u32,
    /// Objects per cluster.
    pub clustentries: u32,
}

struct Inner {
    pools: [ObjPool; POOLS_NR],
    params: [PoolParams; POOLS_NR],
    flags: u32,
    lasterr: Option<Error>,
    active: u32,
    grp: i32,
    totalsize: usize,
    backend: Arc<dyn ClusterBackend>,
}

impl Inner {
    fn last(&self) -> Result<()> {
        match &self.lasterr {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Re-read `params` and reconfigure the pools. With active users the
    /// call is a silent no-op that replays the cached error state.
    fn config(&mut self) -> Result<()> {
        if self.active > 0 {
            return self.last();
        }
        let mut changed = false;
        for p in &mut self.params {
            changed |= p.refresh();
        }
        if !changed {
            return self.last();
        }

        tracing::debug!("reconfiguring pools");
        if self.flags & MEM_FINALIZED != 0 {
            for p in &mut self.pools {
                p.reset();
            }
            self.flags &= !MEM_FINALIZED;
        }
        self.lasterr = None;
        for i in 0..POOLS_NR {
            if let Err(e) = self.pools[i].configure(self.params[i].num, self.params[i].size) {
                self.lasterr = Some(e);
                break;
            }
        }
        self.last()
    }

    /// Rebuild every free bitmap and re-reserve the two scratch buffers.
    fn init_bitmaps(&mut self) -> Result<()> {
        for p in &mut self.pools {
            p.init_bitmap()?;
        }
        let buf = &mut self.pools[BUF];
        if buf.objfree() < RESERVED_BUFS {
            return Err(Error::OutOfMemory(
                "buffer pool cannot hold the reserved buffers".into(),
            ));
        }
        buf.mark_busy(abi::FAKE_TX_BUF);
        buf.mark_busy(abi::FAKE_RX_BUF);
        Ok(())
    }

    /// Allocate all clusters and bitmaps; on any failure reset everything
    /// and record the error.
    fn finalize_all(&mut self) -> Result<()> {
        if self.flags & MEM_FINALIZED != 0 {
            return Ok(());
        }
        self.lasterr = None;
        self.totalsize = 0;
        let backend = Arc::clone(&self.backend);
        let mut result = Ok(());
        for i in 0..POOLS_NR {
            if let Err(e) = self.pools[i].finalize(backend.as_ref()) {
                result = Err(e);
                break;
            }
            self.totalsize += self.pools[i].memtotal();
        }
        if result.is_ok() {
            result = self.init_bitmaps();
        }
        match result {
            Ok(()) => {
                self.flags |= MEM_FINALIZED;
                tracing::debug!(
                    if_kib = self.pools[IF].memtotal() >> 10,
                    ring_kib = self.pools[RING].memtotal() >> 10,
                    buf_mib = self.pools[BUF].memtotal() >> 20,
                    free_bufs = self.pools[BUF].objfree(),
                    "finalized memory domain"
                );
                Ok(())
            }
            Err(e) => {
                for p in &mut self.pools {
                    p.reset();
                }
                self.flags &= !MEM_FINALIZED;
                self.lasterr = Some(e.clone());
                Err(e)
            }
        }
    }

    /// Offset of an interface block within the shared region.
    fn if_offset(&self, vaddr: NonNull<u8>) -> Result<usize> {
        self.pools[IF].obj_offset(vaddr)
    }

    /// Offset of a ring within the shared region.
    fn ring_offset(&self, vaddr: NonNull<u8>) -> Result<usize> {
        Ok(self.pools[IF].memtotal() + self.pools[RING].obj_offset(vaddr)?)
    }

    fn bufsize(&self) -> u32 {
        self.pools[BUF].objsize()
    }

    /// Fill `ndesc` slots of a freshly created ring with buffers, rolling
    /// back on shortage.
    ///
    /// # Safety
    ///
    /// `ring` must point at a live ring block with at least `ndesc` slots.
    unsafe fn new_bufs(&mut self, ring: RingPtr, ndesc: u32) -> Result<()> {
        let mut pos = 0u32;
        let len = self.bufsize();
        for i in 0..ndesc {
            match self.pools[BUF].alloc(len, Some(&mut pos)) {
                Some((_, index)) => {
                    // SAFETY: caller guarantees the slot array covers `i`.
                    unsafe {
                        ring.set_slot(
                            i,
                            NetmapSlot {
                                buf_idx: index,
                                len: len as u16,
                                flags: 0,
                            },
                        );
                    }
                }
                None => {
                    tracing::warn!(got = i, wanted = ndesc, "no more buffers");
                    for j in (0..i).rev() {
                        // SAFETY: slots below `i` were just written.
                        let idx = unsafe { ring.slot(j).buf_idx };
                        let _ = self.pools[BUF].free_index(idx);
                    }
                    for j in 0..ndesc {
                        // SAFETY: as above; the whole array is in the block.
                        unsafe { ring.set_slot(j, NetmapSlot::default()) };
                    }
                    return Err(Error::OutOfMemory("buffer pool exhausted".into()));
                }
            }
        }
        Ok(())
    }

    /// Point every slot of a fake ring at one reserved buffer.
    ///
    /// # Safety
    ///
    /// `ring` must point at a live ring block with at least `ndesc` slots.
    unsafe fn set_fake_ring(&self, ring: RingPtr, ndesc: u32, index: u32) {
        let len = self.bufsize() as u16;
        for i in 0..ndesc {
            // SAFETY: caller guarantees the slot array covers `ndesc`.
            unsafe {
                ring.set_slot(
                    i,
                    NetmapSlot {
                        buf_idx: index,
                        len,
                        flags: 0,
                    },
                );
            }
        }
    }

    fn free_buf(&mut self, idx: u32) {
        if idx < RESERVED_BUFS || idx >= self.pools[BUF].objtotal() {
            tracing::warn!(
                idx,
                max = self.pools[BUF].objtotal(),
                "cannot free reserved or out-of-range buffer"
            );
            return;
        }
        if let Err(err) = self.pools[BUF].free_index(idx) {
            tracing::warn!(idx, %err, "buffer free failed");
        }
    }

    /// Release the buffers referenced by a slot array.
    ///
    /// # Safety
    ///
    /// `ring` must point at a live ring block with at least `n` slots.
    unsafe fn free_bufs(&mut self, ring: RingPtr, n: u32) {
        for i in 0..n {
            // SAFETY: caller guarantees the slot array covers `n`.
            let idx = unsafe { ring.slot(i).buf_idx };
            if idx >= RESERVED_BUFS {
                self.free_buf(idx);
            }
        }
    }

    /// Free every ring of `na` that nobody references: a ring survives as
    /// long as its kring has users or carries the peer's NEEDRING claim.
    fn free_rings(&mut self, na: &Adapter) {
        for dir in Dir::ALL {
            let n = na.nrings(dir);
            for (i, kring) in na.krings_of(dir).into_iter().enumerate() {
                let Some(ring) = kring.ring() else {
                    continue;
                };
                if kring.users() > 0 || kring.needring() {
                    tracing::debug!(kring = %kring.name(), users = kring.users(), "keeping ring");
                    continue;
                }
                if i as u32 != n || na.host_rings() {
                    // SAFETY: the ring block was sized for this kring.
                    unsafe { self.free_bufs(ring, kring.num_slots()) };
                }
                if let Err(err) = self.pools[RING].free_vaddr(ring.as_byte_ptr()) {
                    tracing::warn!(kring = %kring.name(), %err, "ring free failed");
                }
                kring.set_ring(None);
            }
        }
    }

    /// Walk an extra-buffer freelist threaded through the first word of
    /// each buffer and release it. The terminator is index 0; an index
    /// below the reserved range or past the pool cuts the walk short.
    fn extra_free(&mut self, mut head: u32) {
        let objtotal = self.pools[BUF].objtotal();
        let mut freed = 0u32;
        while head >= RESERVED_BUFS && head < objtotal {
            let cur = head;
            let Some(vaddr) = self.pools[BUF].vaddr_of(head) else {
                break;
            };
            // SAFETY: every buffer is at least a word long and writable.
            unsafe {
                let link = vaddr.as_ptr() as *mut u32;
                head = link.read();
                link.write(0);
            }
            if self.pools[BUF].free_index(cur).is_err() {
                break;
            }
            freed += 1;
        }
        if head != 0 {
            tracing::warn!(head, freed, "extra buffer list truncated");
        } else {
            tracing::debug!(freed, "freed extra buffers");
        }
    }
}

/// Owning memory domain: the global allocator and every private per-port
/// allocator.
pub struct GlobalMem {
    id: u16,
    name: String,
    inner: Mutex<Inner>,
}

impl GlobalMem {
    pub(crate) fn new_global(backend: Arc<dyn ClusterBackend>) -> Arc<Self> {
        let pool_names = ["netmap_if", "netmap_ring", "netmap_buf"];
        let pools = std::array::from_fn(|i| {
            ObjPool::new(pool_names[i], super::GLOBAL_POOL_LIMITS[i])
        });
        Arc::new(Self {
            id: 1,
            name: "1".into(),
            inner: Mutex::new(Inner {
                pools,
                params: super::DEFAULT_GLOBAL_PARAMS,
                flags: 0,
                lasterr: None,
                active: 0,
                grp: -1,
                totalsize: 0,
                backend,
            }),
        })
    }

    /// Build a private domain from explicit pool parameters. The id must
    /// already be reserved in the registry.
    pub(crate) fn new_private(
        id: u16,
        params: [PoolParams; POOLS_NR],
        backend: Arc<dyn ClusterBackend>,
    ) -> Result<Arc<Self>> {
        let name = id.to_string();
        let suffix = ["if", "ring", "buf"];
        let pools = std::array::from_fn(|i| {
            ObjPool::new(
                format!("{name}_{}", suffix[i]),
                super::PRIVATE_POOL_LIMITS[i],
            )
        });
        let d = Arc::new(Self {
            id,
            name,
            inner: Mutex::new(Inner {
                pools,
                params,
                flags: super::MEM_PRIVATE,
                lasterr: None,
                active: 0,
                grp: -1,
                totalsize: 0,
                backend,
            }),
        });
        d.inner.lock().unwrap().config()?;
        Ok(d)
    }

    fn assign_group(&self, na: &Adapter) -> Result<()> {
        let id = na.iommu_group();
        let mut inner = self.inner.lock().unwrap();
        if inner.grp < 0 {
            inner.grp = id;
        }
        if inner.grp != id {
            return Err(Error::GroupMismatch {
                domain: inner.grp,
                device: id,
            });
        }
        Ok(())
    }

    /// Install the adapter-local physical lookup table for the buffer
    /// pool, one bus address per buffer. The model of the DMA mapping
    /// step: cluster starts are mapped, entries within a cluster follow at
    /// the object stride.
    fn map_bufs(inner: &Inner, na: &Adapter) {
        if na.phys_lut().is_some() {
            return;
        }
        let pool = &inner.pools[BUF];
        let entries = pool.clustentries() as usize;
        let objsize = pool.objsize() as u64;
        let lut = pool.lut();
        let mut plut = vec![0u64; lut.len()];
        let mut i = 0;
        while i < lut.len() {
            if lut[i].vaddr.is_some() {
                plut[i] = lut[i].paddr;
                for j in 1..entries.min(lut.len() - i) {
                    plut[i + j] = plut[i + j - 1] + objsize;
                }
            }
            i += entries;
        }
        na.set_phys_lut(plut);
        tracing::debug!(adapter = %na.name(), "installed physical lut");
    }

    /// Live counters of one pool.
    pub fn pool_stats(&self, kind: PoolKind) -> PoolStats {
        let inner = self.inner.lock().unwrap();
        let p = &inner.pools[kind as usize];
        PoolStats {
            objtotal: p.objtotal(),
            objsize: p.objsize(),
            objfree: p.objfree(),
            memtotal: p.memtotal(),
            numclusters: p.numclusters(),
            clustentries: p.clustentries(),
        }
    }

    /// True if buffer `idx` is currently free.
    pub fn buf_is_free(&self, idx: u32) -> bool {
        self.inner.lock().unwrap().pools[BUF].is_free(idx)
    }

    /// Number of users currently holding the domain finalized.
    pub fn active_users(&self) -> u32 {
        self.inner.lock().unwrap().active
    }

    /// IOMMU group adopted by the domain, `-1` when unassigned.
    pub fn iommu_group(&self) -> i32 {
        self.inner.lock().unwrap().grp
    }

    /// Requested parameters of one pool.
    pub fn params(&self, kind: PoolKind) -> PoolParams {
        self.inner.lock().unwrap().params[kind as usize]
    }

    /// Update the requested parameters of one pool; the change takes
    /// effect at the next configure with no active users.
    pub fn set_params(&self, kind: PoolKind, size: u32, num: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.params[kind as usize].size = size;
        inner.params[kind as usize].num = num;
    }

    /// Allocate one packet buffer and return its index.
    pub fn alloc_buf(&self) -> Result<u32> {
        let mut inner = self.inner.lock().unwrap();
        let len = inner.bufsize();
        inner.pools[BUF]
            .alloc(len, None)
            .map(|(_, idx)| idx)
            .ok_or_else(|| Error::OutOfMemory("buffer pool exhausted".into()))
    }

    /// Free one packet buffer by index. The reserved indices cannot be
    /// freed.
    pub fn free_buf(&self, idx: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if idx < RESERVED_BUFS {
            return Err(Error::BadIndex(idx));
        }
        inner.pools[BUF].free_index(idx)
    }

    /// Allocate up to `n` extra buffers threaded into a freelist through
    /// the first word of each buffer. Returns the list head (0 when empty)
    /// and the number of buffers obtained.
    pub fn extra_alloc(&self, n: u32) -> (u32, u32) {
        let mut inner = self.inner.lock().unwrap();
        let len = inner.bufsize();
        let mut pos = 0u32;
        let mut head = 0u32;
        let mut got = 0u32;
        for _ in 0..n {
            let prev = head;
            match inner.pools[BUF].alloc(len, Some(&mut pos)) {
                Some((vaddr, idx)) => {
                    head = idx;
                    // SAFETY: every buffer is at least a word long.
                    unsafe { (vaddr.as_ptr() as *mut u32).write(prev) };
                    got += 1;
                }
                None => {
                    tracing::debug!(got, wanted = n, "no more extra buffers");
                    head = prev;
                    break;
                }
            }
        }
        (head, got)
    }

    /// Release an extra-buffer freelist.
    pub fn extra_free(&self, head: u32) {
        self.inner.lock().unwrap().extra_free(head);
    }

    /// Snapshot of the three pool regions.
    pub fn pools_info(&self) -> PoolsInfo {
        let inner = self.inner.lock().unwrap();
        let mut offset = 0usize;
        let pools = std::array::from_fn(|i| {
            let p = &inner.pools[i];
            let snap = PoolSnapshot {
                offset,
                memtotal: p.memtotal(),
                objtotal: p.objtotal(),
                objsize: p.objsize(),
            };
            offset += p.memtotal();
            snap
        });
        PoolsInfo {
            pools,
            memsize: offset,
            id: self.id,
        }
    }
}

impl MemAllocator for GlobalMem {
    fn id(&self) -> u16 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn flags(&self) -> u32 {
        self.inner.lock().unwrap().flags
    }

    fn get_lut(&self) -> Result<Lut> {
        let inner = self.inner.lock().unwrap();
        let pool = &inner.pools[BUF];
        if pool.lut().is_empty() {
            return Err(Error::NotFinalized);
        }
        Ok(Lut {
            objtotal: pool.objtotal(),
            objsize: pool.objsize(),
            entries: pool.lut().to_vec().into(),
        })
    }

    fn get_info(&self) -> Result<MemInfo> {
        let mut inner = self.inner.lock().unwrap();
        inner.config()?;
        let size = if inner.flags & MEM_FINALIZED != 0 {
            inner.totalsize
        } else {
            inner.pools.iter().map(ObjPool::cfg_memtotal).sum()
        };
        Ok(MemInfo {
            size,
            flags: inner.flags,
            id: self.id,
        })
    }

    fn ofstophys(&self, off: u64) -> Result<PhysAddr> {
        let inner = self.inner.lock().unwrap();
        let mut rel = off as usize;
        for p in &inner.pools {
            if rel < p.memtotal() {
                return p.offset_to_phys(rel);
            }
            rel -= p.memtotal();
        }
        tracing::warn!(
            off,
            if_end = inner.pools[IF].memtotal(),
            ring_end = inner.pools[IF].memtotal() + inner.pools[RING].memtotal(),
            buf_end = inner.totalsize,
            "offset outside all pools"
        );
        Err(Error::BadOffset(off))
    }

    fn config(&self) -> Result<()> {
        self.inner.lock().unwrap().config()
    }

    fn finalize(&self, na: &Adapter) -> Result<()> {
        self.assign_group(na)?;

        let mut inner = self.inner.lock().unwrap();
        inner.config()?;
        inner.active += 1;
        let result = inner.finalize_all();
        if result.is_err() {
            inner.active -= 1;
            return result;
        }
        if na.device().is_some() {
            GlobalMem::map_bufs(&inner, na);
        }
        Ok(())
    }

    fn deref(&self, na: &Adapter) {
        let mut inner = self.inner.lock().unwrap();
        if na.active_fds() <= 0 {
            na.clear_phys_lut();
        }
        if inner.active == 1 {
            // Reset the bitmaps when the allocator falls out of use so
            // that pool resources leaked by unclean exits are reclaimed.
            if let Err(err) = inner.init_bitmaps() {
                tracing::warn!(%err, "bitmap re-init on deref failed");
            }
        }
        inner.active = inner.active.saturating_sub(1);
        if inner.active == 0 {
            inner.grp = -1;
        }
        tracing::debug!(domain = %self.name, active = inner.active, "deref");
    }

    fn delete(&self) {
        let mut inner = self.inner.lock().unwrap();
        for p in &mut inner.pools {
            p.reset();
        }
        inner.flags &= !MEM_FINALIZED;
    }

    fn if_offset(&self, nifp: IfPtr) -> Result<i64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.if_offset(nifp.as_byte_ptr())? as i64)
    }

    fn if_new(&self, na: &Adapter, span: &RingSpan) -> Result<IfPtr> {
        let n = [na.nrings(Dir::Tx) + 1, na.nrings(Dir::Rx) + 1];
        let ntot = (n[0] + n[1]) as usize;

        let mut inner = self.inner.lock().unwrap();
        let len = abi::if_block_len(ntot) as u32;
        let (vaddr, _) = inner.pools[IF]
            .alloc(len, None)
            .ok_or_else(|| Error::OutOfMemory("interface pool exhausted".into()))?;
        let nifp = IfPtr::new(vaddr.cast::<NetmapIf>());
        // SAFETY: the block was just allocated with room for `ntot`
        // offset entries.
        unsafe {
            nifp.init(na.name(), na.nrings(Dir::Tx), na.nrings(Dir::Rx));
        }

        // Ring offsets are stored relative to the interface block so
        // userspace can reach each ring from the nifp alone.
        let base = inner.if_offset(vaddr)? as i64;
        for dir in Dir::ALL {
            for i in 0..n[dir as usize] {
                let mut ofs = 0i64;
                if i >= span.first[dir as usize] && i < span.last[dir as usize] {
                    if let Some(ring) = na.kring(dir, i).and_then(|k| k.ring()) {
                        ofs = inner.ring_offset(ring.as_byte_ptr())? as i64 - base;
                    }
                }
                let k = match dir {
                    Dir::Tx => i,
                    Dir::Rx => i + n[0],
                } as usize;
                // SAFETY: `k < ntot` by construction.
                unsafe { nifp.set_ring_ofs(k, ofs) };
            }
        }

        Ok(nifp)
    }

    fn if_delete(&self, _na: &Adapter, nifp: IfPtr) {
        let mut inner = self.inner.lock().unwrap();
        // SAFETY: the caller hands back a block obtained from if_new.
        let head = unsafe { nifp.bufs_head() };
        if head != 0 {
            inner.extra_free(head);
        }
        if let Err(err) = inner.pools[IF].free_vaddr(nifp.as_byte_ptr()) {
            tracing::warn!(%err, "interface block free failed");
        }
    }

    fn rings_create(&self, na: &Adapter) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for dir in Dir::ALL {
            let n = na.nrings(dir);
            for i in 0..=n {
                let Some(kring) = na.kring(dir, i) else {
                    continue;
                };
                if kring.ring().is_some() || (kring.users() == 0 && !kring.needring()) {
                    // Unneeded, or already created by somebody else.
                    continue;
                }
                let ndesc = kring.num_slots();
                let len = abi::ring_block_len(ndesc as usize) as u32;
                let Some((vaddr, _)) = inner.pools[RING].alloc(len, None) else {
                    tracing::warn!(kring = %kring.name(), "cannot allocate ring");
                    inner.free_rings(na);
                    return Err(Error::OutOfMemory("ring pool exhausted".into()));
                };
                let ring = RingPtr::new(vaddr.cast::<NetmapRing>());
                kring.set_ring(Some(ring));

                let buf_base =
                    (inner.pools[IF].memtotal() + inner.pools[RING].memtotal()) as i64;
                let ring_off = inner.ring_offset(vaddr)? as i64;
                // SAFETY: the block was just allocated with `ndesc` slots.
                unsafe {
                    ring.set_num_slots(ndesc);
                    ring.set_buf_ofs(buf_base - ring_off);
                    ring.set_head(kring.rhead());
                    ring.set_cur(kring.rcur());
                    ring.set_tail(kring.rtail());
                    ring.set_nr_buf_size(inner.bufsize() as u16);
                    ring.set_ringid(kring.ring_id());
                    ring.set_dir(kring.dir() as u16);
                }

                if i != n || na.host_rings() {
                    // A real ring gets freshly allocated buffers.
                    // SAFETY: the block covers `ndesc` slots.
                    if let Err(e) = unsafe { inner.new_bufs(ring, ndesc) } {
                        tracing::warn!(kring = %kring.name(), "cannot allocate buffers");
                        inner.free_rings(na);
                        return Err(e);
                    }
                } else {
                    // A fake ring mirrors the host stack: every slot
                    // points at the reserved scratch buffer.
                    // SAFETY: as above.
                    unsafe { inner.set_fake_ring(ring, ndesc, 0) };
                }
            }
        }
        Ok(())
    }

    fn rings_delete(&self, na: &Adapter) {
        self.inner.lock().unwrap().free_rings(na);
    }
}

impl std::fmt::Debug for GlobalMem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalMem")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}
