//! The guest passthrough domain: a lookup table over host-owned memory.
//!
//! A paravirtualized guest does not allocate pool memory; the host's
//! shared region shows up through a device BAR, already laid out and
//! already populated. This domain implements the same [`MemAllocator`]
//! operations as the owning variant, but finalize merely maps the region
//! and reads the buffer geometry from device registers, and the ring
//! fabric points krings at rings the host built.
//!
//! The variant exists to show the allocator interface abstracting both
//! owning and non-owning memory; adapters cannot tell the difference.

use super::pool::LutEntry;
use super::{Lut, MemAllocator, MemInfo, PhysAddr, MEM_FINALIZED, MEM_IO};
use crate::abi::{IfPtr, NetmapIf, NetmapRing, RingPtr};
use crate::adapter::{Adapter, Dir, RingSpan};
use crate::error::{Error, Result};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

/// Device registers a passthrough domain reads at finalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtReg {
    /// Offset of the BUF pool within the region.
    BufPoolOfs,
    /// Number of buffers.
    BufPoolObjNum,
    /// Size of each buffer.
    BufPoolObjSz,
}

/// A mapped view of the host region.
#[derive(Debug, Clone, Copy)]
pub struct PtMapping {
    /// Bus address of the region in the guest.
    pub paddr: u64,
    /// Virtual address of the region in the guest.
    pub base: NonNull<u8>,
    /// Region length in bytes.
    pub len: usize,
}

// SAFETY: a mapping descriptor is only addresses; access discipline is on
// the host/guest protocol.
unsafe impl Send for PtMapping {}
unsafe impl Sync for PtMapping {}

/// The memory device that fronts the host region in the guest.
pub trait PtMemDev: Send + Sync {
    /// Map the region into the guest.
    fn iomap(&self) -> Result<PtMapping>;

    /// Read a device register.
    fn ioread(&self, reg: PtReg) -> u32;

    /// Unmap the region.
    fn iounmap(&self);
}

struct PtIf {
    ifname: String,
    nifp_offset: u32,
}

struct PtInner {
    flags: u32,
    active: u32,
    grp: i32,
    dev: Option<Arc<dyn PtMemDev>>,
    mapping: Option<PtMapping>,
    totalsize: usize,
    buf_lut: Vec<LutEntry>,
    buf_objtotal: u32,
    buf_objsize: u32,
    ifs: Vec<PtIf>,
}

/// Guest passthrough memory domain.
pub struct PassthroughMem {
    id: u16,
    name: String,
    host_mem_id: u16,
    inner: Mutex<PtInner>,
}

impl PassthroughMem {
    pub(crate) fn new(id: u16, host_mem_id: u16) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: id.to_string(),
            host_mem_id,
            inner: Mutex::new(PtInner {
                flags: MEM_IO,
                active: 0,
                grp: -1,
                dev: None,
                mapping: None,
                totalsize: 0,
                buf_lut: Vec::new(),
                buf_objtotal: 0,
                buf_objsize: 0,
                ifs: Vec::new(),
            }),
        })
    }

    /// The host-side id of the region this domain mirrors.
    pub fn host_mem_id(&self) -> u16 {
        self.host_mem_id
    }

    /// Attach the memory device. The device order is not important: the
    /// device may attach before or after the first interface.
    pub fn set_device(&self, dev: Arc<dyn PtMemDev>) {
        self.inner.lock().unwrap().dev = Some(dev);
    }

    /// Link an interface to its block inside the host region.
    pub fn if_add(&self, ifname: &str, nifp_offset: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.ifs.push(PtIf {
            ifname: ifname.to_string(),
            nifp_offset,
        });
        tracing::debug!(ifname, nifp_offset, "passthrough interface added");
    }

    /// Unlink an interface.
    pub fn if_del(&self, ifname: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.ifs.len();
        inner.ifs.retain(|i| i.ifname != ifname);
        let removed = inner.ifs.len() != before;
        if removed {
            tracing::debug!(ifname, "passthrough interface removed");
        }
        removed
    }

    fn lookup_nifp(inner: &PtInner, ifname: &str) -> Result<IfPtr> {
        let mapping = inner.mapping.ok_or(Error::NotFinalized)?;
        let ptif = inner
            .ifs
            .iter()
            .find(|i| i.ifname == ifname)
            .ok_or_else(|| {
                tracing::warn!(ifname, "interface is not in passthrough");
                Error::PeerNotFound
            })?;
        // SAFETY: the host guarantees nifp_offset lies inside the region.
        let p = unsafe { mapping.base.as_ptr().add(ptif.nifp_offset as usize) };
        Ok(IfPtr::new(
            NonNull::new(p as *mut NetmapIf).ok_or(Error::NotFinalized)?,
        ))
    }
}

impl MemAllocator for PassthroughMem {
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
        if inner.flags & MEM_FINALIZED == 0 {
            return Err(Error::NotFinalized);
        }
        Ok(Lut {
            objtotal: inner.buf_objtotal,
            objsize: inner.buf_objsize,
            entries: inner.buf_lut.clone().into(),
        })
    }

    fn get_info(&self) -> Result<MemInfo> {
        let inner = self.inner.lock().unwrap();
        Ok(MemInfo {
            size: inner.totalsize,
            flags: inner.flags,
            id: self.id,
        })
    }

    fn ofstophys(&self, off: u64) -> Result<PhysAddr> {
        let inner = self.inner.lock().unwrap();
        let mapping = inner.mapping.ok_or(Error::NotFinalized)?;
        if off as usize >= mapping.len {
            return Err(Error::BadOffset(off));
        }
        Ok(PhysAddr(mapping.paddr + off))
    }

    fn config(&self) -> Result<()> {
        // Configured on creation; the configuration never changes.
        Ok(())
    }

    fn finalize(&self, na: &Adapter) -> Result<()> {
        let group = na.iommu_group();
        let mut inner = self.inner.lock().unwrap();
        if inner.grp < 0 {
            inner.grp = group;
        }
        if inner.grp != group {
            return Err(Error::GroupMismatch {
                domain: inner.grp,
                device: group,
            });
        }

        inner.active += 1;
        if inner.flags & MEM_FINALIZED != 0 {
            return Ok(());
        }

        let Some(dev) = inner.dev.clone() else {
            inner.active -= 1;
            return Err(Error::OutOfMemory("passthrough memdev not attached".into()));
        };
        let mapping = match dev.iomap() {
            Ok(m) => m,
            Err(e) => {
                inner.active -= 1;
                return Err(e);
            }
        };

        // The buffer lookup table comes straight from the device
        // registers: base + pool offset, then one entry per stride.
        let bufsize = dev.ioread(PtReg::BufPoolObjSz);
        let nbuffers = dev.ioread(PtReg::BufPoolObjNum);
        let poolofs = dev.ioread(PtReg::BufPoolOfs) as usize;

        inner.buf_lut = (0..nbuffers as usize)
            .map(|i| {
                let off = poolofs + i * bufsize as usize;
                LutEntry {
                    // SAFETY: the host guarantees the pool lies inside
                    // the mapped region.
                    vaddr: NonNull::new(unsafe { mapping.base.as_ptr().add(off) }),
                    paddr: mapping.paddr + off as u64,
                }
            })
            .collect();
        inner.buf_objtotal = nbuffers;
        inner.buf_objsize = bufsize;
        inner.totalsize = mapping.len;
        inner.mapping = Some(mapping);
        inner.flags |= MEM_FINALIZED;
        tracing::debug!(
            domain = %self.name,
            host = self.host_mem_id,
            bufs = nbuffers,
            "passthrough domain finalized"
        );
        Ok(())
    }

    fn deref(&self, _na: &Adapter) {
        let mut inner = self.inner.lock().unwrap();
        inner.active = inner.active.saturating_sub(1);
        if inner.active == 0 && inner.flags & MEM_FINALIZED != 0 {
            inner.flags &= !MEM_FINALIZED;
            if let Some(dev) = &inner.dev {
                dev.iounmap();
            }
            inner.mapping = None;
            inner.buf_lut.clear();
        }
    }

    fn delete(&self) {
        let inner = self.inner.lock().unwrap();
        if inner.active > 0 {
            tracing::warn!(
                domain = %self.name,
                active = inner.active,
                "deleting passthrough domain with active users"
            );
        }
    }

    fn if_offset(&self, nifp: IfPtr) -> Result<i64> {
        let inner = self.inner.lock().unwrap();
        let mapping = inner.mapping.ok_or(Error::NotFinalized)?;
        Ok(nifp.as_ptr() as usize as i64 - mapping.base.as_ptr() as usize as i64)
    }

    fn if_new(&self, na: &Adapter, _span: &RingSpan) -> Result<IfPtr> {
        let inner = self.inner.lock().unwrap();
        Self::lookup_nifp(&inner, na.name())
    }

    fn if_delete(&self, na: &Adapter, _nifp: IfPtr) {
        let inner = self.inner.lock().unwrap();
        if Self::lookup_nifp(&inner, na.name()).is_err() {
            tracing::warn!(adapter = %na.name(), "interface is not in passthrough");
        }
    }

    fn rings_create(&self, na: &Adapter) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let nifp = Self::lookup_nifp(&inner, na.name())?;

        // Point each kring at the corresponding ring the host built.
        let ntx = na.nrings(Dir::Tx);
        for dir in Dir::ALL {
            for i in 0..=na.nrings(dir) {
                let Some(kring) = na.kring(dir, i) else {
                    continue;
                };
                if kring.ring().is_some() {
                    continue;
                }
                let k = match dir {
                    Dir::Tx => i,
                    Dir::Rx => i + ntx + 1,
                } as usize;
                // SAFETY: the host sized the block for both directions
                // including the host rings.
                let ofs = unsafe { nifp.ring_ofs(k) };
                let p = unsafe { nifp.as_byte_ptr().as_ptr().offset(ofs as isize) };
                if let Some(ring) = NonNull::new(p as *mut NetmapRing) {
                    kring.set_ring(Some(RingPtr::new(ring)));
                }
            }
        }
        Ok(())
    }

    fn rings_delete(&self, _na: &Adapter) {
        // The rings belong to the host. The guest drops its pointers when
        // the krings themselves go away.
    }

    fn pt_host_id(&self) -> Option<u16> {
        Some(self.host_mem_id)
    }

    fn as_passthrough(self: Arc<Self>) -> Option<Arc<PassthroughMem>> {
        Some(self)
    }
}

impl std::fmt::Debug for PassthroughMem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassthroughMem")
            .field("id", &self.id)
            .field("host_mem_id", &self.host_mem_id)
            .finish()
    }
}
