//! Shared-memory layout exported to userspace.
//!
//! Everything in this module is part of a bit-exact contract: userspace
//! mmaps the pool region and walks it with nothing but the offsets stored
//! here. The region is laid out as `[IF pool | RING pool | BUF pool]`.
//!
//! # Navigation
//!
//! - A ring is reached from its interface block as `nifp + ring_ofs[k]`.
//!   An entry of `0` marks a ring that is invalid or not selected for this
//!   client.
//! - A packet buffer is reached from its ring as
//!   `ring + buf_ofs + slot.buf_idx * nr_buf_size`.
//!
//! Buffer indices `0` and `1` are reserved scratch buffers and are never
//! handed out by the allocator.
//!
//! The structs are `repr(C)` and only ever live inside pool memory; code in
//! this crate reads and writes them through the raw-pointer handles
//! [`IfPtr`] and [`RingPtr`], never through references, since userspace may
//! be mapping (and scribbling on) the same bytes.

use std::ptr::{self, NonNull};

/// Maximum interface name length, including the terminating byte.
pub const IFNAMSIZ: usize = 16;

/// Reserved buffer index used as TX scratch by rings with no live data.
pub const FAKE_TX_BUF: u32 = 0;

/// Reserved buffer index used as RX scratch by rings with no live data.
pub const FAKE_RX_BUF: u32 = 1;

/// Number of reserved buffer indices at the start of the BUF pool.
pub const RESERVED_BUFS: u32 = 2;

/// One slot descriptor: the unit exchanged by the zero-copy protocols.
///
/// Swapping two `NetmapSlot` values between a TX and an RX ring moves the
/// packet buffer itself; no bytes are copied.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetmapSlot {
    /// Index of the packet buffer in the BUF pool.
    pub buf_idx: u32,
    /// Length of the data in the buffer.
    pub len: u16,
    /// Slot flags (buffer changed, report completion, ...).
    pub flags: u16,
}

/// Per-client interface block, drawn from the IF pool.
///
/// The fixed header is followed inline by `ring_ofs`, an array of
/// `(ni_tx_rings + 1) + (ni_rx_rings + 1)` signed offsets from the block
/// base to each ring (TX entries first); the `+ 1` per direction is the
/// host ring.
#[repr(C, align(8))]
#[derive(Debug)]
pub struct NetmapIf {
    /// Interface name, zero padded.
    pub ni_name: [u8; IFNAMSIZ],
    /// Number of hardware TX rings (host ring excluded).
    pub ni_tx_rings: u32,
    /// Number of hardware RX rings (host ring excluded).
    pub ni_rx_rings: u32,
    /// Head of the extra-buffer freelist, `0` when empty.
    pub ni_bufs_head: u32,
}

/// Shared ring header, drawn from the RING pool.
///
/// The header is followed inline by `num_slots` [`NetmapSlot`] entries.
#[repr(C)]
#[derive(Debug)]
pub struct NetmapRing {
    /// Number of slots in the ring.
    pub num_slots: u32,
    /// Offset from this ring to the base of the BUF pool region.
    pub buf_ofs: i64,
    /// First slot the kernel may not touch (owned by userspace up to here).
    pub head: u32,
    /// Wakeup point: userspace wants to be woken when `tail` passes `cur`.
    pub cur: u32,
    /// First slot owned by the kernel.
    pub tail: u32,
    /// Size of each buffer indexed by the slots.
    pub nr_buf_size: u16,
    /// Ring number within its direction.
    pub ringid: u16,
    /// Direction: `0` for TX, `1` for RX.
    pub dir: u16,
}

/// Byte length of an interface block with `ntot` ring offset entries.
pub const fn if_block_len(ntot: usize) -> usize {
    std::mem::size_of::<NetmapIf>() + ntot * std::mem::size_of::<i64>()
}

/// Byte length of a ring block with `ndesc` slots.
pub const fn ring_block_len(ndesc: usize) -> usize {
    std::mem::size_of::<NetmapRing>() + ndesc * std::mem::size_of::<NetmapSlot>()
}

/// Raw handle to a [`NetmapIf`] living inside pool memory.
///
/// # Safety
///
/// All accessors are unsafe: the caller must guarantee that the handle
/// points at a live interface block inside a finalized pool and that the
/// block is large enough for the indices used. The handle performs no
/// bounds checking of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IfPtr(NonNull<NetmapIf>);

// SAFETY: the handle is only an address; every access to the memory it
// names goes through an unsafe, documented entry point.
unsafe impl Send for IfPtr {}
unsafe impl Sync for IfPtr {}

impl IfPtr {
    /// Wrap a raw interface block pointer.
    pub fn new(ptr: NonNull<NetmapIf>) -> Self {
        Self(ptr)
    }

    /// The raw pointer.
    pub fn as_ptr(self) -> *mut NetmapIf {
        self.0.as_ptr()
    }

    /// The block base as a byte pointer.
    pub fn as_byte_ptr(self) -> NonNull<u8> {
        self.0.cast()
    }

    /// Write the fixed header fields.
    ///
    /// The name is truncated to [`IFNAMSIZ`] bytes and zero padded.
    ///
    /// # Safety
    ///
    /// `self` must point at a writable block of at least
    /// [`if_block_len`]`(tx_rings + 1 + rx_rings + 1)` bytes.
    pub unsafe fn init(self, name: &str, tx_rings: u32, rx_rings: u32) {
        let p = self.as_ptr();
        // SAFETY: caller guarantees the block is live and writable.
        unsafe {
            let mut buf = [0u8; IFNAMSIZ];
            let n = name.len().min(IFNAMSIZ - 1);
            buf[..n].copy_from_slice(&name.as_bytes()[..n]);
            ptr::addr_of_mut!((*p).ni_name).write(buf);
            ptr::addr_of_mut!((*p).ni_tx_rings).write(tx_rings);
            ptr::addr_of_mut!((*p).ni_rx_rings).write(rx_rings);
            ptr::addr_of_mut!((*p).ni_bufs_head).write(0);
        }
    }

    /// Read the interface name.
    ///
    /// # Safety
    ///
    /// `self` must point at a live interface block.
    pub unsafe fn name(self) -> String {
        // SAFETY: caller guarantees the block is live.
        let raw = unsafe { ptr::addr_of!((*self.as_ptr()).ni_name).read() };
        let len = raw.iter().position(|&b| b == 0).unwrap_or(IFNAMSIZ);
        String::from_utf8_lossy(&raw[..len]).into_owned()
    }

    /// Read the TX ring count.
    ///
    /// # Safety
    ///
    /// `self` must point at a live interface block.
    pub unsafe fn tx_rings(self) -> u32 {
        // SAFETY: caller guarantees the block is live.
        unsafe { ptr::addr_of!((*self.as_ptr()).ni_tx_rings).read() }
    }

    /// Read the RX ring count.
    ///
    /// # Safety
    ///
    /// `self` must point at a live interface block.
    pub unsafe fn rx_rings(self) -> u32 {
        // SAFETY: caller guarantees the block is live.
        unsafe { ptr::addr_of!((*self.as_ptr()).ni_rx_rings).read() }
    }

    /// Read the extra-buffer freelist head.
    ///
    /// # Safety
    ///
    /// `self` must point at a live interface block.
    pub unsafe fn bufs_head(self) -> u32 {
        // SAFETY: caller guarantees the block is live.
        unsafe { ptr::addr_of!((*self.as_ptr()).ni_bufs_head).read() }
    }

    /// Write the extra-buffer freelist head.
    ///
    /// # Safety
    ///
    /// `self` must point at a live, writable interface block.
    pub unsafe fn set_bufs_head(self, head: u32) {
        // SAFETY: caller guarantees the block is live and writable.
        unsafe { ptr::addr_of_mut!((*self.as_ptr()).ni_bufs_head).write(head) }
    }

    /// Pointer to the `k`-th ring offset entry.
    ///
    /// # Safety
    ///
    /// `self` must point at a live block with more than `k` offset entries.
    pub unsafe fn ring_ofs_ptr(self, k: usize) -> *mut i64 {
        // SAFETY: the tail starts right after the aligned fixed header;
        // caller guarantees `k` is in range.
        unsafe { (self.as_ptr().add(1) as *mut i64).add(k) }
    }

    /// Read the `k`-th ring offset entry.
    ///
    /// # Safety
    ///
    /// As for [`IfPtr::ring_ofs_ptr`].
    pub unsafe fn ring_ofs(self, k: usize) -> i64 {
        // SAFETY: forwarded to the caller.
        unsafe { self.ring_ofs_ptr(k).read() }
    }

    /// Write the `k`-th ring offset entry.
    ///
    /// # Safety
    ///
    /// As for [`IfPtr::ring_ofs_ptr`], plus writability.
    pub unsafe fn set_ring_ofs(self, k: usize, ofs: i64) {
        // SAFETY: forwarded to the caller.
        unsafe { self.ring_ofs_ptr(k).write(ofs) }
    }
}

/// Raw handle to a [`NetmapRing`] living inside pool memory.
///
/// # Safety
///
/// Same contract as [`IfPtr`]: the caller vouches for liveness and size.
/// Index fields of a ring in netmap mode are written by one side and read
/// by the other; the memory-ordering discipline lives in the callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingPtr(NonNull<NetmapRing>);

// SAFETY: as for IfPtr.
unsafe impl Send for RingPtr {}
unsafe impl Sync for RingPtr {}

macro_rules! ring_field {
    ($get:ident, $set:ident, $field:ident, $ty:ty, $doc:literal) => {
        #[doc = concat!("Read ", $doc, ".")]
        ///
        /// # Safety
        ///
        /// `self` must point at a live ring block.
        pub unsafe fn $get(self) -> $ty {
            // SAFETY: caller guarantees the block is live.
            unsafe { ptr::addr_of!((*self.as_ptr()).$field).read() }
        }

        #[doc = concat!("Write ", $doc, ".")]
        ///
        /// # Safety
        ///
        /// `self` must point at a live, writable ring block.
        pub unsafe fn $set(self, v: $ty) {
            // SAFETY: caller guarantees the block is live and writable.
            unsafe { ptr::addr_of_mut!((*self.as_ptr()).$field).write(v) }
        }
    };
}

impl RingPtr {
    /// Wrap a raw ring pointer.
    pub fn new(ptr: NonNull<NetmapRing>) -> Self {
        Self(ptr)
    }

    /// The raw pointer.
    pub fn as_ptr(self) -> *mut NetmapRing {
        self.0.as_ptr()
    }

    /// The ring base as a byte pointer.
    pub fn as_byte_ptr(self) -> NonNull<u8> {
        self.0.cast()
    }

    ring_field!(num_slots, set_num_slots, num_slots, u32, "the slot count");
    ring_field!(buf_ofs, set_buf_ofs, buf_ofs, i64, "the BUF-pool base offset");
    ring_field!(head, set_head, head, u32, "the `head` index");
    ring_field!(cur, set_cur, cur, u32, "the `cur` index");
    ring_field!(tail, set_tail, tail, u32, "the `tail` index");
    ring_field!(nr_buf_size, set_nr_buf_size, nr_buf_size, u16, "the buffer size");
    ring_field!(ringid, set_ringid, ringid, u16, "the ring id");
    ring_field!(dir, set_dir, dir, u16, "the ring direction");

    /// Pointer to slot `i` of the inline slot array.
    ///
    /// # Safety
    ///
    /// `self` must point at a live ring block with more than `i` slots.
    pub unsafe fn slot_ptr(self, i: u32) -> *mut NetmapSlot {
        // SAFETY: the slot array starts right after the header; caller
        // guarantees `i` is in range.
        unsafe { (self.as_ptr().add(1) as *mut NetmapSlot).add(i as usize) }
    }

    /// Read slot `i`.
    ///
    /// # Safety
    ///
    /// As for [`RingPtr::slot_ptr`].
    pub unsafe fn slot(self, i: u32) -> NetmapSlot {
        // SAFETY: forwarded to the caller.
        unsafe { self.slot_ptr(i).read() }
    }

    /// Write slot `i`.
    ///
    /// # Safety
    ///
    /// As for [`RingPtr::slot_ptr`], plus writability.
    pub unsafe fn set_slot(self, i: u32, slot: NetmapSlot) {
        // SAFETY: forwarded to the caller.
        unsafe { self.slot_ptr(i).write(slot) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, size_of};

    #[test]
    fn slot_is_eight_bytes() {
        assert_eq!(size_of::<NetmapSlot>(), 8);
        assert_eq!(align_of::<NetmapSlot>(), 4);
    }

    #[test]
    fn if_header_aligns_ring_ofs_tail() {
        // The signed offset array follows the header directly, so the
        // header size must be a multiple of the offset alignment.
        assert_eq!(size_of::<NetmapIf>() % align_of::<i64>(), 0);
        assert_eq!(if_block_len(4), size_of::<NetmapIf>() + 32);
    }

    #[test]
    fn ring_header_aligns_slot_tail() {
        assert_eq!(size_of::<NetmapRing>() % align_of::<NetmapSlot>(), 0);
        assert_eq!(
            ring_block_len(64),
            size_of::<NetmapRing>() + 64 * size_of::<NetmapSlot>()
        );
    }

    #[test]
    fn if_block_roundtrip() {
        // Backed by u64 so the block is aligned like pool memory.
        let mut mem = vec![0u64; if_block_len(4) / 8];
        let nifp = IfPtr::new(NonNull::new(mem.as_mut_ptr() as *mut NetmapIf).unwrap());
        unsafe {
            nifp.init("veth0", 1, 1);
            nifp.set_ring_ofs(0, 4096);
            nifp.set_ring_ofs(3, -128);
            assert_eq!(nifp.name(), "veth0");
            assert_eq!(nifp.tx_rings(), 1);
            assert_eq!(nifp.rx_rings(), 1);
            assert_eq!(nifp.bufs_head(), 0);
            assert_eq!(nifp.ring_ofs(0), 4096);
            assert_eq!(nifp.ring_ofs(3), -128);
        }
    }

    #[test]
    fn ring_block_roundtrip() {
        let mut mem = vec![0u64; ring_block_len(8).div_ceil(8)];
        let ring = RingPtr::new(NonNull::new(mem.as_mut_ptr() as *mut NetmapRing).unwrap());
        unsafe {
            ring.set_num_slots(8);
            ring.set_buf_ofs(-4096);
            ring.set_nr_buf_size(2048);
            ring.set_dir(1);
            ring.set_slot(
                7,
                NetmapSlot {
                    buf_idx: 42,
                    len: 60,
                    flags: 0,
                },
            );
            assert_eq!(ring.num_slots(), 8);
            assert_eq!(ring.buf_ofs(), -4096);
            assert_eq!(ring.nr_buf_size(), 2048);
            assert_eq!(ring.dir(), 1);
            assert_eq!(ring.slot(7).buf_idx, 42);
        }
    }
}
