//! Integration tests for the ring fabric: interface blocks, shared rings,
//! and the offsets userspace navigates them with.

use netmap_mem::adapter::{Adapter, AdapterConfig, Dir, RingSpan, NAF_HOST_RINGS};
use netmap_mem::mem::{GlobalMem, MemAllocator, MemRegistry, PoolKind, PrivateSpec};
use std::sync::Arc;

fn private_mem(registry: &MemRegistry, descs: u32) -> Arc<GlobalMem> {
    registry
        .create_private(&PrivateSpec {
            tx_rings: 1,
            tx_descs: descs,
            rx_rings: 1,
            rx_descs: descs,
            extra_bufs: 8,
            n_pipes: 0,
        })
        .unwrap()
}

fn adapter(mem: &Arc<GlobalMem>, name: &str, descs: u32, flags: u32) -> Arc<Adapter> {
    Adapter::new(AdapterConfig {
        name: name.into(),
        mem: mem.clone(),
        num_tx_rings: 1,
        num_rx_rings: 1,
        num_tx_desc: descs,
        num_rx_desc: descs,
        flags,
        device: None,
    })
}

/// Bump the users count on every real kring, as a registering client does.
fn claim_real_krings(na: &Arc<Adapter>) {
    for dir in Dir::ALL {
        for i in 0..na.nrings(dir) {
            na.kring(dir, i).unwrap().users_add();
        }
    }
}

// ============================================================================
// Attach and mmap offsets
// ============================================================================

/// The offsets written into the interface block lead userspace from the
/// nifp to the ring and from a slot to its buffer.
#[test]
fn if_block_offsets_reach_rings_and_buffers() {
    let registry = MemRegistry::new();
    let mem = private_mem(&registry, 256);
    let na = adapter(&mem, "p0", 256, 0);

    mem.finalize(&na).unwrap();
    na.krings_create().unwrap();
    claim_real_krings(&na);
    mem.rings_create(&na).unwrap();
    let nifp = mem.if_new(&na, &RingSpan::all(&na)).unwrap();

    unsafe {
        assert_eq!(nifp.name(), "p0");
        assert_eq!(nifp.tx_rings(), 1);
        assert_eq!(nifp.rx_rings(), 1);
    }

    let info = mem.pools_info();
    let nifp_off = mem.if_offset(nifp).unwrap();

    // ring_ofs[0] points at the TX ring, inside the ring pool region.
    let ring_ofs0 = unsafe { nifp.ring_ofs(0) };
    assert_ne!(ring_ofs0, 0);
    let ring_off = (nifp_off + ring_ofs0) as usize;
    let ring_region = info.pools[PoolKind::Ring as usize];
    assert!(ring_off >= ring_region.offset);
    assert!(ring_off < ring_region.offset + ring_region.memtotal);

    let ring = na.kring(Dir::Tx, 0).unwrap().ring().unwrap();
    let (num_slots, buf_size, buf_ofs, slot0) =
        unsafe { (ring.num_slots(), ring.nr_buf_size(), ring.buf_ofs(), ring.slot(0)) };
    assert_eq!(num_slots, 256);
    assert_eq!(buf_size, 2048);

    // ring + buf_ofs lands exactly on the buffer pool base.
    let buf_region = info.pools[PoolKind::Buf as usize];
    assert_eq!((ring_off as i64 + buf_ofs) as usize, buf_region.offset);

    // ... and + buf_idx * nr_buf_size on the slot's buffer.
    let buf_off = ring_off as i64 + buf_ofs + slot0.buf_idx as i64 * buf_size as i64;
    assert!((buf_off as usize) < buf_region.offset + buf_region.memtotal);
    let pa = mem.ofstophys(buf_off as u64).unwrap();
    let lut = mem.get_lut().unwrap();
    assert_eq!(pa.0, lut.entries[slot0.buf_idx as usize].paddr);

    mem.if_delete(&na, nifp);
    mem.deref(&na);
}

/// Rings outside the client's selected range get a zero offset entry.
#[test]
fn unselected_rings_have_zero_offsets() {
    let registry = MemRegistry::new();
    let mem = private_mem(&registry, 64);
    let na = adapter(&mem, "p0", 64, 0);

    mem.finalize(&na).unwrap();
    na.krings_create().unwrap();
    claim_real_krings(&na);
    mem.rings_create(&na).unwrap();

    // TX only: the RX entries and the host entries stay zero.
    let span = RingSpan {
        first: [0, 0],
        last: [1, 0],
    };
    let nifp = mem.if_new(&na, &span).unwrap();
    unsafe {
        assert_ne!(nifp.ring_ofs(0), 0); // TX0
        assert_eq!(nifp.ring_ofs(1), 0); // TX host: no ring
        assert_eq!(nifp.ring_ofs(2), 0); // RX0: outside the span
        assert_eq!(nifp.ring_ofs(3), 0); // RX host
    }

    mem.if_delete(&na, nifp);
    mem.deref(&na);
}

// ============================================================================
// Ring creation policy
// ============================================================================

/// Krings with no users and no peer claim get no ring at all; the host
/// kring of a hostless adapter gets a fake ring pointing at the scratch
/// buffer.
#[test]
fn ring_creation_respects_users_and_host_flags() {
    let registry = MemRegistry::new();
    let mem = private_mem(&registry, 64);
    let na = adapter(&mem, "p0", 64, 0);

    mem.finalize(&na).unwrap();
    na.krings_create().unwrap();

    // Nobody claims anything: no ring is created.
    mem.rings_create(&na).unwrap();
    for dir in Dir::ALL {
        for i in 0..=na.nrings(dir) {
            assert!(na.kring(dir, i).unwrap().ring().is_none());
        }
    }

    // Claim the TX host kring: it exists but is fake, every slot pointing
    // at the reserved scratch buffer, with no buffer consumed.
    let bufs_before = mem.pool_stats(PoolKind::Buf).objfree;
    let host = na.kring(Dir::Tx, 1).unwrap();
    host.users_add();
    mem.rings_create(&na).unwrap();
    let ring = host.ring().unwrap();
    for i in 0..64 {
        assert_eq!(unsafe { ring.slot(i).buf_idx }, 0);
    }
    assert_eq!(mem.pool_stats(PoolKind::Buf).objfree, bufs_before);

    // Releasing the claim releases the ring but no buffers.
    host.users_sub();
    mem.rings_delete(&na);
    assert!(host.ring().is_none());
    assert_eq!(mem.pool_stats(PoolKind::Buf).objfree, bufs_before);

    mem.deref(&na);
}

/// An adapter with host rings gets real buffers on its host ring too.
#[test]
fn host_rings_flag_makes_host_rings_real() {
    let registry = MemRegistry::new();
    let mem = private_mem(&registry, 64);
    let na = adapter(&mem, "p0", 64, NAF_HOST_RINGS);

    mem.finalize(&na).unwrap();
    na.krings_create().unwrap();
    let bufs_before = mem.pool_stats(PoolKind::Buf).objfree;

    let host = na.kring(Dir::Rx, 1).unwrap();
    host.users_add();
    mem.rings_create(&na).unwrap();
    let ring = host.ring().unwrap();
    assert!(unsafe { ring.slot(0).buf_idx } >= 2);
    assert_eq!(mem.pool_stats(PoolKind::Buf).objfree, bufs_before - 64);

    host.users_sub();
    mem.rings_delete(&na);
    assert_eq!(mem.pool_stats(PoolKind::Buf).objfree, bufs_before);

    mem.deref(&na);
}

/// rings_create is idempotent: existing rings are kept, and rings_delete
/// leaves claimed rings alone.
#[test]
fn rings_survive_while_claimed() {
    let registry = MemRegistry::new();
    let mem = private_mem(&registry, 64);
    let na = adapter(&mem, "p0", 64, 0);

    mem.finalize(&na).unwrap();
    na.krings_create().unwrap();
    claim_real_krings(&na);
    mem.rings_create(&na).unwrap();

    let tx = na.kring(Dir::Tx, 0).unwrap();
    let ring = tx.ring().unwrap();
    mem.rings_create(&na).unwrap();
    assert_eq!(tx.ring().unwrap(), ring);

    // Still claimed: delete keeps it.
    mem.rings_delete(&na);
    assert!(tx.ring().is_some());

    // Unclaimed: delete releases it.
    for dir in Dir::ALL {
        for i in 0..na.nrings(dir) {
            na.kring(dir, i).unwrap().users_sub();
        }
    }
    mem.rings_delete(&na);
    assert!(tx.ring().is_none());

    mem.deref(&na);
}

// ============================================================================
// Interface block lifecycle
// ============================================================================

/// Deleting an interface block releases the extra buffers it heads.
#[test]
fn if_delete_releases_extra_buffers() {
    let registry = MemRegistry::new();
    let mem = private_mem(&registry, 64);
    let na = adapter(&mem, "p0", 64, 0);

    mem.finalize(&na).unwrap();
    na.krings_create().unwrap();
    let nifp = mem.if_new(&na, &RingSpan::all(&na)).unwrap();

    let free_before = mem.pool_stats(PoolKind::Buf).objfree;
    let (head, got) = mem.extra_alloc(5);
    assert_eq!(got, 5);
    unsafe { nifp.set_bufs_head(head) };
    assert_eq!(mem.pool_stats(PoolKind::Buf).objfree, free_before - 5);

    mem.if_delete(&na, nifp);
    assert_eq!(mem.pool_stats(PoolKind::Buf).objfree, free_before);

    mem.deref(&na);
}

/// Interface blocks come from the interface pool and are returned to it.
#[test]
fn if_blocks_recycle() {
    let registry = MemRegistry::new();
    let mem = private_mem(&registry, 64);
    let na = adapter(&mem, "p0", 64, 0);

    mem.finalize(&na).unwrap();
    na.krings_create().unwrap();

    let free_before = mem.pool_stats(PoolKind::If).objfree;
    let nifp = mem.if_new(&na, &RingSpan::all(&na)).unwrap();
    assert_eq!(mem.pool_stats(PoolKind::If).objfree, free_before - 1);
    mem.if_delete(&na, nifp);
    assert_eq!(mem.pool_stats(PoolKind::If).objfree, free_before);

    mem.deref(&na);
}
