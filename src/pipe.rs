//! Peer-pipe protocol: two cross-linked adapters exchanging slots.
//!
//! The two halves of a virtual-ethernet pair (or the two ends of a pipe)
//! are wired so that each TX kring of one side points at the matching RX
//! kring of the other. The data plane then moves packets by swapping slot
//! descriptors between the two rings: the transmitted buffer migrates to
//! the receiver, and a free buffer of the receiver returns to the sender.
//! No payload byte is ever copied.
//!
//! # Memory ordering
//!
//! [`txsync`] publishes its work with three fences:
//!
//! 1. before reading the peer's `nr_hwcur`, so the latest slot releases
//!    are visible;
//! 2. after writing the slot array and before advancing the peer's
//!    `nr_hwtail`, so the peer never observes the new tail ahead of the
//!    slot contents;
//! 3. after writing `nr_hwtail`, before the sender reclaims its own tail.
//!
//! [`rxsync`] issues one fence before publishing `nr_hwcur`. The index
//! fields themselves are release-stored and acquire-loaded. No lock is
//! taken on this path.
//!
//! Control-plane entry points ([`register`], [`krings_create`],
//! [`krings_delete`]) assume the caller serializes registration, as the
//! netmap lock does in the kernel.

use crate::adapter::{Adapter, Dir, Kring, NKR_NETMAP_OFF, NKR_NETMAP_ON};
use crate::error::{Error, Result};
use std::ptr;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

#[inline]
fn nm_next(i: u32, lim: u32) -> u32 {
    if i == lim {
        0
    } else {
        i + 1
    }
}

#[inline]
fn nm_prev(i: u32, lim: u32) -> u32 {
    if i == 0 {
        lim
    } else {
        i - 1
    }
}

/// True if any kring of `na` is still claimed by the peer through
/// NEEDRING.
pub fn krings_needed(na: &Adapter) -> bool {
    if !na.has_krings() {
        return false;
    }
    Dir::ALL
        .into_iter()
        .any(|t| na.krings_of(t).iter().any(|k| k.needring()))
}

/// Create the krings of both endpoints and cross-link them.
///
/// TX kring `i` of each side is linked to RX kring `i` of the other. The
/// cross-link is idempotent; host krings stay unlinked. A failure on the
/// peer side rolls back the local krings.
pub fn krings_create(na: &Arc<Adapter>) -> Result<()> {
    let peer = na.peer().ok_or_else(|| {
        tracing::warn!(adapter = %na.name(), "peer not found");
        Error::PeerNotFound
    })?;

    na.krings_create()?;
    if let Err(e) = peer.krings_create() {
        na.krings_delete();
        return Err(e);
    }

    for t in Dir::ALL {
        let r = t.swap();
        for i in 0..na.nrings(t) {
            let (Some(mine), Some(theirs)) = (na.kring(t, i), peer.kring(r, i)) else {
                continue;
            };
            mine.set_pipe(&theirs);
            theirs.set_pipe(&mine);
        }
    }

    tracing::debug!(adapter = %na.name(), peer = %peer.name(), "cross-linked krings");
    Ok(())
}

/// Delete the krings of both endpoints, unless the peer still needs any
/// ring of `na`.
pub fn krings_delete(na: &Arc<Adapter>) {
    if krings_needed(na) {
        tracing::debug!(adapter = %na.name(), "krings still needed by the peer");
        return;
    }

    match na.peer() {
        Some(peer) => {
            na.krings_delete();
            peer.krings_delete();
        }
        None => {
            tracing::warn!(adapter = %na.name(), "peer not found");
            na.krings_delete();
        }
    }
}

/// Switch the adapter's krings in or out of netmap mode.
///
/// Switching on marks every peer ring backing a pending-on kring as
/// needed, creates the missing peer rings, then flips the pending krings
/// on. Switching off flips them off, withdraws the NEEDRING claims, and
/// lets the peer release whatever nobody references anymore. Both
/// directions are idempotent: a second identical call finds no pending
/// kring and changes nothing.
pub fn register(na: &Arc<Adapter>, onoff: bool) -> Result<()> {
    let peer = na.peer().ok_or(Error::PeerNotFound)?;

    if onoff {
        for t in Dir::ALL {
            for kring in na.krings_of(t) {
                if kring.pending_on() {
                    // Mark the partner ring as needed.
                    if let Some(pipe) = kring.pipe() {
                        pipe.set_needring();
                    }
                }
            }
        }

        // Create all missing needed rings on the other end.
        peer.mem().rings_create(&peer)?;

        for t in Dir::ALL {
            for kring in na.krings_of(t) {
                if kring.pending_on() {
                    kring.set_mode(NKR_NETMAP_ON);
                }
            }
        }
        na.set_native(true);
        tracing::debug!(adapter = %na.name(), "registered");
    } else {
        na.set_native(false);

        for t in Dir::ALL {
            for kring in na.krings_of(t) {
                if kring.pending_off() {
                    kring.set_mode(NKR_NETMAP_OFF);
                    // The peer ring is no longer needed by us; it may
                    // still be kept if somebody else is using it.
                    if let Some(pipe) = kring.pipe() {
                        pipe.clear_needring();
                    }
                }
            }
        }
        peer.mem().rings_delete(&peer);
        tracing::debug!(adapter = %na.name(), "unregistered");
    }

    Ok(())
}

/// Reconcile the kernel and user view of a TX kring by swapping slots
/// into the peer's RX ring.
///
/// Walks from `nr_hwcur` to the user head, bounded by the space the peer
/// has released, exchanging whole slot descriptors. Returns without work
/// when the carrier is down or the endpoint is not wired.
pub fn txsync(txkring: &Kring) {
    let Some(na) = txkring.adapter() else {
        return;
    };
    if !na.carrier_ok() {
        return;
    }
    let Some(rxkring) = txkring.pipe() else {
        return;
    };
    let (Some(txring), Some(rxring)) = (txkring.ring(), rxkring.ring()) else {
        return;
    };

    let lim = txkring.num_slots() - 1;
    let lim_peer = rxkring.num_slots() - 1;
    let head = txkring.rhead();

    let mut nm_i = txkring.hwcur_atomic().load(Ordering::Relaxed);
    let mut nm_j = rxkring.hwtail_atomic().load(Ordering::Relaxed);

    fence(Ordering::SeqCst); // for reading the peer's nr_hwcur
    let peer_hwtail_lim = nm_prev(rxkring.hwcur_atomic().load(Ordering::Acquire), lim_peer);

    if nm_i == head {
        return;
    }

    let mut n = 0u32;
    while nm_i != head && nm_j != peer_hwtail_lim {
        // SAFETY: both indices stay below their ring's slot count, and
        // the two slots belong to distinct rings.
        unsafe {
            ptr::swap(txring.slot_ptr(nm_i), rxring.slot_ptr(nm_j));
        }
        nm_i = nm_next(nm_i, lim);
        nm_j = nm_next(nm_j, lim_peer);
        n += 1;
    }
    txkring.hwcur_atomic().store(nm_i, Ordering::Release);

    fence(Ordering::SeqCst); // for writing the slots

    rxkring.hwtail_atomic().store(nm_j, Ordering::Release);

    fence(Ordering::SeqCst); // for writing the peer's nr_hwtail

    // Reclaim buffers for completed transmissions.
    let mut hwtail = txkring.hwtail_atomic().load(Ordering::Relaxed) + n;
    if hwtail > lim {
        hwtail -= lim + 1;
    }
    txkring.hwtail_atomic().store(hwtail, Ordering::Release);

    rxkring.notify();
}

/// Reconcile the kernel and user view of an RX kring.
///
/// Imports are performed by the peer's [`txsync`]; this side only skips
/// past the slots userspace has released and wakes the peer transmitter
/// when it did.
pub fn rxsync(rxkring: &Kring) {
    let head = rxkring.rhead();
    let old_hwcur = rxkring.hwcur_atomic().load(Ordering::Relaxed);

    fence(Ordering::SeqCst);

    rxkring.hwcur_atomic().store(head, Ordering::Release);

    if old_hwcur != head {
        fence(Ordering::SeqCst); // for writing nr_hwcur
        if let Some(txkring) = rxkring.pipe() {
            txkring.notify();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_walk_wraps() {
        assert_eq!(nm_next(0, 63), 1);
        assert_eq!(nm_next(63, 63), 0);
        assert_eq!(nm_prev(1, 63), 0);
        assert_eq!(nm_prev(0, 63), 63);
    }
}
