//! # netmap-mem
//!
//! The netmap memory allocator and ring-fabric core: direct, zero-copy
//! access to packet buffers through a shared region of fixed-size
//! descriptor rings.
//!
//! A memory domain bundles three slab pools (interface blocks, rings,
//! packet buffers) whose cluster memory is exported to userspace as
//! one contiguous run of offsets. Adapters attach to a domain, have their
//! rings carved out of it, and, for pipe/veth endpoints, exchange packets
//! with their peer by swapping slot descriptors under explicit
//! memory-barrier discipline.
//!
//! ## Layers
//!
//! - [`abi`]: the bit-exact shared layout (`netmap_if`, `netmap_ring`,
//!   `netmap_slot`)
//! - [`mem`]: pools, domains (owning and passthrough), and the registry
//! - [`adapter`]: adapters and krings, the kernel-side ring descriptors
//! - [`pipe`]: the peer protocol (cross-link, register, txsync/rxsync)
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use netmap_mem::prelude::*;
//!
//! let registry = MemRegistry::new();
//! let mem = registry.create_private(&PrivateSpec {
//!     tx_rings: 1, tx_descs: 256,
//!     rx_rings: 1, rx_descs: 256,
//!     extra_bufs: 0, n_pipes: 0,
//! })?;
//!
//! let na = Adapter::new(AdapterConfig { /* ... */ });
//! mem.finalize(&na)?;            // allocate clusters, build bitmaps
//! na.krings_create()?;
//! mem.rings_create(&na)?;        // carve rings and buffers
//! let nifp = mem.if_new(&na, &RingSpan::all(&na))?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod abi;
pub mod adapter;
pub mod error;
pub mod mem;
pub mod pipe;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::abi::{NetmapIf, NetmapRing, NetmapSlot};
    pub use crate::adapter::{Adapter, AdapterConfig, Dir, Kring, RingSpan};
    pub use crate::error::{Error, Result};
    pub use crate::mem::{GlobalMem, MemAllocator, MemRegistry, PrivateSpec};
}

pub use error::{Error, Result};
