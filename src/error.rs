//! Error types for the netmap memory core.

use thiserror::Error;

/// Result type alias using this crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for allocator and ring-fabric operations.
///
/// The enum is `Clone` because memory domains cache the error of the last
/// configure/finalize attempt and replay it to later callers.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Requested pool sizes or counts are out of range, or no cluster
    /// geometry exists for the requested object size.
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// Allocation failed: cluster, lookup table, bitmap, object, or id space.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// The adapter's IOMMU group does not match the group already adopted
    /// by the memory domain.
    #[error("iommu group mismatch: domain has {domain}, device has {device}")]
    GroupMismatch {
        /// Group id currently adopted by the domain.
        domain: i32,
        /// Group id of the device that tried to attach.
        device: i32,
    },

    /// The peer adapter vanished or was never linked.
    #[error("peer adapter not found")]
    PeerNotFound,

    /// A query that requires finalized pools was issued before finalize.
    #[error("memory domain not finalized")]
    NotFinalized,

    /// An object index was freed twice.
    #[error("double free of object {0}")]
    DoubleFree(u32),

    /// Free of a reserved index (0, 1) or an index past the pool.
    #[error("invalid object index {0}")]
    BadIndex(u32),

    /// An offset that falls outside every pool region.
    #[error("offset {0:#x} outside all pools")]
    BadOffset(u64),

    /// Configuration change attempted while the domain has active users.
    #[error("memory domain busy: configuration is locked while in use")]
    Busy,

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
