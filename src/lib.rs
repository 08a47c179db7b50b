//! Lock-free, sharded freelist of fixed-size objects.
//!
//! Objects are kept on one lock-free stack per shard (by default one shard
//! per possible CPU). `push` goes to the caller's shard; `pop` starts there
//! and steals from the others when it is empty. Neither call blocks or
//! allocates, so both are usable where locks are not (signal handlers,
//! tracing hooks, allocator internals).
//!
//! Each object starts with a [`FreelistNode`] header that carries the
//! list link and a reference word used to make `pop` safe against ABA
//! without double-width CAS.

pub(crate) mod sync;

// public module: implementation details hidden via pub(crate), plus
// stats and TEST_MUTEX (public for tests)
pub mod memory;

// pool
pub use memory::freelist::{
    CallbackError, Freelist, FreelistConfig, FreelistError, Lease, Origin, Released,
};
pub use memory::node::FreelistNode;

// storage
pub use memory::backing::{
    Backing, BackingError, BackingKind, BackingOps, SystemBacking, SystemBackingConfig, page_size,
};

// shard selection
pub use memory::selector::{
    CpuShardSelector, FixedShardSelector, ShardSelector, ThreadShardSelector, possible_cpus,
};

// stats
pub use memory::stats::{FreelistStats, snapshot as stats_snapshot};
