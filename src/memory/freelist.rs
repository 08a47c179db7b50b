use super::backing::{Backing, BackingError, BackingKind, BackingOps, SystemBacking};
use super::node::FreelistNode;
use super::selector::{CpuShardSelector, ShardSelector, possible_cpus};
use super::shard::Shard;
use super::stats;
#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;
use std::alloc::Layout;
use std::convert::Infallible;
use std::fmt;
use std::ptr::NonNull;
use thiserror::Error;

/// Error returned by an object init callback, carried through unchanged.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum FreelistError {
    #[error("shard {shard}: backing allocation of {size} bytes failed")]
    OutOfMemory {
        shard: usize,
        size: usize,
        #[source]
        source: BackingError,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("buffer holds no whole object")]
    Empty,
    #[error("object init callback failed: {0}")]
    Callback(#[source] CallbackError),
}

/// Sizing of a [`Freelist`]. Fixed at init.
#[derive(Clone, Debug)]
pub struct FreelistConfig {
    /// Objects to pre-allocate, spread over the shards (remainder to the
    /// lowest shards). Default: 0.
    pub total_objects: usize,

    /// Bytes per object, header included. 0 means nothing is pre-allocated
    /// and objects arrive later via `populate` / `add_scattered`.
    /// Rounded up to `object_align` and to at least the header size.
    /// Default: 0.
    pub object_size: usize,

    /// Alignment of every pre-allocated object. Power of two; values below
    /// the header's alignment are raised to it. Default: pointer alignment.
    pub object_align: usize,

    /// Number of shards. 0 = one per possible CPU. Default: 0.
    pub shard_count: usize,
}

impl Default for FreelistConfig {
    fn default() -> Self {
        Self {
            total_objects: 0,
            object_size: 0,
            object_align: FreelistNode::ALIGN,
            shard_count: 0,
        }
    }
}

impl FreelistConfig {
    /// `objects_per_cpu` objects for every possible CPU, one shard each.
    #[must_use]
    pub fn per_cpu(objects_per_cpu: usize, object_size: usize) -> Self {
        Self {
            total_objects: objects_per_cpu.saturating_mul(possible_cpus()),
            object_size,
            ..Self::default()
        }
    }

    /// Everything in a single shard (no stealing, one contention point).
    #[must_use]
    pub fn single_shard(total_objects: usize, object_size: usize) -> Self {
        Self {
            total_objects,
            object_size,
            shard_count: 1,
            ..Self::default()
        }
    }

    fn resolved_shard_count(&self) -> usize {
        if self.shard_count == 0 {
            possible_cpus()
        } else {
            self.shard_count
        }
    }

    fn resolved_align(&self) -> Result<usize, FreelistError> {
        if !self.object_align.is_power_of_two() {
            return Err(FreelistError::InvalidArgument(
                "object alignment is not a power of two",
            ));
        }
        Ok(self.object_align.max(FreelistNode::ALIGN))
    }

    /// Element stride, or 0 when nothing is pre-allocated.
    fn stride(&self, align: usize) -> Result<usize, FreelistError> {
        if self.object_size == 0 {
            return Ok(0);
        }
        self.object_size
            .max(FreelistNode::HEADER_SIZE)
            .checked_next_multiple_of(align)
            .ok_or(FreelistError::InvalidArgument("object size overflows usize"))
    }
}

/// Where a node's memory came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    /// Carved out of the pool's own per-shard storage by `init`.
    Preallocated,
    /// Sliced out of the buffer handed to `populate`.
    Buffer,
    /// Handed in individually through `add_scattered`.
    Scattered,
}

/// One item reported to the `finalize` release callback.
#[derive(Debug)]
pub enum Released {
    /// A node drained from a shard.
    Object {
        node: NonNull<FreelistNode>,
        origin: Origin,
    },
    /// The buffer attached by `populate`, reported once after all objects.
    Buffer { ptr: NonNull<u8>, len: usize },
}

impl Released {
    /// True when the caller owns a separate allocation for this item and
    /// may free it: scattered objects and the populate buffer. Objects
    /// sliced from that buffer are not separately owned.
    #[must_use]
    pub fn is_user_owned(&self) -> bool {
        match self {
            Self::Object { origin, .. } => *origin == Origin::Scattered,
            Self::Buffer { .. } => true,
        }
    }

    /// True for individual objects, false for the whole populate buffer.
    #[must_use]
    pub fn is_element(&self) -> bool {
        matches!(self, Self::Object { .. })
    }
}

#[derive(Clone, Copy, Debug)]
struct UserBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

impl UserBuffer {
    fn contains(&self, addr: usize) -> bool {
        let base = self.ptr.as_ptr() as usize;
        addr >= base && addr < base + self.len
    }
}

fn no_init(_node: NonNull<FreelistNode>) -> Result<(), Infallible> {
    Ok(())
}

/// Lock-free, sharded pool of fixed-size objects.
///
/// `push` and `pop` take `&self` and may be called from any thread, including
/// signal handlers and other contexts that cannot block. Setup (`populate`,
/// `add_scattered`) takes `&mut self`, so it cannot overlap with them.
///
/// Memory is never returned piecemeal: objects stay valid until the pool is
/// finalized or dropped.
///
/// ```
/// use shard_freelist::{Freelist, FreelistNode};
///
/// # fn main() -> Result<(), shard_freelist::FreelistError> {
/// let pool = Freelist::new(64, 64)?;
///
/// let node = pool.pop().expect("pool has objects");
/// let payload = FreelistNode::payload(node);
/// // Safety: pool objects carry payload_len() bytes after the header, and we hold this one.
/// unsafe { payload.as_ptr().write_bytes(0x42, pool.payload_len()) };
///
/// // Safety: node came from this pool and is held by us.
/// unsafe { pool.push(node) };
///
/// let mut drained = 0;
/// pool.finalize(|_| drained += 1);
/// assert_eq!(drained, 64);
/// # Ok(())
/// # }
/// ```
pub struct Freelist<B: BackingOps = SystemBacking, S: ShardSelector = CpuShardSelector> {
    shards: Box<[Shard]>,
    /// Pool-owned storage, indexed by shard. `None` if the shard got no
    /// pre-allocated objects.
    regions: Vec<Option<Backing>>,
    /// Element stride in bytes; 0 until fixed by `init` or `populate`.
    object_size: usize,
    object_align: usize,
    /// Objects ever inserted (init + populate + add_scattered).
    object_count: usize,
    buffer: Option<UserBuffer>,
    backing: B,
    selector: S,
}

// Safety: the pool owns its storage; nodes are only reached through the
// atomic shard protocol. The backing is only used from `&mut self` / Drop.
unsafe impl<B: BackingOps + Send, S: ShardSelector> Send for Freelist<B, S> {}
// Safety: `&self` methods touch only shard heads, node headers (atomics) and
// the selector (Sync by trait bound).
unsafe impl<B: BackingOps + Sync, S: ShardSelector> Sync for Freelist<B, S> {}

impl Freelist {
    /// Pool of `total_objects` zeroed objects of `object_size` bytes, one
    /// shard per possible CPU.
    ///
    /// # Errors
    ///
    /// Returns `FreelistError::OutOfMemory` if shard storage cannot be
    /// allocated.
    pub fn new(total_objects: usize, object_size: usize) -> Result<Self, FreelistError> {
        Self::with_config(FreelistConfig {
            total_objects,
            object_size,
            ..FreelistConfig::default()
        })
    }

    /// # Errors
    ///
    /// Returns `FreelistError::OutOfMemory` if shard storage cannot be
    /// allocated, `FreelistError::InvalidArgument` for a malformed config.
    pub fn with_config(config: FreelistConfig) -> Result<Self, FreelistError> {
        Self::init(config, SystemBacking::new(), CpuShardSelector, no_init)
    }
}

impl<B: BackingOps, S: ShardSelector> Freelist<B, S> {
    /// Build the pool: one backing allocation per shard holding its share of
    /// `config.total_objects`, zeroed, each object passed to `init` and then
    /// linked into its shard.
    ///
    /// On failure everything allocated so far is released before returning.
    ///
    /// # Errors
    ///
    /// - `FreelistError::OutOfMemory` if a shard allocation fails.
    /// - `FreelistError::Callback` with the callback's own error.
    /// - `FreelistError::InvalidArgument` for a malformed config.
    pub fn init<F, E>(
        config: FreelistConfig,
        backing: B,
        selector: S,
        mut init: F,
    ) -> Result<Self, FreelistError>
    where
        F: FnMut(NonNull<FreelistNode>) -> Result<(), E>,
        E: Into<CallbackError>,
    {
        let shard_count = config.resolved_shard_count();
        let object_align = config.resolved_align()?;
        let stride = config.stride(object_align)?;

        stats::LIVE_FREELISTS.add(1);
        // From here on Drop unwinds whatever has been built.
        let mut pool = Self {
            shards: (0..shard_count).map(|_| Shard::new()).collect(),
            regions: (0..shard_count).map(|_| None).collect(),
            object_size: stride,
            object_align,
            object_count: 0,
            buffer: None,
            backing,
            selector,
        };

        if stride != 0 {
            let per_shard = config.total_objects / shard_count;
            let remainder = config.total_objects % shard_count;
            for shard in 0..shard_count {
                let count = per_shard + usize::from(shard < remainder);
                if count == 0 {
                    continue;
                }
                if let Err(e) = pool.fill_shard(shard, count, &mut init) {
                    tracing::warn!(shard, error = %e, "freelist init failed, releasing shard storage");
                    return Err(e);
                }
            }
        }

        tracing::debug!(
            shards = shard_count,
            objects = pool.object_count,
            stride,
            align = object_align,
            "freelist initialised"
        );
        Ok(pool)
    }

    fn fill_shard<F, E>(
        &mut self,
        shard: usize,
        count: usize,
        init: &mut F,
    ) -> Result<(), FreelistError>
    where
        F: FnMut(NonNull<FreelistNode>) -> Result<(), E>,
        E: Into<CallbackError>,
    {
        let stride = self.object_size;
        let size = stride
            .checked_mul(count)
            .ok_or(FreelistError::InvalidArgument("shard storage size overflows usize"))?;
        let layout = Layout::from_size_align(size, self.object_align)
            .map_err(|_| FreelistError::InvalidArgument("shard storage layout is invalid"))?;

        let region = self
            .backing
            .allocate(layout, shard)
            .map_err(|source| FreelistError::OutOfMemory { shard, size, source })?;
        let base = region.as_ptr();
        debug_assert!(region.size() >= size);
        debug_assert!((base.as_ptr() as usize).is_multiple_of(self.object_align));

        // Safety: region is valid for `size` bytes.
        unsafe { base.as_ptr().write_bytes(0, size) };
        stats::BACKING_BYTES.add(region.size());
        if region.kind() == BackingKind::Mapped {
            stats::MAPPED_BYTES.add(region.size());
        }
        self.regions[shard] = Some(region);

        for i in 0..count {
            // Safety: i * stride + stride <= size, and stride is a multiple of
            // object_align >= FreelistNode::ALIGN.
            let node = unsafe { base.add(i * stride) }.cast::<FreelistNode>();
            // Safety: in bounds and aligned (see above); nothing else sees it yet.
            unsafe { node.as_ptr().write(FreelistNode::new()) };
            init(node).map_err(|e| FreelistError::Callback(e.into()))?;
            // Safety: node lives in pool storage and is on no shard yet.
            unsafe { self.shards[shard].insert_exclusive(node) };
            self.object_count += 1;
        }
        Ok(())
    }

    /// Add one externally owned node during setup. Shards are filled
    /// round-robin by insertion count so they stay balanced.
    ///
    /// # Safety
    /// - `node` must point to an initialised [`FreelistNode`] (e.g. from
    ///   [`FreelistNode::new`]) at offset 0 of an object of the pool's object
    ///   size.
    /// - The object must stay valid until `finalize` reports it (or the pool
    ///   is dropped), and must not already be in this or any other pool.
    pub unsafe fn add_scattered(&mut self, node: NonNull<FreelistNode>) {
        let shard = self.object_count % self.shards.len();
        // Safety: upheld by caller; &mut self excludes concurrent access.
        unsafe { self.shards[shard].insert_exclusive(node) };
        self.object_count += 1;
    }

    /// Slice `buffer` into `object_size` elements, pass each to `init`, and
    /// scatter them over the shards. Only one buffer may be attached per pool.
    ///
    /// All elements are initialised before any is scattered, so on error the
    /// pool is unchanged and the buffer is not attached.
    ///
    /// # Errors
    ///
    /// - `FreelistError::InvalidArgument` if a buffer is already attached,
    ///   `object_size` is zero, smaller than the node header or differs from
    ///   the pool's fixed size, the buffer or `object_size` is not pointer
    ///   aligned, or `size < object_size`.
    /// - `FreelistError::Empty` if no whole element fits.
    /// - `FreelistError::Callback` with the callback's own error.
    ///
    /// # Safety
    /// `buffer` must be valid for reads and writes of `size` bytes until
    /// `finalize` reports it (or the pool is dropped), and not aliased by
    /// anything else meanwhile.
    pub unsafe fn populate<F, E>(
        &mut self,
        buffer: NonNull<u8>,
        size: usize,
        object_size: usize,
        mut init: F,
    ) -> Result<(), FreelistError>
    where
        F: FnMut(NonNull<FreelistNode>) -> Result<(), E>,
        E: Into<CallbackError>,
    {
        if self.buffer.is_some() {
            return Err(FreelistError::InvalidArgument("a buffer is already attached"));
        }
        if object_size == 0 {
            return Err(FreelistError::InvalidArgument("object size is zero"));
        }
        if self.object_size != 0 && self.object_size != object_size {
            return Err(FreelistError::InvalidArgument(
                "object size differs from the pool's object size",
            ));
        }
        if !(buffer.as_ptr() as usize).is_multiple_of(FreelistNode::ALIGN)
            || !object_size.is_multiple_of(FreelistNode::ALIGN)
        {
            return Err(FreelistError::InvalidArgument(
                "buffer or object size is not pointer aligned",
            ));
        }
        if object_size < FreelistNode::HEADER_SIZE {
            return Err(FreelistError::InvalidArgument(
                "object size is smaller than the node header",
            ));
        }
        if size < object_size {
            return Err(FreelistError::InvalidArgument(
                "buffer is smaller than one object",
            ));
        }

        let count = size / object_size;
        // Unreachable after the size check above; guards the division only.
        if count == 0 {
            return Err(FreelistError::Empty);
        }

        let element = |i: usize| {
            // Safety: i < count, so the element lies within the buffer.
            unsafe { buffer.add(i * object_size) }.cast::<FreelistNode>()
        };

        for i in 0..count {
            let node = element(i);
            // Safety: in bounds and pointer aligned; caller grants exclusive access.
            unsafe { node.as_ptr().write(FreelistNode::new()) };
            init(node).map_err(|e| FreelistError::Callback(e.into()))?;
        }
        for i in 0..count {
            // Safety: initialised above; buffer outlives the pool per contract.
            unsafe { self.add_scattered(element(i)) };
        }

        self.buffer = Some(UserBuffer { ptr: buffer, len: size });
        self.object_size = object_size;

        tracing::debug!(
            bytes = size,
            object_size,
            objects = count,
            "freelist buffer attached"
        );
        Ok(())
    }

    /// Return `node` to the caller's local shard. Never fails or blocks.
    ///
    /// # Safety
    /// `node` must belong to this pool (pre-allocated, populated or
    /// scattered) and be held exclusively by the caller: popped and not yet
    /// pushed back.
    #[inline]
    pub unsafe fn push(&self, node: NonNull<FreelistNode>) {
        let shard = self.selector.current_shard(self.shards.len());
        // Safety: upheld by caller.
        unsafe { self.shards[shard].push(node) };
    }

    /// Take an object, starting at the caller's local shard and stealing
    /// round-robin from the others. `None` only if every shard was empty
    /// when visited.
    #[inline]
    #[must_use]
    pub fn pop(&self) -> Option<NonNull<FreelistNode>> {
        let count = self.shards.len();
        let start = self.selector.current_shard(count);
        (0..count).find_map(|i| {
            let mut idx = start + i;
            if idx >= count {
                idx -= count;
            }
            self.shards[idx].pop()
        })
    }

    /// [`pop`](Self::pop) wrapped in a guard that pushes the object back on drop.
    #[must_use]
    pub fn lease(&self) -> Option<Lease<'_, B, S>> {
        self.pop().map(|node| Lease { pool: self, node })
    }

    /// Whether `obj` lies inside the buffer attached by `populate`.
    #[must_use]
    pub fn is_in_pool_buffer<T>(&self, obj: *const T) -> bool {
        !obj.is_null()
            && self
                .buffer
                .is_some_and(|buffer| buffer.contains(obj as usize))
    }

    /// Whether `obj` lies inside the pool's own pre-allocated storage.
    #[must_use]
    pub fn is_in_preallocated_storage<T>(&self, obj: *const T) -> bool {
        !obj.is_null()
            && self
                .regions
                .iter()
                .flatten()
                .any(|region| region.contains(obj as usize))
    }

    /// Classify a node of this pool by where its memory came from.
    #[must_use]
    pub fn origin_of(&self, node: NonNull<FreelistNode>) -> Origin {
        let ptr = node.as_ptr().cast_const();
        if self.is_in_pool_buffer(ptr) {
            Origin::Buffer
        } else if self.is_in_preallocated_storage(ptr) {
            Origin::Preallocated
        } else {
            Origin::Scattered
        }
    }

    /// Drain every shard, reporting each object and then the populate
    /// buffer (if any) to `release`, and free the pool's own storage.
    ///
    /// Objects still held by callers are not reported; their memory goes
    /// away with the storage they live in.
    pub fn finalize<F>(mut self, mut release: F)
    where
        F: FnMut(Released),
    {
        #[cfg(debug_assertions)]
        let mut drained = DrainMap::new(&self);
        let mut objects = 0usize;

        for shard in self.shards.iter().filter(|s| !s.is_empty()) {
            while let Some(node) = shard.pop() {
                #[cfg(debug_assertions)]
                drained.note(node);
                let origin = self.origin_of(node);
                release(Released::Object { node, origin });
                objects += 1;
            }
        }

        if let Some(buffer) = self.buffer.take() {
            release(Released::Buffer {
                ptr: buffer.ptr,
                len: buffer.len,
            });
        }

        let bytes = self.release_storage();
        tracing::debug!(objects, bytes, "freelist finalized");
    }

    /// Release all pool-owned regions. Returns the bytes released.
    fn release_storage(&mut self) -> usize {
        let mut bytes = 0;
        for region in self.regions.iter_mut().filter_map(Option::take) {
            bytes += region.size();
            stats::BACKING_BYTES.sub(region.size());
            if region.kind() == BackingKind::Mapped {
                stats::MAPPED_BYTES.sub(region.size());
            }
            // Safety: the region came from self.backing and is dropped from
            // the table, so nothing reaches it through the pool anymore.
            unsafe { self.backing.release(region) };
        }
        bytes
    }

    #[inline]
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Element stride in bytes, header included. 0 until fixed.
    #[inline]
    #[must_use]
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    /// Usable bytes after the header of each pool-sized object.
    #[inline]
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.object_size.saturating_sub(FreelistNode::HEADER_SIZE)
    }

    /// Objects ever inserted through init, `populate` and `add_scattered`.
    #[inline]
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.object_count
    }

    #[must_use]
    pub fn has_pool_buffer(&self) -> bool {
        self.buffer.is_some()
    }

    /// Size and kind of shard `shard`'s own storage, if it has any.
    #[must_use]
    pub fn shard_backing(&self, shard: usize) -> Option<(usize, BackingKind)> {
        self.regions
            .get(shard)?
            .as_ref()
            .map(|region| (region.size(), region.kind()))
    }
}

impl<B: BackingOps, S: ShardSelector> Drop for Freelist<B, S> {
    fn drop(&mut self) {
        let bytes = self.release_storage();
        if bytes != 0 {
            tracing::debug!(bytes, "freelist dropped without finalize");
        }
        stats::LIVE_FREELISTS.sub(1);
    }
}

impl<B: BackingOps, S: ShardSelector> fmt::Debug for Freelist<B, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Freelist")
            .field("shards", &self.shards.len())
            .field("object_size", &self.object_size)
            .field("object_count", &self.object_count)
            .field("buffer", &self.buffer)
            .finish_non_exhaustive()
    }
}

/// An object popped from a [`Freelist`], pushed back when dropped.
pub struct Lease<'a, B: BackingOps = SystemBacking, S: ShardSelector = CpuShardSelector> {
    pool: &'a Freelist<B, S>,
    node: NonNull<FreelistNode>,
}

impl<B: BackingOps, S: ShardSelector> Lease<'_, B, S> {
    #[inline]
    #[must_use]
    pub fn node(&self) -> NonNull<FreelistNode> {
        self.node
    }

    /// Start of the payload, writable for `pool.payload_len()` bytes while
    /// the lease is held.
    #[inline]
    #[must_use]
    pub fn payload(&self) -> NonNull<u8> {
        FreelistNode::payload(self.node)
    }

    /// Keep the object; the caller becomes responsible for pushing it back.
    #[must_use]
    pub fn into_raw(self) -> NonNull<FreelistNode> {
        let node = self.node;
        std::mem::forget(self);
        node
    }
}

impl<B: BackingOps, S: ShardSelector> Drop for Lease<'_, B, S> {
    fn drop(&mut self) {
        // Safety: popped from this pool by `lease` and held only by us.
        unsafe { self.pool.push(self.node) };
    }
}

/// Debug-build check that no node is drained twice at teardown, which
/// would mean a node was pushed while already on a list.
#[cfg(debug_assertions)]
struct DrainMap {
    stride: usize,
    // (base, len, seen) per shard region, plus the populate buffer.
    spans: Vec<(usize, usize, FixedBitSet)>,
}

#[cfg(debug_assertions)]
impl DrainMap {
    fn new<B: BackingOps, S: ShardSelector>(pool: &Freelist<B, S>) -> Self {
        let stride = pool.object_size.max(1);
        let mut spans: Vec<(usize, usize, FixedBitSet)> = pool
            .regions
            .iter()
            .flatten()
            .map(|r| {
                let base = r.as_ptr().as_ptr() as usize;
                (base, r.size(), FixedBitSet::with_capacity(r.size() / stride))
            })
            .collect();
        if let Some(buffer) = pool.buffer {
            spans.push((
                buffer.ptr.as_ptr() as usize,
                buffer.len,
                FixedBitSet::with_capacity(buffer.len / stride),
            ));
        }
        Self { stride, spans }
    }

    fn note(&mut self, node: NonNull<FreelistNode>) {
        let addr = node.as_ptr() as usize;
        let stride = self.stride;
        if let Some((base, _, seen)) = self
            .spans
            .iter_mut()
            .find(|(base, len, _)| addr >= *base && addr < *base + *len)
        {
            let idx = (addr - *base) / stride;
            assert!(
                idx < seen.len() && !seen.put(idx),
                "freelist corruption: node {node:p} drained twice",
            );
        }
    }
}
