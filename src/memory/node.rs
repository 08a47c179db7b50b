//! Intrusive node header carried at offset 0 of every pooled object.

use crate::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::fmt;
use std::ptr::NonNull;

/// Packed reference word stored in [`FreelistNode::refs`].
///
/// Bit layout of the `u32`:
/// ```text
///   [31]     ON_LIST   "should be on the list": set by push, consumed by the
///                      thread that ends up linking the node
///   [30..0]  count     1 for the list's own link while linked,
///                      +1 per pop that has claimed the node as head
/// ```
///
/// Legal transitions:
/// ```text
///   caller holds node         0
///   push                      0       -> ON_LIST            (pusher links)
///                             k       -> ON_LIST | k        (k readers: link deferred)
///   link attempt              ON_LIST -> 1, CAS head
///   link CAS lost             1 + r   -> ON_LIST | r        (retry only if r == 0)
///   pop claim                 n       -> n + 1              (only if count(n) != 0)
///   pop won                   n       -> n - 2
///   pop lost                  n       -> n - 1              (ON_LIST | 1 -> ON_LIST: relink)
/// ```
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct RefsWord(pub(crate) u32);

impl RefsWord {
    pub(crate) const ON_LIST: u32 = 0x8000_0000;
    pub(crate) const COUNT_MASK: u32 = 0x7FFF_FFFF;

    /// Node is held by exactly one caller and reachable from no list.
    pub(crate) const UNLINKED: Self = Self(0);
    /// Node is linked, nobody is mid-pop on it.
    pub(crate) const LINKED: Self = Self(1);
    /// Push happened while readers were out; the last reader links.
    pub(crate) const PENDING_LINK: Self = Self(Self::ON_LIST);

    #[inline]
    pub(crate) fn on_list(self) -> bool {
        self.0 & Self::ON_LIST != 0
    }

    #[inline]
    pub(crate) fn count(self) -> u32 {
        self.0 & Self::COUNT_MASK
    }

    /// A pop may claim this node only while something still references it.
    /// Saturation is unreachable in practice (2^31 concurrent claimers).
    #[inline]
    pub(crate) fn claimable(self) -> bool {
        let count = self.count();
        count != 0 && count != Self::COUNT_MASK
    }
}

impl fmt::Debug for RefsWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RefsWord(on_list={}, count={})", self.on_list(), self.count())
    }
}

/// Header of every object managed by a [`Freelist`](crate::Freelist).
///
/// The header must sit at offset 0 of the object. Pre-allocated and
/// `populate`d objects get it written by the pool; objects handed to
/// `add_scattered` embed it themselves, typically as the first field of a
/// `#[repr(C)]` struct:
///
/// ```
/// use shard_freelist::FreelistNode;
///
/// #[repr(C)]
/// struct Request {
///     node: FreelistNode,
///     id: u64,
/// }
///
/// let req = Request { node: FreelistNode::new(), id: 7 };
/// assert_eq!(std::mem::offset_of!(Request, node), 0);
/// # drop(req);
/// ```
///
/// The header belongs to the pool for the node's whole life. Callers holding
/// a popped node may write the payload, never the header: a concurrent pop on
/// another thread can still be reading it.
#[repr(C)]
pub struct FreelistNode {
    next: AtomicPtr<FreelistNode>,
    refs: AtomicU32,
}

impl FreelistNode {
    /// Bytes occupied by the header; the payload starts right after.
    pub const HEADER_SIZE: usize = std::mem::size_of::<Self>();

    /// Minimum alignment of any pooled object.
    pub const ALIGN: usize = std::mem::align_of::<Self>();

    #[cfg(not(loom))]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicPtr::new(std::ptr::null_mut()),
            refs: AtomicU32::new(0),
        }
    }

    #[cfg(loom)]
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: AtomicPtr::new(std::ptr::null_mut()),
            refs: AtomicU32::new(0),
        }
    }

    /// Start of the payload that follows the header.
    ///
    /// Only computes the address. It is dereferenceable only if the object
    /// behind `node` really extends past its header (for pool objects,
    /// `payload_len()` bytes).
    #[inline]
    #[must_use]
    pub fn payload(node: NonNull<Self>) -> NonNull<u8> {
        node.cast::<u8>()
            .map_addr(|addr| addr.saturating_add(Self::HEADER_SIZE))
    }

    /// True when this header is currently held outside any shard list.
    ///
    /// Only meaningful to the thread that owns the node; a linked node's
    /// word changes under concurrent pops.
    #[must_use]
    pub fn is_unlinked(&self) -> bool {
        self.load_refs(Ordering::Acquire) == RefsWord::UNLINKED
    }

    #[inline]
    pub(crate) fn load_refs(&self, ordering: Ordering) -> RefsWord {
        RefsWord(self.refs.load(ordering))
    }

    #[inline]
    pub(crate) fn store_refs(&self, refs: RefsWord, ordering: Ordering) {
        self.refs.store(refs.0, ordering);
    }

    /// Atomic add returning the previous word. `delta` wraps, so adding
    /// `ON_LIST - 1` drops the list link and raises the flag in one step.
    #[inline]
    pub(crate) fn fetch_add_refs(&self, delta: u32, ordering: Ordering) -> RefsWord {
        RefsWord(self.refs.fetch_add(delta, ordering))
    }

    #[inline]
    pub(crate) fn fetch_sub_refs(&self, delta: u32, ordering: Ordering) -> RefsWord {
        RefsWord(self.refs.fetch_sub(delta, ordering))
    }

    /// Claim `current -> current + 1`. Fails if the word moved.
    #[inline]
    pub(crate) fn try_claim(&self, current: RefsWord) -> bool {
        self.refs
            .compare_exchange(current.0, current.0 + 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    pub(crate) fn next(&self) -> *mut FreelistNode {
        self.next.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_next(&self, next: *mut FreelistNode) {
        self.next.store(next, Ordering::Relaxed);
    }
}

impl Default for FreelistNode {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FreelistNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreelistNode")
            .field("next", &self.next())
            .field("refs", &self.load_refs(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_refs_word_layout() {
        assert!(!RefsWord::UNLINKED.on_list());
        assert_eq!(RefsWord::UNLINKED.count(), 0);
        assert!(!RefsWord::UNLINKED.claimable());

        assert!(!RefsWord::LINKED.on_list());
        assert_eq!(RefsWord::LINKED.count(), 1);
        assert!(RefsWord::LINKED.claimable());

        assert!(RefsWord::PENDING_LINK.on_list());
        assert_eq!(RefsWord::PENDING_LINK.count(), 0);
        assert!(!RefsWord::PENDING_LINK.claimable());

        let saturated = RefsWord(RefsWord::COUNT_MASK);
        assert!(!saturated.claimable());
    }

    #[test]
    fn test_refs_lost_link_transition_wraps() {
        // 1 + r -> ON_LIST | r: the wrapping add drops the list link and
        // raises the flag in a single RMW.
        let node = FreelistNode::new();
        node.store_refs(RefsWord(3), Ordering::Relaxed);
        let prev = node.fetch_add_refs(RefsWord::ON_LIST - 1, Ordering::Relaxed);
        assert_eq!(prev, RefsWord(3));
        let now = node.load_refs(Ordering::Relaxed);
        assert!(now.on_list());
        assert_eq!(now.count(), 2);
    }

    #[test]
    fn test_try_claim() {
        let node = FreelistNode::new();
        node.store_refs(RefsWord::LINKED, Ordering::Relaxed);
        assert!(node.try_claim(RefsWord::LINKED));
        assert_eq!(node.load_refs(Ordering::Relaxed).count(), 2);
        // Stale expectation fails.
        assert!(!node.try_claim(RefsWord::LINKED));
    }

    #[test]
    fn test_new_node_is_unlinked() {
        let node = FreelistNode::default();
        assert!(node.is_unlinked());
        assert!(node.next().is_null());
    }

    #[test]
    fn test_payload_follows_header() {
        let mut storage = [0usize; 4];
        let node = NonNull::new(storage.as_mut_ptr().cast::<FreelistNode>()).unwrap();
        let payload = FreelistNode::payload(node);
        assert_eq!(
            payload.as_ptr() as usize - node.as_ptr() as usize,
            FreelistNode::HEADER_SIZE
        );
    }

    #[test]
    fn test_payload_of_bare_header_is_address_only() {
        // No payload behind these pointers: computing the address must still
        // be fine as long as nothing is dereferenced.
        let dangling = NonNull::<FreelistNode>::dangling();
        let payload = FreelistNode::payload(dangling);
        assert_eq!(
            payload.as_ptr() as usize,
            dangling.as_ptr() as usize + FreelistNode::HEADER_SIZE
        );

        let bare = FreelistNode::new();
        let node = NonNull::from(&bare);
        let payload = FreelistNode::payload(node);
        assert_eq!(
            payload.as_ptr() as usize - node.as_ptr() as usize,
            FreelistNode::HEADER_SIZE
        );
    }

    #[test]
    fn test_header_alignment_is_pointer_alignment() {
        assert_eq!(FreelistNode::ALIGN, std::mem::align_of::<usize>());
        assert!(FreelistNode::HEADER_SIZE.is_multiple_of(FreelistNode::ALIGN));
    }
}
