// ----------------------------------------------------------------------------
// Shard: one lock-free LIFO of FreelistNodes, ABA-safe via per-node refs
// ----------------------------------------------------------------------------
//
// A plain Treiber stack is ABA-prone: a pop reads `head`, then `head.next`,
// and by the time it CASes `head -> next` the node may have been popped,
// reused and pushed back with a different `next`. Here a pop first claims the
// head (refs + 1) before reading `next`. While any claim is outstanding a
// pushed-back node is not relinked by its pusher; the last claimer to let go
// links it instead. `next` therefore cannot change under a claimed reader.

use super::node::{FreelistNode, RefsWord};
use crate::sync::atomic::{AtomicPtr, Ordering};
use crate::sync::hint;
use std::ptr::NonNull;

/// A single shard: the head of one lock-free singly-linked stack.
#[repr(align(64))]
pub(crate) struct Shard {
    head: AtomicPtr<FreelistNode>,
}

impl Shard {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Setup-time link. `&mut self` guarantees nobody else is on this shard.
    ///
    /// # Safety
    /// `node` must point to a valid header that outlives the shard and is not
    /// already reachable from any shard.
    pub unsafe fn insert_exclusive(&mut self, node: NonNull<FreelistNode>) {
        // Safety: guaranteed valid by caller.
        let header = unsafe { node.as_ref() };
        header.store_refs(RefsWord::LINKED, Ordering::Release);
        header.set_next(self.head.load(Ordering::Relaxed));
        self.head.store(node.as_ptr(), Ordering::Release);
    }

    /// Return a node to this shard. Never fails, never blocks.
    ///
    /// # Safety
    /// `node` must be a valid header that outlives the shard and is held
    /// exclusively by the caller (popped and not yet pushed back).
    pub unsafe fn push(&self, node: NonNull<FreelistNode>) {
        // Safety: guaranteed valid by caller.
        let header = unsafe { node.as_ref() };

        // The flag is clear here (the caller owns the node), so a fetch_add
        // sets it without disturbing the count.
        let prev = header.fetch_add_refs(RefsWord::ON_LIST, Ordering::Release);
        if prev == RefsWord::UNLINKED {
            // No pop still holds a claim: linking is on us.
            // Safety: header valid, and the word is ON_LIST|0 which no pop can claim.
            unsafe { self.link(node) };
        }
        // Otherwise the last claimer to drop its reference sees ON_LIST|1
        // and links the node into *its* shard.
    }

    /// CAS the node in as the new head.
    ///
    /// Entered only while the word reads `ON_LIST | 0`: nobody can raise a
    /// zero count, so `next` is ours to write. Once the word is back at 1 a
    /// racing pop may claim the node, so a lost CAS hands the link over to
    /// whoever brings the count back to zero (which may be us again).
    ///
    /// # Safety
    /// `node` must be valid and its refs word must be `ON_LIST | 0`.
    unsafe fn link(&self, node: NonNull<FreelistNode>) {
        // Safety: guaranteed valid by caller.
        let header = unsafe { node.as_ref() };
        let mut head = self.head.load(Ordering::Relaxed);

        loop {
            debug_assert_eq!(header.load_refs(Ordering::Relaxed), RefsWord::PENDING_LINK);
            header.set_next(head);
            header.store_refs(RefsWord::LINKED, Ordering::Release);

            match self.head.compare_exchange(
                head,
                node.as_ptr(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => head = current,
            }

            // Lost the CAS: drop the list's link and raise the flag in one step.
            let prev = header.fetch_add_refs(RefsWord::ON_LIST - 1, Ordering::Release);
            if prev != RefsWord::LINKED {
                // A pop claimed the node in the window; it relinks on release.
                return;
            }
            hint::spin_loop();
        }
    }

    /// Detach the head node, or `None` if this shard is empty.
    ///
    /// Lock-free: every retry means some other thread changed `head`.
    pub fn pop(&self) -> Option<NonNull<FreelistNode>> {
        let mut head = self.head.load(Ordering::Acquire);

        while let Some(claimed) = NonNull::new(head) {
            // Safety: nodes are never freed while their pool is alive, so any
            // pointer ever published as head stays dereferenceable.
            let header = unsafe { claimed.as_ref() };

            let refs = header.load_refs(Ordering::Relaxed);
            if !refs.claimable() || !header.try_claim(refs) {
                // Head is mid-transition (popped, or waiting to be relinked).
                hint::spin_loop();
                head = self.head.load(Ordering::Acquire);
                continue;
            }

            // The claim pins `next`: a pushed-back node is not relinked while
            // our reference is outstanding.
            let next = header.next();
            match self
                .head
                .compare_exchange(head, next, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => {
                    // It was on the list, so nobody can have pushed it back yet.
                    debug_assert!(
                        !header.load_refs(Ordering::Relaxed).on_list(),
                        "freelist: popped node {claimed:p} already flagged on-list",
                    );
                    // Once for our claim, once for the list's link.
                    header.fetch_sub_refs(2, Ordering::AcqRel);
                    return Some(claimed);
                }
                Err(current) => {
                    head = current;
                    let prev = header.fetch_sub_refs(1, Ordering::AcqRel);
                    if prev == RefsWord(RefsWord::ON_LIST + 1) {
                        // We were the last reader of a pushed-back node.
                        // Safety: word is now ON_LIST|0 and the node is valid.
                        unsafe { self.link(claimed) };
                    }
                }
            }
        }

        None
    }
}

// Safety: Shard only holds an atomic pointer; all node access goes through
// the refcount protocol above.
unsafe impl Send for Shard {}
// Safety: see above.
unsafe impl Sync for Shard {}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::Arc;
    use crate::sync::atomic::AtomicUsize;
    use crate::sync::barrier::Barrier;
    use crate::sync::thread;

    fn make_nodes(n: usize) -> Vec<FreelistNode> {
        (0..n).map(|_| FreelistNode::new()).collect()
    }

    fn ptr_of(node: &FreelistNode) -> NonNull<FreelistNode> {
        NonNull::from(node)
    }

    #[test]
    fn test_shard_empty_pop() {
        let shard = Shard::new();
        assert!(shard.is_empty());
        assert!(shard.pop().is_none());
    }

    #[test]
    fn test_insert_exclusive_is_lifo() {
        let nodes = make_nodes(3);
        let mut shard = Shard::new();
        for n in &nodes {
            // Safety: Test code.
            unsafe { shard.insert_exclusive(ptr_of(n)) };
        }
        assert_eq!(shard.pop(), Some(ptr_of(&nodes[2])));
        assert_eq!(shard.pop(), Some(ptr_of(&nodes[1])));
        assert_eq!(shard.pop(), Some(ptr_of(&nodes[0])));
        assert!(shard.pop().is_none());
    }

    #[test]
    fn test_popped_node_is_unlinked() {
        let nodes = make_nodes(1);
        let mut shard = Shard::new();
        // Safety: Test code.
        unsafe { shard.insert_exclusive(ptr_of(&nodes[0])) };
        assert_eq!(nodes[0].load_refs(Ordering::Relaxed), RefsWord::LINKED);

        let popped = shard.pop().unwrap();
        // Safety: Test code.
        assert!(unsafe { popped.as_ref() }.is_unlinked());
    }

    #[test]
    fn test_push_pop_round_trip() {
        let nodes = make_nodes(2);
        let shard = Shard::new();
        // Safety: Test code.
        unsafe {
            shard.push(ptr_of(&nodes[0]));
            shard.push(ptr_of(&nodes[1]));
        }
        assert_eq!(shard.pop(), Some(ptr_of(&nodes[1])));
        // Safety: Test code.
        unsafe { shard.push(ptr_of(&nodes[1])) };
        assert_eq!(shard.pop(), Some(ptr_of(&nodes[1])));
        assert_eq!(shard.pop(), Some(ptr_of(&nodes[0])));
        assert!(shard.pop().is_none());
    }

    #[test]
    fn test_push_with_outstanding_claim_defers_link() {
        // Simulate a pop that claimed the node and has not yet let go.
        let nodes = make_nodes(1);
        let shard = Shard::new();
        let node = ptr_of(&nodes[0]);

        // Reader holds one claim on an unlinked node (popped elsewhere).
        nodes[0].store_refs(RefsWord(1), Ordering::Relaxed);

        // Safety: Test code.
        unsafe { shard.push(node) };
        // Not linked yet: the reader owes the link.
        assert!(shard.is_empty());
        assert_eq!(nodes[0].load_refs(Ordering::Relaxed), RefsWord(RefsWord::ON_LIST + 1));

        // Reader releases its claim and performs the deferred link.
        let prev = nodes[0].fetch_sub_refs(1, Ordering::AcqRel);
        assert_eq!(prev, RefsWord(RefsWord::ON_LIST + 1));
        // Safety: Test code.
        unsafe { shard.link(node) };

        assert_eq!(shard.pop(), Some(node));
        assert!(shard.pop().is_none());
    }

    #[test]
    fn test_concurrent_pop_unique() {
        const N: usize = 4096;
        const THREADS: usize = 8;

        let nodes: Arc<Vec<FreelistNode>> = Arc::new(make_nodes(N));
        let mut shard = Shard::new();
        for n in nodes.iter() {
            // Safety: Test code.
            unsafe { shard.insert_exclusive(ptr_of(n)) };
        }
        let shard = Arc::new(shard);
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let shard = shard.clone();
                let barrier = barrier.clone();
                let nodes = nodes.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let mut got = Vec::new();
                    while let Some(p) = shard.pop() {
                        got.push(p.as_ptr() as usize);
                    }
                    drop(nodes);
                    got
                })
            })
            .collect();

        let mut all: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(all.len(), N);
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), N, "a node was popped twice");
    }

    #[test]
    fn test_concurrent_push_pop_cycles() {
        const N: usize = 16;
        const THREADS: usize = 8;
        const ROUNDS: usize = 20_000;

        let nodes: Arc<Vec<FreelistNode>> = Arc::new(make_nodes(N));
        let mut shard = Shard::new();
        for n in nodes.iter() {
            // Safety: Test code.
            unsafe { shard.insert_exclusive(ptr_of(n)) };
        }
        let shard = Arc::new(shard);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let shard = shard.clone();
                let in_flight = in_flight.clone();
                let barrier = barrier.clone();
                let nodes = nodes.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..ROUNDS {
                        if let Some(p) = shard.pop() {
                            let now = in_flight.fetch_add(1, Ordering::AcqRel) + 1;
                            assert!(now <= N);
                            in_flight.fetch_sub(1, Ordering::AcqRel);
                            // Safety: Test code; p was popped by this thread.
                            unsafe { shard.push(p) };
                        }
                    }
                    drop(nodes);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut count = 0;
        while shard.pop().is_some() {
            count += 1;
        }
        assert_eq!(count, N);
    }
}
