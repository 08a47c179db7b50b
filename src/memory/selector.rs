//! Shard selection: which shard the calling execution unit pushes to and
//! starts popping from.

use crate::sync::atomic::{AtomicUsize, Ordering};

/// Maps the calling execution unit to a shard index.
///
/// Must be cheap and must not block: it runs on every push and pop.
pub trait ShardSelector: Send + Sync {
    /// Index in `0..shard_count` for the caller. `shard_count` is never 0.
    fn current_shard(&self, shard_count: usize) -> usize;
}

/// One shard per CPU: uses the CPU the caller is running on.
///
/// On Linux this is `sched_getcpu`; elsewhere (or if the call fails) it
/// falls back to [`ThreadShardSelector`]. A preempted caller may finish its
/// push on a shard that is no longer "local"; that only costs locality.
#[derive(Clone, Copy, Debug, Default)]
pub struct CpuShardSelector;

impl ShardSelector for CpuShardSelector {
    #[inline]
    fn current_shard(&self, shard_count: usize) -> usize {
        match cpu_id() {
            Some(cpu) => cpu % shard_count,
            None => ThreadShardSelector.current_shard(shard_count),
        }
    }
}

#[cfg(all(target_os = "linux", not(any(loom, miri))))]
fn cpu_id() -> Option<usize> {
    // Safety: FFI call without arguments.
    let cpu = unsafe { libc::sched_getcpu() };
    usize::try_from(cpu).ok()
}

#[cfg(not(all(target_os = "linux", not(any(loom, miri)))))]
fn cpu_id() -> Option<usize> {
    None
}

/// Each thread gets a stable index, handed out round-robin on first use.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadShardSelector;

crate::sync::static_atomic! {
    static NEXT_THREAD_INDEX: AtomicUsize = AtomicUsize::new(0);
}

thread_local! {
    static THREAD_INDEX: usize = NEXT_THREAD_INDEX.fetch_add(1, Ordering::Relaxed);
}

impl ShardSelector for ThreadShardSelector {
    #[inline]
    fn current_shard(&self, shard_count: usize) -> usize {
        THREAD_INDEX
            .try_with(|&idx| idx % shard_count)
            // TLS already torn down (thread exit): any shard is correct.
            .unwrap_or(0)
    }
}

/// Always the same shard. Useful when the host pins work itself, and for
/// deterministic tests.
#[derive(Clone, Copy, Debug)]
pub struct FixedShardSelector(pub usize);

impl ShardSelector for FixedShardSelector {
    #[inline]
    fn current_shard(&self, shard_count: usize) -> usize {
        self.0 % shard_count
    }
}

/// Number of possible CPUs (configured, not just online), at least 1.
#[must_use]
pub fn possible_cpus() -> usize {
    #[cfg(all(unix, not(any(loom, miri))))]
    {
        use crate::sync::OnceLock;
        static CACHED: OnceLock<usize> = OnceLock::new();
        *CACHED.get_or_init(|| {
            // Safety: FFI call to sysconf.
            let raw = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
            usize::try_from(raw)
                .ok()
                .filter(|&n| n > 0)
                .unwrap_or_else(available_parallelism)
        })
    }
    #[cfg(not(all(unix, not(any(loom, miri)))))]
    {
        available_parallelism()
    }
}

fn available_parallelism() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::thread;

    #[test]
    fn test_possible_cpus_nonzero() {
        assert!(possible_cpus() >= 1);
    }

    #[test]
    fn test_cpu_selector_in_range() {
        for count in 1..=9 {
            let idx = CpuShardSelector.current_shard(count);
            assert!(idx < count);
        }
    }

    #[test]
    fn test_thread_selector_is_stable_per_thread() {
        let a = ThreadShardSelector.current_shard(1024);
        let b = ThreadShardSelector.current_shard(1024);
        assert_eq!(a, b);
    }

    #[test]
    fn test_thread_selector_spreads_threads() {
        let indices: Vec<usize> = (0..8)
            .map(|_| thread::spawn(|| ThreadShardSelector.current_shard(usize::MAX)))
            .map(|h| h.join().unwrap())
            .collect();
        let mut unique = indices.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), indices.len());
    }

    #[test]
    fn test_fixed_selector_wraps() {
        assert_eq!(FixedShardSelector(5).current_shard(4), 1);
        assert_eq!(FixedShardSelector(0).current_shard(1), 0);
    }
}
