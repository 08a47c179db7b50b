pub(crate) mod backing;
pub(crate) mod freelist;
pub(crate) mod node;
pub(crate) mod selector;
pub(crate) mod shard;
pub mod stats;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
