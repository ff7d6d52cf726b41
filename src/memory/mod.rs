pub(crate) mod bucket;
pub(crate) mod code_heap;
pub(crate) mod code_pools;
pub(crate) mod loom_tests;
pub(crate) mod page_pool;
pub(crate) mod stats;
pub(crate) mod trap;
pub(crate) mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
