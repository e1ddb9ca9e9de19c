pub(crate) mod block_index;
pub(crate) mod code_alloc;
pub(crate) mod integration;
pub(crate) mod occupancy;
pub(crate) mod stats;
pub(crate) mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
