pub mod correlation;
pub mod partition_pool;
pub mod pending;
pub mod registry;
