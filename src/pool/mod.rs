mod manager;
mod target;

pub use manager::PoolManager;
pub use target::TargetPool;
