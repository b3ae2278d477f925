use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::{Config, TargetConfig};
use crate::error::Result;
use crate::handle::Handle;

use super::target::TargetPool;

/// Process-wide pool directory: one [`TargetPool`] per interned target.
pub struct PoolManager {
    config: Config,
    targets: RwLock<HashMap<String, Arc<TargetPool>>>,
    maintenance: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl PoolManager {
    pub fn new(config: Config) -> Arc<Self> {
        let manager = Arc::new(Self {
            config,
            targets: RwLock::new(HashMap::new()),
            maintenance: parking_lot::Mutex::new(None),
        });
        let task = {
            let m = manager.clone();
            tokio::spawn(async move { m.maintenance_loop().await })
        };
        *manager.maintenance.lock() = Some(task);
        manager
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Lease a session handle for the given storage node.
    pub async fn acquire(&self, target: &TargetConfig) -> Result<Handle> {
        let pool = self.target_pool(target).await;
        pool.acquire().await
    }

    /// Intern the target and return its pool.
    pub async fn target_pool(&self, target: &TargetConfig) -> Arc<TargetPool> {
        let key = target.key();
        if let Some(pool) = self.targets.read().await.get(&key) {
            return pool.clone();
        }
        let mut targets = self.targets.write().await;
        targets
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(target = %key, "registering target pool");
                TargetPool::new(
                    target.clone(),
                    self.config.pool.clone(),
                    self.config.keepalive.clone(),
                )
            })
            .clone()
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let ttl = self.config.pool.idle_session_ttl();
        let tick = (ttl / 4).clamp(Duration::from_millis(100), Duration::from_secs(5));
        loop {
            tokio::time::sleep(tick).await;
            let pools: Vec<_> = self.targets.read().await.values().cloned().collect();
            for pool in pools {
                pool.maintain().await;
            }
        }
    }

    /// Tear everything down: stop upkeep, close every transport.
    pub async fn shutdown(&self) {
        if let Some(task) = self.maintenance.lock().take() {
            task.abort();
        }
        let pools: Vec<_> = self
            .targets
            .write()
            .await
            .drain()
            .map(|(_, pool)| pool)
            .collect();
        for pool in pools {
            pool.shutdown().await;
        }
    }
}

impl Drop for PoolManager {
    fn drop(&mut self) {
        if let Some(task) = self.maintenance.lock().take() {
            task.abort();
        }
    }
}
