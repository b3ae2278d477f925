//! Multiplexing RPC driver for distributed SQL storage nodes.
//!
//! The driver speaks a private binary wire protocol over TCP: frames are
//! length-prefixed typed messages, and many logical sessions share a small
//! pool of physical connections per storage node. Callers lease a [`Handle`]
//! from the [`PoolManager`], run queries and updates through it, and return
//! it with [`Handle::close`].
//!
//! ```no_run
//! use hermes::{Config, PoolManager, TargetConfig};
//!
//! # async fn example() -> hermes::Result<()> {
//! let pool = PoolManager::new(Config::default());
//! let target = TargetConfig {
//!     host: "10.0.0.1".into(),
//!     port: 33060,
//!     user: "app".into(),
//!     password: "secret".into(),
//!     schema: Some("app".into()),
//! };
//! let conn = pool.acquire(&target).await?;
//! conn.init(std::time::Duration::ZERO).await?;
//! let mut result = conn.exec_query("SELECT 1").await?;
//! while let Some(row) = result.next_row().await? {
//!     println!("{row:?}");
//! }
//! conn.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod handle;
pub mod metrics;
pub mod pool;
pub mod protocol;
pub mod result;
pub mod session;
pub mod transport;

#[cfg(feature = "compat")]
pub mod compat;

pub use config::{load_config, Config, KeepaliveConfig, PoolConfig, TargetConfig};
pub use error::{Error, Result};
pub use handle::Handle;
pub use pool::{PoolManager, TargetPool};
pub use protocol::Scalar;
pub use result::{RequestStatus, ResultStream, Warning};
pub use session::{ExecOpts, GalaxyPrepareSpec, IsolationLevel, QuerySpec, Session, TxnState};
pub use transport::Transport;
