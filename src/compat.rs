//! Thin JDBC-shaped adapter over [`Handle`], for callers porting from a
//! standard SQL connection interface. Features outside the private protocol
//! raise [`Error::NotSupported`].

use std::any::Any;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::result::ResultStream;
use crate::session::{IsolationLevel, QuerySpec};

/// Connection-shaped wrapper.
pub struct CompatConnection {
    handle: Arc<Handle>,
}

impl CompatConnection {
    pub fn new(handle: Arc<Handle>) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &Arc<Handle> {
        &self.handle
    }

    pub fn create_statement(&self) -> CompatStatement {
        CompatStatement {
            handle: self.handle.clone(),
        }
    }

    pub fn prepare_statement(&self, sql: &str) -> CompatPreparedStatement {
        CompatPreparedStatement {
            handle: self.handle.clone(),
            sql: sql.to_string(),
        }
    }

    /// Only the forward-only, read-only shape is supported; anything else
    /// is outside the private protocol.
    pub fn prepare_statement_with(
        &self,
        sql: &str,
        forward_only: bool,
        read_only_concurrency: bool,
    ) -> Result<CompatPreparedStatement> {
        if forward_only && read_only_concurrency {
            Ok(self.prepare_statement(sql))
        } else {
            Err(Error::NotSupported("scrollable or updatable result sets"))
        }
    }

    /// Statement creation with explicit holdability has no protocol
    /// counterpart.
    pub fn create_statement_with_holdability(&self) -> Result<CompatStatement> {
        Err(Error::NotSupported("result set holdability"))
    }

    pub async fn set_auto_commit(&self, on: bool) -> Result<()> {
        self.handle.set_auto_commit(on).await
    }

    pub fn auto_commit(&self) -> bool {
        self.handle.auto_commit()
    }

    pub async fn commit(&self) -> Result<()> {
        self.handle.commit().await
    }

    pub async fn rollback(&self) -> Result<()> {
        self.handle.rollback().await
    }

    pub async fn set_transaction_isolation(&self, level: IsolationLevel) -> Result<()> {
        self.handle.set_transaction_isolation(level).await
    }

    pub async fn is_closed(&self) -> bool {
        self.handle.is_closed().await
    }

    pub async fn close(&self) {
        self.handle.close().await
    }

    pub fn set_savepoint(&self) -> Result<()> {
        Err(Error::NotSupported("savepoints"))
    }

    pub fn set_catalog(&self, _catalog: &str) -> Result<()> {
        Err(Error::NotSupported("catalogs"))
    }

    pub fn set_client_info(&self, _name: &str, _value: &str) -> Result<()> {
        Err(Error::NotSupported("client info"))
    }

    pub fn type_map(&self) -> Result<()> {
        Err(Error::NotSupported("type maps"))
    }

    /// Whether this adapter can be viewed as `T`.
    pub fn is_wrapper_for<T: Any>(&self) -> bool {
        (self as &dyn Any).is::<T>()
    }

    /// View the adapter as `T` when the types line up.
    pub fn unwrap_as<T: Any>(&self) -> Result<&T> {
        (self as &dyn Any)
            .downcast_ref::<T>()
            .ok_or(Error::NotSupported("not a wrapper for the requested type"))
    }
}

/// Statement-shaped wrapper.
pub struct CompatStatement {
    handle: Arc<Handle>,
}

impl CompatStatement {
    pub async fn execute_query(&self, sql: &str) -> Result<ResultStream> {
        self.handle.exec_query(sql).await
    }

    pub async fn execute_update(&self, sql: &str) -> Result<u64> {
        self.handle.exec_update(sql).await
    }
}

/// Prepared-statement-shaped wrapper; parameters bind positionally.
pub struct CompatPreparedStatement {
    handle: Arc<Handle>,
    sql: String,
}

impl CompatPreparedStatement {
    pub async fn execute_query(&self, args: Vec<crate::protocol::Scalar>) -> Result<ResultStream> {
        self.handle
            .exec_query_spec(QuerySpec::sql(&self.sql).with_args(args), false)
            .await
    }

    pub async fn execute_update(&self, args: Vec<crate::protocol::Scalar>) -> Result<u64> {
        let result = self
            .handle
            .exec_update_spec(QuerySpec::sql(&self.sql).with_args(args), false)
            .await?;
        Ok(result.affected_rows())
    }
}
