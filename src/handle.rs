//! Caller-owned lease on a session.
//!
//! Operational calls hold a shared lease on the session pointer; `close`
//! takes the exclusive lease, so no operation observes a cleared session and
//! close waits for operations in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::RwLockReadGuard;
use tracing::debug;

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::pool::TargetPool;
use crate::result::{RequestStatus, ResultStream, Warning};
use crate::session::{ExecOpts, GalaxyPrepareSpec, IsolationLevel, QuerySpec, Session};

type SessionSlot = Option<Arc<Session>>;

/// Thread-safe, close-once lease on a pooled session.
pub struct Handle {
    session: tokio::sync::RwLock<SessionSlot>,
    pool: Arc<TargetPool>,
    initialized: AtomicBool,
    /// Mirror of the last auto-commit value the server acknowledged
    auto_commit: AtomicBool,
    stream_mode: AtomicBool,
    compact_metadata: AtomicBool,
    with_feedback: AtomicBool,
    default_token_count: AtomicU32,
    trace_id: parking_lot::Mutex<Option<String>>,
    /// Zero means "use the process default"
    network_timeout_nanos: AtomicU64,
    default_network_timeout: Duration,
    connect_nanos: u64,
    wait_nanos: u64,
}

impl Handle {
    pub(crate) fn new(
        session: Arc<Session>,
        pool: Arc<TargetPool>,
        config: &PoolConfig,
        connect_nanos: u64,
        wait_nanos: u64,
    ) -> Self {
        Self {
            session: tokio::sync::RwLock::new(Some(session)),
            pool,
            initialized: AtomicBool::new(false),
            auto_commit: AtomicBool::new(true),
            stream_mode: AtomicBool::new(false),
            compact_metadata: AtomicBool::new(false),
            with_feedback: AtomicBool::new(false),
            default_token_count: AtomicU32::new(config.default_query_token),
            trace_id: parking_lot::Mutex::new(None),
            network_timeout_nanos: AtomicU64::new(0),
            default_network_timeout: config.network_timeout(),
            connect_nanos,
            wait_nanos,
        }
    }

    fn checked<'a>(&self, guard: &'a RwLockReadGuard<'_, SessionSlot>) -> Result<&'a Arc<Session>> {
        let session = guard.as_ref().ok_or(Error::Closed)?;
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(Error::NotInitialized);
        }
        Ok(session)
    }

    /// Per-call network bound; zero override falls back to the default.
    pub fn actual_timeout(&self) -> Duration {
        let nanos = self.network_timeout_nanos.load(Ordering::SeqCst);
        if nanos == 0 {
            self.default_network_timeout
        } else {
            Duration::from_nanos(nanos)
        }
    }

    fn exec_opts(&self, ignore_result: bool) -> ExecOpts {
        ExecOpts {
            ignore_result,
            streaming: self.stream_mode.load(Ordering::SeqCst),
            token: self.default_token_count.load(Ordering::SeqCst),
            compact_metadata: self.compact_metadata.load(Ordering::SeqCst),
            feedback: self.with_feedback.load(Ordering::SeqCst),
            trace_id: self.trace_id.lock().clone(),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// One-shot setup: force auto-commit and learn the server connection id.
    /// A non-zero `timeout` bounds the setup statements without touching the
    /// handle's network timeout.
    pub async fn init(&self, timeout: Duration) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or(Error::Closed)?;
        let bound = if timeout.is_zero() {
            self.actual_timeout()
        } else {
            timeout
        };
        session.init(bound).await?;
        self.auto_commit.store(true, Ordering::SeqCst);
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Return the session to the pool. Always succeeds; cleanup errors are
    /// logged by the pool and swallowed.
    pub async fn close(&self) {
        let session = {
            let mut guard = self.session.write().await;
            guard.take()
        };
        if let Some(session) = session {
            debug!(session_id = session.id(), "closing handle");
            self.pool.release(session).await;
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.session.read().await.is_none()
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    pub async fn exec_query(&self, sql: &str) -> Result<ResultStream> {
        self.exec_query_spec(QuerySpec::sql(sql), false).await
    }

    pub async fn exec_query_spec(
        &self,
        spec: QuerySpec,
        ignore_result: bool,
    ) -> Result<ResultStream> {
        let guard = self.session.read().await;
        let session = self.checked(&guard)?;
        session
            .exec_query(spec, self.exec_opts(ignore_result), self.actual_timeout())
            .await
    }

    /// Execute a serialized plan instead of SQL text.
    pub async fn exec_plan(
        &self,
        plan: Bytes,
        args: Vec<crate::protocol::Scalar>,
        digest: Option<Bytes>,
        ignore_result: bool,
    ) -> Result<ResultStream> {
        let guard = self.session.read().await;
        let session = self.checked(&guard)?;
        session
            .exec_plan(
                plan,
                args,
                digest,
                self.exec_opts(ignore_result),
                self.actual_timeout(),
            )
            .await
    }

    /// Run an update and return the affected-row count.
    pub async fn exec_update(&self, sql: &str) -> Result<u64> {
        let result = self.exec_update_spec(QuerySpec::sql(sql), false).await?;
        Ok(result.affected_rows())
    }

    pub async fn exec_update_spec(
        &self,
        spec: QuerySpec,
        ignore_result: bool,
    ) -> Result<ResultStream> {
        let guard = self.session.read().await;
        let session = self.checked(&guard)?;
        session
            .exec_update(spec, self.exec_opts(ignore_result), self.actual_timeout())
            .await
    }

    /// `UPDATE .. RETURNING`: an update that produces rows, driven through
    /// the query path with the returning selector.
    pub async fn exec_update_returning(
        &self,
        spec: QuerySpec,
        returning: impl Into<String>,
    ) -> Result<ResultStream> {
        let spec = spec.with_returning(returning);
        self.exec_query_spec(spec, false).await
    }

    pub async fn exec_galaxy_prepare(
        &self,
        spec: GalaxyPrepareSpec,
        ignore_result: bool,
    ) -> Result<ResultStream> {
        let guard = self.session.read().await;
        let session = self.checked(&guard)?;
        session
            .exec_galaxy_prepare(spec, self.exec_opts(ignore_result), self.actual_timeout())
            .await
    }

    /// Allocate `count` globally ordered timestamps; returns the first.
    pub async fn get_tso(&self, count: u32) -> Result<u64> {
        let guard = self.session.read().await;
        let session = self.checked(&guard)?;
        session.get_tso(count, self.actual_timeout()).await
    }

    pub async fn flush_network(&self) -> Result<()> {
        let guard = self.session.read().await;
        let session = self.checked(&guard)?;
        session.flush_network(self.actual_timeout()).await
    }

    // ------------------------------------------------------------------
    // Transaction and session state
    // ------------------------------------------------------------------

    pub async fn set_auto_commit(&self, on: bool) -> Result<()> {
        {
            let guard = self.session.read().await;
            let session = self.checked(&guard)?;
            session.set_auto_commit(on, self.actual_timeout()).await?;
        }
        self.auto_commit.store(on, Ordering::SeqCst);
        Ok(())
    }

    pub fn auto_commit(&self) -> bool {
        self.auto_commit.load(Ordering::SeqCst)
    }

    pub async fn commit(&self) -> Result<()> {
        self.exec_update("commit").await?;
        Ok(())
    }

    pub async fn rollback(&self) -> Result<()> {
        self.exec_update("rollback").await?;
        Ok(())
    }

    pub async fn set_transaction_isolation(&self, level: IsolationLevel) -> Result<()> {
        let guard = self.session.read().await;
        let session = self.checked(&guard)?;
        session
            .set_transaction_isolation(level, self.actual_timeout())
            .await
    }

    pub async fn transaction_isolation(&self) -> Result<Option<IsolationLevel>> {
        let guard = self.session.read().await;
        let session = self.checked(&guard)?;
        Ok(session.isolation())
    }

    pub async fn set_default_db(&self, schema: &str) -> Result<()> {
        let guard = self.session.read().await;
        let session = self.checked(&guard)?;
        session.set_default_db(schema);
        Ok(())
    }

    /// Batch session variable assignments; they ride ahead of the next
    /// request as ignorable statements.
    pub async fn set_session_variables(&self, vars: &HashMap<String, String>) -> Result<usize> {
        let guard = self.session.read().await;
        let session = self.checked(&guard)?;
        Ok(session.set_session_variables(vars))
    }

    pub async fn set_global_variables(&self, vars: &HashMap<String, String>) -> Result<usize> {
        let guard = self.session.read().await;
        let session = self.checked(&guard)?;
        Ok(session.set_global_variables(vars))
    }

    pub async fn set_lazy_cts_transaction(&self) -> Result<()> {
        let guard = self.session.read().await;
        let session = self.checked(&guard)?;
        session.set_lazy_cts_transaction();
        Ok(())
    }

    pub async fn set_lazy_snapshot_seq(&self, seq: u64) -> Result<()> {
        let guard = self.session.read().await;
        let session = self.checked(&guard)?;
        session.set_lazy_snapshot_seq(seq);
        Ok(())
    }

    pub async fn set_lazy_commit_seq(&self, seq: u64) -> Result<()> {
        let guard = self.session.read().await;
        let session = self.checked(&guard)?;
        session.set_lazy_commit_seq(seq);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------

    /// Out-of-band cancel of the current request; the session stays open.
    pub async fn cancel(&self) -> Result<()> {
        let guard = self.session.read().await;
        let session = self.checked(&guard)?;
        session.cancel(self.actual_timeout()).await
    }

    /// Cancel and optionally poison the session and/or close the handle.
    pub async fn kill(&self, push_killed: bool, with_close: bool) -> Result<()> {
        {
            let guard = self.session.read().await;
            let session = self.checked(&guard)?;
            session.kill(push_killed, self.actual_timeout()).await?;
        }
        if with_close {
            self.close().await;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub async fn connection_id(&self) -> Result<u64> {
        let guard = self.session.read().await;
        let session = self.checked(&guard)?;
        Ok(session.connection_id())
    }

    pub async fn last_user_request(&self) -> Result<Option<Arc<RequestStatus>>> {
        let guard = self.session.read().await;
        let session = self.checked(&guard)?;
        Ok(session.last_user_request().await)
    }

    /// First warning of the last caller-visible request.
    pub async fn warnings(&self) -> Result<Option<Warning>> {
        let last = self.last_user_request().await?;
        Ok(last.and_then(|status| status.first_warning()))
    }

    pub async fn last_exception(&self) -> Result<Option<Error>> {
        let guard = self.session.read().await;
        let session = self.checked(&guard)?;
        Ok(session.last_exception())
    }

    pub async fn set_last_exception(&self, err: Error) -> Result<Option<Error>> {
        let guard = self.session.read().await;
        let session = self.checked(&guard)?;
        Ok(session.set_last_exception(err))
    }

    /// Grant the in-flight streamed result another default token window.
    pub async fn token_offer(&self) -> Result<()> {
        let count = self.default_token_count.load(Ordering::SeqCst);
        let guard = self.session.read().await;
        let session = self.checked(&guard)?;
        session.token_offer(count, self.actual_timeout()).await
    }

    pub async fn supports_message_timestamp(&self) -> Result<bool> {
        let guard = self.session.read().await;
        Ok(self.checked(&guard)?.supports_message_timestamp())
    }

    pub async fn supports_single_shard_optimization(&self) -> Result<bool> {
        let guard = self.session.read().await;
        Ok(self.checked(&guard)?.supports_single_shard_optimization())
    }

    pub async fn supports_raw_string(&self) -> Result<bool> {
        let guard = self.session.read().await;
        Ok(self.checked(&guard)?.supports_raw_string())
    }

    // ------------------------------------------------------------------
    // Mode flags and timeouts
    // ------------------------------------------------------------------

    pub fn set_stream_mode(&self, on: bool) {
        self.stream_mode.store(on, Ordering::SeqCst);
    }

    pub fn stream_mode(&self) -> bool {
        self.stream_mode.load(Ordering::SeqCst)
    }

    pub fn set_compact_metadata(&self, on: bool) {
        self.compact_metadata.store(on, Ordering::SeqCst);
    }

    pub fn compact_metadata(&self) -> bool {
        self.compact_metadata.load(Ordering::SeqCst)
    }

    pub fn set_with_feedback(&self, on: bool) {
        self.with_feedback.store(on, Ordering::SeqCst);
    }

    pub fn with_feedback(&self) -> bool {
        self.with_feedback.load(Ordering::SeqCst)
    }

    pub fn set_default_token_count(&self, count: u32) -> Result<()> {
        if count == 0 {
            return Err(Error::InvalidArgument("token count must be positive".into()));
        }
        self.default_token_count.store(count, Ordering::SeqCst);
        Ok(())
    }

    pub fn default_token_count(&self) -> u32 {
        self.default_token_count.load(Ordering::SeqCst)
    }

    pub fn set_trace_id(&self, trace_id: Option<String>) {
        *self.trace_id.lock() = trace_id;
    }

    pub fn trace_id(&self) -> Option<String> {
        self.trace_id.lock().clone()
    }

    pub fn set_network_timeout(&self, timeout: Duration) {
        self.network_timeout_nanos
            .store(timeout.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_nanos(self.network_timeout_nanos.load(Ordering::SeqCst))
    }

    /// Time spent establishing the session, if it was freshly opened.
    pub fn connect_nanos(&self) -> u64 {
        self.connect_nanos
    }

    /// Time spent waiting in the pool's acquire queue.
    pub fn wait_nanos(&self) -> u64 {
        self.wait_nanos
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("initialized", &self.initialized.load(Ordering::SeqCst))
            .field("stream_mode", &self.stream_mode.load(Ordering::SeqCst))
            .finish()
    }
}
