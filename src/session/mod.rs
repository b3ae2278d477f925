//! Logical database session on a transport.
//!
//! Requests on one session are strictly serial at the protocol level: the
//! next is not sent until the previous produced its terminal frame, unless
//! the previous was fire-and-forget. Side-effect statements (variable
//! assignments, isolation changes) are batched as ignorable requests and
//! pushed ahead of the next real one.

mod state;

pub use state::{IsolationLevel, SessionState, TxnState};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::metrics::metrics;
use crate::protocol::{
    capabilities, ClientMessage, ExecAttrs, ExecPlan, ExecSql, GalaxyPrepare, GpTable, Scalar,
    ServerMessage, TokenOffer, TsoRequest,
};
use crate::result::{RequestKind, RequestStatus, ResultStream};
use crate::transport::Transport;

/// One SQL request: statement bytes plus optional wire extras.
#[derive(Debug, Clone, Default)]
pub struct QuerySpec {
    pub stmt: Bytes,
    pub hint: Option<Bytes>,
    /// Server-side statement cache key
    pub digest: Option<Bytes>,
    pub args: Vec<Scalar>,
    /// Row-producing update selector
    pub returning: Option<String>,
}

impl QuerySpec {
    pub fn sql(sql: impl AsRef<str>) -> Self {
        Self {
            stmt: Bytes::copy_from_slice(sql.as_ref().as_bytes()),
            ..Default::default()
        }
    }

    pub fn with_args(mut self, args: Vec<Scalar>) -> Self {
        self.args = args;
        self
    }

    pub fn with_hint(mut self, hint: impl Into<Bytes>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_digest(mut self, digest: impl Into<Bytes>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    pub fn with_returning(mut self, returning: impl Into<String>) -> Self {
        self.returning = Some(returning.into());
        self
    }
}

/// Prepared-and-packed execution request.
#[derive(Debug, Clone)]
pub struct GalaxyPrepareSpec {
    pub stmt: Bytes,
    pub hint: Option<Bytes>,
    pub digest: Option<Bytes>,
    pub tables: Vec<GpTable>,
    pub params: Bytes,
    pub param_count: u32,
    pub is_update: bool,
}

/// Per-call execution options, derived from the handle's mode flags.
#[derive(Debug, Clone, Default)]
pub struct ExecOpts {
    pub ignore_result: bool,
    pub streaming: bool,
    /// Initial token window when streaming
    pub token: u32,
    pub compact_metadata: bool,
    pub feedback: bool,
    pub trace_id: Option<String>,
}

/// Serial request pipeline bookkeeping. Guarded by the pipeline mutex.
#[derive(Default)]
struct Pipeline {
    /// Most recent request, including ignorable ones
    last: Option<Arc<RequestStatus>>,
    last_ignorable: bool,
    /// Most recent caller-visible request
    last_user: Option<Arc<RequestStatus>>,
}

/// A logical session multiplexed on a [`Transport`].
pub struct Session {
    id: u64,
    transport: Weak<Transport>,
    capabilities: u32,
    state: parking_lot::Mutex<SessionState>,
    pipeline: tokio::sync::Mutex<Pipeline>,
    killed: AtomicBool,
    dead: AtomicBool,
    in_use: AtomicBool,
    idle_since: parking_lot::Mutex<Instant>,
    connection_id: AtomicU64,
    last_error: parking_lot::Mutex<Option<Error>>,
    acquire_stack: parking_lot::Mutex<Option<String>>,
}

impl Session {
    pub(crate) fn new(
        id: u64,
        transport: Weak<Transport>,
        schema: Option<String>,
        capabilities: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            transport,
            capabilities,
            state: parking_lot::Mutex::new(SessionState::new(schema)),
            pipeline: tokio::sync::Mutex::new(Pipeline::default()),
            killed: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            in_use: AtomicBool::new(false),
            idle_since: parking_lot::Mutex::new(Instant::now()),
            connection_id: AtomicU64::new(0),
            last_error: parking_lot::Mutex::new(None),
            acquire_stack: parking_lot::Mutex::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Server connection id, populated on first init.
    pub fn connection_id(&self) -> u64 {
        self.connection_id.load(Ordering::SeqCst)
    }

    pub(crate) fn transport_ref(&self) -> Option<Arc<Transport>> {
        self.transport.upgrade()
    }

    fn transport(&self) -> Result<Arc<Transport>> {
        self.transport
            .upgrade()
            .ok_or_else(|| Error::Transport("session detached from transport".into()))
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.killed.load(Ordering::SeqCst) {
            return Err(Error::SessionKilled);
        }
        if self.dead.load(Ordering::SeqCst) {
            return Err(Error::Transport("session's transport failed".into()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Request pipeline
    // ------------------------------------------------------------------

    /// Block until the previous request terminated, unless it was
    /// fire-and-forget. A timeout here turns into a deferred cancel.
    async fn await_previous(&self, pipeline: &Pipeline, timeout: Duration) -> Result<()> {
        if pipeline.last_ignorable {
            return Ok(());
        }
        if let Some(prev) = &pipeline.last {
            if !prev.is_done() {
                debug!(session_id = self.id, "waiting for previous request");
                match prev.wait_done(timeout).await {
                    Ok(()) => {}
                    Err(Error::Timeout(t)) => {
                        let _ = self.send_cancel(timeout).await;
                        return Err(Error::Timeout(t));
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Push batched side-effect statements as ignorable requests.
    async fn flush_pending_locked(
        self: &Arc<Self>,
        pipeline: &mut Pipeline,
        timeout: Duration,
    ) -> Result<()> {
        let pending = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.pending_ignorable)
        };
        for sql in pending {
            debug!(session_id = self.id, sql = %sql, "flushing ignorable statement");
            let stmt = Bytes::from(sql);
            let status = RequestStatus::new(RequestKind::Admin, Some(stmt.clone()), true);
            let message = ClientMessage::ExecSql(ExecSql {
                session_id: self.id,
                stmt,
                hint: None,
                digest: None,
                args: Vec::new(),
                returning: None,
                attrs: ExecAttrs::default(),
            });
            let rx = self.register_and_send(&status, &message, timeout).await?;
            drop(rx);
            pipeline.last = Some(status);
            pipeline.last_ignorable = true;
        }
        Ok(())
    }

    async fn register_and_send(
        &self,
        status: &Arc<RequestStatus>,
        message: &ClientMessage,
        timeout: Duration,
    ) -> Result<mpsc::UnboundedReceiver<ServerMessage>> {
        let transport = self.transport()?;
        let rx = transport.register_owner(self.id, status.clone())?;
        if let Err(e) = transport.send(message, timeout).await {
            transport.abandon_owner(self.id, status);
            status.fail(e.clone());
            self.record_error(&e);
            return Err(e);
        }
        Ok(rx)
    }

    /// Serialize submission: wait for the previous terminal, flush pending
    /// ignorables, encode under the state lock, register ownership, send.
    async fn start_request<F>(
        self: &Arc<Self>,
        kind: RequestKind,
        statement: Option<Bytes>,
        ignore_result: bool,
        user_visible: bool,
        timeout: Duration,
        build: F,
    ) -> Result<(Arc<RequestStatus>, mpsc::UnboundedReceiver<ServerMessage>)>
    where
        F: FnOnce(&mut SessionState) -> ClientMessage,
    {
        let mut pipeline = self.pipeline.lock().await;
        self.ensure_usable()?;
        self.await_previous(&pipeline, timeout).await?;
        self.flush_pending_locked(&mut pipeline, timeout).await?;

        let status = RequestStatus::new(kind, statement, ignore_result);
        let message = {
            let mut state = self.state.lock();
            build(&mut state)
        };
        let rx = self.register_and_send(&status, &message, timeout).await?;

        if matches!(
            kind,
            RequestKind::Query | RequestKind::Update | RequestKind::Prepare
        ) {
            let mut state = self.state.lock();
            if !state.auto_commit {
                state.in_transaction = true;
            }
        }

        pipeline.last = Some(status.clone());
        pipeline.last_ignorable = ignore_result;
        if user_visible && !ignore_result {
            pipeline.last_user = Some(status.clone());
        }
        metrics().record_request(kind.as_str());
        Ok((status, rx))
    }

    async fn finish_stream(
        self: &Arc<Self>,
        status: Arc<RequestStatus>,
        rx: mpsc::UnboundedReceiver<ServerMessage>,
        opts: &ExecOpts,
        timeout: Duration,
    ) -> Result<ResultStream> {
        let initial_token = if opts.streaming { opts.token } else { 0 };
        let mut stream = ResultStream::new(
            self.clone(),
            status,
            rx,
            opts.streaming,
            initial_token,
            opts.token.max(1),
            timeout,
        );
        if opts.ignore_result {
            return Ok(stream);
        }
        if opts.streaming {
            stream.wait_metadata().await?;
        } else {
            stream.buffer_all().await?;
        }
        Ok(stream)
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    pub async fn exec_query(
        self: &Arc<Self>,
        spec: QuerySpec,
        opts: ExecOpts,
        timeout: Duration,
    ) -> Result<ResultStream> {
        self.exec_sql(RequestKind::Query, spec, opts, timeout).await
    }

    pub async fn exec_update(
        self: &Arc<Self>,
        spec: QuerySpec,
        opts: ExecOpts,
        timeout: Duration,
    ) -> Result<ResultStream> {
        self.exec_sql(RequestKind::Update, spec, opts, timeout)
            .await
    }

    async fn exec_sql(
        self: &Arc<Self>,
        kind: RequestKind,
        spec: QuerySpec,
        opts: ExecOpts,
        timeout: Duration,
    ) -> Result<ResultStream> {
        let QuerySpec {
            stmt,
            hint,
            digest,
            args,
            returning,
        } = spec;
        let session_id = self.id;
        let o = opts.clone();
        let statement = stmt.clone();
        let (status, rx) = self
            .start_request(
                kind,
                Some(statement),
                opts.ignore_result,
                true,
                timeout,
                move |state| {
                    ClientMessage::ExecSql(ExecSql {
                        session_id,
                        stmt,
                        hint,
                        digest,
                        args,
                        returning,
                        attrs: exec_attrs(state, &o),
                    })
                },
            )
            .await?;
        self.finish_stream(status, rx, &opts, timeout).await
    }

    /// Execute a serialized plan instead of SQL text.
    pub async fn exec_plan(
        self: &Arc<Self>,
        plan: Bytes,
        args: Vec<Scalar>,
        digest: Option<Bytes>,
        opts: ExecOpts,
        timeout: Duration,
    ) -> Result<ResultStream> {
        let session_id = self.id;
        let o = opts.clone();
        let (status, rx) = self
            .start_request(
                RequestKind::Query,
                None,
                opts.ignore_result,
                true,
                timeout,
                move |state| {
                    ClientMessage::ExecPlan(ExecPlan {
                        session_id,
                        plan,
                        digest,
                        args,
                        attrs: exec_attrs(state, &o),
                    })
                },
            )
            .await?;
        self.finish_stream(status, rx, &opts, timeout).await
    }

    pub async fn exec_galaxy_prepare(
        self: &Arc<Self>,
        spec: GalaxyPrepareSpec,
        opts: ExecOpts,
        timeout: Duration,
    ) -> Result<ResultStream> {
        let session_id = self.id;
        let o = opts.clone();
        let statement = spec.stmt.clone();
        let (status, rx) = self
            .start_request(
                RequestKind::Prepare,
                Some(statement),
                opts.ignore_result,
                true,
                timeout,
                move |state| {
                    ClientMessage::GalaxyPrepare(GalaxyPrepare {
                        session_id,
                        stmt: spec.stmt,
                        hint: spec.hint,
                        digest: spec.digest,
                        tables: spec.tables,
                        params: spec.params,
                        param_count: spec.param_count,
                        is_update: spec.is_update,
                        attrs: exec_attrs(state, &o),
                    })
                },
            )
            .await?;
        self.finish_stream(status, rx, &opts, timeout).await
    }

    /// Allocate `count` globally ordered timestamps; returns the first.
    pub async fn get_tso(self: &Arc<Self>, count: u32, timeout: Duration) -> Result<u64> {
        if count == 0 {
            return Err(Error::InvalidArgument(
                "timestamp count must be positive".into(),
            ));
        }
        let session_id = self.id;
        let (status, _rx) = self
            .start_request(
                RequestKind::Tso,
                None,
                false,
                true,
                timeout,
                move |_state| ClientMessage::Tso(TsoRequest { session_id, count }),
            )
            .await?;
        match status.wait_done(timeout).await {
            Ok(()) => {}
            Err(Error::Timeout(t)) => {
                let _ = self.send_cancel(timeout).await;
                let err = Error::Timeout(t);
                self.record_error(&err);
                return Err(err);
            }
            Err(e) => {
                self.record_error(&e);
                return Err(e);
            }
        }
        if let Some(err) = status.error() {
            self.record_error(&err);
            return Err(err);
        }
        status
            .tso()
            .ok_or_else(|| Error::Transport("missing timestamp in TSO reply".into()))
    }

    /// Internal statement, with the pending transaction envelope stashed so
    /// the statement does not consume it.
    async fn exec_internal(
        self: &Arc<Self>,
        sql: &str,
        ignorable: bool,
        timeout: Duration,
    ) -> Result<Arc<RequestStatus>> {
        let stashed = self.state.lock().stash_transaction_sequence();
        let result = self.exec_internal_inner(sql, ignorable, timeout).await;
        if stashed {
            self.state.lock().unstash_transaction_sequence();
        }
        result
    }

    async fn exec_internal_inner(
        self: &Arc<Self>,
        sql: &str,
        ignorable: bool,
        timeout: Duration,
    ) -> Result<Arc<RequestStatus>> {
        let stmt = Bytes::copy_from_slice(sql.as_bytes());
        let session_id = self.id;
        let statement = stmt.clone();
        let (status, rx) = self
            .start_request(
                RequestKind::Admin,
                Some(statement),
                ignorable,
                false,
                timeout,
                move |state| {
                    ClientMessage::ExecSql(ExecSql {
                        session_id,
                        stmt,
                        hint: None,
                        digest: None,
                        args: Vec::new(),
                        returning: None,
                        attrs: ExecAttrs {
                            schema: state.schema.clone(),
                            txn: state.take_lazy(),
                            ..Default::default()
                        },
                    })
                },
            )
            .await?;
        drop(rx);
        if !ignorable {
            match status.wait_done(timeout).await {
                Ok(()) => {}
                Err(Error::Timeout(t)) => {
                    let _ = self.send_cancel(timeout).await;
                    return Err(Error::Timeout(t));
                }
                Err(e) => return Err(e),
            }
            if let Some(err) = status.error() {
                self.record_error(&err);
                return Err(err);
            }
        }
        Ok(status)
    }

    /// Safety rollback issued by the pool when a session is released with an
    /// open transaction.
    pub(crate) async fn rollback_ignorable(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        self.exec_internal("rollback", true, timeout).await?;
        self.state.lock().in_transaction = false;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Protocol state
    // ------------------------------------------------------------------

    /// Transition auto-commit, skipping redundant changes. The cached flag
    /// only flips after the server acknowledged the statement.
    pub async fn set_auto_commit(self: &Arc<Self>, on: bool, timeout: Duration) -> Result<()> {
        if self.state.lock().auto_commit == on {
            return Ok(());
        }
        let sql = if on {
            "SET autocommit=1"
        } else {
            "SET autocommit=0"
        };
        self.exec_internal(sql, false, timeout).await?;
        let mut state = self.state.lock();
        state.auto_commit = on;
        if on {
            state.in_transaction = false;
        }
        Ok(())
    }

    pub fn auto_commit(&self) -> bool {
        self.state.lock().auto_commit
    }

    pub fn in_transaction(&self) -> bool {
        self.state.lock().in_transaction
    }

    pub fn txn_state(&self) -> TxnState {
        self.state.lock().txn_state()
    }

    /// Change isolation, skipping the wire round trip when the cached level
    /// already matches.
    pub async fn set_transaction_isolation(
        self: &Arc<Self>,
        level: IsolationLevel,
        timeout: Duration,
    ) -> Result<()> {
        if self.state.lock().isolation == Some(level) {
            return Ok(());
        }
        // Ignorable is fine here: the session is dropped if it fails.
        self.exec_internal(level.sql(), true, timeout).await?;
        self.state.lock().isolation = Some(level);
        Ok(())
    }

    pub fn isolation(&self) -> Option<IsolationLevel> {
        self.state.lock().isolation
    }

    pub fn set_default_db(&self, schema: impl Into<String>) {
        self.state.lock().schema = Some(schema.into());
    }

    pub fn default_db(&self) -> Option<String> {
        self.state.lock().schema.clone()
    }

    /// Batch session variable assignments for the next request.
    pub fn set_session_variables(&self, vars: &HashMap<String, String>) -> usize {
        self.state.lock().queue_session_variables(vars)
    }

    pub fn set_global_variables(&self, vars: &HashMap<String, String>) -> usize {
        self.state.lock().queue_global_variables(vars)
    }

    pub fn set_lazy_cts_transaction(&self) {
        self.state.lock().set_lazy_cts();
    }

    pub fn set_lazy_snapshot_seq(&self, seq: u64) {
        self.state.lock().set_lazy_snapshot_seq(seq);
    }

    pub fn set_lazy_commit_seq(&self, seq: u64) {
        self.state.lock().set_lazy_commit_seq(seq);
    }

    /// Push any batched side-effect statements to the server.
    pub async fn flush_ignorable(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        if self.state.lock().pending_ignorable.is_empty() {
            return Ok(());
        }
        let mut pipeline = self.pipeline.lock().await;
        self.ensure_usable()?;
        self.await_previous(&pipeline, timeout).await?;
        self.flush_pending_locked(&mut pipeline, timeout).await
    }

    /// Flush socket-buffered bytes.
    pub async fn flush_network(&self, timeout: Duration) -> Result<()> {
        self.transport()?.flush(timeout).await
    }

    /// Grant the server more row-chunk credits for the streaming request.
    pub async fn token_offer(&self, count: u32, timeout: Duration) -> Result<()> {
        if count == 0 {
            return Err(Error::InvalidArgument("token count must be positive".into()));
        }
        let session_id = self.id;
        self.transport()?
            .send(
                &ClientMessage::TokenOffer(TokenOffer {
                    session_id,
                    token: count,
                }),
                timeout,
            )
            .await
    }

    // ------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------

    async fn send_cancel(&self, timeout: Duration) -> Result<()> {
        let session_id = self.id;
        self.transport()?
            .send(&ClientMessage::Cancel { session_id }, timeout)
            .await
    }

    /// Out-of-band cancel of the current request. The session stays usable.
    pub async fn cancel(&self, timeout: Duration) -> Result<()> {
        self.send_cancel(timeout).await
    }

    /// Cancel and optionally poison the session so pending waiters observe
    /// the final state. A killed session is not reusable.
    pub async fn kill(self: &Arc<Self>, push_killed: bool, timeout: Duration) -> Result<()> {
        let result = self.send_cancel(timeout).await;
        if push_killed {
            self.mark_killed();
            if let Some(transport) = self.transport_ref() {
                transport.poison_session(self.id, Error::SessionKilled);
            }
        }
        result
    }

    pub(crate) fn mark_killed(&self) {
        if !self.killed.swap(true, Ordering::SeqCst) {
            warn!(session_id = self.id, "session killed");
            *self.last_error.lock() = Some(Error::SessionKilled);
        }
    }

    pub(crate) fn mark_dead(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Initialization and bookkeeping
    // ------------------------------------------------------------------

    /// First-use setup: force auto-commit and fetch the server connection id
    /// once. The bound is a scoped parameter, not a mutation of the handle's
    /// timeout.
    pub(crate) async fn init(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        self.set_auto_commit(true, timeout).await?;
        if self.connection_id.load(Ordering::SeqCst) == 0 {
            let mut result = self
                .exec_query(
                    QuerySpec::sql("SELECT CONNECTION_ID()"),
                    ExecOpts::default(),
                    timeout,
                )
                .await?;
            if let Some(row) = result.next_row().await? {
                if let Some(id) = row.first().and_then(Scalar::as_u64) {
                    self.connection_id.store(id, Ordering::SeqCst);
                }
            }
        }
        Ok(())
    }

    pub async fn last_user_request(&self) -> Option<Arc<RequestStatus>> {
        self.pipeline.lock().await.last_user.clone()
    }

    pub(crate) async fn last_request(&self) -> Option<Arc<RequestStatus>> {
        self.pipeline.lock().await.last.clone()
    }

    pub fn last_exception(&self) -> Option<Error> {
        self.last_error.lock().clone()
    }

    /// Record an error for post-hoc inspection; returns the previous one.
    pub fn set_last_exception(&self, err: Error) -> Option<Error> {
        self.last_error.lock().replace(err)
    }

    pub(crate) fn record_error(&self, err: &Error) {
        *self.last_error.lock() = Some(err.clone());
    }

    pub fn supports_message_timestamp(&self) -> bool {
        self.capabilities & capabilities::MESSAGE_TIMESTAMP != 0
    }

    pub fn supports_single_shard_optimization(&self) -> bool {
        self.capabilities & capabilities::SINGLE_SHARD_OPTIMIZATION != 0
    }

    pub fn supports_raw_string(&self) -> bool {
        self.capabilities & capabilities::RAW_STRING != 0
    }

    pub(crate) fn observe_txn_state(&self, active: bool) {
        self.state.lock().in_transaction = active;
    }

    // ------------------------------------------------------------------
    // Pool integration
    // ------------------------------------------------------------------

    pub(crate) fn try_claim(&self) -> bool {
        if self.killed.load(Ordering::SeqCst) || self.dead.load(Ordering::SeqCst) {
            return false;
        }
        self.in_use
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn release_to_idle(&self) {
        *self.idle_since.lock() = Instant::now();
        self.in_use.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_idle_expired(&self, ttl: Duration) -> bool {
        !self.in_use.load(Ordering::SeqCst) && self.idle_since.lock().elapsed() >= ttl
    }

    /// Whether this session may be handed out again.
    pub(crate) fn reusable(&self) -> bool {
        if self.killed.load(Ordering::SeqCst) || self.dead.load(Ordering::SeqCst) {
            return false;
        }
        if let Some(err) = self.last_error.lock().as_ref() {
            if err.poisons_session() {
                return false;
            }
        }
        true
    }

    /// Reset wire and client state before going back to the idle set.
    pub(crate) async fn reset_for_reuse(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        {
            let mut pipeline = self.pipeline.lock().await;
            self.ensure_usable()?;
            self.await_previous(&pipeline, timeout).await?;
            let status = RequestStatus::new(RequestKind::Admin, None, true);
            let session_id = self.id;
            let rx = self
                .register_and_send(
                    &status,
                    &ClientMessage::SessionReset { session_id },
                    timeout,
                )
                .await?;
            drop(rx);
            pipeline.last = Some(status);
            pipeline.last_ignorable = true;
            pipeline.last_user = None;
        }
        self.state.lock().reset_for_reuse();
        *self.last_error.lock() = None;
        Ok(())
    }

    pub(crate) fn record_acquire_stack(&self, stack: Option<String>) {
        *self.acquire_stack.lock() = stack;
    }

    pub(crate) fn acquire_stack(&self) -> Option<String> {
        self.acquire_stack.lock().clone()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("killed", &self.killed.load(Ordering::SeqCst))
            .field("dead", &self.dead.load(Ordering::SeqCst))
            .finish()
    }
}

fn exec_attrs(state: &mut SessionState, opts: &ExecOpts) -> ExecAttrs {
    ExecAttrs {
        chunked: opts.streaming,
        token: if opts.streaming { opts.token } else { 0 },
        compact_metadata: opts.compact_metadata,
        feedback: opts.feedback,
        schema: state.schema.clone(),
        trace_id: opts.trace_id.clone(),
        txn: state.take_lazy(),
    }
}
