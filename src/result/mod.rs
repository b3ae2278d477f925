//! Result lifecycle for one request: terminal status shared with the
//! transport, and the caller-facing row stream.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::{Column, Scalar, ServerMessage};
use crate::session::Session;

/// Server warning attached to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub code: u32,
    pub message: String,
}

/// What a request was, for logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Query,
    Update,
    Prepare,
    Tso,
    Admin,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Query => "query",
            RequestKind::Update => "update",
            RequestKind::Prepare => "prepare",
            RequestKind::Tso => "tso",
            RequestKind::Admin => "admin",
        }
    }
}

#[derive(Debug, Default)]
struct StatusInner {
    finished: bool,
    ok: bool,
    affected_rows: u64,
    last_insert_id: u64,
    warning_count: u16,
    warnings: Vec<Warning>,
    error: Option<Error>,
    tso: Option<u64>,
}

/// Terminal state of one request, shared between the transport reader, the
/// row stream and post-hoc inspection (`last_user_request`).
pub struct RequestStatus {
    kind: RequestKind,
    statement: Option<Bytes>,
    ignore_result: bool,
    inner: parking_lot::Mutex<StatusInner>,
    done_tx: watch::Sender<bool>,
}

impl RequestStatus {
    pub(crate) fn new(
        kind: RequestKind,
        statement: Option<Bytes>,
        ignore_result: bool,
    ) -> Arc<Self> {
        let (done_tx, _) = watch::channel(false);
        Arc::new(Self {
            kind,
            statement,
            ignore_result,
            inner: parking_lot::Mutex::new(StatusInner::default()),
            done_tx,
        })
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn ignore_result(&self) -> bool {
        self.ignore_result
    }

    /// Statement text for diagnostics, lossily decoded.
    pub fn statement(&self) -> Option<String> {
        self.statement
            .as_ref()
            .map(|s| String::from_utf8_lossy(s).into_owned())
    }

    /// Called by the transport reader when the terminal frame arrives.
    pub(crate) fn apply_terminal(&self, msg: &ServerMessage) {
        {
            let mut inner = self.inner.lock();
            if inner.finished {
                return;
            }
            inner.finished = true;
            match msg {
                ServerMessage::Ok(m) => {
                    inner.ok = true;
                    inner.affected_rows = m.affected_rows;
                    inner.last_insert_id = m.last_insert_id;
                }
                ServerMessage::Eof(m) => {
                    inner.ok = true;
                    inner.affected_rows = m.affected_rows;
                    inner.last_insert_id = m.last_insert_id;
                    inner.warning_count = m.warnings;
                }
                ServerMessage::SessionOpenOk { .. } => {
                    inner.ok = true;
                }
                ServerMessage::Error(m) => {
                    inner.error = Some(Error::Server {
                        code: m.code,
                        sql_state: m.sql_state.clone(),
                        message: m.message.clone(),
                        fatal: m.fatal,
                    });
                }
                ServerMessage::Tso(m) => {
                    if m.error_code == 0 {
                        inner.ok = true;
                        inner.tso = Some(m.timestamp);
                    } else {
                        inner.error = Some(Error::Server {
                            code: m.error_code,
                            sql_state: "HY000".into(),
                            message: "timestamp allocation failed".into(),
                            fatal: false,
                        });
                    }
                }
                other => {
                    inner.error = Some(Error::Transport(format!(
                        "unexpected terminal frame: {other:?}"
                    )));
                }
            }
        }
        // send_replace: the flag must stick even with no subscriber yet.
        self.done_tx.send_replace(true);
    }

    /// Fail the request locally (transport death, kill, abandoned send).
    pub(crate) fn fail(&self, err: Error) {
        {
            let mut inner = self.inner.lock();
            if inner.finished {
                return;
            }
            inner.finished = true;
            inner.error = Some(err);
        }
        self.done_tx.send_replace(true);
    }

    pub(crate) fn push_warning(&self, code: u32, message: String) {
        self.inner.lock().warnings.push(Warning { code, message });
    }

    /// Wait for the terminal frame, bounded by `timeout`.
    pub(crate) async fn wait_done(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.done_tx.subscribe();
        if *rx.borrow() {
            return Ok(());
        }
        tokio::time::timeout(timeout, rx.wait_for(|done| *done))
            .await
            .map_err(|_| Error::Timeout(timeout))?
            .map_err(|_| Error::Transport("request abandoned".into()))?;
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        self.inner.lock().finished
    }

    /// Terminal and successful.
    pub fn is_good_and_done(&self) -> bool {
        let inner = self.inner.lock();
        inner.finished && inner.ok && inner.error.is_none()
    }

    pub fn error(&self) -> Option<Error> {
        self.inner.lock().error.clone()
    }

    pub fn affected_rows(&self) -> u64 {
        self.inner.lock().affected_rows
    }

    pub fn last_insert_id(&self) -> u64 {
        self.inner.lock().last_insert_id
    }

    pub fn warnings(&self) -> Vec<Warning> {
        self.inner.lock().warnings.clone()
    }

    /// Warning count the server reported on the terminal frame.
    pub fn warning_count(&self) -> u16 {
        self.inner.lock().warning_count
    }

    pub fn first_warning(&self) -> Option<Warning> {
        self.inner.lock().warnings.first().cloned()
    }

    pub(crate) fn tso(&self) -> Option<u64> {
        self.inner.lock().tso
    }
}

impl std::fmt::Debug for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("RequestStatus")
            .field("kind", &self.kind)
            .field("finished", &inner.finished)
            .field("ok", &inner.ok)
            .field("error", &inner.error)
            .finish()
    }
}

/// Rows and metadata for one request.
///
/// In buffered mode the whole result is drained before the caller sees it.
/// In streaming mode rows are pulled lazily under token flow control: the
/// stream grants `default_token` more credits whenever the window runs dry.
pub struct ResultStream {
    session: Arc<Session>,
    status: Arc<RequestStatus>,
    rx: mpsc::UnboundedReceiver<ServerMessage>,
    columns: Vec<Column>,
    meta_seen: bool,
    buffered: VecDeque<Vec<Scalar>>,
    fetched: u64,
    streaming: bool,
    /// Tokens granted to the server and not yet consumed by received rows
    outstanding: u32,
    default_token: u32,
    timeout: Duration,
}

impl std::fmt::Debug for ResultStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStream")
            .field("status", &self.status)
            .field("columns", &self.columns)
            .field("meta_seen", &self.meta_seen)
            .field("fetched", &self.fetched)
            .field("streaming", &self.streaming)
            .field("outstanding", &self.outstanding)
            .field("default_token", &self.default_token)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ResultStream {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        session: Arc<Session>,
        status: Arc<RequestStatus>,
        rx: mpsc::UnboundedReceiver<ServerMessage>,
        streaming: bool,
        initial_token: u32,
        default_token: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            session,
            status,
            rx,
            columns: Vec::new(),
            meta_seen: false,
            buffered: VecDeque::new(),
            fetched: 0,
            streaming,
            outstanding: initial_token,
            default_token,
            timeout,
        }
    }

    pub fn status(&self) -> &Arc<RequestStatus> {
        &self.status
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn affected_rows(&self) -> u64 {
        self.status.affected_rows()
    }

    pub fn last_insert_id(&self) -> u64 {
        self.status.last_insert_id()
    }

    pub fn warnings(&self) -> Vec<Warning> {
        self.status.warnings()
    }

    pub fn is_good_and_done(&self) -> bool {
        self.status.is_good_and_done()
    }

    /// Rows handed to the caller so far.
    pub fn fetched_rows(&self) -> u64 {
        self.fetched
    }

    /// Pull the next row. Returns `None` after a successful terminal frame;
    /// an error terminal is surfaced here and recorded as the session's last
    /// exception.
    pub async fn next_row(&mut self) -> Result<Option<Vec<Scalar>>> {
        if let Some(row) = self.buffered.pop_front() {
            self.fetched += 1;
            return Ok(Some(row));
        }
        match self.advance().await {
            Ok(Some(row)) => {
                self.fetched += 1;
                Ok(Some(row))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                self.session.record_error(&err);
                Err(err)
            }
        }
    }

    /// Consume inbound frames until a row or the terminal frame.
    async fn advance(&mut self) -> Result<Option<Vec<Scalar>>> {
        loop {
            if self.streaming && self.outstanding == 0 && !self.status.is_done() {
                self.session
                    .token_offer(self.default_token, self.timeout)
                    .await?;
                self.outstanding += self.default_token;
            }
            let msg = match tokio::time::timeout(self.timeout, self.rx.recv()).await {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    // Channel closed: terminal already applied, or the
                    // transport failed and the status carries the reason.
                    if let Some(err) = self.status.error() {
                        return Err(err);
                    }
                    return Ok(None);
                }
                Err(_) => {
                    // No server-side progress: deferred cancel.
                    debug!(timeout = ?self.timeout, "result pull timed out, cancelling");
                    let _ = self.session.cancel(self.timeout).await;
                    return Err(Error::Timeout(self.timeout));
                }
            };
            match msg {
                ServerMessage::ColumnMeta(meta) => {
                    self.columns = meta.columns;
                    self.meta_seen = true;
                }
                ServerMessage::Row(row) => {
                    if self.streaming {
                        self.outstanding = self.outstanding.saturating_sub(1);
                    }
                    return Ok(Some(row.fields));
                }
                terminal if terminal.is_terminal() => {
                    // Status was updated by the transport before delivery.
                    if let Some(err) = self.status.error() {
                        return Err(err);
                    }
                    return Ok(None);
                }
                other => {
                    debug!(message = ?other, "ignoring frame in result stream");
                }
            }
        }
    }

    /// Eagerly drain the whole result (buffered mode).
    pub(crate) async fn buffer_all(&mut self) -> Result<()> {
        let mut rows = VecDeque::new();
        loop {
            match self.advance().await {
                Ok(Some(row)) => rows.push_back(row),
                Ok(None) => break,
                Err(err) => {
                    self.session.record_error(&err);
                    return Err(err);
                }
            }
        }
        self.buffered = rows;
        Ok(())
    }

    /// Wait until column metadata has arrived (stream mode returns to the
    /// caller at this point). A row seen first is kept for the next pull.
    pub(crate) async fn wait_metadata(&mut self) -> Result<()> {
        while !self.meta_seen && !self.status.is_done() {
            match self.advance().await {
                Ok(Some(row)) => {
                    self.buffered.push_back(row);
                    if self.meta_seen {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    self.session.record_error(&err);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Grant the server another window of row-chunk credits.
    pub async fn token_offer(&mut self, count: u32) -> Result<()> {
        if count == 0 {
            return Err(Error::InvalidArgument("token count must be positive".into()));
        }
        self.session.token_offer(count, self.timeout).await?;
        self.outstanding += count;
        Ok(())
    }
}
