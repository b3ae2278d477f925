//! Physical connection to a storage node.
//!
//! One TCP socket, one reader task, serialized writers. Many sessions
//! multiplex onto the socket; inbound frames are routed to the session whose
//! request currently owns the packet stream for its session-id slot.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, error, warn};

use crate::config::{KeepaliveConfig, TargetConfig};
use crate::error::{Error, Result};
use crate::metrics::metrics;
use crate::protocol::{
    compute_auth_response, message::Auth, ClientMessage, CodecError, Frame, FrameCodec,
    NoticeBody, ServerMessage, SessionOpen,
};
use crate::result::{RequestKind, RequestStatus};
use crate::session::Session;

type Writer = SplitSink<Framed<TcpStream, FrameCodec>, Frame>;
type Reader = SplitStream<Framed<TcpStream, FrameCodec>>;

/// Inbound delivery target for one in-flight request.
struct OwnerSlot {
    tx: mpsc::UnboundedSender<ServerMessage>,
    status: Arc<RequestStatus>,
}

/// A live TCP connection to a target, multiplexing sessions.
pub struct Transport {
    target: TargetConfig,
    keepalive: KeepaliveConfig,
    /// Capability bits from the greeting
    capabilities: u32,
    /// Single-writer send path
    writer: Mutex<Writer>,
    /// Per-session FIFO of packet owners
    slots: DashMap<u64, VecDeque<OwnerSlot>>,
    /// Live sessions, for idle scans and notice routing
    sessions: parking_lot::Mutex<HashMap<u64, Arc<Session>>>,
    next_session_id: AtomicU64,
    /// Live sessions plus reservations not yet opened
    session_count: AtomicUsize,
    epoch: Instant,
    last_send_ms: AtomicU64,
    last_recv_ms: AtomicU64,
    dead: AtomicBool,
    dead_reason: parking_lot::Mutex<Option<String>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Transport {
    /// Connect, read the greeting and authenticate, then start the reader
    /// and keepalive tasks.
    pub async fn connect(
        target: TargetConfig,
        keepalive: KeepaliveConfig,
        timeout: Duration,
    ) -> Result<Arc<Self>> {
        let addr = target.addr();
        debug!(addr = %addr, "connecting to storage node");

        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Timeout(timeout))?
            .map_err(|e| {
                error!(addr = %addr, error = %e, "failed to connect to storage node");
                Error::transport(e)
            })?;
        stream.set_nodelay(true).ok();

        let mut framed = Framed::new(stream, FrameCodec);

        let greeting = match recv_setup(&mut framed, timeout).await? {
            ServerMessage::Greeting(g) => g,
            other => {
                return Err(Error::Transport(format!(
                    "expected greeting, got {other:?}"
                )))
            }
        };
        debug!(addr = %addr, version = %greeting.version, "received greeting");

        let auth_response = compute_auth_response(&target.password, &greeting.nonce);
        framed
            .send(
                ClientMessage::Auth(Auth {
                    username: target.user.clone(),
                    auth_response: auth_response.into(),
                    schema: target.schema.clone(),
                })
                .encode(),
            )
            .await
            .map_err(map_codec)?;

        match recv_setup(&mut framed, timeout).await? {
            ServerMessage::Ok(_) => {}
            ServerMessage::Error(e) => {
                error!(addr = %addr, code = e.code, message = %e.message, "authentication failed");
                return Err(Error::Server {
                    code: e.code,
                    sql_state: e.sql_state,
                    message: e.message,
                    fatal: true,
                });
            }
            other => {
                return Err(Error::Transport(format!(
                    "unexpected auth reply: {other:?}"
                )))
            }
        }
        debug!(addr = %addr, "storage node authentication successful");

        let (writer, reader) = framed.split();
        let transport = Arc::new(Self {
            target,
            keepalive,
            capabilities: greeting.capabilities,
            writer: Mutex::new(writer),
            slots: DashMap::new(),
            sessions: parking_lot::Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            session_count: AtomicUsize::new(0),
            epoch: Instant::now(),
            last_send_ms: AtomicU64::new(0),
            last_recv_ms: AtomicU64::new(0),
            dead: AtomicBool::new(false),
            dead_reason: parking_lot::Mutex::new(None),
            tasks: parking_lot::Mutex::new(Vec::new()),
        });

        let read_task = {
            let t = transport.clone();
            tokio::spawn(async move { t.read_loop(reader).await })
        };
        let keepalive_task = {
            let t = transport.clone();
            tokio::spawn(async move { t.keepalive_loop().await })
        };
        transport.tasks.lock().extend([read_task, keepalive_task]);

        metrics().record_transport_opened();
        Ok(transport)
    }

    pub fn addr(&self) -> String {
        self.target.addr()
    }

    pub fn capabilities(&self) -> u32 {
        self.capabilities
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    fn dead_error(&self) -> Error {
        let reason = self.dead_reason.lock().clone();
        Error::Transport(reason.unwrap_or_else(|| "transport closed".into()))
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn touch_send(&self) {
        self.last_send_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    fn touch_recv(&self) {
        self.last_recv_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    fn send_age(&self) -> Duration {
        Duration::from_millis(self.now_ms() - self.last_send_ms.load(Ordering::Relaxed))
    }

    fn recv_age(&self) -> Duration {
        Duration::from_millis(self.now_ms() - self.last_recv_ms.load(Ordering::Relaxed))
    }

    /// Time since any frame moved in either direction.
    pub fn idle_duration(&self) -> Duration {
        self.send_age().min(self.recv_age())
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    /// Serialized write of one frame. A send failure is fatal to the
    /// transport.
    pub(crate) async fn send(&self, message: &ClientMessage, timeout: Duration) -> Result<()> {
        if self.is_dead() {
            return Err(self.dead_error());
        }
        let frame = message.encode();
        let result = tokio::time::timeout(timeout, async {
            let mut writer = self.writer.lock().await;
            writer.send(frame).await
        })
        .await;
        match result {
            Ok(Ok(())) => {
                self.touch_send();
                Ok(())
            }
            Ok(Err(e)) => {
                let err = map_codec(e);
                self.fail(err.clone());
                Err(err)
            }
            Err(_) => {
                let err = Error::Timeout(timeout);
                self.fail(Error::Transport(format!(
                    "write stalled for {timeout:?}"
                )));
                Err(err)
            }
        }
    }

    /// Flush any socket-buffered bytes.
    pub(crate) async fn flush(&self, timeout: Duration) -> Result<()> {
        if self.is_dead() {
            return Err(self.dead_error());
        }
        tokio::time::timeout(timeout, async {
            let mut writer = self.writer.lock().await;
            writer.flush().await
        })
        .await
        .map_err(|_| Error::Timeout(timeout))?
        .map_err(|e| {
            let err = map_codec(e);
            self.fail(err.clone());
            err
        })
    }

    // ------------------------------------------------------------------
    // Packet ownership
    // ------------------------------------------------------------------

    /// Register a request as the (eventual) packet owner for its session.
    pub(crate) fn register_owner(
        &self,
        session_id: u64,
        status: Arc<RequestStatus>,
    ) -> Result<mpsc::UnboundedReceiver<ServerMessage>> {
        if self.is_dead() {
            return Err(self.dead_error());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.slots
            .entry(session_id)
            .or_default()
            .push_back(OwnerSlot { tx, status });
        Ok(rx)
    }

    /// Remove a registered owner whose request was never sent.
    pub(crate) fn abandon_owner(&self, session_id: u64, status: &Arc<RequestStatus>) {
        if let Some(mut queue) = self.slots.get_mut(&session_id) {
            queue.retain(|slot| !Arc::ptr_eq(&slot.status, status));
        }
    }

    /// Fail every queued request of one session and clear its slots.
    pub(crate) fn poison_session(&self, session_id: u64, err: Error) {
        if let Some((_, queue)) = self.slots.remove(&session_id) {
            for slot in queue {
                slot.status.fail(err.clone());
            }
        }
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    async fn read_loop(self: Arc<Self>, mut reader: Reader) {
        loop {
            match reader.next().await {
                Some(Ok(frame)) => {
                    self.touch_recv();
                    match ServerMessage::parse(&frame) {
                        // Server keepalive probes are answered inline.
                        Ok(ServerMessage::Ping) => {
                            let reply = self.keepalive.timeout();
                            if self.send(&ClientMessage::Pong, reply).await.is_err() {
                                break;
                            }
                        }
                        Ok(msg) => self.dispatch(msg),
                        Err(e) => {
                            self.fail(Error::Frame(e));
                            break;
                        }
                    }
                }
                Some(Err(e)) => {
                    self.fail(map_codec(e));
                    break;
                }
                None => {
                    self.fail(Error::Transport("connection closed by server".into()));
                    break;
                }
            }
        }
    }

    fn dispatch(&self, msg: ServerMessage) {
        // Connection-scope traffic is handled inline.
        match &msg {
            ServerMessage::Ping | ServerMessage::Pong => return,
            ServerMessage::Greeting(_) => {
                warn!(addr = %self.addr(), "unexpected greeting mid-stream");
                return;
            }
            ServerMessage::Notice(notice) => {
                match &notice.body {
                    NoticeBody::SessionKilled => {
                        let session = self.sessions.lock().get(&notice.session_id).cloned();
                        if let Some(session) = session {
                            session.mark_killed();
                        }
                        self.poison_session(notice.session_id, Error::SessionKilled);
                    }
                    NoticeBody::Warning { code, message } => {
                        if notice.session_id == 0 {
                            warn!(addr = %self.addr(), code, message = %message, "server warning");
                        } else if let Some(queue) = self.slots.get(&notice.session_id) {
                            if let Some(slot) = queue.front() {
                                slot.status.push_warning(*code, message.clone());
                            }
                        } else {
                            debug!(
                                session_id = notice.session_id,
                                code, "warning with no packet owner"
                            );
                        }
                    }
                    NoticeBody::TxnStateChanged { active } => {
                        let session = self.sessions.lock().get(&notice.session_id).cloned();
                        if let Some(session) = session {
                            session.observe_txn_state(*active);
                        }
                    }
                    NoticeBody::SessionVariableChanged { name, value } => {
                        // Untracked server-side changes are not reconciled.
                        debug!(
                            session_id = notice.session_id,
                            name = %name,
                            value = %value,
                            "session variable changed server-side"
                        );
                    }
                }
                return;
            }
            _ => {}
        }

        let session_id = msg.session_id();
        let terminal = msg.is_terminal();
        match self.slots.get_mut(&session_id) {
            Some(mut queue) => {
                let delivered = if let Some(slot) = queue.front() {
                    if terminal {
                        slot.status.apply_terminal(&msg);
                    }
                    let _ = slot.tx.send(msg);
                    true
                } else {
                    debug!(session_id, "frame with no packet owner");
                    false
                };
                // Terminal frames rotate packet ownership to the next
                // queued request.
                if delivered && terminal {
                    queue.pop_front();
                }
            }
            None => debug!(session_id, "frame for unknown session"),
        }
    }

    /// Fail the transport: every in-flight request on every session errors,
    /// every session is marked dead, the socket is torn down. No retry.
    pub(crate) fn fail(&self, err: Error) {
        if self.dead.swap(true, Ordering::SeqCst) {
            return;
        }
        error!(addr = %self.addr(), error = %err, "transport failed");
        *self.dead_reason.lock() = Some(err.to_string());

        let mut queues = Vec::new();
        for entry in self.slots.iter() {
            queues.push(*entry.key());
        }
        for session_id in queues {
            if let Some((_, queue)) = self.slots.remove(&session_id) {
                for slot in queue {
                    slot.status.fail(err.clone());
                }
            }
        }

        let sessions: Vec<_> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.mark_dead();
            metrics().record_session_closed();
        }
        metrics().record_transport_closed();
    }

    /// Stop background tasks; used when the pool discards the transport.
    pub(crate) fn shutdown(&self) {
        if !self.dead.swap(true, Ordering::SeqCst) {
            *self.dead_reason.lock() = Some("transport shut down".into());
            let sessions: Vec<_> = self.sessions.lock().drain().map(|(_, s)| s).collect();
            for session in sessions {
                session.mark_dead();
                metrics().record_session_closed();
            }
            metrics().record_transport_closed();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    async fn keepalive_loop(self: Arc<Self>) {
        let interval = self.keepalive.interval();
        let reply = self.keepalive.timeout();
        let tick = (interval / 4).max(Duration::from_millis(10));
        loop {
            tokio::time::sleep(tick).await;
            if self.is_dead() {
                break;
            }
            if self.send_age() >= interval && self.recv_age() >= interval {
                debug!(addr = %self.addr(), "transport idle, sending keepalive probe");
                if self.send(&ClientMessage::Ping, reply).await.is_err() {
                    break;
                }
                tokio::time::sleep(reply).await;
                if self.recv_age() >= reply {
                    self.fail(Error::Transport("keepalive probe unanswered".into()));
                    break;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    /// Reserve a session slot if under `max` live sessions.
    pub(crate) fn try_reserve_session(&self, max: usize) -> bool {
        self.session_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                (count < max).then_some(count + 1)
            })
            .is_ok()
    }

    pub(crate) fn release_session_reservation(&self) {
        self.session_count.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn session_total(&self) -> usize {
        self.session_count.load(Ordering::SeqCst)
    }

    /// Open a new session on a reserved slot.
    pub(crate) async fn open_session(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Result<Arc<Session>> {
        let session_id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let status = RequestStatus::new(RequestKind::Admin, None, false);
        let _rx = self.register_owner(session_id, status.clone())?;

        let open = ClientMessage::SessionOpen(SessionOpen {
            session_id,
            schema: self.target.schema.clone(),
        });
        if let Err(e) = self.send(&open, timeout).await {
            self.abandon_owner(session_id, &status);
            return Err(e);
        }
        if let Err(e) = status.wait_done(timeout).await {
            self.abandon_owner(session_id, &status);
            let _ = self
                .send(&ClientMessage::SessionClose { session_id }, timeout)
                .await;
            return Err(e);
        }
        if let Some(err) = status.error() {
            return Err(err);
        }

        let session = Session::new(
            session_id,
            Arc::downgrade(self),
            self.target.schema.clone(),
            self.capabilities,
        );
        self.sessions.lock().insert(session_id, session.clone());
        metrics().record_session_opened();
        debug!(addr = %self.addr(), session_id, "session opened");
        Ok(session)
    }

    /// Whether a released session may go back to the idle set.
    pub(crate) fn reuse_session(&self, session: &Arc<Session>) -> bool {
        !self.is_dead() && session.reusable()
    }

    /// Destroy a session: best-effort close on the wire, fail anything still
    /// queued, forget it.
    pub(crate) async fn drop_session(&self, session: &Arc<Session>, timeout: Duration) {
        let session_id = session.id();
        session.mark_dead();
        self.poison_session(session_id, Error::Closed);
        if self.sessions.lock().remove(&session_id).is_some() {
            self.release_session_reservation();
            metrics().record_session_closed();
        }
        if !self.is_dead() {
            let _ = self
                .send(&ClientMessage::SessionClose { session_id }, timeout)
                .await;
        }
        debug!(addr = %self.addr(), session_id, "session dropped");
    }

    /// Claim an idle session for a new handle.
    pub(crate) fn find_idle_session(&self) -> Option<Arc<Session>> {
        let sessions = self.sessions.lock();
        sessions.values().find(|s| s.try_claim()).cloned()
    }

    pub(crate) fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().values().cloned().collect()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("addr", &self.target.addr())
            .field("sessions", &self.session_total())
            .field("dead", &self.is_dead())
            .finish()
    }
}

/// Read one setup-phase message directly, before the reader task exists.
async fn recv_setup(
    framed: &mut Framed<TcpStream, FrameCodec>,
    timeout: Duration,
) -> Result<ServerMessage> {
    let frame = tokio::time::timeout(timeout, framed.next())
        .await
        .map_err(|_| Error::Timeout(timeout))?
        .ok_or_else(|| Error::Transport("connection closed during setup".into()))?
        .map_err(map_codec)?;
    Ok(ServerMessage::parse(&frame)?)
}

fn map_codec(e: CodecError) -> Error {
    match e {
        CodecError::Frame(f) => Error::Frame(f),
        CodecError::Io(io) => Error::Transport(io.to_string()),
    }
}
