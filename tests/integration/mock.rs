//! In-process mock storage node speaking the driver's wire protocol.
//!
//! Behavior is keyed on statement text so tests can drive specific server
//! responses: `SELECT 1`, `SELECT * FROM big` (5 rows, token-aware),
//! `SELECT SLEEP(..)` (no reply until cancelled), `SELECT WARNING`,
//! `SELECT ERROR`, DML, transaction control and `SET` statements.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use hermes::protocol::auth::{verify_auth_response, NONCE_LEN};
use hermes::protocol::{
    capabilities, ClientMessage, Column, ColumnMeta, Eof, ExecAttrs, FrameCodec, Greeting,
    LazyTxn, Notice, NoticeBody, OkDone, Row, Scalar, ServerError, ServerMessage,
};

/// One exec message as observed by the server.
#[derive(Debug, Clone)]
pub struct LoggedExec {
    pub sql: String,
    pub schema: Option<String>,
    pub txn: Option<LazyTxn>,
    pub chunked: bool,
    pub token: u32,
    pub trace_id: Option<String>,
}

#[derive(Default)]
pub struct MockState {
    pub exec_log: parking_lot::Mutex<Vec<LoggedExec>>,
    pub rows_sent: AtomicU64,
    pub sessions_opened: AtomicU64,
    pub sessions_closed: AtomicU64,
    pub pings: AtomicU64,
    pub tso_counter: AtomicU64,
    connection_counter: AtomicU64,
}

impl MockState {
    pub fn logged_sql(&self) -> Vec<String> {
        self.exec_log.lock().iter().map(|e| e.sql.clone()).collect()
    }

    pub fn find_exec(&self, needle: &str) -> Option<LoggedExec> {
        self.exec_log
            .lock()
            .iter()
            .find(|e| e.sql.contains(needle))
            .cloned()
    }
}

pub struct MockServer {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
    accept_task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start(password: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(MockState::default());
        let password = password.to_string();

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let state = accept_state.clone();
                let password = password.clone();
                tokio::spawn(async move {
                    let _ = serve_connection(stream, state, &password).await;
                });
            }
        });

        Self {
            addr,
            state,
            accept_task,
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

struct SessState {
    autocommit: bool,
    in_txn: bool,
    conn_id: u64,
}

struct ActiveStream {
    rows: VecDeque<Vec<Scalar>>,
    /// Remaining row credits; `u32::MAX` means unchunked
    tokens: u32,
    affected: u64,
}

async fn serve_connection(
    stream: TcpStream,
    state: Arc<MockState>,
    password: &str,
) -> std::io::Result<()> {
    let mut framed = Framed::new(stream, FrameCodec);

    let nonce: [u8; NONCE_LEN] = rand::random();
    send(
        &mut framed,
        ServerMessage::Greeting(Greeting {
            version: "8.0.32-mock".into(),
            nonce: Bytes::copy_from_slice(&nonce),
            capabilities: capabilities::ALL,
        }),
    )
    .await;

    let verifier = hermes::protocol::auth::password_verifier(password);
    match recv(&mut framed).await {
        Some(ClientMessage::Auth(auth)) => {
            let ok = if password.is_empty() {
                auth.auth_response.is_empty()
            } else {
                verify_auth_response(&verifier, &nonce, &auth.auth_response)
            };
            if !ok {
                send(
                    &mut framed,
                    ServerMessage::Error(ServerError {
                        session_id: 0,
                        code: 1045,
                        sql_state: "28000".into(),
                        message: "Access denied".into(),
                        fatal: true,
                    }),
                )
                .await;
                return Ok(());
            }
            send(&mut framed, ServerMessage::Ok(OkDone::default())).await;
        }
        _ => return Ok(()),
    }

    let mut sessions: HashMap<u64, SessState> = HashMap::new();
    let mut active: HashMap<u64, ActiveStream> = HashMap::new();
    // Sessions parked in SELECT SLEEP, waiting for a cancel
    let mut sleeping: HashMap<u64, ()> = HashMap::new();

    while let Some(message) = recv(&mut framed).await {
        match message {
            ClientMessage::Ping => {
                state.pings.fetch_add(1, Ordering::SeqCst);
                send(&mut framed, ServerMessage::Pong).await;
            }
            ClientMessage::SessionOpen(open) => {
                let conn_id = state.connection_counter.fetch_add(1, Ordering::SeqCst) + 1000;
                sessions.insert(
                    open.session_id,
                    SessState {
                        autocommit: true,
                        in_txn: false,
                        conn_id,
                    },
                );
                state.sessions_opened.fetch_add(1, Ordering::SeqCst);
                send(
                    &mut framed,
                    ServerMessage::SessionOpenOk {
                        session_id: open.session_id,
                    },
                )
                .await;
            }
            ClientMessage::SessionClose { session_id } => {
                sessions.remove(&session_id);
                active.remove(&session_id);
                sleeping.remove(&session_id);
                state.sessions_closed.fetch_add(1, Ordering::SeqCst);
            }
            ClientMessage::SessionReset { session_id } => {
                if let Some(sess) = sessions.get_mut(&session_id) {
                    sess.autocommit = true;
                    sess.in_txn = false;
                }
                send(
                    &mut framed,
                    ServerMessage::Ok(OkDone {
                        session_id,
                        ..Default::default()
                    }),
                )
                .await;
            }
            ClientMessage::ExecSql(exec) => {
                let sql = String::from_utf8_lossy(&exec.stmt).to_string();
                state.exec_log.lock().push(LoggedExec {
                    sql: sql.clone(),
                    schema: exec.attrs.schema.clone(),
                    txn: exec.attrs.txn.clone(),
                    chunked: exec.attrs.chunked,
                    token: exec.attrs.token,
                    trace_id: exec.attrs.trace_id.clone(),
                });
                handle_exec(
                    &mut framed,
                    &state,
                    &mut sessions,
                    &mut active,
                    &mut sleeping,
                    exec.session_id,
                    &sql,
                    exec.returning.clone(),
                    &exec.attrs,
                )
                .await;
            }
            ClientMessage::ExecPlan(plan) => {
                let session_id = plan.session_id;
                begin_stream(
                    &mut framed,
                    &state,
                    &mut active,
                    session_id,
                    vec!["plan".into()],
                    vec![vec![Scalar::Utf8("plan-result".into())]],
                    0,
                    &plan.attrs,
                )
                .await;
            }
            ClientMessage::GalaxyPrepare(gp) => {
                let sql = String::from_utf8_lossy(&gp.stmt).to_string();
                state.exec_log.lock().push(LoggedExec {
                    sql,
                    schema: gp.attrs.schema.clone(),
                    txn: gp.attrs.txn.clone(),
                    chunked: gp.attrs.chunked,
                    token: gp.attrs.token,
                    trace_id: gp.attrs.trace_id.clone(),
                });
                if gp.is_update {
                    send(
                        &mut framed,
                        ServerMessage::Ok(OkDone {
                            session_id: gp.session_id,
                            affected_rows: gp.param_count as u64,
                            last_insert_id: 7,
                        }),
                    )
                    .await;
                } else {
                    begin_stream(
                        &mut framed,
                        &state,
                        &mut active,
                        gp.session_id,
                        vec!["v".into()],
                        vec![vec![Scalar::Int(1)]],
                        0,
                        &gp.attrs,
                    )
                    .await;
                }
            }
            ClientMessage::TokenOffer(offer) => {
                if let Some(stream) = active.get_mut(&offer.session_id) {
                    stream.tokens = stream.tokens.saturating_add(offer.token);
                }
                pump_stream(&mut framed, &state, &mut active, offer.session_id).await;
            }
            ClientMessage::Cancel { session_id } => {
                let interrupted = ServerMessage::Error(ServerError {
                    session_id,
                    code: 1317,
                    sql_state: "70100".into(),
                    message: "Query execution was interrupted".into(),
                    fatal: false,
                });
                if sleeping.remove(&session_id).is_some() || active.remove(&session_id).is_some() {
                    send(&mut framed, interrupted).await;
                }
            }
            ClientMessage::Tso(req) => {
                let base = state
                    .tso_counter
                    .fetch_add(req.count as u64, Ordering::SeqCst);
                send(
                    &mut framed,
                    ServerMessage::Tso(hermes::protocol::TsoResponse {
                        session_id: req.session_id,
                        timestamp: base + 1,
                        error_code: 0,
                    }),
                )
                .await;
            }
            ClientMessage::Auth(_) | ClientMessage::Pong => {}
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_exec(
    framed: &mut Framed<TcpStream, FrameCodec>,
    state: &Arc<MockState>,
    sessions: &mut HashMap<u64, SessState>,
    active: &mut HashMap<u64, ActiveStream>,
    sleeping: &mut HashMap<u64, ()>,
    session_id: u64,
    sql: &str,
    returning: Option<String>,
    attrs: &ExecAttrs,
) {
    let lower = sql.trim().to_lowercase();

    // A piggy-backed transaction envelope opens a transaction server-side.
    if attrs.txn.is_some() {
        if let Some(sess) = sessions.get_mut(&session_id) {
            if !sess.in_txn {
                sess.in_txn = true;
                send(
                    framed,
                    ServerMessage::Notice(Notice {
                        session_id,
                        body: NoticeBody::TxnStateChanged { active: true },
                    }),
                )
                .await;
            }
        }
    }

    if lower == "select 1" {
        begin_stream(
            framed,
            state,
            active,
            session_id,
            vec!["1".into()],
            vec![vec![Scalar::Int(1)]],
            0,
            attrs,
        )
        .await;
    } else if lower == "select connection_id()" {
        let conn_id = sessions.get(&session_id).map(|s| s.conn_id).unwrap_or(0);
        begin_stream(
            framed,
            state,
            active,
            session_id,
            vec!["CONNECTION_ID()".into()],
            vec![vec![Scalar::UInt(conn_id)]],
            0,
            attrs,
        )
        .await;
    } else if lower.starts_with("select sleep") {
        sleeping.insert(session_id, ());
    } else if lower == "select warning" {
        send(
            framed,
            ServerMessage::Notice(Notice {
                session_id,
                body: NoticeBody::Warning {
                    code: 1265,
                    message: "Data truncated".into(),
                },
            }),
        )
        .await;
        begin_stream(
            framed,
            state,
            active,
            session_id,
            vec!["v".into()],
            vec![vec![Scalar::Int(1)]],
            0,
            attrs,
        )
        .await;
    } else if lower == "select error" {
        send(
            framed,
            ServerMessage::Error(ServerError {
                session_id,
                code: 1064,
                sql_state: "42000".into(),
                message: "You have an error in your SQL syntax".into(),
                fatal: false,
            }),
        )
        .await;
    } else if lower == "select die" {
        // Storage node goes away mid-request.
        let _ = framed.close().await;
    } else if lower.starts_with("select * from big") {
        let rows = (0..5).map(|i| vec![Scalar::Int(i)]).collect();
        begin_stream(
            framed,
            state,
            active,
            session_id,
            vec!["v".into()],
            rows,
            0,
            attrs,
        )
        .await;
    } else if lower.starts_with("select") {
        begin_stream(
            framed,
            state,
            active,
            session_id,
            vec!["v".into()],
            Vec::new(),
            0,
            attrs,
        )
        .await;
    } else if lower == "begin" || lower == "start transaction" {
        set_txn(framed, sessions, session_id, true).await;
        send(
            framed,
            ServerMessage::Ok(OkDone {
                session_id,
                ..Default::default()
            }),
        )
        .await;
    } else if lower == "commit" || lower == "rollback" {
        set_txn(framed, sessions, session_id, false).await;
        send(
            framed,
            ServerMessage::Ok(OkDone {
                session_id,
                ..Default::default()
            }),
        )
        .await;
    } else if lower.starts_with("set autocommit") {
        let on = lower.ends_with('1');
        if let Some(sess) = sessions.get_mut(&session_id) {
            sess.autocommit = on;
        }
        if on {
            set_txn(framed, sessions, session_id, false).await;
        }
        send(
            framed,
            ServerMessage::Ok(OkDone {
                session_id,
                ..Default::default()
            }),
        )
        .await;
    } else if lower.starts_with("set") {
        send(
            framed,
            ServerMessage::Ok(OkDone {
                session_id,
                ..Default::default()
            }),
        )
        .await;
    } else if lower.starts_with("insert") || lower.starts_with("update") || lower.starts_with("delete")
    {
        let autocommit = sessions.get(&session_id).map(|s| s.autocommit).unwrap_or(true);
        if !autocommit {
            set_txn(framed, sessions, session_id, true).await;
        }
        if let Some(returning) = returning {
            let rows = vec![vec![Scalar::Utf8(returning.clone())]];
            begin_stream(
                framed,
                state,
                active,
                session_id,
                vec![returning],
                rows,
                1,
                attrs,
            )
            .await;
        } else {
            send(
                framed,
                ServerMessage::Ok(OkDone {
                    session_id,
                    affected_rows: 1,
                    last_insert_id: 42,
                }),
            )
            .await;
        }
    } else {
        send(
            framed,
            ServerMessage::Ok(OkDone {
                session_id,
                ..Default::default()
            }),
        )
        .await;
    }
}

async fn set_txn(
    framed: &mut Framed<TcpStream, FrameCodec>,
    sessions: &mut HashMap<u64, SessState>,
    session_id: u64,
    active: bool,
) {
    if let Some(sess) = sessions.get_mut(&session_id) {
        if sess.in_txn != active {
            sess.in_txn = active;
            send(
                framed,
                ServerMessage::Notice(Notice {
                    session_id,
                    body: NoticeBody::TxnStateChanged { active },
                }),
            )
            .await;
        }
    }
}

/// Send metadata, then rows under the token regime, then Eof once drained.
#[allow(clippy::too_many_arguments)]
async fn begin_stream(
    framed: &mut Framed<TcpStream, FrameCodec>,
    state: &Arc<MockState>,
    active: &mut HashMap<u64, ActiveStream>,
    session_id: u64,
    columns: Vec<String>,
    rows: Vec<Vec<Scalar>>,
    affected: u64,
    attrs: &ExecAttrs,
) {
    let columns = columns
        .into_iter()
        .map(|name| Column {
            name,
            table: if attrs.compact_metadata {
                None
            } else {
                Some("t".into())
            },
            schema: if attrs.compact_metadata {
                None
            } else {
                attrs.schema.clone()
            },
        })
        .collect();
    send(
        framed,
        ServerMessage::ColumnMeta(ColumnMeta {
            session_id,
            columns,
        }),
    )
    .await;

    let tokens = if attrs.chunked && attrs.token > 0 {
        attrs.token
    } else {
        u32::MAX
    };
    active.insert(
        session_id,
        ActiveStream {
            rows: rows.into(),
            tokens,
            affected,
        },
    );
    pump_stream(framed, state, active, session_id).await;
}

async fn pump_stream(
    framed: &mut Framed<TcpStream, FrameCodec>,
    state: &Arc<MockState>,
    active: &mut HashMap<u64, ActiveStream>,
    session_id: u64,
) {
    let Some(stream) = active.get_mut(&session_id) else {
        return;
    };
    while stream.tokens > 0 {
        let Some(fields) = stream.rows.pop_front() else {
            break;
        };
        if stream.tokens != u32::MAX {
            stream.tokens -= 1;
        }
        state.rows_sent.fetch_add(1, Ordering::SeqCst);
        send(
            framed,
            ServerMessage::Row(Row { session_id, fields }),
        )
        .await;
    }
    if stream.rows.is_empty() {
        let affected = stream.affected;
        active.remove(&session_id);
        send(
            framed,
            ServerMessage::Eof(Eof {
                session_id,
                affected_rows: affected,
                last_insert_id: 0,
                warnings: 0,
            }),
        )
        .await;
    }
}

async fn send(framed: &mut Framed<TcpStream, FrameCodec>, msg: ServerMessage) {
    let _ = framed.send(msg.encode()).await;
}

async fn recv(framed: &mut Framed<TcpStream, FrameCodec>) -> Option<ClientMessage> {
    loop {
        match framed.next().await {
            Some(Ok(frame)) => match ClientMessage::parse(&frame) {
                Ok(msg) => return Some(msg),
                Err(_) => continue,
            },
            Some(Err(_)) | None => return None,
        }
    }
}
