//! Typed message set layered over [`Frame`].
//!
//! Every session-scope payload begins with a big-endian `u64` session id;
//! id 0 is connection scope. Fields follow in fixed order, variable-length
//! ones with a 4-byte length prefix.

use bytes::{BufMut, Bytes, BytesMut};

use super::frame::{Frame, FrameError};
use super::value::{
    get_blob, get_opt_blob, get_opt_string, get_string, get_u16, get_u32, get_u64, get_u8,
    put_blob, put_opt_blob, put_opt_str, put_str, Scalar,
};

/// Message type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    // client -> server
    Auth = 0x01,
    SessionOpen = 0x02,
    SessionClose = 0x03,
    SessionReset = 0x04,
    ExecSql = 0x05,
    ExecPlan = 0x06,
    GalaxyPrepare = 0x07,
    TokenOffer = 0x08,
    Cancel = 0x09,
    TsoRequest = 0x0a,
    Ping = 0x0b,
    // server -> client
    Greeting = 0x20,
    SessionOpenOk = 0x21,
    ColumnMeta = 0x22,
    Row = 0x23,
    Ok = 0x24,
    Eof = 0x25,
    Error = 0x26,
    Notice = 0x27,
    TsoResponse = 0x28,
    Pong = 0x29,
    Unknown = 0xff,
}

impl From<u8> for MsgType {
    fn from(value: u8) -> Self {
        match value {
            0x01 => MsgType::Auth,
            0x02 => MsgType::SessionOpen,
            0x03 => MsgType::SessionClose,
            0x04 => MsgType::SessionReset,
            0x05 => MsgType::ExecSql,
            0x06 => MsgType::ExecPlan,
            0x07 => MsgType::GalaxyPrepare,
            0x08 => MsgType::TokenOffer,
            0x09 => MsgType::Cancel,
            0x0a => MsgType::TsoRequest,
            0x0b => MsgType::Ping,
            0x20 => MsgType::Greeting,
            0x21 => MsgType::SessionOpenOk,
            0x22 => MsgType::ColumnMeta,
            0x23 => MsgType::Row,
            0x24 => MsgType::Ok,
            0x25 => MsgType::Eof,
            0x26 => MsgType::Error,
            0x27 => MsgType::Notice,
            0x28 => MsgType::TsoResponse,
            0x29 => MsgType::Pong,
            _ => MsgType::Unknown,
        }
    }
}

/// Server capability bits advertised in the greeting
pub mod capabilities {
    pub const MESSAGE_TIMESTAMP: u32 = 1;
    pub const SINGLE_SHARD_OPTIMIZATION: u32 = 1 << 1;
    pub const RAW_STRING: u32 = 1 << 2;
    pub const CHUNK_RESULT: u32 = 1 << 3;
    pub const FEEDBACK: u32 = 1 << 4;

    pub const ALL: u32 =
        MESSAGE_TIMESTAMP | SINGLE_SHARD_OPTIMIZATION | RAW_STRING | CHUNK_RESULT | FEEDBACK;
}

/// Transaction metadata piggy-backed on the next user request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LazyTxn {
    /// Commit-timestamp transaction; defers the begin round trip
    pub cts: bool,
    pub snapshot_seq: Option<u64>,
    pub commit_seq: Option<u64>,
}

impl LazyTxn {
    pub fn is_empty(&self) -> bool {
        !self.cts && self.snapshot_seq.is_none() && self.commit_seq.is_none()
    }

    fn write(&self, buf: &mut BytesMut) {
        let mut flags = 0u8;
        if self.cts {
            flags |= 0x01;
        }
        if self.snapshot_seq.is_some() {
            flags |= 0x02;
        }
        if self.commit_seq.is_some() {
            flags |= 0x04;
        }
        buf.put_u8(flags);
        if let Some(seq) = self.snapshot_seq {
            buf.put_u64(seq);
        }
        if let Some(seq) = self.commit_seq {
            buf.put_u64(seq);
        }
    }

    fn read(buf: &mut Bytes) -> Option<Self> {
        let flags = get_u8(buf)?;
        let snapshot_seq = if flags & 0x02 != 0 {
            Some(get_u64(buf)?)
        } else {
            None
        };
        let commit_seq = if flags & 0x04 != 0 {
            Some(get_u64(buf)?)
        } else {
            None
        };
        Some(Self {
            cts: flags & 0x01 != 0,
            snapshot_seq,
            commit_seq,
        })
    }
}

/// Per-request execution attributes shared by the exec message family.
#[derive(Debug, Clone, Default)]
pub struct ExecAttrs {
    /// Stream the result in chunks under token flow control
    pub chunked: bool,
    /// Initial token window when chunked
    pub token: u32,
    pub compact_metadata: bool,
    pub feedback: bool,
    pub schema: Option<String>,
    pub trace_id: Option<String>,
    pub txn: Option<LazyTxn>,
}

impl ExecAttrs {
    fn write(&self, buf: &mut BytesMut) {
        let mut flags = 0u8;
        if self.chunked {
            flags |= 0x01;
        }
        if self.compact_metadata {
            flags |= 0x02;
        }
        if self.feedback {
            flags |= 0x04;
        }
        if self.txn.is_some() {
            flags |= 0x08;
        }
        buf.put_u8(flags);
        buf.put_u32(self.token);
        put_opt_str(buf, &self.schema);
        put_opt_str(buf, &self.trace_id);
        if let Some(txn) = &self.txn {
            txn.write(buf);
        }
    }

    fn read(buf: &mut Bytes) -> Option<Self> {
        let flags = get_u8(buf)?;
        let token = get_u32(buf)?;
        let schema = get_opt_string(buf)?;
        let trace_id = get_opt_string(buf)?;
        let txn = if flags & 0x08 != 0 {
            Some(LazyTxn::read(buf)?)
        } else {
            None
        };
        Some(Self {
            chunked: flags & 0x01 != 0,
            token,
            compact_metadata: flags & 0x02 != 0,
            feedback: flags & 0x04 != 0,
            schema,
            trace_id,
            txn,
        })
    }
}

// ---------------------------------------------------------------------------
// Client messages
// ---------------------------------------------------------------------------

/// Connection-scope authentication, answering the greeting.
#[derive(Debug, Clone)]
pub struct Auth {
    pub username: String,
    pub auth_response: Bytes,
    pub schema: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionOpen {
    pub session_id: u64,
    pub schema: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExecSql {
    pub session_id: u64,
    pub stmt: Bytes,
    pub hint: Option<Bytes>,
    /// Server-side statement cache key
    pub digest: Option<Bytes>,
    pub args: Vec<Scalar>,
    /// Row-producing update selector
    pub returning: Option<String>,
    pub attrs: ExecAttrs,
}

#[derive(Debug, Clone)]
pub struct ExecPlan {
    pub session_id: u64,
    /// Opaque serialized plan
    pub plan: Bytes,
    pub digest: Option<Bytes>,
    pub args: Vec<Scalar>,
    pub attrs: ExecAttrs,
}

/// Table descriptor for a prepared-and-packed execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpTable {
    pub schema: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct GalaxyPrepare {
    pub session_id: u64,
    pub stmt: Bytes,
    pub hint: Option<Bytes>,
    pub digest: Option<Bytes>,
    pub tables: Vec<GpTable>,
    /// Pre-packed parameter block
    pub params: Bytes,
    pub param_count: u32,
    pub is_update: bool,
    pub attrs: ExecAttrs,
}

#[derive(Debug, Clone)]
pub struct TokenOffer {
    pub session_id: u64,
    pub token: u32,
}

#[derive(Debug, Clone)]
pub struct TsoRequest {
    pub session_id: u64,
    pub count: u32,
}

#[derive(Debug, Clone)]
pub enum ClientMessage {
    Auth(Auth),
    SessionOpen(SessionOpen),
    SessionClose { session_id: u64 },
    SessionReset { session_id: u64 },
    ExecSql(ExecSql),
    ExecPlan(ExecPlan),
    GalaxyPrepare(GalaxyPrepare),
    TokenOffer(TokenOffer),
    Cancel { session_id: u64 },
    Tso(TsoRequest),
    Ping,
    /// Reply to a server-originated keepalive probe
    Pong,
}

impl ClientMessage {
    pub fn session_id(&self) -> u64 {
        match self {
            ClientMessage::Auth(_) | ClientMessage::Ping | ClientMessage::Pong => 0,
            ClientMessage::SessionOpen(m) => m.session_id,
            ClientMessage::SessionClose { session_id }
            | ClientMessage::SessionReset { session_id }
            | ClientMessage::Cancel { session_id } => *session_id,
            ClientMessage::ExecSql(m) => m.session_id,
            ClientMessage::ExecPlan(m) => m.session_id,
            ClientMessage::GalaxyPrepare(m) => m.session_id,
            ClientMessage::TokenOffer(m) => m.session_id,
            ClientMessage::Tso(m) => m.session_id,
        }
    }

    pub fn encode(&self) -> Frame {
        let mut buf = BytesMut::new();
        let msg_type = match self {
            ClientMessage::Auth(m) => {
                put_str(&mut buf, &m.username);
                put_blob(&mut buf, &m.auth_response);
                put_opt_str(&mut buf, &m.schema);
                MsgType::Auth
            }
            ClientMessage::SessionOpen(m) => {
                buf.put_u64(m.session_id);
                put_opt_str(&mut buf, &m.schema);
                MsgType::SessionOpen
            }
            ClientMessage::SessionClose { session_id } => {
                buf.put_u64(*session_id);
                MsgType::SessionClose
            }
            ClientMessage::SessionReset { session_id } => {
                buf.put_u64(*session_id);
                MsgType::SessionReset
            }
            ClientMessage::ExecSql(m) => {
                buf.put_u64(m.session_id);
                put_blob(&mut buf, &m.stmt);
                put_opt_blob(&mut buf, &m.hint);
                put_opt_blob(&mut buf, &m.digest);
                buf.put_u32(m.args.len() as u32);
                for arg in &m.args {
                    arg.encode(&mut buf);
                }
                put_opt_str(&mut buf, &m.returning);
                m.attrs.write(&mut buf);
                MsgType::ExecSql
            }
            ClientMessage::ExecPlan(m) => {
                buf.put_u64(m.session_id);
                put_blob(&mut buf, &m.plan);
                put_opt_blob(&mut buf, &m.digest);
                buf.put_u32(m.args.len() as u32);
                for arg in &m.args {
                    arg.encode(&mut buf);
                }
                m.attrs.write(&mut buf);
                MsgType::ExecPlan
            }
            ClientMessage::GalaxyPrepare(m) => {
                buf.put_u64(m.session_id);
                put_blob(&mut buf, &m.stmt);
                put_opt_blob(&mut buf, &m.hint);
                put_opt_blob(&mut buf, &m.digest);
                buf.put_u32(m.tables.len() as u32);
                for table in &m.tables {
                    put_opt_str(&mut buf, &table.schema);
                    put_str(&mut buf, &table.name);
                }
                put_blob(&mut buf, &m.params);
                buf.put_u32(m.param_count);
                buf.put_u8(m.is_update as u8);
                m.attrs.write(&mut buf);
                MsgType::GalaxyPrepare
            }
            ClientMessage::TokenOffer(m) => {
                buf.put_u64(m.session_id);
                buf.put_u32(m.token);
                MsgType::TokenOffer
            }
            ClientMessage::Cancel { session_id } => {
                buf.put_u64(*session_id);
                MsgType::Cancel
            }
            ClientMessage::Tso(m) => {
                buf.put_u64(m.session_id);
                buf.put_u32(m.count);
                MsgType::TsoRequest
            }
            ClientMessage::Ping => MsgType::Ping,
            ClientMessage::Pong => MsgType::Pong,
        };
        Frame::new(msg_type as u8, buf.freeze())
    }

    pub fn parse(frame: &Frame) -> Result<Self, FrameError> {
        let mut buf = frame.payload.clone();
        let msg = match MsgType::from(frame.msg_type) {
            MsgType::Auth => ClientMessage::Auth(Auth {
                username: get_string(&mut buf).ok_or(FrameError::Malformed("auth"))?,
                auth_response: get_blob(&mut buf).ok_or(FrameError::Malformed("auth"))?,
                schema: get_opt_string(&mut buf).ok_or(FrameError::Malformed("auth"))?,
            }),
            MsgType::SessionOpen => {
                let session_id = get_u64(&mut buf).ok_or(FrameError::Malformed("session open"))?;
                let schema =
                    get_opt_string(&mut buf).ok_or(FrameError::Malformed("session open"))?;
                ClientMessage::SessionOpen(SessionOpen { session_id, schema })
            }
            MsgType::SessionClose => ClientMessage::SessionClose {
                session_id: get_u64(&mut buf).ok_or(FrameError::Malformed("session close"))?,
            },
            MsgType::SessionReset => ClientMessage::SessionReset {
                session_id: get_u64(&mut buf).ok_or(FrameError::Malformed("session reset"))?,
            },
            MsgType::ExecSql => {
                let e = FrameError::Malformed("exec sql");
                let session_id = get_u64(&mut buf).ok_or(e.clone())?;
                let stmt = get_blob(&mut buf).ok_or(e.clone())?;
                let hint = get_opt_blob(&mut buf).ok_or(e.clone())?;
                let digest = get_opt_blob(&mut buf).ok_or(e.clone())?;
                let args = read_args(&mut buf).ok_or(e.clone())?;
                let returning = get_opt_string(&mut buf).ok_or(e.clone())?;
                let attrs = ExecAttrs::read(&mut buf).ok_or(e)?;
                ClientMessage::ExecSql(ExecSql {
                    session_id,
                    stmt,
                    hint,
                    digest,
                    args,
                    returning,
                    attrs,
                })
            }
            MsgType::ExecPlan => {
                let e = FrameError::Malformed("exec plan");
                let session_id = get_u64(&mut buf).ok_or(e.clone())?;
                let plan = get_blob(&mut buf).ok_or(e.clone())?;
                let digest = get_opt_blob(&mut buf).ok_or(e.clone())?;
                let args = read_args(&mut buf).ok_or(e.clone())?;
                let attrs = ExecAttrs::read(&mut buf).ok_or(e)?;
                ClientMessage::ExecPlan(ExecPlan {
                    session_id,
                    plan,
                    digest,
                    args,
                    attrs,
                })
            }
            MsgType::GalaxyPrepare => {
                let e = FrameError::Malformed("galaxy prepare");
                let session_id = get_u64(&mut buf).ok_or(e.clone())?;
                let stmt = get_blob(&mut buf).ok_or(e.clone())?;
                let hint = get_opt_blob(&mut buf).ok_or(e.clone())?;
                let digest = get_opt_blob(&mut buf).ok_or(e.clone())?;
                let table_count = get_u32(&mut buf).ok_or(e.clone())? as usize;
                let mut tables = Vec::with_capacity(table_count);
                for _ in 0..table_count {
                    let schema = get_opt_string(&mut buf).ok_or(e.clone())?;
                    let name = get_string(&mut buf).ok_or(e.clone())?;
                    tables.push(GpTable { schema, name });
                }
                let params = get_blob(&mut buf).ok_or(e.clone())?;
                let param_count = get_u32(&mut buf).ok_or(e.clone())?;
                let is_update = get_u8(&mut buf).ok_or(e.clone())? != 0;
                let attrs = ExecAttrs::read(&mut buf).ok_or(e)?;
                ClientMessage::GalaxyPrepare(GalaxyPrepare {
                    session_id,
                    stmt,
                    hint,
                    digest,
                    tables,
                    params,
                    param_count,
                    is_update,
                    attrs,
                })
            }
            MsgType::TokenOffer => {
                let e = FrameError::Malformed("token offer");
                ClientMessage::TokenOffer(TokenOffer {
                    session_id: get_u64(&mut buf).ok_or(e.clone())?,
                    token: get_u32(&mut buf).ok_or(e)?,
                })
            }
            MsgType::Cancel => ClientMessage::Cancel {
                session_id: get_u64(&mut buf).ok_or(FrameError::Malformed("cancel"))?,
            },
            MsgType::TsoRequest => {
                let e = FrameError::Malformed("tso request");
                ClientMessage::Tso(TsoRequest {
                    session_id: get_u64(&mut buf).ok_or(e.clone())?,
                    count: get_u32(&mut buf).ok_or(e)?,
                })
            }
            MsgType::Ping => ClientMessage::Ping,
            MsgType::Pong => ClientMessage::Pong,
            _ => return Err(FrameError::UnexpectedType(frame.msg_type)),
        };
        Ok(msg)
    }
}

fn read_args(buf: &mut Bytes) -> Option<Vec<Scalar>> {
    let count = get_u32(buf)? as usize;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        args.push(Scalar::parse(buf)?);
    }
    Some(args)
}

// ---------------------------------------------------------------------------
// Server messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Greeting {
    pub version: String,
    pub nonce: Bytes,
    pub capabilities: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub table: Option<String>,
    pub schema: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ColumnMeta {
    pub session_id: u64,
    pub columns: Vec<Column>,
}

#[derive(Debug, Clone)]
pub struct Row {
    pub session_id: u64,
    pub fields: Vec<Scalar>,
}

/// Terminal frame for updates.
#[derive(Debug, Clone, Default)]
pub struct OkDone {
    pub session_id: u64,
    pub affected_rows: u64,
    pub last_insert_id: u64,
}

/// Terminal frame for row streams; carries affected rows for RETURNING.
#[derive(Debug, Clone, Default)]
pub struct Eof {
    pub session_id: u64,
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub warnings: u16,
}

#[derive(Debug, Clone)]
pub struct ServerError {
    pub session_id: u64,
    pub code: u32,
    pub sql_state: String,
    pub message: String,
    /// The session must not be reused when set
    pub fatal: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeBody {
    Warning { code: u32, message: String },
    SessionVariableChanged { name: String, value: String },
    SessionKilled,
    /// Server-side transaction began or ended
    TxnStateChanged { active: bool },
}

#[derive(Debug, Clone)]
pub struct Notice {
    pub session_id: u64,
    pub body: NoticeBody,
}

#[derive(Debug, Clone)]
pub struct TsoResponse {
    pub session_id: u64,
    pub timestamp: u64,
    pub error_code: u32,
}

#[derive(Debug, Clone)]
pub enum ServerMessage {
    Greeting(Greeting),
    SessionOpenOk { session_id: u64 },
    ColumnMeta(ColumnMeta),
    Row(Row),
    Ok(OkDone),
    Eof(Eof),
    Error(ServerError),
    Notice(Notice),
    Tso(TsoResponse),
    /// Server-originated keepalive probe; the transport answers inline
    Ping,
    Pong,
}

impl ServerMessage {
    pub fn session_id(&self) -> u64 {
        match self {
            ServerMessage::Greeting(_) | ServerMessage::Ping | ServerMessage::Pong => 0,
            ServerMessage::SessionOpenOk { session_id } => *session_id,
            ServerMessage::ColumnMeta(m) => m.session_id,
            ServerMessage::Row(m) => m.session_id,
            ServerMessage::Ok(m) => m.session_id,
            ServerMessage::Eof(m) => m.session_id,
            ServerMessage::Error(m) => m.session_id,
            ServerMessage::Notice(m) => m.session_id,
            ServerMessage::Tso(m) => m.session_id,
        }
    }

    /// Terminal frames end the current request and rotate packet ownership.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ServerMessage::SessionOpenOk { .. }
                | ServerMessage::Ok(_)
                | ServerMessage::Eof(_)
                | ServerMessage::Error(_)
                | ServerMessage::Tso(_)
        )
    }

    pub fn encode(&self) -> Frame {
        let mut buf = BytesMut::new();
        let msg_type = match self {
            ServerMessage::Greeting(m) => {
                put_str(&mut buf, &m.version);
                put_blob(&mut buf, &m.nonce);
                buf.put_u32(m.capabilities);
                MsgType::Greeting
            }
            ServerMessage::SessionOpenOk { session_id } => {
                buf.put_u64(*session_id);
                MsgType::SessionOpenOk
            }
            ServerMessage::ColumnMeta(m) => {
                buf.put_u64(m.session_id);
                buf.put_u32(m.columns.len() as u32);
                for column in &m.columns {
                    put_str(&mut buf, &column.name);
                    put_opt_str(&mut buf, &column.table);
                    put_opt_str(&mut buf, &column.schema);
                }
                MsgType::ColumnMeta
            }
            ServerMessage::Row(m) => {
                buf.put_u64(m.session_id);
                buf.put_u32(m.fields.len() as u32);
                for field in &m.fields {
                    field.encode(&mut buf);
                }
                MsgType::Row
            }
            ServerMessage::Ok(m) => {
                buf.put_u64(m.session_id);
                buf.put_u64(m.affected_rows);
                buf.put_u64(m.last_insert_id);
                MsgType::Ok
            }
            ServerMessage::Eof(m) => {
                buf.put_u64(m.session_id);
                buf.put_u64(m.affected_rows);
                buf.put_u64(m.last_insert_id);
                buf.put_u16(m.warnings);
                MsgType::Eof
            }
            ServerMessage::Error(m) => {
                buf.put_u64(m.session_id);
                buf.put_u32(m.code);
                put_str(&mut buf, &m.sql_state);
                put_str(&mut buf, &m.message);
                buf.put_u8(m.fatal as u8);
                MsgType::Error
            }
            ServerMessage::Notice(m) => {
                buf.put_u64(m.session_id);
                match &m.body {
                    NoticeBody::Warning { code, message } => {
                        buf.put_u8(0x01);
                        buf.put_u32(*code);
                        put_str(&mut buf, message);
                    }
                    NoticeBody::SessionVariableChanged { name, value } => {
                        buf.put_u8(0x02);
                        put_str(&mut buf, name);
                        put_str(&mut buf, value);
                    }
                    NoticeBody::SessionKilled => buf.put_u8(0x03),
                    NoticeBody::TxnStateChanged { active } => {
                        buf.put_u8(0x04);
                        buf.put_u8(*active as u8);
                    }
                }
                MsgType::Notice
            }
            ServerMessage::Tso(m) => {
                buf.put_u64(m.session_id);
                buf.put_u64(m.timestamp);
                buf.put_u32(m.error_code);
                MsgType::TsoResponse
            }
            ServerMessage::Ping => MsgType::Ping,
            ServerMessage::Pong => MsgType::Pong,
        };
        Frame::new(msg_type as u8, buf.freeze())
    }

    pub fn parse(frame: &Frame) -> Result<Self, FrameError> {
        let mut buf = frame.payload.clone();
        let msg = match MsgType::from(frame.msg_type) {
            MsgType::Greeting => {
                let e = FrameError::Malformed("greeting");
                ServerMessage::Greeting(Greeting {
                    version: get_string(&mut buf).ok_or(e.clone())?,
                    nonce: get_blob(&mut buf).ok_or(e.clone())?,
                    capabilities: get_u32(&mut buf).ok_or(e)?,
                })
            }
            MsgType::SessionOpenOk => ServerMessage::SessionOpenOk {
                session_id: get_u64(&mut buf).ok_or(FrameError::Malformed("session open ok"))?,
            },
            MsgType::ColumnMeta => {
                let e = FrameError::Malformed("column meta");
                let session_id = get_u64(&mut buf).ok_or(e.clone())?;
                let count = get_u32(&mut buf).ok_or(e.clone())? as usize;
                let mut columns = Vec::with_capacity(count);
                for _ in 0..count {
                    columns.push(Column {
                        name: get_string(&mut buf).ok_or(e.clone())?,
                        table: get_opt_string(&mut buf).ok_or(e.clone())?,
                        schema: get_opt_string(&mut buf).ok_or(e.clone())?,
                    });
                }
                ServerMessage::ColumnMeta(ColumnMeta {
                    session_id,
                    columns,
                })
            }
            MsgType::Row => {
                let e = FrameError::Malformed("row");
                let session_id = get_u64(&mut buf).ok_or(e.clone())?;
                let count = get_u32(&mut buf).ok_or(e.clone())? as usize;
                let mut fields = Vec::with_capacity(count);
                for _ in 0..count {
                    fields.push(Scalar::parse(&mut buf).ok_or(e.clone())?);
                }
                ServerMessage::Row(Row { session_id, fields })
            }
            MsgType::Ok => {
                let e = FrameError::Malformed("ok");
                ServerMessage::Ok(OkDone {
                    session_id: get_u64(&mut buf).ok_or(e.clone())?,
                    affected_rows: get_u64(&mut buf).ok_or(e.clone())?,
                    last_insert_id: get_u64(&mut buf).ok_or(e)?,
                })
            }
            MsgType::Eof => {
                let e = FrameError::Malformed("eof");
                ServerMessage::Eof(Eof {
                    session_id: get_u64(&mut buf).ok_or(e.clone())?,
                    affected_rows: get_u64(&mut buf).ok_or(e.clone())?,
                    last_insert_id: get_u64(&mut buf).ok_or(e.clone())?,
                    warnings: get_u16(&mut buf).ok_or(e)?,
                })
            }
            MsgType::Error => {
                let e = FrameError::Malformed("error");
                ServerMessage::Error(ServerError {
                    session_id: get_u64(&mut buf).ok_or(e.clone())?,
                    code: get_u32(&mut buf).ok_or(e.clone())?,
                    sql_state: get_string(&mut buf).ok_or(e.clone())?,
                    message: get_string(&mut buf).ok_or(e.clone())?,
                    fatal: get_u8(&mut buf).ok_or(e)? != 0,
                })
            }
            MsgType::Notice => {
                let e = FrameError::Malformed("notice");
                let session_id = get_u64(&mut buf).ok_or(e.clone())?;
                let body = match get_u8(&mut buf).ok_or(e.clone())? {
                    0x01 => NoticeBody::Warning {
                        code: get_u32(&mut buf).ok_or(e.clone())?,
                        message: get_string(&mut buf).ok_or(e.clone())?,
                    },
                    0x02 => NoticeBody::SessionVariableChanged {
                        name: get_string(&mut buf).ok_or(e.clone())?,
                        value: get_string(&mut buf).ok_or(e.clone())?,
                    },
                    0x03 => NoticeBody::SessionKilled,
                    0x04 => NoticeBody::TxnStateChanged {
                        active: get_u8(&mut buf).ok_or(e.clone())? != 0,
                    },
                    _ => return Err(e),
                };
                ServerMessage::Notice(Notice { session_id, body })
            }
            MsgType::TsoResponse => {
                let e = FrameError::Malformed("tso response");
                ServerMessage::Tso(TsoResponse {
                    session_id: get_u64(&mut buf).ok_or(e.clone())?,
                    timestamp: get_u64(&mut buf).ok_or(e.clone())?,
                    error_code: get_u32(&mut buf).ok_or(e)?,
                })
            }
            MsgType::Ping => ServerMessage::Ping,
            MsgType::Pong => ServerMessage::Pong,
            _ => return Err(FrameError::UnexpectedType(frame.msg_type)),
        };
        Ok(msg)
    }
}
