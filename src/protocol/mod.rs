pub mod auth;
pub mod codec;
pub mod frame;
pub mod message;
pub mod value;

pub use auth::compute_auth_response;
pub use codec::{CodecError, FrameCodec};
pub use frame::{Frame, FrameError, FRAME_HEADER_SIZE, MAX_FRAME_LENGTH};
pub use message::{
    capabilities, ClientMessage, Column, ColumnMeta, Eof, ExecAttrs, ExecPlan, ExecSql,
    GalaxyPrepare, GpTable, Greeting, LazyTxn, MsgType, Notice, NoticeBody, OkDone, Row,
    ServerError, ServerMessage, SessionOpen, TokenOffer, TsoRequest, TsoResponse,
};
pub use value::Scalar;
