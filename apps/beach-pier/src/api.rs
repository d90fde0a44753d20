//! JSON wire types exchanged with RTM clients and MCU backends.

use std::fmt;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::auth::AuthError;

pub const TYPE_HELLO: &str = "hello";
pub const TYPE_GOODBYE: &str = "goodbye";
pub const TYPE_ERROR: &str = "error";
pub const TYPE_PING: &str = "ping";
pub const TYPE_PONG: &str = "pong";
pub const TYPE_WEBRTC: &str = "webrtc";

pub const SUBTYPE_WEBRTC_CALL: &str = "webrtc_call";
pub const SUBTYPE_WEBRTC_CHANNEL: &str = "webrtc_channel";
pub const SUBTYPE_WEBRTC_SIGNAL: &str = "webrtc_signal";
pub const SUBTYPE_WEBRTC_HANGUP: &str = "webrtc_hangup";

pub const MCU_TYPE_ATTACH: &str = "attach";
pub const MCU_TYPE_DETACH: &str = "detach";
pub const MCU_TYPE_ERROR: &str = "error";

/// Stamped on every webrtc reply so clients can detect payload changes.
pub const WEBRTC_PAYLOAD_VERSION: u32 = 20180703;

fn is_zero(value: &u64) -> bool {
    *value == 0
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Messages whose replies can be correlated through a transaction id.
pub trait TransactionId {
    /// Empty when the message does not take part in a transaction.
    fn transaction_id(&self) -> String;
}

/// Minimal view of every inbound RTM frame.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub id: u64,
}

impl TransactionId for Envelope {
    fn transaction_id(&self) -> String {
        if self.id == 0 {
            String::new()
        } else {
            self.id.to_string()
        }
    }
}

/// Ping payloads are echoed verbatim, so they stay an untyped map.
pub type PingPong = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Hello {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(rename = "self", skip_serializing_if = "Option::is_none")]
    pub self_info: Option<SelfInfo>,
}

impl Hello {
    pub fn hello(self_info: Option<SelfInfo>) -> Self {
        Self {
            kind: TYPE_HELLO,
            self_info,
        }
    }

    pub fn goodbye() -> Self {
        Self {
            kind: TYPE_GOODBYE,
            self_info: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebRtcMessage {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub subtype: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub id: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub initiator: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl TransactionId for WebRtcMessage {
    fn transaction_id(&self) -> String {
        if self.id == 0 {
            String::new()
        } else {
            self.id.to_string()
        }
    }
}

/// Payload of a `webrtc_call` response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebRtcAccept {
    #[serde(default)]
    pub accept: bool,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebRtcReply {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub subtype: &'static str,
    #[serde(skip_serializing_if = "is_zero")]
    pub reply_to: u64,
    pub channel: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hash: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub group: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ChannelExtra>,
    #[serde(rename = "v")]
    pub version: u32,
}

impl WebRtcReply {
    pub fn channel(channel: impl Into<String>) -> Self {
        Self {
            kind: TYPE_WEBRTC,
            subtype: SUBTYPE_WEBRTC_CHANNEL,
            reply_to: 0,
            channel: channel.into(),
            hash: String::new(),
            group: String::new(),
            data: None,
            version: WEBRTC_PAYLOAD_VERSION,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelExtra {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<ChannelPipeline>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<ChannelGroup>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub replaced: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelPipeline {
    pub pipeline: String,
    pub mode: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelGroup {
    pub group: String,
    pub members: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub reset: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadMessage,
    NoSessionForUser,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::BadMessage => "bad_message",
            ErrorCode::NoSessionForUser => "no_session_for_user",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol error reported back to the client that caused it. The
/// connection stays open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {msg}")]
pub struct RtmError {
    pub code: ErrorCode,
    pub msg: String,
    pub reply_to: u64,
}

impl RtmError {
    pub fn new(code: ErrorCode, msg: impl Into<String>, reply_to: u64) -> Self {
        Self {
            code,
            msg: msg.into(),
            reply_to,
        }
    }

    pub fn bad_message(msg: impl Into<String>, reply_to: u64) -> Self {
        Self::new(ErrorCode::BadMessage, msg, reply_to)
    }

    pub fn no_session_for_user(msg: impl Into<String>, reply_to: u64) -> Self {
        Self::new(ErrorCode::NoSessionForUser, msg, reply_to)
    }

    pub fn reply(&self) -> ErrorReply {
        ErrorReply {
            kind: TYPE_ERROR,
            reply_to: self.reply_to,
            error: ErrorData {
                code: self.code,
                msg: self.msg.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorReply {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "is_zero")]
    pub reply_to: u64,
    pub error: ErrorData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: ErrorCode,
    pub msg: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectResponse {
    pub ok: bool,
    pub url: String,
    #[serde(rename = "self")]
    pub self_info: SelfInfo,
}

/// Rejection of a connect or websocket request, before any connection
/// exists.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("not found")]
    NotFound,
    #[error("forbidden")]
    Forbidden,
    #[error("unauthorized: {0}")]
    Unauthorized(#[from] AuthError),
    #[error("bad request: {0}")]
    BadRequest(&'static str),
    #[error("server is shutting down")]
    ShuttingDown,
}

impl ConnectError {
    fn status(&self) -> StatusCode {
        match self {
            ConnectError::NotFound => StatusCode::NOT_FOUND,
            ConnectError::Forbidden | ConnectError::Unauthorized(_) => StatusCode::FORBIDDEN,
            ConnectError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ConnectError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ConnectError::NotFound => "not_found",
            ConnectError::Forbidden | ConnectError::Unauthorized(_) => "forbidden",
            ConnectError::BadRequest(_) => "bad_request",
            ConnectError::ShuttingDown => "shutting_down",
        }
    }
}

#[derive(Debug, Serialize)]
struct ConnectErrorBody {
    ok: bool,
    error: ConnectErrorDetail,
}

#[derive(Debug, Serialize)]
struct ConnectErrorDetail {
    code: &'static str,
    msg: String,
}

impl IntoResponse for ConnectError {
    fn into_response(self) -> Response {
        let body = ConnectErrorBody {
            ok: false,
            error: ConnectErrorDetail {
                code: self.code(),
                msg: self.to_string(),
            },
        };
        (self.status(), Json(body)).into_response()
    }
}

/// Control message on the MCU websocket protocol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McuMessage {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub transaction: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub plugin: String,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub handle_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

fn is_zero_i64(value: &i64) -> bool {
    *value == 0
}

impl TransactionId for McuMessage {
    fn transaction_id(&self) -> String {
        self.transaction.clone()
    }
}
