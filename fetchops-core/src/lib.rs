use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const MAX_FRAME_BYTES: usize = 64 * 1024;
pub const MAX_LOCATOR_LEN: usize = 2048;

pub const KEY_OP: &str = "op";
pub const KEY_LOCATOR: &str = "locator";
pub const KEY_REQUEST_ID: &str = "requestId";
pub const KEY_STATUS_CODE: &str = "statusCode";
pub const KEY_RESULT_LOCATOR: &str = "resultLocator";

pub type RequestId = u64;

/// What the worker is asked to do.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    FetchResource,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub kind: OperationKind,
    pub locator: String,
    pub request_id: RequestId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: StatusCode,
    pub request_id: RequestId,
    /// Set iff `status` is [`StatusCode::Success`].
    pub result_locator: Option<String>,
    /// Locator of the originating request, when the worker echoed it.
    pub source_locator: Option<String>,
}

impl Reply {
    pub fn is_success(&self) -> bool {
        self.status == StatusCode::Success
    }
}

/// The "what" tag carried in every frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Request = 1,
    Reply = 2,
}

impl MessageType {
    fn from_u8(value: u8) -> Result<Self, CoreError> {
        match value {
            x if x == MessageType::Request as u8 => Ok(MessageType::Request),
            x if x == MessageType::Reply as u8 => Ok(MessageType::Reply),
            other => Err(CoreError::UnsupportedMessageType(other)),
        }
    }
}

/// A flat key-value frame plus its message type.
///
/// Envelopes are immutable once built. Every constructor and decoder returns an
/// owned copy, so an envelope stays valid after the transport reuses the buffer
/// it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    what: MessageType,
    data: Map<String, Value>,
}

impl Envelope {
    pub fn new(what: MessageType, data: Map<String, Value>) -> Self {
        Self { what, data }
    }

    pub fn what(&self) -> MessageType {
        self.what
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Peeks at the correlation id without a full decode.
    pub fn request_id(&self) -> Option<RequestId> {
        self.data.get(KEY_REQUEST_ID).and_then(Value::as_u64)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("locator must not be empty")]
    EmptyLocator,
    #[error("locator exceeds {} bytes", MAX_LOCATOR_LEN)]
    LocatorTooLong,
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("invalid frame length")]
    InvalidFrameLength,
    #[error("unsupported message type {0}")]
    UnsupportedMessageType(u8),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    /// True for errors caused by the caller's input rather than the wire.
    pub fn is_argument_error(&self) -> bool {
        matches!(self, CoreError::EmptyLocator | CoreError::LocatorTooLong)
    }
}

pub fn validate_locator(locator: &str) -> Result<(), CoreError> {
    if locator.is_empty() {
        return Err(CoreError::EmptyLocator);
    }
    if locator.len() > MAX_LOCATOR_LEN {
        return Err(CoreError::LocatorTooLong);
    }
    Ok(())
}

pub fn encode_request(
    kind: OperationKind,
    locator: &str,
    request_id: RequestId,
) -> Result<Envelope, CoreError> {
    validate_locator(locator)?;

    let op = serde_json::to_value(kind).map_err(|err| CoreError::Serialization(err.to_string()))?;
    let mut data = Map::new();
    data.insert(KEY_OP.to_owned(), op);
    data.insert(KEY_LOCATOR.to_owned(), Value::from(locator));
    data.insert(KEY_REQUEST_ID.to_owned(), Value::from(request_id));
    Ok(Envelope::new(MessageType::Request, data))
}

pub fn decode_request(envelope: &Envelope) -> Result<Request, CoreError> {
    if envelope.what != MessageType::Request {
        return Err(malformed("expected a request envelope"));
    }

    let op = envelope
        .get(KEY_OP)
        .ok_or_else(|| missing(KEY_OP))?
        .clone();
    let kind: OperationKind = serde_json::from_value(op)
        .map_err(|err| CoreError::MalformedEnvelope(format!("unknown op: {err}")))?;
    let locator = required_str(envelope, KEY_LOCATOR)?;
    if locator.is_empty() {
        return Err(malformed("locator must not be empty"));
    }
    let request_id = required_request_id(envelope)?;

    Ok(Request {
        kind,
        locator,
        request_id,
    })
}

/// Builds a reply. The status is `Success` iff `result_locator` is present.
pub fn encode_reply(
    result_locator: Option<&str>,
    request_id: RequestId,
    source_locator: Option<&str>,
) -> Envelope {
    let status = if result_locator.is_some() {
        StatusCode::Success
    } else {
        StatusCode::Failure
    };

    let mut data = Map::new();
    data.insert(KEY_REQUEST_ID.to_owned(), Value::from(request_id));
    data.insert(KEY_STATUS_CODE.to_owned(), status_value(status));
    if let Some(result) = result_locator {
        data.insert(KEY_RESULT_LOCATOR.to_owned(), Value::from(result));
    }
    if let Some(source) = source_locator {
        data.insert(KEY_LOCATOR.to_owned(), Value::from(source));
    }
    Envelope::new(MessageType::Reply, data)
}

pub fn decode_reply(envelope: &Envelope) -> Result<Reply, CoreError> {
    if envelope.what != MessageType::Reply {
        return Err(malformed("expected a reply envelope"));
    }

    let request_id = required_request_id(envelope)?;
    let status_raw = envelope
        .get(KEY_STATUS_CODE)
        .ok_or_else(|| missing(KEY_STATUS_CODE))?
        .clone();
    let status: StatusCode = serde_json::from_value(status_raw)
        .map_err(|err| CoreError::MalformedEnvelope(format!("unknown statusCode: {err}")))?;
    let result_locator = optional_str(envelope, KEY_RESULT_LOCATOR)?;
    let source_locator = optional_str(envelope, KEY_LOCATOR)?;

    match (status, &result_locator) {
        (StatusCode::Success, None) => {
            return Err(malformed("success reply without resultLocator"));
        }
        (StatusCode::Failure, Some(_)) => {
            return Err(malformed("failure reply carries a resultLocator"));
        }
        _ => {}
    }

    Ok(Reply {
        status,
        request_id,
        result_locator,
        source_locator,
    })
}

pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, CoreError> {
    let payload = serde_json::to_vec(&envelope.data)
        .map_err(|err| CoreError::Serialization(err.to_string()))?;

    let frame_len = 1usize
        .checked_add(payload.len())
        .ok_or(CoreError::InvalidFrameLength)?;
    if frame_len + 4 > MAX_FRAME_BYTES {
        return Err(CoreError::InvalidFrameLength);
    }
    let frame_len_u32 = u32::try_from(frame_len).map_err(|_| CoreError::InvalidFrameLength)?;

    let mut out = BytesMut::with_capacity(4 + frame_len);
    out.put_u32_le(frame_len_u32);
    out.put_u8(envelope.what as u8);
    out.extend_from_slice(&payload);
    Ok(out.to_vec())
}

/// Decodes a frame into an owned envelope; `frame` may be reused afterwards.
pub fn decode_frame(frame: &[u8]) -> Result<Envelope, CoreError> {
    if frame.len() < 5 || frame.len() > MAX_FRAME_BYTES {
        return Err(CoreError::InvalidFrameLength);
    }

    let mut cursor = frame;
    let expected_len = cursor.get_u32_le() as usize;
    if expected_len + 4 != frame.len() {
        return Err(CoreError::InvalidFrameLength);
    }

    let what = MessageType::from_u8(cursor.get_u8())?;
    let data: Map<String, Value> = serde_json::from_slice(cursor)
        .map_err(|err| CoreError::Serialization(err.to_string()))?;
    Ok(Envelope::new(what, data))
}

fn status_value(status: StatusCode) -> Value {
    match status {
        StatusCode::Success => Value::from("success"),
        StatusCode::Failure => Value::from("failure"),
    }
}

fn required_str(envelope: &Envelope, key: &str) -> Result<String, CoreError> {
    optional_str(envelope, key)?.ok_or_else(|| missing(key))
}

fn optional_str(envelope: &Envelope, key: &str) -> Result<Option<String>, CoreError> {
    match envelope.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(_) => Err(CoreError::MalformedEnvelope(format!(
            "field {key} must be a string"
        ))),
    }
}

fn required_request_id(envelope: &Envelope) -> Result<RequestId, CoreError> {
    match envelope.get(KEY_REQUEST_ID) {
        None => Err(missing(KEY_REQUEST_ID)),
        Some(value) => value.as_u64().ok_or_else(|| {
            CoreError::MalformedEnvelope(format!("field {KEY_REQUEST_ID} must be an unsigned integer"))
        }),
    }
}

fn missing(key: &str) -> CoreError {
    CoreError::MalformedEnvelope(format!("missing field {key}"))
}

fn malformed(reason: &str) -> CoreError {
    CoreError::MalformedEnvelope(reason.to_owned())
}
