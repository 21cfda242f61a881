//! Binary message codec for the ComfoConnect session protocol
//!
//! A frame body (the part after the 4-byte length prefix handled by
//! [`crate::connection`]) is laid out as:
//!
//! ```text
//! [kind: u8][sequence: u16 BE][status: u8][payload ...]
//! ```
//!
//! Property ids are `[namespace: u8][index: u16 BE]`, values are
//! `[length: u16 BE][bytes]` interpreted through the declared kind of the
//! property in [`crate::properties`].

use crate::error::{ComfoError, Result};
use crate::properties;
use crate::types::{PropertyId, PropertyValue, Value, ValueKind};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use tokio::time::Instant;
use uuid::Uuid;

/// Request sequence number, wraps at `u16::MAX`
pub type SequenceNumber = u16;

/// Sequence number carried by unsolicited frames
pub const UNSOLICITED: SequenceNumber = 0;

/// Size of the fixed frame header
pub const HEADER_LEN: usize = 4;

/// Frame kinds on the session link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    HandshakeRequest = 0x01,
    HandshakeAck = 0x02,
    RegisterRequest = 0x03,
    RegisterAck = 0x04,
    PropertyReadRequest = 0x10,
    PropertyReadResponse = 0x11,
    PropertyWriteRequest = 0x12,
    PropertyWriteResponse = 0x13,
    SubscribeRequest = 0x20,
    SubscribeResponse = 0x21,
    UnsubscribeRequest = 0x22,
    UnsubscribeResponse = 0x23,
    PushNotification = 0x30,
    KeepAlive = 0x40,
    CloseSession = 0x50,
}

impl TryFrom<u8> for FrameKind {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameKind::HandshakeRequest),
            0x02 => Ok(FrameKind::HandshakeAck),
            0x03 => Ok(FrameKind::RegisterRequest),
            0x04 => Ok(FrameKind::RegisterAck),
            0x10 => Ok(FrameKind::PropertyReadRequest),
            0x11 => Ok(FrameKind::PropertyReadResponse),
            0x12 => Ok(FrameKind::PropertyWriteRequest),
            0x13 => Ok(FrameKind::PropertyWriteResponse),
            0x20 => Ok(FrameKind::SubscribeRequest),
            0x21 => Ok(FrameKind::SubscribeResponse),
            0x22 => Ok(FrameKind::UnsubscribeRequest),
            0x23 => Ok(FrameKind::UnsubscribeResponse),
            0x30 => Ok(FrameKind::PushNotification),
            0x40 => Ok(FrameKind::KeepAlive),
            0x50 => Ok(FrameKind::CloseSession),
            other => Err(other),
        }
    }
}

impl FrameKind {
    fn is_response(self) -> bool {
        matches!(
            self,
            FrameKind::HandshakeAck
                | FrameKind::RegisterAck
                | FrameKind::PropertyReadResponse
                | FrameKind::PropertyWriteResponse
                | FrameKind::SubscribeResponse
                | FrameKind::UnsubscribeResponse
        )
    }
}

/// Result code carried in the status byte of responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    BadRequest,
    InternalError,
    NotReachable,
    OtherSession,
    NotAllowed,
    NoResources,
    NotExist,
    RmiError,
    Other(u8),
}

impl From<u8> for ResultCode {
    fn from(code: u8) -> Self {
        match code {
            0 => ResultCode::Ok,
            1 => ResultCode::BadRequest,
            2 => ResultCode::InternalError,
            3 => ResultCode::NotReachable,
            4 => ResultCode::OtherSession,
            5 => ResultCode::NotAllowed,
            6 => ResultCode::NoResources,
            7 => ResultCode::NotExist,
            8 => ResultCode::RmiError,
            other => ResultCode::Other(other),
        }
    }
}

impl From<ResultCode> for u8 {
    fn from(code: ResultCode) -> Self {
        match code {
            ResultCode::Ok => 0,
            ResultCode::BadRequest => 1,
            ResultCode::InternalError => 2,
            ResultCode::NotReachable => 3,
            ResultCode::OtherSession => 4,
            ResultCode::NotAllowed => 5,
            ResultCode::NoResources => 6,
            ResultCode::NotExist => 7,
            ResultCode::RmiError => 8,
            ResultCode::Other(code) => code,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultCode::Ok => f.write_str("OK"),
            ResultCode::BadRequest => f.write_str("BAD_REQUEST"),
            ResultCode::InternalError => f.write_str("INTERNAL_ERROR"),
            ResultCode::NotReachable => f.write_str("NOT_REACHABLE"),
            ResultCode::OtherSession => f.write_str("OTHER_SESSION"),
            ResultCode::NotAllowed => f.write_str("NOT_ALLOWED"),
            ResultCode::NoResources => f.write_str("NO_RESOURCES"),
            ResultCode::NotExist => f.write_str("NOT_EXIST"),
            ResultCode::RmiError => f.write_str("RMI_ERROR"),
            ResultCode::Other(code) => write!(f, "UNKNOWN({})", code),
        }
    }
}

/// Operation carried by a client request
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Handshake,
    Register {
        pincode: u32,
        client_uuid: Uuid,
        device_name: String,
    },
    Read(PropertyId),
    Write(PropertyValue),
    Subscribe(PropertyId),
    Unsubscribe(PropertyId),
}

impl Operation {
    pub fn request_kind(&self) -> FrameKind {
        match self {
            Operation::Handshake => FrameKind::HandshakeRequest,
            Operation::Register { .. } => FrameKind::RegisterRequest,
            Operation::Read(_) => FrameKind::PropertyReadRequest,
            Operation::Write(_) => FrameKind::PropertyWriteRequest,
            Operation::Subscribe(_) => FrameKind::SubscribeRequest,
            Operation::Unsubscribe(_) => FrameKind::UnsubscribeRequest,
        }
    }

    /// Kind of the frame that answers this operation
    pub fn response_kind(&self) -> FrameKind {
        match self {
            Operation::Handshake => FrameKind::HandshakeAck,
            Operation::Register { .. } => FrameKind::RegisterAck,
            Operation::Read(_) => FrameKind::PropertyReadResponse,
            Operation::Write(_) => FrameKind::PropertyWriteResponse,
            Operation::Subscribe(_) => FrameKind::SubscribeResponse,
            Operation::Unsubscribe(_) => FrameKind::UnsubscribeResponse,
        }
    }

    /// Property the operation targets, if any
    pub fn property(&self) -> Option<PropertyId> {
        match self {
            Operation::Read(id) | Operation::Subscribe(id) | Operation::Unsubscribe(id) => {
                Some(*id)
            }
            Operation::Write(value) => Some(value.id),
            Operation::Handshake | Operation::Register { .. } => None,
        }
    }
}

/// An outstanding request, owned by the correlator until it resolves
#[derive(Debug, Clone)]
pub struct Request {
    pub sequence: SequenceNumber,
    pub operation: Operation,
    pub deadline: Instant,
}

/// A decoded response frame
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub kind: FrameKind,
    pub sequence: SequenceNumber,
    pub status: ResultCode,
    /// Property payload of read responses
    pub value: Option<PropertyValue>,
}

impl Response {
    pub fn new(kind: FrameKind, sequence: SequenceNumber, status: ResultCode) -> Self {
        Self {
            kind,
            sequence,
            status,
            value: None,
        }
    }

    pub fn with_value(mut self, value: PropertyValue) -> Self {
        self.value = Some(value);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResultCode::Ok
    }

    /// Turn a non-OK status into [`ComfoError::Rejected`]
    pub fn into_result(self) -> Result<Option<PropertyValue>> {
        if self.is_ok() {
            Ok(self.value)
        } else {
            Err(ComfoError::Rejected(self.status))
        }
    }
}

/// Message received from the unit
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response(Response),
    Push(PropertyValue),
    KeepAlive,
    /// The unit closed the session
    Close,
    /// Frame kind this codec does not know
    Unknown { kind: u8, sequence: SequenceNumber },
}

/// Message received by the unit, used when simulating a unit
#[derive(Debug, Clone, PartialEq)]
pub enum UnitBound {
    Request(SequenceNumber, Operation),
    KeepAlive,
    Close,
}

fn put_header(buf: &mut BytesMut, kind: FrameKind, sequence: SequenceNumber, status: ResultCode) {
    buf.put_u8(kind as u8);
    buf.put_u16(sequence);
    buf.put_u8(status.into());
}

fn put_property_id(buf: &mut BytesMut, id: PropertyId) {
    buf.put_u8(id.namespace);
    buf.put_u16(id.index);
}

fn put_value(buf: &mut BytesMut, id: PropertyId, value: &Value) -> Result<()> {
    let start = buf.len();
    buf.put_u16(0);
    match value {
        Value::Integer(v) => buf.put_i64(*v),
        Value::Float(v) => buf.put_f64(*v),
        Value::String(v) => buf.put_slice(v.as_bytes()),
        Value::Boolean(v) => buf.put_u8(u8::from(*v)),
        Value::Bytes(v) => buf.put_slice(v),
    }
    let len = buf.len() - start - 2;
    let len = u16::try_from(len).map_err(|_| ComfoError::InvalidValue {
        property: id,
        reason: format!("encoded value is {} bytes, limit is {}", len, u16::MAX),
    })?;
    buf[start..start + 2].copy_from_slice(&len.to_be_bytes());
    Ok(())
}

fn put_property_value(buf: &mut BytesMut, value: &PropertyValue) -> Result<()> {
    put_property_id(buf, value.id);
    put_value(buf, value.id, &value.value)
}

/// Encode a client request
///
/// Writes are checked against the registry: the property must be known and
/// writable, and the value must have the declared kind.
pub fn encode_request(sequence: SequenceNumber, operation: &Operation) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + 16);
    put_header(&mut buf, operation.request_kind(), sequence, ResultCode::Ok);

    match operation {
        Operation::Handshake => {}
        Operation::Register {
            pincode,
            client_uuid,
            device_name,
        } => {
            buf.put_u32(*pincode);
            buf.put_slice(client_uuid.as_bytes());
            let name = device_name.as_bytes();
            let len = u8::try_from(name.len())
                .map_err(|_| ComfoError::Config("device name longer than 255 bytes".to_string()))?;
            buf.put_u8(len);
            buf.put_slice(name);
        }
        Operation::Read(id) | Operation::Subscribe(id) | Operation::Unsubscribe(id) => {
            put_property_id(&mut buf, *id);
        }
        Operation::Write(value) => {
            let descriptor = properties::require(value.id)?;
            if !descriptor.writable {
                return Err(ComfoError::InvalidValue {
                    property: value.id,
                    reason: format!("{} is read-only", descriptor.name),
                });
            }
            if descriptor.kind != value.value.kind() {
                return Err(ComfoError::InvalidValue {
                    property: value.id,
                    reason: format!(
                        "{} expects {:?}, got {:?}",
                        descriptor.name,
                        descriptor.kind,
                        value.value.kind()
                    ),
                });
            }
            put_property_value(&mut buf, value)?;
        }
    }

    Ok(buf.freeze())
}

/// Encode a response frame (unit side)
pub fn encode_response(response: &Response) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + 16);
    put_header(&mut buf, response.kind, response.sequence, response.status);
    if let Some(value) = &response.value {
        put_property_value(&mut buf, value)?;
    }
    Ok(buf.freeze())
}

/// Encode a push notification (unit side)
pub fn encode_push(value: &PropertyValue) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + 16);
    put_header(&mut buf, FrameKind::PushNotification, UNSOLICITED, ResultCode::Ok);
    put_property_value(&mut buf, value)?;
    Ok(buf.freeze())
}

pub fn encode_keepalive() -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN);
    put_header(&mut buf, FrameKind::KeepAlive, UNSOLICITED, ResultCode::Ok);
    buf.freeze()
}

pub fn encode_close() -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN);
    put_header(&mut buf, FrameKind::CloseSession, UNSOLICITED, ResultCode::Ok);
    buf.freeze()
}

fn need(buf: &&[u8], len: usize, what: &str) -> Result<()> {
    if buf.remaining() < len {
        return Err(ComfoError::Decode(format!(
            "truncated {}: need {} bytes, have {}",
            what,
            len,
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_property_id(buf: &mut &[u8]) -> Result<PropertyId> {
    need(buf, 3, "property id")?;
    let namespace = buf.get_u8();
    let index = buf.get_u16();
    Ok(PropertyId::new(namespace, index))
}

fn get_value(buf: &mut &[u8], id: PropertyId) -> Result<Value> {
    need(buf, 2, "value length")?;
    let len = buf.get_u16() as usize;
    need(buf, len, "value")?;
    let data: &[u8] = *buf;
    let (raw, rest) = data.split_at(len);
    *buf = rest;

    let kind = match properties::lookup(id) {
        Some(descriptor) => descriptor.kind,
        None => return Ok(Value::Bytes(raw.to_vec())),
    };

    let wrong_length = |expected: usize| {
        ComfoError::Decode(format!(
            "{} value for {} must be {} bytes, got {}",
            match kind {
                ValueKind::Integer => "integer",
                ValueKind::Float => "float",
                _ => "boolean",
            },
            id,
            expected,
            len
        ))
    };

    match kind {
        ValueKind::Integer => {
            let bytes: [u8; 8] = raw.try_into().map_err(|_| wrong_length(8))?;
            Ok(Value::Integer(i64::from_be_bytes(bytes)))
        }
        ValueKind::Float => {
            let bytes: [u8; 8] = raw.try_into().map_err(|_| wrong_length(8))?;
            Ok(Value::Float(f64::from_be_bytes(bytes)))
        }
        ValueKind::Boolean => match raw {
            [0] => Ok(Value::Boolean(false)),
            [1] => Ok(Value::Boolean(true)),
            [other] => Err(ComfoError::Decode(format!(
                "boolean value for {} must be 0 or 1, got {}",
                id, other
            ))),
            _ => Err(wrong_length(1)),
        },
        ValueKind::String => String::from_utf8(raw.to_vec())
            .map(Value::String)
            .map_err(|_| ComfoError::Decode(format!("string value for {} is not UTF-8", id))),
        ValueKind::Bytes => Ok(Value::Bytes(raw.to_vec())),
    }
}

fn get_property_value(buf: &mut &[u8]) -> Result<PropertyValue> {
    let id = get_property_id(buf)?;
    let value = get_value(buf, id)?;
    Ok(PropertyValue::new(id, value))
}

fn get_header(buf: &mut &[u8]) -> Result<(u8, SequenceNumber, ResultCode)> {
    need(buf, HEADER_LEN, "header")?;
    let kind = buf.get_u8();
    let sequence = buf.get_u16();
    let status = ResultCode::from(buf.get_u8());
    Ok((kind, sequence, status))
}

/// Decode a frame body received from the unit
pub fn decode_message(frame: &[u8]) -> Result<Incoming> {
    let mut buf = frame;
    let (raw_kind, sequence, status) = get_header(&mut buf)?;

    let kind = match FrameKind::try_from(raw_kind) {
        Ok(kind) => kind,
        Err(kind) => return Ok(Incoming::Unknown { kind, sequence }),
    };

    match kind {
        FrameKind::PushNotification => Ok(Incoming::Push(get_property_value(&mut buf)?)),
        FrameKind::KeepAlive => Ok(Incoming::KeepAlive),
        FrameKind::CloseSession => Ok(Incoming::Close),
        kind if kind.is_response() => {
            let mut response = Response::new(kind, sequence, status);
            if kind == FrameKind::PropertyReadResponse && buf.has_remaining() {
                response.value = Some(get_property_value(&mut buf)?);
            }
            Ok(Incoming::Response(response))
        }
        other => Err(ComfoError::Decode(format!(
            "unexpected {:?} frame from unit",
            other
        ))),
    }
}

/// Decode a frame body received by the unit
pub fn decode_request(frame: &[u8]) -> Result<UnitBound> {
    let mut buf = frame;
    let (raw_kind, sequence, _) = get_header(&mut buf)?;
    let kind = FrameKind::try_from(raw_kind)
        .map_err(|kind| ComfoError::Decode(format!("unknown frame kind 0x{:02x}", kind)))?;

    let operation = match kind {
        FrameKind::HandshakeRequest => Operation::Handshake,
        FrameKind::RegisterRequest => {
            need(&buf, 4 + 16 + 1, "register request")?;
            let pincode = buf.get_u32();
            let mut uuid = [0u8; 16];
            buf.copy_to_slice(&mut uuid);
            let len = buf.get_u8() as usize;
            need(&buf, len, "device name")?;
            let device_name = String::from_utf8(buf[..len].to_vec())
                .map_err(|_| ComfoError::Decode("device name is not UTF-8".to_string()))?;
            Operation::Register {
                pincode,
                client_uuid: Uuid::from_bytes(uuid),
                device_name,
            }
        }
        FrameKind::PropertyReadRequest => Operation::Read(get_property_id(&mut buf)?),
        FrameKind::PropertyWriteRequest => Operation::Write(get_property_value(&mut buf)?),
        FrameKind::SubscribeRequest => Operation::Subscribe(get_property_id(&mut buf)?),
        FrameKind::UnsubscribeRequest => Operation::Unsubscribe(get_property_id(&mut buf)?),
        FrameKind::KeepAlive => return Ok(UnitBound::KeepAlive),
        FrameKind::CloseSession => return Ok(UnitBound::Close),
        other => {
            return Err(ComfoError::Decode(format!(
                "unexpected {:?} frame from client",
                other
            )))
        }
    };

    Ok(UnitBound::Request(sequence, operation))
}
