use serde::{Deserialize, Serialize};
use std::fmt;

/// TCP and UDP port used by ComfoConnect gateways
pub const DEFAULT_PORT: u16 = 56747;

/// A ventilation unit reachable on the local network
///
/// Created by discovery or from the host's persisted store. Fields are only
/// exposed through accessors so a descriptor never changes once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitDescriptor {
    uuid: String,
    address: String,
    port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    model: Option<String>,
}

impl UnitDescriptor {
    pub fn new(uuid: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            uuid: uuid.into(),
            address: address.into(),
            port,
            model: None,
        }
    }

    pub(crate) fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    /// Gateway identifier as announced on the network
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Host name or IP address of the gateway
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Model name, when the descriptor came from discovery
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// `address:port`, suitable for `TcpStream::connect`
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Protocol-level identifier of a unit attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PropertyId {
    pub namespace: u8,
    pub index: u16,
}

impl PropertyId {
    /// Live process data pushed by the unit
    pub const SENSOR: u8 = 1;
    /// Static node information
    pub const NODE: u8 = 2;

    pub const fn new(namespace: u8, index: u16) -> Self {
        Self { namespace, index }
    }

    pub const fn sensor(index: u16) -> Self {
        Self::new(Self::SENSOR, index)
    }

    pub const fn node(index: u16) -> Self {
        Self::new(Self::NODE, index)
    }
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.namespace {
            Self::SENSOR => write!(f, "sensor/{}", self.index),
            Self::NODE => write!(f, "node/{}", self.index),
            ns => write!(f, "{}/{}", ns, self.index),
        }
    }
}

/// Declared value kind of a registered property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Integer,
    Float,
    String,
    Boolean,
    Bytes,
}

/// Typed property value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Value {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Integer(_) => ValueKind::Integer,
            Value::Float(_) => ValueKind::Float,
            Value::String(_) => ValueKind::String,
            Value::Boolean(_) => ValueKind::Boolean,
            Value::Bytes(_) => ValueKind::Bytes,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view, integers are widened
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(v) => f.write_str(v),
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Bytes(v) => {
                for byte in v {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }
    }
}

/// A value together with the property it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyValue {
    pub id: PropertyId,
    pub value: Value,
}

impl PropertyValue {
    pub fn new(id: PropertyId, value: Value) -> Self {
        Self { id, value }
    }
}

/// Ventilation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanMode {
    Away = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl TryFrom<i64> for FanMode {
    type Error = crate::error::ComfoError;

    fn try_from(level: i64) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(FanMode::Away),
            1 => Ok(FanMode::Low),
            2 => Ok(FanMode::Medium),
            3 => Ok(FanMode::High),
            other => Err(crate::error::ComfoError::InvalidValue {
                property: crate::properties::FAN_SPEED_SETTING.id,
                reason: format!("fan level {} out of range 0..=3", other),
            }),
        }
    }
}

/// Whether the unit follows its schedule or a manual setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    Auto = 0,
    Manual = 1,
}

/// Identity information read from the unit's node properties
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub serial_number: String,
    pub model: String,
    pub article_number: String,
    pub firmware_version: i64,
}
