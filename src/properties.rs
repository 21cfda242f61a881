//! Static registry of known ComfoAir properties
//!
//! Every property the crate knows about is declared here with its wire value
//! kind. Properties absent from the registry still decode (as raw bytes), but
//! they cannot be written and listeners cannot be registered for them.

use crate::error::{ComfoError, Result};
use crate::types::{PropertyId, ValueKind};

/// Static description of a property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyDescriptor {
    pub id: PropertyId,
    pub name: &'static str,
    pub kind: ValueKind,
    pub writable: bool,
    /// Physical unit of numeric values
    pub unit: Option<&'static str>,
}

const fn sensor(
    index: u16,
    name: &'static str,
    kind: ValueKind,
    unit: Option<&'static str>,
) -> PropertyDescriptor {
    PropertyDescriptor {
        id: PropertyId::sensor(index),
        name,
        kind,
        writable: false,
        unit,
    }
}

const fn node(index: u16, name: &'static str, kind: ValueKind) -> PropertyDescriptor {
    PropertyDescriptor {
        id: PropertyId::node(index),
        name,
        kind,
        writable: false,
        unit: None,
    }
}

pub const OPERATING_MODE: PropertyDescriptor = PropertyDescriptor {
    id: PropertyId::sensor(49),
    name: "OPERATING_MODE",
    kind: ValueKind::Integer,
    writable: true,
    unit: None,
};
pub const FAN_SPEED_SETTING: PropertyDescriptor = PropertyDescriptor {
    id: PropertyId::sensor(65),
    name: "FAN_SPEED_SETTING",
    kind: ValueKind::Integer,
    writable: true,
    unit: None,
};
pub const EXHAUST_FAN_SPEED: PropertyDescriptor =
    sensor(121, "EXHAUST_FAN_SPEED", ValueKind::Integer, Some("rpm"));
pub const SUPPLY_FAN_SPEED: PropertyDescriptor =
    sensor(122, "SUPPLY_FAN_SPEED", ValueKind::Integer, Some("rpm"));
pub const CURRENT_VENTILATION_POWER_CONSUMPTION: PropertyDescriptor = sensor(
    128,
    "CURRENT_VENTILATION_POWER_CONSUMPTION",
    ValueKind::Integer,
    Some("W"),
);
pub const TOTAL_FROM_START_POWER_CONSUMPTION: PropertyDescriptor = sensor(
    130,
    "TOTAL_FROM_START_POWER_CONSUMPTION",
    ValueKind::Integer,
    Some("kWh"),
);
pub const DAYS_LEFT_BEFORE_FILTER_REPLACEMENT: PropertyDescriptor = sensor(
    192,
    "DAYS_LEFT_BEFORE_FILTER_REPLACEMENT",
    ValueKind::Integer,
    Some("days"),
);
pub const SUPPLY_AIR_TEMPERATURE: PropertyDescriptor =
    sensor(221, "SUPPLY_AIR_TEMPERATURE", ValueKind::Float, Some("°C"));
pub const BYPASS_ACTIVE: PropertyDescriptor =
    sensor(227, "BYPASS_ACTIVE", ValueKind::Boolean, None);
pub const EXTRACT_AIR_TEMPERATURE: PropertyDescriptor =
    sensor(274, "EXTRACT_AIR_TEMPERATURE", ValueKind::Float, Some("°C"));
pub const EXHAUST_AIR_TEMPERATURE: PropertyDescriptor =
    sensor(275, "EXHAUST_AIR_TEMPERATURE", ValueKind::Float, Some("°C"));
pub const OUTDOOR_AIR_TEMPERATURE: PropertyDescriptor =
    sensor(276, "OUTDOOR_AIR_TEMPERATURE", ValueKind::Float, Some("°C"));
pub const EXTRACT_AIR_HUMIDITY: PropertyDescriptor =
    sensor(290, "EXTRACT_AIR_HUMIDITY", ValueKind::Integer, Some("%"));
pub const OUTDOOR_AIR_HUMIDITY: PropertyDescriptor =
    sensor(292, "OUTDOOR_AIR_HUMIDITY", ValueKind::Integer, Some("%"));
pub const ERROR_FLAGS: PropertyDescriptor = sensor(321, "ERROR_FLAGS", ValueKind::Bytes, None);
pub const ANALOG_VOLTAGE_1: PropertyDescriptor =
    sensor(369, "ANALOG_VOLTAGE_1", ValueKind::Float, Some("V"));
pub const ANALOG_VOLTAGE_2: PropertyDescriptor =
    sensor(370, "ANALOG_VOLTAGE_2", ValueKind::Float, Some("V"));
pub const ANALOG_VOLTAGE_3: PropertyDescriptor =
    sensor(371, "ANALOG_VOLTAGE_3", ValueKind::Float, Some("V"));
pub const ANALOG_VOLTAGE_4: PropertyDescriptor =
    sensor(372, "ANALOG_VOLTAGE_4", ValueKind::Float, Some("V"));

pub const SERIAL_NUMBER: PropertyDescriptor = node(4, "SERIAL_NUMBER", ValueKind::String);
pub const FIRMWARE_VERSION: PropertyDescriptor = node(6, "FIRMWARE_VERSION", ValueKind::Integer);
pub const MODEL_NUMBER: PropertyDescriptor = node(8, "MODEL_NUMBER", ValueKind::String);
pub const ARTICLE_NUMBER: PropertyDescriptor = node(11, "ARTICLE_NUMBER", ValueKind::String);

/// Every registered property
pub const ALL: &[PropertyDescriptor] = &[
    OPERATING_MODE,
    FAN_SPEED_SETTING,
    EXHAUST_FAN_SPEED,
    SUPPLY_FAN_SPEED,
    CURRENT_VENTILATION_POWER_CONSUMPTION,
    TOTAL_FROM_START_POWER_CONSUMPTION,
    DAYS_LEFT_BEFORE_FILTER_REPLACEMENT,
    SUPPLY_AIR_TEMPERATURE,
    BYPASS_ACTIVE,
    EXTRACT_AIR_TEMPERATURE,
    EXHAUST_AIR_TEMPERATURE,
    OUTDOOR_AIR_TEMPERATURE,
    EXTRACT_AIR_HUMIDITY,
    OUTDOOR_AIR_HUMIDITY,
    ERROR_FLAGS,
    ANALOG_VOLTAGE_1,
    ANALOG_VOLTAGE_2,
    ANALOG_VOLTAGE_3,
    ANALOG_VOLTAGE_4,
    SERIAL_NUMBER,
    FIRMWARE_VERSION,
    MODEL_NUMBER,
    ARTICLE_NUMBER,
];

/// Look up a property by id
pub fn lookup(id: PropertyId) -> Option<&'static PropertyDescriptor> {
    ALL.iter().find(|p| p.id == id)
}

/// Look up a property by id, failing on ids the registry does not know
pub fn require(id: PropertyId) -> Result<&'static PropertyDescriptor> {
    lookup(id).ok_or_else(|| ComfoError::UnknownProperty(id.to_string()))
}

/// Resolve a property by its registry name (case-insensitive)
pub fn resolve(name: &str) -> Result<&'static PropertyDescriptor> {
    ALL.iter()
        .find(|p| p.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| ComfoError::UnknownProperty(name.to_string()))
}

/// Check a host-side mapping up front, failing on the first unknown id
pub fn validate<'a>(ids: impl IntoIterator<Item = &'a PropertyId>) -> Result<()> {
    for id in ids {
        require(*id)?;
    }
    Ok(())
}
