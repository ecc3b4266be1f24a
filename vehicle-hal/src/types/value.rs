//! Property value records.

use serde::{Deserialize, Serialize};

use super::config::ValueType;

/// Owned, type-tagged payload of a property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int32(i32),
    Int32Vec2([i32; 2]),
    Int32Vec3([i32; 3]),
    Int64(i64),
    Float(f32),
    FloatVec2([f32; 2]),
    FloatVec3([f32; 3]),
    Boolean(bool),
    String(String),
    Bytes(Vec<u8>),
}

impl Value {
    /// Zero/empty payload matching the given value type. Used to build get
    /// requests before the driver fills them in.
    pub fn empty_for(value_type: ValueType) -> Self {
        match value_type {
            ValueType::Int32 | ValueType::ZonedInt32 => Value::Int32(0),
            ValueType::Int32Vec2 | ValueType::ZonedInt32Vec2 => Value::Int32Vec2([0; 2]),
            ValueType::Int32Vec3 | ValueType::ZonedInt32Vec3 => Value::Int32Vec3([0; 3]),
            ValueType::Int64 => Value::Int64(0),
            ValueType::Float | ValueType::ZonedFloat => Value::Float(0.0),
            ValueType::FloatVec2 | ValueType::ZonedFloatVec2 => Value::FloatVec2([0.0; 2]),
            ValueType::FloatVec3 | ValueType::ZonedFloatVec3 => Value::FloatVec3([0.0; 3]),
            ValueType::Boolean | ValueType::ZonedBoolean => Value::Boolean(false),
            ValueType::String => Value::String(String::new()),
            ValueType::Bytes => Value::Bytes(Vec::new()),
        }
    }
}

/// One sample of a vehicle property.
///
/// Values flowing through the event pipeline are owned by the pipeline until
/// dispatch; clients receive their own copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyValue {
    /// Property identifier
    pub prop: i32,
    /// Zone the sample belongs to; 0 for non-zoned properties
    pub zone: i32,
    /// Payload type; must match the property's configuration
    pub value_type: ValueType,
    /// Sample timestamp, nanoseconds on the driver's monotonic clock
    pub timestamp_ns: i64,
    /// The payload itself
    pub value: Value,
}

impl PropertyValue {
    /// Create a value with an explicit payload and type tag.
    pub fn new(prop: i32, zone: i32, value_type: ValueType, value: Value) -> Self {
        Self {
            prop,
            zone,
            value_type,
            timestamp_ns: 0,
            value,
        }
    }

    /// Empty-payload request used for `get`: the driver fills `value` and
    /// `timestamp_ns`.
    pub fn request(prop: i32, value_type: ValueType, zone: i32) -> Self {
        Self::new(prop, zone, value_type, Value::empty_for(value_type))
    }

    /// Non-zoned int32 sample.
    pub fn int32(prop: i32, v: i32) -> Self {
        Self::new(prop, 0, ValueType::Int32, Value::Int32(v))
    }

    /// Non-zoned float sample.
    pub fn float(prop: i32, v: f32) -> Self {
        Self::new(prop, 0, ValueType::Float, Value::Float(v))
    }

    /// Zoned float sample.
    pub fn zoned_float(prop: i32, zone: i32, v: f32) -> Self {
        Self::new(prop, zone, ValueType::ZonedFloat, Value::Float(v))
    }

    /// Zoned int32 sample.
    pub fn zoned_int32(prop: i32, zone: i32, v: i32) -> Self {
        Self::new(prop, zone, ValueType::ZonedInt32, Value::Int32(v))
    }

    /// Set the timestamp, chainable.
    pub fn with_timestamp(mut self, timestamp_ns: i64) -> Self {
        self.timestamp_ns = timestamp_ns;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_payload_matches_type() {
        let v = PropertyValue::request(0x100, ValueType::ZonedFloat, 0b0001);
        assert_eq!(v.prop, 0x100);
        assert_eq!(v.zone, 0b0001);
        assert_eq!(v.value, Value::Float(0.0));
    }

    #[test]
    fn test_constructors_tag_consistently() {
        let v = PropertyValue::int32(0x200, 42);
        assert_eq!(v.value_type, ValueType::Int32);
        assert_eq!(v.value, Value::Int32(42));
        assert_eq!(v.zone, 0);

        let z = PropertyValue::zoned_int32(0x201, 0b0010, 7).with_timestamp(123);
        assert_eq!(z.value_type, ValueType::ZonedInt32);
        assert_eq!(z.zone, 0b0010);
        assert_eq!(z.timestamp_ns, 123);
    }

    #[test]
    fn test_empty_for_string_and_bytes() {
        assert_eq!(Value::empty_for(ValueType::String), Value::String(String::new()));
        assert_eq!(Value::empty_for(ValueType::Bytes), Value::Bytes(Vec::new()));
    }
}
