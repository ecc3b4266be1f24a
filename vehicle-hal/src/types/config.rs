//! Property configuration records.

use serde::{Deserialize, Serialize};

/// Read/write capability of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    /// Property can only be read
    Read,
    /// Property can only be written
    Write,
    /// Property can be read and written
    ReadWrite,
}

impl Access {
    /// True if the property can be read.
    pub fn can_read(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    /// True if the property can be written.
    pub fn can_write(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

/// How a property's value evolves over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeMode {
    /// Value never changes after boot
    Static,
    /// Driver pushes a new value when it changes
    OnChange,
    /// Driver pushes a new value when someone sets it
    OnSet,
    /// Value is sampled continuously at a subscription rate
    Continuous,
    /// Value must be polled; no push events
    Poll,
}

impl ChangeMode {
    /// True for modes where a subscription sample rate is meaningless and
    /// forced to zero (`OnChange`, `OnSet`).
    pub fn is_fixed_rate(self) -> bool {
        matches!(self, ChangeMode::OnChange | ChangeMode::OnSet)
    }
}

/// Payload type of a property.
///
/// Zoned variants carry a zone bitmask in each value; `is_zoned` is how the
/// service decides whether the `zone` field of a value or subscription is
/// meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Int32,
    Int32Vec2,
    Int32Vec3,
    Int64,
    Float,
    FloatVec2,
    FloatVec3,
    Boolean,
    String,
    Bytes,
    ZonedInt32,
    ZonedInt32Vec2,
    ZonedInt32Vec3,
    ZonedFloat,
    ZonedFloatVec2,
    ZonedFloatVec3,
    ZonedBoolean,
}

impl ValueType {
    /// True exactly for the zoned variants.
    pub fn is_zoned(self) -> bool {
        matches!(
            self,
            ValueType::ZonedInt32
                | ValueType::ZonedInt32Vec2
                | ValueType::ZonedInt32Vec3
                | ValueType::ZonedFloat
                | ValueType::ZonedFloatVec2
                | ValueType::ZonedFloatVec3
                | ValueType::ZonedBoolean
        )
    }
}

/// Immutable configuration record for one vehicle property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyConfig {
    /// Property identifier
    pub prop: i32,
    /// Payload type of values for this property
    pub value_type: ValueType,
    /// Read/write capability
    pub access: Access,
    /// How the value evolves
    pub change_mode: ChangeMode,
    /// Minimum supported sample rate in Hz (continuous properties)
    pub min_sample_rate: f32,
    /// Maximum supported sample rate in Hz (continuous properties)
    pub max_sample_rate: f32,
    /// Bitmask of supported zones; 0 for non-zoned properties
    pub zone_flags: i32,
}

impl PropertyConfig {
    /// Create a config with no sample-rate range and no zones.
    pub fn new(prop: i32, value_type: ValueType, access: Access, change_mode: ChangeMode) -> Self {
        Self {
            prop,
            value_type,
            access,
            change_mode,
            min_sample_rate: 0.0,
            max_sample_rate: 0.0,
            zone_flags: 0,
        }
    }

    /// Set the supported sample-rate range.
    pub fn with_sample_rate(mut self, min: f32, max: f32) -> Self {
        self.min_sample_rate = min;
        self.max_sample_rate = max;
        self
    }

    /// Set the supported zone bitmask.
    pub fn with_zone_flags(mut self, zone_flags: i32) -> Self {
        self.zone_flags = zone_flags;
        self
    }

    /// True if values for this property carry a meaningful zone.
    pub fn is_zoned(&self) -> bool {
        self.value_type.is_zoned()
    }
}
