//! Vehicle HAL contract
//!
//! This crate defines the boundary between a vehicle hardware abstraction
//! layer and the network service that multiplexes it:
//!
//! - **Property Model**: typed property configurations and values, including
//!   zoned variants and the reserved internal ID range
//! - **Driver Contract**: the [`VehicleHal`] trait a real driver implements,
//!   with event/error callbacks bound at `init`
//! - **Mock Contract**: the [`VehicleHalMock`] trait a test double implements
//!   to transparently replace the real driver

pub mod error;
pub mod hal;
pub mod types;

// Re-export main types
pub use error::{HalError, HalResult};
pub use hal::{operation, HalCallbacks, VehicleHal, VehicleHalMock};
pub use types::{
    is_internal_property, Access, ChangeMode, PropertyConfig, PropertyValue, Value, ValueType,
    INTERNAL_PROPERTY_END, INTERNAL_PROPERTY_START,
};
