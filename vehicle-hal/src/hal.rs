//! Driver and mock contracts.
//!
//! The service talks to exactly one driver at a time: either a real
//! [`VehicleHal`] or a [`VehicleHalMock`] swapped in for testing. Event and
//! error callbacks are bound at `init` as a trait object owned by the
//! service, so drivers never need process-wide state to reach it.

use std::fmt;
use std::sync::Arc;

use crate::error::HalResult;
use crate::types::{PropertyConfig, PropertyValue};

/// Operation codes carried on the error reporting path.
pub mod operation {
    pub const GENERIC: i32 = 0;
    pub const GET: i32 = 1;
    pub const SET: i32 = 2;
    pub const SUBSCRIBE: i32 = 3;
}

/// Callbacks a driver invokes to push events and errors into the service.
///
/// Implementations must not call back into the driver; they only enqueue.
/// Drivers may invoke these from any thread.
pub trait HalCallbacks: Send + Sync {
    /// A new property sample is available. Ownership of the value passes to
    /// the callee.
    fn on_event(&self, value: PropertyValue);

    /// The driver hit an error. `property` is 0 for global errors;
    /// `operation` is one of the [`operation`] codes.
    fn on_error(&self, error_code: i32, property: i32, operation: i32);
}

/// Contract implemented by a real vehicle HAL driver.
pub trait VehicleHal: Send + Sync {
    /// Bind callbacks and bring the driver up. Called once before any other
    /// operation.
    fn init(&self, callbacks: Arc<dyn HalCallbacks>) -> HalResult<()>;

    /// Shut the driver down. No callbacks may be invoked afterwards.
    fn release(&self);

    /// Enumerate the properties this driver exposes.
    fn list_properties(&self) -> Vec<PropertyConfig>;

    /// Fill `value` with the current sample for `value.prop` / `value.zone`.
    ///
    /// May return [`HalError::NotReady`](crate::HalError::NotReady) while the
    /// driver is still warming up; callers are expected to retry.
    fn get(&self, value: &mut PropertyValue) -> HalResult<()>;

    /// Write a property. Same `NotReady` semantics as `get`.
    fn set(&self, value: &PropertyValue) -> HalResult<()>;

    /// Start pushing events for `prop` at `sample_rate` Hz for the given
    /// zone mask (0 = all zones). A repeated subscribe replaces the
    /// previous rate/zones for that property.
    fn subscribe(&self, prop: i32, sample_rate: f32, zones: i32) -> HalResult<()>;

    /// Stop pushing events for `prop`.
    fn unsubscribe(&self, prop: i32) -> HalResult<()>;

    /// Append driver diagnostics to `w`. Format is driver-defined.
    fn dump(&self, w: &mut dyn fmt::Write) {
        let _ = w;
    }
}

/// Contract implemented by a HAL test double.
///
/// While a mock is registered the service routes every capability query and
/// operation here instead of the real driver. The mock's property list
/// replaces the real one for the duration.
pub trait VehicleHalMock: Send + Sync {
    /// Property list that stands in for the real driver's.
    fn on_list_properties(&self) -> Vec<PropertyConfig>;

    /// Serve a `get`.
    fn on_property_get(&self, value: &mut PropertyValue) -> HalResult<()>;

    /// Serve a `set`.
    fn on_property_set(&self, value: &PropertyValue) -> HalResult<()>;

    /// Observe an aggregate subscription.
    fn on_property_subscribe(&self, prop: i32, sample_rate: f32, zones: i32) -> HalResult<()>;

    /// Observe an aggregate unsubscription.
    fn on_property_unsubscribe(&self, prop: i32) -> HalResult<()>;
}
