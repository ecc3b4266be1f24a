//! Vehicle Network Service core
//!
//! This crate is the in-process broker that sits between one vehicle HAL
//! driver and many client processes reading, writing, subscribing to, and
//! injecting vehicle properties.
//!
//! # Features
//!
//! - **Property Registry**: real, internal, and mock property lists with
//!   capability gating
//! - **Access Control**: per-property, per-uid read/write policy at every
//!   entry point
//! - **Subscription Fan-out**: per-client subscriptions folded into one
//!   driver subscription per property (max rate, zero-absorbing zone OR)
//! - **Event Pipeline**: double-buffered coalescing queue drained by a
//!   dedicated worker thread
//! - **Mock Swap**: a HAL test double can transparently replace the driver,
//!   invalidating all outstanding subscriptions
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vehicle_broker::{Caller, ListenerHandle, ListenerId, StaticAccessPolicy, SubscribeFlags, VehicleBroker};
//!
//! let broker = VehicleBroker::builder(hal, Box::new(StaticAccessPolicy::allow_all())).build();
//!
//! let caller = Caller::new(pid, uid);
//! let handle = ListenerHandle::new(ListenerId(1), listener);
//! broker.subscribe(caller, &handle, 0x100, 10.0, 0, SubscribeFlags::UNDEFINED)?;
//!
//! // Events now arrive batched on listener.on_events(...)
//! ```

pub mod access;
pub mod broker;
mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
mod pipeline;
pub mod registry;
pub mod subscription;

// Re-export main types
pub use access::{AccessPolicy, PolicyEntry, StaticAccessPolicy};
pub use broker::{BrokerBuilder, VehicleBroker};
pub use client::{
    Caller, DeathWatch, ListenerHandle, ListenerId, NoopDeathWatch, VehicleListener,
};
pub use config::BrokerConfig;
pub use error::{BrokerError, Result};
pub use logging::{init_logging, init_logging_from_env, LoggingMode};
pub use registry::{INTERNAL_APP_CONTEXT, INTERNAL_AUDIO_FOCUS};
pub use subscription::{SubscribeFlags, SubscriptionInfo};
