//! Client records and listener contracts.
//!
//! Every connected client process is represented by one [`ClientRecord`],
//! keyed by the opaque identity of its listener handle. Records exist only
//! while the client is active: at least one subscription, or one of the
//! monitor flags set. The transport reports handle deaths through the
//! broker, which drops the record and unwinds its subscriptions.

use std::collections::HashMap;
use std::sync::Arc;

use vehicle_hal::PropertyValue;

use crate::subscription::SubscriptionInfo;

/// Opaque, hashable identity of a transport handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

/// Identity of the process making a broker call, supplied by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub pid: u32,
    pub uid: u32,
}

impl Caller {
    pub fn new(pid: u32, uid: u32) -> Self {
        Self { pid, uid }
    }
}

/// Callbacks delivered to a client. Each is a one-way call; implementations
/// should hand off to their transport quickly and must tolerate delivery
/// after the client initiated teardown.
pub trait VehicleListener: Send + Sync {
    /// A coalesced batch of property events. `dispatched_at_ns` stamps the
    /// moment the batch left the broker.
    fn on_events(&self, events: Vec<PropertyValue>, dispatched_at_ns: i64);

    /// A HAL error relevant to this client (subscribed property or global).
    fn on_hal_error(&self, error_code: i32, property: i32, operation: i32);

    /// The active HAL was swapped (mock registered or removed). All of this
    /// client's subscriptions were invalidated.
    fn on_hal_restart(&self, mocking: bool);

    /// Someone set a property this client subscribed to with the set-call
    /// flag.
    fn on_property_set(&self, value: PropertyValue);
}

/// Transport hook for liveness tracking.
///
/// The broker links a watch when it creates a client record and unlinks it
/// when the record is dropped; the transport calls
/// [`VehicleBroker::handle_listener_death`](crate::VehicleBroker::handle_listener_death)
/// when a watched handle dies.
pub trait DeathWatch: Send + Sync {
    fn link(&self, id: ListenerId);
    fn unlink(&self, id: ListenerId);
}

/// Death watch that tracks nothing. For embedders whose transport has its
/// own liveness machinery.
pub struct NoopDeathWatch;

impl DeathWatch for NoopDeathWatch {
    fn link(&self, _id: ListenerId) {}
    fn unlink(&self, _id: ListenerId) {}
}

/// A listener plus its transport identity, as presented to broker calls.
#[derive(Clone)]
pub struct ListenerHandle {
    pub id: ListenerId,
    pub listener: Arc<dyn VehicleListener>,
}

impl ListenerHandle {
    pub fn new(id: ListenerId, listener: Arc<dyn VehicleListener>) -> Self {
        Self { id, listener }
    }
}

/// Broker-side state for one client.
pub(crate) struct ClientRecord {
    pub(crate) pid: u32,
    pub(crate) uid: u32,
    pub(crate) listener: Arc<dyn VehicleListener>,
    pub(crate) subscriptions: HashMap<i32, SubscriptionInfo>,
    pub(crate) monitors_errors: bool,
    pub(crate) monitors_restart: bool,
    /// Events queued during dispatch assembly, flushed in one call.
    pub(crate) pending: Vec<PropertyValue>,
}

impl ClientRecord {
    pub(crate) fn new(caller: Caller, listener: Arc<dyn VehicleListener>) -> Self {
        Self {
            pid: caller.pid,
            uid: caller.uid,
            listener,
            subscriptions: HashMap::new(),
            monitors_errors: false,
            monitors_restart: false,
            pending: Vec::new(),
        }
    }

    /// A client must be kept iff it subscribes to anything or monitors
    /// errors or restarts.
    pub(crate) fn is_active(&self) -> bool {
        !self.subscriptions.is_empty() || self.monitors_errors || self.monitors_restart
    }

    pub(crate) fn subscription(&self, prop: i32) -> Option<&SubscriptionInfo> {
        self.subscriptions.get(&prop)
    }

    /// Insert or replace; a second subscribe to the same property updates
    /// the record rather than duplicating it.
    pub(crate) fn set_subscription(&mut self, prop: i32, info: SubscriptionInfo) {
        self.subscriptions.insert(prop, info);
    }

    /// Remove the property; returns whether the client is still active.
    pub(crate) fn remove_subscription(&mut self, prop: i32) -> bool {
        self.subscriptions.remove(&prop);
        self.is_active()
    }

    pub(crate) fn enqueue_event(&mut self, value: PropertyValue) {
        self.pending.push(value);
    }

    pub(crate) fn take_pending(&mut self) -> Vec<PropertyValue> {
        std::mem::take(&mut self.pending)
    }
}
