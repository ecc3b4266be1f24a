//! The broker facade.
//!
//! One [`VehicleBroker`] multiplexes a single HAL driver across many client
//! processes: it gates every operation through the access policy, validates
//! against the property registry, folds per-client subscriptions into one
//! driver subscription per property, and fans driver events back out through
//! the event pipeline. A registered mock transparently replaces the driver
//! for testing.
//!
//! # Locking
//!
//! All registry/client/subscription state lives under one coarse mutex.
//! Dispatch sets are gathered under the lock and delivered after it is
//! released; the lock is never held across a HAL `get`/`set` or any listener
//! call.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};

use vehicle_hal::{
    is_internal_property, HalCallbacks, HalError, PropertyConfig, PropertyValue, VehicleHal,
    VehicleHalMock,
};

use crate::access::AccessPolicy;
use crate::cache::PropertyValueCache;
use crate::client::{
    Caller, ClientRecord, DeathWatch, ListenerHandle, ListenerId, NoopDeathWatch, VehicleListener,
};
use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::pipeline::{
    monotonic_now_ns, spawn_event_worker, EventDispatcher, EventPipeline, HalErrorEvent,
};
use crate::registry::PropertyRegistry;
use crate::subscription::{
    normalize_sample_rate, normalize_zones, AggregateSubscription, SubscribeFlags,
    SubscriptionInfo,
};

/// Per-property delivery statistics.
#[derive(Debug, Clone, Copy, Default)]
struct EventInfo {
    count: i64,
    last_timestamp_ns: i64,
}

struct MockEntry {
    id: ListenerId,
    mock: Arc<dyn VehicleHalMock>,
}

/// Everything guarded by the broker lock.
struct BrokerState {
    registry: PropertyRegistry,
    cache: PropertyValueCache,
    clients: HashMap<ListenerId, ClientRecord>,
    property_to_clients: HashMap<i32, Vec<ListenerId>>,
    subscription_infos: HashMap<i32, AggregateSubscription>,
    event_infos: HashMap<i32, EventInfo>,
    set_call_properties: HashSet<i32>,
    mock: Option<MockEntry>,
    dropped_while_mocking: u64,
    last_drop_time_ns: i64,
}

impl BrokerState {
    fn new(registry: PropertyRegistry) -> Self {
        Self {
            registry,
            cache: PropertyValueCache::new(),
            clients: HashMap::new(),
            property_to_clients: HashMap::new(),
            subscription_infos: HashMap::new(),
            event_infos: HashMap::new(),
            set_call_properties: HashSet::new(),
            mock: None,
            dropped_while_mocking: 0,
            last_drop_time_ns: 0,
        }
    }

    fn find_or_create_client<'a>(
        &'a mut self,
        caller: Caller,
        handle: &ListenerHandle,
        death_watch: &dyn DeathWatch,
    ) -> &'a mut ClientRecord {
        self.clients.entry(handle.id).or_insert_with(|| {
            tracing::debug!("registering client pid {}, uid {}", caller.pid, caller.uid);
            death_watch.link(handle.id);
            ClientRecord::new(caller, handle.listener.clone())
        })
    }

    /// Remove `id` from the property's subscriber set and repair the
    /// set-call set. Returns true when the property lost its last
    /// subscriber (aggregate dropped, HAL unsubscribe due).
    fn remove_subscriber(&mut self, prop: i32, id: ListenerId) -> bool {
        let Some(subscribers) = self.property_to_clients.get_mut(&prop) else {
            return false;
        };
        subscribers.retain(|s| *s != id);
        let empty = subscribers.is_empty();
        if empty {
            self.property_to_clients.remove(&prop);
            self.subscription_infos.remove(&prop);
        }
        if !self.has_set_call_subscriber(prop) {
            self.set_call_properties.remove(&prop);
        }
        empty
    }

    fn has_set_call_subscriber(&self, prop: i32) -> bool {
        let Some(subscribers) = self.property_to_clients.get(&prop) else {
            return false;
        };
        subscribers.iter().any(|id| {
            self.clients
                .get(id)
                .and_then(|c| c.subscription(prop))
                .map_or(false, |info| info.flags.has_set_call())
        })
    }

    /// Wipe every subscription on a HAL swap. Collects restart-monitoring
    /// listeners for notification and drops clients left inactive.
    fn invalidate_subscriptions(
        &mut self,
        to_notify: &mut Vec<Arc<dyn VehicleListener>>,
        death_watch: &dyn DeathWatch,
    ) {
        self.property_to_clients.clear();
        self.subscription_infos.clear();
        self.event_infos.clear();
        self.set_call_properties.clear();
        let mut to_remove = Vec::new();
        for (id, client) in self.clients.iter_mut() {
            client.subscriptions.clear();
            if client.monitors_restart {
                to_notify.push(client.listener.clone());
            }
            if !client.is_active() {
                to_remove.push(*id);
            }
        }
        for id in to_remove {
            self.clients.remove(&id);
            death_watch.unlink(id);
        }
    }
}

/// Shared guts of the broker: the facade, the HAL callbacks, and the event
/// worker all reach state through this.
struct BrokerCore {
    config: BrokerConfig,
    policy: Box<dyn AccessPolicy>,
    hal: Arc<dyn VehicleHal>,
    death_watch: Arc<dyn DeathWatch>,
    pipeline: EventPipeline,
    state: Mutex<BrokerState>,
    hal_ready: AtomicBool,
}

impl BrokerCore {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn hal_ready(&self) -> bool {
        self.hal_ready.load(Ordering::Acquire)
    }

    fn get_with_retry(&self, value: &mut PropertyValue) -> Result<()> {
        if !self.hal_ready() {
            return Err(BrokerError::NotInitialized);
        }
        let mut retries = 0;
        loop {
            match self.hal.get(value) {
                Ok(()) => return Ok(()),
                Err(HalError::NotReady) => {
                    retries += 1;
                    if retries > self.config.get_set_retries {
                        tracing::error!("vehicle HAL get, not ready after retries");
                        return Err(BrokerError::NotReady);
                    }
                    thread::sleep(self.config.get_set_retry_wait);
                }
                Err(e) => {
                    tracing::warn!("get {:#x} failed, HAL returned {}", value.prop, e);
                    return Err(BrokerError::Hal(e));
                }
            }
        }
    }

    fn set_with_retry(&self, value: &PropertyValue) -> Result<()> {
        if !self.hal_ready() {
            return Err(BrokerError::NotInitialized);
        }
        let mut retries = 0;
        loop {
            match self.hal.set(value) {
                Ok(()) => return Ok(()),
                Err(HalError::NotReady) => {
                    retries += 1;
                    if retries > self.config.get_set_retries {
                        tracing::error!("vehicle HAL set, not ready after retries");
                        return Err(BrokerError::NotReady);
                    }
                    thread::sleep(self.config.get_set_retry_wait);
                }
                Err(e) => {
                    tracing::warn!("set {:#x} failed, HAL returned {}", value.prop, e);
                    return Err(BrokerError::Hal(e));
                }
            }
        }
    }

    /// Ingest one event. Real-HAL events are dropped (and counted) while a
    /// mock is registered; injected events always pass.
    fn on_hal_event(&self, value: PropertyValue, injected: bool) {
        {
            let mut state = self.state();
            if !injected && state.mock.is_some() {
                state.dropped_while_mocking += 1;
                state.last_drop_time_ns = monotonic_now_ns();
                return;
            }
            let info = state.event_infos.entry(value.prop).or_default();
            info.count += 1;
            info.last_timestamp_ns = value.timestamp_ns;
        }
        self.pipeline.publish_event(value);
    }

    /// Ingest one error. Real-HAL errors are silently dropped while a mock
    /// is registered.
    fn on_hal_error(&self, error_code: i32, property: i32, operation: i32, injected: bool) {
        {
            let state = self.state();
            if !injected && state.mock.is_some() {
                return;
            }
        }
        tracing::info!(
            "HAL error, code {}, property {:#x}, operation {}, injected {}",
            error_code,
            property,
            operation,
            injected
        );
        self.pipeline.publish_error(HalErrorEvent {
            error_code,
            property,
            operation,
        });
    }

    /// Prime a fresh subscription with the current value, one fetch per
    /// requested zone (all supported zones when `zones == 0`). Not-ready is
    /// skipped per zone; any other error aborts.
    fn notify_with_current_value(
        &self,
        mock: Option<&Arc<dyn VehicleHalMock>>,
        config: &PropertyConfig,
        zones: i32,
    ) -> Result<()> {
        if config.is_zoned() {
            let requested = if zones == 0 { config.zone_flags } else { zones };
            for shift in 0..32 {
                let zone = (1u32 << shift) as i32;
                if requested & zone == zone {
                    self.fetch_current_value(mock, config, zone)?;
                }
            }
        } else {
            self.fetch_current_value(mock, config, 0)?;
        }
        Ok(())
    }

    fn fetch_current_value(
        &self,
        mock: Option<&Arc<dyn VehicleHalMock>>,
        config: &PropertyConfig,
        zone: i32,
    ) -> Result<()> {
        let mut value = PropertyValue::request(config.prop, config.value_type, zone);
        let result = match mock {
            Some(mock) => mock.on_property_get(&mut value),
            None => self.hal.get(&mut value),
        };
        match result {
            Ok(()) => {
                self.on_hal_event(value, true);
                Ok(())
            }
            Err(HalError::NotReady) => {
                tracing::debug!("initial value not ready, {:#x} zone {:#x}", config.prop, zone);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    "failed to get current value {:#x} zone {:#x}: {}",
                    config.prop,
                    zone,
                    e
                );
                Err(match mock {
                    Some(_) => BrokerError::MockRejected(e),
                    None => BrokerError::Hal(e),
                })
            }
        }
    }
}

impl EventDispatcher for BrokerCore {
    fn dispatch_events(&self, events: Vec<PropertyValue>) {
        let flushes: Vec<(Arc<dyn VehicleListener>, Vec<PropertyValue>)> = {
            let mut state = self.state();
            let mut touched: Vec<ListenerId> = Vec::new();
            let BrokerState {
                property_to_clients,
                clients,
                ..
            } = &mut *state;
            for event in &events {
                let Some(subscribers) = property_to_clients.get(&event.prop) else {
                    tracing::trace!("event for unsubscribed property {:#x}", event.prop);
                    continue;
                };
                for id in subscribers {
                    let Some(client) = clients.get_mut(id) else {
                        continue;
                    };
                    match client.subscription(event.prop) {
                        Some(info) if info.flags.has_hal_event() => {
                            client.enqueue_event(event.clone());
                            if !touched.contains(id) {
                                touched.push(*id);
                            }
                        }
                        _ => {}
                    }
                }
            }
            touched
                .iter()
                .filter_map(|id| {
                    clients
                        .get_mut(id)
                        .map(|c| (c.listener.clone(), c.take_pending()))
                })
                .collect()
        };
        let now = monotonic_now_ns();
        for (listener, batch) in flushes {
            if !batch.is_empty() {
                listener.on_events(batch, now);
            }
        }
    }

    fn dispatch_error(&self, error: HalErrorEvent) {
        let targets: Vec<Arc<dyn VehicleListener>> = {
            let state = self.state();
            let mut targets = Vec::new();
            if error.property != 0 {
                if let Some(subscribers) = state.property_to_clients.get(&error.property) {
                    for id in subscribers {
                        if let Some(client) = state.clients.get(id) {
                            targets.push(client.listener.clone());
                        }
                    }
                }
            }
            // Global errors, and property errors nobody subscribes to, go to
            // the error monitors instead.
            if error.property == 0 || targets.is_empty() {
                for client in state.clients.values() {
                    if client.monitors_errors {
                        targets.push(client.listener.clone());
                    }
                }
            }
            targets
        };
        tracing::info!(
            "dispatch HAL error, code {}, property {:#x}, operation {}, {} clients",
            error.error_code,
            error.property,
            error.operation,
            targets.len()
        );
        for listener in targets {
            listener.on_hal_error(error.error_code, error.property, error.operation);
        }
    }
}

/// HAL-facing callbacks, bound over a weak core reference so a released
/// broker stops accepting driver traffic.
struct BrokerHalCallbacks {
    core: Weak<BrokerCore>,
}

impl HalCallbacks for BrokerHalCallbacks {
    fn on_event(&self, value: PropertyValue) {
        if let Some(core) = self.core.upgrade() {
            core.on_hal_event(value, false);
        }
    }

    fn on_error(&self, error_code: i32, property: i32, operation: i32) {
        if let Some(core) = self.core.upgrade() {
            core.on_hal_error(error_code, property, operation, false);
        }
    }
}

// ============================================================================
// VehicleBroker
// ============================================================================

/// The vehicle network service core.
///
/// Construct with [`VehicleBroker::builder`]; the builder spawns the event
/// worker, binds callbacks into the HAL, and loads the property list. A HAL
/// whose `init` fails leaves the broker alive but unable to serve real-HAL
/// operations until a mock is registered.
pub struct VehicleBroker {
    core: Arc<BrokerCore>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Builder for [`VehicleBroker`].
pub struct BrokerBuilder {
    hal: Arc<dyn VehicleHal>,
    policy: Box<dyn AccessPolicy>,
    config: BrokerConfig,
    death_watch: Arc<dyn DeathWatch>,
    internal_properties: Vec<PropertyConfig>,
}

impl BrokerBuilder {
    pub fn new(hal: Arc<dyn VehicleHal>, policy: Box<dyn AccessPolicy>) -> Self {
        Self {
            hal,
            policy,
            config: BrokerConfig::default(),
            death_watch: Arc::new(NoopDeathWatch),
            internal_properties: Vec::new(),
        }
    }

    /// Override the tuning configuration.
    pub fn config(mut self, config: BrokerConfig) -> Self {
        self.config = config;
        self
    }

    /// Install the transport's liveness hook.
    pub fn death_watch(mut self, death_watch: Arc<dyn DeathWatch>) -> Self {
        self.death_watch = death_watch;
        self
    }

    /// Register an extra internal property. The ID must fall in the
    /// reserved internal range; anything else is rejected.
    pub fn internal_property(mut self, config: PropertyConfig) -> Self {
        if is_internal_property(config.prop) {
            self.internal_properties.push(config);
        } else {
            tracing::error!(
                "internal property {:#x} outside reserved range, ignoring",
                config.prop
            );
        }
        self
    }

    /// Spawn the event worker, init the HAL, and load the property list.
    pub fn build(self) -> VehicleBroker {
        let (pipeline, worker_ctx) = EventPipeline::new(self.config.dispatch_interval);

        let mut registry = PropertyRegistry::new();
        for config in self.internal_properties {
            registry.add_internal(config);
        }

        let core = Arc::new(BrokerCore {
            config: self.config,
            policy: self.policy,
            hal: self.hal,
            death_watch: self.death_watch,
            pipeline,
            state: Mutex::new(BrokerState::new(registry)),
            hal_ready: AtomicBool::new(false),
        });

        let worker = spawn_event_worker(
            worker_ctx,
            Arc::downgrade(&core) as Weak<dyn EventDispatcher>,
        );

        let callbacks = Arc::new(BrokerHalCallbacks {
            core: Arc::downgrade(&core),
        });
        match core.hal.init(callbacks) {
            Ok(()) => {
                let configs = core.hal.list_properties();
                tracing::info!("HAL initialized, {} properties", configs.len());
                core.state().registry.set_real_list(configs);
                core.hal_ready.store(true, Ordering::Release);
            }
            Err(e) => {
                tracing::error!("HAL init failed: {}", e);
            }
        }

        VehicleBroker {
            core,
            worker: Mutex::new(Some(worker)),
        }
    }
}

impl VehicleBroker {
    pub fn builder(hal: Arc<dyn VehicleHal>, policy: Box<dyn AccessPolicy>) -> BrokerBuilder {
        BrokerBuilder::new(hal, policy)
    }

    /// The active property list when `prop == 0`, else a singleton (empty
    /// if unknown). Mocking-aware.
    pub fn list_properties(&self, prop: i32) -> Vec<PropertyConfig> {
        self.core.state().registry.list(prop)
    }

    /// Read a property into `value` (`value.prop` selects it). Internal
    /// properties come from the cache; everything else from the active HAL
    /// with a bounded not-ready retry.
    pub fn get(&self, caller: Caller, value: &mut PropertyValue) -> Result<()> {
        let prop = value.prop;
        if !self.core.policy.test_access(prop, caller.uid, false) {
            tracing::warn!("property {:#x}: read not allowed for uid {}", prop, caller.uid);
            return Err(BrokerError::PermissionDenied {
                property: prop,
                uid: caller.uid,
                write: false,
            });
        }
        let mock = {
            let state = self.core.state();
            if !state.registry.is_gettable(prop) {
                return Err(BrokerError::bad_value(prop, "not gettable"));
            }
            if is_internal_property(prop) {
                return if state.cache.read(value) {
                    Ok(())
                } else {
                    Err(BrokerError::bad_value(prop, "no cached value"))
                };
            }
            state.mock.as_ref().map(|e| e.mock.clone())
        };
        // HAL access happens outside the lock to allow concurrent callers
        match mock {
            Some(mock) => mock.on_property_get(value).map_err(|e| {
                tracing::warn!("get {:#x} failed, mock returned {}", prop, e);
                BrokerError::MockRejected(e)
            }),
            None => self.core.get_with_retry(value),
        }
    }

    /// Write a property. Internal properties hit the cache and are
    /// republished as events; everything else goes to the active HAL.
    /// Subscribers with the set-call flag are notified after success.
    pub fn set(&self, caller: Caller, value: &PropertyValue) -> Result<()> {
        let prop = value.prop;
        if !self.core.policy.test_access(prop, caller.uid, true) {
            tracing::warn!("property {:#x}: write not allowed for uid {}", prop, caller.uid);
            return Err(BrokerError::PermissionDenied {
                property: prop,
                uid: caller.uid,
                write: true,
            });
        }
        let internal = is_internal_property(prop);
        let (mock, set_call_targets) = {
            let mut state = self.core.state();
            if !state.registry.is_settable(prop, value.value_type) {
                return Err(BrokerError::bad_value(prop, "not settable"));
            }
            if internal {
                state.cache.write(value.clone());
            }
            let mock = state.mock.as_ref().map(|e| e.mock.clone());
            let mut targets: Vec<Arc<dyn VehicleListener>> = Vec::new();
            if state.set_call_properties.contains(&prop) {
                if let Some(subscribers) = state.property_to_clients.get(&prop) {
                    for id in subscribers {
                        let Some(client) = state.clients.get(id) else {
                            continue;
                        };
                        let Some(info) = client.subscription(prop) else {
                            continue;
                        };
                        let zone_match =
                            value.zone == info.zones || (value.zone & info.zones) != 0;
                        if info.flags.has_set_call() && zone_match {
                            targets.push(client.listener.clone());
                        }
                    }
                }
            }
            (mock, targets)
        };

        if let Some(mock) = mock {
            mock.on_property_set(value).map_err(|e| {
                tracing::warn!("set {:#x} failed, mock returned {}", prop, e);
                BrokerError::MockRejected(e)
            })?;
        } else if !internal {
            self.core.set_with_retry(value)?;
        }

        for listener in set_call_targets {
            listener.on_property_set(value.clone());
        }

        if internal {
            // Internal writes are republished to subscribers as events
            self.core.on_hal_event(value.clone(), true);
        }
        Ok(())
    }

    /// Subscribe `handle` to `prop`. The rate is clamped (or zeroed for
    /// fixed-rate properties), the zone mask validated, and the per-property
    /// driver subscription raised when the aggregate grows. Undefined flags
    /// default to driver events only.
    ///
    /// When the driver rejects the aggregate subscription the client record
    /// is kept and the error returned; callers may retry.
    pub fn subscribe(
        &self,
        caller: Caller,
        handle: &ListenerHandle,
        prop: i32,
        sample_rate: f32,
        zones: i32,
        flags: SubscribeFlags,
    ) -> Result<()> {
        let flags = if flags.is_undefined() {
            SubscribeFlags::DEFAULT
        } else {
            flags
        };
        if !self.core.policy.test_access(prop, caller.uid, false) {
            tracing::warn!(
                "property {:#x}: subscribe not allowed for uid {}",
                prop,
                caller.uid
            );
            return Err(BrokerError::PermissionDenied {
                property: prop,
                uid: caller.uid,
                write: false,
            });
        }

        let mut hal_call: Option<(f32, i32)> = None;
        let mut mock: Option<Arc<dyn VehicleHalMock>> = None;
        let mut auto_get = false;
        let config;
        let requested_zones;
        {
            let mut state = self.core.state();
            if !state.registry.is_subscribable(prop) {
                return Err(BrokerError::bad_value(prop, "not subscribable"));
            }
            let Some(found) = state.registry.find(prop).cloned() else {
                return Err(BrokerError::bad_value(prop, "unknown property"));
            };
            config = found;
            if flags.has_set_call() && !config.access.can_write() {
                tracing::error!(
                    "subscribe with set-call flag to {:#x} without write access",
                    prop
                );
                return Err(BrokerError::bad_value(
                    prop,
                    "set-call flag on read-only property",
                ));
            }
            let rate = normalize_sample_rate(&config, sample_rate);
            let Some(zones) = normalize_zones(&config, zones) else {
                return Err(BrokerError::bad_value(prop, "zones out of range"));
            };
            requested_zones = zones;

            let client = state.find_or_create_client(caller, handle, &*self.core.death_watch);
            client.set_subscription(
                prop,
                SubscriptionInfo {
                    sample_rate: rate,
                    zones,
                    flags,
                },
            );
            let subscribers = state.property_to_clients.entry(prop).or_default();
            if !subscribers.contains(&handle.id) {
                subscribers.push(handle.id);
            }
            if flags.has_set_call() {
                state.set_call_properties.insert(prop);
            } else if !state.has_set_call_subscriber(prop) {
                // A replacing subscription may have dropped the flag
                state.set_call_properties.remove(&prop);
            }

            let (aggregate, changed) = AggregateSubscription::merge(
                state.subscription_infos.get(&prop),
                rate,
                zones,
                flags,
            );
            if changed {
                state.subscription_infos.insert(prop, aggregate);
                if is_internal_property(prop) {
                    tracing::debug!("subscribe to internal property {:#x}", prop);
                    return Ok(());
                }
                auto_get = self.core.policy.is_auto_get_enabled(prop);
                mock = state.mock.as_ref().map(|e| e.mock.clone());
                hal_call = Some((aggregate.sample_rate, aggregate.zones));
            }
        }

        if let Some((rate, agg_zones)) = hal_call {
            if flags.has_hal_event() {
                match &mock {
                    Some(mock) => {
                        mock.on_property_subscribe(prop, rate, agg_zones).map_err(|e| {
                            tracing::warn!("subscribe {:#x} failed, mock returned {}", prop, e);
                            BrokerError::MockRejected(e)
                        })?;
                    }
                    None => {
                        if !self.core.hal_ready() {
                            return Err(BrokerError::NotInitialized);
                        }
                        tracing::debug!(
                            "subscribe to HAL, prop {:#x} rate {} zones {:#x}",
                            prop,
                            rate,
                            agg_zones
                        );
                        self.core.hal.subscribe(prop, rate, agg_zones).map_err(|e| {
                            tracing::warn!("subscribe {:#x} failed, HAL returned {}", prop, e);
                            BrokerError::Hal(e)
                        })?;
                    }
                }
            }
            if auto_get && config.change_mode.is_fixed_rate() {
                self.core
                    .notify_with_current_value(mock.as_ref(), &config, requested_zones)?;
            }
        }
        Ok(())
    }

    /// Remove `handle`'s subscription to `prop`. Unknown clients and
    /// non-subscribable properties are silent no-ops. The driver is
    /// unsubscribed when the last subscriber leaves; the aggregate rate is
    /// intentionally never lowered before that point.
    pub fn unsubscribe(&self, caller: Caller, id: ListenerId, prop: i32) -> Result<()> {
        if !self.core.policy.test_access(prop, caller.uid, false) {
            return Err(BrokerError::PermissionDenied {
                property: prop,
                uid: caller.uid,
                write: false,
            });
        }
        let should_unsubscribe;
        let mut mock: Option<Arc<dyn VehicleHalMock>> = None;
        {
            let mut state = self.core.state();
            if !state.registry.is_subscribable(prop) {
                return Ok(());
            }
            let Some(client) = state.clients.get_mut(&id) else {
                tracing::debug!("unsubscribe, client not registered");
                return Ok(());
            };
            let still_active = client.remove_subscription(prop);
            if !still_active {
                state.clients.remove(&id);
                self.core.death_watch.unlink(id);
            }
            should_unsubscribe = state.remove_subscriber(prop, id);
            if is_internal_property(prop) {
                tracing::debug!("unsubscribe from internal property {:#x}", prop);
                return Ok(());
            }
            if should_unsubscribe {
                mock = state.mock.as_ref().map(|e| e.mock.clone());
            }
        }
        if should_unsubscribe {
            match mock {
                Some(mock) => {
                    let _ = mock.on_property_unsubscribe(prop);
                }
                None => {
                    if let Err(e) = self.core.hal.unsubscribe(prop) {
                        tracing::warn!("unsubscribe {:#x} failed, HAL returned {}", prop, e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Inject a property event, bypassing the mocking drop filter.
    pub fn inject_event(&self, value: PropertyValue) {
        tracing::info!("inject event, property {:#x}", value.prop);
        self.core.on_hal_event(value, true);
    }

    /// Inject a HAL error, bypassing the mocking drop filter. `property` 0
    /// means global.
    pub fn inject_hal_error(&self, error_code: i32, property: i32, operation: i32) {
        self.core.on_hal_error(error_code, property, operation, true);
    }

    /// Register `handle` for HAL error notifications.
    pub fn start_error_listening(&self, caller: Caller, handle: &ListenerHandle) {
        let mut state = self.core.state();
        let client = state.find_or_create_client(caller, handle, &*self.core.death_watch);
        client.monitors_errors = true;
    }

    /// Stop error notifications; drops the record if nothing else keeps the
    /// client active.
    pub fn stop_error_listening(&self, id: ListenerId) {
        let mut state = self.core.state();
        if let Some(client) = state.clients.get_mut(&id) {
            client.monitors_errors = false;
            if !client.is_active() {
                state.clients.remove(&id);
                self.core.death_watch.unlink(id);
            }
        }
    }

    /// Register `handle` for HAL restart (mock swap) notifications.
    pub fn start_hal_restart_monitoring(&self, caller: Caller, handle: &ListenerHandle) {
        let mut state = self.core.state();
        let client = state.find_or_create_client(caller, handle, &*self.core.death_watch);
        client.monitors_restart = true;
    }

    /// Stop restart notifications; drops the record if nothing else keeps
    /// the client active.
    pub fn stop_hal_restart_monitoring(&self, id: ListenerId) {
        let mut state = self.core.state();
        if let Some(client) = state.clients.get_mut(&id) {
            client.monitors_restart = false;
            if !client.is_active() {
                state.clients.remove(&id);
                self.core.death_watch.unlink(id);
            }
        }
    }

    /// Replace the active HAL with a mock. Every outstanding subscription
    /// is invalidated, buffered events are discarded, and restart monitors
    /// are told `mocking = true`. A duplicate start replaces the previous
    /// mock.
    pub fn start_mocking(&self, handle_id: ListenerId, mock: Arc<dyn VehicleHalMock>) {
        let mut to_notify: Vec<Arc<dyn VehicleListener>> = Vec::new();
        {
            let mut state = self.core.state();
            if let Some(prev) = state.mock.take() {
                // Tolerated so a crashed test run can restart cleanly
                tracing::warn!("start_mocking while already enabled");
                self.core.death_watch.unlink(prev.id);
            }
            tracing::warn!("starting vehicle HAL mocking");
            self.core.death_watch.link(handle_id);
            // The mock must answer on_list_properties without calling back
            // into the broker, or this deadlocks.
            let configs = mock.on_list_properties();
            state.registry.set_mock_list(configs);
            state.mock = Some(MockEntry {
                id: handle_id,
                mock,
            });
            state.invalidate_subscriptions(&mut to_notify, &*self.core.death_watch);
        }
        self.core.pipeline.discard_events();
        for listener in to_notify {
            listener.on_hal_restart(true);
        }
    }

    /// Remove the mock and restore the real HAL. A mock other than the
    /// registered one is ignored. Restart monitors are told
    /// `mocking = false`.
    pub fn stop_mocking(&self, mock: &Arc<dyn VehicleHalMock>) {
        let mut to_notify: Vec<Arc<dyn VehicleListener>> = Vec::new();
        {
            let mut state = self.core.state();
            let Some(entry) = state.mock.as_ref() else {
                return;
            };
            if !Arc::ptr_eq(&entry.mock, mock) {
                tracing::error!("stop_mocking, not the registered mock");
                return;
            }
            tracing::warn!("stopping vehicle HAL mocking");
            let Some(entry) = state.mock.take() else {
                return;
            };
            self.core.death_watch.unlink(entry.id);
            state.registry.clear_mock_list();
            state.invalidate_subscriptions(&mut to_notify, &*self.core.death_watch);
        }
        self.core.pipeline.discard_events();
        for listener in to_notify {
            listener.on_hal_restart(false);
        }
    }

    /// Transport entry point: a watched listener handle died. Removes the
    /// client and unsubscribes the driver from properties left without
    /// subscribers.
    pub fn handle_listener_death(&self, id: ListenerId) {
        let mut to_unsubscribe: Vec<i32> = Vec::new();
        let mut mock: Option<Arc<dyn VehicleHalMock>> = None;
        {
            let mut state = self.core.state();
            self.core.death_watch.unlink(id);
            let Some(client) = state.clients.remove(&id) else {
                // already removed, ignore
                return;
            };
            tracing::warn!("client death, pid {}, uid {}", client.pid, client.uid);
            for prop in client.subscriptions.keys().copied() {
                if state.remove_subscriber(prop, id) {
                    to_unsubscribe.push(prop);
                }
            }
            if !to_unsubscribe.is_empty() {
                mock = state.mock.as_ref().map(|e| e.mock.clone());
            }
        }
        for prop in to_unsubscribe {
            if is_internal_property(prop) {
                continue;
            }
            match &mock {
                Some(mock) => {
                    let _ = mock.on_property_unsubscribe(prop);
                }
                None => {
                    if let Err(e) = self.core.hal.unsubscribe(prop) {
                        tracing::warn!("unsubscribe {:#x} failed, HAL returned {}", prop, e);
                    }
                }
            }
        }
    }

    /// Transport entry point: the registered mock's handle died. Equivalent
    /// to `stop_mocking` for the current mock.
    pub fn handle_mock_death(&self) {
        let mock = {
            let state = self.core.state();
            state.mock.as_ref().map(|e| e.mock.clone())
        };
        if let Some(mock) = mock {
            tracing::error!("HAL mock died");
            self.stop_mocking(&mock);
        }
    }

    /// Human-readable diagnostic snapshot. No consumer depends on the exact
    /// format.
    pub fn dump(&self) -> String {
        use std::fmt::Write as _;

        let mut out = String::new();
        {
            let state = self.core.state();
            let _ = writeln!(out, "mocking enabled: {}", state.mock.is_some());
            let _ = writeln!(out, "*Event pipeline, now in ns: {}*", monotonic_now_ns());
            self.core.pipeline.dump(&mut out);

            let _ = writeln!(out, "*Properties*");
            for config in state.registry.list(0) {
                let _ = writeln!(
                    out,
                    "property {:#x}, type {:?}, access {:?}, change mode {:?}, zones {:#x}",
                    config.prop, config.value_type, config.access, config.change_mode,
                    config.zone_flags
                );
            }

            let _ = writeln!(out, "*Active clients*");
            let mut ids: Vec<_> = state.clients.keys().copied().collect();
            ids.sort_unstable();
            for id in &ids {
                let client = &state.clients[id];
                let _ = writeln!(
                    out,
                    "handle {}, pid {}, uid {}, subscriptions {}, monitors errors {}, monitors restart {}",
                    id.0,
                    client.pid,
                    client.uid,
                    client.subscriptions.len(),
                    client.monitors_errors,
                    client.monitors_restart
                );
            }

            let _ = writeln!(out, "*Active clients per property*");
            let mut props: Vec<_> = state.property_to_clients.keys().copied().collect();
            props.sort_unstable();
            for prop in &props {
                let pids: Vec<u32> = state.property_to_clients[prop]
                    .iter()
                    .filter_map(|id| state.clients.get(id).map(|c| c.pid))
                    .collect();
                let _ = writeln!(out, "prop {:#x}, pids {:?}", prop, pids);
            }

            let _ = writeln!(out, "*Subscription info per property*");
            let mut props: Vec<_> = state.subscription_infos.keys().copied().collect();
            props.sort_unstable();
            for prop in &props {
                let info = &state.subscription_infos[prop];
                let _ = writeln!(
                    out,
                    "prop {:#x}, sample rate {} Hz, zones {:#x}, flags {:#x}",
                    prop,
                    info.sample_rate,
                    info.zones,
                    info.flags.bits()
                );
            }

            let _ = writeln!(out, "*Event info per property*");
            let mut props: Vec<_> = state.event_infos.keys().copied().collect();
            props.sort_unstable();
            for prop in &props {
                let info = &state.event_infos[prop];
                let _ = writeln!(
                    out,
                    "prop {:#x}, event count {}, last timestamp {}",
                    prop, info.count, info.last_timestamp_ns
                );
            }
            let _ = writeln!(
                out,
                "events dropped while in mocking: {}, last drop time {}",
                state.dropped_while_mocking, state.last_drop_time_ns
            );

            let _ = writeln!(out, "*Access policy*");
            self.core.policy.dump(&mut out);
        }
        out.push_str("*Vehicle HAL*\n");
        self.core.hal.dump(&mut out);
        out
    }

    /// Stop the event worker and release the HAL. Idempotent.
    pub fn release(&self) {
        self.core.pipeline.shutdown();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            let _ = worker.join();
        }
        if self.core.hal_ready.swap(false, Ordering::AcqRel) {
            self.core.hal.release();
        }
    }
}

impl Drop for VehicleBroker {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::StaticAccessPolicy;
    use crate::registry::INTERNAL_APP_CONTEXT;
    use std::sync::Mutex as StdMutex;
    use vehicle_hal::{Access, ChangeMode, HalResult, Value, ValueType};

    /// HAL stub with a fixed property table; records nothing.
    struct StubHal {
        configs: Vec<PropertyConfig>,
        fail_init: bool,
    }

    impl StubHal {
        fn new() -> Self {
            Self {
                configs: vec![PropertyConfig::new(
                    0x100,
                    ValueType::Float,
                    Access::ReadWrite,
                    ChangeMode::Continuous,
                )
                .with_sample_rate(1.0, 50.0)],
                fail_init: false,
            }
        }
    }

    impl VehicleHal for StubHal {
        fn init(&self, _callbacks: Arc<dyn HalCallbacks>) -> HalResult<()> {
            if self.fail_init {
                Err(HalError::Internal(-1))
            } else {
                Ok(())
            }
        }

        fn release(&self) {}

        fn list_properties(&self) -> Vec<PropertyConfig> {
            self.configs.clone()
        }

        fn get(&self, value: &mut PropertyValue) -> HalResult<()> {
            value.value = Value::Float(1.5);
            Ok(())
        }

        fn set(&self, _value: &PropertyValue) -> HalResult<()> {
            Ok(())
        }

        fn subscribe(&self, _prop: i32, _sample_rate: f32, _zones: i32) -> HalResult<()> {
            Ok(())
        }

        fn unsubscribe(&self, _prop: i32) -> HalResult<()> {
            Ok(())
        }
    }

    struct CollectingListener {
        restarts: StdMutex<Vec<bool>>,
    }

    impl CollectingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                restarts: StdMutex::new(Vec::new()),
            })
        }
    }

    impl VehicleListener for CollectingListener {
        fn on_events(&self, _events: Vec<PropertyValue>, _dispatched_at_ns: i64) {}
        fn on_hal_error(&self, _error_code: i32, _property: i32, _operation: i32) {}
        fn on_hal_restart(&self, mocking: bool) {
            self.restarts.lock().unwrap().push(mocking);
        }
        fn on_property_set(&self, _value: PropertyValue) {}
    }

    fn test_broker() -> VehicleBroker {
        VehicleBroker::builder(
            Arc::new(StubHal::new()),
            Box::new(StaticAccessPolicy::allow_all()),
        )
        .build()
    }

    fn caller() -> Caller {
        Caller::new(100, 1000)
    }

    #[test]
    fn test_list_properties_includes_internal() {
        let broker = test_broker();
        let all = broker.list_properties(0);
        assert!(all.iter().any(|c| c.prop == 0x100));
        assert!(all.iter().any(|c| c.prop == INTERNAL_APP_CONTEXT));
    }

    #[test]
    fn test_get_denied_without_policy() {
        let broker = VehicleBroker::builder(
            Arc::new(StubHal::new()),
            Box::new(StaticAccessPolicy::new()),
        )
        .build();
        let mut value = PropertyValue::request(0x100, ValueType::Float, 0);
        assert!(matches!(
            broker.get(caller(), &mut value),
            Err(BrokerError::PermissionDenied { .. })
        ));
    }

    #[test]
    fn test_get_from_real_hal() {
        let broker = test_broker();
        let mut value = PropertyValue::request(0x100, ValueType::Float, 0);
        broker.get(caller(), &mut value).unwrap();
        assert_eq!(value.value, Value::Float(1.5));
    }

    #[test]
    fn test_internal_set_then_get_round_trips() {
        let broker = test_broker();
        let written = PropertyValue::int32(INTERNAL_APP_CONTEXT, 7).with_timestamp(11);
        broker.set(caller(), &written).unwrap();

        let mut read = PropertyValue::request(INTERNAL_APP_CONTEXT, ValueType::Int32, 0);
        broker.get(caller(), &mut read).unwrap();
        assert_eq!(read.value, Value::Int32(7));
    }

    #[test]
    fn test_internal_get_without_set_fails() {
        let broker = test_broker();
        let mut read = PropertyValue::request(INTERNAL_APP_CONTEXT, ValueType::Int32, 0);
        assert!(matches!(
            broker.get(caller(), &mut read),
            Err(BrokerError::BadValue { .. })
        ));
    }

    #[test]
    fn test_monitor_lifecycle_drops_inactive_client() {
        let broker = test_broker();
        let listener = CollectingListener::new();
        let handle = ListenerHandle::new(ListenerId(1), listener);

        broker.start_error_listening(caller(), &handle);
        assert_eq!(broker.core.state().clients.len(), 1);

        broker.stop_error_listening(handle.id);
        assert!(broker.core.state().clients.is_empty());
    }

    #[test]
    fn test_monitor_survives_while_other_flag_set() {
        let broker = test_broker();
        let listener = CollectingListener::new();
        let handle = ListenerHandle::new(ListenerId(1), listener);

        broker.start_error_listening(caller(), &handle);
        broker.start_hal_restart_monitoring(caller(), &handle);
        broker.stop_error_listening(handle.id);
        assert_eq!(broker.core.state().clients.len(), 1);
        broker.stop_hal_restart_monitoring(handle.id);
        assert!(broker.core.state().clients.is_empty());
    }

    #[test]
    fn test_hal_init_failure_leaves_broker_alive() {
        let hal = Arc::new(StubHal {
            configs: vec![],
            fail_init: true,
        });
        let broker =
            VehicleBroker::builder(hal, Box::new(StaticAccessPolicy::allow_all())).build();
        // Real properties are unknown, so the capability check fails
        let mut value = PropertyValue::request(0x100, ValueType::Float, 0);
        assert!(matches!(
            broker.get(caller(), &mut value),
            Err(BrokerError::BadValue { .. })
        ));
        // Internal properties still work
        broker
            .set(caller(), &PropertyValue::int32(INTERNAL_APP_CONTEXT, 1))
            .unwrap();
    }

    #[test]
    fn test_dump_sections() {
        let broker = test_broker();
        let dump = broker.dump();
        assert!(dump.contains("mocking enabled: false"));
        assert!(dump.contains("*Properties*"));
        assert!(dump.contains("*Subscription info per property*"));
        assert!(dump.contains("dropped while in mocking"));
    }

    #[test]
    fn test_release_idempotent() {
        let broker = test_broker();
        broker.release();
        broker.release();
    }
}
