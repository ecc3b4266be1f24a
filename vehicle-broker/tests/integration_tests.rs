//! Integration tests for the vehicle-broker crate.
//!
//! These tests drive a full broker against recording HAL doubles and verify
//! end-to-end behavior: aggregate subscription folding, zone-mask merging,
//! the mock swap protocol, event coalescing, internal property publishing,
//! client death cleanup, set fan-out, and the error path.


use std::sync::Arc;
use std::time::Duration;

use mock_hal::{
    wait_until, HalCall, RecordingDeathWatch, RecordingHal, RecordingMock, TestListener,
};
use vehicle_broker::{
    BrokerConfig, BrokerError, Caller, ListenerHandle, ListenerId, PolicyEntry,
    StaticAccessPolicy, SubscribeFlags, VehicleBroker, INTERNAL_APP_CONTEXT,
};
use vehicle_hal::{
    operation, Access, ChangeMode, PropertyConfig, PropertyValue, Value, ValueType,
};

fn test_configs() -> Vec<PropertyConfig> {
    vec![
        PropertyConfig::new(0x100, ValueType::Float, Access::Read, ChangeMode::Continuous)
            .with_sample_rate(1.0, 50.0),
        PropertyConfig::new(
            0x200,
            ValueType::ZonedFloat,
            Access::ReadWrite,
            ChangeMode::OnChange,
        )
        .with_zone_flags(0b1111),
        PropertyConfig::new(0x300, ValueType::Int32, Access::Read, ChangeMode::OnChange),
        PropertyConfig::new(0x400, ValueType::Int32, Access::Read, ChangeMode::Continuous)
            .with_sample_rate(1.0, 10.0),
        PropertyConfig::new(0x500, ValueType::Int32, Access::ReadWrite, ChangeMode::OnSet),
    ]
}

fn fast_config() -> BrokerConfig {
    BrokerConfig::default()
        .dispatch_interval(Duration::from_millis(2))
        .get_set_retry_wait(Duration::from_micros(100))
}

fn build_broker(hal: &Arc<RecordingHal>) -> VehicleBroker {
    VehicleBroker::builder(hal.clone(), Box::new(StaticAccessPolicy::allow_all()))
        .config(fast_config())
        .build()
}

fn caller() -> Caller {
    Caller::new(100, 1000)
}

fn handle(id: u64) -> (ListenerHandle, Arc<TestListener>) {
    let listener = TestListener::new();
    (
        ListenerHandle::new(ListenerId(id), listener.clone()),
        listener,
    )
}

/// Scenario: three clients at 10/25/5 Hz on a continuous property. The HAL
/// sees the rate only rise, exactly one subscribe carries the max, and no
/// downgrade happens until the last client leaves.
#[test]
fn test_aggregate_rate_rises_never_downgrades() {
    let hal = RecordingHal::new(test_configs());
    let broker = build_broker(&hal);
    let (a, _) = handle(1);
    let (b, _) = handle(2);
    let (c, _) = handle(3);

    broker
        .subscribe(caller(), &a, 0x100, 10.0, 0, SubscribeFlags::UNDEFINED)
        .unwrap();
    broker
        .subscribe(caller(), &b, 0x100, 25.0, 0, SubscribeFlags::UNDEFINED)
        .unwrap();
    broker
        .subscribe(caller(), &c, 0x100, 5.0, 0, SubscribeFlags::UNDEFINED)
        .unwrap();

    let subs = hal.subscribe_calls();
    assert_eq!(subs, vec![(0x100, 10.0, 0), (0x100, 25.0, 0)]);
    assert_eq!(subs.iter().filter(|s| s.1 == 25.0).count(), 1);

    // C leaving changes nothing
    broker.unsubscribe(caller(), c.id, 0x100).unwrap();
    assert_eq!(hal.subscribe_calls().len(), 2);

    // B (the max) leaving does not resubscribe at the lower rate
    broker.unsubscribe(caller(), b.id, 0x100).unwrap();
    assert_eq!(hal.subscribe_calls().len(), 2);
    assert!(!hal.calls().contains(&HalCall::Unsubscribe { prop: 0x100 }));

    // Last client out unsubscribes the HAL
    broker.unsubscribe(caller(), a.id, 0x100).unwrap();
    assert!(hal.calls().contains(&HalCall::Unsubscribe { prop: 0x100 }));
}

/// Scenario: zone masks OR together and a zones=0 ("all") subscriber
/// absorbs the aggregate to 0.
#[test]
fn test_zone_or_with_zero_absorption() {
    let hal = RecordingHal::new(test_configs());
    let broker = build_broker(&hal);
    let (a, _) = handle(1);
    let (b, _) = handle(2);
    let (c, _) = handle(3);

    broker
        .subscribe(caller(), &a, 0x200, 0.0, 0b0001, SubscribeFlags::UNDEFINED)
        .unwrap();
    broker
        .subscribe(caller(), &b, 0x200, 0.0, 0b0010, SubscribeFlags::UNDEFINED)
        .unwrap();
    broker
        .subscribe(caller(), &c, 0x200, 0.0, 0, SubscribeFlags::UNDEFINED)
        .unwrap();

    assert_eq!(
        hal.subscribe_calls(),
        vec![(0x200, 0.0, 0b0001), (0x200, 0.0, 0b0011), (0x200, 0.0, 0)]
    );
}

#[test]
fn test_zones_out_of_range_rejected() {
    let hal = RecordingHal::new(test_configs());
    let broker = build_broker(&hal);
    let (a, _) = handle(1);

    let result = broker.subscribe(caller(), &a, 0x200, 0.0, 0b1_0000, SubscribeFlags::UNDEFINED);
    assert!(matches!(result, Err(BrokerError::BadValue { .. })));
    assert!(hal.subscribe_calls().is_empty());
}

#[test]
fn test_rate_clamped_to_config_range() {
    let hal = RecordingHal::new(test_configs());
    let broker = build_broker(&hal);
    let (a, _) = handle(1);
    let (b, _) = handle(2);

    // Above max clamps down; a fresh property means one subscribe
    broker
        .subscribe(caller(), &a, 0x100, 500.0, 0, SubscribeFlags::UNDEFINED)
        .unwrap();
    // Below min clamps up, which is below the aggregate: no new call
    broker
        .subscribe(caller(), &b, 0x100, 0.25, 0, SubscribeFlags::UNDEFINED)
        .unwrap();

    assert_eq!(hal.subscribe_calls(), vec![(0x100, 50.0, 0)]);
}

/// Scenario: registering a mock invalidates every subscription, notifies
/// restart monitors with mocking=true, and routes new traffic to the mock.
#[test]
fn test_mock_swap_invalidates_subscriptions() {
    let hal = RecordingHal::new(test_configs());
    let broker = build_broker(&hal);
    let (a, a_listener) = handle(1);

    broker
        .subscribe(caller(), &a, 0x300, 0.0, 0, SubscribeFlags::UNDEFINED)
        .unwrap();
    broker.start_hal_restart_monitoring(caller(), &a);

    let mock = RecordingMock::new(vec![PropertyConfig::new(
        0x600,
        ValueType::Int32,
        Access::Read,
        ChangeMode::OnChange,
    )]);
    let mock_dyn: Arc<dyn vehicle_hal::VehicleHalMock> = mock.clone();
    broker.start_mocking(ListenerId(99), mock_dyn.clone());

    // Restart monitor notified with mocking=true
    assert_eq!(a_listener.restarts.lock().unwrap().clone(), vec![true]);
    // The invalidation did not subscribe anything on the mock
    assert!(mock.calls().is_empty());
    // The mock's list replaced the real one
    let props = broker.list_properties(0);
    assert!(props.iter().any(|c| c.prop == 0x600));
    assert!(!props.iter().any(|c| c.prop == 0x100));

    // A's subscription is gone: events for 0x300 reach nobody even if
    // injected past the drop filter
    broker.inject_event(PropertyValue::int32(0x300, 5));
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(a_listener.total_events(), 0);

    // A fresh subscription lands on the mock
    broker
        .subscribe(caller(), &a, 0x600, 0.0, 0, SubscribeFlags::UNDEFINED)
        .unwrap();
    assert_eq!(
        mock.calls(),
        vec![HalCall::Subscribe {
            prop: 0x600,
            sample_rate: 0.0,
            zones: 0
        }]
    );

    // Stopping restores the real list and notifies with mocking=false
    broker.stop_mocking(&mock_dyn);
    assert_eq!(
        a_listener.restarts.lock().unwrap().clone(),
        vec![true, false]
    );
    assert!(broker.list_properties(0).iter().any(|c| c.prop == 0x100));
}

#[test]
fn test_real_events_dropped_while_mocking() {
    let hal = RecordingHal::new(test_configs());
    let broker = build_broker(&hal);
    let (a, a_listener) = handle(1);

    let mock = RecordingMock::new(vec![PropertyConfig::new(
        0x300,
        ValueType::Int32,
        Access::Read,
        ChangeMode::OnChange,
    )]);
    let mock_dyn: Arc<dyn vehicle_hal::VehicleHalMock> = mock.clone();
    broker.start_mocking(ListenerId(99), mock_dyn.clone());

    broker
        .subscribe(caller(), &a, 0x300, 0.0, 0, SubscribeFlags::UNDEFINED)
        .unwrap();

    // Real-HAL traffic is dropped and counted...
    hal.push_event(PropertyValue::int32(0x300, 1));
    hal.push_event(PropertyValue::int32(0x300, 2));
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(a_listener.total_events(), 0);
    assert!(broker
        .dump()
        .contains("events dropped while in mocking: 2"));

    // ...while injection bypasses the filter
    broker.inject_event(PropertyValue::int32(0x300, 3));
    a_listener.wait_for_events(1);
    assert_eq!(a_listener.events()[0].value, Value::Int32(3));
}

/// Scenario: events arriving inside the dispatch window coalesce into one
/// batch, in insertion order.
#[test]
fn test_event_coalescing_within_window() {
    let hal = RecordingHal::new(test_configs());
    let broker = VehicleBroker::builder(
        hal.clone(),
        Box::new(StaticAccessPolicy::allow_all()),
    )
    .config(BrokerConfig::default().dispatch_interval(Duration::from_millis(50)))
    .build();
    let (a, a_listener) = handle(1);

    broker
        .subscribe(caller(), &a, 0x100, 10.0, 0, SubscribeFlags::UNDEFINED)
        .unwrap();

    // Warm up: the first event dispatches immediately
    hal.push_event(PropertyValue::float(0x100, 0.0).with_timestamp(1));
    a_listener.wait_for_events(1);

    // Both of these land inside the 50 ms window
    hal.push_event(PropertyValue::float(0x100, 1.0).with_timestamp(2));
    hal.push_event(PropertyValue::float(0x100, 2.0).with_timestamp(3));
    a_listener.wait_for_events(3);

    let batches = a_listener.batches.lock().unwrap();
    assert_eq!(batches.len(), 2, "coalesced into a single second batch");
    assert_eq!(batches[1][0].value, Value::Float(1.0));
    assert_eq!(batches[1][1].value, Value::Float(2.0));
}

/// Scenario: setting an internal property updates the cache, publishes an
/// event to subscribers, and never touches the HAL.
#[test]
fn test_internal_property_publish() {
    let hal = RecordingHal::new(test_configs());
    let broker = build_broker(&hal);
    let (a, a_listener) = handle(1);

    broker
        .subscribe(
            caller(),
            &a,
            INTERNAL_APP_CONTEXT,
            0.0,
            0,
            SubscribeFlags::UNDEFINED,
        )
        .unwrap();

    let written = PropertyValue::int32(INTERNAL_APP_CONTEXT, 7).with_timestamp(42);
    broker.set(caller(), &written).unwrap();

    // (a) cache updated
    let mut read = PropertyValue::request(INTERNAL_APP_CONTEXT, ValueType::Int32, 0);
    broker.get(caller(), &mut read).unwrap();
    assert_eq!(read.value, Value::Int32(7));

    // (b) event delivered to the subscriber
    a_listener.wait_for_events(1);
    assert_eq!(a_listener.events()[0].value, Value::Int32(7));

    // (c) the HAL saw neither a set nor a subscribe
    assert!(hal.calls().is_empty());
}

/// Scenario: a dying client is removed, its last-subscriber properties are
/// unsubscribed from the HAL, and the death watch is unlinked.
#[test]
fn test_client_death_cleans_up() {
    let hal = RecordingHal::new(test_configs());
    let death_watch = RecordingDeathWatch::new();
    let broker = VehicleBroker::builder(
        hal.clone(),
        Box::new(StaticAccessPolicy::allow_all()),
    )
    .config(fast_config())
    .death_watch(death_watch.clone())
    .build();
    let (a, _) = handle(1);

    broker
        .subscribe(caller(), &a, 0x400, 5.0, 0, SubscribeFlags::UNDEFINED)
        .unwrap();
    assert_eq!(death_watch.links.lock().unwrap().clone(), vec![a.id]);

    broker.handle_listener_death(a.id);
    assert!(death_watch.unlinks.lock().unwrap().contains(&a.id));
    assert!(hal.calls().contains(&HalCall::Unsubscribe { prop: 0x400 }));

    // The aggregate is gone: a new subscriber starts from scratch
    let (b, _) = handle(2);
    broker
        .subscribe(caller(), &b, 0x400, 2.0, 0, SubscribeFlags::UNDEFINED)
        .unwrap();
    assert_eq!(hal.subscribe_calls(), vec![(0x400, 5.0, 0), (0x400, 2.0, 0)]);
}

#[test]
fn test_set_fanout_respects_zones() {
    let hal = RecordingHal::new(test_configs());
    let broker = build_broker(&hal);
    let (a, a_listener) = handle(1);
    let (b, b_listener) = handle(2);

    let flags = SubscribeFlags::HAL_EVENT | SubscribeFlags::SET_CALL;
    broker
        .subscribe(caller(), &a, 0x200, 0.0, 0b0001, flags)
        .unwrap();
    broker
        .subscribe(caller(), &b, 0x200, 0.0, 0b0010, flags)
        .unwrap();

    broker
        .set(caller(), &PropertyValue::zoned_float(0x200, 0b0001, 21.5))
        .unwrap();

    // Set fan-out is synchronous from the caller's thread
    assert_eq!(a_listener.set_events.lock().unwrap().len(), 1);
    assert!(b_listener.set_events.lock().unwrap().is_empty());
    assert!(hal.calls().contains(&HalCall::Set { prop: 0x200 }));
}

#[test]
fn test_resubscribe_without_set_call_stops_notifications() {
    let hal = RecordingHal::new(test_configs());
    let broker = build_broker(&hal);
    let (a, a_listener) = handle(1);

    broker
        .subscribe(
            caller(),
            &a,
            0x200,
            0.0,
            0b0001,
            SubscribeFlags::HAL_EVENT | SubscribeFlags::SET_CALL,
        )
        .unwrap();
    broker
        .set(caller(), &PropertyValue::zoned_float(0x200, 0b0001, 1.0))
        .unwrap();
    assert_eq!(a_listener.set_events.lock().unwrap().len(), 1);

    // Replacing the subscription without the flag stops the notifications
    broker
        .subscribe(caller(), &a, 0x200, 0.0, 0b0001, SubscribeFlags::HAL_EVENT)
        .unwrap();
    broker
        .set(caller(), &PropertyValue::zoned_float(0x200, 0b0001, 2.0))
        .unwrap();
    assert_eq!(a_listener.set_events.lock().unwrap().len(), 1);
}

#[test]
fn test_set_call_flag_requires_write_access() {
    let hal = RecordingHal::new(test_configs());
    let broker = build_broker(&hal);
    let (a, _) = handle(1);

    // 0x100 is read-only
    let result = broker.subscribe(
        caller(),
        &a,
        0x100,
        10.0,
        0,
        SubscribeFlags::HAL_EVENT | SubscribeFlags::SET_CALL,
    );
    assert!(matches!(result, Err(BrokerError::BadValue { .. })));
}

#[test]
fn test_error_routing() {
    let hal = RecordingHal::new(test_configs());
    let broker = build_broker(&hal);
    let (a, a_listener) = handle(1);
    let (m, m_listener) = handle(2);

    broker
        .subscribe(caller(), &a, 0x100, 10.0, 0, SubscribeFlags::UNDEFINED)
        .unwrap();
    broker.start_error_listening(caller(), &m);

    // Property error goes to the property's subscribers only
    hal.push_error(-5, 0x100, operation::GET);
    wait_until(|| a_listener.errors.lock().unwrap().len() == 1);
    assert_eq!(
        a_listener.errors.lock().unwrap()[0],
        (-5, 0x100, operation::GET)
    );
    assert!(m_listener.errors.lock().unwrap().is_empty());

    // A property error with no subscribers falls back to error monitors
    hal.push_error(-6, 0x300, operation::SET);
    wait_until(|| m_listener.errors.lock().unwrap().len() == 1);

    // A global error reaches error monitors
    hal.push_error(-7, 0, operation::GENERIC);
    wait_until(|| m_listener.errors.lock().unwrap().len() == 2);
    assert_eq!(
        m_listener.errors.lock().unwrap()[1],
        (-7, 0, operation::GENERIC)
    );
}

#[test]
fn test_get_retries_not_ready() {
    let hal = RecordingHal::new(test_configs());
    let broker = VehicleBroker::builder(
        hal.clone(),
        Box::new(StaticAccessPolicy::allow_all()),
    )
    .config(fast_config().get_set_retries(3))
    .build();

    // Two transient failures: the retry loop recovers
    hal.fail_next_with_not_ready(2);
    hal.script_get_value(PropertyValue::float(0x100, 9.0));
    let mut value = PropertyValue::request(0x100, ValueType::Float, 0);
    broker.get(caller(), &mut value).unwrap();
    assert_eq!(value.value, Value::Float(9.0));

    // Persistent not-ready exhausts the budget
    hal.fail_next_with_not_ready(100);
    let mut value = PropertyValue::request(0x100, ValueType::Float, 0);
    assert_eq!(
        broker.get(caller(), &mut value),
        Err(BrokerError::NotReady)
    );
}

#[test]
fn test_permission_denied_per_uid() {
    let hal = RecordingHal::new(test_configs());
    let policy = StaticAccessPolicy::new().with_entry(
        0x500,
        PolicyEntry::open().write_uids(vec![1000]),
    );
    let broker = VehicleBroker::builder(hal.clone(), Box::new(policy))
        .config(fast_config())
        .build();

    let value = PropertyValue::int32(0x500, 1);
    broker.set(Caller::new(1, 1000), &value).unwrap();
    assert!(matches!(
        broker.set(Caller::new(1, 2000), &value),
        Err(BrokerError::PermissionDenied { .. })
    ));
}

#[test]
fn test_auto_get_primes_subscription_per_zone() {
    let hal = RecordingHal::new(test_configs());
    let policy = StaticAccessPolicy::allow_all()
        .with_entry(0x200, PolicyEntry::open().auto_get());
    let broker = VehicleBroker::builder(hal.clone(), Box::new(policy))
        .config(fast_config())
        .build();
    let (a, a_listener) = handle(1);

    hal.script_get_value(PropertyValue::zoned_float(0x200, 0b0001, 20.0));
    hal.script_get_value(PropertyValue::zoned_float(0x200, 0b0010, 22.0));

    broker
        .subscribe(caller(), &a, 0x200, 0.0, 0b0011, SubscribeFlags::UNDEFINED)
        .unwrap();

    // One fetch per requested zone, delivered as events
    a_listener.wait_for_events(2);
    let events = a_listener.events();
    assert!(events.iter().any(|v| v.value == Value::Float(20.0)));
    assert!(events.iter().any(|v| v.value == Value::Float(22.0)));
}

#[test]
fn test_second_subscribe_replaces_record() {
    let hal = RecordingHal::new(test_configs());
    let broker = build_broker(&hal);
    let (a, _) = handle(1);

    broker
        .subscribe(caller(), &a, 0x100, 25.0, 0, SubscribeFlags::UNDEFINED)
        .unwrap();
    broker
        .subscribe(caller(), &a, 0x100, 10.0, 0, SubscribeFlags::UNDEFINED)
        .unwrap();

    // One client record with one subscription, no second HAL call
    assert_eq!(hal.subscribe_calls(), vec![(0x100, 25.0, 0)]);
    assert!(broker.dump().contains("subscriptions 1"));
}

#[test]
fn test_unsubscribe_unknown_client_is_noop() {
    let hal = RecordingHal::new(test_configs());
    let broker = build_broker(&hal);

    broker.unsubscribe(caller(), ListenerId(77), 0x100).unwrap();
    assert!(hal.calls().is_empty());
}

#[test]
fn test_subscribe_static_property_rejected() {
    let hal = RecordingHal::new(vec![PropertyConfig::new(
        0x700,
        ValueType::Int32,
        Access::Read,
        ChangeMode::Static,
    )]);
    let broker = build_broker(&hal);
    let (a, _) = handle(1);

    let result = broker.subscribe(caller(), &a, 0x700, 0.0, 0, SubscribeFlags::UNDEFINED);
    assert!(matches!(result, Err(BrokerError::BadValue { .. })));
}

#[test]
fn test_mock_death_stops_mocking() {
    let hal = RecordingHal::new(test_configs());
    let broker = build_broker(&hal);
    let (a, a_listener) = handle(1);
    broker.start_hal_restart_monitoring(caller(), &a);

    let mock = RecordingMock::new(vec![]);
    let mock_dyn: Arc<dyn vehicle_hal::VehicleHalMock> = mock.clone();
    broker.start_mocking(ListenerId(99), mock_dyn);
    assert_eq!(a_listener.restarts.lock().unwrap().clone(), vec![true]);

    broker.handle_mock_death();
    assert_eq!(
        a_listener.restarts.lock().unwrap().clone(),
        vec![true, false]
    );
    assert!(broker.list_properties(0).iter().any(|c| c.prop == 0x100));
}
