//! Subscription records and aggregation rules.
//!
//! Many per-client subscriptions collapse into a single driver subscription
//! per property: the aggregate carries the max sample rate and the
//! zero-absorbing OR of zone masks.

use std::ops::BitOr;

use vehicle_hal::PropertyConfig;

/// What a subscriber wants delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeFlags(u32);

impl SubscribeFlags {
    /// Caller did not specify; the broker substitutes [`Self::DEFAULT`].
    pub const UNDEFINED: SubscribeFlags = SubscribeFlags(0);
    /// Receive values pushed by the driver.
    pub const HAL_EVENT: SubscribeFlags = SubscribeFlags(0x1);
    /// Receive a notification whenever someone sets the property.
    pub const SET_CALL: SubscribeFlags = SubscribeFlags(0x2);
    /// Default when unspecified: driver events only.
    pub const DEFAULT: SubscribeFlags = Self::HAL_EVENT;

    pub fn is_undefined(self) -> bool {
        self.0 == 0
    }

    pub fn has_hal_event(self) -> bool {
        self.0 & Self::HAL_EVENT.0 != 0
    }

    pub fn has_set_call(self) -> bool {
        self.0 & Self::SET_CALL.0 != 0
    }

    /// Raw bit representation, for dumps.
    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for SubscribeFlags {
    type Output = SubscribeFlags;

    fn bitor(self, rhs: Self) -> Self {
        SubscribeFlags(self.0 | rhs.0)
    }
}

/// One client's subscription to one property, post-normalization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubscriptionInfo {
    /// Requested sample rate in Hz; 0 for fixed-rate change modes
    pub sample_rate: f32,
    /// Requested zone mask; 0 means all zones
    pub zones: i32,
    /// Delivery flags
    pub flags: SubscribeFlags,
}

/// The per-property subscription actually pushed to the driver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct AggregateSubscription {
    pub sample_rate: f32,
    pub zones: i32,
    pub flags: SubscribeFlags,
}

impl AggregateSubscription {
    /// Merge a new subscription into the existing aggregate.
    ///
    /// Returns the new aggregate and whether the driver must be
    /// (re)subscribed: on the first subscriber, on a rate increase, on a
    /// zone-mask change, or on a flags change. The rate never decreases
    /// here; lowering only happens when the last subscriber leaves and the
    /// aggregate is dropped entirely.
    pub(crate) fn merge(
        existing: Option<&AggregateSubscription>,
        sample_rate: f32,
        zones: i32,
        flags: SubscribeFlags,
    ) -> (AggregateSubscription, bool) {
        match existing {
            None => (
                AggregateSubscription {
                    sample_rate,
                    zones,
                    flags,
                },
                true,
            ),
            Some(prior) => {
                let new_zones = merge_zones(prior.zones, zones);
                let changed = prior.sample_rate < sample_rate
                    || prior.zones != new_zones
                    || prior.flags != flags;
                (
                    AggregateSubscription {
                        sample_rate: prior.sample_rate.max(sample_rate),
                        zones: new_zones,
                        flags,
                    },
                    changed,
                )
            }
        }
    }
}

/// Zone mask union with zero absorption: 0 means "all zones", so any
/// contributor asking for all widens the aggregate to all.
pub(crate) fn merge_zones(a: i32, b: i32) -> i32 {
    if a == 0 || b == 0 {
        0
    } else {
        a | b
    }
}

/// Clamp or zero a requested sample rate per the property's change mode.
pub(crate) fn normalize_sample_rate(config: &PropertyConfig, sample_rate: f32) -> f32 {
    if config.change_mode.is_fixed_rate() {
        if sample_rate != 0.0 {
            tracing::warn!(
                "sample rate {} for fixed-rate property {:#x}, forcing 0",
                sample_rate,
                config.prop
            );
        }
        return 0.0;
    }
    if sample_rate > config.max_sample_rate {
        tracing::warn!(
            "sample rate {} above max {}, clamping",
            sample_rate,
            config.max_sample_rate
        );
        return config.max_sample_rate;
    }
    if sample_rate < config.min_sample_rate {
        tracing::warn!(
            "sample rate {} below min {}, clamping",
            sample_rate,
            config.min_sample_rate
        );
        return config.min_sample_rate;
    }
    sample_rate
}

/// Validate a requested zone mask against the property's supported zones.
///
/// Non-zoned properties ignore the request and use 0. For zoned properties
/// a non-zero mask must be a subset of the supported flags; `None` means
/// out of range.
pub(crate) fn normalize_zones(config: &PropertyConfig, zones: i32) -> Option<i32> {
    if !config.is_zoned() {
        return Some(0);
    }
    if zones != 0 && (zones & config.zone_flags) != zones {
        tracing::error!(
            "requested zones {:#x} out of range for {:#x}, supported {:#x}",
            zones,
            config.prop,
            config.zone_flags
        );
        return None;
    }
    Some(zones)
}
