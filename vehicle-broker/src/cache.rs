//! Write-through cache for internal-range properties.
//!
//! Properties in the reserved internal range never reach the HAL; the broker
//! serves them from this map. Entries live until shutdown.

use std::collections::HashMap;

use vehicle_hal::PropertyValue;

/// In-memory store for internal property values.
#[derive(Default)]
pub(crate) struct PropertyValueCache {
    values: HashMap<i32, PropertyValue>,
}

impl PropertyValueCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the stored value. The cache owns its copy.
    pub(crate) fn write(&mut self, value: PropertyValue) {
        self.values.insert(value.prop, value);
    }

    /// Copy the cached value for `value.prop` into `value`. Returns false
    /// when nothing is cached for that property.
    pub(crate) fn read(&self, value: &mut PropertyValue) -> bool {
        match self.values.get(&value.prop) {
            Some(cached) => {
                *value = cached.clone();
                true
            }
            None => {
                tracing::warn!("cache read {:#x}, not found", value.prop);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vehicle_hal::{Value, ValueType};

    #[test]
    fn test_read_miss() {
        let cache = PropertyValueCache::new();
        let mut v = PropertyValue::request(0x7300_0000, ValueType::Int32, 0);
        assert!(!cache.read(&mut v));
    }

    #[test]
    fn test_write_then_read() {
        let mut cache = PropertyValueCache::new();
        cache.write(PropertyValue::int32(0x7300_0000, 42).with_timestamp(99));

        let mut v = PropertyValue::request(0x7300_0000, ValueType::Int32, 0);
        assert!(cache.read(&mut v));
        assert_eq!(v.value, Value::Int32(42));
        assert_eq!(v.timestamp_ns, 99);
    }

    #[test]
    fn test_write_replaces() {
        let mut cache = PropertyValueCache::new();
        cache.write(PropertyValue::int32(0x7300_0001, 1));
        cache.write(PropertyValue::int32(0x7300_0001, 2));

        let mut v = PropertyValue::request(0x7300_0001, ValueType::Int32, 0);
        assert!(cache.read(&mut v));
        assert_eq!(v.value, Value::Int32(2));
    }
}
