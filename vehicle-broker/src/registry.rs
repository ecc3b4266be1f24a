//! Property registry and capability checks.
//!
//! Holds the real property list (loaded from the HAL at startup), the
//! compiled-in internal list, and, while mocking, the mock's list standing
//! in for the real one. Lookups are by hash; the registry answers every
//! gettable/settable/subscribable question for the facade.

use std::collections::HashMap;

use vehicle_hal::{
    Access, ChangeMode, PropertyConfig, ValueType, INTERNAL_PROPERTY_START,
};

/// Internal audio focus state, served from the broker's cache.
pub const INTERNAL_AUDIO_FOCUS: i32 = INTERNAL_PROPERTY_START;

/// Internal foreground app context, served from the broker's cache.
pub const INTERNAL_APP_CONTEXT: i32 = INTERNAL_PROPERTY_START + 1;

/// Properties compiled into the service itself. These never reach the HAL.
fn builtin_internal_properties() -> Vec<PropertyConfig> {
    vec![
        PropertyConfig::new(
            INTERNAL_AUDIO_FOCUS,
            ValueType::Int32Vec2,
            Access::ReadWrite,
            ChangeMode::OnChange,
        ),
        PropertyConfig::new(
            INTERNAL_APP_CONTEXT,
            ValueType::Int32,
            Access::ReadWrite,
            ChangeMode::OnChange,
        ),
    ]
}

/// The static property lists and capability predicates.
pub(crate) struct PropertyRegistry {
    real: HashMap<i32, PropertyConfig>,
    internal: HashMap<i32, PropertyConfig>,
    mock: Option<HashMap<i32, PropertyConfig>>,
}

impl PropertyRegistry {
    /// Empty registry with the built-in internal properties.
    pub(crate) fn new() -> Self {
        let internal = builtin_internal_properties()
            .into_iter()
            .map(|c| (c.prop, c))
            .collect();
        Self {
            real: HashMap::new(),
            internal,
            mock: None,
        }
    }

    /// Install the real property list fetched from the HAL.
    pub(crate) fn set_real_list(&mut self, configs: Vec<PropertyConfig>) {
        self.real = configs.into_iter().map(|c| (c.prop, c)).collect();
    }

    /// Register an additional internal property. Intended for embedders
    /// extending the reserved range.
    pub(crate) fn add_internal(&mut self, config: PropertyConfig) {
        self.internal.insert(config.prop, config);
    }

    /// Install the mock list; it replaces the real list until cleared.
    pub(crate) fn set_mock_list(&mut self, configs: Vec<PropertyConfig>) {
        self.mock = Some(configs.into_iter().map(|c| (c.prop, c)).collect());
    }

    /// Drop the mock list, reactivating the real one.
    pub(crate) fn clear_mock_list(&mut self) {
        self.mock = None;
    }

    /// Look up a config in the active list (mocking-aware), falling back to
    /// the internal list.
    pub(crate) fn find(&self, prop: i32) -> Option<&PropertyConfig> {
        let active = self.mock.as_ref().unwrap_or(&self.real);
        match active.get(&prop).or_else(|| self.internal.get(&prop)) {
            Some(config) => Some(config),
            None => {
                tracing::warn!("property not found {:#x}", prop);
                None
            }
        }
    }

    /// Active list plus internals when `prop == 0`, else a singleton with
    /// that property's config (empty when unknown).
    pub(crate) fn list(&self, prop: i32) -> Vec<PropertyConfig> {
        if prop == 0 {
            let active = self.mock.as_ref().unwrap_or(&self.real);
            let mut configs: Vec<PropertyConfig> = active
                .values()
                .chain(self.internal.values())
                .cloned()
                .collect();
            configs.sort_by_key(|c| c.prop);
            configs
        } else {
            self.find(prop).cloned().into_iter().collect()
        }
    }

    pub(crate) fn is_gettable(&self, prop: i32) -> bool {
        match self.find(prop) {
            Some(config) if config.access.can_read() => true,
            Some(_) => {
                tracing::info!("cannot get, property {:#x} is write only", prop);
                false
            }
            None => false,
        }
    }

    pub(crate) fn is_settable(&self, prop: i32, value_type: ValueType) -> bool {
        let Some(config) = self.find(prop) else {
            return false;
        };
        if !config.access.can_write() {
            tracing::info!("cannot set, property {:#x} is read only", prop);
            return false;
        }
        if config.value_type != value_type {
            tracing::warn!(
                "cannot set, property {:#x} expects {:?}, got {:?}",
                prop,
                config.value_type,
                value_type
            );
            return false;
        }
        true
    }

    pub(crate) fn is_subscribable(&self, prop: i32) -> bool {
        let Some(config) = self.find(prop) else {
            return false;
        };
        if !config.access.can_read() {
            tracing::info!("cannot subscribe, property {:#x} is write only", prop);
            return false;
        }
        match config.change_mode {
            ChangeMode::Static => {
                tracing::info!("cannot subscribe, property {:#x} is static", prop);
                false
            }
            ChangeMode::Poll => {
                tracing::info!("cannot subscribe, property {:#x} is poll only", prop);
                false
            }
            _ => true,
        }
    }

    pub(crate) fn is_mocking(&self) -> bool {
        self.mock.is_some()
    }
}
