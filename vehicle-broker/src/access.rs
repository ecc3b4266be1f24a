//! Property access control.
//!
//! The broker consumes an [`AccessPolicy`] to decide, per property and per
//! caller uid, whether a read or write may proceed. Policy *sources* (files,
//! system config) are the embedder's concern; [`StaticAccessPolicy`] is the
//! in-memory implementation they populate.

use std::collections::HashMap;
use std::fmt;

/// Answers access questions for broker operations.
///
/// Implementations must be cheap: `test_access` runs on every get/set/
/// subscribe before any state is touched.
pub trait AccessPolicy: Send + Sync {
    /// May `uid` perform a read (`is_write == false`) or write on `property`?
    fn test_access(&self, property: i32, uid: u32, is_write: bool) -> bool;

    /// Should a fresh subscription to `property` be primed with the current
    /// value fetched from the driver?
    fn is_auto_get_enabled(&self, property: i32) -> bool;

    /// Append a policy summary to the diagnostic dump.
    fn dump(&self, w: &mut dyn fmt::Write) {
        let _ = w;
    }
}

/// Per-property access rule.
#[derive(Debug, Clone, Default)]
pub struct PolicyEntry {
    /// Uids allowed to read; `None` means any uid
    pub read_uids: Option<Vec<u32>>,
    /// Uids allowed to write; `None` means any uid
    pub write_uids: Option<Vec<u32>>,
    /// Prime new subscriptions with the current value
    pub auto_get: bool,
}

impl PolicyEntry {
    /// Rule allowing any uid to read and write.
    pub fn open() -> Self {
        Self::default()
    }

    /// Restrict reads to the given uids.
    pub fn read_uids(mut self, uids: Vec<u32>) -> Self {
        self.read_uids = Some(uids);
        self
    }

    /// Restrict writes to the given uids.
    pub fn write_uids(mut self, uids: Vec<u32>) -> Self {
        self.write_uids = Some(uids);
        self
    }

    /// Enable auto-get priming for subscriptions.
    pub fn auto_get(mut self) -> Self {
        self.auto_get = true;
        self
    }

    fn allows(&self, uid: u32, is_write: bool) -> bool {
        let rule = if is_write {
            &self.write_uids
        } else {
            &self.read_uids
        };
        match rule {
            None => true,
            Some(uids) => uids.contains(&uid),
        }
    }
}

/// In-memory access policy.
///
/// Properties without an entry are denied, matching the service's stance
/// that an unlisted property is not reachable by anyone.
pub struct StaticAccessPolicy {
    entries: HashMap<i32, PolicyEntry>,
    allow_unlisted: bool,
}

impl StaticAccessPolicy {
    /// Empty policy: every property denied until an entry is added.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            allow_unlisted: false,
        }
    }

    /// Policy that allows everything. Intended for tests and closed
    /// environments.
    pub fn allow_all() -> Self {
        Self {
            entries: HashMap::new(),
            allow_unlisted: true,
        }
    }

    /// Add or replace the rule for a property.
    pub fn with_entry(mut self, property: i32, entry: PolicyEntry) -> Self {
        self.entries.insert(property, entry);
        self
    }
}

impl Default for StaticAccessPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessPolicy for StaticAccessPolicy {
    fn test_access(&self, property: i32, uid: u32, is_write: bool) -> bool {
        match self.entries.get(&property) {
            Some(entry) => entry.allows(uid, is_write),
            None => self.allow_unlisted,
        }
    }

    fn is_auto_get_enabled(&self, property: i32) -> bool {
        self.entries
            .get(&property)
            .map(|e| e.auto_get)
            .unwrap_or(false)
    }

    fn dump(&self, w: &mut dyn fmt::Write) {
        let mut props: Vec<_> = self.entries.keys().copied().collect();
        props.sort_unstable();
        for prop in props {
            let entry = &self.entries[&prop];
            let _ = writeln!(
                w,
                "prop {:#x}, read {:?}, write {:?}, auto_get {}",
                prop, entry.read_uids, entry.write_uids, entry.auto_get
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlisted_property_denied() {
        let policy = StaticAccessPolicy::new();
        assert!(!policy.test_access(0x100, 1000, false));
        assert!(!policy.test_access(0x100, 1000, true));
    }

    #[test]
    fn test_allow_all() {
        let policy = StaticAccessPolicy::allow_all();
        assert!(policy.test_access(0x100, 1000, false));
        assert!(policy.test_access(0xdead, 0, true));
        assert!(!policy.is_auto_get_enabled(0x100));
    }

    #[test]
    fn test_uid_restriction() {
        let policy = StaticAccessPolicy::new().with_entry(
            0x100,
            PolicyEntry::open().read_uids(vec![1000]).write_uids(vec![]),
        );
        assert!(policy.test_access(0x100, 1000, false));
        assert!(!policy.test_access(0x100, 1001, false));
        assert!(!policy.test_access(0x100, 1000, true));
    }

    #[test]
    fn test_auto_get_flag() {
        let policy =
            StaticAccessPolicy::new().with_entry(0x200, PolicyEntry::open().auto_get());
        assert!(policy.is_auto_get_enabled(0x200));
        assert!(!policy.is_auto_get_enabled(0x201));
    }
}
