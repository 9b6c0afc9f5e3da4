//! Device registry - stable ids for device paths
//!
//! hidapi identifies devices by platform path only. The registry hands out
//! small integer ids per path so callers can refer to a device instance the
//! same way across enumerations. Ids are never reused: a path that is
//! forgotten and later seen again gets a fresh id.

use std::collections::{HashMap, HashSet};

use crate::types::DeviceId;

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    by_path: HashMap<String, DeviceId>,
    next_id: u32,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the id for `path`, assigning one if the path is new
    pub fn assign(&mut self, path: &str) -> DeviceId {
        if let Some(id) = self.by_path.get(path) {
            return *id;
        }
        self.next_id += 1;
        let id = DeviceId(self.next_id);
        self.by_path.insert(path.to_string(), id);
        id
    }

    pub fn id_of(&self, path: &str) -> Option<DeviceId> {
        self.by_path.get(path).copied()
    }

    pub fn path_of(&self, id: DeviceId) -> Option<&str> {
        self.by_path
            .iter()
            .find(|(_, v)| **v == id)
            .map(|(k, _)| k.as_str())
    }

    /// Drop the mapping for a device that is gone
    pub fn forget(&mut self, id: DeviceId) -> Option<String> {
        let path = self.path_of(id)?.to_string();
        self.by_path.remove(&path);
        Some(path)
    }

    /// Forget every path missing from a full enumeration
    ///
    /// Returns the ids that were dropped.
    pub fn retain_present<'a>(
        &mut self,
        present: impl IntoIterator<Item = &'a str>,
    ) -> Vec<DeviceId> {
        let present: HashSet<&str> = present.into_iter().collect();
        let mut gone = Vec::new();
        self.by_path.retain(|path, id| {
            let keep = present.contains(path.as_str());
            if !keep {
                gone.push(*id);
            }
            keep
        });
        gone
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_path_same_id() {
        let mut reg = DeviceRegistry::new();
        let a = reg.assign("/dev/hidraw0");
        assert_eq!(reg.assign("/dev/hidraw0"), a);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_distinct_paths_distinct_ids() {
        let mut reg = DeviceRegistry::new();
        let a = reg.assign("/dev/hidraw0");
        let b = reg.assign("/dev/hidraw1");
        assert_ne!(a, b);
        assert_eq!(reg.path_of(b), Some("/dev/hidraw1"));
        assert_eq!(reg.id_of("/dev/hidraw0"), Some(a));
    }

    #[test]
    fn test_forgotten_path_gets_fresh_id() {
        let mut reg = DeviceRegistry::new();
        let a = reg.assign("/dev/hidraw0");
        assert_eq!(reg.forget(a).as_deref(), Some("/dev/hidraw0"));
        assert!(reg.is_empty());
        let b = reg.assign("/dev/hidraw0");
        assert_ne!(a, b);
    }

    #[test]
    fn test_retain_present_drops_vanished_paths() {
        let mut reg = DeviceRegistry::new();
        let a = reg.assign("/dev/hidraw0");
        let b = reg.assign("/dev/hidraw1");
        assert_eq!(reg.retain_present(["/dev/hidraw1"]), vec![a]);
        assert_eq!(reg.id_of("/dev/hidraw1"), Some(b));
        assert_eq!(reg.id_of("/dev/hidraw0"), None);
        assert_ne!(reg.assign("/dev/hidraw0"), a);
    }

    #[test]
    fn test_forget_unknown() {
        let mut reg = DeviceRegistry::new();
        assert_eq!(reg.forget(DeviceId(42)), None);
    }
}
