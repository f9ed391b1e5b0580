//! Persisted device-identity cache.
//!
//! Identity reads are expensive (a full memory bank walk per device), so
//! terminal records are cached per short address and reused verbatim across
//! incremental re-collections. A non-incremental collection clears the cache
//! first to force fresh reads.

use std::collections::BTreeMap;
use std::path::Path;

use serde_derive::{Deserialize, Serialize};

use crate::device::DaliDeviceInfo;
use crate::error::Result;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceInfoCache {
    entries: BTreeMap<u8, DaliDeviceInfo>,
}

impl DeviceInfoCache {
    pub fn new() -> Self {
        DeviceInfoCache::default()
    }

    pub fn get(&self, short_address: u8) -> Option<&DaliDeviceInfo> {
        self.entries.get(&short_address)
    }

    /// A cached record that no longer needs a hardware query.
    pub fn terminal(&self, short_address: u8) -> Option<&DaliDeviceInfo> {
        self.entries
            .get(&short_address)
            .filter(|info| info.status.is_terminal())
    }

    pub fn insert(&mut self, info: DaliDeviceInfo) {
        self.entries.insert(info.short_address, info);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DaliDeviceInfo> {
        self.entries.values()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e).into())
    }

    /// Load the cache, starting empty when the file does not exist yet.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(cache) => cache,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "starting with empty identity cache");
                DeviceInfoCache::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DevInfStatus;

    #[test]
    fn terminal_filters_needs_query() {
        let mut cache = DeviceInfoCache::new();
        let mut info = DaliDeviceInfo::new(4);
        cache.insert(info.clone());
        assert!(cache.get(4).is_some());
        assert!(cache.terminal(4).is_none());
        info.status = DevInfStatus::None;
        cache.insert(info);
        assert!(cache.terminal(4).is_some());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identities.json");
        let mut cache = DeviceInfoCache::new();
        let mut info = DaliDeviceInfo::new(11);
        info.gtin = 4_012_345_000_123;
        info.serial_no = 987;
        info.status = DevInfStatus::Solid;
        cache.insert(info);
        cache.save(&path).unwrap();
        let loaded = DeviceInfoCache::load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.get(11).unwrap().gtin, 4_012_345_000_123);
        assert_eq!(loaded.get(11).unwrap().status, DevInfStatus::Solid);
    }

    #[test]
    fn missing_file_yields_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DeviceInfoCache::load_or_default(&dir.path().join("absent.json"));
        assert!(cache.is_empty());
    }
}
