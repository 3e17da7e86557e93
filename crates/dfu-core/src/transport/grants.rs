//! Persisted device grants for the desktop backend.
//!
//! A grant records that the user picked a `(vendor_id, serial)` device in
//! the chooser once; later runs treat matching devices as authorized
//! without asking again.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub vendor_id: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantList {
    #[serde(default, rename = "grant")]
    grants: Vec<Grant>,
}

impl GrantList {
    /// Load grants; a missing file is an empty list.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn allows(&self, vendor_id: u16, serial: Option<&str>) -> bool {
        self.grants
            .iter()
            .any(|g| g.vendor_id == vendor_id && g.serial.as_deref() == serial)
    }

    /// Record a grant. Returns false if it already existed.
    pub fn grant(&mut self, vendor_id: u16, serial: Option<String>) -> bool {
        if self.allows(vendor_id, serial.as_deref()) {
            return false;
        }
        self.grants.push(Grant { vendor_id, serial });
        true
    }

    pub fn revoke_all(&mut self) {
        self.grants.clear();
    }

    pub fn grants(&self) -> &[Grant] {
        &self.grants
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_grants_persist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("grants.toml");

        let mut grants = GrantList::load(&path).unwrap();
        assert!(grants.grants().is_empty());
        assert!(grants.grant(0x2FE3, Some("ABC".into())));
        assert!(!grants.grant(0x2FE3, Some("ABC".into())));
        grants.save(&path).unwrap();

        let loaded = GrantList::load(&path).unwrap();
        assert!(loaded.allows(0x2FE3, Some("ABC")));
        assert!(!loaded.allows(0x2FE3, Some("XYZ")));
        assert!(!loaded.allows(0x2FE3, None));
    }
}
