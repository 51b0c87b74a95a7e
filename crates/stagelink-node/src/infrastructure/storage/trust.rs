//! [`TrustStore`] implementation backed by the config file.
//!
//! Pinned master records live in the `paired_masters` array of the node's
//! TOML configuration, so pairing state and settings share one file and
//! one write path.  Every mutation goes through
//! [`SettingsStore::update`], which persists before returning.

use std::sync::Arc;

use uuid::Uuid;

use stagelink_core::{PairedMaster, TrustStore, TrustStoreError};

use super::config::SettingsStore;

/// Trust store that reads and writes `paired_masters` in the shared
/// [`SettingsStore`].
pub struct ConfigTrustStore {
    settings: Arc<SettingsStore>,
}

impl ConfigTrustStore {
    pub fn new(settings: Arc<SettingsStore>) -> Self {
        Self { settings }
    }
}

impl TrustStore for ConfigTrustStore {
    fn get(&self, instance_id: Uuid) -> Option<PairedMaster> {
        self.settings
            .snapshot()
            .paired_masters
            .into_iter()
            .find(|r| r.instance_id == instance_id)
    }

    fn all(&self) -> Vec<PairedMaster> {
        self.settings.snapshot().paired_masters
    }

    fn upsert(&self, record: PairedMaster) -> Result<(), TrustStoreError> {
        self.settings
            .update(|config| {
                match config
                    .paired_masters
                    .iter_mut()
                    .find(|r| r.instance_id == record.instance_id)
                {
                    Some(existing) => *existing = record,
                    None => config.paired_masters.push(record),
                }
            })
            .map_err(|e| TrustStoreError::Persist(e.to_string()))
    }

    fn remove(&self, instance_id: Uuid) -> Result<bool, TrustStoreError> {
        self.settings
            .update(|config| {
                let before = config.paired_masters.len();
                config.paired_masters.retain(|r| r.instance_id != instance_id);
                config.paired_masters.len() != before
            })
            .map_err(|e| TrustStoreError::Persist(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_store() -> (Arc<SettingsStore>, PathBuf) {
        let path = std::env::temp_dir()
            .join(format!("stagelink_trust_test_{}", Uuid::new_v4()))
            .join("config.toml");
        let settings = Arc::new(SettingsStore::load(path.clone()).expect("load"));
        (settings, path)
    }

    fn make_record(name: &str) -> PairedMaster {
        PairedMaster {
            instance_id: Uuid::new_v4(),
            name: name.to_string(),
            public_key_pem: "-----BEGIN PUBLIC KEY-----\nAAAA\n-----END PUBLIC KEY-----\n"
                .to_string(),
            paired_at: 1_700_000_000_000,
            host_hint: Some("192.168.1.10".to_string()),
            pairing_port_hint: Some(24890),
            nat_compatibility: false,
        }
    }

    #[test]
    fn test_upsert_then_get_returns_record() {
        // Arrange
        let (settings, path) = temp_store();
        let store = ConfigTrustStore::new(settings);
        let record = make_record("main-hall");

        // Act
        store.upsert(record.clone()).expect("upsert");

        // Assert
        let fetched = store.get(record.instance_id).expect("record present");
        assert_eq!(fetched.name, "main-hall");
        assert_eq!(store.all().len(), 1);

        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_upsert_replaces_record_with_same_id() {
        // Arrange
        let (settings, path) = temp_store();
        let store = ConfigTrustStore::new(settings);
        let mut record = make_record("original");
        store.upsert(record.clone()).expect("first upsert");

        // Act
        record.name = "renamed".to_string();
        record.host_hint = Some("10.0.0.5".to_string());
        store.upsert(record.clone()).expect("second upsert");

        // Assert
        assert_eq!(store.all().len(), 1);
        let fetched = store.get(record.instance_id).expect("record present");
        assert_eq!(fetched.name, "renamed");
        assert_eq!(fetched.host_hint.as_deref(), Some("10.0.0.5"));

        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_records_persist_across_a_reload() {
        // Arrange
        let (settings, path) = temp_store();
        let record = make_record("main-hall");
        {
            let store = ConfigTrustStore::new(settings);
            store.upsert(record.clone()).expect("upsert");
        }

        // Act: fresh store over the same file.
        let reloaded = Arc::new(SettingsStore::load(path.clone()).expect("reload"));
        let store = ConfigTrustStore::new(reloaded);

        // Assert
        let fetched = store.get(record.instance_id).expect("record present");
        assert_eq!(fetched.public_key_pem, record.public_key_pem);

        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_remove_reports_whether_a_record_was_present() {
        // Arrange
        let (settings, path) = temp_store();
        let store = ConfigTrustStore::new(settings);
        let record = make_record("main-hall");
        store.upsert(record.clone()).expect("upsert");

        // Act / Assert
        assert!(store.remove(record.instance_id).expect("first remove"));
        assert!(!store.remove(record.instance_id).expect("second remove"));
        assert!(store.all().is_empty());

        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }
}
