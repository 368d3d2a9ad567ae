use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::buckets::BucketKeys;
use crate::error::StoreError;

pub type UserId = u64;

/// Cumulative voice minutes for one user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserActivity {
    #[serde(rename = "lifetime", default)]
    pub lifetime_minutes: u64,
    #[serde(rename = "weekly", default)]
    pub weekly_minutes: BTreeMap<String, u64>,
    #[serde(rename = "monthly", default)]
    pub monthly_minutes: BTreeMap<String, u64>,
}

impl UserActivity {
    pub fn week(&self, key: &str) -> u64 {
        self.weekly_minutes.get(key).copied().unwrap_or(0)
    }

    pub fn month(&self, key: &str) -> u64 {
        self.monthly_minutes.get(key).copied().unwrap_or(0)
    }

    pub fn credit(&mut self, minutes: u64, keys: &BucketKeys) {
        self.lifetime_minutes += minutes;
        *self.weekly_minutes.entry(keys.week.clone()).or_insert(0) += minutes;
        *self.monthly_minutes.entry(keys.month.clone()).or_insert(0) += minutes;
    }

    /// Applies a signed delta to every counter, each floored at zero on its own.
    pub fn adjust(&mut self, delta: i64, keys: &BucketKeys) {
        self.lifetime_minutes = floor_add(self.lifetime_minutes, delta);
        let week = self.weekly_minutes.entry(keys.week.clone()).or_insert(0);
        *week = floor_add(*week, delta);
        let month = self.monthly_minutes.entry(keys.month.clone()).or_insert(0);
        *month = floor_add(*month, delta);
    }
}

fn floor_add(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta as u64)
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}

/// File-backed map of user id to activity, rewritten whole on every save.
#[derive(Debug)]
pub struct ActivityStore {
    path: PathBuf,
    records: BTreeMap<UserId, UserActivity>,
}

impl ActivityStore {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if !path.exists() {
            info!("No activity file at {:?}, starting empty", path);
            return Ok(Self {
                path,
                records: BTreeMap::new(),
            });
        }

        let raw = fs::read_to_string(&path).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        let records: BTreeMap<UserId, UserActivity> =
            serde_json::from_str(&raw).map_err(|source| StoreError::Parse {
                path: path.clone(),
                source,
            })?;

        info!("Loaded activity for {} users from {:?}", records.len(), path);
        Ok(Self { path, records })
    }

    pub fn save(&self) -> Result<(), StoreError> {
        debug!("Saving activity data to {:?}", self.path);
        let body = serde_json::to_string_pretty(&self.records)?;
        let tmp = temp_path(&self.path);
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        fs::write(&tmp, body).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }

    pub fn get(&self, user: UserId) -> Option<&UserActivity> {
        self.records.get(&user)
    }

    pub fn get_or_create(&mut self, user: UserId) -> &mut UserActivity {
        self.records.entry(user).or_default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn keys() -> BucketKeys {
        BucketKeys {
            week: "2024-W17".to_string(),
            month: "2024-04".to_string(),
        }
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = ActivityStore::load(dir.path().join("activity.json")).unwrap();
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("activity.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            ActivityStore::load(&path),
            Err(StoreError::Parse { .. })
        ));
    }

    #[test]
    fn saved_records_survive_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("activity.json");

        let mut store = ActivityStore::load(&path).unwrap();
        store.get_or_create(42).credit(45, &keys());
        store.save().unwrap();

        let reloaded = ActivityStore::load(&path).unwrap();
        let record = reloaded.get(42).unwrap();
        assert_eq!(record.lifetime_minutes, 45);
        assert_eq!(record.week("2024-W17"), 45);
        assert_eq!(record.month("2024-04"), 45);
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn reads_existing_file_layout() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("activity.json");
        fs::write(
            &path,
            r#"{
  "123456789012345678": {
    "lifetime": 90,
    "monthly": { "2024-04": 60 },
    "weekly": { "2024-W17": 30 }
  },
  "5": { "lifetime": 3 }
}"#,
        )
        .unwrap();

        let store = ActivityStore::load(&path).unwrap();
        let record = store.get(123456789012345678).unwrap();
        assert_eq!(record.lifetime_minutes, 90);
        assert_eq!(record.month("2024-04"), 60);
        assert_eq!(record.week("2024-W17"), 30);
        assert_eq!(store.get(5).unwrap().week("2024-W17"), 0);
    }

    #[test]
    fn get_or_create_inserts_zeroed_record() {
        let dir = TempDir::new().unwrap();
        let mut store = ActivityStore::load(dir.path().join("a.json")).unwrap();
        assert_eq!(*store.get_or_create(7), UserActivity::default());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn adjust_floors_each_counter_independently() {
        let mut record = UserActivity::default();
        record.lifetime_minutes = 50;
        record.weekly_minutes.insert("2024-W17".to_string(), 5);

        record.adjust(-20, &keys());

        assert_eq!(record.lifetime_minutes, 30);
        assert_eq!(record.week("2024-W17"), 0);
        assert_eq!(record.month("2024-04"), 0);
    }
}
