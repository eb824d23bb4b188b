//! Persistent registry of shards
//!
//! The registry lives in the control partition. It is the only source of truth
//! for which shards exist and which one is current; every change that moves
//! the current flag is committed as a single frame so readers never observe
//! zero or two current shards.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::entity::RowId;
use crate::error::{Error, Result};
use crate::shard::{util, PeriodKey, ShardRecord, ShardStatus, CONTROL_NAME};
use crate::store::{Batch, Schema, ShardStore};

/// Registry of every shard known to the manager
pub struct ShardRegistry {
    /// Control partition holding the records
    control: Arc<ShardStore>,
    /// Storage directory
    base_dir: PathBuf,
    /// Name bootstrapped when no shard is current
    legacy_name: String,
    /// Business schema applied to a bootstrapped shard
    schema: Schema,
    sync_writes: bool,
    /// Cached current record
    current: RwLock<Option<ShardRecord>>,
    /// Serializes read-modify-write sequences
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for ShardRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardRegistry")
            .field("base_dir", &self.base_dir)
            .field("current", &self.current.read().as_ref().map(|r| r.name.clone()))
            .finish()
    }
}

fn find_in<'a>(records: &'a [(RowId, ShardRecord)], name: &str) -> Option<&'a (RowId, ShardRecord)> {
    records.iter().find(|(_, record)| record.name == name)
}

impl ShardRegistry {
    /// Load the registry from the control partition
    pub fn open(
        control: Arc<ShardStore>,
        base_dir: &Path,
        legacy_name: impl Into<String>,
        schema: Schema,
        sync_writes: bool,
    ) -> Result<Self> {
        let registry = Self {
            control,
            base_dir: base_dir.to_path_buf(),
            legacy_name: legacy_name.into(),
            schema,
            sync_writes,
            current: RwLock::new(None),
            write_lock: Mutex::new(()),
        };

        let current = registry
            .records()?
            .into_iter()
            .map(|(_, record)| record)
            .find(|record| record.is_current);
        *registry.current.write() = current;

        Ok(registry)
    }

    fn records(&self) -> Result<Vec<(RowId, ShardRecord)>> {
        Ok(self
            .control
            .scan::<ShardRecord>()?
            .into_iter()
            .map(|row| (row.id(), row.into_data()))
            .collect())
    }

    fn check_name(name: &str) -> Result<()> {
        if !util::is_valid_name(name) || name == CONTROL_NAME {
            return Err(Error::validation(format!("Invalid shard name: {:?}", name)));
        }
        Ok(())
    }

    /// Every registered shard, oldest first
    pub fn list(&self) -> Result<Vec<ShardRecord>> {
        let mut records: Vec<_> = self.records()?.into_iter().map(|(_, r)| r).collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        Ok(records)
    }

    /// Shards with active status
    pub fn list_active(&self) -> Result<Vec<ShardRecord>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|record| record.status == ShardStatus::Active)
            .collect())
    }

    /// Look up a shard by name
    pub fn find(&self, name: &str) -> Result<Option<ShardRecord>> {
        Ok(self
            .records()?
            .into_iter()
            .map(|(_, record)| record)
            .find(|record| record.name == name))
    }

    /// Check whether a name is registered
    pub fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.find(name)?.is_some())
    }

    /// Register a non-current shard
    pub fn register(&self, mut record: ShardRecord) -> Result<ShardRecord> {
        Self::check_name(&record.name)?;
        let _guard = self.write_lock.lock();

        record.is_current = false;
        self.control.commit(|batch| {
            Self::ensure_unregistered(batch, &record.name)?;
            batch.insert(&record)
        })?;

        info!(shard = %record.name, status = %record.status, "Registered shard");
        Ok(record)
    }

    fn ensure_unregistered(batch: &Batch<'_>, name: &str) -> Result<()> {
        let records = batch.scan::<ShardRecord>()?;
        if find_in(&records, name).is_some() {
            return Err(Error::conflict(format!("Shard {} is already registered", name)));
        }
        Ok(())
    }

    /// Current shard without bootstrapping
    pub fn current(&self) -> Option<ShardRecord> {
        self.current.read().clone()
    }

    /// Current shard, bootstrapping the legacy partition when none exists
    pub fn get_current(&self) -> Result<ShardRecord> {
        if let Some(record) = self.current() {
            return Ok(record);
        }

        let _guard = self.write_lock.lock();
        if let Some(record) = self.current() {
            return Ok(record);
        }

        let name = self.legacy_name.clone();
        let path = util::shard_path(&self.base_dir, &name);
        util::ensure_shards_dir(&self.base_dir)?;
        {
            let store = ShardStore::open_or_create(&path, name.clone(), self.sync_writes)?;
            store.apply_schema(&self.schema)?;
        }

        let now = Utc::now();
        let record = self.control.commit(|batch| {
            let records = batch.scan::<ShardRecord>()?;
            match find_in(&records, &name) {
                Some((id, existing)) => {
                    let mut record = existing.clone();
                    record.is_current = true;
                    record.status = ShardStatus::Active;
                    record.updated_at = now;
                    batch.update(*id, &record)?;
                    Ok(record)
                }
                None => {
                    let mut record = ShardRecord::new(name.clone(), path.clone(), PeriodKey::year(now.year()))
                        .with_status(ShardStatus::Active);
                    record.is_current = true;
                    batch.insert(&record)?;
                    Ok(record)
                }
            }
        })?;

        info!(shard = %record.name, "Bootstrapped legacy shard as current");
        *self.current.write() = Some(record.clone());
        Ok(record)
    }

    /// Make a registered shard current, clearing the flag everywhere else
    pub fn mark_current(&self, name: &str) -> Result<ShardRecord> {
        let _guard = self.write_lock.lock();
        let now = Utc::now();

        let record = self.control.commit(|batch| {
            let records = batch.scan::<ShardRecord>()?;
            let (target_id, target) = find_in(&records, name)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("Shard {} is not registered", name)))?;
            if target.status == ShardStatus::Corrupted {
                return Err(Error::validation(format!("Shard {} is corrupted", name)));
            }

            for (id, record) in &records {
                if record.is_current && *id != target_id {
                    let mut record = record.clone();
                    record.is_current = false;
                    record.updated_at = now;
                    batch.update(*id, &record)?;
                }
            }

            let mut target = target;
            target.is_current = true;
            target.status = ShardStatus::Active;
            target.updated_at = now;
            batch.update(target_id, &target)?;
            Ok(target)
        })?;

        info!(shard = %record.name, "Marked shard as current");
        *self.current.write() = Some(record.clone());
        Ok(record)
    }

    /// Register a freshly built shard as current and archive the previous one
    pub fn promote_new(&self, mut record: ShardRecord) -> Result<ShardRecord> {
        Self::check_name(&record.name)?;
        let _guard = self.write_lock.lock();
        let now = Utc::now();

        record.is_current = true;
        record.status = ShardStatus::Active;
        record.updated_at = now;

        let previous = self.control.commit(|batch| {
            Self::ensure_unregistered(batch, &record.name)?;

            let mut previous = None;
            for (id, existing) in batch.scan::<ShardRecord>()? {
                if existing.is_current {
                    let mut existing = existing;
                    existing.is_current = false;
                    existing.status = ShardStatus::Archived;
                    existing.updated_at = now;
                    batch.update(id, &existing)?;
                    previous = Some(existing.name);
                }
            }

            batch.insert(&record)?;
            Ok(previous)
        })?;

        info!(
            shard = %record.name,
            previous = previous.as_deref().unwrap_or("-"),
            "Promoted new current shard"
        );
        *self.current.write() = Some(record.clone());
        Ok(record)
    }

    fn modify(&self, name: &str, f: impl FnOnce(&mut ShardRecord)) -> Result<ShardRecord> {
        let _guard = self.write_lock.lock();

        let record = self.control.commit(|batch| {
            let records = batch.scan::<ShardRecord>()?;
            let (id, record) = find_in(&records, name)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("Shard {} is not registered", name)))?;
            let mut record = record;
            f(&mut record);
            record.updated_at = Utc::now();
            batch.update(id, &record)?;
            Ok(record)
        })?;

        if record.is_current {
            *self.current.write() = Some(record.clone());
        }
        Ok(record)
    }

    /// Change a shard's lifecycle state
    pub fn set_status(&self, name: &str, status: ShardStatus) -> Result<ShardRecord> {
        self.modify(name, |record| record.status = status)
    }

    /// Record observed size and row count
    pub fn update_stats(&self, name: &str, size_bytes: u64, record_count: u64) -> Result<ShardRecord> {
        self.modify(name, |record| {
            record.size_bytes = size_bytes;
            record.record_count = record_count;
        })
    }

    /// Register shard files found on disk that the registry does not know
    ///
    /// Files that fail verification are registered as corrupted so they are
    /// never opened. Names without a recognizable period get the year of `now`.
    pub fn rescan_directory(&self, now: &DateTime<Utc>) -> Result<Vec<ShardRecord>> {
        let mut added = Vec::new();

        for (name, path) in util::list_shard_files(&self.base_dir)? {
            if self.contains(&name)? {
                continue;
            }

            let period_key = PeriodKey::from_shard_name(&name).unwrap_or_else(|| PeriodKey::year(now.year()));
            let status = match ShardStore::inspect(&path) {
                Ok(_) => ShardStatus::Archived,
                Err(e) => {
                    warn!(shard = %name, error = %e, "Shard file failed verification");
                    ShardStatus::Corrupted
                }
            };

            let mut record = ShardRecord::new(name, path, period_key).with_status(status);
            record.size_bytes = std::fs::metadata(&record.file_path).map(|m| m.len()).unwrap_or(0);
            match self.register(record) {
                Ok(record) => added.push(record),
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::control_schema;
    use crate::entity::Entity;
    use crate::telemetry::{self, Device};
    use chrono::TimeZone;
    use std::fs;
    use tempfile::{tempdir, TempDir};

    fn registry(temp_dir: &TempDir) -> Result<ShardRegistry> {
        let control = ShardStore::open_or_create(util::control_path(temp_dir.path()), CONTROL_NAME, false)?;
        control.apply_schema(&control_schema())?;
        ShardRegistry::open(
            Arc::new(control),
            temp_dir.path(),
            "default",
            telemetry::catalog()?.schema(),
            false,
        )
    }

    fn current_names(registry: &ShardRegistry) -> Result<Vec<String>> {
        Ok(registry
            .list()?
            .into_iter()
            .filter(|r| r.is_current)
            .map(|r| r.name)
            .collect())
    }

    #[test]
    fn test_bootstrap_legacy_shard() -> Result<()> {
        let temp_dir = tempdir()?;
        let registry = registry(&temp_dir)?;
        assert!(registry.current().is_none());

        let current = registry.get_current()?;
        assert_eq!(current.name, "default");
        assert_eq!(current.status, ShardStatus::Active);
        assert!(current.file_path.exists());
        assert_eq!(current_names(&registry)?, vec!["default"]);

        let store = ShardStore::open(&current.file_path, "default", false)?;
        assert!(store.has_table(Device::KIND));

        // Idempotent
        assert_eq!(registry.get_current()?.name, "default");
        assert_eq!(registry.list()?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_register_duplicate_conflicts() -> Result<()> {
        let temp_dir = tempdir()?;
        let registry = registry(&temp_dir)?;

        let record = ShardRecord::new("shard_2023", PathBuf::from("x"), PeriodKey::year(2023));
        registry.register(record.clone())?;
        assert!(registry.register(record).unwrap_err().is_conflict());

        let bad = ShardRecord::new("control", PathBuf::from("x"), PeriodKey::year(2023));
        assert!(registry.register(bad).unwrap_err().is_validation());
        Ok(())
    }

    #[test]
    fn test_promote_and_mark_current() -> Result<()> {
        let temp_dir = tempdir()?;
        let registry = registry(&temp_dir)?;
        registry.get_current()?;

        let record = ShardRecord::new("shard_2024-01-01", PathBuf::from("y"), PeriodKey::day(2024, 1, 1));
        registry.promote_new(record)?;
        assert_eq!(current_names(&registry)?, vec!["shard_2024-01-01"]);
        assert_eq!(registry.find("default")?.unwrap().status, ShardStatus::Archived);
        assert_eq!(registry.current().unwrap().name, "shard_2024-01-01");

        registry.mark_current("default")?;
        assert_eq!(current_names(&registry)?, vec!["default"]);
        assert_eq!(registry.find("default")?.unwrap().status, ShardStatus::Active);
        assert!(registry.mark_current("missing").unwrap_err().is_not_found());

        registry.set_status("shard_2024-01-01", ShardStatus::Corrupted)?;
        assert!(registry.mark_current("shard_2024-01-01").unwrap_err().is_validation());
        assert_eq!(current_names(&registry)?, vec!["default"]);
        Ok(())
    }

    #[test]
    fn test_current_survives_reopen() -> Result<()> {
        let temp_dir = tempdir()?;
        {
            let registry = registry(&temp_dir)?;
            registry.get_current()?;
            let record = ShardRecord::new("shard_2024-02-02", PathBuf::from("z"), PeriodKey::day(2024, 2, 2));
            registry.promote_new(record)?;
            registry.update_stats("shard_2024-02-02", 4096, 12)?;
        }

        let registry = registry(&temp_dir)?;
        let current = registry.current().unwrap();
        assert_eq!(current.name, "shard_2024-02-02");
        assert_eq!(current.record_count, 12);
        assert_eq!(registry.list_active()?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_rescan_directory() -> Result<()> {
        let temp_dir = tempdir()?;
        let registry = registry(&temp_dir)?;
        registry.get_current()?;

        {
            let store = ShardStore::create(util::shard_path(temp_dir.path(), "db_2022_03"), "db_2022_03", false)?;
            store.apply_schema(&telemetry::catalog()?.schema())?;
            ShardStore::create(util::shard_path(temp_dir.path(), "legacy"), "legacy", false)?;
        }
        fs::write(util::shard_path(temp_dir.path(), "broken"), b"not a shard")?;

        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let added = registry.rescan_directory(&now)?;
        assert_eq!(added.len(), 3);

        let old = registry.find("db_2022_03")?.unwrap();
        assert_eq!(old.period_key, PeriodKey::month(2022, 3));
        assert_eq!(old.status, ShardStatus::Archived);
        assert!(!old.is_current);

        assert_eq!(registry.find("legacy")?.unwrap().period_key, PeriodKey::year(2025));
        assert_eq!(registry.find("broken")?.unwrap().status, ShardStatus::Corrupted);

        assert!(registry.rescan_directory(&now)?.is_empty());
        assert_eq!(current_names(&registry)?, vec!["default"]);
        Ok(())
    }
}
