//! Rotation policy and shard construction
//!
//! Deciding whether to rotate is a pure function of the policy, the current
//! shard and its observed size. Building the next shard copies reference data
//! forward (remapping links by business key) and optionally a tail of recent
//! log rows. The new file is assembled under a `.partial` name and renamed
//! into place only once every copy step has succeeded.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{RotationMode, ShardConfig};
use crate::entity::{Catalog, Entity, EntityClass, Link, RowId};
use crate::error::Result;
use crate::shard::{util, ShardRecord};
use crate::store::{Batch, ShardStore};

/// Why a rotation is due
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationReason {
    YearChanged,
    MonthChanged,
    SizeLimit,
    RecordLimit,
}

impl RotationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::YearChanged => "year_changed",
            Self::MonthChanged => "month_changed",
            Self::SizeLimit => "size_limit",
            Self::RecordLimit => "record_limit",
        }
    }
}

impl fmt::Display for RotationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a rotation check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationDecision {
    pub needs_rotation: bool,
    pub reason: Option<RotationReason>,
    /// False when no shard is current yet
    pub initialized: bool,
}

impl RotationDecision {
    /// No current shard exists
    pub fn uninitialized() -> Self {
        Self {
            needs_rotation: false,
            reason: None,
            initialized: false,
        }
    }

    /// Current shard is fine
    pub fn keep() -> Self {
        Self {
            needs_rotation: false,
            reason: None,
            initialized: true,
        }
    }

    /// Rotation is due
    pub fn rotate(reason: RotationReason) -> Self {
        Self {
            needs_rotation: true,
            reason: Some(reason),
            initialized: true,
        }
    }
}

/// Evaluate the rotation policy
///
/// Calendar boundaries are checked first, then size (at or above the limit),
/// then record count (strictly above the limit). A zero limit is disabled.
pub fn evaluate(
    config: &ShardConfig,
    current: Option<&ShardRecord>,
    size_bytes: u64,
    record_count: u64,
    now: &DateTime<Utc>,
) -> RotationDecision {
    let current = match current {
        Some(current) => current,
        None => return RotationDecision::uninitialized(),
    };

    if current.period_key.boundary_crossed(now, config.rotation_mode) {
        let reason = if config.rotation_mode == RotationMode::Monthly && now.year() == current.period_key.year {
            RotationReason::MonthChanged
        } else {
            RotationReason::YearChanged
        };
        return RotationDecision::rotate(reason);
    }

    if config.max_size_bytes > 0 && size_bytes >= config.max_size_bytes {
        return RotationDecision::rotate(RotationReason::SizeLimit);
    }

    if config.max_records > 0 && record_count > config.max_records {
        return RotationDecision::rotate(RotationReason::RecordLimit);
    }

    RotationDecision::keep()
}

/// Rows handled by a copy step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyStats {
    /// Rows written to the new shard
    pub copied: u64,
    /// Rows already present from an earlier attempt
    pub existing: u64,
    /// Rows whose links could not be resolved in the new shard
    pub orphaned: u64,
}

impl CopyStats {
    pub fn merge(&mut self, other: CopyStats) {
        self.copied += other.copied;
        self.existing += other.existing;
        self.orphaned += other.orphaned;
    }
}

/// Result of a completed rotation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationOutcome {
    /// New current shard
    pub shard: ShardRecord,
    /// Shard that was current before
    pub previous: Option<String>,
    pub copied: CopyStats,
    pub duration_ms: u64,
}

/// Point every link of `value` at the matching row of the target shard
///
/// Returns false when a referenced row has no counterpart there.
fn remap_links<T: Entity>(value: &mut T, source: &ShardStore, batch: &Batch<'_>) -> bool {
    for relation in T::RELATIONS {
        let id = match value.link(relation.name) {
            Some(link) => link.id(),
            None => continue,
        };
        let mapped = source
            .key_of(relation.target, id)
            .and_then(|key| batch.find_by_key(relation.target, &key));
        match mapped {
            Some(target_id) => value.relink(relation.name, Link::new(target_id)),
            None => return false,
        }
    }
    true
}

/// Copy every reference row not yet present in the target
pub(crate) fn copy_reference_rows<T: Entity>(source: &ShardStore, target: &ShardStore) -> Result<CopyStats> {
    let rows = source.scan::<T>()?;

    let stats = target.commit(|batch| {
        let mut stats = CopyStats::default();
        for row in rows {
            if let Some(key) = row.business_key() {
                if batch.find_by_key(T::KIND, key).is_some() {
                    stats.existing += 1;
                    continue;
                }
            }

            let source_id = row.id();
            let mut value = row.into_data();
            if !remap_links(&mut value, source, batch) {
                warn!(kind = T::KIND, row = source_id, "Skipping row with unresolved link");
                stats.orphaned += 1;
                continue;
            }

            batch.insert(&value)?;
            stats.copied += 1;
        }
        Ok(stats)
    })?;

    debug!(
        kind = T::KIND,
        copied = stats.copied,
        existing = stats.existing,
        orphaned = stats.orphaned,
        "Copied reference rows"
    );
    Ok(stats)
}

/// Copy the most recent `keep_tail` log rows per owner
pub(crate) fn copy_log_tail<T: Entity>(source: &ShardStore, target: &ShardStore, keep_tail: usize) -> Result<CopyStats> {
    if keep_tail == 0 {
        return Ok(CopyStats::default());
    }

    let owner_of = |value: &T| -> Option<RowId> { T::OWNER.and_then(|owner| value.link(owner)).map(|link| link.id()) };

    let mut groups: BTreeMap<Option<RowId>, Vec<T>> = BTreeMap::new();
    for row in source.scan::<T>()? {
        let value = row.into_data();
        groups.entry(owner_of(&value)).or_default().push(value);
    }

    let mut tail = Vec::new();
    for (_, mut values) in groups {
        values.sort_by_key(|value| value.timestamp());
        let skip = values.len().saturating_sub(keep_tail);
        tail.extend(values.into_iter().skip(skip));
    }
    tail.sort_by_key(|value| value.timestamp());

    let stats = target.commit(|batch| {
        let mut stats = CopyStats::default();
        // Rows left by an earlier attempt, counted per owner and timestamp
        let mut present: HashMap<(Option<RowId>, DateTime<Utc>), usize> = HashMap::new();
        for (_, value) in batch.scan::<T>()? {
            *present.entry((owner_of(&value), value.timestamp())).or_default() += 1;
        }

        for mut value in tail {
            if !remap_links(&mut value, source, batch) {
                stats.orphaned += 1;
                continue;
            }
            if let Some(left) = present.get_mut(&(owner_of(&value), value.timestamp())) {
                if *left > 0 {
                    *left -= 1;
                    stats.existing += 1;
                    continue;
                }
            }
            batch.insert(&value)?;
            stats.copied += 1;
        }
        Ok(stats)
    })?;

    if stats.orphaned > 0 {
        warn!(kind = T::KIND, orphaned = stats.orphaned, "Skipped log rows with unresolved links");
    }
    debug!(kind = T::KIND, copied = stats.copied, "Copied log tail");
    Ok(stats)
}

/// Build the file for a new shard from the current one
///
/// A leftover `.partial` file from a failed attempt is resumed; rows that
/// already made it across are not copied twice.
pub(crate) fn build_shard(
    base_dir: &Path,
    name: &str,
    catalog: &Catalog,
    source: &ShardStore,
    keep_tail: usize,
    sync_writes: bool,
) -> Result<CopyStats> {
    // Step 1: open or resume the partial file
    util::ensure_shards_dir(base_dir)?;
    let partial = util::partial_path(base_dir, name);
    if partial.exists() {
        info!(shard = name, "Resuming partially built shard");
    }
    let mut stats = CopyStats::default();
    {
        let target = ShardStore::open_or_create(&partial, name, sync_writes)?;
        target.apply_schema(&catalog.schema())?;

        // Step 2: reference data first, then the log tail
        for entry in catalog.copy_plan() {
            stats.merge(entry.copy_forward(source, &target, keep_tail)?);
        }
    }

    // Step 3: publish the file under its final name
    fs::rename(&partial, util::shard_path(base_dir, name))?;
    Ok(stats)
}

/// Copy reference rows that reached the source after [`build_shard`] ran
///
/// Must run with writes to the source stopped. Rows already in the new shard
/// are skipped, so only late arrivals are counted as copied.
pub(crate) fn catch_up_references(
    base_dir: &Path,
    name: &str,
    catalog: &Catalog,
    source: &ShardStore,
    sync_writes: bool,
) -> Result<CopyStats> {
    let target = ShardStore::open(util::shard_path(base_dir, name), name, sync_writes)?;
    let mut stats = CopyStats::default();
    for entry in catalog.copy_plan() {
        if entry.class() == EntityClass::Reference {
            stats.merge(entry.copy_forward(source, &target, 0)?);
        }
    }

    if stats.copied > 0 {
        info!(shard = name, copied = stats.copied, "Copied reference rows written during rotation");
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::PeriodKey;
    use crate::telemetry::{self, Device, Sensor, SensorLog};
    use chrono::{Duration, TimeZone};
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn record(key: PeriodKey) -> ShardRecord {
        ShardRecord::new("shard", PathBuf::from("x"), key)
    }

    #[test]
    fn test_evaluate_calendar() {
        let config = ShardConfig::new().with_max_size_bytes(0).with_max_records(0);
        let current = record(PeriodKey::day(2024, 5, 17));
        let june = Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap();
        let next_year = Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap();

        assert_eq!(evaluate(&config, Some(&current), 0, 0, &june), RotationDecision::keep());
        assert_eq!(
            evaluate(&config, Some(&current), 0, 0, &next_year).reason,
            Some(RotationReason::YearChanged)
        );

        let monthly = config.clone().with_rotation_mode(RotationMode::Monthly);
        assert_eq!(
            evaluate(&monthly, Some(&current), 0, 0, &june).reason,
            Some(RotationReason::MonthChanged)
        );
        assert_eq!(
            evaluate(&monthly, Some(&current), 0, 0, &next_year).reason,
            Some(RotationReason::YearChanged)
        );

        let manual = config.with_rotation_mode(RotationMode::Manual);
        assert!(!evaluate(&manual, Some(&current), 0, 0, &next_year).needs_rotation);
    }

    #[test]
    fn test_evaluate_limits() {
        let config = ShardConfig::new()
            .with_rotation_mode(RotationMode::Manual)
            .with_max_size_mb(1)
            .with_max_records(1000);
        let current = record(PeriodKey::year(2024));
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();

        let size = 1024 * 1024;
        assert_eq!(evaluate(&config, Some(&current), size - 1, 0, &now), RotationDecision::keep());
        assert_eq!(
            evaluate(&config, Some(&current), size, 0, &now).reason,
            Some(RotationReason::SizeLimit)
        );
        assert!(!evaluate(&config, Some(&current), 0, 1000, &now).needs_rotation);
        assert_eq!(
            evaluate(&config, Some(&current), 0, 1001, &now).reason,
            Some(RotationReason::RecordLimit)
        );

        let decision = evaluate(&config, None, size, 5000, &now);
        assert!(!decision.needs_rotation);
        assert!(!decision.initialized);
    }

    #[test]
    fn test_build_shard_copies_and_remaps() -> Result<()> {
        let temp_dir = tempdir()?;
        util::ensure_shards_dir(temp_dir.path())?;
        let catalog = telemetry::catalog()?;

        let source = ShardStore::create(util::shard_path(temp_dir.path(), "default"), "default", false)?;
        source.apply_schema(&catalog.schema())?;

        // Shift ids so the copies get different local ids
        let filler = source.insert(&Device::new("filler", "x"))?;
        let device = source.insert(&Device::new("dev-1", "Boiler"))?;
        source.delete("device", filler.id())?;
        let sensor = source.insert(&Sensor::new(Link::new(device.id()), "temp"))?;

        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for i in 0..10 {
            source.insert(&SensorLog::new(Link::new(sensor.id()), i as f64, start + Duration::minutes(i)))?;
        }

        let stats = build_shard(temp_dir.path(), "shard_2025-01-01", &catalog, &source, 3, false)?;
        assert_eq!(stats.copied, 5);
        assert!(!util::partial_path(temp_dir.path(), "shard_2025-01-01").exists());

        let target = ShardStore::open(util::shard_path(temp_dir.path(), "shard_2025-01-01"), "new", false)?;
        let devices = target.scan::<Device>()?;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id(), 1);
        assert_ne!(devices[0].id(), device.id());

        let sensors = target.scan::<Sensor>()?;
        assert_eq!(sensors[0].device.id(), devices[0].id());
        assert_eq!(sensors[0].business_key(), sensor.business_key());

        let logs = target.scan::<SensorLog>()?;
        let values: Vec<f64> = logs.iter().map(|row| row.value).collect();
        assert_eq!(values, vec![7.0, 8.0, 9.0]);
        assert!(logs.iter().all(|row| row.sensor.id() == sensors[0].id()));
        Ok(())
    }

    #[test]
    fn test_build_shard_resumes_partial() -> Result<()> {
        let temp_dir = tempdir()?;
        util::ensure_shards_dir(temp_dir.path())?;
        let catalog = telemetry::catalog()?;

        let source = ShardStore::create(util::shard_path(temp_dir.path(), "default"), "default", false)?;
        source.apply_schema(&catalog.schema())?;
        source.insert(&Device::new("dev-1", "A"))?;
        source.insert(&Device::new("dev-2", "B"))?;

        // An earlier attempt copied one device before failing
        {
            let partial = ShardStore::create(util::partial_path(temp_dir.path(), "next"), "next", false)?;
            partial.apply_schema(&catalog.schema())?;
            partial.insert(&Device::new("dev-1", "A"))?;
        }

        let stats = build_shard(temp_dir.path(), "next", &catalog, &source, 0, false)?;
        assert_eq!(stats.copied, 1);
        assert_eq!(stats.existing, 1);

        let target = ShardStore::open(util::shard_path(temp_dir.path(), "next"), "next", false)?;
        assert_eq!(target.count("device"), 2);
        Ok(())
    }

    #[test]
    fn test_orphan_rows_are_skipped() -> Result<()> {
        let temp_dir = tempdir()?;
        util::ensure_shards_dir(temp_dir.path())?;
        let catalog = telemetry::catalog()?;

        let source = ShardStore::create(util::shard_path(temp_dir.path(), "default"), "default", false)?;
        source.apply_schema(&catalog.schema())?;
        let device = source.insert(&Device::new("dev-1", "A"))?;
        source.insert(&Sensor::new(Link::new(device.id()), "temp"))?;
        source.delete("device", device.id())?;

        let stats = build_shard(temp_dir.path(), "next", &catalog, &source, 0, false)?;
        assert_eq!(stats.orphaned, 1);
        assert_eq!(stats.copied, 0);
        Ok(())
    }

    #[test]
    fn test_log_tail_keeps_rows_sharing_a_timestamp() -> Result<()> {
        let temp_dir = tempdir()?;
        util::ensure_shards_dir(temp_dir.path())?;
        let catalog = telemetry::catalog()?;

        let source = ShardStore::create(util::shard_path(temp_dir.path(), "default"), "default", false)?;
        source.apply_schema(&catalog.schema())?;
        let device = source.insert(&Device::new("dev-1", "A"))?;
        let sensor = source.insert(&Sensor::new(Link::new(device.id()), "temp"))?;
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for value in [1.0, 2.0, 3.0] {
            source.insert(&SensorLog::new(Link::new(sensor.id()), value, at))?;
        }

        // An earlier attempt copied one of the three readings
        {
            let partial = ShardStore::create(util::partial_path(temp_dir.path(), "next"), "next", false)?;
            partial.apply_schema(&catalog.schema())?;
            let device = partial.insert(&Device::new("dev-1", "A"))?;
            let sensor = partial.insert(&Sensor::new(Link::new(device.id()), "temp"))?;
            partial.insert(&SensorLog::new(Link::new(sensor.id()), 1.0, at))?;
        }

        let stats = build_shard(temp_dir.path(), "next", &catalog, &source, 3, false)?;
        assert_eq!(stats.copied, 2);
        assert_eq!(stats.existing, 3);

        let target = ShardStore::open(util::shard_path(temp_dir.path(), "next"), "next", false)?;
        assert_eq!(target.count("sensor_log"), 3);

        // A clean run copies every reading
        let stats = build_shard(temp_dir.path(), "fresh", &catalog, &source, 3, false)?;
        assert_eq!(stats.copied, 5);
        let fresh = ShardStore::open(util::shard_path(temp_dir.path(), "fresh"), "fresh", false)?;
        assert_eq!(fresh.count("sensor_log"), 3);
        Ok(())
    }
}
