//! Shard manager and sessions
//!
//! The [`ShardManager`] owns the control partition, the shard registry and
//! the pool of open shards. Work is done through a [`Session`], which carries
//! the execution context resolved when the operation started.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, info_span, warn};

use crate::config::{ManagerOptions, ShardConfig};
use crate::context::{parse_shard_list, ExecutionContext, GlobalSelection};
use crate::entity::{Catalog, Entity, Link, Row};
use crate::error::{Error, Result};
use crate::guard;
use crate::metrics::MetricsCollector;
use crate::query::QuerySet;
use crate::rotation::{self, CopyStats, RotationDecision, RotationOutcome};
use crate::routing::{write_route, WriteRoute};
use crate::shard::{
    control_schema, util, PeriodKey, ShardPool, ShardRecord, ShardRegistry, ShardStat, ShardStatus,
    CONTROL_NAME,
};
use crate::store::ShardStore;

/// Result of [`ShardManager::initialize`]
#[derive(Debug, Clone)]
pub struct InitReport {
    /// Policy in effect
    pub config: ShardConfig,
    /// Shards registered by the directory scan
    pub discovered: Vec<String>,
    /// Current shard after initialization
    pub current: String,
}

/// Entry point for sharded storage
pub struct ShardManager {
    pub(crate) options: ManagerOptions,
    pub(crate) catalog: Catalog,
    pub(crate) control: Arc<ShardStore>,
    pub(crate) registry: ShardRegistry,
    pub(crate) pool: ShardPool,
    pub(crate) metrics: Arc<MetricsCollector>,
    /// Held for the whole of a rotation
    rotation_lock: Mutex<()>,
    /// Writes hold it shared; the current-shard flip holds it exclusively
    write_gate: RwLock<()>,
    /// Sharded writes since the last sampled rotation check
    writes_since_check: AtomicU64,
}

impl std::fmt::Debug for ShardManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardManager")
            .field("directory", &self.options.directory)
            .field("catalog", &self.catalog)
            .field("registry", &self.registry)
            .finish()
    }
}

impl ShardManager {
    /// Open a manager with default options rooted at `directory`
    pub fn new<P: AsRef<Path>>(directory: P, catalog: Catalog) -> Result<Self> {
        Self::open(ManagerOptions::new(directory), catalog)
    }

    /// Open a manager, initialize it and rotate once if the policy asks for it
    pub fn open(options: ManagerOptions, catalog: Catalog) -> Result<Self> {
        options.validate()?;
        fs::create_dir_all(&options.directory)?;
        util::ensure_shards_dir(&options.directory)?;

        let control = ShardStore::open_or_create(
            util::control_path(&options.directory),
            CONTROL_NAME,
            options.sync_writes,
        )?;
        control.apply_schema(&control_schema())?;
        let control = Arc::new(control);

        let schema = catalog.schema();
        let registry = ShardRegistry::open(
            Arc::clone(&control),
            &options.directory,
            options.legacy_shard_name.clone(),
            schema.clone(),
            options.sync_writes,
        )?;
        let pool = ShardPool::new(schema, options.sync_writes);

        let manager = Self {
            options,
            catalog,
            control,
            registry,
            pool,
            metrics: Arc::new(MetricsCollector::new()),
            rotation_lock: Mutex::new(()),
            write_gate: RwLock::new(()),
            writes_since_check: AtomicU64::new(0),
        };

        let report = manager.initialize()?;
        if report.config.auto_rotate {
            manager.auto_rotate(&Utc::now());
        }

        Ok(manager)
    }

    /// Ensure the policy row exists, register unknown shard files and make
    /// sure a current shard exists
    pub fn initialize(&self) -> Result<InitReport> {
        let config = self.ensure_config()?;
        let now = Utc::now();
        let discovered: Vec<String> = self
            .registry
            .rescan_directory(&now)?
            .into_iter()
            .map(|record| record.name)
            .collect();
        let current = self.registry.get_current()?;

        info!(
            current = %current.name,
            discovered = discovered.len(),
            mode = %config.rotation_mode,
            "Initialized shard manager"
        );

        Ok(InitReport {
            config,
            discovered,
            current: current.name,
        })
    }

    fn ensure_config(&self) -> Result<ShardConfig> {
        self.control.commit(|batch| {
            if let Some((_, config)) = batch.scan::<ShardConfig>()?.into_iter().next() {
                return Ok(config);
            }
            let config = ShardConfig::default();
            batch.insert(&config)?;
            Ok(config)
        })
    }

    /// Options the manager was opened with
    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    /// Registered entity types
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Operational counters
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Shard registry
    pub fn registry(&self) -> &ShardRegistry {
        &self.registry
    }

    /// Rotation policy in effect
    pub fn config(&self) -> Result<ShardConfig> {
        Ok(self
            .control
            .scan::<ShardConfig>()?
            .into_iter()
            .next()
            .map(Row::into_data)
            .unwrap_or_default())
    }

    /// Replace the rotation policy
    pub fn set_config(&self, config: ShardConfig) -> Result<ShardConfig> {
        config.validate()?;
        let now = Utc::now();

        let config = self.control.commit(|batch| {
            let mut config = config;
            config.updated_at = now;
            match batch.scan::<ShardConfig>()?.into_iter().next() {
                Some((id, existing)) => {
                    config.created_at = existing.created_at;
                    batch.update(id, &config)?;
                }
                None => {
                    batch.insert(&config)?;
                }
            }
            Ok(config)
        })?;

        info!(
            mode = %config.rotation_mode,
            max_size_mb = config.max_size_mb(),
            max_records = config.max_records,
            auto_rotate = config.auto_rotate,
            keep_tail_count = config.keep_tail_count,
            "Updated rotation policy"
        );
        Ok(config)
    }

    /// Administrator's default read scope
    pub fn selection(&self) -> Result<GlobalSelection> {
        Ok(self
            .control
            .scan::<GlobalSelection>()?
            .into_iter()
            .next()
            .map(Row::into_data)
            .unwrap_or_default())
    }

    /// Replace the default read scope; every name must be registered
    pub fn set_selection(&self, names: Vec<String>, view_mode: Option<String>) -> Result<GlobalSelection> {
        let mut selected: Vec<String> = Vec::with_capacity(names.len());
        for name in names {
            if self.registry.find(&name)?.is_none() {
                return Err(Error::validation(format!("Unknown shard: {}", name)));
            }
            if !selected.contains(&name) {
                selected.push(name);
            }
        }

        let now = Utc::now();
        let selection = self.control.commit(|batch| {
            let existing = batch.scan::<GlobalSelection>()?.into_iter().next();
            let mut selection = existing
                .as_ref()
                .map(|(_, selection)| selection.clone())
                .unwrap_or_default();
            selection.selected_shard_names = selected;
            if let Some(view_mode) = view_mode {
                selection.view_mode = view_mode;
            }
            selection.updated_at = now;

            match existing {
                Some((id, _)) => batch.update(id, &selection)?,
                None => {
                    batch.insert(&selection)?;
                }
            }
            Ok(selection)
        })?;

        info!(shards = ?selection.selected_shard_names, "Updated global shard selection");
        Ok(selection)
    }

    /// Start an operation with an optional per-request shard override
    pub fn session(&self, override_names: Option<&[String]>) -> Result<Session<'_>> {
        let current = self.registry.get_current()?;
        let global = self.selection()?;
        let ctx = ExecutionContext::resolve(override_names, Some(&global), &current.name);

        debug!(
            operation = %ctx.operation_id,
            source = ?ctx.source,
            shards = ?ctx.selected,
            "Resolved execution context"
        );
        Ok(Session { manager: self, ctx })
    }

    /// Start an operation from the value of the shard-select request header
    pub fn session_from_header(&self, header: Option<&str>) -> Result<Session<'_>> {
        let names = header.and_then(parse_shard_list);
        self.session(names.as_deref())
    }

    /// Run `f` inside a session, with its operation id on every log line
    pub fn operation<R>(&self, override_names: Option<&[String]>, f: impl FnOnce(&Session<'_>) -> Result<R>) -> Result<R> {
        let session = self.session(override_names)?;
        let span = info_span!("operation", id = %session.ctx.operation_id);
        let _entered = span.enter();
        f(&session)
    }

    /// Evaluate the rotation policy against the current shard
    pub fn check_rotation_needed(&self, now: &DateTime<Utc>) -> Result<RotationDecision> {
        self.metrics.record_rotation_check();
        let config = self.config()?;

        let current = match self.registry.current() {
            Some(current) => current,
            None => return Ok(RotationDecision::uninitialized()),
        };
        let store = self.pool.get(&current)?;
        let records: u64 = self
            .catalog
            .log_kinds()
            .iter()
            .map(|kind| store.count(kind))
            .sum();

        Ok(rotation::evaluate(&config, Some(&current), store.size_bytes(), records, now))
    }

    /// Build the shard for the period of `now` and make it current
    ///
    /// Fails with a conflict when that shard already exists or another
    /// rotation is running. On failure the registry is unchanged.
    pub fn create_new_shard(&self, now: &DateTime<Utc>) -> Result<RotationOutcome> {
        let start = Instant::now();
        let period_key = PeriodKey::from_timestamp(now);
        let name = util::shard_name(&period_key);
        let path = util::shard_path(&self.options.directory, &name);

        // Step 1: only one rotation at a time
        let _rotation = self
            .rotation_lock
            .try_lock()
            .ok_or_else(|| Error::conflict("A rotation is already in progress"))?;

        // Step 2: the target must not exist yet
        if self.registry.contains(&name)? || path.exists() {
            return Err(Error::conflict(format!("Shard {} already exists", name)));
        }

        // Step 3: build the new file from the current shard
        let current = self.registry.get_current()?;
        let source = self.pool.get(&current)?;
        let config = self.config()?;
        info!(shard = %name, from = %current.name, "Starting rotation");

        let copied = match rotation::build_shard(
            &self.options.directory,
            &name,
            &self.catalog,
            &source,
            config.keep_tail_count as usize,
            self.options.sync_writes,
        ) {
            Ok(copied) => copied,
            Err(e) => {
                self.metrics.record_rotation_failure();
                error!(shard = %name, error = %e, "Rotation failed; current shard unchanged");
                return Err(e);
            }
        };

        // Step 4: flip the current shard with no write in flight
        self.finish_rotation(&name, period_key, &current, &source, copied, start)
    }

    /// Stop writes, copy late reference rows and flip the current shard
    fn finish_rotation(
        &self,
        name: &str,
        period_key: PeriodKey,
        current: &ShardRecord,
        source: &ShardStore,
        copied: CopyStats,
        start: Instant,
    ) -> Result<RotationOutcome> {
        let path = util::shard_path(&self.options.directory, name);
        let mut copied = copied;

        let promoted = {
            let _gate = self.write_gate.write();
            rotation::catch_up_references(&self.options.directory, name, &self.catalog, source, self.options.sync_writes)
                .and_then(|late| {
                    copied.copied += late.copied;
                    copied.orphaned += late.orphaned;

                    let mut record = ShardRecord::new(name, path.clone(), period_key);
                    record.size_bytes = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                    self.registry.promote_new(record)
                })
        };
        let shard = match promoted {
            Ok(shard) => shard,
            Err(e) => {
                self.metrics.record_rotation_failure();
                error!(shard = name, error = %e, "Could not promote rotated shard");
                return Err(e);
            }
        };

        let duration = start.elapsed();
        self.metrics.record_rotation(duration);
        info!(
            shard = %shard.name,
            previous = %current.name,
            copied = copied.copied,
            orphaned = copied.orphaned,
            duration_ms = duration.as_millis() as u64,
            "Rotation complete"
        );

        Ok(RotationOutcome {
            shard,
            previous: Some(current.name.clone()),
            copied,
            duration_ms: duration.as_millis() as u64,
        })
    }

    /// Rotate if the policy says so
    pub fn rotate(&self, now: &DateTime<Utc>) -> Result<Option<RotationOutcome>> {
        let decision = self.check_rotation_needed(now)?;
        if !decision.needs_rotation {
            return Ok(None);
        }
        info!(reason = ?decision.reason, "Rotation needed");
        self.create_new_shard(now).map(Some)
    }

    /// Rotate if needed, logging instead of failing
    fn auto_rotate(&self, now: &DateTime<Utc>) {
        match self.rotate(now) {
            Ok(_) => {}
            Err(e) if e.is_conflict() => debug!(error = %e, "Skipping automatic rotation"),
            Err(e) => warn!(error = %e, "Automatic rotation failed"),
        }
    }

    /// Sampled rotation check after a sharded write
    fn after_write(&self) {
        let writes = self.writes_since_check.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % self.options.rotation_check_interval != 0 {
            return;
        }

        match self.config() {
            Ok(config) if config.auto_rotate => self.auto_rotate(&Utc::now()),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Could not load rotation policy"),
        }
    }

    /// Record observed size and row counts for every readable shard
    pub fn refresh_stats(&self) -> Result<()> {
        for record in self.registry.list()? {
            if !record.is_readable() {
                continue;
            }

            let store = match self.pool.get(&record) {
                Ok(store) => store,
                Err(e) if e.is_corruption_error() => {
                    warn!(shard = %record.name, error = %e, "Marking shard as corrupted");
                    self.registry.set_status(&record.name, ShardStatus::Corrupted)?;
                    continue;
                }
                Err(e) => {
                    warn!(shard = %record.name, error = %e, "Could not open shard for statistics");
                    continue;
                }
            };

            let records: u64 = self
                .catalog
                .log_kinds()
                .iter()
                .map(|kind| store.count(kind))
                .sum();
            self.registry
                .update_stats(&record.name, store.size_bytes(), records)?;
        }
        Ok(())
    }

    /// Refreshed statistics for every shard
    pub fn stats(&self) -> Result<Vec<ShardStat>> {
        self.refresh_stats()?;
        Ok(self.registry.list()?.iter().map(ShardRecord::stat).collect())
    }

    /// Register shard files the registry does not know about
    pub fn rescan(&self) -> Result<Vec<ShardRecord>> {
        self.registry.rescan_directory(&Utc::now())
    }
}

/// One logical operation against the manager
pub struct Session<'m> {
    pub(crate) manager: &'m ShardManager,
    pub(crate) ctx: ExecutionContext,
}

impl<'m> Session<'m> {
    /// Execution context of this operation
    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    /// Name of the shard sharded writes currently go to
    pub fn current_shard(&self) -> Result<String> {
        Ok(self.manager.registry.get_current()?.name)
    }

    /// Resolve a row for use in a link of a new write
    pub fn link<U: Entity>(&self, row: &Row<U>) -> Result<Link> {
        let current = self.current_shard()?;
        guard::check_row(&current, row).map_err(|e| self.violation(e))?;
        Ok(Link::from_shard(row.id(), current))
    }

    fn violation(&self, error: Error) -> Error {
        self.manager.metrics.record_write_safety_violation();
        warn!(operation = %self.ctx.operation_id, error = %error, "Refused write");
        error
    }

    /// Insert a row into the current shard, or the control partition for
    /// control-plane kinds
    pub fn insert<T: Entity>(&self, value: &T) -> Result<Row<T>> {
        let start = Instant::now();
        let (row, sharded) = {
            let _gate = self.manager.write_gate.read();
            let current = self.manager.registry.get_current()?;
            match write_route::<T>(&current.name) {
                WriteRoute::Control => (self.manager.control.insert(value)?, false),
                WriteRoute::Shard(name) => {
                    guard::check_links(&name, value).map_err(|e| self.violation(e))?;
                    (self.manager.pool.get(&current)?.insert(value)?, true)
                }
            }
        };

        self.manager.metrics.record_write(start.elapsed());
        if sharded {
            self.manager.after_write();
        }
        Ok(row)
    }

    /// Store a row read earlier may be written back to
    ///
    /// Control-plane rows go back to the control partition; every other row
    /// must come from the current shard.
    fn write_target<T: Entity>(&self, current: &ShardRecord, row: &Row<T>) -> Result<(Arc<ShardStore>, String)> {
        let (store, name) = match write_route::<T>(&current.name) {
            WriteRoute::Control => (Arc::clone(&self.manager.control), CONTROL_NAME.to_string()),
            WriteRoute::Shard(name) => (self.manager.pool.get(current)?, name),
        };
        guard::check_row(&name, row).map_err(|e| self.violation(e))?;
        Ok((store, name))
    }

    /// Write back a row read from the current shard
    pub fn update<T: Entity>(&self, row: &Row<T>) -> Result<Row<T>> {
        let start = Instant::now();
        let updated = {
            let _gate = self.manager.write_gate.read();
            let current = self.manager.registry.get_current()?;
            let (store, name) = self.write_target(&current, row)?;
            guard::check_links(&name, row.data()).map_err(|e| self.violation(e))?;
            store.update(row.id(), row.data())?
        };

        self.manager.metrics.record_write(start.elapsed());
        Ok(updated)
    }

    /// Delete a row read from the current shard
    pub fn delete<T: Entity>(&self, row: &Row<T>) -> Result<()> {
        let start = Instant::now();
        {
            let _gate = self.manager.write_gate.read();
            let current = self.manager.registry.get_current()?;
            let (store, _) = self.write_target(&current, row)?;
            store.delete(T::KIND, row.id())?;
        }

        self.manager.metrics.record_write(start.elapsed());
        Ok(())
    }

    /// Start a query over `T`
    pub fn query<T: Entity>(&self) -> QuerySet<'_, T> {
        QuerySet::new(self)
    }
}
