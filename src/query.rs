//! Cross-shard queries
//!
//! A [`QuerySet`] is built from a session and executes against the shards the
//! session's context selects. Results from several shards are merged in
//! search order (current shard first), deduplicated by business key, sorted
//! by the entity's timestamp and only then paged.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::entity::{relation_of, BusinessKey, Entity, EntityClass, Row, RowId};
use crate::error::{Error, Result};
use crate::manager::Session;
use crate::routing::read_route;
use crate::store::ShardStore;

/// Sort order for query results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Oldest first
    Ascending,
    /// Newest first
    Descending,
}

/// Rows of a fan-out read together with the shards that were skipped
#[derive(Debug)]
pub struct QueryOutcome<T> {
    pub rows: Vec<Row<T>>,
    /// One [`Error::PartialFailure`] per skipped shard
    pub failures: Vec<Error>,
}

type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

enum Filter<T> {
    Where {
        pred: Predicate<T>,
        negate: bool,
    },
    /// Match rows whose relation points at a given row, resolved per shard
    Related {
        relation: &'static str,
        target_kind: &'static str,
        origin: String,
        id: RowId,
        key: Option<BusinessKey>,
        negate: bool,
    },
}

/// A filter with its relation target resolved against one shard
enum Resolved<'f, T> {
    Where(&'f Predicate<T>, bool),
    Related(&'static str, Option<RowId>, bool),
}

impl<'f, T: Entity> Resolved<'f, T> {
    fn matches(&self, value: &T) -> bool {
        match self {
            Resolved::Where(pred, negate) => {
                let pred: &(dyn Fn(&T) -> bool + Send + Sync) = &***pred;
                pred(value) != *negate
            }
            Resolved::Related(relation, target, negate) => {
                let linked = value.link(relation).map(|link| link.id());
                let hit = target.is_some() && linked == *target;
                hit != *negate
            }
        }
    }
}

/// Lazily evaluated query over one entity type
pub struct QuerySet<'a, T: Entity> {
    session: &'a Session<'a>,
    filters: Vec<Filter<T>>,
    order: SortOrder,
    offset: usize,
    limit: Option<usize>,
    pinned: Option<String>,
    strict: bool,
    invalid: Option<String>,
}

impl<'a, T: Entity> QuerySet<'a, T> {
    pub(crate) fn new(session: &'a Session<'a>) -> Self {
        Self {
            session,
            filters: Vec::new(),
            order: SortOrder::Ascending,
            offset: 0,
            limit: None,
            pinned: None,
            strict: false,
            invalid: None,
        }
    }

    /// Keep rows matching a predicate
    pub fn filter<F>(mut self, pred: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.filters.push(Filter::Where {
            pred: Arc::new(pred),
            negate: false,
        });
        self
    }

    /// Drop rows matching a predicate
    pub fn exclude<F>(mut self, pred: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.filters.push(Filter::Where {
            pred: Arc::new(pred),
            negate: true,
        });
        self
    }

    /// Keep rows whose `relation` points at `target`
    ///
    /// The target is matched by business key in every shard, so a row read
    /// from one shard selects the corresponding rows of all shards.
    pub fn related_to<U: Entity>(self, relation: &'static str, target: &Row<U>) -> Self {
        self.related(relation, target, false)
    }

    /// Drop rows whose `relation` points at `target`
    pub fn not_related_to<U: Entity>(self, relation: &'static str, target: &Row<U>) -> Self {
        self.related(relation, target, true)
    }

    fn related<U: Entity>(mut self, relation: &'static str, target: &Row<U>, negate: bool) -> Self {
        match relation_of::<T>(relation) {
            Some(declared) if declared.target == U::KIND => {
                self.filters.push(Filter::Related {
                    relation,
                    target_kind: U::KIND,
                    origin: target.shard().to_string(),
                    id: target.id(),
                    key: target.business_key().cloned(),
                    negate,
                });
            }
            _ => {
                self.invalid = Some(format!(
                    "{} has no relation {} to {}",
                    T::KIND,
                    relation,
                    U::KIND
                ));
            }
        }
        self
    }

    /// Set the sort order
    pub fn order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    /// Skip rows after sorting
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Return at most `limit` rows after sorting
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Read a single named shard regardless of the context
    pub fn on_shard(mut self, name: impl Into<String>) -> Self {
        self.pinned = Some(name.into());
        self
    }

    /// Fail instead of skipping shards that cannot be read
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    fn check(&self) -> Result<()> {
        match &self.invalid {
            Some(message) => Err(Error::validation(message.clone())),
            None => Ok(()),
        }
    }

    /// Shards to read, in search order
    fn shards(&self) -> Result<Vec<String>> {
        self.check()?;
        let current = self.session.current_shard()?;
        Ok(read_route::<T>(&self.session.ctx, &current, self.pinned.as_deref()).shards())
    }

    fn open_store(&self, name: &str) -> Result<Arc<ShardStore>> {
        let manager = self.session.manager;
        if T::CLASS == EntityClass::Control {
            return Ok(Arc::clone(&manager.control));
        }
        let record = manager
            .registry
            .find(name)?
            .ok_or_else(|| Error::not_found(format!("Shard {} is not registered", name)))?;
        manager.pool.get(&record)
    }

    /// Matching rows of one shard in id order
    fn shard_rows(&self, name: &str) -> Result<Vec<Row<T>>> {
        let store = self.open_store(name)?;

        let resolved: Vec<Resolved<'_, T>> = self
            .filters
            .iter()
            .map(|filter| match filter {
                Filter::Where { pred, negate } => Resolved::Where(pred, *negate),
                Filter::Related {
                    relation,
                    target_kind,
                    origin,
                    id,
                    key,
                    negate,
                } => {
                    let target = match key {
                        Some(key) => store.find_by_key(target_kind, key),
                        None if origin == store.name() => Some(*id),
                        None => None,
                    };
                    Resolved::Related(*relation, target, *negate)
                }
            })
            .collect();

        Ok(store
            .scan::<T>()?
            .into_iter()
            .filter(|row| resolved.iter().all(|filter| filter.matches(row.data())))
            .collect())
    }

    /// Read every shard, skipping failures unless strict
    fn collect(&self, names: &[String]) -> Result<(Vec<Vec<Row<T>>>, Vec<Error>)> {
        if names.len() == 1 {
            return Ok((vec![self.shard_rows(&names[0])?], Vec::new()));
        }

        let manager = self.session.manager;
        let results: Vec<(String, Result<Vec<Row<T>>>)> = if manager.options.parallel_fanout {
            names
                .par_iter()
                .map(|name| (name.clone(), self.shard_rows(name)))
                .collect()
        } else {
            names
                .iter()
                .map(|name| (name.clone(), self.shard_rows(name)))
                .collect()
        };

        let mut per_shard = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for (name, result) in results {
            match result {
                Ok(rows) => per_shard.push(rows),
                Err(e) => failures.push(self.shard_failed(&name, e)?),
            }
        }
        Ok((per_shard, failures))
    }

    fn shard_failed(&self, name: &str, error: Error) -> Result<Error> {
        warn!(
            operation = %self.session.ctx.operation_id,
            shard = name,
            error = %error,
            "Skipping shard during fan-out read"
        );
        self.session.manager.metrics.record_partial_failure();
        let failure = Error::partial_failure(name, error);
        if self.strict {
            return Err(failure);
        }
        Ok(failure)
    }

    /// Deduplicate in search order, then sort
    fn merge(&self, per_shard: Vec<Vec<Row<T>>>) -> Vec<Row<T>> {
        let mut seen: HashSet<BusinessKey> = HashSet::new();
        let mut rows = Vec::new();
        for shard_rows in per_shard {
            for row in shard_rows {
                if let Some(key) = row.business_key() {
                    if !seen.insert(key.clone()) {
                        continue;
                    }
                }
                rows.push(row);
            }
        }

        match self.order {
            SortOrder::Ascending => rows.sort_by_key(|row| row.timestamp()),
            SortOrder::Descending => rows.sort_by(|a, b| b.timestamp().cmp(&a.timestamp())),
        }
        rows
    }

    fn page(&self, rows: Vec<Row<T>>) -> Vec<Row<T>> {
        let rows = rows.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => rows.take(limit).collect(),
            None => rows.collect(),
        }
    }

    fn finish(&self, shards: usize, start: Instant) {
        self.session
            .manager
            .metrics
            .record_query(shards, start.elapsed());
    }

    /// Matching rows with the shards that had to be skipped
    pub fn list_detailed(&self) -> Result<QueryOutcome<T>> {
        let start = Instant::now();
        let names = self.shards()?;
        let (per_shard, failures) = self.collect(&names)?;
        let rows = self.page(self.merge(per_shard));

        debug!(
            operation = %self.session.ctx.operation_id,
            kind = T::KIND,
            shards = names.len(),
            rows = rows.len(),
            "Executed query"
        );
        self.finish(names.len(), start);
        Ok(QueryOutcome { rows, failures })
    }

    /// Matching rows, deduplicated, sorted and paged
    pub fn list(&self) -> Result<Vec<Row<T>>> {
        Ok(self.list_detailed()?.rows)
    }

    /// Row at position `n` of the sorted result
    pub fn nth(&self, n: usize) -> Result<Option<Row<T>>> {
        let start = Instant::now();
        let names = self.shards()?;
        let (per_shard, _) = self.collect(&names)?;
        self.finish(names.len(), start);
        Ok(self.page(self.merge(per_shard)).into_iter().nth(n))
    }

    /// The single matching row, searching shards in order
    pub fn get(&self) -> Result<Row<T>> {
        let start = Instant::now();
        let names = self.shards()?;

        for name in &names {
            let mut rows = if names.len() == 1 {
                self.shard_rows(name)?
            } else {
                match self.shard_rows(name) {
                    Ok(rows) => rows,
                    Err(e) => {
                        self.shard_failed(name, e)?;
                        continue;
                    }
                }
            };

            match rows.len() {
                0 => continue,
                1 => {
                    self.finish(names.len(), start);
                    return Ok(rows.remove(0));
                }
                n => {
                    return Err(Error::ambiguous(format!(
                        "{} rows of {} matched in shard {}",
                        n,
                        T::KIND,
                        name
                    )))
                }
            }
        }

        self.finish(names.len(), start);
        Err(Error::not_found(format!(
            "No {} matched in shards {:?}",
            T::KIND,
            names
        )))
    }

    /// Number of matching rows summed over shards, without deduplication
    pub fn count(&self) -> Result<u64> {
        let start = Instant::now();
        let names = self.shards()?;
        let (per_shard, _) = self.collect(&names)?;
        self.finish(names.len(), start);
        Ok(per_shard.iter().map(|rows| rows.len() as u64).sum())
    }

    /// Whether any selected shard has a matching row
    pub fn exists(&self) -> Result<bool> {
        Ok(self.count()? > 0)
    }

    /// First row of the current shard, or of the pinned shard when set
    ///
    /// Unlike [`last`](Self::last) this never fans out, even when the
    /// selection leaves the current shard out.
    pub fn first(&self) -> Result<Option<Row<T>>> {
        let start = Instant::now();
        self.check()?;
        let first = match (&self.pinned, T::CLASS) {
            (None, class) if class != EntityClass::Control => self.session.current_shard()?,
            _ => match self.shards()?.into_iter().next() {
                Some(name) => name,
                None => return Ok(None),
            },
        };

        let rows = self.merge(vec![self.shard_rows(&first)?]);
        self.finish(1, start);
        Ok(rows.into_iter().next())
    }

    /// Last row of the merged result across every selected shard
    pub fn last(&self) -> Result<Option<Row<T>>> {
        let start = Instant::now();
        let names = self.shards()?;
        let (per_shard, _) = self.collect(&names)?;
        self.finish(names.len(), start);
        Ok(self.merge(per_shard).pop())
    }
}
