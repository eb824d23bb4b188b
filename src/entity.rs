//! Entity model shared by every partition
//!
//! Each storable type implements [`Entity`] and declares, at definition time,
//! whether it is control-plane or sharded, which fields form its business key
//! and which relations it holds. The query engine and the rotation copy step
//! are parameterized by these declarations; nothing is discovered at runtime.

use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::rotation::{self, CopyStats};
use crate::store::{Schema, ShardStore, TableDef};

/// Shard-local row identifier
pub type RowId = u64;

/// Where an entity type lives and how rotation treats it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityClass {
    /// Always resolves to the fixed control partition
    Control,
    /// Master data referenced by logs; copied forward on rotation
    Reference,
    /// High-volume rows; only a bounded tail is copied forward
    Log,
}

/// One element of a business key declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPath {
    /// A field of the entity itself, read through [`Entity::key_field`]
    Field(&'static str),
    /// The business key of the row a relation points at (one hop)
    Related(&'static str),
}

/// A declared foreign reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relation {
    /// Relation name, as accepted by [`Entity::link`]
    pub name: &'static str,
    /// `KIND` of the referenced entity type
    pub target: &'static str,
}

/// A single business key component
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyPart {
    Text(String),
    Int(i64),
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for KeyPart {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Int(value) => write!(f, "{}", value),
        }
    }
}

/// Natural key identifying the same logical row across shards
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BusinessKey(Vec<KeyPart>);

impl BusinessKey {
    /// Create a business key from its parts
    pub fn new(parts: Vec<KeyPart>) -> Self {
        Self(parts)
    }

    /// Key components in declaration order
    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }
}

impl fmt::Display for BusinessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{}", part)?;
        }
        Ok(())
    }
}

/// A reference to a row in the same shard
///
/// Only the row id is persisted. Links handed out by a read carry the shard
/// they were read from, and links created for a write come from
/// [`Session::link`](crate::Session::link), which refuses rows that are not in
/// the current shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    id: RowId,
    #[serde(skip)]
    origin: Option<String>,
}

impl Link {
    pub(crate) fn new(id: RowId) -> Self {
        Self { id, origin: None }
    }

    pub(crate) fn from_shard(id: RowId, shard: impl Into<String>) -> Self {
        Self {
            id,
            origin: Some(shard.into()),
        }
    }

    /// Shard-local id of the referenced row
    pub fn id(&self) -> RowId {
        self.id
    }

    /// Shard this link was resolved against, if known
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }
}

impl PartialEq for Link {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Link {}

/// A storable type
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Table name, unique within a catalog
    const KIND: &'static str;
    /// Placement and rotation behavior
    const CLASS: EntityClass;
    /// Ordered natural key; empty means rows are never deduplicated
    const BUSINESS_KEY: &'static [KeyPath] = &[];
    /// Foreign references held by this type
    const RELATIONS: &'static [Relation] = &[];
    /// Relation naming the logical owner of a log row
    const OWNER: Option<&'static str> = None;

    /// Value of a [`KeyPath::Field`] component
    fn key_field(&self, _field: &str) -> Option<KeyPart> {
        None
    }

    /// Current value of a relation
    fn link(&self, _relation: &str) -> Option<&Link> {
        None
    }

    /// Replace the value of a relation
    fn relink(&mut self, _relation: &str, _link: Link) {}

    /// Default ordering field for aggregated reads
    fn timestamp(&self) -> DateTime<Utc>;
}

/// Look up a declared relation by name
pub(crate) fn relation_of<T: Entity>(name: &str) -> Option<&'static Relation> {
    T::RELATIONS.iter().find(|relation| relation.name == name)
}

/// Tag every link of a freshly read value with the shard it came from
pub(crate) fn stamp_links<T: Entity>(value: &mut T, shard: &str) {
    for relation in T::RELATIONS {
        let id = match value.link(relation.name) {
            Some(link) => link.id(),
            None => continue,
        };
        value.relink(relation.name, Link::from_shard(id, shard));
    }
}

/// A row fetched from a shard, tagged with where it came from
#[derive(Debug, Clone)]
pub struct Row<T> {
    id: RowId,
    shard: String,
    key: Option<BusinessKey>,
    data: T,
}

impl<T> Row<T> {
    pub(crate) fn new(id: RowId, shard: impl Into<String>, key: Option<BusinessKey>, data: T) -> Self {
        Self {
            id,
            shard: shard.into(),
            key,
            data,
        }
    }

    /// Shard-local id, meaningless outside [`Row::shard`]
    pub fn id(&self) -> RowId {
        self.id
    }

    /// Name of the shard this row was read from
    pub fn shard(&self) -> &str {
        &self.shard
    }

    /// Business key stored with the row
    pub fn business_key(&self) -> Option<&BusinessKey> {
        self.key.as_ref()
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut T {
        &mut self.data
    }

    pub fn into_data(self) -> T {
        self.data
    }
}

impl<T> Deref for Row<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T> DerefMut for Row<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

/// Type-erased operations the catalog needs per registered entity type
pub(crate) trait EntityOps: Send + Sync {
    fn kind(&self) -> &'static str;
    fn class(&self) -> EntityClass;
    fn table(&self) -> TableDef;
    fn copy_forward(&self, source: &ShardStore, target: &ShardStore, keep_tail: usize) -> Result<CopyStats>;
}

struct EntityHandle<T>(PhantomData<fn() -> T>);

impl<T: Entity> EntityOps for EntityHandle<T> {
    fn kind(&self) -> &'static str {
        T::KIND
    }

    fn class(&self) -> EntityClass {
        T::CLASS
    }

    fn table(&self) -> TableDef {
        TableDef::of::<T>()
    }

    fn copy_forward(&self, source: &ShardStore, target: &ShardStore, keep_tail: usize) -> Result<CopyStats> {
        match T::CLASS {
            EntityClass::Reference => rotation::copy_reference_rows::<T>(source, target),
            EntityClass::Log => rotation::copy_log_tail::<T>(source, target, keep_tail),
            EntityClass::Control => Ok(CopyStats::default()),
        }
    }
}

/// Static registry of the sharded business entity types
#[derive(Clone)]
pub struct Catalog {
    entries: Vec<Arc<dyn EntityOps>>,
}

impl fmt::Debug for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Catalog").field("kinds", &self.kinds()).finish()
    }
}

impl Catalog {
    /// Start building a catalog
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder {
            entries: Vec::new(),
            error: None,
        }
    }

    /// Registered kinds in registration order
    pub fn kinds(&self) -> Vec<&'static str> {
        self.entries.iter().map(|entry| entry.kind()).collect()
    }

    /// Kinds whose rows count towards a shard's record total
    pub fn log_kinds(&self) -> Vec<&'static str> {
        let logs: Vec<_> = self
            .entries
            .iter()
            .filter(|entry| entry.class() == EntityClass::Log)
            .map(|entry| entry.kind())
            .collect();

        if logs.is_empty() {
            self.kinds()
        } else {
            logs
        }
    }

    /// Check whether a kind is registered
    pub fn contains(&self, kind: &str) -> bool {
        self.entries.iter().any(|entry| entry.kind() == kind)
    }

    /// Business schema applied to every new shard
    pub fn schema(&self) -> Schema {
        Schema::new(self.entries.iter().map(|entry| entry.table()).collect())
    }

    /// Entries in copy order: reference data first, then logs
    pub(crate) fn copy_plan(&self) -> Vec<Arc<dyn EntityOps>> {
        let mut plan: Vec<_> = self
            .entries
            .iter()
            .filter(|entry| entry.class() == EntityClass::Reference)
            .cloned()
            .collect();
        plan.extend(
            self.entries
                .iter()
                .filter(|entry| entry.class() == EntityClass::Log)
                .cloned(),
        );
        plan
    }
}

/// Builder for [`Catalog`]
pub struct CatalogBuilder {
    entries: Vec<Arc<dyn EntityOps>>,
    error: Option<Error>,
}

impl CatalogBuilder {
    /// Register a sharded entity type
    ///
    /// Relation targets must already be registered so copy-forward can
    /// resolve them.
    pub fn register<T: Entity>(mut self) -> Self {
        if self.error.is_none() {
            if let Err(e) = self.check::<T>() {
                self.error = Some(e);
            } else {
                self.entries.push(Arc::new(EntityHandle::<T>(PhantomData)));
            }
        }
        self
    }

    fn check<T: Entity>(&self) -> Result<()> {
        if T::CLASS == EntityClass::Control {
            return Err(Error::validation(format!(
                "{} is a control-plane entity and cannot be sharded",
                T::KIND
            )));
        }

        let known: HashSet<&str> = self.entries.iter().map(|entry| entry.kind()).collect();
        if known.contains(T::KIND) {
            return Err(Error::validation(format!("Entity kind registered twice: {}", T::KIND)));
        }

        for relation in T::RELATIONS {
            if !known.contains(relation.target) {
                return Err(Error::validation(format!(
                    "{}.{} points at unregistered kind {}",
                    T::KIND,
                    relation.name,
                    relation.target
                )));
            }
        }

        if T::CLASS == EntityClass::Reference && T::BUSINESS_KEY.is_empty() {
            return Err(Error::validation(format!(
                "{} is reference data and needs a business key",
                T::KIND
            )));
        }

        for path in T::BUSINESS_KEY {
            if let KeyPath::Related(name) = path {
                if relation_of::<T>(name).is_none() {
                    return Err(Error::validation(format!(
                        "{} business key uses undeclared relation {}",
                        T::KIND,
                        name
                    )));
                }
            }
        }

        if let Some(owner) = T::OWNER {
            if relation_of::<T>(owner).is_none() {
                return Err(Error::validation(format!(
                    "{} owner {} is not a declared relation",
                    T::KIND,
                    owner
                )));
            }
        }

        Ok(())
    }

    /// Finish the catalog
    pub fn build(self) -> Result<Catalog> {
        if let Some(e) = self.error {
            return Err(e);
        }
        Ok(Catalog {
            entries: self.entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{self, Device, Sensor, SensorLog};

    #[test]
    fn test_business_key_display() {
        let key = BusinessKey::new(vec!["dev-1".into(), "temp".into(), KeyPart::Int(3)]);
        assert_eq!(key.to_string(), "dev-1/temp/3");
        assert_eq!(key.parts().len(), 3);
    }

    #[test]
    fn test_link_equality_ignores_origin() {
        let a = Link::from_shard(4, "default");
        let b = Link::new(4);
        assert_eq!(a, b);
        assert_eq!(a.origin(), Some("default"));
        assert_eq!(b.origin(), None);

        let bytes = bincode::serialize(&a).unwrap();
        let decoded: Link = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded.id(), 4);
        assert_eq!(decoded.origin(), None);
    }

    #[test]
    fn test_catalog_order_and_schema() -> Result<()> {
        let catalog = telemetry::catalog()?;
        assert_eq!(catalog.kinds(), vec!["device", "sensor", "sensor_log"]);
        assert_eq!(catalog.log_kinds(), vec!["sensor_log"]);

        let schema = catalog.schema();
        let device = schema.table("device").unwrap();
        assert!(device.unique);
        let logs = schema.table("sensor_log").unwrap();
        assert!(!logs.unique);

        let plan: Vec<_> = catalog.copy_plan().iter().map(|e| e.kind()).collect();
        assert_eq!(plan, vec!["device", "sensor", "sensor_log"]);
        Ok(())
    }

    #[test]
    fn test_catalog_rejects_bad_registrations() {
        let err = Catalog::builder().register::<Sensor>().build().unwrap_err();
        assert!(err.is_validation());

        let err = Catalog::builder()
            .register::<Device>()
            .register::<Device>()
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("twice"));

        let err = Catalog::builder()
            .register::<crate::ShardConfig>()
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("control-plane"));

        assert!(Catalog::builder()
            .register::<Device>()
            .register::<Sensor>()
            .register::<SensorLog>()
            .build()
            .is_ok());
    }
}
