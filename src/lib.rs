//! # rotadb
//!
//! Time-partitioned shard manager for append-heavy operational data.
//!
//! Data is split into one file-backed shard per time period. Exactly one shard
//! is current and receives every write; older shards are archived and stay
//! readable. Rotation creates the shard for a new period, copies reference
//! data (and optionally a tail of recent log rows) forward and flips the
//! current pointer atomically.
//!
//! Reads go through a [`Session`], whose execution context selects which
//! shards a query spans: a per-request override, the administrator's global
//! selection, or the current shard alone. Multi-shard results are merged,
//! deduplicated by business key, sorted and paged as if they came from one
//! store.
//!
//! ```no_run
//! use rotadb::{ManagerOptions, ShardManager, telemetry::{self, Device}};
//!
//! # fn main() -> rotadb::Result<()> {
//! let manager = ShardManager::open(ManagerOptions::new("data"), telemetry::catalog()?)?;
//! let session = manager.session(None)?;
//! session.insert(&Device::new("boiler-1", "Boiler"))?;
//! let devices = session.query::<Device>().list()?;
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod config;
pub mod context;
pub mod entity;
pub mod error;
pub mod guard;
pub mod manager;
pub mod metrics;
pub mod query;
pub mod rotation;
pub mod routing;
pub mod shard;
pub mod store;
pub mod telemetry;

pub use admin::{AdminRequest, AdminResponse, AdminService};
pub use config::{ManagerOptions, RotationMode, ShardConfig};
pub use context::{ExecutionContext, GlobalSelection, SelectionSource, SHARD_SELECT_HEADER};
pub use entity::{
    BusinessKey, Catalog, CatalogBuilder, Entity, EntityClass, KeyPart, KeyPath, Link, Relation, Row, RowId,
};
pub use error::{Error, Result};
pub use manager::{InitReport, Session, ShardManager};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use query::{QueryOutcome, QuerySet, SortOrder};
pub use rotation::{CopyStats, RotationDecision, RotationOutcome, RotationReason};
pub use shard::{PeriodKey, ShardRecord, ShardStat, ShardStatus};
