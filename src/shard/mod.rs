//! Time-partitioned shard management
//!
//! Business data is split into shards, one file per calendar period. This
//! module holds the registry of shards, their period keys and the pool of
//! open shard handles.

mod info;
mod period;
mod pool;
mod registry;
pub mod util;

pub use info::{ShardRecord, ShardStat, ShardStatus};
pub use period::PeriodKey;
pub use pool::ShardPool;
pub use registry::ShardRegistry;

use crate::config::ShardConfig;
use crate::context::GlobalSelection;
use crate::store::{Schema, TableDef};

/// Name of the control partition
pub const CONTROL_NAME: &str = "control";

/// Tables of the control partition
pub fn control_schema() -> Schema {
    Schema::new(vec![
        TableDef::of::<ShardRecord>(),
        TableDef::of::<ShardConfig>(),
        TableDef::of::<GlobalSelection>(),
    ])
}
