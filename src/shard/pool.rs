//! Lazily opened shard handles
//!
//! Handles are opened on first use and stay open for the life of the
//! manager. Rotation never closes a handle, so readers holding one keep a
//! consistent view of the shard they started on.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::shard::{ShardRecord, ShardStatus};
use crate::store::{Schema, ShardStore};

/// Cache of open shard stores keyed by shard name
pub struct ShardPool {
    /// Business schema ensured on every opened shard
    schema: Schema,
    sync_writes: bool,
    stores: RwLock<HashMap<String, Arc<ShardStore>>>,
}

impl ShardPool {
    /// Create an empty pool
    pub fn new(schema: Schema, sync_writes: bool) -> Self {
        Self {
            schema,
            sync_writes,
            stores: RwLock::new(HashMap::new()),
        }
    }

    /// Handle for a registered shard, opening it if needed
    pub fn get(&self, record: &ShardRecord) -> Result<Arc<ShardStore>> {
        if record.status == ShardStatus::Corrupted {
            return Err(Error::corruption(format!(
                "Shard {} is marked corrupted",
                record.name
            )));
        }

        if let Some(store) = self.stores.read().get(&record.name) {
            return Ok(Arc::clone(store));
        }

        let mut stores = self.stores.write();
        if let Some(store) = stores.get(&record.name) {
            return Ok(Arc::clone(store));
        }

        let store = ShardStore::open(&record.file_path, record.name.clone(), self.sync_writes)?;
        store.apply_schema(&self.schema)?;
        debug!(shard = %record.name, "Opened shard");

        let store = Arc::new(store);
        stores.insert(record.name.clone(), Arc::clone(&store));
        Ok(store)
    }

    /// Names of shards with an open handle
    pub fn open_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.stores.read().keys().cloned().collect();
        names.sort();
        names
    }
}
