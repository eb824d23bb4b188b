//! Shard registry records and statistics
//!
//! Provides the control-plane row describing one physical partition and the
//! statistics view reported to administrators.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{Entity, EntityClass, KeyPart, KeyPath};
use crate::shard::PeriodKey;

/// Lifecycle state of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardStatus {
    /// Open for reads; the current shard also takes writes
    Active,
    /// Read-only history
    Archived,
    /// The file failed verification and is never opened
    Corrupted,
}

impl fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardStatus::Active => write!(f, "active"),
            ShardStatus::Archived => write!(f, "archived"),
            ShardStatus::Corrupted => write!(f, "corrupted"),
        }
    }
}

/// Registry entry for one physical partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRecord {
    /// Unique logical name
    pub name: String,
    /// Location of the shard file
    pub file_path: PathBuf,
    /// Calendar period the shard was created in
    pub period_key: PeriodKey,
    /// Lifecycle state
    pub status: ShardStatus,
    /// Whether sharded writes go here
    pub is_current: bool,
    /// Last observed file size
    pub size_bytes: u64,
    /// Last observed log row count
    pub record_count: u64,
    /// When the record was registered
    pub created_at: DateTime<Utc>,
    /// When the record last changed
    pub updated_at: DateTime<Utc>,
}

impl Entity for ShardRecord {
    const KIND: &'static str = "shard_record";
    const CLASS: EntityClass = EntityClass::Control;
    const BUSINESS_KEY: &'static [KeyPath] = &[KeyPath::Field("name")];

    fn key_field(&self, field: &str) -> Option<KeyPart> {
        match field {
            "name" => Some(self.name.as_str().into()),
            _ => None,
        }
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl ShardRecord {
    /// Create a new, archived, non-current record
    pub fn new(name: impl Into<String>, file_path: PathBuf, period_key: PeriodKey) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            file_path,
            period_key,
            status: ShardStatus::Archived,
            is_current: false,
            size_bytes: 0,
            record_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the lifecycle state
    pub fn with_status(mut self, status: ShardStatus) -> Self {
        self.status = status;
        self
    }

    /// Whether the shard can be opened
    pub fn is_readable(&self) -> bool {
        self.status != ShardStatus::Corrupted
    }

    /// Snapshot for reporting
    pub fn stat(&self) -> ShardStat {
        ShardStat {
            name: self.name.clone(),
            period_key: self.period_key.to_string(),
            status: self.status,
            is_current: self.is_current,
            size_bytes: self.size_bytes,
            record_count: self.record_count,
        }
    }
}

/// Statistics row reported per shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardStat {
    pub name: String,
    pub period_key: String,
    pub status: ShardStatus,
    pub is_current: bool,
    pub size_bytes: u64,
    pub record_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_defaults_and_stat() {
        let record = ShardRecord::new("shard_2024-05-17", PathBuf::from("shards/x.shard"), PeriodKey::day(2024, 5, 17));
        assert_eq!(record.status, ShardStatus::Archived);
        assert!(!record.is_current);
        assert!(record.is_readable());
        assert_eq!(record.key_field("name"), Some(KeyPart::from("shard_2024-05-17")));

        let stat = record.clone().with_status(ShardStatus::Corrupted).stat();
        assert_eq!(stat.period_key, "2024-05-17");
        assert_eq!(stat.status, ShardStatus::Corrupted);

        let json = serde_json::to_value(&stat).unwrap();
        assert_eq!(json["status"], "corrupted");
    }
}
