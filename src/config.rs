//! Configuration for rotadb
//!
//! Two layers of configuration exist. [`ShardConfig`] is the persisted rotation
//! policy, stored as a singleton row in the control partition and changed by
//! administrative action. [`ManagerOptions`] are process-local settings chosen
//! when the manager is opened.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{Entity, EntityClass};
use crate::error::{Error, Result};

const MIB: u64 = 1024 * 1024;

/// How calendar boundaries drive rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationMode {
    /// Rotate when the calendar year changes
    Yearly,
    /// Rotate when the calendar month changes
    Monthly,
    /// Only size/record limits or an administrator trigger a rotation
    Manual,
}

impl Default for RotationMode {
    fn default() -> Self {
        Self::Yearly
    }
}

impl std::fmt::Display for RotationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl RotationMode {
    /// Parse a rotation mode from a string
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "yearly" => Ok(Self::Yearly),
            "monthly" => Ok(Self::Monthly),
            "manual" => Ok(Self::Manual),
            _ => Err(Error::validation(format!("Unknown rotation mode: {}", s))),
        }
    }

    /// Get the name of the rotation mode
    pub fn name(&self) -> &'static str {
        match self {
            Self::Yearly => "yearly",
            Self::Monthly => "monthly",
            Self::Manual => "manual",
        }
    }
}

/// Persisted rotation policy (control-partition singleton)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Calendar rotation mode
    pub rotation_mode: RotationMode,
    /// Rotate once the current shard file reaches this size (0 disables)
    pub max_size_bytes: u64,
    /// Rotate once the current shard holds more log rows than this (0 disables)
    pub max_records: u64,
    /// Whether sampled writes may trigger a rotation
    pub auto_rotate: bool,
    /// Most recent log rows copied forward per owner on rotation
    pub keep_tail_count: u32,
    /// When the configuration row was created
    pub created_at: DateTime<Utc>,
    /// When the configuration row was last changed
    pub updated_at: DateTime<Utc>,
}

impl Default for ShardConfig {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            rotation_mode: RotationMode::Yearly,
            max_size_bytes: 500 * MIB,
            max_records: 1_000_000,
            auto_rotate: true,
            keep_tail_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Entity for ShardConfig {
    const KIND: &'static str = "shard_config";
    const CLASS: EntityClass = EntityClass::Control;

    fn timestamp(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl ShardConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the rotation mode
    pub fn with_rotation_mode(mut self, mode: RotationMode) -> Self {
        self.rotation_mode = mode;
        self
    }

    /// Set the size limit in bytes
    pub fn with_max_size_bytes(mut self, bytes: u64) -> Self {
        self.max_size_bytes = bytes;
        self
    }

    /// Set the size limit in megabytes
    pub fn with_max_size_mb(mut self, mb: u64) -> Self {
        self.max_size_bytes = mb * MIB;
        self
    }

    /// Set the record limit
    pub fn with_max_records(mut self, records: u64) -> Self {
        self.max_records = records;
        self
    }

    /// Enable or disable automatic rotation
    pub fn with_auto_rotate(mut self, auto_rotate: bool) -> Self {
        self.auto_rotate = auto_rotate;
        self
    }

    /// Set how many recent log rows per owner survive a rotation
    pub fn with_keep_tail_count(mut self, count: u32) -> Self {
        self.keep_tail_count = count;
        self
    }

    /// Size limit in whole megabytes
    pub fn max_size_mb(&self) -> u64 {
        self.max_size_bytes / MIB
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_size_bytes > 0 && self.max_size_bytes < MIB {
            return Err(Error::validation(
                "Maximum shard size must be 0 (disabled) or at least 1MB",
            ));
        }

        if self.keep_tail_count > 100_000 {
            return Err(Error::validation(
                "Keep-tail count must not exceed 100000 rows per owner",
            ));
        }

        Ok(())
    }

    /// Create a human-readable string representation of the configuration
    pub fn to_string_pretty(&self) -> String {
        let mut result = String::new();

        result.push_str("=== Shard Rotation Policy ===\n\n");
        result.push_str(&format!("  Rotation Mode: {}\n", self.rotation_mode));
        result.push_str(&format!("  Max Size: {} MB\n", self.max_size_mb()));
        result.push_str(&format!("  Max Records: {}\n", self.max_records));
        result.push_str(&format!("  Auto Rotate: {}\n", self.auto_rotate));
        result.push_str(&format!("  Keep Tail Count: {}\n", self.keep_tail_count));

        result
    }
}

/// Process-local options for a [`ShardManager`](crate::ShardManager)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ManagerOptions {
    /// Directory holding the control partition and every shard file
    pub directory: PathBuf,
    /// Check rotation once every this many sharded writes
    pub rotation_check_interval: u64,
    /// Whether to sync each committed frame to disk
    pub sync_writes: bool,
    /// Whether fan-out reads run on the rayon pool
    pub parallel_fanout: bool,
    /// Name of the legacy partition bootstrapped when the registry is empty
    pub legacy_shard_name: String,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("data"),
            rotation_check_interval: 100,
            sync_writes: false,
            parallel_fanout: true,
            legacy_shard_name: "default".to_string(),
        }
    }
}

impl ManagerOptions {
    /// Create options rooted at a storage directory
    pub fn new<P: AsRef<Path>>(directory: P) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Set the rotation sampling interval
    pub fn with_rotation_check_interval(mut self, interval: u64) -> Self {
        self.rotation_check_interval = interval;
        self
    }

    /// Set whether to sync writes to disk immediately
    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    /// Set whether fan-out reads run in parallel
    pub fn with_parallel_fanout(mut self, parallel: bool) -> Self {
        self.parallel_fanout = parallel;
        self
    }

    /// Set the legacy partition name
    pub fn with_legacy_shard_name(mut self, name: impl Into<String>) -> Self {
        self.legacy_shard_name = name.into();
        self
    }

    /// Validate the options
    pub fn validate(&self) -> Result<()> {
        if self.rotation_check_interval < 1 {
            return Err(Error::validation(
                "Rotation check interval must be at least 1",
            ));
        }

        if self.legacy_shard_name.is_empty()
            || self.legacy_shard_name == crate::shard::CONTROL_NAME
            || !crate::shard::util::is_valid_name(&self.legacy_shard_name)
        {
            return Err(Error::validation(format!(
                "Invalid legacy shard name: {:?}",
                self.legacy_shard_name
            )));
        }

        Ok(())
    }

    /// Load options from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let options: Self = serde_json::from_str(&content)?;
        options.validate()?;
        Ok(options)
    }

    /// Save options to a JSON file
    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = ShardConfig::default();

        assert_eq!(config.rotation_mode, RotationMode::Yearly);
        assert_eq!(config.max_size_mb(), 500);
        assert_eq!(config.max_records, 1_000_000);
        assert!(config.auto_rotate);
        assert_eq!(config.keep_tail_count, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder_and_validation() {
        let config = ShardConfig::new()
            .with_rotation_mode(RotationMode::Monthly)
            .with_max_size_mb(64)
            .with_max_records(1000)
            .with_auto_rotate(false)
            .with_keep_tail_count(10);

        assert_eq!(config.rotation_mode, RotationMode::Monthly);
        assert_eq!(config.max_size_bytes, 64 * MIB);
        assert!(config.validate().is_ok());

        let invalid = vec![
            ShardConfig::new().with_max_size_bytes(1000),
            ShardConfig::new().with_keep_tail_count(1_000_000),
        ];
        for config in invalid {
            assert!(config.validate().unwrap_err().is_validation());
        }

        assert!(ShardConfig::new().with_max_size_bytes(0).validate().is_ok());
    }

    #[test]
    fn test_rotation_mode() {
        assert_eq!(RotationMode::from_str("Monthly").unwrap(), RotationMode::Monthly);
        assert_eq!(RotationMode::Manual.to_string(), "manual");
        assert!(RotationMode::from_str("weekly").is_err());

        let json = serde_json::to_string(&RotationMode::Yearly).unwrap();
        assert_eq!(json, "\"yearly\"");
    }

    #[test]
    fn test_options_json_file() -> Result<()> {
        let temp_dir = tempdir()?;
        let path = temp_dir.path().join("options.json");

        let options = ManagerOptions::new(temp_dir.path())
            .with_rotation_check_interval(7)
            .with_parallel_fanout(false);
        options.to_json_file(&path)?;

        let loaded = ManagerOptions::from_json_file(&path)?;
        assert_eq!(loaded.rotation_check_interval, 7);
        assert!(!loaded.parallel_fanout);
        assert_eq!(loaded.directory, temp_dir.path());

        Ok(())
    }

    #[test]
    fn test_options_validation() {
        assert!(ManagerOptions::default().validate().is_ok());
        assert!(ManagerOptions::default().with_rotation_check_interval(0).validate().is_err());
        assert!(ManagerOptions::default().with_legacy_shard_name("control").validate().is_err());
        assert!(ManagerOptions::default().with_legacy_shard_name("../x").validate().is_err());
    }
}
