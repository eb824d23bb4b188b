//! Utility functions for shard management
//!
//! Provides helper functions for naming shards and locating their files.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::shard::{PeriodKey, CONTROL_NAME};

/// File extension of shard files
pub const SHARD_EXTENSION: &str = "shard";
/// Extension added while a rotation target is being built
pub const PARTIAL_EXTENSION: &str = "partial";

/// Whether a name is usable as a shard name and file stem
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Name of the shard created for a period
pub fn shard_name(key: &PeriodKey) -> String {
    format!("shard_{}", key)
}

/// Path of the control partition file
pub fn control_path(base_dir: &Path) -> PathBuf {
    base_dir.join(format!("{}.{}", CONTROL_NAME, SHARD_EXTENSION))
}

/// Directory holding shard files
pub fn shards_dir(base_dir: &Path) -> PathBuf {
    base_dir.join("shards")
}

/// Get the path for a shard file
pub fn shard_path(base_dir: &Path, name: &str) -> PathBuf {
    shards_dir(base_dir).join(format!("{}.{}", name, SHARD_EXTENSION))
}

/// Path of the in-progress file for a rotation target
pub fn partial_path(base_dir: &Path, name: &str) -> PathBuf {
    shards_dir(base_dir).join(format!("{}.{}.{}", name, SHARD_EXTENSION, PARTIAL_EXTENSION))
}

/// Create the shards directory if it doesn't exist
pub fn ensure_shards_dir(base_dir: &Path) -> Result<()> {
    fs::create_dir_all(shards_dir(base_dir))?;
    Ok(())
}

/// List complete shard files, sorted by name
pub fn list_shard_files(base_dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let dir = shards_dir(base_dir);
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut result = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let path = entry?.path();
        if !path.is_file() || path.extension().map_or(true, |ext| ext != SHARD_EXTENSION) {
            continue;
        }
        if let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) {
            if is_valid_name(name) && name != CONTROL_NAME {
                result.push((name.to_string(), path.clone()));
            }
        }
    }

    result.sort();
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::tempdir;

    #[test]
    fn test_names_and_paths() {
        assert!(is_valid_name("default"));
        assert!(is_valid_name("shard_2024-05-17"));
        assert!(!is_valid_name("../x"));
        assert!(!is_valid_name("a b"));
        assert!(!is_valid_name(""));

        assert_eq!(shard_name(&PeriodKey::day(2024, 1, 2)), "shard_2024-01-02");

        let base = Path::new("/data/store");
        assert_eq!(shard_path(base, "default"), Path::new("/data/store/shards/default.shard"));
        assert_eq!(
            partial_path(base, "shard_2024"),
            Path::new("/data/store/shards/shard_2024.shard.partial")
        );
        assert_eq!(control_path(base), Path::new("/data/store/control.shard"));
    }

    #[test]
    fn test_list_shard_files() -> Result<()> {
        let temp_dir = tempdir()?;
        assert!(list_shard_files(temp_dir.path())?.is_empty());

        ensure_shards_dir(temp_dir.path())?;
        File::create(shard_path(temp_dir.path(), "shard_2024"))?;
        File::create(shard_path(temp_dir.path(), "default"))?;
        File::create(partial_path(temp_dir.path(), "shard_2025"))?;
        File::create(shards_dir(temp_dir.path()).join("notes.txt"))?;
        File::create(shards_dir(temp_dir.path()).join("bad name.shard"))?;

        let names: Vec<_> = list_shard_files(temp_dir.path())?
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["default", "shard_2024"]);

        Ok(())
    }
}
