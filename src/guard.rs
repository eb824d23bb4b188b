//! Write-safety checks
//!
//! Local row ids only mean something inside the shard that issued them. A
//! row read from an archived shard, or a link taken from one, must never be
//! written into the current shard.

use crate::entity::{Entity, Row};
use crate::error::{Error, Result};

/// Refuse to write back a row that was read from another shard
pub fn check_row<T>(current: &str, row: &Row<T>) -> Result<()> {
    if row.shard() != current {
        return Err(Error::write_safety(row.shard(), current));
    }
    Ok(())
}

/// Refuse links resolved against another shard
///
/// Links without an origin were never handed out by a read or by
/// [`Session::link`](crate::Session::link) and are refused too.
pub fn check_links<T: Entity>(current: &str, value: &T) -> Result<()> {
    for relation in T::RELATIONS {
        if let Some(link) = value.link(relation.name) {
            match link.origin() {
                Some(origin) if origin == current => {}
                Some(origin) => return Err(Error::write_safety(origin, current)),
                None => return Err(Error::write_safety("<unknown>", current)),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Link;
    use crate::telemetry::{Device, Sensor};

    #[test]
    fn test_check_row() {
        let row = Row::new(1, "old", None, Device::new("dev-1", "x"));
        assert!(check_row("old", &row).is_ok());
        assert!(check_row("cur", &row).unwrap_err().is_write_safety_violation());
    }

    #[test]
    fn test_check_links() {
        let ok = Sensor::new(Link::from_shard(1, "cur"), "temp");
        assert!(check_links("cur", &ok).is_ok());

        let foreign = Sensor::new(Link::from_shard(1, "old"), "temp");
        let err = check_links("cur", &foreign).unwrap_err();
        assert!(err.to_string().contains("'old'"));

        let unresolved = Sensor::new(Link::new(1), "temp");
        assert!(check_links("cur", &unresolved).unwrap_err().is_write_safety_violation());

        assert!(check_links("cur", &Device::new("dev-1", "x")).is_ok());
    }
}
