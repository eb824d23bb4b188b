//! Placement of reads and writes
//!
//! Control-plane kinds always resolve to the control partition. Sharded
//! writes go to the current shard; sharded reads go to the shards selected by
//! the execution context, current shard first.

use crate::context::ExecutionContext;
use crate::entity::{Entity, EntityClass};
use crate::shard::CONTROL_NAME;

/// Target of a write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteRoute {
    Control,
    Shard(String),
}

/// Targets of a read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadRoute {
    Control,
    Single(String),
    /// Shards in search order
    FanOut(Vec<String>),
}

impl ReadRoute {
    /// Shard names in search order
    pub fn shards(&self) -> Vec<String> {
        match self {
            ReadRoute::Control => vec![CONTROL_NAME.to_string()],
            ReadRoute::Single(name) => vec![name.clone()],
            ReadRoute::FanOut(names) => names.clone(),
        }
    }
}

/// Where a write of `T` goes
pub fn write_route<T: Entity>(current: &str) -> WriteRoute {
    match T::CLASS {
        EntityClass::Control => WriteRoute::Control,
        _ => WriteRoute::Shard(current.to_string()),
    }
}

/// Where a read of `T` goes
///
/// A pinned shard takes precedence over the context. In multi-shard mode
/// the current shard is searched first when selected, then the rest in
/// selection order.
pub fn read_route<T: Entity>(ctx: &ExecutionContext, current: &str, pinned: Option<&str>) -> ReadRoute {
    if T::CLASS == EntityClass::Control {
        return ReadRoute::Control;
    }

    if let Some(name) = pinned {
        return ReadRoute::Single(name.to_string());
    }

    if !ctx.multi_shard_enabled {
        return ReadRoute::Single(current.to_string());
    }

    let mut order = Vec::with_capacity(ctx.selected.len());
    if ctx.includes(current) {
        order.push(current.to_string());
    }
    order.extend(ctx.selected.iter().filter(|name| *name != current).cloned());

    match order.len() {
        1 => ReadRoute::Single(order.remove(0)),
        _ => ReadRoute::FanOut(order),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShardConfig;
    use crate::context::GlobalSelection;
    use crate::telemetry::{Device, SensorLog};

    fn ctx(selected: &[&str]) -> ExecutionContext {
        let names: Vec<String> = selected.iter().map(|s| s.to_string()).collect();
        ExecutionContext::resolve(Some(names.as_slice()), None, "cur")
    }

    #[test]
    fn test_write_routes() {
        assert_eq!(write_route::<ShardConfig>("cur"), WriteRoute::Control);
        assert_eq!(write_route::<GlobalSelection>("cur"), WriteRoute::Control);
        assert_eq!(write_route::<SensorLog>("cur"), WriteRoute::Shard("cur".to_string()));
    }

    #[test]
    fn test_read_routes() {
        let multi = ctx(&["old", "cur", "older"]);
        assert_eq!(read_route::<ShardConfig>(&multi, "cur", None), ReadRoute::Control);
        assert_eq!(
            read_route::<Device>(&multi, "cur", None),
            ReadRoute::FanOut(vec!["cur".into(), "old".into(), "older".into()])
        );
        assert_eq!(
            read_route::<Device>(&multi, "cur", Some("old")),
            ReadRoute::Single("old".into())
        );

        let without_current = ctx(&["old", "older"]);
        assert_eq!(
            read_route::<Device>(&without_current, "cur", None).shards(),
            vec!["old".to_string(), "older".to_string()]
        );

        let single = ExecutionContext::resolve(None, None, "cur");
        assert_eq!(read_route::<Device>(&single, "cur", None), ReadRoute::Single("cur".into()));
        assert_eq!(
            read_route::<Device>(&ctx(&["old"]), "cur", None),
            ReadRoute::Single("old".into())
        );
    }
}
