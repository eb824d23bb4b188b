//! Per-operation shard selection
//!
//! Every request or job runs with an [`ExecutionContext`] resolved once at
//! the start: a per-request override wins, then the administrator's global
//! selection, then the current shard alone. The context is an owned value
//! carried by the session, so it cannot leak into later operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{Entity, EntityClass};

/// Request header carrying a comma-separated shard list
pub const SHARD_SELECT_HEADER: &str = "x-shard-select";

/// Parse a comma-separated shard list; `None` when it names nothing
pub fn parse_shard_list(value: &str) -> Option<Vec<String>> {
    let mut names: Vec<String> = Vec::new();
    for name in value.split(',').map(str::trim).filter(|name| !name.is_empty()) {
        if !names.iter().any(|existing| existing == name) {
            names.push(name.to_string());
        }
    }

    if names.is_empty() {
        None
    } else {
        Some(names)
    }
}

/// Administrator-chosen default read scope (control-partition singleton)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalSelection {
    /// Shards read when no override is given; empty means current only
    pub selected_shard_names: Vec<String>,
    /// Opaque presentation hint stored for callers
    pub view_mode: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for GlobalSelection {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            selected_shard_names: Vec::new(),
            view_mode: "single".to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl Entity for GlobalSelection {
    const KIND: &'static str = "global_selection";
    const CLASS: EntityClass = EntityClass::Control;

    fn timestamp(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Where the selection of a context came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionSource {
    Override,
    Global,
    Default,
}

/// Shard selection for one logical operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    /// Correlates log lines of one operation
    pub operation_id: Uuid,
    /// Shards readable by this operation, in selection order
    pub selected: Vec<String>,
    /// Whether reads fan out over `selected`
    pub multi_shard_enabled: bool,
    pub source: SelectionSource,
}

impl ExecutionContext {
    /// Resolve the selection for a new operation
    pub fn resolve(override_names: Option<&[String]>, global: Option<&GlobalSelection>, current: &str) -> Self {
        let (selected, source) = match override_names.filter(|names| !names.is_empty()) {
            Some(names) => (names.to_vec(), SelectionSource::Override),
            None => match global.filter(|global| !global.selected_shard_names.is_empty()) {
                Some(global) => (global.selected_shard_names.clone(), SelectionSource::Global),
                None => (vec![current.to_string()], SelectionSource::Default),
            },
        };

        Self {
            operation_id: Uuid::new_v4(),
            multi_shard_enabled: source != SelectionSource::Default,
            selected,
            source,
        }
    }

    /// Whether a shard is part of the selection
    pub fn includes(&self, name: &str) -> bool {
        self.selected.iter().any(|selected| selected == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn test_parse_shard_list() {
        assert_eq!(parse_shard_list("a, b,,a"), Some(names(&["a", "b"])));
        assert_eq!(parse_shard_list(" , "), None);
        assert_eq!(parse_shard_list(""), None);
    }

    #[test]
    fn test_resolution_precedence() {
        let global = GlobalSelection {
            selected_shard_names: names(&["2023", "2024"]),
            ..GlobalSelection::default()
        };
        let override_names = names(&["2022"]);

        let ctx = ExecutionContext::resolve(Some(override_names.as_slice()), Some(&global), "2024");
        assert_eq!(ctx.selected, override_names);
        assert_eq!(ctx.source, SelectionSource::Override);
        assert!(ctx.multi_shard_enabled);

        let ctx = ExecutionContext::resolve(Some(&[][..]), Some(&global), "2024");
        assert_eq!(ctx.selected, names(&["2023", "2024"]));
        assert_eq!(ctx.source, SelectionSource::Global);
        assert!(ctx.multi_shard_enabled);

        let ctx = ExecutionContext::resolve(None, Some(&GlobalSelection::default()), "2024");
        assert_eq!(ctx.selected, names(&["2024"]));
        assert_eq!(ctx.source, SelectionSource::Default);
        assert!(!ctx.multi_shard_enabled);
        assert!(ctx.includes("2024"));
    }

    #[test]
    fn test_operation_ids_are_unique() {
        let a = ExecutionContext::resolve(None, None, "x");
        let b = ExecutionContext::resolve(None, None, "x");
        assert_ne!(a.operation_id, b.operation_id);
    }
}
