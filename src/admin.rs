//! Administrative control surface
//!
//! Transport-agnostic request/response handling for the administrative
//! operations: policy and selection management, manual rotation, rotation
//! checks, statistics and initialization. Requests and responses are plain
//! serde types; [`AdminService::handle_json`] serves them as JSON text.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{RotationMode, ShardConfig};
use crate::context::GlobalSelection;
use crate::error::{Error, Result};
use crate::manager::ShardManager;
use crate::rotation::{CopyStats, RotationReason};
use crate::shard::ShardStat;

const MIB: u64 = 1024 * 1024;

/// Rotation policy as presented to administrators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigView {
    pub rotation_mode: RotationMode,
    pub max_size_mb: u64,
    pub max_records: u64,
    pub auto_rotate: bool,
    pub keep_tail_count: u32,
}

impl From<&ShardConfig> for ConfigView {
    fn from(config: &ShardConfig) -> Self {
        Self {
            rotation_mode: config.rotation_mode,
            max_size_mb: config.max_size_mb(),
            max_records: config.max_records,
            auto_rotate: config.auto_rotate,
            keep_tail_count: config.keep_tail_count,
        }
    }
}

/// Partial policy change; absent fields keep their value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigUpdate {
    pub rotation_mode: Option<String>,
    pub max_size_mb: Option<i64>,
    pub max_records: Option<i64>,
    pub auto_rotate: Option<bool>,
    pub keep_tail_count: Option<i64>,
}

fn non_negative(field: &str, value: i64) -> Result<u64> {
    if value < 0 {
        return Err(Error::validation(format!("{} must not be negative", field)));
    }
    Ok(value as u64)
}

impl ConfigUpdate {
    /// Apply the change on top of `config`
    pub fn apply(&self, config: ShardConfig) -> Result<ShardConfig> {
        let mut config = config;

        if let Some(mode) = &self.rotation_mode {
            config.rotation_mode = RotationMode::from_str(mode)?;
        }
        if let Some(mb) = self.max_size_mb {
            config.max_size_bytes = non_negative("max_size_mb", mb)?
                .checked_mul(MIB)
                .ok_or_else(|| Error::validation("max_size_mb is too large"))?;
        }
        if let Some(records) = self.max_records {
            config.max_records = non_negative("max_records", records)?;
        }
        if let Some(auto_rotate) = self.auto_rotate {
            config.auto_rotate = auto_rotate;
        }
        if let Some(count) = self.keep_tail_count {
            let count = non_negative("keep_tail_count", count)?;
            config.keep_tail_count = u32::try_from(count)
                .map_err(|_| Error::validation("keep_tail_count is too large"))?;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Global read scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionView {
    pub selected_shard_names: Vec<String>,
    pub view_mode: String,
}

impl From<GlobalSelection> for SelectionView {
    fn from(selection: GlobalSelection) -> Self {
        Self {
            selected_shard_names: selection.selected_shard_names,
            view_mode: selection.view_mode,
        }
    }
}

/// Replacement global read scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionUpdate {
    pub selected_shard_names: Vec<String>,
    #[serde(default)]
    pub view_mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotateResponse {
    /// Name of the new current shard
    pub shard: String,
    pub previous: Option<String>,
    pub copied: CopyStats,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRotationResponse {
    pub needs_rotation: bool,
    pub reason: Option<RotationReason>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeResponse {
    pub current: String,
    /// Shard files registered by this call
    pub discovered: Vec<String>,
}

/// Structured error returned to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl From<&Error> for ErrorResponse {
    fn from(error: &Error) -> Self {
        Self {
            kind: error.kind().to_string(),
            message: error.to_string(),
            suggestion: error.suggestion(),
        }
    }
}

/// Administrative operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum AdminRequest {
    GetConfig,
    PutConfig(ConfigUpdate),
    GetSelection,
    PutSelection(SelectionUpdate),
    Rotate,
    CheckRotation,
    Stats,
    Initialize,
}

impl AdminRequest {
    /// Operation name as it appears on the wire
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetConfig => "get-config",
            Self::PutConfig(_) => "put-config",
            Self::GetSelection => "get-selection",
            Self::PutSelection(_) => "put-selection",
            Self::Rotate => "rotate",
            Self::CheckRotation => "check-rotation",
            Self::Stats => "stats",
            Self::Initialize => "initialize",
        }
    }
}

/// Reply to an [`AdminRequest`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AdminResponse {
    Config(ConfigView),
    Selection(SelectionView),
    Rotated(RotateResponse),
    CheckRotation(CheckRotationResponse),
    Stats(Vec<ShardStat>),
    Initialized(InitializeResponse),
    Error(ErrorResponse),
}

impl AdminResponse {
    /// Whether the request failed
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// Administrative operations over a manager
#[derive(Debug, Clone, Copy)]
pub struct AdminService<'m> {
    manager: &'m ShardManager,
}

impl<'m> AdminService<'m> {
    pub fn new(manager: &'m ShardManager) -> Self {
        Self { manager }
    }

    /// Current rotation policy
    pub fn get_config(&self) -> Result<ConfigView> {
        Ok(ConfigView::from(&self.manager.config()?))
    }

    /// Change the rotation policy
    pub fn put_config(&self, update: &ConfigUpdate) -> Result<ConfigView> {
        let config = update.apply(self.manager.config()?)?;
        Ok(ConfigView::from(&self.manager.set_config(config)?))
    }

    /// Current global selection
    pub fn get_selection(&self) -> Result<SelectionView> {
        Ok(self.manager.selection()?.into())
    }

    /// Replace the global selection
    pub fn put_selection(&self, update: SelectionUpdate) -> Result<SelectionView> {
        Ok(self
            .manager
            .set_selection(update.selected_shard_names, update.view_mode)?
            .into())
    }

    /// Rotate now, regardless of the policy
    pub fn rotate(&self) -> Result<RotateResponse> {
        let outcome = self.manager.create_new_shard(&Utc::now())?;
        Ok(RotateResponse {
            shard: outcome.shard.name,
            previous: outcome.previous,
            copied: outcome.copied,
            duration_ms: outcome.duration_ms,
        })
    }

    /// Evaluate the policy without rotating
    pub fn check_rotation(&self) -> Result<CheckRotationResponse> {
        let decision = self.manager.check_rotation_needed(&Utc::now())?;
        Ok(CheckRotationResponse {
            needs_rotation: decision.needs_rotation,
            reason: decision.reason,
        })
    }

    /// Refreshed statistics for every shard
    pub fn stats(&self) -> Result<Vec<ShardStat>> {
        self.manager.stats()
    }

    /// Idempotent bootstrap
    pub fn initialize(&self) -> Result<InitializeResponse> {
        let report = self.manager.initialize()?;
        Ok(InitializeResponse {
            current: report.current,
            discovered: report.discovered,
        })
    }

    fn dispatch(&self, request: AdminRequest) -> Result<AdminResponse> {
        Ok(match request {
            AdminRequest::GetConfig => AdminResponse::Config(self.get_config()?),
            AdminRequest::PutConfig(update) => AdminResponse::Config(self.put_config(&update)?),
            AdminRequest::GetSelection => AdminResponse::Selection(self.get_selection()?),
            AdminRequest::PutSelection(update) => AdminResponse::Selection(self.put_selection(update)?),
            AdminRequest::Rotate => AdminResponse::Rotated(self.rotate()?),
            AdminRequest::CheckRotation => AdminResponse::CheckRotation(self.check_rotation()?),
            AdminRequest::Stats => AdminResponse::Stats(self.stats()?),
            AdminRequest::Initialize => AdminResponse::Initialized(self.initialize()?),
        })
    }

    /// Serve one request, turning failures into structured errors
    pub fn handle(&self, request: AdminRequest) -> AdminResponse {
        let op = request.name();
        debug!(op, "Handling administrative request");

        match self.dispatch(request) {
            Ok(response) => response,
            Err(e) => {
                warn!(op, kind = e.kind(), error = %e, "Administrative request failed");
                AdminResponse::Error(ErrorResponse::from(&e))
            }
        }
    }

    /// Serve one JSON-encoded request
    pub fn handle_json(&self, body: &str) -> String {
        let response = match serde_json::from_str::<AdminRequest>(body) {
            Ok(request) => self.handle(request),
            Err(e) => AdminResponse::Error(ErrorResponse::from(&Error::validation(format!(
                "Malformed request: {}",
                e
            )))),
        };

        serde_json::to_string(&response).unwrap_or_else(|e| {
            format!(
                "{{\"kind\":\"serialization\",\"message\":{:?}}}",
                e.to_string()
            )
        })
    }
}
