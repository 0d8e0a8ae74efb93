//! Pull-based result delivery: devices re-poll on their own cadence; nothing is pushed.

use crate::error::{PipelineError, PipelineResult};
use crate::store::ResultStore;
use crate::types::StoredResult;
use serde::{Deserialize, Serialize};

/// Capability tag a poll must carry to receive extraction results.
pub const CONTEXTUAL_SEARCH_FEATURE: &str = "contextual_search_engine";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    /// A list of capability tags (a single string is also accepted).
    #[serde(default)]
    pub features: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Vec<StoredResult>>,
}

impl PollResponse {
    pub fn empty() -> Self {
        Self {
            success: false,
            result: None,
        }
    }
}

fn has_feature(features: &serde_json::Value, tag: &str) -> bool {
    match features {
        serde_json::Value::Array(items) => items.iter().any(|v| v.as_str() == Some(tag)),
        serde_json::Value::String(s) => s.split(',').any(|t| t.trim() == tag),
        _ => false,
    }
}

fn features_missing(features: Option<&serde_json::Value>) -> bool {
    match features {
        None | Some(serde_json::Value::Null) => true,
        Some(serde_json::Value::String(s)) => s.is_empty(),
        Some(serde_json::Value::Array(a)) => a.is_empty(),
        _ => false,
    }
}

/// Validate the poll and return what the store has for this (user, device).
/// `success` is true only for a non-empty result set.
pub fn poll(store: &dyn ResultStore, req: &PollRequest) -> PipelineResult<PollResponse> {
    let user_id = req
        .user_id
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PipelineError::missing_field("userId"))?;
    let device_id = req
        .device_id
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PipelineError::missing_field("deviceId"))?;
    if features_missing(req.features.as_ref()) {
        return Err(PipelineError::missing_field("features"));
    }
    let features = req.features.as_ref().unwrap_or(&serde_json::Value::Null);
    if !has_feature(features, CONTEXTUAL_SEARCH_FEATURE) {
        return Err(PipelineError::Validation(format!(
            "{} not in features",
            CONTEXTUAL_SEARCH_FEATURE
        )));
    }

    let results = store.results_for_device(user_id, device_id)?;
    if results.is_empty() {
        return Ok(PollResponse::empty());
    }
    tracing::debug!(user_id, device_id, count = results.len(), "delivering results");
    Ok(PollResponse {
        success: true,
        result: Some(results),
    })
}
