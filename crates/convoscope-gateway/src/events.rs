//! Device button events: validated, then appended to a per-user log on press.

use convoscope_core::{PipelineError, PipelineResult};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ButtonEventRequest {
    #[serde(default)]
    pub button_num: Option<Value>,
    #[serde(default)]
    pub button_activity: Option<Value>,
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default, rename = "userId")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ButtonEvent {
    pub button_num: Value,
    /// True on push down, false on release.
    pub pressed: bool,
    pub timestamp: Value,
    pub user_id: String,
}

/// `null` and `""` count as missing; `false` and `0` do not.
fn present(v: Option<Value>) -> Option<Value> {
    match v {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.is_empty() => None,
        other => other,
    }
}

fn is_pressed(activity: &Value) -> bool {
    match activity {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "down"),
        _ => false,
    }
}

impl ButtonEventRequest {
    /// Fields are checked in the order `button_num`, `button_activity`, `timestamp`, `userId`.
    pub fn validate(self) -> PipelineResult<ButtonEvent> {
        let button_num =
            present(self.button_num).ok_or_else(|| PipelineError::missing_field("button_num"))?;
        let activity = present(self.button_activity)
            .ok_or_else(|| PipelineError::missing_field("button_activity"))?;
        let timestamp =
            present(self.timestamp).ok_or_else(|| PipelineError::missing_field("timestamp"))?;
        let user_id = self
            .user_id
            .filter(|u| !u.is_empty())
            .ok_or_else(|| PipelineError::missing_field("userId"))?;
        // The user id becomes part of a file name.
        if user_id.contains(['/', '\\']) || user_id.contains("..") {
            return Err(PipelineError::Validation("invalid userId".to_string()));
        }
        Ok(ButtonEvent {
            button_num,
            pressed: is_pressed(&activity),
            timestamp,
            user_id,
        })
    }
}

pub fn event_log_path(dir: &Path, user_id: &str) -> PathBuf {
    dir.join(format!("{}_events.log", user_id))
}

/// Append one `{"text":"BUTTON_DOWN","timestamp":..}` line to the user's event log.
pub async fn append_button_down(dir: &Path, event: &ButtonEvent) -> PipelineResult<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = event_log_path(dir, &event.user_id);
    let mut line = serde_json::to_string(&serde_json::json!({
        "text": "BUTTON_DOWN",
        "timestamp": event.timestamp,
    }))?;
    line.push('\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(path)
}
