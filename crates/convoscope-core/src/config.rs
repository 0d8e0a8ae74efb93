//! Pipeline configuration loaded from `config/convoscope.toml` and `CONVOSCOPE__*` env.
//!
//! | Key | Default | Description |
//! |-----|---------|-------------|
//! | port | 8080 | HTTP port for the gateway. |
//! | bind_address | 0.0.0.0 | Listen address. |
//! | storage_path | ./data | Directory of the sled database. |
//! | image_path | images/cse | Directory served by `/image`. |
//! | fallback_image | images/404-2.jpg | Returned when a requested image is missing. |
//! | event_log_dir | ./logs | Per-user button event logs. |
//! | debounce_interval_ms | 200 | Minimum spacing of accepted intermediate transcripts. |
//! | cycle_interval_ms | 2500 | Sleep after each processing cycle body. |
//! | not_ready_retry_ms | 100 | Retry delay while the transcript store is not ready. |
//! | relevance_window_secs | 120 | Trailing window of the recency relevance filter. |
//! | use_client_timestamps | false | Debounce on the client timestamp instead of receive time. |
//! | failure_isolation | cycle | `cycle` or `user`. |
//! | relay_capacity | 1024 | Bound of the worker log relay queue. |
//! | relay_send_timeout_ms | 50 | Max time a worker log call waits on a full relay. |
//! | extractor_url | (unset) | Remote extraction endpoint; custom-data matcher when unset. |
//! | max_upload_bytes | 33554432 | Request body limit. |

use crate::error::PipelineResult;
use crate::types::FailureIsolation;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/convoscope";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub port: u16,
    pub bind_address: String,
    pub storage_path: String,
    pub image_path: String,
    pub fallback_image: String,
    pub event_log_dir: String,
    pub debounce_interval_ms: u64,
    pub cycle_interval_ms: u64,
    pub not_ready_retry_ms: u64,
    pub relevance_window_secs: u64,
    pub use_client_timestamps: bool,
    #[serde(default)]
    pub failure_isolation: FailureIsolation,
    pub relay_capacity: usize,
    pub relay_send_timeout_ms: u64,
    #[serde(default)]
    pub extractor_url: Option<String>,
    pub max_upload_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_address: "0.0.0.0".to_string(),
            storage_path: "./data".to_string(),
            image_path: "images/cse".to_string(),
            fallback_image: "images/404-2.jpg".to_string(),
            event_log_dir: "./logs".to_string(),
            debounce_interval_ms: 200,
            cycle_interval_ms: 2500,
            not_ready_retry_ms: 100,
            relevance_window_secs: 120,
            use_client_timestamps: false,
            failure_isolation: FailureIsolation::Cycle,
            relay_capacity: 1024,
            relay_send_timeout_ms: 50,
            extractor_url: None,
            max_upload_bytes: 32 * 1024 * 1024,
        }
    }
}

impl PipelineConfig {
    /// Load config. Precedence: env `CONVOSCOPE__*` > file (`CONVOSCOPE_CONFIG` or
    /// `config/convoscope.toml`) > defaults.
    pub fn load() -> PipelineResult<Self> {
        let config_path =
            std::env::var("CONVOSCOPE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&config_path))
    }

    pub fn load_from(path: &Path) -> PipelineResult<Self> {
        let d = Self::default();
        let builder = config::Config::builder()
            .set_default("port", d.port as i64)?
            .set_default("bind_address", d.bind_address)?
            .set_default("storage_path", d.storage_path)?
            .set_default("image_path", d.image_path)?
            .set_default("fallback_image", d.fallback_image)?
            .set_default("event_log_dir", d.event_log_dir)?
            .set_default("debounce_interval_ms", d.debounce_interval_ms as i64)?
            .set_default("cycle_interval_ms", d.cycle_interval_ms as i64)?
            .set_default("not_ready_retry_ms", d.not_ready_retry_ms as i64)?
            .set_default("relevance_window_secs", d.relevance_window_secs as i64)?
            .set_default("use_client_timestamps", d.use_client_timestamps)?
            .set_default("failure_isolation", "cycle")?
            .set_default("relay_capacity", d.relay_capacity as i64)?
            .set_default("relay_send_timeout_ms", d.relay_send_timeout_ms as i64)?
            .set_default("max_upload_bytes", d.max_upload_bytes as i64)?;

        // `config` resolves the extension itself; accept both "config/convoscope" and ".toml".
        let with_ext = path.with_extension("toml");
        let builder = if path.is_file() || with_ext.is_file() {
            builder.add_source(config::File::from(path.to_path_buf()).required(false))
        } else {
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("CONVOSCOPE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(built.try_deserialize()?)
    }

    pub fn debounce_interval(&self) -> Duration {
        Duration::from_millis(self.debounce_interval_ms)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    pub fn not_ready_retry(&self) -> Duration {
        Duration::from_millis(self.not_ready_retry_ms)
    }

    pub fn relevance_window(&self) -> Duration {
        Duration::from_secs(self.relevance_window_secs)
    }

    pub fn relay_send_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_send_timeout_ms)
    }

    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.storage_path).join("convoscope_db")
    }

    /// Socket address string for the listener, e.g. `0.0.0.0:8080`.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}
