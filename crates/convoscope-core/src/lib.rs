//! Convoscope core library.
//!
//! Debounced transcript ingestion, the periodic background extraction cycle, and pull-based
//! result delivery. Storage, extraction and relevance are capability traits so the cycle can be
//! exercised in isolation.

pub mod config;
pub mod custom_data;
pub mod cycle;
pub mod debounce;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod poll;
pub mod relay;
pub mod relevance;
pub mod store;
pub mod types;

pub use config::PipelineConfig;
pub use custom_data::parse_custom_data_csv;
pub use cycle::{CycleSettings, ProcessingCycle};
pub use debounce::DebounceFilter;
pub use error::{PipelineError, PipelineResult};
pub use extract::{CustomDataExtractor, ExtractionEngine, HttpExtractionEngine};
pub use ingest::{IngestOutcome, IngestRequest, IngestionGateway, TimestampSource};
pub use poll::{poll, PollRequest, PollResponse, CONTEXTUAL_SEARCH_FEATURE};
pub use relay::{relay_channel, LogRecord, LogRelay, RecordLevel, RelayLayer, RELAY_TARGET};
pub use relevance::{RecencyRelevanceFilter, RelevanceGate};
pub use store::{CustomDataStore, ResultStore, SledStore, TranscriptStore};
pub use types::{
    CustomEntry, CycleOutcome, CycleRun, ExtractionResult, FailureIsolation, StoredResult,
    TranscriptEvent, UserTranscript,
};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
