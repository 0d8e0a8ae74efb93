//! Processing cycle: the background scheduler.
//!
//! `Idle -> Lock -> Drain -> (per user: Extract -> Filter -> Persist) -> Unlock -> Sleep`.
//! The sleep is measured from the end of the body, so slow cycles throttle themselves.
//! Extraction calls are not timed out: a hung call stalls this and every later cycle.

use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::extract::ExtractionEngine;
use crate::relevance::RelevanceGate;
use crate::store::{ResultStore, TranscriptStore};
use crate::types::{CycleOutcome, CycleRun, ExtractionResult, FailureIsolation, UserTranscript};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};

#[derive(Debug, Clone, Copy)]
pub struct CycleSettings {
    /// Sleep after each body.
    pub interval: Duration,
    /// Sleep after a skipped body (store not ready).
    pub not_ready_retry: Duration,
    pub isolation: FailureIsolation,
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for CycleSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            interval: config.cycle_interval(),
            not_ready_retry: config.not_ready_retry(),
            isolation: config.failure_isolation,
        }
    }
}

/// Drains pending transcripts, extracts, gates and persists, one body at a time.
pub struct ProcessingCycle {
    transcripts: Arc<dyn TranscriptStore>,
    results: Arc<dyn ResultStore>,
    extractor: Arc<dyn ExtractionEngine>,
    relevance: Arc<dyn RelevanceGate>,
    settings: CycleSettings,
    /// Held for the whole body; two bodies never overlap.
    body_lock: Mutex<()>,
}

/// Counters filled in while a body runs.
#[derive(Default)]
struct BodyProgress {
    users: usize,
    persisted: usize,
}

impl ProcessingCycle {
    pub fn new(
        transcripts: Arc<dyn TranscriptStore>,
        results: Arc<dyn ResultStore>,
        extractor: Arc<dyn ExtractionEngine>,
        relevance: Arc<dyn RelevanceGate>,
        settings: CycleSettings,
    ) -> Self {
        Self {
            transcripts,
            results,
            extractor,
            relevance,
            settings,
            body_lock: Mutex::new(()),
        }
    }

    /// Run one cycle. Never returns an error: failures are logged and reported in the outcome.
    /// A panic inside the body is contained and reported as a failure too.
    pub async fn run_once(self: &Arc<Self>) -> CycleRun {
        let started_at = Instant::now();
        if !self.transcripts.is_ready() {
            tracing::debug!("transcript store not ready; skipping cycle");
            return CycleRun {
                started_at,
                finished_at: Instant::now(),
                users: 0,
                persisted: 0,
                outcome: CycleOutcome::Skipped,
            };
        }

        let _guard = self.body_lock.lock().await;
        tracing::debug!("processing cycle started");
        let this = Arc::clone(self);
        let joined = tokio::spawn(async move {
            let mut progress = BodyProgress::default();
            let result = this.body(&mut progress).await;
            (progress, result)
        })
        .await;

        let (progress, outcome) = match joined {
            Ok((progress, Ok(()))) => (progress, CycleOutcome::Success),
            Ok((progress, Err(e))) if e.is_transient() => {
                tracing::debug!(error = %e, "store unavailable at drain; retrying next cycle");
                (progress, CycleOutcome::Skipped)
            }
            Ok((progress, Err(e))) => {
                tracing::error!(error = %e, "processing cycle failed; remaining work dropped");
                (progress, CycleOutcome::Failed(e.to_string()))
            }
            Err(join_err) => {
                tracing::error!(
                    error = %join_err,
                    "processing cycle panicked; remaining work dropped"
                );
                (BodyProgress::default(), CycleOutcome::Failed(join_err.to_string()))
            }
        };

        CycleRun {
            started_at,
            finished_at: Instant::now(),
            users: progress.users,
            persisted: progress.persisted,
            outcome,
        }
    }

    async fn body(&self, progress: &mut BodyProgress) -> PipelineResult<()> {
        let pending = self.transcripts.drain_pending()?;
        progress.users = pending.len();

        let mut last_failure: Option<PipelineError> = None;
        for transcript in &pending {
            match self.process_user(transcript).await {
                Ok(persisted) => progress.persisted += persisted,
                Err(e) => match self.settings.isolation {
                    FailureIsolation::Cycle => return Err(e),
                    FailureIsolation::User => {
                        tracing::error!(
                            user_id = %transcript.user_id,
                            error = %e,
                            "user dropped from cycle"
                        );
                        last_failure = Some(e);
                    }
                },
            }
        }
        match last_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Extract, gate and persist one user's combined transcript. Returns the number persisted.
    async fn process_user(&self, transcript: &UserTranscript) -> PipelineResult<usize> {
        let user_id = transcript.user_id.as_str();
        tracing::info!(
            user_id,
            fragments = transcript.fragments,
            text = %transcript.text,
            "running extraction"
        );

        let started = Instant::now();
        let candidates = self.extractor.extract(user_id, &transcript.text).await?;
        tracing::info!(
            user_id,
            candidates = candidates.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "extraction completed"
        );

        let mut accepted: Vec<ExtractionResult> = Vec::new();
        for candidate in candidates {
            if candidate.is_empty() {
                continue;
            }
            let keep = self
                .relevance
                .should_run_for_text(user_id, &candidate.name)
                .map_err(|e| PipelineError::upstream("relevance", user_id, e))?;
            if keep {
                accepted.push(candidate);
            }
        }

        self.results.add_results(user_id, &accepted)
    }

    /// Run cycles until `shutdown` flips to true (or its sender is dropped).
    /// A body in progress always finishes; only the sleeps are interrupted. Returns cycles run.
    pub async fn run_forever(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> u64 {
        tracing::info!(
            interval_ms = self.settings.interval.as_millis() as u64,
            isolation = ?self.settings.isolation,
            "processing loop started"
        );
        let mut cycles = 0u64;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let run = self.run_once().await;
            let delay = match run.outcome {
                CycleOutcome::Skipped => self.settings.not_ready_retry,
                _ => {
                    cycles += 1;
                    tracing::debug!(
                        users = run.users,
                        persisted = run.persisted,
                        failed = run.is_failed(),
                        elapsed_ms = run.elapsed().as_millis() as u64,
                        "processing cycle completed"
                    );
                    self.settings.interval
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!(cycles, "processing loop stopped");
        cycles
    }
}
