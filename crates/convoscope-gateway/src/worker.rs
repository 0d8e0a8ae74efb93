//! Background worker: the processing cycle on its own OS thread and runtime.
//!
//! The thread installs the relay layer as its default subscriber, so everything the cycle logs
//! reaches the process logger only through the `LogRelay` drained by the serving runtime.

use convoscope_core::{ProcessingCycle, RelayLayer};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::watch;
use tracing::Level;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Layer;

pub struct BackgroundWorker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<u64>,
}

/// Core crate events down to debug; dependencies at info.
fn worker_filter() -> Targets {
    Targets::new()
        .with_target("convoscope_core", Level::DEBUG)
        .with_default(Level::INFO)
}

impl BackgroundWorker {
    pub fn spawn(cycle: Arc<ProcessingCycle>, relay: RelayLayer) -> std::io::Result<Self> {
        let (shutdown, rx) = watch::channel(false);
        let handle = std::thread::Builder::new()
            .name("convoscope-worker".to_string())
            .spawn(move || {
                let subscriber =
                    tracing_subscriber::registry().with(relay.with_filter(worker_filter()));
                tracing::subscriber::with_default(subscriber, || {
                    let built = tokio::runtime::Builder::new_current_thread().enable_all().build();
                    let runtime = match built {
                        Ok(rt) => rt,
                        Err(e) => {
                            tracing::error!(error = %e, "failed to build worker runtime");
                            return 0;
                        }
                    };
                    runtime.block_on(cycle.run_forever(rx))
                })
            })?;
        Ok(Self { shutdown, handle })
    }

    /// Signal shutdown and wait for the cycle in progress to finish. Blocks the caller.
    /// Returns the number of cycles run.
    pub fn stop(self) -> u64 {
        let _ = self.shutdown.send(true);
        match self.handle.join() {
            Ok(cycles) => cycles,
            Err(_) => {
                tracing::error!("background worker panicked");
                0
            }
        }
    }
}
