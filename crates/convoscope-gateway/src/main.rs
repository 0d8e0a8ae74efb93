//! Convoscope gateway: transcript ingestion and result polling over HTTP, with the extraction
//! cycle running on a background worker thread.

mod app;
mod events;
mod images;
mod worker;

use app::{build_app, AppState};
use convoscope_core::{
    relay_channel, CustomDataExtractor, CycleSettings, DebounceFilter, ExtractionEngine,
    HttpExtractionEngine, IngestionGateway, PipelineConfig, PipelineResult, ProcessingCycle,
    RecencyRelevanceFilter, SledStore, TimestampSource,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use worker::BackgroundWorker;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "gateway stopped with an error");
        std::process::exit(1);
    }
}

async fn run() -> PipelineResult<()> {
    let config = PipelineConfig::load()?;
    tracing::info!(version = convoscope_core::version(), "starting convoscope gateway");

    let store = Arc::new(SledStore::open(config.database_path())?);
    let extractor: Arc<dyn ExtractionEngine> = match config.extractor_url.as_deref() {
        Some(url) => {
            tracing::info!(url, "using remote extraction engine");
            Arc::new(HttpExtractionEngine::new(url))
        }
        None => Arc::new(CustomDataExtractor::new(store.clone())),
    };
    let cycle = Arc::new(ProcessingCycle::new(
        store.clone(),
        store.clone(),
        extractor,
        Arc::new(RecencyRelevanceFilter::new(config.relevance_window())),
        CycleSettings::from(&config),
    ));

    let (relay_layer, mut relay) =
        relay_channel(config.relay_capacity, config.relay_send_timeout());
    let worker = BackgroundWorker::spawn(cycle, relay_layer)?;
    // Runs until the worker thread drops its relay layer.
    let relay_task = tokio::spawn(async move {
        let replayed = relay.drain().await;
        (relay, replayed)
    });

    let timestamps = if config.use_client_timestamps {
        TimestampSource::Client
    } else {
        TimestampSource::Server
    };
    let state = AppState {
        ingest: Arc::new(IngestionGateway::new(
            store.clone(),
            DebounceFilter::new(config.debounce_interval()),
            timestamps,
        )),
        results: store.clone(),
        custom_data: store.clone(),
        image_dir: PathBuf::from(&config.image_path),
        fallback_image: PathBuf::from(&config.fallback_image),
        event_log_dir: PathBuf::from(&config.event_log_dir),
    };
    let app = build_app(state, config.max_upload_bytes);

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    tracing::info!("stopping background worker");
    match tokio::task::spawn_blocking(move || worker.stop()).await {
        Ok(cycles) => tracing::info!(cycles, "background worker stopped"),
        Err(e) => tracing::error!(error = %e, "failed to join background worker"),
    }
    match relay_task.await {
        Ok((mut relay, replayed)) => {
            let late = relay.drain_pending();
            tracing::info!(
                replayed = replayed + late as u64,
                dropped = relay.dropped(),
                "log relay closed"
            );
        }
        Err(e) => tracing::error!(error = %e, "log relay task failed"),
    }

    store.flush()?;
    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
