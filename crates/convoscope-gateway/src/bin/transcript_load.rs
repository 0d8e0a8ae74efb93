//! Transcript load generator: several simulated speakers stream intermediate and final
//! transcripts at a running gateway, then poll for results.
//! Run with the gateway up: cargo run --bin transcript_load
//! Target defaults to http://127.0.0.1:8080 (override with CONVOSCOPE_URL).

use reqwest::Client;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

const SPEAKERS: usize = 8;
const UTTERANCES_PER_SPEAKER: usize = 4;
/// Intermediate updates arrive faster than the debounce window, as a recogniser would send them.
const INTERMEDIATE_GAP: Duration = Duration::from_millis(60);

const UTTERANCES: &[&str] = &[
    "we should move the ingest service onto tokio before the release",
    "the sled database keeps growing when nobody drains the transcripts",
    "can someone check whether the rust toolchain on the build box is current",
    "I read that axum handles multipart uploads without extra glue",
    "the glasses only poll every few seconds so results can lag a little",
    "let us add a relevance window so the same card does not repeat",
];

#[tokio::main]
async fn main() {
    let base_url = std::env::var("CONVOSCOPE_URL")
        .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());
    println!(
        "[LOAD] {} speakers x {} utterances against {}",
        SPEAKERS, UTTERANCES_PER_SPEAKER, base_url
    );

    let sent = Arc::new(AtomicU32::new(0));
    let debounced = Arc::new(AtomicU32::new(0));
    let failed = Arc::new(AtomicU32::new(0));
    let latencies: Arc<RwLock<Vec<u64>>> = Arc::new(RwLock::new(Vec::new()));
    let client = Client::new();

    let mut handles = Vec::new();
    for speaker in 0..SPEAKERS {
        let client = client.clone();
        let base_url = base_url.clone();
        let sent = Arc::clone(&sent);
        let debounced = Arc::clone(&debounced);
        let failed = Arc::clone(&failed);
        let latencies = Arc::clone(&latencies);

        handles.push(tokio::spawn(async move {
            let user_id = format!("load-user-{}", speaker);
            for u in 0..UTTERANCES_PER_SPEAKER {
                let utterance = UTTERANCES[(speaker + u) % UTTERANCES.len()];
                let words: Vec<&str> = utterance.split_whitespace().collect();
                for n in 1..=words.len() {
                    let is_final = n == words.len();
                    let body = json!({
                        "userId": user_id,
                        "text": words[..n].join(" "),
                        "timestamp": chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
                        "isFinal": is_final,
                    });
                    let start = Instant::now();
                    let res = client.post(format!("{}/chat", base_url)).json(&body).send().await;
                    let elapsed_ms = start.elapsed().as_millis() as u64;
                    match res {
                        Ok(resp) if resp.status().is_success() => {
                            sent.fetch_add(1, Ordering::Relaxed);
                            latencies.write().await.push(elapsed_ms);
                            let accepted = resp
                                .json::<serde_json::Value>()
                                .await
                                .ok()
                                .and_then(|v| v.get("accepted").and_then(|a| a.as_bool()))
                                .unwrap_or(true);
                            if !accepted {
                                debounced.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        _ => {
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    if !is_final {
                        tokio::time::sleep(INTERMEDIATE_GAP).await;
                    }
                }
            }
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    // Give the cycle a chance to run, then collect.
    tokio::time::sleep(Duration::from_secs(3)).await;
    let mut delivered = 0usize;
    for speaker in 0..SPEAKERS {
        let body = json!({
            "userId": format!("load-user-{}", speaker),
            "deviceId": "load-device",
            "features": ["contextual_search_engine"],
        });
        let res = client.post(format!("{}/ui_poll", base_url)).json(&body).send().await;
        if let Ok(resp) = res {
            if let Ok(v) = resp.json::<serde_json::Value>().await {
                delivered += v
                    .get("result")
                    .and_then(|r| r.as_array())
                    .map(|r| r.len())
                    .unwrap_or(0);
            }
        }
    }

    let latencies = latencies.read().await;
    let avg_latency_ms = if latencies.is_empty() {
        0.0
    } else {
        latencies.iter().sum::<u64>() as f64 / latencies.len() as f64
    };
    println!(
        "[LOAD] chat ok: {} | debounced: {} | failed: {} | avg latency: {:.1}ms",
        sent.load(Ordering::Relaxed),
        debounced.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        avg_latency_ms
    );
    println!("[LOAD] results delivered on first poll: {}", delivered);
}
