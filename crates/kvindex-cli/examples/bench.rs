//! Load generator for `/score`: fires a mix of prompts across a pool of
//! model names and reports latency percentiles, not just total wall time,
//! so a run actually tells you something about tail behavior under load.

use std::time::{Duration, Instant};

const PROMPTS: &[&str] = &[
    "Summarize the quarterly earnings report for the board.",
    "Translate this paragraph into French.",
    "Write a unit test for the longest-prefix scoring policy.",
    "Explain how the block index evicts a pod on disconnect.",
    "Draft a release note for the event-ingestion pool.",
];

#[tokio::main]
async fn main() {
    let n: usize = std::env::var("N").ok().and_then(|v| v.parse().ok()).unwrap_or(64);
    let models: Vec<String> = std::env::var("MODELS")
        .unwrap_or_else(|_| "llama-3-8b,mixtral-8x7b".into())
        .split(',')
        .map(str::to_string)
        .collect();
    let url = std::env::var("URL").unwrap_or_else(|_| "http://127.0.0.1:8080/score".into());

    let client = reqwest::Client::new();
    let overall_start = Instant::now();

    let mut requests = Vec::with_capacity(n);
    for i in 0..n {
        let client = client.clone();
        let url = url.clone();
        let prompt = PROMPTS[i % PROMPTS.len()].to_string();
        let model = models[i % models.len()].clone();
        requests.push(tokio::spawn(async move {
            let body = serde_json::json!({"prompt": prompt, "model": model});
            let start = Instant::now();
            let ok = client.post(&url).json(&body).send().await.is_ok();
            (ok, start.elapsed())
        }));
    }

    let mut latencies = Vec::with_capacity(n);
    let mut failures = 0usize;
    for request in requests {
        match request.await {
            Ok((true, elapsed)) => latencies.push(elapsed),
            _ => failures += 1,
        }
    }
    latencies.sort_unstable();

    let total = overall_start.elapsed();
    println!(
        "{n} requests ({failures} failed) across {} models in {:.2}s: p50={:?} p99={:?} max={:?}",
        models.len(),
        total.as_secs_f32(),
        percentile(&latencies, 0.50),
        percentile(&latencies, 0.99),
        latencies.last().copied().unwrap_or_default(),
    );
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = (((sorted.len() - 1) as f64) * p).round() as usize;
    sorted[idx]
}
