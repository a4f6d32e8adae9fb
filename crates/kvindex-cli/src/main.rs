use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use clap::{Args, Parser, Subcommand};
use kvindex_backend::instrumented::InstrumentedBackend;
use kvindex_backend::IndexBackend;
use kvindex_common::config::IndexerConfig;
use kvindex_core::tokenizer::HuggingFaceLoader;
use kvindex_core::Indexer;
use opentelemetry_otlp::WithExportConfig;
use tokio_util::sync::CancellationToken;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Upper bound on how long `serve` waits for the event pool to quiesce
/// after a shutdown signal before giving up.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "kvindex", version, about = "KV-cache locality indexer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs the event-ingestion pool and the `Score` HTTP API.
    Serve,
    /// Runs a single `Score` call against the configured index and prints it.
    Score(ScoreArgs),
    /// Prints host CPU/memory stats.
    Stats,
    Version,
}

#[derive(Args, Debug)]
struct ScoreArgs {
    #[arg(short, long)]
    prompt: String,
    #[arg(short, long)]
    model: String,
    #[arg(long)]
    allowed_pod: Vec<String>,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve => serve().await,
        Commands::Score(args) => score(args).await,
        Commands::Stats => stats().await,
        Commands::Version => println!("{}", env!("CARGO_PKG_VERSION")),
    }
}

/// Builds the configured block-index backend and wraps it in an
/// [`Indexer`]. The Redis backend needs an async connect step that
/// `Indexer::new` can't perform on its own, so it's assembled here and
/// handed to `Indexer::with_block_index`.
async fn build_indexer(config: IndexerConfig) -> kvindex_common::Result<Indexer> {
    let loader = Arc::new(HuggingFaceLoader::new(&config.tokenizers_pool_config));
    if let Some(redis_cfg) = config.kv_block_index_config.redis_config.clone() {
        let backend = kvindex_backend_redis::RedisBackend::connect(&redis_cfg.address).await?;
        let backend: Arc<dyn IndexBackend> = if config.kv_block_index_config.enable_metrics {
            Arc::new(InstrumentedBackend::new(backend))
        } else {
            Arc::new(backend)
        };
        Ok(Indexer::with_block_index(config, loader, backend))
    } else {
        Indexer::with_loader(config, loader)
    }
}

async fn serve() {
    let config = IndexerConfig::load();
    let indexer = Arc::new(
        build_indexer(config.clone())
            .await
            .expect("failed to construct indexer"),
    );

    let cancel = CancellationToken::new();
    let indexer_runner = tokio::spawn({
        let indexer = indexer.clone();
        let cancel = cancel.clone();
        async move { indexer.run(cancel).await }
    });
    let event_pool = kvindex_events::EventPool::start(
        config.event_pool.clone(),
        indexer.block_index(),
        cancel.clone(),
    );

    let app: Router = kvindex_api::app(indexer);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", 8080)).await.unwrap();
    tracing::info!(target: "api", "listening on http://0.0.0.0:8080");
    let shutdown = {
        let cancel = cancel.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            cancel.cancel();
        }
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .unwrap();

    cancel.cancel();
    if !event_pool.shutdown(SHUTDOWN_TIMEOUT).await {
        tracing::warn!(target: "events", "event pool did not quiesce within the shutdown timeout");
    }
    let _ = indexer_runner.await;
}

async fn score(args: ScoreArgs) {
    let config = IndexerConfig::load();
    let indexer = Arc::new(build_indexer(config).await.expect("failed to construct indexer"));
    let cancel = CancellationToken::new();
    let runner = tokio::spawn({
        let indexer = indexer.clone();
        let cancel = cancel.clone();
        async move { indexer.run(cancel).await }
    });
    match indexer.score(&args.prompt, &args.model, &args.allowed_pod).await {
        Ok(scores) => println!("{}", serde_json::to_string_pretty(&scores).unwrap()),
        Err(e) => eprintln!("score failed: {e}"),
    }
    cancel.cancel();
    let _ = runner.await;
}

async fn stats() {
    use sysinfo::{CpuExt, System, SystemExt};
    let mut sys = System::new_all();
    sys.refresh_all();
    let total_mem = sys.total_memory();
    let used_mem = sys.used_memory();
    let cpu_avg: f32 = sys.cpus().iter().map(|c| c.cpu_usage()).sum::<f32>() / (sys.cpus().len() as f32);
    println!("CPU: {:.1}%", cpu_avg);
    println!("Memory: {} / {} MiB", used_mem / 1024 / 1024, total_mem / 1024 / 1024);
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
    );

    if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint))
            .install_simple()
            .ok();
        if let Some(tracer) = tracer {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .with(OpenTelemetryLayer::new(tracer))
                .init();
            return;
        }
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
