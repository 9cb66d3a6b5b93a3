use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};

use quern::backend::BackendFactory;
use quern::config::Settings;
use quern::coordinator::{GenerationCoordinator, GenerationDefaults};

use quern_server::{logging, routes, state::AppState};

#[derive(Parser)]
#[command(name = "quernd", about = "OpenAI-compatible local inference server")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured bind address
    #[arg(long)]
    host: Option<String>,

    /// Override the configured port
    #[arg(short, long)]
    port: Option<u16>,
}

fn build_factory(settings: &Settings) -> anyhow::Result<Arc<dyn BackendFactory>> {
    if settings.model.path.is_empty() {
        tracing::warn!("no model path configured, serving the fixture backend");
        return Ok(Arc::new(quern::backend::fixture::FixtureFactory::new()));
    }

    #[cfg(feature = "llama")]
    {
        let factory = quern::backend::llama::LlamaFactory::new(quern::backend::llama::LlamaConfig {
            model_path: PathBuf::from(&settings.model.path),
            ctx_size: settings.model.ctx_size,
            gpu_layers: settings.model.gpu_layers,
            n_threads: settings.model.n_threads,
        })
        .context("initializing llama backend")?;
        return Ok(Arc::new(factory));
    }
    #[cfg(not(feature = "llama"))]
    {
        tracing::warn!(
            path = %settings.model.path,
            "built without llama support, serving the fixture backend"
        );
        Ok(Arc::new(quern::backend::fixture::FixtureFactory::new()))
    }
}

fn cors_layer(settings: &Settings) -> anyhow::Result<CorsLayer> {
    let origins = &settings.cors.allowed_origins;
    if origins.iter().any(|o| o == "*") {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any));
    }
    let parsed: Result<Vec<http::HeaderValue>, _> = origins.iter().map(|o| o.parse()).collect();
    Ok(CorsLayer::new()
        .allow_origin(parsed.context("parsing CORS allowed origins")?)
        .allow_methods(Any)
        .allow_headers(Any))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(host) = cli.host {
        settings.server.host = host;
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }

    if !settings.model.path.is_empty() {
        quern::artifact::ensure_model_artifact(
            &settings.artifact,
            std::path::Path::new(&settings.model.path),
        )
        .await?;
    }

    let factory = build_factory(&settings)?;
    let coordinator = GenerationCoordinator::initialize(
        factory,
        settings.model.name.clone(),
        GenerationDefaults {
            temperature: settings.generation.default_temperature,
            max_tokens: settings.generation.default_max_tokens,
        },
        settings.model.pool_size,
    )
    .await
    .context("initializing model pool")?;

    let cors = cors_layer(&settings)?;
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let state = AppState::new(coordinator, settings);
    let app = routes::configure(state.clone()).layer(cors);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    state.coordinator.shutdown().await;
    Ok(())
}
