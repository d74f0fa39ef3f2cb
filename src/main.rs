//! # EnnovateX AI Backend - Main Application Entry Point
//!
//! HTTP service for text summarization, image captioning and speech
//! recognition/translation, with bounded-concurrency batch endpoints for
//! each of them.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: the server and every handler are asynchronous
//! - **Arc**: the model loader and services are shared by all workers
//! - **Result<T, E>**: startup failures are returned, not panicked
//! - **static + atomics**: the shutdown flag is a global `AtomicBool`
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, config.toml, environment)
//! - **batch**: bounded-concurrency batch runner and statistics aggregation
//! - **models**: model loading and the inference provider traits
//! - **services**: text, image and audio processing on top of the providers
//! - **state**: shared application state and HTTP metrics
//! - **health**: liveness, readiness and metrics endpoints
//! - **middleware**: request logging and metrics collection
//! - **handlers**: HTTP request handlers for the API
//! - **error**: error types and their HTTP responses

mod batch;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod middleware;
mod models;
mod services;
mod state;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use config::AppConfig;
use models::ModelLoader;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set by the signal handler task, polled by `wait_for_shutdown`.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// ## Startup order:
/// 1. `.env` file, then tracing
/// 2. Configuration, loaded and validated
/// 3. Model loader, and the models themselves when `load_on_startup` is set
/// 4. Shared state, then the HTTP server
///
/// On SIGINT/SIGTERM the server stops gracefully and the models are released.
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load().context("Failed to load configuration")?;
    config.validate()?;

    info!("Starting ennovatex-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let loader = Arc::new(ModelLoader::new(&config));
    info!(device = loader.device_name(), "Model device selected");

    if config.models.load_on_startup {
        // Only fails when `models.require_all` is set; otherwise missing
        // models are reported by /health/ready and answer 503
        loader.initialize_models().await?;
    } else {
        warn!("Model loading on startup is disabled; model routes answer 503 until models are installed");
    }

    let app_state = AppState::new(config.clone(), loader.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(handlers::json_config())
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .wrap(TracingLogger::default())
            .configure(handlers::configure_routes)
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    loader.cleanup().await;
    info!("Server stopped gracefully");
    Ok(())
}

/// Console logging filtered by `RUST_LOG`, defaulting to
/// `ennovatex_backend=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ennovatex_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("Failed to initialize tracing")?;

    Ok(())
}

/// Listen for SIGTERM and SIGINT in a background task and raise the
/// shutdown flag on the first one.
///
/// If the SIGTERM handler cannot be installed, Ctrl+C still works.
fn setup_signal_handlers() {
    tokio::spawn(async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    }
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    wait_for_ctrl_c().await;
                }
            }
        }

        #[cfg(not(unix))]
        wait_for_ctrl_c().await;

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received SIGINT"),
        Err(e) => {
            // Without any signal handler the flag can never be raised; keep the server up
            error!("Failed to install SIGINT handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

/// Poll the shutdown flag every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
