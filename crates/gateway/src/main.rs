//! Quarry API Gateway
//!
//! The main entry point for all external API requests.
//! Handles:
//! - Session lifecycle
//! - Streaming agentic answers over server-sent events
//! - Rate limiting
//! - Observability (logging, metrics)

mod handlers;
mod middleware;

use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use quarry_common::{
    config::{AppConfig, ObservabilityConfig},
    context::AgenticLoop,
    llm::{create_language_model, LanguageModel},
    metrics,
    search::{create_search, SemanticSearch},
    session::{create_session_store, SessionManager, SessionStore},
};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::oneshot;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub sessions: SessionManager,
    pub metrics: Option<PrometheusHandle>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = AppConfig::load()?;
    init_tracing(&config.observability);

    info!("Starting Quarry API Gateway v{}", quarry_common::VERSION);

    // Initialize metrics
    let metrics_handle = if config.observability.metrics_enabled {
        let handle = prometheus_builder(&config.observability)?.install_recorder()?;
        metrics::register_metrics();
        Some(handle)
    } else {
        None
    };

    // Providers
    let model = create_language_model(&config.llm)?;
    let search = create_search(&config.search, config.search_api_key())?;
    info!(
        model = model.model_name(),
        search = search.provider_name(),
        collection = config.search.collection.as_deref().unwrap_or("<none>"),
        "Providers ready"
    );

    // Sessions
    let store = create_session_store(&config.session).await?;
    info!(backend = store.backend_name(), "Session store ready");

    let agent = Arc::new(AgenticLoop::new(model, search, &config.search, &config.agent));
    let sessions = SessionManager::new(store, agent, config.session.max_append_retries);

    let config = Arc::new(config);
    let state = AppState {
        config: config.clone(),
        sessions,
        metrics: metrics_handle,
    };

    // Build the router
    let app = create_router(state);

    // Start the server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    let (signalled_tx, signalled_rx) = oneshot::channel();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = signalled_tx.send(());
    });

    tokio::select! {
        result = server.into_future() => {
            result?;
            info!("Server shutdown complete");
        }
        _ = shutdown_deadline(signalled_rx, config.shutdown_timeout()) => {
            warn!(
                timeout_secs = config.server.shutdown_timeout_secs,
                "In-flight requests did not drain in time, exiting"
            );
        }
    }
    Ok(())
}

/// Prometheus exporter with generation latency buckets and a service label
fn prometheus_builder(config: &ObservabilityConfig) -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .add_global_label("service", config.service_name.clone())
        .set_buckets_for_metric(
            Matcher::Full(format!("{}_generation_duration_seconds", metrics::METRICS_PREFIX)),
            metrics::GENERATION_BUCKETS,
        )
}

/// JSON or human-readable logs, filtered by `RUST_LOG` or the configured level
fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    if config.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    // Streaming answers are not covered by the request timeout
    let request_timeout = TimeoutLayer::new(state.config.request_timeout());

    // API routes
    let mut api_routes = Router::new()
        .route("/sessions", post(handlers::sessions::create_session))
        .route("/sessions/{id}", get(handlers::sessions::get_session))
        .layer(request_timeout.clone())
        .route("/sessions/{id}/messages", post(handlers::messages::send_message));

    let rate_limit = &state.config.rate_limit;
    if rate_limit.enabled {
        let limiter =
            middleware::rate_limit::create_rate_limiter(rate_limit.requests_per_second, rate_limit.burst);
        let limit = rate_limit.requests_per_second;
        api_routes = api_routes.layer(axum::middleware::from_fn(move |request: axum::extract::Request, next: axum::middleware::Next| {
            middleware::rate_limit::rate_limit_middleware(request, next, limiter.clone(), limit)
        }));
    }

    // Compose the app
    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .route("/metrics", get(handlers::health::metrics))
        .layer(request_timeout)
        .nest("/v2", api_routes)
        .route_layer(axum::middleware::from_fn(middleware::metrics::track_requests))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(propagate_id)
        .layer(request_id)
        .with_state(state)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}

/// Resolves `timeout` after the shutdown signal; never if no signal came
async fn shutdown_deadline(signalled: oneshot::Receiver<()>, timeout: Duration) {
    if signalled.await.is_err() {
        std::future::pending::<()>().await;
    }
    tokio::time::sleep(timeout).await;
}
