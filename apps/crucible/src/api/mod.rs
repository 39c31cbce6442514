//! # Crucible HTTP API Module
//!
//! This module implements the HTTP REST API server using axum.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /metals` - Metal catalogue with formula values and reserves
//! - `POST /trees` - Register a tree in transit
//! - `GET /trees/transit` - Trees waiting to be invested
//! - `POST /waxing` - Invest a tree into a new flask
//! - `GET /flasks/check` - Is a flask number free on a date (`?number=&date=`)
//! - `GET /flasks/{id}` - Flask with every stage record
//! - `POST /flasks/{id}/metal-prep` - Plan metal, hold scrap
//! - `POST /flasks/{id}/supply` - Declare supplied metal, consume scrap
//! - `POST /flasks/{id}/casting/complete` - Record the pour, start quenching
//! - `POST /flasks/{id}/quenching` - Manual promotion to cutting
//! - `POST /flasks/{id}/cutting` - Stage cut weights
//! - `POST /flasks/{id}/reconciliation/confirm` - Confirm and credit scrap
//! - `GET /queue/{stage}` - Work queue of one stage
//! - `GET /bags/{label}` - Find a bag's tree and flask
//! - `GET /scrap/reserves` - Scrap on hand per metal
//! - `POST /scrap/adjust` - Manual reserve correction
//! - `GET /scrap/movements` - Movement log (`?metal=&flask=&limit=`)
//! - `GET /events` - Live pipeline events (Server-Sent Events)
//!
//! ## CORS
//!
//! `server.cors_origins` / `CRUCIBLE_CORS_ORIGINS`: list of allowed
//! origins, or "*" for all (default: localhost only).

mod events;
mod handlers;
mod types;

pub use events::{EVENT_BUFFER, EventHub, Subscription, events_handler};
pub use handlers::{
    adjust_handler, bag_handler, casting_complete_handler, check_flask_number_handler,
    create_tree_handler, cutting_handler, flask_handler, health_handler, metal_prep_handler,
    metals_handler, movements_handler, quenching_handler, queue_handler, reconciliation_handler,
    reserves_handler, supply_handler, trees_in_transit_handler, waxing_handler,
};
pub use types::{
    ActorRequest, AdjustRequest, ApiError, ErrorResponse, FlaskNumberCheck, FlaskNumberQuery,
    HealthResponse, MetalInfo, MovementQuery, QueueResponse, ReservesResponse, status_for,
};

use crate::config::CrucibleConfig;
use crate::scheduler::spawn_sweep;
use axum::{
    Router,
    http::{HeaderValue, Method, header},
    routing::{get, post},
};
use crucible_core::{CrucibleError, Pipeline};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

// =============================================================================
// SERVER STATE
// =============================================================================

/// Shared server state.
#[derive(Clone)]
pub struct AppState {
    /// The stage machine, shared with the sweep task.
    pub pipeline: Arc<Pipeline>,
    /// Live event fan-out; also the pipeline's event sink.
    pub events: EventHub,
}

impl AppState {
    /// Wire a fresh `EventHub` in as the pipeline's event sink.
    #[must_use]
    pub fn new(pipeline: Pipeline) -> Self {
        let events = EventHub::default();
        let pipeline = pipeline.with_sink(Arc::new(events.clone()));
        Self {
            pipeline: Arc::new(pipeline),
            events,
        }
    }
}

// =============================================================================
// CORS CONFIGURATION
// =============================================================================

/// Build the CORS layer from the configured origins.
///
/// - `None`: localhost only
/// - `["*"]`: every origin
/// - otherwise: exactly the listed origins (invalid entries are skipped)
pub fn build_cors_layer(origins: Option<&[String]>) -> CorsLayer {
    match origins {
        Some([only]) if only == "*" => {
            tracing::warn!("CORS: allowing ALL origins; use only on a closed floor network");
            CorsLayer::permissive()
        }
        Some(origins) => {
            let allowed: Vec<HeaderValue> = origins
                .iter()
                .filter_map(|origin| match origin.trim().parse::<HeaderValue>() {
                    Ok(value) => {
                        tracing::info!("CORS: allowing origin {}", origin.trim());
                        Some(value)
                    }
                    Err(e) => {
                        tracing::warn!("CORS: invalid origin '{}': {}", origin, e);
                        None
                    }
                })
                .collect();

            if allowed.is_empty() {
                tracing::warn!("CORS: no valid origins configured, defaulting to localhost only");
                build_localhost_cors()
            } else {
                CorsLayer::new()
                    .allow_origin(allowed)
                    .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                    .allow_headers([header::CONTENT_TYPE])
            }
        }
        None => {
            tracing::info!("CORS: no origins configured, defaulting to localhost only");
            build_localhost_cors()
        }
    }
}

fn build_localhost_cors() -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        "http://localhost:3000",
        "http://localhost:5173",
        "http://127.0.0.1:3000",
        "http://127.0.0.1:5173",
    ]
    .into_iter()
    .filter_map(|origin| origin.parse::<HeaderValue>().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}

// =============================================================================
// ROUTER CREATION
// =============================================================================

/// Create the axum router with all endpoints and middleware.
pub fn create_router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/metals", get(handlers::metals_handler))
        .route("/trees", post(handlers::create_tree_handler))
        .route("/trees/transit", get(handlers::trees_in_transit_handler))
        .route("/waxing", post(handlers::waxing_handler))
        .route("/flasks/check", get(handlers::check_flask_number_handler))
        .route("/flasks/{id}", get(handlers::flask_handler))
        .route("/flasks/{id}/metal-prep", post(handlers::metal_prep_handler))
        .route("/flasks/{id}/supply", post(handlers::supply_handler))
        .route(
            "/flasks/{id}/casting/complete",
            post(handlers::casting_complete_handler),
        )
        .route("/flasks/{id}/quenching", post(handlers::quenching_handler))
        .route("/flasks/{id}/cutting", post(handlers::cutting_handler))
        .route(
            "/flasks/{id}/reconciliation/confirm",
            post(handlers::reconciliation_handler),
        )
        .route("/queue/{stage}", get(handlers::queue_handler))
        .route("/bags/{label}", get(handlers::bag_handler))
        .route("/scrap/reserves", get(handlers::reserves_handler))
        .route("/scrap/adjust", post(handlers::adjust_handler))
        .route("/scrap/movements", get(handlers::movements_handler))
        .route("/events", get(events::events_handler))
        .layer(axum::extract::DefaultBodyLimit::max(256 * 1024))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// SERVER STARTUP
// =============================================================================

/// Serve the API and run the promotion sweep until Ctrl+C.
pub async fn run_server(config: &CrucibleConfig, pipeline: Pipeline) -> Result<(), CrucibleError> {
    let state = AppState::new(pipeline.with_grace(config.sweep.grace()));
    let router = create_router(
        state.clone(),
        build_cors_layer(config.server.cors_origins.as_deref()),
    );

    let cancel = CancellationToken::new();
    let sweep = spawn_sweep(Arc::clone(&state.pipeline), &config.sweep, cancel.clone());

    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| CrucibleError::IoError(format!("Bind failed: {}", e)))?;

    tracing::info!("Crucible HTTP server listening on {}", addr);

    let shutdown = cancel.clone();
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("shutdown requested"),
                () = shutdown.cancelled() => {}
            }
        })
        .await
        .map_err(|e| CrucibleError::IoError(format!("Server error: {}", e)));

    cancel.cancel();
    if let Err(e) = sweep.await {
        tracing::error!("promotion sweep task failed: {}", e);
    }
    served
}
