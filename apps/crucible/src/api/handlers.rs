//! # API Endpoint Handlers
//!
//! Every handler moves its store work onto the blocking pool through
//! `with_pipeline` and returns the core result as JSON.

use super::{
    AppState,
    types::{
        ActorRequest, AdjustRequest, ApiError, FlaskNumberCheck, FlaskNumberQuery, HealthResponse,
        MetalInfo, MovementQuery, QueueResponse, ReservesResponse,
    },
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use crucible_core::{
    Bag, CastingCompletion, CrucibleError, CuttingInput, FlaskDossier, FlaskId, MetalPrepInput,
    MetalPrepRecord, MovementFilter, NewTree, Pipeline, QuenchingRecord,
    ReconciliationInput, ReconciliationRecord, ScrapMovement, Stage, SupplyInput, SupplyRecord,
    Transition, Tree, WaxingInput, WaxingRecord,
};
use std::sync::Arc;

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Run a synchronous pipeline call off the async runtime.
async fn with_pipeline<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Pipeline) -> Result<T, CrucibleError> + Send + 'static,
{
    let pipeline = Arc::clone(&state.pipeline);
    tokio::task::spawn_blocking(move || f(&pipeline))
        .await
        .map_err(|e| CrucibleError::IoError(format!("store worker failed: {e}")))?
        .map_err(ApiError::from)
}

// =============================================================================
// HEALTH & CATALOGUE
// =============================================================================

pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::default())
}

/// The metal catalogue with current reserve balances.
pub async fn metals_handler(State(state): State<AppState>) -> ApiResult<Vec<MetalInfo>> {
    let metals = with_pipeline(&state, |pipeline| {
        let store = pipeline.store();
        store
            .metals()?
            .into_iter()
            .map(|metal| {
                Ok(MetalInfo {
                    metal,
                    casting_temp: metal.casting_temperature(),
                    oven_temp: metal.oven_temperature(),
                    quench_minutes: metal.quench_minutes(),
                    reserve: store.reserve(metal)?,
                })
            })
            .collect::<Result<Vec<_>, CrucibleError>>()
    })
    .await?;
    Ok(Json(metals))
}

// =============================================================================
// TREES & WAXING
// =============================================================================

pub async fn create_tree_handler(
    State(state): State<AppState>,
    Json(request): Json<NewTree>,
) -> Result<(StatusCode, Json<Tree>), ApiError> {
    let tree = with_pipeline(&state, move |pipeline| pipeline.intake_tree(request)).await?;
    Ok((StatusCode::CREATED, Json(tree)))
}

pub async fn trees_in_transit_handler(State(state): State<AppState>) -> ApiResult<Vec<Tree>> {
    with_pipeline(&state, |pipeline| pipeline.store().trees_in_transit())
        .await
        .map(Json)
}

pub async fn waxing_handler(
    State(state): State<AppState>,
    Json(request): Json<WaxingInput>,
) -> Result<(StatusCode, Json<Transition<WaxingRecord>>), ApiError> {
    let transition = with_pipeline(&state, move |pipeline| pipeline.post_waxing(request)).await?;
    Ok((StatusCode::CREATED, Json(transition)))
}

// =============================================================================
// FLASK STAGES
// =============================================================================

/// Pre-check a flask number before investing: 200 when free, 409 when taken.
pub async fn check_flask_number_handler(
    State(state): State<AppState>,
    Query(query): Query<FlaskNumberQuery>,
) -> ApiResult<FlaskNumberCheck> {
    with_pipeline(&state, move |pipeline| {
        pipeline.store().check_flask_number(query.date, &query.number)
    })
    .await?;
    Ok(Json(FlaskNumberCheck { available: true }))
}

pub async fn flask_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<FlaskDossier> {
    with_pipeline(&state, move |pipeline| pipeline.store().dossier(FlaskId(id)))
        .await
        .map(Json)
}

pub async fn metal_prep_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(request): Json<MetalPrepInput>,
) -> ApiResult<Transition<MetalPrepRecord>> {
    with_pipeline(&state, move |pipeline| {
        pipeline.post_metal_prep(FlaskId(id), request)
    })
    .await
    .map(Json)
}

pub async fn supply_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(request): Json<SupplyInput>,
) -> ApiResult<Transition<SupplyRecord>> {
    with_pipeline(&state, move |pipeline| pipeline.post_supply(FlaskId(id), request))
        .await
        .map(Json)
}

pub async fn casting_complete_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(request): Json<ActorRequest>,
) -> ApiResult<Transition<CastingCompletion>> {
    with_pipeline(&state, move |pipeline| {
        pipeline.complete_casting(FlaskId(id), request.actor)
    })
    .await
    .map(Json)
}

pub async fn quenching_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(request): Json<ActorRequest>,
) -> ApiResult<Transition<QuenchingRecord>> {
    with_pipeline(&state, move |pipeline| {
        pipeline.post_quenching(FlaskId(id), request.actor)
    })
    .await
    .map(Json)
}

pub async fn cutting_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(request): Json<CuttingInput>,
) -> ApiResult<Transition<ReconciliationRecord>> {
    with_pipeline(&state, move |pipeline| pipeline.stage_cutting(FlaskId(id), request))
        .await
        .map(Json)
}

pub async fn reconciliation_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(request): Json<ReconciliationInput>,
) -> ApiResult<Transition<ReconciliationRecord>> {
    with_pipeline(&state, move |pipeline| {
        pipeline.confirm_reconciliation(FlaskId(id), request)
    })
    .await
    .map(Json)
}

// =============================================================================
// QUEUES & LOOKUP
// =============================================================================

/// Work queue of one stage, e.g. `GET /queue/metal-prep`.
pub async fn queue_handler(
    State(state): State<AppState>,
    Path(stage): Path<String>,
) -> ApiResult<QueueResponse> {
    let stage: Stage = stage.parse()?;
    let flasks = with_pipeline(&state, move |pipeline| pipeline.store().flasks_in_stage(stage))
        .await?;
    Ok(Json(QueueResponse { stage, flasks }))
}

pub async fn bag_handler(
    State(state): State<AppState>,
    Path(label): Path<String>,
) -> ApiResult<Bag> {
    let lookup = label.clone();
    with_pipeline(&state, move |pipeline| pipeline.store().bag(&lookup))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("bag '{label}' not found")))
}

// =============================================================================
// SCRAP
// =============================================================================

pub async fn reserves_handler(State(state): State<AppState>) -> ApiResult<ReservesResponse> {
    let reserves = with_pipeline(&state, |pipeline| pipeline.store().reserves()).await?;
    Ok(Json(ReservesResponse { reserves }))
}

pub async fn adjust_handler(
    State(state): State<AppState>,
    Json(request): Json<AdjustRequest>,
) -> ApiResult<ScrapMovement> {
    with_pipeline(&state, move |pipeline| {
        pipeline.adjust_reserve(request.metal, request.action, request.amount, request.actor)
    })
    .await
    .map(Json)
}

pub async fn movements_handler(
    State(state): State<AppState>,
    Query(query): Query<MovementQuery>,
) -> ApiResult<Vec<ScrapMovement>> {
    let filter = MovementFilter::from(query);
    with_pipeline(&state, move |pipeline| pipeline.store().movements(&filter))
        .await
        .map(Json)
}
