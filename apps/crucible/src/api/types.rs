//! # API Request/Response Types
//!
//! JSON bodies that exist only at the HTTP boundary. Stage inputs and
//! results reuse the core types directly.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use crucible_core::{
    Actor, AdjustAction, CrucibleError, Flask, FlaskId, Metal, MovementFilter, ScrapReserve,
    Stage, Weight,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// =============================================================================
// HEALTH RESPONSE
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

// =============================================================================
// METAL CATALOGUE
// =============================================================================

/// One metal with the formula values the floor uses for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetalInfo {
    pub metal: Metal,
    pub casting_temp: u16,
    pub oven_temp: u16,
    pub quench_minutes: u32,
    pub reserve: Weight,
}

// =============================================================================
// STAGE ACTIONS
// =============================================================================

/// Body of actions that only need to know who is posting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorRequest {
    pub actor: Actor,
}

/// Query string of `GET /flasks/check`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlaskNumberQuery {
    pub number: String,
    pub date: NaiveDate,
}

/// Answer of `GET /flasks/check` when the number is still free.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlaskNumberCheck {
    pub available: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueResponse {
    pub stage: Stage,
    pub flasks: Vec<Flask>,
}

// =============================================================================
// SCRAP
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjustRequest {
    pub metal: Metal,
    pub action: AdjustAction,
    pub amount: Weight,
    pub actor: Actor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservesResponse {
    pub reserves: Vec<ScrapReserve>,
}

/// Query string of `GET /scrap/movements`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MovementQuery {
    /// Parsed like every other metal input, so `14y` works too.
    #[serde(default, deserialize_with = "metal_param")]
    pub metal: Option<Metal>,
    pub flask: Option<u64>,
    pub limit: Option<usize>,
}

fn metal_param<'de, D>(deserializer: D) -> Result<Option<Metal>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|raw| raw.parse::<Metal>().map_err(serde::de::Error::custom))
        .transpose()
}

impl From<MovementQuery> for MovementFilter {
    fn from(query: MovementQuery) -> Self {
        MovementFilter {
            metal: query.metal,
            flask: query.flask.map(FlaskId),
            limit: query.limit,
        }
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Error body returned by every endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// An error on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            body: ErrorResponse {
                success: false,
                error: message.into(),
                kind: "not_found".to_string(),
                details: None,
            },
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

/// HTTP status for each failure kind.
#[must_use]
pub fn status_for(error: &CrucibleError) -> StatusCode {
    match error {
        CrucibleError::ValidationError(_) => StatusCode::BAD_REQUEST,
        CrucibleError::NotFound(_) => StatusCode::NOT_FOUND,
        CrucibleError::PreconditionFailed { .. }
        | CrucibleError::Conflict(_)
        | CrucibleError::MissingUpstreamRecord { .. } => StatusCode::CONFLICT,
        CrucibleError::InsufficientReserve { .. } | CrucibleError::ToleranceExceeded { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        CrucibleError::SerializationError(_) | CrucibleError::IoError(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn details_for(error: &CrucibleError) -> Option<serde_json::Value> {
    match error {
        CrucibleError::PreconditionFailed {
            unit,
            expected,
            actual,
        } => Some(serde_json::json!({
            "unit": unit.to_string(),
            "expected": expected,
            "actual": actual,
        })),
        CrucibleError::InsufficientReserve {
            metal,
            requested,
            available,
        } => Some(serde_json::json!({
            "metal": metal,
            "requested": requested,
            "available": available,
        })),
        CrucibleError::ToleranceExceeded {
            check,
            computed,
            expected,
            low,
            high,
        } => Some(serde_json::json!({
            "check": check,
            "computed": computed.to_string(),
            "expected": expected.to_string(),
            "low": low.to_string(),
            "high": high.to_string(),
        })),
        CrucibleError::MissingUpstreamRecord { flask, stage } => Some(serde_json::json!({
            "flask": flask,
            "stage": stage,
        })),
        _ => None,
    }
}

impl From<CrucibleError> for ApiError {
    fn from(error: CrucibleError) -> Self {
        let status = status_for(&error);
        if status.is_server_error() {
            tracing::error!(error = %error, "request failed");
        }
        Self {
            status,
            body: ErrorResponse {
                success: false,
                error: error.to_string(),
                kind: error.kind().to_string(),
                details: details_for(&error),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
