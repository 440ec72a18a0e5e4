/**
 * HTTP surface
 * JSON endpoints in front of the biometric service
 */

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::biometric::{BiometricService, EnrollmentReceipt, EnrollmentRequest, MatchDecision, RejectReason};
use crate::error::{ErrorKind, FaceError};
use crate::extractor::ImagePayload;

pub const SERVICE_NAME: &str = "facematch-server";

// raised from axum's 2 MB default for base64 image payloads
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub biometric: Arc<BiometricService>,
}

pub struct ApiError(FaceError);

impl From<FaceError> for ApiError {
    fn from(err: FaceError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match &self.0 {
            FaceError::ExtractionTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            FaceError::ExtractorUnavailable(_) => StatusCode::BAD_GATEWAY,
            FaceError::AlreadyEnrolled(_) => StatusCode::CONFLICT,
            FaceError::IdentityNotFound(_) => StatusCode::NOT_FOUND,
            err => match err.kind() {
                ErrorKind::Input | ErrorKind::Crypto | ErrorKind::DimensionMismatch => {
                    StatusCode::BAD_REQUEST
                }
                ErrorKind::Extraction => StatusCode::UNPROCESSABLE_ENTITY,
                ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.0.kind() == ErrorKind::Internal {
            error!("Request failed with internal error: {:?}", self.0);
        }
        let body = serde_json::json!({
            "success": false,
            "error": self.0.public_message(),
        });
        (self.status_code(), Json(body)).into_response()
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    model: String,
    timestamp: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtractFeaturesRequest {
    image_data: Option<String>,
    image_type: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExtractFeaturesResponse {
    success: bool,
    face_encoding: String,
    faces_detected: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompareFacesRequest {
    face_encoding1: Option<String>,
    face_encoding2: Option<String>,
}

#[derive(Serialize)]
struct CompareFacesResponse {
    success: bool,
    confidence: f64,
    similarity: f64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchCompareRequest {
    target_encoding: Option<String>,
    // object order is the tie-break order, so keep it (serde_json preserve_order)
    stored_encodings: Option<Map<String, Value>>,
    threshold: Option<f64>,
}

#[derive(Serialize)]
struct BatchResult {
    id: String,
    confidence: f64,
    similarity: f64,
}

#[derive(Serialize)]
struct SkippedResult {
    id: String,
    error: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchCompareResponse {
    success: bool,
    results: Vec<BatchResult>,
    skipped: Vec<SkippedResult>,
    best_match: Option<BatchResult>,
    total_comparisons: usize,
    threshold: f64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnrollBody {
    identity_id: Option<String>,
    display_name: Option<String>,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
    image_data: Option<String>,
    image_type: Option<String>,
}

#[derive(Serialize)]
struct EnrollResponse {
    success: bool,
    #[serde(flatten)]
    receipt: EnrollmentReceipt,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthenticateBody {
    image_data: Option<String>,
    image_type: Option<String>,
}

#[derive(Serialize)]
struct AuthenticateResponse {
    success: bool,
    #[serde(flatten)]
    decision: MatchDecision,
}

pub fn router(biometric: Arc<BiometricService>) -> Router {
    let state = AppState { biometric };

    Router::new()
        .route("/health", get(health))
        .route("/extract-features", post(extract_features))
        .route("/compare-faces", post(compare_faces))
        .route("/batch-compare", post(batch_compare))
        .route("/enroll", post(enroll))
        .route("/authenticate", post(authenticate))
        .route("/identities/:id/revoke", post(revoke))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: SERVICE_NAME,
        model: state.biometric.model_name().to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

async fn extract_features(
    State(state): State<AppState>,
    Json(request): Json<ExtractFeaturesRequest>,
) -> Result<Json<ExtractFeaturesResponse>, ApiError> {
    let image_data = request
        .image_data
        .ok_or_else(|| FaceError::Input("No image data provided".into()))?;
    let image = ImagePayload::decode(&image_data, request.image_type.as_deref().unwrap_or("base64"))?;

    let extracted = state.biometric.extract_template(&image).await?;

    Ok(Json(ExtractFeaturesResponse {
        success: true,
        face_encoding: extracted.template.encode(),
        faces_detected: extracted.faces_detected,
    }))
}

async fn compare_faces(
    State(state): State<AppState>,
    Json(request): Json<CompareFacesRequest>,
) -> Result<Json<CompareFacesResponse>, ApiError> {
    let (Some(first), Some(second)) = (request.face_encoding1, request.face_encoding2) else {
        return Err(FaceError::Input("Both face encodings required".into()).into());
    };

    let result = state.biometric.compare_templates(&first, &second)?;

    Ok(Json(CompareFacesResponse {
        success: true,
        confidence: result.confidence,
        similarity: result.similarity,
    }))
}

async fn batch_compare(
    State(state): State<AppState>,
    Json(request): Json<BatchCompareRequest>,
) -> Result<Json<BatchCompareResponse>, ApiError> {
    let (Some(target), Some(stored)) = (request.target_encoding, request.stored_encodings) else {
        return Err(
            FaceError::Input("Target encoding and stored encodings required".into()).into(),
        );
    };

    // a non-string entry cannot parse, so it ends up skipped like any bad template
    let stored = stored
        .into_iter()
        .map(|(id, value)| (id, value.as_str().unwrap_or_default().to_string()))
        .collect();
    let threshold = request.threshold.unwrap_or(0.0);

    let report = state
        .biometric
        .batch_compare(&target, stored, threshold)
        .await?;

    let results: Vec<BatchResult> = report
        .scored()
        .map(|(r, c)| BatchResult {
            id: r.identity.clone(),
            confidence: c.confidence,
            similarity: c.similarity,
        })
        .collect();
    let skipped = report
        .skipped()
        .map(|(r, error)| SkippedResult {
            id: r.identity.clone(),
            error: error.to_string(),
        })
        .collect();
    let best_match = report.selected.as_ref().map(|s| BatchResult {
        id: s.identity.clone(),
        confidence: s.confidence,
        similarity: s.similarity,
    });

    Ok(Json(BatchCompareResponse {
        success: true,
        total_comparisons: results.len(),
        results,
        skipped,
        best_match,
        threshold,
    }))
}

async fn enroll(
    State(state): State<AppState>,
    Json(body): Json<EnrollBody>,
) -> Result<(StatusCode, Json<EnrollResponse>), ApiError> {
    let identity = body
        .identity_id
        .ok_or_else(|| FaceError::Input("identityId is required".into()))?;
    let image_data = body
        .image_data
        .ok_or_else(|| FaceError::Input("Face image is required".into()))?;
    let image = ImagePayload::decode(&image_data, body.image_type.as_deref().unwrap_or("base64"))?;

    let request = EnrollmentRequest {
        display_name: body.display_name.unwrap_or_else(|| identity.clone()),
        identity,
        attributes: body.attributes,
    };
    let receipt = state.biometric.enroll(request, &image).await?;

    Ok((
        StatusCode::CREATED,
        Json(EnrollResponse {
            success: true,
            receipt,
        }),
    ))
}

async fn authenticate(
    State(state): State<AppState>,
    Json(body): Json<AuthenticateBody>,
) -> (StatusCode, Json<AuthenticateResponse>) {
    let decision = state
        .biometric
        .authenticate_encoded(
            body.image_data.as_deref().unwrap_or_default(),
            body.image_type.as_deref().unwrap_or("base64"),
        )
        .await;

    let status = match decision.reason() {
        None => StatusCode::OK,
        Some(RejectReason::InvalidInput) => StatusCode::BAD_REQUEST,
        Some(RejectReason::Internal) => StatusCode::INTERNAL_SERVER_ERROR,
        Some(_) => StatusCode::UNAUTHORIZED,
    };

    (
        status,
        Json(AuthenticateResponse {
            success: decision.accepted(),
            decision,
        }),
    )
}

async fn revoke(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.biometric.revoke(&id)?;
    info!("Revocation request completed for {}", id);
    Ok(Json(serde_json::json!({
        "success": true,
        "identityId": id,
    })))
}
