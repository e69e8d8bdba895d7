use crate::{
    classification::{ClassificationResult, ClassifyError},
    decoder::DecodeError,
    model_service::InferenceError,
    server::SharedState,
};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use std::time::Instant;
use thiserror::Error;
use tracing::instrument;

const ROUTE: &str = "/classify";

#[derive(Error, Debug)]
pub enum ClassifyImageError {
    #[error("Image decoding failed: {0}")]
    Decode(DecodeError),
    #[error("Inference failed: {0}")]
    Inference(InferenceError),
    #[error("Classification task failed: {0}")]
    Task(String),
}

impl From<ClassifyError> for ClassifyImageError {
    fn from(err: ClassifyError) -> Self {
        match err {
            ClassifyError::Decode(e) => ClassifyImageError::Decode(e),
            ClassifyError::Inference(e) => ClassifyImageError::Inference(e),
            ClassifyError::Task(e) => ClassifyImageError::Task(e),
        }
    }
}

impl IntoResponse for ClassifyImageError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Something went wrong: {}", self),
        )
            .into_response()
    }
}

#[instrument(skip(state, image_data), fields(bytes = image_data.len()))]
pub async fn classify_image(
    State(state): State<SharedState>,
    image_data: Bytes,
) -> Result<Json<ClassificationResult>, ClassifyImageError> {
    let started = Instant::now();
    let result = state.classification_service.classify(image_data).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    state.metrics.record_classification_duration(elapsed_ms, ROUTE);

    match result {
        Ok(classification) => {
            tracing::debug!("Classified image in {} ms: {:?}", elapsed_ms, classification);
            state.metrics.record_request(ROUTE, StatusCode::OK.as_u16());
            Ok(Json(classification))
        }
        Err(err) => {
            tracing::error!("Classification failed after {} ms: {}", elapsed_ms, err);
            state
                .metrics
                .record_request(ROUTE, StatusCode::INTERNAL_SERVER_ERROR.as_u16());
            Err(err.into())
        }
    }
}
