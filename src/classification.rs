use crate::{
    decoder::{DecodeError, ImageDecoder},
    model_service::{InferenceError, ModelService, Prediction},
    tensor::{TensorBuilder, TensorError},
};
use bytes::Bytes;
use indexmap::IndexMap;
use std::sync::Arc;
use thiserror::Error;

/// Label to probability, in the order labels were first produced by the model.
pub type ClassificationResult = IndexMap<String, f32>;

#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error("classification task did not complete: {0}")]
    Task(String),
}

/// Later duplicates overwrite earlier values without moving the key.
pub fn fold_predictions(predictions: Vec<Prediction>) -> ClassificationResult {
    predictions
        .into_iter()
        .fold(ClassificationResult::new(), |mut result, prediction| {
            result.insert(prediction.class_name, prediction.probability);
            result
        })
}

#[derive(Clone)]
pub struct ClassificationService {
    decoder: ImageDecoder,
    builder: TensorBuilder,
    model_service: Arc<dyn ModelService>,
}

impl ClassificationService {
    /// Fails when the builder would feed the model a dtype it does not declare.
    pub fn new(
        decoder: ImageDecoder,
        builder: TensorBuilder,
        model_service: Arc<dyn ModelService>,
    ) -> Result<Self, TensorError> {
        builder.ensure_matches(model_service.input_dtype())?;

        Ok(Self {
            decoder,
            builder,
            model_service,
        })
    }

    pub fn classify_blocking(
        &self,
        image_data: &[u8],
    ) -> Result<ClassificationResult, ClassifyError> {
        let decoded = self.decoder.decode(image_data)?;
        tracing::debug!(
            "Decoded {}x{} image with {} channels",
            decoded.width(),
            decoded.height(),
            decoded.channels()
        );

        let tensor = self.builder.build(&decoded);
        drop(decoded);

        let predictions = self.model_service.classify(&tensor)?;
        tracing::debug!("Model returned {} predictions", predictions.len());

        Ok(fold_predictions(predictions))
    }

    /// Decode and inference are CPU bound, so they run on the blocking pool.
    pub async fn classify(
        &self,
        image_data: Bytes,
    ) -> Result<ClassificationResult, ClassifyError> {
        let service = self.clone();
        tokio::task::spawn_blocking(move || service.classify_blocking(&image_data))
            .await
            .map_err(|e| ClassifyError::Task(e.to_string()))?
    }
}
