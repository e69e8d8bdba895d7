use crate::{
    config::ModelConfig,
    model_service::{InferenceError, ModelService, Prediction},
    tensor::{ClassifierTensor, TensorDtype},
};
use image::imageops::{self, FilterType};
use ndarray::{Array, Ix4};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    tensor::TensorElementType,
    value::TensorRef,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex,
};

/// Resample the tensor to the model's square input and lay it out as
/// NHWC floats in [0, 1] with a batch of one.
fn prepare_input(
    tensor: &ClassifierTensor,
    input_size: u32,
) -> Result<Array<f32, Ix4>, InferenceError> {
    let rgb = tensor.to_rgb_image().ok_or_else(|| {
        InferenceError::Input(format!(
            "tensor of shape {:?} is not a valid RGB image",
            tensor.shape()
        ))
    })?;
    let img = imageops::resize(&rgb, input_size, input_size, FilterType::Triangle);

    let size = input_size as usize;
    let mut input = Array::zeros((1, size, size, 3));
    for (x, y, pixel) in img.enumerate_pixels() {
        let x = x as usize;
        let y = y as usize;
        let [r, g, b] = pixel.0;
        input[[0, y, x, 0]] = (r as f32) / 255.;
        input[[0, y, x, 1]] = (g as f32) / 255.;
        input[[0, y, x, 2]] = (b as f32) / 255.;
    }

    Ok(input)
}

/// The session only ever receives tensors from a builder of the declared dtype.
fn check_tensor_dtype(
    expected: TensorDtype,
    tensor: &ClassifierTensor,
) -> Result<(), InferenceError> {
    if tensor.dtype() != expected {
        return Err(InferenceError::Input(format!(
            "expected a {} tensor, got {}",
            expected,
            tensor.dtype()
        )));
    }
    Ok(())
}

/// `prepare_input` always produces `f32`, so the model's first input must take it.
fn check_model_input(input_type: Option<TensorElementType>) -> anyhow::Result<()> {
    match input_type {
        Some(TensorElementType::Float32) => Ok(()),
        other => Err(anyhow::anyhow!(
            "model input must be a float32 tensor, found {:?}",
            other
        )),
    }
}

fn softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Pair scores with labels, best first, keeping at most `top_k`.
fn top_k_predictions(
    scores: &[f32],
    labels: &[String],
    top_k: usize,
) -> Result<Vec<Prediction>, InferenceError> {
    if scores.len() != labels.len() {
        return Err(InferenceError::LabelMismatch {
            scores: scores.len(),
            labels: labels.len(),
        });
    }

    let mut predictions: Vec<Prediction> = labels
        .iter()
        .zip(scores)
        .map(|(label, &score)| Prediction::new(label.clone(), score))
        .collect();
    predictions.sort_by(|a, b| b.probability.total_cmp(&a.probability));
    predictions.truncate(top_k);

    Ok(predictions)
}

pub struct OrtModelService {
    sessions: Vec<Mutex<Session>>,
    counter: AtomicUsize,
    output_name: String,
    input_size: u32,
    input_dtype: TensorDtype,
    labels: Vec<String>,
    top_k: usize,
    apply_softmax: bool,
}

impl OrtModelService {
    pub fn new(model_config: &ModelConfig) -> anyhow::Result<Self> {
        ort::init().with_name("image_classifier").commit()?;

        let input_dtype = TensorDtype::try_from(model_config.input_dtype.as_str())?;
        let num_sessions = model_config.session_count();
        let sessions = (0..num_sessions)
            .map(|_| {
                let session = Session::builder()?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?
                    .commit_from_file(model_config.get_path())?;
                Ok(session)
            })
            .collect::<Result<Vec<_>, ort::Error>>()?;

        check_model_input(
            sessions
                .first()
                .and_then(|session| session.inputs.first())
                .and_then(|input| input.input_type.tensor_type()),
        )?;

        let output_name = match &model_config.output_name {
            Some(name) => name.clone(),
            None => sessions
                .first()
                .and_then(|session| session.outputs.first())
                .map(|output| output.name.clone())
                .ok_or_else(|| anyhow::anyhow!("model declares no outputs"))?,
        };

        tracing::info!(
            "Loaded {} from {:?} into {} ONNX session(s), {}x{} input, reading `{}`",
            model_config.name.as_str(),
            model_config.get_path(),
            num_sessions,
            model_config.get_input_size(),
            model_config.get_input_size(),
            output_name
        );

        Ok(Self {
            sessions: sessions.into_iter().map(Mutex::new).collect(),
            counter: AtomicUsize::new(0),
            output_name,
            input_size: model_config.get_input_size(),
            input_dtype,
            labels: model_config.labels.clone(),
            top_k: model_config.top_k,
            apply_softmax: model_config.apply_softmax,
        })
    }

    fn run_inference(&self, input: &Array<f32, Ix4>) -> Result<Vec<f32>, InferenceError> {
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % self.sessions.len();
        let mut session = self.sessions[index]
            .lock()
            .map_err(|e| InferenceError::Poisoned(e.to_string()))?;

        tracing::debug!("Handling request with session {}", index);

        let tensor_ref = TensorRef::from_array_view(input.view())
            .map_err(|e| InferenceError::Input(format!("failed to build tensor: {}", e)))?;

        let outputs = session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| InferenceError::Session(e.to_string()))?;

        let output = outputs.get(&self.output_name).ok_or_else(|| {
            InferenceError::Session(format!("model has no output named `{}`", self.output_name))
        })?;
        let (_shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| InferenceError::Session(format!("failed to extract tensor: {}", e)))?;

        Ok(data.to_vec())
    }
}

impl ModelService for OrtModelService {
    fn input_dtype(&self) -> TensorDtype {
        self.input_dtype
    }

    fn classify(&self, tensor: &ClassifierTensor) -> Result<Vec<Prediction>, InferenceError> {
        check_tensor_dtype(self.input_dtype, tensor)?;
        let input = prepare_input(tensor, self.input_size)?;
        let scores = self.run_inference(&input)?;
        let scores = if self.apply_softmax {
            softmax(&scores)
        } else {
            scores
        };

        top_k_predictions(&scores, &self.labels, self.top_k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{DecodedImage, DECODED_CHANNELS};
    use crate::tensor::TensorBuilder;

    fn labels() -> Vec<String> {
        ["Drawing", "Hentai", "Neutral", "Porn", "Sexy"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_prepare_input() {
        let decoded = DecodedImage::new(
            4,
            2,
            DECODED_CHANNELS,
            [255, 0, 0, 0].repeat(8),
        )
        .unwrap();
        let tensor = TensorBuilder::new(TensorDtype::Int32).build(&decoded);

        let input = prepare_input(&tensor, 8).unwrap();

        assert_eq!(input.shape(), &[1, 8, 8, 3]);
        assert_eq!(input[[0, 3, 5, 0]], 1.);
        assert_eq!(input[[0, 3, 5, 1]], 0.);
        assert_eq!(input[[0, 7, 7, 2]], 0.);
    }

    #[test]
    fn test_prepare_input_normalized_tensor() {
        let decoded = DecodedImage::new(1, 1, DECODED_CHANNELS, vec![0, 255, 0, 9]).unwrap();
        let tensor = TensorBuilder::new(TensorDtype::NormalizedFloat32).build(&decoded);

        let input = prepare_input(&tensor, 2).unwrap();

        assert_eq!(input[[0, 1, 1, 1]], 1.);
    }

    #[test]
    fn test_top_k_sorted_and_truncated() {
        let scores = [0.1, 0.05, 0.6, 0.05, 0.2];

        let predictions = top_k_predictions(&scores, &labels(), 3).unwrap();

        let names: Vec<_> = predictions.iter().map(|p| p.class_name.as_str()).collect();
        assert_eq!(names, vec!["Neutral", "Sexy", "Drawing"]);
        assert_eq!(predictions[0].probability, 0.6);
    }

    #[test]
    fn test_top_k_label_mismatch() {
        let result = top_k_predictions(&[0.5, 0.5], &labels(), 5);
        assert!(matches!(
            result,
            Err(InferenceError::LabelMismatch {
                scores: 2,
                labels: 5
            })
        ));
    }

    #[test]
    fn test_tensor_dtype_must_match_declared_input() {
        let decoded = DecodedImage::new(1, 1, DECODED_CHANNELS, vec![1, 2, 3, 4]).unwrap();
        let tensor = TensorBuilder::new(TensorDtype::Float32).build(&decoded);

        assert!(check_tensor_dtype(TensorDtype::Float32, &tensor).is_ok());
        assert!(matches!(
            check_tensor_dtype(TensorDtype::Int32, &tensor),
            Err(InferenceError::Input(_))
        ));
    }

    #[test]
    fn test_model_input_must_be_float32() {
        assert!(check_model_input(Some(TensorElementType::Float32)).is_ok());
        assert!(check_model_input(Some(TensorElementType::Int32)).is_err());
        assert!(check_model_input(None).is_err());
    }

    #[test]
    fn test_softmax() {
        let probabilities = softmax(&[1.0, 2.0, 3.0]);

        let sum: f32 = probabilities.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(probabilities[2] > probabilities[1]);
        assert!(probabilities[1] > probabilities[0]);
    }
}
