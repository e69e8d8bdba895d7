use crate::tensor::{ClassifierTensor, TensorDtype};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub class_name: String,
    pub probability: f32,
}

impl Prediction {
    pub fn new(class_name: impl Into<String>, probability: f32) -> Self {
        Self {
            class_name: class_name.into(),
            probability,
        }
    }
}

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("failed to prepare model input: {0}")]
    Input(String),
    #[error("inference failed: {0}")]
    Session(String),
    #[error("model produced {scores} scores but {labels} labels are configured")]
    LabelMismatch { scores: usize, labels: usize },
    #[error("session mutex poisoned: {0}")]
    Poisoned(String),
}

/// A loaded, read-only classifier. Implementations must be safe to share
/// between in-flight requests; any serialization they need happens inside.
pub trait ModelService: Send + Sync + 'static {
    /// Element type of the tensors this capability accepts. Tensors of any
    /// other dtype are rejected by `classify`.
    fn input_dtype(&self) -> TensorDtype;

    fn classify(&self, tensor: &ClassifierTensor) -> Result<Vec<Prediction>, InferenceError>;
}
