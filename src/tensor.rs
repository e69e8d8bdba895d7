use crate::decoder::DecodedImage;
use image::RgbImage;
use ndarray::Array3;
use std::fmt;
use thiserror::Error;

/// Channels kept in a classifier tensor: R, G, B. Alpha never survives.
pub const TENSOR_CHANNELS: usize = 3;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TensorError {
    #[error(
        "{0} is not a supported tensor dtype. Use `int32`, `float32` or `normalized_float32`."
    )]
    UnknownDtype(String),
    #[error("tensor dtype mismatch: builder produces {builder}, model expects {model}")]
    DtypeMismatch {
        builder: TensorDtype,
        model: TensorDtype,
    },
}

/// Element type of a classifier tensor, as declared by the model's input contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorDtype {
    /// Raw 0..=255 samples as `i32`.
    Int32,
    /// Raw 0..=255 samples as `f32`.
    Float32,
    /// Samples divided by 255, in [0, 1].
    NormalizedFloat32,
}

impl TensorDtype {
    pub fn as_str(&self) -> &'static str {
        match self {
            TensorDtype::Int32 => "int32",
            TensorDtype::Float32 => "float32",
            TensorDtype::NormalizedFloat32 => "normalized_float32",
        }
    }
}

impl fmt::Display for TensorDtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for TensorDtype {
    type Error = TensorError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "int32" => Ok(Self::Int32),
            "float32" => Ok(Self::Float32),
            "normalized_float32" => Ok(Self::NormalizedFloat32),
            other => Err(TensorError::UnknownDtype(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Int32(Array3<i32>),
    Float32(Array3<f32>),
}

/// Height x width x 3 tensor in row-major, channel-interleaved order.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierTensor {
    dtype: TensorDtype,
    data: TensorData,
}

impl ClassifierTensor {
    pub fn dtype(&self) -> TensorDtype {
        self.dtype
    }

    #[cfg(test)]
    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn shape(&self) -> &[usize] {
        match &self.data {
            TensorData::Int32(array) => array.shape(),
            TensorData::Float32(array) => array.shape(),
        }
    }

    pub fn height(&self) -> usize {
        self.shape()[0]
    }

    pub fn width(&self) -> usize {
        self.shape()[1]
    }

    /// Back to 8-bit RGB, undoing any normalization. Used by model
    /// backends that need to resample before inference.
    pub fn to_rgb_image(&self) -> Option<RgbImage> {
        let samples: Vec<u8> = match (&self.data, self.dtype) {
            (TensorData::Int32(array), _) => {
                array.iter().map(|&v| v.clamp(0, 255) as u8).collect()
            }
            (TensorData::Float32(array), TensorDtype::NormalizedFloat32) => array
                .iter()
                .map(|&v| (v * 255.).round().clamp(0., 255.) as u8)
                .collect(),
            (TensorData::Float32(array), _) => array
                .iter()
                .map(|&v| v.round().clamp(0., 255.) as u8)
                .collect(),
        };

        RgbImage::from_raw(self.width() as u32, self.height() as u32, samples)
    }
}

/// Drops the 4th channel and reshapes decoded pixels into the model's layout.
#[derive(Debug, Clone, Copy)]
pub struct TensorBuilder {
    dtype: TensorDtype,
}

impl TensorBuilder {
    pub fn new(dtype: TensorDtype) -> Self {
        Self { dtype }
    }

    /// Builder for a dtype named in configuration. Unknown names fail here,
    /// at startup, rather than producing silently wrong tensors later.
    pub fn from_name(dtype: &str) -> Result<Self, TensorError> {
        Ok(Self::new(TensorDtype::try_from(dtype)?))
    }

    pub fn dtype(&self) -> TensorDtype {
        self.dtype
    }

    pub fn ensure_matches(&self, model: TensorDtype) -> Result<(), TensorError> {
        if self.dtype != model {
            return Err(TensorError::DtypeMismatch {
                builder: self.dtype,
                model,
            });
        }
        Ok(())
    }

    pub fn build(&self, decoded: &DecodedImage) -> ClassifierTensor {
        let height = decoded.height() as usize;
        let width = decoded.width() as usize;
        let stride = decoded.channels();
        let pixels = decoded.pixels();

        let sample = |(y, x, c): (usize, usize, usize)| pixels[(y * width + x) * stride + c];
        let shape = (height, width, TENSOR_CHANNELS);

        let data = match self.dtype {
            TensorDtype::Int32 => {
                TensorData::Int32(Array3::from_shape_fn(shape, |idx| i32::from(sample(idx))))
            }
            TensorDtype::Float32 => {
                TensorData::Float32(Array3::from_shape_fn(shape, |idx| f32::from(sample(idx))))
            }
            TensorDtype::NormalizedFloat32 => TensorData::Float32(Array3::from_shape_fn(
                shape,
                |idx| f32::from(sample(idx)) / 255.,
            )),
        };

        ClassifierTensor {
            dtype: self.dtype,
            data,
        }
    }
}
