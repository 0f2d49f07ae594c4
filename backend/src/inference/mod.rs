//! Model backends.
//!
//! The pipeline only sees the two capability traits below; which runtime
//! executes the network is decided once at startup by [`load_classification_model`]
//! and [`load_segmentation_model`].

#[cfg(feature = "tract")]
pub mod tract_backend;
#[cfg(feature = "torch")]
pub mod torch;

use ndarray::Array4;

use crate::config::{ModelBackend, ModelSpec};

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Failed to load model from {path}: {message}")]
    Load { path: String, message: String },
    #[error("Unexpected tensor shape: expected {expected}, got {actual:?}")]
    Shape { expected: String, actual: Vec<usize> },
    #[error("Preprocessing error: {0}")]
    Preprocessing(String),
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Backend `{0}` is not compiled into this build")]
    Unavailable(ModelBackend),
    #[cfg(feature = "torch")]
    #[error("Torch error: {0}")]
    Torch(#[from] tch::TchError),
}

impl ModelError {
    pub fn backend<S: Into<String>>(msg: S) -> Self {
        Self::Backend(msg.into())
    }

    pub fn shape<S: Into<String>>(expected: S, actual: &[usize]) -> Self {
        Self::Shape {
            expected: expected.into(),
            actual: actual.to_vec(),
        }
    }
}

/// A pretrained image classifier: NCHW tensor in, one logit per class out.
pub trait ClassificationModel: Send + Sync {
    fn forward(&self, input: &Array4<f32>) -> Result<Vec<f32>, ModelError>;
}

/// A pretrained foreground segmenter: NCHW tensor in, `(N, 1, H, W)` confidences out.
pub trait SegmentationModel: Send + Sync {
    fn segment(&self, input: &Array4<f32>) -> Result<Array4<f32>, ModelError>;
}

pub fn load_classification_model(
    spec: &ModelSpec,
    #[cfg_attr(not(feature = "tract"), allow(unused_variables))] input_size: (u32, u32),
) -> Result<Box<dyn ClassificationModel>, ModelError> {
    log::info!(
        "Loading classification model {} with {} backend",
        spec.path.display(),
        spec.backend
    );
    match spec.backend {
        #[cfg(feature = "tract")]
        ModelBackend::Tract => Ok(Box::new(tract_backend::OnnxModel::load(
            &spec.path, input_size,
        )?)),
        #[cfg(feature = "torch")]
        ModelBackend::Torch => Ok(Box::new(torch::TorchModel::load(&spec.path)?)),
        #[allow(unreachable_patterns)]
        other => Err(ModelError::Unavailable(other)),
    }
}

pub fn load_segmentation_model(
    spec: &ModelSpec,
    #[cfg_attr(not(feature = "tract"), allow(unused_variables))] input_size: (u32, u32),
) -> Result<Box<dyn SegmentationModel>, ModelError> {
    log::info!(
        "Loading segmentation model {} with {} backend",
        spec.path.display(),
        spec.backend
    );
    match spec.backend {
        #[cfg(feature = "tract")]
        ModelBackend::Tract => Ok(Box::new(tract_backend::OnnxModel::load(
            &spec.path, input_size,
        )?)),
        #[cfg(feature = "torch")]
        ModelBackend::Torch => Ok(Box::new(torch::TorchModel::load(&spec.path)?)),
        #[allow(unreachable_patterns)]
        other => Err(ModelError::Unavailable(other)),
    }
}

/// Reshape a flat `(N, 1, H, W)` buffer coming back from a runtime.
pub(crate) fn mask_from_raw(shape: &[usize], data: Vec<f32>) -> Result<Array4<f32>, ModelError> {
    let dims = match shape {
        [n, c, h, w] => (*n, *c, *h, *w),
        [n, h, w] => (*n, 1, *h, *w),
        _ => return Err(ModelError::shape("(N, 1, H, W)", shape)),
    };
    if dims.0 == 0 || dims.1 == 0 {
        return Err(ModelError::shape("(N, 1, H, W)", shape));
    }
    Array4::from_shape_vec(dims, data).map_err(|e| ModelError::backend(e.to_string()))
}
