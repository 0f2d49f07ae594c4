//! ONNX models executed with tract (pure Rust, no native runtime needed).

use std::path::Path;

use ndarray::Array4;
use tract_onnx::prelude::*;

use super::{ClassificationModel, ModelError, SegmentationModel, mask_from_raw};

type RunnablePlan =
    RunnableModel<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// An optimized ONNX graph. The plan is immutable once built, so one instance
/// serves every request concurrently.
pub struct OnnxModel {
    plan: RunnablePlan,
    input_shape: [usize; 4],
}

impl OnnxModel {
    pub fn load(path: &Path, input_size: (u32, u32)) -> Result<Self, ModelError> {
        let (width, height) = input_size;
        let input_shape = [1, 3, height as usize, width as usize];

        let plan = tract_onnx::onnx()
            .model_for_path(path)
            .map_err(|e| load_error(path, e))?
            .with_input_fact(0, f32::fact(input_shape).into())
            .map_err(|e| load_error(path, e))?
            .into_optimized()
            .map_err(|e| load_error(path, e))?
            .into_runnable()
            .map_err(|e| load_error(path, e))?;

        log::info!("Tract model ready: {} (input {:?})", path.display(), input_shape);
        Ok(Self { plan, input_shape })
    }

    fn run(&self, input: &Array4<f32>) -> Result<(Vec<usize>, Vec<f32>), ModelError> {
        if input.shape() != &self.input_shape[..] {
            return Err(ModelError::shape(
                format!("{:?}", self.input_shape),
                input.shape(),
            ));
        }
        let data: Vec<f32> = input.iter().copied().collect();
        let tensor = Tensor::from_shape(input.shape(), &data)
            .map_err(|e| ModelError::backend(e.to_string()))?;

        let outputs = self
            .plan
            .run(tvec!(tensor.into()))
            .map_err(|e| ModelError::backend(format!("Tract inference failed: {e}")))?;
        let output = outputs
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::backend("Model produced no outputs"))?;

        let values = output
            .as_slice::<f32>()
            .map_err(|e| ModelError::backend(format!("Unexpected output type: {e}")))?;
        Ok((output.shape().to_vec(), values.to_vec()))
    }
}

fn load_error(path: &Path, err: impl std::fmt::Display) -> ModelError {
    ModelError::Load {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}

impl ClassificationModel for OnnxModel {
    fn forward(&self, input: &Array4<f32>) -> Result<Vec<f32>, ModelError> {
        let (shape, logits) = self.run(input)?;
        log::debug!("Tract logits shape {:?}", shape);
        Ok(logits)
    }
}

impl SegmentationModel for OnnxModel {
    fn segment(&self, input: &Array4<f32>) -> Result<Array4<f32>, ModelError> {
        let (shape, values) = self.run(input)?;
        mask_from_raw(&shape, values)
    }
}
