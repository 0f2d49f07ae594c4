use std::path::Path;
use std::sync::Mutex;

use ndarray::Array4;
use tch::{CModule, Device, Kind, Tensor};

use super::{ClassificationModel, ModelError, SegmentationModel, mask_from_raw};

/// A TorchScript module. `CModule` is `Send` but not `Sync`, so calls are
/// serialized through a mutex; the weights themselves are never modified.
pub struct TorchModel {
    module: Mutex<CModule>,
    device: Device,
}

impl TorchModel {
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let device = Device::cuda_if_available();
        let module = CModule::load_on_device(path, device).map_err(|e| ModelError::Load {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        log::info!("TorchScript model ready: {} on {:?}", path.display(), device);
        Ok(Self {
            module: Mutex::new(module),
            device,
        })
    }

    fn run(&self, input: &Array4<f32>) -> Result<(Vec<usize>, Vec<f32>), ModelError> {
        let dims: Vec<i64> = input.shape().iter().map(|&d| d as i64).collect();
        let data: Vec<f32> = input.iter().copied().collect();
        let tensor = Tensor::from_slice(&data).view(dims.as_slice()).to_device(self.device);

        let module = self
            .module
            .lock()
            .map_err(|_| ModelError::backend("TorchScript module lock poisoned"))?;
        let output = tch::no_grad(|| module.forward_ts(&[tensor]))?;

        let shape = output.size().iter().map(|&d| d as usize).collect::<Vec<_>>();
        let output_flat = output.to_kind(Kind::Float).to_device(Device::Cpu).view([-1]);
        let num_elements = output_flat.size()[0] as usize;
        let mut output_vec = vec![0.0f32; num_elements];
        output_flat.copy_data(&mut output_vec, num_elements);
        Ok((shape, output_vec))
    }
}

impl ClassificationModel for TorchModel {
    fn forward(&self, input: &Array4<f32>) -> Result<Vec<f32>, ModelError> {
        self.run(input).map(|(_, logits)| logits)
    }
}

impl SegmentationModel for TorchModel {
    fn segment(&self, input: &Array4<f32>) -> Result<Array4<f32>, ModelError> {
        let (shape, values) = self.run(input)?;
        mask_from_raw(&shape, values)
    }
}
