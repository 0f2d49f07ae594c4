use image::RgbImage;
use image::imageops::{self, FilterType};
use ndarray::Array4;
use serde::{Deserialize, Serialize};

use crate::inference::ModelError;

/// Turns a decoded image into the tensor a particular model expects.
pub trait Preprocessor: Send + Sync {
    fn preprocess(&self, image: &RgbImage) -> Result<Array4<f32>, ModelError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResizeMethod {
    Nearest,
    #[default]
    Bilinear,
    Bicubic,
    Lanczos,
}

impl From<ResizeMethod> for FilterType {
    fn from(method: ResizeMethod) -> Self {
        match method {
            ResizeMethod::Nearest => FilterType::Nearest,
            ResizeMethod::Bilinear => FilterType::Triangle,
            ResizeMethod::Bicubic => FilterType::CatmullRom,
            ResizeMethod::Lanczos => FilterType::Lanczos3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessingConfig {
    /// Target `[width, height]`.
    pub size: [u32; 2],
    pub resize_method: ResizeMethod,
    pub rescale: f32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            size: [224, 224],
            resize_method: ResizeMethod::Bilinear,
            rescale: 1.0 / 255.0,
            mean: [0.5, 0.5, 0.5],
            std: [0.5, 0.5, 0.5],
        }
    }
}

impl PreprocessingConfig {
    pub fn input_size(&self) -> (u32, u32) {
        (self.size[0], self.size[1])
    }
}

/// Resize, rescale and normalize into a `(1, 3, H, W)` tensor.
#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    config: PreprocessingConfig,
}

impl ImagePreprocessor {
    pub fn new(config: PreprocessingConfig) -> Self {
        Self { config }
    }
}

impl Preprocessor for ImagePreprocessor {
    fn preprocess(&self, image: &RgbImage) -> Result<Array4<f32>, ModelError> {
        let (width, height) = self.config.input_size();
        if image.width() == 0 || image.height() == 0 {
            return Err(ModelError::Preprocessing("image has no pixels".into()));
        }

        let resized;
        let source = if image.dimensions() == (width, height) {
            image
        } else {
            resized = imageops::resize(image, width, height, self.config.resize_method.into());
            &resized
        };

        let PreprocessingConfig {
            rescale, mean, std, ..
        } = self.config;
        let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
        for (x, y, pixel) in source.enumerate_pixels() {
            for channel in 0..3 {
                let value = f32::from(pixel[channel]) * rescale;
                tensor[[0, channel, y as usize, x as usize]] = (value - mean[channel]) / std[channel];
            }
        }
        Ok(tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn produces_nchw_tensor_at_configured_size() {
        let preprocessor = ImagePreprocessor::new(PreprocessingConfig {
            size: [32, 16],
            ..PreprocessingConfig::default()
        });
        let image = RgbImage::from_pixel(100, 50, Rgb([10, 20, 30]));
        let tensor = preprocessor.preprocess(&image).unwrap();
        assert_eq!(tensor.dim(), (1, 3, 16, 32));
    }

    #[test]
    fn normalizes_each_channel_independently() {
        let preprocessor = ImagePreprocessor::new(PreprocessingConfig {
            size: [2, 2],
            ..PreprocessingConfig::default()
        });
        let image = RgbImage::from_pixel(2, 2, Rgb([255, 0, 51]));
        let tensor = preprocessor.preprocess(&image).unwrap();
        assert!((tensor[[0, 0, 1, 1]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 0, 0]] + 1.0).abs() < 1e-6);
        assert!((tensor[[0, 2, 0, 1]] - (0.2 - 0.5) / 0.5).abs() < 1e-5);
    }

    #[test]
    fn does_not_touch_the_source_image() {
        let preprocessor = ImagePreprocessor::new(PreprocessingConfig::default());
        let image = RgbImage::from_pixel(8, 8, Rgb([1, 2, 3]));
        let before = image.clone();
        preprocessor.preprocess(&image).unwrap();
        assert_eq!(image, before);
    }
}
