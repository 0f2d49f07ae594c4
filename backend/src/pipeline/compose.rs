//! Background removal: segmentation mask -> alpha channel -> PNG data URI.

use std::io::Cursor;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageBuffer, ImageFormat, Luma, RgbImage, Rgba, RgbaImage};
use ndarray::Array4;
use serde::{Deserialize, Serialize};

use super::preprocess::Preprocessor;
use crate::error::PipelineError;
use crate::inference::{ModelError, SegmentationModel};

pub const DEFAULT_THRESHOLD: f32 = 0.5;

fn default_threshold() -> f32 {
    DEFAULT_THRESHOLD
}

/// How mask confidences become alpha values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum MaskMode {
    /// `confidence > threshold` is opaque, everything else transparent.
    Binary {
        #[serde(default = "default_threshold")]
        threshold: f32,
    },
    /// Alpha proportional to confidence.
    Continuous,
}

impl Default for MaskMode {
    fn default() -> Self {
        MaskMode::Binary {
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl MaskMode {
    fn alpha(self, confidence: f32) -> u8 {
        match self {
            MaskMode::Binary { threshold } => {
                if confidence > threshold {
                    255
                } else {
                    0
                }
            }
            MaskMode::Continuous => (confidence.clamp(0.0, 1.0) * 255.0).round() as u8,
        }
    }
}

/// Per-pixel foreground confidence in `[0, 1]`, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationMask {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl SegmentationMask {
    pub fn new(width: u32, height: u32, data: Vec<f32>) -> Result<Self, ModelError> {
        if data.len() != width as usize * height as usize {
            return Err(ModelError::shape(
                format!("{width}x{height} mask"),
                &[data.len()],
            ));
        }
        let data = data.into_iter().map(|v| v.clamp(0.0, 1.0)).collect();
        Ok(Self {
            width,
            height,
            data,
        })
    }

    #[cfg(test)]
    pub fn filled(width: u32, height: u32, confidence: f32) -> Self {
        Self {
            width,
            height,
            data: vec![confidence.clamp(0.0, 1.0); width as usize * height as usize],
        }
    }

    /// Resample a `(1, 1, H, W)` model output to `width x height`.
    pub fn from_model_output(
        output: &Array4<f32>,
        width: u32,
        height: u32,
    ) -> Result<Self, ModelError> {
        let (batch, channels, mask_h, mask_w) = output.dim();
        if batch != 1 || channels != 1 || mask_h == 0 || mask_w == 0 {
            return Err(ModelError::shape("(N, 1, H, W)", output.shape()));
        }

        let raw: Vec<f32> = output.iter().map(|v| v.clamp(0.0, 1.0)).collect();
        let buffer: ImageBuffer<Luma<f32>, Vec<f32>> =
            ImageBuffer::from_raw(mask_w as u32, mask_h as u32, raw)
                .ok_or_else(|| ModelError::shape("(N, 1, H, W)", output.shape()))?;

        let resized = if (mask_w as u32, mask_h as u32) == (width, height) {
            buffer
        } else {
            imageops::resize(&buffer, width, height, FilterType::Triangle)
        };
        Self::new(width, height, resized.into_raw())
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn confidence(&self, x: u32, y: u32) -> f32 {
        self.data
            .get(y as usize * self.width as usize + x as usize)
            .copied()
            .unwrap_or(0.0)
    }
}

/// Append an alpha channel derived from `mask`; color values are copied as-is.
pub fn apply_mask(
    image: &RgbImage,
    mask: &SegmentationMask,
    mode: MaskMode,
) -> Result<RgbaImage, ModelError> {
    if image.dimensions() != mask.dimensions() {
        let (w, h) = mask.dimensions();
        return Err(ModelError::shape(
            format!("{}x{} mask", image.width(), image.height()),
            &[h as usize, w as usize],
        ));
    }
    Ok(RgbaImage::from_fn(image.width(), image.height(), |x, y| {
        let [r, g, b] = image.get_pixel(x, y).0;
        Rgba([r, g, b, mode.alpha(mask.confidence(x, y))])
    }))
}

/// A text-transportable image, e.g. `data:image/png;base64,...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage(String);

impl EncodedImage {
    pub fn into_string(self) -> String {
        self.0
    }
}

/// PNG keeps the alpha channel; lossy formats would drop it.
pub fn encode_png_data_uri(image: &RgbaImage) -> Result<EncodedImage, image::ImageError> {
    let mut png = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(image.clone()).write_to(&mut png, ImageFormat::Png)?;
    let payload = STANDARD.encode(png.into_inner());
    Ok(EncodedImage(format!("data:image/png;base64,{payload}")))
}

pub struct OutputComposer {
    preprocessor: Box<dyn Preprocessor>,
    model: Box<dyn SegmentationModel>,
    mode: MaskMode,
}

impl OutputComposer {
    pub fn new(
        preprocessor: Box<dyn Preprocessor>,
        model: Box<dyn SegmentationModel>,
        mode: MaskMode,
    ) -> Self {
        Self {
            preprocessor,
            model,
            mode,
        }
    }

    pub fn remove_background(&self, image: &RgbImage) -> Result<RgbaImage, PipelineError> {
        let tensor = self
            .preprocessor
            .preprocess(image)
            .map_err(|e| PipelineError::segmentation("could not prepare segmentation input", e))?;
        let output = self
            .model
            .segment(&tensor)
            .map_err(|e| PipelineError::segmentation("segmentation model failed", e))?;
        let mask = SegmentationMask::from_model_output(&output, image.width(), image.height())
            .map_err(|e| PipelineError::segmentation("unusable segmentation output", e))?;
        apply_mask(image, &mask, self.mode)
            .map_err(|e| PipelineError::segmentation("mask does not match image", e))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pipeline::decode::{ImageInput, decode};
    use crate::pipeline::preprocess::{ImagePreprocessor, PreprocessingConfig};
    use image::Rgb;

    /// Emits the same confidence for every pixel of a fixed-size output.
    pub(crate) struct ConstantMask {
        pub confidence: f32,
        pub size: usize,
    }

    impl SegmentationModel for ConstantMask {
        fn segment(&self, _input: &Array4<f32>) -> Result<Array4<f32>, ModelError> {
            Ok(Array4::from_elem((1, 1, self.size, self.size), self.confidence))
        }
    }

    /// Foreground on the left half of the model output.
    struct LeftHalf;

    impl SegmentationModel for LeftHalf {
        fn segment(&self, input: &Array4<f32>) -> Result<Array4<f32>, ModelError> {
            let (_, _, h, w) = input.dim();
            Ok(Array4::from_shape_fn((1, 1, h, w), |(_, _, _, x)| {
                if x < w / 2 { 1.0 } else { 0.0 }
            }))
        }
    }

    pub(crate) struct BrokenSegmenter;

    impl SegmentationModel for BrokenSegmenter {
        fn segment(&self, _input: &Array4<f32>) -> Result<Array4<f32>, ModelError> {
            Err(ModelError::backend("out of memory"))
        }
    }

    pub(crate) fn composer(model: impl SegmentationModel + 'static) -> OutputComposer {
        OutputComposer::new(
            Box::new(ImagePreprocessor::new(PreprocessingConfig {
                size: [32, 32],
                ..PreprocessingConfig::default()
            })),
            Box::new(model),
            MaskMode::default(),
        )
    }

    fn sample_image(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| Rgb([x as u8, y as u8, 200]))
    }

    fn alphas(image: &RgbaImage) -> Vec<u8> {
        image.pixels().map(|p| p.0[3]).collect()
    }

    #[test]
    fn all_foreground_mask_is_fully_opaque() {
        let image = sample_image(6, 4);
        let result = apply_mask(&image, &SegmentationMask::filled(6, 4, 1.0), MaskMode::default())
            .unwrap();
        assert!(alphas(&result).iter().all(|&a| a == 255));
    }

    #[test]
    fn all_background_mask_is_fully_transparent() {
        let image = sample_image(6, 4);
        let result = apply_mask(&image, &SegmentationMask::filled(6, 4, 0.0), MaskMode::default())
            .unwrap();
        assert!(alphas(&result).iter().all(|&a| a == 0));
    }

    #[test]
    fn colors_are_untouched_by_compositing() {
        let image = sample_image(5, 5);
        let result = apply_mask(&image, &SegmentationMask::filled(5, 5, 0.0), MaskMode::default())
            .unwrap();
        for (x, y, pixel) in image.enumerate_pixels() {
            assert_eq!(&result.get_pixel(x, y).0[..3], &pixel.0[..]);
        }
    }

    #[test]
    fn binary_threshold_is_strictly_greater_than() {
        let image = sample_image(3, 1);
        let mask = SegmentationMask::new(3, 1, vec![0.49, 0.5, 0.51]).unwrap();
        let result = apply_mask(&image, &mask, MaskMode::default()).unwrap();
        assert_eq!(alphas(&result), [0, 0, 255]);
    }

    #[test]
    fn continuous_mode_scales_confidence() {
        let image = sample_image(3, 1);
        let mask = SegmentationMask::new(3, 1, vec![0.0, 0.5, 1.0]).unwrap();
        let result = apply_mask(&image, &mask, MaskMode::Continuous).unwrap();
        assert_eq!(alphas(&result), [0, 128, 255]);
    }

    #[test]
    fn mismatched_mask_is_rejected() {
        let err = apply_mask(&sample_image(4, 4), &SegmentationMask::filled(2, 2, 1.0), MaskMode::default())
            .unwrap_err();
        assert!(matches!(err, ModelError::Shape { .. }));
    }

    #[test]
    fn model_output_is_resampled_to_image_size() {
        let composer = composer(LeftHalf);
        let result = composer.remove_background(&sample_image(40, 10)).unwrap();
        assert_eq!(result.dimensions(), (40, 10));
        assert_eq!(result.get_pixel(0, 5).0[3], 255);
        assert_eq!(result.get_pixel(39, 5).0[3], 0);
    }

    #[test]
    fn multi_channel_and_batched_outputs_are_rejected() {
        let two_channel = Array4::from_elem((1, 2, 4, 4), 1.0);
        let err = SegmentationMask::from_model_output(&two_channel, 4, 4).unwrap_err();
        assert!(matches!(err, ModelError::Shape { .. }));

        let batched = Array4::from_elem((2, 1, 4, 4), 1.0);
        assert!(SegmentationMask::from_model_output(&batched, 4, 4).is_err());
    }

    #[test]
    fn segmentation_errors_are_reported_not_hidden() {
        let composer = composer(BrokenSegmenter);
        let err = composer.remove_background(&sample_image(4, 4)).unwrap_err();
        assert!(matches!(err, PipelineError::SegmentationFailure { .. }), "{err:?}");
    }

    #[test]
    fn png_data_uri_round_trips_dimensions_and_alpha() {
        let composer = composer(ConstantMask {
            confidence: 1.0,
            size: 16,
        });
        let rgba = composer.remove_background(&sample_image(23, 17)).unwrap();
        let encoded = encode_png_data_uri(&rgba).unwrap().into_string();
        assert!(encoded.starts_with("data:image/png;base64,"));

        let payload = encoded.split_once(',').unwrap().1;
        let png = STANDARD.decode(payload).unwrap();
        let reloaded = image::load_from_memory(&png).unwrap();
        assert_eq!(reloaded.color(), image::ColorType::Rgba8);
        assert_eq!(reloaded.to_rgba8(), rgba);

        let rgb = decode(&ImageInput::Encoded(encoded.clone())).unwrap();
        assert_eq!(rgb.dimensions(), (23, 17));
    }
}
