use image::RgbImage;

use super::preprocess::Preprocessor;
use crate::error::PipelineError;
use crate::inference::{ClassificationModel, ModelError};

/// Model output for one class, in class-index order.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassScore {
    pub label: String,
    pub logit: f32,
    pub probability: f32,
}

/// Wraps a preprocessor, a classification model and its `id2label` table.
pub struct ClassifierAdapter {
    preprocessor: Box<dyn Preprocessor>,
    model: Box<dyn ClassificationModel>,
    labels: Vec<String>,
}

impl ClassifierAdapter {
    pub fn new(
        preprocessor: Box<dyn Preprocessor>,
        model: Box<dyn ClassificationModel>,
        labels: Vec<String>,
    ) -> Self {
        Self {
            preprocessor,
            model,
            labels,
        }
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn classify(&self, image: &RgbImage) -> Result<Vec<ClassScore>, PipelineError> {
        let tensor = self
            .preprocessor
            .preprocess(image)
            .map_err(|e| PipelineError::inference("could not prepare model input", e))?;
        let logits = self
            .model
            .forward(&tensor)
            .map_err(|e| PipelineError::inference("model invocation failed", e))?;

        if logits.len() != self.labels.len() {
            return Err(PipelineError::inference(
                format!(
                    "model returned {} logits for {} labels",
                    logits.len(),
                    self.labels.len()
                ),
                ModelError::shape(format!("[{}]", self.labels.len()), &[logits.len()]),
            ));
        }
        if logits.iter().any(|l| !l.is_finite()) {
            return Err(PipelineError::inference(
                "model returned non-finite logits",
                ModelError::backend(format!("{logits:?}")),
            ));
        }

        let probabilities = softmax(&logits);
        Ok(self
            .labels
            .iter()
            .zip(logits)
            .zip(probabilities)
            .map(|((label, logit), probability)| ClassScore {
                label: label.clone(),
                logit,
                probability,
            })
            .collect())
    }
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pipeline::preprocess::{ImagePreprocessor, PreprocessingConfig};
    use image::Rgb;
    use ndarray::Array4;

    pub(crate) const EMOTIONS: [&str; 7] = [
        "sad", "disgust", "angry", "neutral", "fear", "surprise", "happy",
    ];

    pub(crate) fn emotion_labels() -> Vec<String> {
        EMOTIONS.iter().map(|s| s.to_string()).collect()
    }

    /// Returns a fixed logit vector regardless of input.
    pub(crate) struct FixedLogits(pub Vec<f32>);

    impl ClassificationModel for FixedLogits {
        fn forward(&self, _input: &Array4<f32>) -> Result<Vec<f32>, ModelError> {
            Ok(self.0.clone())
        }
    }

    /// Derives one logit per class from the mean of each input channel.
    struct ChannelMeans;

    impl ClassificationModel for ChannelMeans {
        fn forward(&self, input: &Array4<f32>) -> Result<Vec<f32>, ModelError> {
            let (_, channels, _, _) = input.dim();
            let means: Vec<f32> = (0..channels)
                .map(|c| input.index_axis(ndarray::Axis(1), c).mean().unwrap_or(0.0))
                .collect();
            Ok((0..EMOTIONS.len())
                .map(|i| means[i % channels] * (i as f32 + 1.0))
                .collect())
        }
    }

    pub(crate) struct FailingModel;

    impl ClassificationModel for FailingModel {
        fn forward(&self, input: &Array4<f32>) -> Result<Vec<f32>, ModelError> {
            Err(ModelError::shape("(1, 3, 1, 1)", input.shape()))
        }
    }

    pub(crate) fn adapter(model: impl ClassificationModel + 'static) -> ClassifierAdapter {
        ClassifierAdapter::new(
            Box::new(ImagePreprocessor::new(PreprocessingConfig::default())),
            Box::new(model),
            emotion_labels(),
        )
    }

    #[test]
    fn softmax_sums_to_one_on_solid_gray_input() {
        let adapter = adapter(ChannelMeans);
        let gray = RgbImage::from_pixel(224, 224, Rgb([128, 128, 128]));
        let scores = adapter.classify(&gray).unwrap();

        assert_eq!(scores.len(), EMOTIONS.len());
        let total: f32 = scores.iter().map(|s| s.probability).sum();
        assert!((total - 1.0).abs() < 1e-4, "sum was {total}");
        assert!(scores.iter().all(|s| (0.0..=1.0).contains(&s.probability)));
    }

    #[test]
    fn scores_keep_class_index_order_and_logits() {
        let logits = vec![0.1, 2.0, -1.0, 0.0, 0.5, 3.0, 1.0];
        let adapter = adapter(FixedLogits(logits.clone()));
        let scores = adapter.classify(&RgbImage::new(10, 10)).unwrap();

        let labels: Vec<&str> = scores.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, EMOTIONS);
        let returned: Vec<f32> = scores.iter().map(|s| s.logit).collect();
        assert_eq!(returned, logits);
        assert!(scores[5].probability > scores[1].probability);
    }

    #[test]
    fn softmax_is_stable_for_large_logits() {
        let probs = softmax(&[1000.0, 1000.0]);
        assert!((probs[0] - 0.5).abs() < 1e-6);
        assert!(probs.iter().all(|p| p.is_finite()));
    }

    #[test]
    fn label_count_mismatch_is_an_inference_failure() {
        let adapter = adapter(FixedLogits(vec![1.0, 2.0]));
        let err = adapter.classify(&RgbImage::new(4, 4)).unwrap_err();
        assert!(matches!(err, PipelineError::InferenceFailure { .. }), "{err:?}");
    }

    #[test]
    fn model_errors_surface_with_cause() {
        let adapter = adapter(FailingModel);
        match adapter.classify(&RgbImage::new(4, 4)).unwrap_err() {
            PipelineError::InferenceFailure { source, .. } => {
                assert!(matches!(source, ModelError::Shape { .. }))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn non_finite_logits_are_rejected() {
        let mut logits = vec![0.0; EMOTIONS.len()];
        logits[3] = f32::NAN;
        let adapter = adapter(FixedLogits(logits));
        assert!(adapter.classify(&RgbImage::new(4, 4)).is_err());
    }
}
