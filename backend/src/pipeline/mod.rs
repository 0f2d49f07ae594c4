//! decode -> classify -> rank -> (optional) remove background.
//!
//! Every stage is synchronous; callers on an async runtime should run
//! [`Pipeline`] methods on a blocking thread.

pub mod classify;
pub mod compose;
pub mod decode;
pub mod preprocess;
pub mod rank;

use image::RgbaImage;
use shared::Prediction;

use crate::error::PipelineError;
use classify::ClassifierAdapter;
use compose::OutputComposer;
use decode::{ImageInput, decode};
use rank::{RankOptions, rank};

/// Process-wide, read-only inference state built once at startup.
pub struct Pipeline {
    classifier: ClassifierAdapter,
    composer: Option<OutputComposer>,
}

impl Pipeline {
    pub fn new(classifier: ClassifierAdapter, composer: Option<OutputComposer>) -> Self {
        Self {
            classifier,
            composer,
        }
    }

    pub fn labels(&self) -> &[String] {
        self.classifier.labels()
    }

    pub fn supports_background_removal(&self) -> bool {
        self.composer.is_some()
    }

    pub fn predict(
        &self,
        input: &ImageInput,
        options: &RankOptions,
    ) -> Result<Vec<Prediction>, PipelineError> {
        let image = decode(input)?;
        let scores = self.classifier.classify(&image)?;
        Ok(rank(&scores, options))
    }

    /// Classify and cut out the foreground. Returns `Ok(None)` when no
    /// segmentation model is configured.
    pub fn predict_and_remove_background(
        &self,
        input: &ImageInput,
        options: &RankOptions,
    ) -> Result<Option<(Vec<Prediction>, RgbaImage)>, PipelineError> {
        let Some(composer) = &self.composer else {
            return Ok(None);
        };
        let image = decode(input)?;
        let scores = self.classifier.classify(&image)?;
        let cutout = composer.remove_background(&image)?;
        Ok(Some((rank(&scores, options), cutout)))
    }
}
