use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// JSON body accepted by every inference endpoint.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct InferenceRequest {
    /// Data-URI (`data:image/png;base64,...`) or bare base64 payload.
    pub image: String,
}

/// How probabilities are presented to clients.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ScoreScale {
    #[default]
    Fraction,
    Percent,
}

impl ScoreScale {
    pub fn factor(self) -> f32 {
        match self {
            ScoreScale::Fraction => 1.0,
            ScoreScale::Percent => 100.0,
        }
    }

    pub fn max(self) -> f32 {
        self.factor()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Prediction {
    #[serde(rename = "class")]
    pub class_name: String,
    pub probability: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logit: Option<f32>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PredictionResponse {
    pub predictions: Vec<Prediction>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RemovalResponse {
    pub results: Vec<Prediction>,
    pub processed_image: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct HealthResponse {
    pub status: String,
    pub labels: Vec<String>,
    pub background_removal: bool,
}
