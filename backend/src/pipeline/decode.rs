use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use image::RgbImage;

use crate::error::PipelineError;

/// An image as it arrives at the service boundary.
#[derive(Debug, Clone)]
pub enum ImageInput {
    /// Raw file contents from a multipart upload.
    Bytes(Vec<u8>),
    /// A `data:<mime>;base64,<payload>` URI or a bare base64 payload.
    Encoded(String),
}

/// Decode either transport form into a 3-channel RGB buffer.
pub fn decode(input: &ImageInput) -> Result<RgbImage, PipelineError> {
    match input {
        ImageInput::Bytes(bytes) => decode_bytes(bytes),
        ImageInput::Encoded(text) => {
            let bytes = decode_base64_payload(text)?;
            decode_bytes(&bytes)
        }
    }
}

fn decode_base64_payload(text: &str) -> Result<Vec<u8>, PipelineError> {
    let text = text.trim();
    let payload = if text.starts_with("data:") {
        let (_, payload) = text
            .split_once(',')
            .ok_or_else(|| PipelineError::invalid_image("data URI has no ',' separator"))?;
        payload
    } else {
        text
    };

    if payload.is_empty() {
        return Err(PipelineError::invalid_image("image payload is empty"));
    }

    STANDARD
        .decode(payload)
        .map_err(|e| PipelineError::invalid_image(format!("invalid base64: {e}")))
}

fn decode_bytes(bytes: &[u8]) -> Result<RgbImage, PipelineError> {
    if bytes.is_empty() {
        return Err(PipelineError::invalid_image("image payload is empty"));
    }
    let image = image::load_from_memory(bytes)
        .map_err(|e| PipelineError::invalid_image(format!("cannot decode image: {e}")))?;
    Ok(image.to_rgb8())
}
