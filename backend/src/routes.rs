use actix_multipart::{Field, Multipart};
use actix_web::http::header::CONTENT_TYPE;
use actix_web::{HttpRequest, HttpResponse, web};
use futures::{StreamExt, TryStreamExt};
use log::{error, info, warn};
use serde::Deserialize;
use shared::{
    HealthResponse, InferenceRequest, Prediction, PredictionResponse, RemovalResponse, ScoreScale,
};
use uuid::Uuid;

use crate::config::EndpointsConfig;
use crate::error::ApiError;
use crate::pipeline::Pipeline;
use crate::pipeline::compose::encode_png_data_uri;
use crate::pipeline::decode::ImageInput;
use crate::pipeline::rank::RankOptions;

/// Per-server settings shared by every handler.
#[derive(Debug, Clone)]
pub struct RouteSettings {
    pub endpoints: EndpointsConfig,
    pub max_upload_bytes: usize,
}

pub fn configure_routes(cfg: &mut web::ServiceConfig, background_removal: bool) {
    cfg.app_data(
        web::QueryConfig::default()
            .error_handler(|err, _req| ApiError::InvalidBody(err.to_string()).into()),
    )
    .service(web::resource("/predict").route(web::post().to(predict)))
    .service(web::resource("/analyze").route(web::post().to(analyze)))
    .service(web::resource("/health").route(web::get().to(health)));

    if background_removal {
        cfg.service(web::resource("/remove-background").route(web::post().to(remove_background)));
    }
}

/// Per-request overrides of an endpoint's configured [`RankOptions`].
#[derive(Debug, Default, Deserialize)]
pub struct RankQuery {
    top_k: Option<usize>,
    scale: Option<ScoreScale>,
    logits: Option<bool>,
}

impl RankQuery {
    fn apply(&self, defaults: RankOptions) -> Result<RankOptions, ApiError> {
        if self.top_k == Some(0) {
            return Err(ApiError::InvalidBody("top_k must be at least 1".into()));
        }
        Ok(RankOptions {
            top_k: self.top_k.or(defaults.top_k),
            scale: self.scale.unwrap_or(defaults.scale),
            include_logits: self.logits.unwrap_or(defaults.include_logits),
        })
    }
}

async fn predict(
    req: HttpRequest,
    payload: web::Payload,
    query: web::Query<RankQuery>,
    pipeline: web::Data<Pipeline>,
    settings: web::Data<RouteSettings>,
) -> Result<HttpResponse, ApiError> {
    let options = query.apply(settings.endpoints.predict)?;
    classify_request("/predict", req, payload, options, pipeline, &settings).await
}

async fn analyze(
    req: HttpRequest,
    payload: web::Payload,
    query: web::Query<RankQuery>,
    pipeline: web::Data<Pipeline>,
    settings: web::Data<RouteSettings>,
) -> Result<HttpResponse, ApiError> {
    let options = query.apply(settings.endpoints.analyze)?;
    classify_request("/analyze", req, payload, options, pipeline, &settings).await
}

async fn classify_request(
    route: &str,
    req: HttpRequest,
    payload: web::Payload,
    options: RankOptions,
    pipeline: web::Data<Pipeline>,
    settings: &RouteSettings,
) -> Result<HttpResponse, ApiError> {
    let request_id = Uuid::new_v4();
    let input = read_image(&req, payload, settings.max_upload_bytes).await?;
    info!(
        "[{request_id}] {route}: {} (top_k={:?}, scale={})",
        describe(&input),
        options.top_k,
        options.scale
    );

    let predictions = web::block(move || pipeline.predict(&input, &options))
        .await?
        .inspect_err(|e| warn!("[{request_id}] {route} failed: {e}"))?;

    log_top(request_id, &predictions);
    Ok(HttpResponse::Ok().json(PredictionResponse { predictions }))
}

async fn remove_background(
    req: HttpRequest,
    payload: web::Payload,
    query: web::Query<RankQuery>,
    pipeline: web::Data<Pipeline>,
    settings: web::Data<RouteSettings>,
) -> Result<HttpResponse, ApiError> {
    let request_id = Uuid::new_v4();
    let options = query.apply(settings.endpoints.remove_background)?;
    let input = read_image(&req, payload, settings.max_upload_bytes).await?;
    info!("[{request_id}] /remove-background: {}", describe(&input));

    let outcome = web::block(move || -> Result<_, ApiError> {
        let Some((predictions, cutout)) = pipeline.predict_and_remove_background(&input, &options)?
        else {
            return Ok(None);
        };
        let encoded = encode_png_data_uri(&cutout)
            .map_err(|e| ApiError::Internal(format!("could not encode output image: {e}")))?;
        Ok(Some((predictions, encoded)))
    })
    .await?
    .inspect_err(|e| warn!("[{request_id}] /remove-background failed: {e}"))?;

    let Some((results, processed_image)) = outcome else {
        error!("[{request_id}] background removal requested but no segmentation model is loaded");
        return Err(ApiError::Internal("background removal is not configured".into()));
    };

    log_top(request_id, &results);
    Ok(HttpResponse::Ok().json(RemovalResponse {
        results,
        processed_image: processed_image.into_string(),
    }))
}

async fn health(pipeline: web::Data<Pipeline>) -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".into(),
        labels: pipeline.labels().to_vec(),
        background_removal: pipeline.supports_background_removal(),
    })
}

fn describe(input: &ImageInput) -> String {
    match input {
        ImageInput::Bytes(bytes) => format!("{} byte upload", bytes.len()),
        ImageInput::Encoded(text) => format!("{} char encoded image", text.len()),
    }
}

fn log_top(request_id: Uuid, predictions: &[Prediction]) {
    if let Some(top) = predictions.first() {
        info!(
            "[{request_id}] Prediction: class={}, probability={}",
            top.class_name, top.probability
        );
    }
}

/// Multipart uploads use their first non-empty file field; anything else is read
/// as a JSON [`InferenceRequest`].
async fn read_image(
    req: &HttpRequest,
    payload: web::Payload,
    limit: usize,
) -> Result<ImageInput, ApiError> {
    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::new(req.headers(), payload);
        return read_multipart(multipart, limit).await;
    }

    let body = read_body(payload, limit).await?;
    if body.is_empty() {
        return Err(ApiError::MissingImage);
    }
    let request: InferenceRequest =
        serde_json::from_slice(&body).map_err(|e| ApiError::InvalidBody(e.to_string()))?;
    Ok(ImageInput::Encoded(request.image))
}

/// Text inputs sent alongside the upload are not images.
fn is_file_field(field: &Field) -> bool {
    field
        .content_disposition()
        .is_some_and(|cd| cd.get_filename().is_some() || cd.get_name() == Some("file"))
}

async fn read_multipart(mut payload: Multipart, limit: usize) -> Result<ImageInput, ApiError> {
    while let Some(mut field) = payload.try_next().await? {
        if !is_file_field(&field) {
            while let Some(chunk) = field.next().await {
                chunk?;
            }
            continue;
        }

        let mut image_data = Vec::new();
        while let Some(chunk) = field.next().await {
            let data = chunk?;
            if image_data.len() + data.len() > limit {
                return Err(ApiError::PayloadTooLarge { limit });
            }
            image_data.extend_from_slice(&data);
        }
        if !image_data.is_empty() {
            return Ok(ImageInput::Bytes(image_data));
        }
    }
    Err(ApiError::MissingImage)
}

async fn read_body(mut payload: web::Payload, limit: usize) -> Result<Vec<u8>, ApiError> {
    let mut body = Vec::new();
    while let Some(chunk) = payload.next().await {
        let data = chunk?;
        if body.len() + data.len() > limit {
            return Err(ApiError::PayloadTooLarge { limit });
        }
        body.extend_from_slice(&data);
    }
    Ok(body)
}
