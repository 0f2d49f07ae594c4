mod config;
mod error;
mod inference;
mod pipeline;
mod routes;

use actix_web::{App, HttpServer, middleware::Logger, web};
use config::{PipelineConfig, ServiceConfig};
use pipeline::Pipeline;
use pipeline::classify::ClassifierAdapter;
use pipeline::compose::OutputComposer;
use pipeline::preprocess::ImagePreprocessor;
use routes::{RouteSettings, configure_routes};

fn startup_error(context: &str, err: impl std::fmt::Display) -> std::io::Error {
    log::error!("{}: {}", context, err);
    std::io::Error::other(format!("{context}: {err}"))
}

/// Load every model named in the config. Runs once before the server starts.
fn build_pipeline(config: &PipelineConfig) -> Result<Pipeline, inference::ModelError> {
    let classifier_config = &config.classifier;
    let classifier_model = inference::load_classification_model(
        &classifier_config.model,
        classifier_config.preprocessing.input_size(),
    )?;
    let classifier = ClassifierAdapter::new(
        Box::new(ImagePreprocessor::new(classifier_config.preprocessing.clone())),
        classifier_model,
        classifier_config.labels.clone(),
    );

    let composer = match &config.segmentation {
        Some(segmentation) => {
            let model = inference::load_segmentation_model(
                &segmentation.model,
                segmentation.preprocessing.input_size(),
            )?;
            log::info!("Background removal enabled ({:?})", segmentation.mask);
            Some(OutputComposer::new(
                Box::new(ImagePreprocessor::new(segmentation.preprocessing.clone())),
                model,
                segmentation.mask,
            ))
        }
        None => {
            log::info!("No segmentation model configured; /remove-background disabled");
            None
        }
    };

    Ok(Pipeline::new(classifier, composer))
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let service_config =
        ServiceConfig::from_env().map_err(|e| startup_error("Invalid service configuration", e))?;
    log::info!(
        "Loading pipeline configuration from {}",
        service_config.pipeline_path.display()
    );

    let mut pipeline_config = PipelineConfig::load(&service_config.pipeline_path)
        .map_err(|e| startup_error("Invalid pipeline configuration", e))?;
    pipeline_config
        .apply_overrides(|key| std::env::var(key).ok())
        .map_err(|e| startup_error("Invalid pipeline configuration", e))?;
    log::info!(
        "Classifier labels: {}",
        pipeline_config.classifier.labels.join(", ")
    );

    let pipeline =
        build_pipeline(&pipeline_config).map_err(|e| startup_error("Model loading failed", e))?;
    let background_removal = pipeline.supports_background_removal();
    let pipeline = web::Data::new(pipeline);
    let settings = web::Data::new(RouteSettings {
        endpoints: pipeline_config.endpoints.clone(),
        max_upload_bytes: service_config.max_upload_bytes,
    });

    let bind_address = service_config.bind_address();
    log::info!("Starting server on {}", bind_address);

    let mut server = HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .app_data(pipeline.clone())
            .app_data(settings.clone())
            .configure(|cfg| configure_routes(cfg, background_removal))
    });
    if let Some(workers) = service_config.workers {
        server = server.workers(workers);
    }
    server.bind(&bind_address)?.run().await
}
