use crate::{
    auth::AuthGate,
    classification::ClassificationService,
    config::Config,
    decoder::ImageDecoder,
    ort_service::OrtModelService,
    server::{HttpServer, SharedState},
    telemetry::Metrics,
    tensor::TensorBuilder,
};
use std::{error::Error, sync::Arc};
use tokio::signal;

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    let tensor_builder = TensorBuilder::from_name(&config.processing.tensor_dtype)?;
    let decoder = ImageDecoder::new(config.processing.get_decode_strategy());

    let model_service = match OrtModelService::new(&config.model) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            tracing::error!("Failed to load model: {:?}", e);
            return Err(e.into());
        }
    };

    let classification_service = ClassificationService::new(decoder, tensor_builder, model_service)?;
    tracing::info!(
        "Classifying with {:?} decoding into {} tensors",
        decoder.strategy(),
        tensor_builder.dtype()
    );

    let state = SharedState {
        classification_service,
        auth: AuthGate::new(&config.auth.access_token),
        metrics: Arc::new(Metrics::new()?),
    };

    let server = HttpServer::new(state, &config.server).await?;
    server
        .run(async {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, starting graceful shutdown");
        })
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
