use crate::{
    config::Config, inference_service::InferencePipeline, labels::ThresholdTable,
    runtime::ModelRuntime, server::HttpServer,
};
use std::{error::Error, sync::Arc};
use tokio::{signal, sync::broadcast};

/// Loads the model, serves until SIGINT/SIGTERM, then drains and unloads. A missing model
/// artifact fails here, before the listener is bound.
pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    let runtime = Arc::new(ModelRuntime::new());
    let model_config = config.model.clone();
    let init_runtime = runtime.clone();
    match tokio::task::spawn_blocking(move || init_runtime.initialize(&model_config)).await? {
        Ok(()) => {}
        Err(e) => {
            tracing::error!("Failed to initialize model runtime: {}", e);
            return Err(Box::new(e));
        }
    }

    if let Some(device) = runtime.device() {
        tracing::info!("Model ready on {}", device);
    }

    let thresholds = ThresholdTable::with_overrides(
        &config.inference.class_labels,
        &config.inference.label_thresholds,
    )?;
    let pipeline = InferencePipeline::new(runtime.clone(), config.inference.label_policy, thresholds);

    let server = HttpServer::new(pipeline, &config).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_shutdown_rx = shutdown_tx.subscribe();

    let server_handle = server.run(server_shutdown_rx).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    match server_handle.await {
        Ok(Err(e)) => tracing::error!("Server stopped with error: {}", e),
        Err(e) => tracing::error!("Server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    runtime.shutdown();

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
