use anyhow::{Context, Result};
use ktp_ocr::{OcrBackend, TesseractCli};
use ktp_server::{router, telemetry, AppState, OcrBackendKind, ServerConfig};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::load()?;
    telemetry::init(config.log_format)?;

    let recognizer = build_recognizer(&config)?;
    let state = AppState::from_config(&config, recognizer)?;
    let app = router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;
    tracing::info!(
        addr = %config.bind_addr,
        languages = config.ocr.language_arg().as_deref().unwrap_or(""),
        "KTP scanner listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

fn build_recognizer(config: &ServerConfig) -> Result<Box<dyn OcrBackend>> {
    match config.backend {
        OcrBackendKind::Cli => {
            if !TesseractCli::is_available(&config.ocr) {
                tracing::warn!(
                    executable = ?config.ocr.executable_path,
                    "tesseract executable not found; scans will fail until it is installed"
                );
            }
            Ok(Box::new(TesseractCli))
        }
        OcrBackendKind::Library => library_backend(),
    }
}

#[cfg(feature = "tesseract")]
fn library_backend() -> Result<Box<dyn OcrBackend>> {
    use ktp_ocr::recognizer::tesseract_backend::LeptessRecognizer;
    Ok(Box::new(LeptessRecognizer::new(None)))
}

#[cfg(not(feature = "tesseract"))]
fn library_backend() -> Result<Box<dyn OcrBackend>> {
    anyhow::bail!("backend = \"library\" requires building with the `tesseract` feature")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
