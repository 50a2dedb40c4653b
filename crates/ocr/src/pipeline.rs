use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::extract::extract;
use crate::preprocess::{self, PreprocessConfig};
use crate::recognizer::{OcrBackend, OcrConfig, OcrError};
use crate::schema::ExtractionSchema;
use crate::types::ScanOutcome;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Image preprocessing failed: {0}")]
    Preprocess(#[from] crate::preprocess::PreprocessError),
    #[error("OCR recognition failed: {0}")]
    Ocr(#[from] OcrError),
}

/// Orchestrates: preprocess → temp artifact → OCR → extract.
///
/// Holds no per-request state, so one instance can serve concurrent scans.
pub struct KtpPipeline<R: OcrBackend> {
    recognizer: R,
    preprocess: PreprocessConfig,
    ocr: OcrConfig,
    temp_dir: Option<PathBuf>,
}

impl<R: OcrBackend> KtpPipeline<R> {
    pub fn new(recognizer: R, preprocess: PreprocessConfig, ocr: OcrConfig) -> Self {
        Self { recognizer, preprocess, ocr, temp_dir: None }
    }

    /// Directory for the short-lived PNG handed to the OCR engine.
    /// Defaults to the system temp dir.
    pub fn with_temp_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.temp_dir = dir;
        self
    }

    pub fn ocr_config(&self) -> &OcrConfig {
        &self.ocr
    }

    pub fn preprocess_config(&self) -> &PreprocessConfig {
        &self.preprocess
    }

    /// Scan one uploaded image. Either the whole chain succeeds and a complete
    /// (possibly sparse) record comes back, or nothing does.
    pub fn scan(&self, data: &[u8], schema: &ExtractionSchema) -> Result<ScanOutcome, PipelineError> {
        // 1. Preprocess image.
        let image = preprocess::prepare_for_ocr(data, &self.preprocess)?;
        tracing::debug!(width = image.width(), height = image.height(), "image preprocessed");

        // 2. Write the OCR artifact; removed when `artifact` drops, on every path.
        let png = preprocess::encode_png(&image)?;
        let mut artifact = self.temp_artifact()?;
        artifact.write_all(&png)?;
        artifact.flush()?;

        // 3. Run OCR.
        let raw_text = self.recognize(artifact.path())?;
        drop(artifact);
        tracing::debug!(chars = raw_text.len(), "ocr finished");

        // 4. Extract structured fields.
        let data = extract(&raw_text, schema);
        Ok(ScanOutcome { data, raw_text })
    }

    fn recognize(&self, path: &Path) -> Result<String, OcrError> {
        self.recognizer.recognize(path, &self.ocr).inspect_err(|e| {
            tracing::warn!(error = %e, "ocr failed");
        })
    }

    fn temp_artifact(&self) -> io::Result<NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("temp-ktp-").suffix(".png");
        match &self.temp_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
