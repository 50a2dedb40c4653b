use serde::{Deserialize, Serialize};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("OCR engine unavailable: {0}")]
    Unavailable(String),
    #[error("OCR engine error: {0}")]
    Failure(String),
    #[error("OCR timed out after {0:?}")]
    Timeout(Duration),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Tesseract page segmentation modes (`--psm`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageSegMode {
    OsdOnly = 0,
    AutoOsd = 1,
    AutoOnly = 2,
    Auto = 3,
    SingleColumn = 4,
    SingleBlockVertText = 5,
    /// A single uniform block of text, as on the KTP body.
    #[default]
    SingleBlock = 6,
    SingleLine = 7,
    SingleWord = 8,
    CircleWord = 9,
    SingleChar = 10,
    SparseText = 11,
    SparseTextOsd = 12,
    RawLine = 13,
}

impl PageSegMode {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Tesseract OCR engine modes (`--oem`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    TesseractOnly = 0,
    /// Neural LSTM engine (Tesseract 4+).
    #[default]
    LstmOnly = 1,
    Combined = 2,
    Default = 3,
}

impl EngineMode {
    pub fn code(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    /// Tesseract language codes, in priority order.
    pub languages: Vec<String>,
    pub page_seg_mode: PageSegMode,
    pub engine_mode: EngineMode,
    /// Overrides the `tesseract` found on PATH.
    pub executable_path: Option<PathBuf>,
    pub timeout_ms: Option<u64>,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            languages: vec!["ind".to_string()],
            page_seg_mode: PageSegMode::SingleBlock,
            engine_mode: EngineMode::LstmOnly,
            executable_path: None,
            timeout_ms: Some(30_000),
        }
    }
}

impl OcrConfig {
    /// `-l` argument: languages de-duplicated in order and joined with `+`.
    /// `None` when no language is configured.
    pub fn language_arg(&self) -> Option<String> {
        let mut seen: Vec<&str> = Vec::new();
        for lang in self.languages.iter().map(|l| l.trim()) {
            if !lang.is_empty() && !seen.contains(&lang) {
                seen.push(lang);
            }
        }
        (!seen.is_empty()).then(|| seen.join("+"))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn with_executable(mut self, path: Option<PathBuf>) -> Self {
        if path.is_some() {
            self.executable_path = path;
        }
        self
    }
}

/// Abstraction over an OCR backend.
/// Implementations read the image at `image_path` and return the recognized text.
/// Output is not assumed to be stable across engine versions.
pub trait OcrBackend: Send + Sync {
    fn recognize(&self, image_path: &Path, config: &OcrConfig) -> Result<String, OcrError>;
}

impl<T: OcrBackend + ?Sized> OcrBackend for Box<T> {
    fn recognize(&self, image_path: &Path, config: &OcrConfig) -> Result<String, OcrError> {
        (**self).recognize(image_path, config)
    }
}

impl<T: OcrBackend + ?Sized> OcrBackend for Arc<T> {
    fn recognize(&self, image_path: &Path, config: &OcrConfig) -> Result<String, OcrError> {
        (**self).recognize(image_path, config)
    }
}

// ── Mock backend (always available, used for tests) ───────────────────────────

/// Returns a pre-set string. Used for testing the extraction pipeline
/// without requiring Tesseract to be installed.
pub struct MockRecognizer {
    pub text: String,
}

impl MockRecognizer {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

impl OcrBackend for MockRecognizer {
    fn recognize(&self, _image_path: &Path, _config: &OcrConfig) -> Result<String, OcrError> {
        Ok(self.text.clone())
    }
}

// ── Tesseract CLI backend ────────────────────────────────────────────────────

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Runs the `tesseract` executable as a subprocess and reads text from stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct TesseractCli;

impl TesseractCli {
    fn program(config: &OcrConfig) -> &Path {
        config
            .executable_path
            .as_deref()
            .unwrap_or_else(|| Path::new("tesseract"))
    }

    /// `tesseract <image> stdout -l <langs> --psm <n> --oem <n>`
    pub fn command(image_path: &Path, config: &OcrConfig) -> Command {
        let mut cmd = Command::new(Self::program(config));
        cmd.arg(image_path).arg("stdout");
        if let Some(langs) = config.language_arg() {
            cmd.arg("-l").arg(langs);
        }
        cmd.arg("--psm")
            .arg(config.page_seg_mode.code().to_string())
            .arg("--oem")
            .arg(config.engine_mode.code().to_string());
        cmd
    }

    /// Whether the configured executable answers `--version`.
    pub fn is_available(config: &OcrConfig) -> bool {
        Command::new(Self::program(config))
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

impl OcrBackend for TesseractCli {
    fn recognize(&self, image_path: &Path, config: &OcrConfig) -> Result<String, OcrError> {
        let program = Self::program(config);
        let mut child = Self::command(image_path, config)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(program, e))?;

        // Drain both pipes on their own threads so a chatty engine cannot block on a full pipe.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let waited = wait_with_deadline(&mut child, config.timeout());
        if !matches!(waited, Ok(Some(_))) {
            // Killing closes the pipes, so both drain threads finish.
            let _ = child.kill();
            let _ = child.wait();
        }
        let text = stdout.join().unwrap_or_default();
        let errors = stderr.join().unwrap_or_default();

        let status = match waited {
            Ok(Some(status)) => status,
            Ok(None) => {
                let timeout = config.timeout().unwrap_or_default();
                tracing::warn!(program = %program.display(), ?timeout, "tesseract killed after timeout");
                return Err(OcrError::Timeout(timeout));
            }
            Err(e) => return Err(OcrError::Io(e)),
        };

        if !status.success() {
            return Err(OcrError::Failure(format!(
                "tesseract exited with code {}: {}",
                status.code().unwrap_or(-1),
                errors.trim()
            )));
        }
        Ok(text)
    }
}

fn spawn_error(program: &Path, e: io::Error) -> OcrError {
    match e.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => OcrError::Unavailable(
            format!("cannot run '{}': {e}", program.display()),
        ),
        _ => OcrError::Io(e),
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut bytes = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut bytes);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    })
}

/// `Ok(None)` when the deadline passed before the child exited.
fn wait_with_deadline(child: &mut Child, timeout: Option<Duration>) -> io::Result<Option<ExitStatus>> {
    let Some(timeout) = timeout else {
        return child.wait().map(Some);
    };
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

// ── Tesseract library backend (optional, gated behind `tesseract` feature) ────

#[cfg(feature = "tesseract")]
pub mod tesseract_backend {
    use super::{OcrBackend, OcrConfig, OcrError};
    use leptess::{LepTess, Variable};
    use std::path::Path;

    /// In-process libtesseract. Engine mode is fixed at library init, so only
    /// languages and page segmentation are taken from the config.
    pub struct LeptessRecognizer {
        data_path: Option<String>,
    }

    impl LeptessRecognizer {
        pub fn new(data_path: Option<String>) -> Self {
            Self { data_path }
        }
    }

    impl OcrBackend for LeptessRecognizer {
        fn recognize(&self, image_path: &Path, config: &OcrConfig) -> Result<String, OcrError> {
            let lang = config.language_arg().unwrap_or_else(|| "eng".to_string());
            let mut lt = LepTess::new(self.data_path.as_deref(), &lang)
                .map_err(|e| OcrError::Unavailable(e.to_string()))?;
            lt.set_variable(
                Variable::TesseditPagesegMode,
                &config.page_seg_mode.code().to_string(),
            )
            .map_err(|e| OcrError::Failure(e.to_string()))?;
            lt.set_image(image_path)
                .map_err(|e| OcrError::Failure(e.to_string()))?;
            lt.get_utf8_text().map_err(|e| OcrError::Failure(e.to_string()))
        }
    }
}
