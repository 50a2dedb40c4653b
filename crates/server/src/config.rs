use anyhow::{bail, Context, Result};
use ktp_ocr::{ExtractionSchema, LineSplitMode, OcrConfig, PreprocessConfig};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Extra time on top of the OCR timeout for decode, preprocessing and extraction.
const REQUEST_MARGIN: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    /// Bunyan-style JSON lines.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" | "bunyan" => Ok(LogFormat::Json),
            other => Err(format!("Unknown log format: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrBackendKind {
    /// `tesseract` executable as a subprocess.
    #[default]
    Cli,
    /// In-process libtesseract (needs the `tesseract` feature).
    Library,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Largest accepted image upload.
    pub max_upload_bytes: usize,
    pub temp_dir: Option<PathBuf>,
    pub log_format: LogFormat,
    pub backend: OcrBackendKind,
    /// Line splitting for the detailed schema.
    pub line_split: LineSplitMode,
    /// Optional TOML schema that replaces the built-in detailed schema.
    pub schema_file: Option<PathBuf>,
    pub preprocess: PreprocessConfig,
    pub ocr: OcrConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_upload_bytes: 4096 * 1024,
            temp_dir: None,
            log_format: LogFormat::Pretty,
            backend: OcrBackendKind::Cli,
            line_split: LineSplitMode::Raw,
            schema_file: None,
            preprocess: PreprocessConfig::default(),
            ocr: OcrConfig::default(),
        }
    }
}

impl ServerConfig {
    /// File named by `KTP_CONFIG` (if any), then environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var_os("KTP_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.preprocess.validate()?;
        Ok(config)
    }

    /// Environment overrides, read through `lookup` so tests never touch the process env.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(addr) = lookup("KTP_BIND_ADDR") {
            self.bind_addr = addr
                .parse()
                .with_context(|| format!("KTP_BIND_ADDR is not a socket address: '{addr}'"))?;
        }
        if let Some(format) = lookup("KTP_LOG_FORMAT") {
            self.log_format = format.parse().map_err(anyhow::Error::msg)?;
        }
        let executable = lookup("TESSERACT_EXECUTABLE_PATH")
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        self.ocr = std::mem::take(&mut self.ocr).with_executable(executable);
        if self.max_upload_bytes == 0 {
            bail!("max_upload_bytes must be > 0");
        }
        Ok(())
    }

    /// Upper bound for one scan request.
    pub fn request_timeout(&self) -> Duration {
        self.ocr
            .timeout()
            .map(|t| t + REQUEST_MARGIN)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn detailed_schema(&self) -> Result<ExtractionSchema> {
        let schema = match &self.schema_file {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read schema file {}", path.display()))?;
                ExtractionSchema::from_toml(&content)
                    .with_context(|| format!("Invalid schema file {}", path.display()))?
            }
            None => ExtractionSchema::detailed(),
        };
        Ok(schema.with_line_split(self.line_split))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ktp_ocr::PageSegMode;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_upload_limits() {
        let config = ServerConfig::default();
        assert_eq!(config.max_upload_bytes, 4 * 1024 * 1024);
        assert_eq!(config.ocr.languages, vec!["ind".to_string()]);
        assert_eq!(config.request_timeout(), Duration::from_secs(40));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = ServerConfig::from_toml(
            r#"
            bind_addr = "0.0.0.0:9000"
            line_split = "normalized"

            [preprocess]
            resize_width = 1600

            [ocr]
            languages = ["ind", "eng"]
            page_seg_mode = "sparse_text"
            "#,
        )
        .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.line_split, LineSplitMode::Normalized);
        assert_eq!(config.preprocess.resize_width, 1600);
        assert_eq!(config.preprocess.truncate_threshold, Some(127));
        assert_eq!(config.ocr.language_arg().as_deref(), Some("ind+eng"));
        assert_eq!(config.ocr.page_seg_mode, PageSegMode::SparseText);
        assert_eq!(config.max_upload_bytes, 4096 * 1024);
    }

    #[test]
    fn invalid_preprocess_section_rejected() {
        assert!(ServerConfig::from_toml("[preprocess]\nresize_width = 0\n").is_err());
        // u8 threshold rejects anything past 255.
        assert!(ServerConfig::from_toml("[preprocess]\ntruncate_threshold = 300\n").is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = ServerConfig::default();
        config
            .apply_overrides(lookup(&[
                ("KTP_BIND_ADDR", "127.0.0.1:3100"),
                ("KTP_LOG_FORMAT", "json"),
                ("TESSERACT_EXECUTABLE_PATH", "/opt/tesseract/bin/tesseract"),
            ]))
            .unwrap();
        assert_eq!(config.bind_addr.port(), 3100);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(
            config.ocr.executable_path,
            Some(PathBuf::from("/opt/tesseract/bin/tesseract"))
        );
    }

    #[test]
    fn blank_executable_override_ignored() {
        let mut config = ServerConfig::default();
        config.ocr.executable_path = Some("/usr/bin/tesseract".into());
        config
            .apply_overrides(lookup(&[("TESSERACT_EXECUTABLE_PATH", "  ")]))
            .unwrap();
        assert_eq!(config.ocr.executable_path, Some(PathBuf::from("/usr/bin/tesseract")));
    }

    #[test]
    fn bad_bind_addr_is_error() {
        let mut config = ServerConfig::default();
        assert!(config.apply_overrides(lookup(&[("KTP_BIND_ADDR", "localhost")])).is_err());
    }

    #[test]
    fn detailed_schema_honours_line_split_and_file() {
        let config = ServerConfig { line_split: LineSplitMode::Normalized, ..Default::default() };
        let schema = config.detailed_schema().unwrap();
        assert_eq!(schema.name(), "detailed");
        assert_eq!(schema.line_split(), LineSplitMode::Normalized);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.toml");
        std::fs::write(&path, "name = \"nik-only\"\n[[fields]]\nname = \"nik\"\ncaptures = [{ pattern = '(\\d{16})' }]\n").unwrap();
        let config = ServerConfig { schema_file: Some(path), ..Default::default() };
        let schema = config.detailed_schema().unwrap();
        assert_eq!(schema.name(), "nik-only");
        assert_eq!(schema.fields().collect::<Vec<_>>(), ["nik"]);
    }

    #[test]
    fn missing_schema_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            schema_file: Some(dir.path().join("absent.toml")),
            ..Default::default()
        };
        assert!(config.detailed_schema().is_err());
    }
}
