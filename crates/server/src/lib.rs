pub mod config;
pub mod error;
pub mod routes;
pub mod telemetry;

pub use config::{LogFormat, OcrBackendKind, ServerConfig};
pub use error::ApiError;
pub use routes::{router, AppState};
