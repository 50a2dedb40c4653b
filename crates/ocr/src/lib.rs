pub mod extract;
pub mod normalize;
pub mod pipeline;
pub mod preprocess;
pub mod recognizer;
pub mod schema;
pub mod types;

pub use extract::extract;
pub use normalize::normalize;
pub use pipeline::{KtpPipeline, PipelineError};
pub use preprocess::{prepare_for_ocr, preprocess, PreprocessConfig, PreprocessError};
pub use recognizer::{
    EngineMode, MockRecognizer, OcrBackend, OcrConfig, OcrError, PageSegMode, TesseractCli,
};
pub use schema::{ExtractionError, ExtractionSchema, FieldRule, LineSplitMode, SchemaKind};
pub use types::{
    BloodType, Citizenship, ExtractedRecord, Gender, KtpCard, MaritalStatus, Religion,
    ScanOutcome, Validity,
};
