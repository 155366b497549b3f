pub mod extract;
pub mod pipeline;
pub mod preprocess;
pub mod recognizer;

pub use extract::Extractor;
pub use pipeline::{PipelineError, ReceiptPipeline};
pub use preprocess::{ImagePreprocessor, PreprocessConfig, PreprocessError};
pub use recognizer::{MockRecognizer, OcrBackend, OcrError, UnavailableRecognizer, DEFAULT_LANGUAGES};

#[cfg(feature = "tesseract")]
pub use recognizer::tesseract_backend::TesseractRecognizer;
