//! # scan2pdf
//!
//! Turn a stack of paper fed through a document scanner into one searchable PDF.
//!
//! ## Why this crate?
//!
//! Scanning a 40-sheet duplex document one command at a time means waiting
//! for the feeder, then waiting for OCR, then sorting out the empty back
//! sides by hand. This crate runs all of that at once: while the feeder is
//! still pulling paper, earlier pages are already being checked for
//! emptiness and OCR'd, and the finished PDF keeps the original page order
//! no matter which page the OCR engine finishes first.
//!
//! ## Pipeline Overview
//!
//! ```text
//! ADF
//!  │
//!  ├─ 1. Scan      one `scanimage` call per sheet, until the feeder is empty
//!  ├─ 2. Classify  dark-pixel density; blank pages are dropped here
//!  ├─ 3. OCR       concurrent `tesseract` runs with retry/backoff
//!  ├─ 4. Assemble  reorder, embed image + invisible text layer (lopdf)
//!  └─ 5. Output    atomic PDF write + per-page report
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use scan2pdf::{Pipeline, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder().ocr_lang("eng").build()?;
//!     let pipeline = Pipeline::new(config);
//!     let source = Box::new(pipeline.scanner());
//!     let report = pipeline.run(source, "scan.pdf").await.into_result()?;
//!     eprintln!("{}", report.summary());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `scan2pdf` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! scan2pdf = { version = "0.1", default-features = false }
//! ```
//!
//! ## External Tools
//!
//! | Tool | Needed for | Package |
//! |------|-----------|---------|
//! | `scanimage` | scanning (not for [`DirectorySource`]) | `sane-utils` |
//! | `tesseract` ≥ 4 | OCR | `tesseract-ocr` + a language pack |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod job;
pub mod orchestrator;
pub mod page;
pub mod pipeline;
pub mod progress;
pub mod tool;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{FileConfig, PipelineConfig, PipelineConfigBuilder, ScanMode};
pub use error::{
    AssembleError, ClassifyError, OcrError, PageError, Scan2PdfError, ScanError, ToolError,
};
pub use job::{FailureReason, JobOutcome, JobReport, JobStats, PageReport};
pub use orchestrator::{CancelHandle, Pipeline};
pub use page::{Classification, PageState, TextLayer, Word};
pub use pipeline::assemble::{LopdfEncoder, PageEncoder};
pub use pipeline::classify::{Classifier, DensityClassifier, Verdict};
pub use pipeline::ocr::{Recognizer, TesseractRecognizer};
pub use pipeline::scan::{DirectorySource, Frame, ScanSource, ScanimageSource};
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
