//! Error types for the scan2pdf library.
//!
//! Failures fall into two groups with different blast radius:
//!
//! * **Job-fatal**: [`ScanError`] (the feeder or scanner broke),
//!   [`AssembleError`] (no PDF can be produced) and the top-level
//!   [`Scan2PdfError`]. Any of these ends the job without an output file.
//!
//! * **Page-scoped**: [`ClassifyError`] and [`OcrError`] are returned by the
//!   collaborators for a single page. The stage that called them wraps the
//!   cause into a serialisable [`PageError`], marks the page failed and the
//!   job carries on with the remaining pages.
//!
//! [`ToolError`] is the raw failure of one external process and is always
//! wrapped into one of the above by the stage that invoked the tool.

use std::path::PathBuf;
use thiserror::Error;

/// Failure of a single external tool invocation.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The program could not be started at all (not installed, not executable).
    #[error("Failed to start '{program}': {source}\nIs it installed and on PATH?")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The process did not finish in time and was killed.
    #[error("'{program}' timed out after {secs}s and was killed")]
    TimedOut { program: String, secs: u64 },

    /// The process exited unsuccessfully. `code` is `None` when it was
    /// terminated by a signal.
    #[error("'{program}' exited with {}: {stderr}", describe_exit(.code))]
    NonZeroExit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Reading from or writing to the child's pipes failed.
    #[error("I/O error talking to '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("status {c}"),
        None => "a signal".to_string(),
    }
}

/// Fatal failure of the Scanner Source. Aborts the whole job.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The scan tool failed for a reason other than an empty feeder.
    #[error("Scanning frame {frame} failed: {source}")]
    Tool {
        frame: usize,
        #[source]
        source: ToolError,
    },

    /// The scanner returned bytes that are not a decodable image.
    #[error("Frame {frame} is not a readable image: {detail}")]
    Decode { frame: usize, detail: String },

    /// A frame file could not be read or saved.
    #[error("Frame file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure returned by a [`crate::pipeline::classify::Classifier`].
#[derive(Debug, Error)]
pub enum ClassifyError {
    /// The image has no pixels left to score after shaving the margins.
    #[error("Image of {width}x{height} px is too small to score")]
    TooSmall { width: u32, height: u32 },

    /// An external scoring tool failed.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// The scoring task panicked or was aborted.
    #[error("Classifier task failed: {0}")]
    Internal(String),
}

/// Failure returned by a [`crate::pipeline::ocr::Recognizer`].
#[derive(Debug, Error)]
pub enum OcrError {
    /// The OCR tool itself failed.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// Tool output could not be understood.
    #[error("Unexpected OCR output: {0}")]
    Parse(String),

    /// The page image could not be handed to the OCR tool.
    #[error("Could not prepare page image for OCR: {0}")]
    Image(String),

    /// The installed OCR engine is too old to produce usable results.
    #[error("Tesseract {found} is too old; version 4 or newer is required.\nPut Tesseract 4+ first on PATH or pass --old-tesseract.")]
    Unsupported { found: String },

    /// Temp-file handling around the tool call failed.
    #[error("OCR scratch file error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fatal failure of the Assembler.
#[derive(Debug, Error)]
pub enum AssembleError {
    /// A released page could not be encoded into a PDF page object.
    #[error("Encoding page {page} failed: {detail}")]
    Encode { page: usize, detail: String },

    /// The PDF document could not be built or serialised.
    #[error("Building the PDF failed: {0}")]
    Pdf(String),

    /// The finished PDF could not be written to its destination.
    #[error("Failed to write output file '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An encoding task panicked or was aborted.
    #[error("Assembler task failed: {0}")]
    Internal(String),
}

/// A page-scoped failure, stored in the job report for that page.
///
/// Never propagated upward: the job continues and the page is listed as
/// failed in the final outcome.
#[derive(Debug, Clone, Error, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// Blank/content classification failed.
    #[error("Page {page}: classification failed: {detail}")]
    ClassifyFailed { page: usize, detail: String },

    /// OCR failed after all retries.
    #[error("Page {page}: OCR failed after {attempts} attempt(s): {detail}")]
    OcrFailed {
        page: usize,
        attempts: u32,
        detail: String,
    },
}

impl PageError {
    /// The page this error belongs to.
    pub fn page(&self) -> usize {
        match self {
            PageError::ClassifyFailed { page, .. } | PageError::OcrFailed { page, .. } => *page,
        }
    }
}

/// All fatal errors surfaced by the scan2pdf library.
#[derive(Debug, Error)]
pub enum Scan2PdfError {
    /// Builder or config-file validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The Scanner Source failed; the job was aborted.
    #[error("Scanning failed: {0}")]
    Scan(String),

    /// The OCR engine is missing or unusable; nothing was scanned.
    #[error("OCR engine unavailable: {0}")]
    OcrUnavailable(String),

    /// The PDF could not be produced.
    #[error("Assembling the PDF failed: {0}")]
    Assemble(String),

    /// The feeder produced no frames at all.
    #[error("The scanner returned no pages.\nCheck that paper is loaded in the document feeder.")]
    NoPagesScanned,

    /// Every scanned page was classified blank.
    #[error("All {excluded} pages were classified blank; no PDF written.\nThis usually means a misfeed (pages upside down or the wrong side scanned).")]
    NoContentPages { excluded: usize },

    /// No page made it into the PDF and at least one failed.
    #[error("All {failed} content pages failed.\nFirst error: {first_error}")]
    AllPagesFailed { failed: usize, first_error: String },

    /// Some pages succeeded but at least one failed.
    ///
    /// Returned by [`crate::job::JobReport::into_strict_result`] when the
    /// caller wants to treat any page failure as an error.
    #[error("{failed}/{total} pages failed during OCR or classification")]
    PartialFailure { failed: usize, total: usize },

    /// The job was cancelled before it finished.
    #[error("Job cancelled")]
    Cancelled,

    /// Could not read a configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Unexpected internal error (a stage task panicked).
    #[error("Internal error: {0}")]
    Internal(String),
}
