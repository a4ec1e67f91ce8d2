//! Pipeline stages for scan-to-PDF conversion.
//!
//! Each submodule owns one collaborator: the trait the orchestrator calls
//! plus the production implementation behind it. The orchestrator
//! ([`crate::orchestrator`]) runs every stage as its own task and connects
//! them with bounded queues.
//!
//! ## Data Flow
//!
//! ```text
//! scan ──▶ classify ──▶ ocr ──▶ assemble
//! (SANE)   (density)   (tesseract)  (lopdf)
//! ```
//!
//! 1. [`scan`]: pull frames from the feeder, one tool call per sheet
//! 2. [`classify`]: score dark-pixel density; blank pages leave here
//! 3. [`ocr`]: recognise words with retry/backoff; the only stage
//!    with a worker pool
//! 4. [`encode`]: compress a page bitmap for the PDF image XObject
//! 5. [`assemble`]: restore feeder order, build the document, write it
//!
//! Pages that leave the pipeline early (blank or failed) keep moving as
//! [`Flow::Skip`] markers so the assembler knows not to wait for them.

pub mod assemble;
pub mod classify;
pub mod encode;
pub mod ocr;
pub mod scan;

use crate::page::Page;

/// What travels on the queues between classifier, OCR and assembler.
#[derive(Debug)]
pub enum Flow {
    /// A page still on its way into the PDF.
    Page(Page),
    /// The page with this index was excluded or failed upstream.
    Skip(usize),
}

impl Flow {
    pub fn index(&self) -> usize {
        match self {
            Flow::Page(page) => page.index(),
            Flow::Skip(index) => *index,
        }
    }
}
