//! The job ledger: per-page records, outcome policy and the final report.
//!
//! The orchestrator owns exactly one [`Job`] and is its only writer. Stage
//! tasks never touch it directly; they send [`JobEvent`]s over a channel and
//! the orchestrator applies them in arrival order. Pages are appended by the
//! `Scanned` event only, so the page list grows strictly in feeder order.

use crate::error::{AssembleError, PageError, Scan2PdfError, ScanError};
use crate::page::{Classification, InvalidTransition, PageState};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

/// A state change reported by a stage.
#[derive(Debug)]
pub enum JobEvent {
    /// The scanner produced frame `index`.
    Scanned { index: usize },
    /// The classifier decided. `Content` → Classified, `Blank` → Excluded.
    Classified {
        index: usize,
        classification: Classification,
        density: Option<f32>,
    },
    /// OCR produced a text layer with `words` words.
    OcrDone { index: usize, words: usize },
    /// The assembler encoded the page into the output document.
    Ready { index: usize },
    /// Classification or OCR failed for one page.
    PageFailed(PageError),
    /// The OCR preflight check failed before scanning began.
    OcrUnavailable(String),
    /// The scanner failed; the job is being cancelled.
    ScanFailed(ScanError),
    /// Encoding or writing the PDF failed.
    AssembleFailed(AssembleError),
    /// The PDF was written.
    Written { path: PathBuf, bytes: u64 },
    /// The job was cancelled from outside.
    Cancelled,
    /// A stage task died unexpectedly.
    Internal(String),
}

/// Bookkeeping inconsistency. Signals a stage bug, never bad input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("page {got} scanned out of order (expected {expected})")]
    OutOfOrder { expected: usize, got: usize },
    #[error("event for unknown page {0}")]
    UnknownPage(usize),
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

/// Everything known about one page. Serialised as part of [`JobReport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageReport {
    pub index: usize,
    pub state: PageState,
    pub classification: Classification,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub density: Option<f32>,
    pub words: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PageError>,
}

impl PageReport {
    fn new(index: usize) -> Self {
        Self {
            index,
            state: PageState::Scanned,
            classification: Classification::Unknown,
            density: None,
            words: 0,
            error: None,
        }
    }

    fn advance(&mut self, next: PageState) -> Result<(), InvalidTransition> {
        self.state.advance(self.index, next)
    }

    /// One line for the user: included, excluded-blank, or failed with reason.
    pub fn describe(&self) -> String {
        match self.state {
            PageState::Ready => format!("page {}: included ({} words)", self.index, self.words),
            PageState::Excluded => format!("page {}: excluded (blank)", self.index),
            PageState::Failed => format!(
                "page {}: failed: {}",
                self.index,
                self.error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string())
            ),
            other => format!("page {}: abandoned while {}", self.index, other),
        }
    }
}

/// Why a job produced no PDF.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The scanner failed; everything in flight was abandoned.
    Scan { detail: String },
    /// The OCR engine was unusable, so scanning never started.
    OcrUnavailable { detail: String },
    /// The PDF could not be built or written.
    Assemble { detail: String },
    /// The job was cancelled from outside.
    Cancelled,
    /// The feeder produced no frames.
    NoPagesScanned,
    /// Every page was blank.
    NoContentPages,
    /// Nothing reached the PDF and at least one page failed.
    AllPagesFailed,
    /// A stage task crashed.
    Internal { detail: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Scan { detail } => write!(f, "scan error: {detail}"),
            FailureReason::OcrUnavailable { detail } => write!(f, "OCR unavailable: {detail}"),
            FailureReason::Assemble { detail } => write!(f, "assemble error: {detail}"),
            FailureReason::Cancelled => f.write_str("cancelled"),
            FailureReason::NoPagesScanned => f.write_str("no pages scanned"),
            FailureReason::NoContentPages => f.write_str("no content pages"),
            FailureReason::AllPagesFailed => f.write_str("all content pages failed"),
            FailureReason::Internal { detail } => write!(f, "internal error: {detail}"),
        }
    }
}

/// Whole-job result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Success,
    PartialSuccess { failed: Vec<usize> },
    Failure { reason: FailureReason },
}

impl JobOutcome {
    /// `Success` and `PartialSuccess` both produce a PDF.
    pub fn is_success(&self) -> bool {
        !matches!(self, JobOutcome::Failure { .. })
    }
}

/// Aggregate counters for a finished job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStats {
    pub scanned: usize,
    pub included: usize,
    pub excluded: usize,
    pub failed: usize,
    pub duration_ms: u64,
    pub pdf_bytes: u64,
}

/// Final, serialisable account of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub outcome: JobOutcome,
    pub pages: Vec<PageReport>,
    /// Where the PDF was written; `None` for every failure.
    pub output: Option<PathBuf>,
    pub stats: JobStats,
}

impl JobReport {
    pub fn included_pages(&self) -> Vec<usize> {
        self.indices_in(PageState::Ready)
    }

    pub fn excluded_pages(&self) -> Vec<usize> {
        self.indices_in(PageState::Excluded)
    }

    pub fn failed_pages(&self) -> Vec<usize> {
        self.indices_in(PageState::Failed)
    }

    fn indices_in(&self, state: PageState) -> Vec<usize> {
        self.pages
            .iter()
            .filter(|p| p.state == state)
            .map(|p| p.index)
            .collect()
    }

    /// The one-line summary printed by the CLI.
    ///
    /// `7 pages scanned: 5 included, 2 excluded as blank [2, 5], 0 failed`
    pub fn summary(&self) -> String {
        let excluded = self.excluded_pages();
        let failed = self.failed_pages();
        let mut s = format!(
            "{} pages scanned: {} included, {} excluded as blank",
            self.stats.scanned, self.stats.included, self.stats.excluded
        );
        if !excluded.is_empty() {
            s.push_str(&format!(" {excluded:?}"));
        }
        s.push_str(&format!(", {} failed", self.stats.failed));
        if !failed.is_empty() {
            s.push_str(&format!(" {failed:?}"));
        }
        s
    }

    /// `Ok` for `Success` and `PartialSuccess`, the matching fatal error otherwise.
    pub fn into_result(self) -> Result<JobReport, Scan2PdfError> {
        let reason = match &self.outcome {
            JobOutcome::Failure { reason } => reason.clone(),
            _ => return Ok(self),
        };
        Err(match reason {
            FailureReason::Scan { detail } => Scan2PdfError::Scan(detail),
            FailureReason::OcrUnavailable { detail } => Scan2PdfError::OcrUnavailable(detail),
            FailureReason::Assemble { detail } => Scan2PdfError::Assemble(detail),
            FailureReason::Cancelled => Scan2PdfError::Cancelled,
            FailureReason::NoPagesScanned => Scan2PdfError::NoPagesScanned,
            FailureReason::NoContentPages => Scan2PdfError::NoContentPages {
                excluded: self.stats.excluded,
            },
            FailureReason::AllPagesFailed => Scan2PdfError::AllPagesFailed {
                failed: self.stats.failed,
                first_error: self
                    .pages
                    .iter()
                    .find_map(|p| p.error.as_ref())
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string()),
            },
            FailureReason::Internal { detail } => Scan2PdfError::Internal(detail),
        })
    }

    /// Like [`into_result`](Self::into_result) but a `PartialSuccess` is an error too.
    pub fn into_strict_result(self) -> Result<JobReport, Scan2PdfError> {
        let report = self.into_result()?;
        if let JobOutcome::PartialSuccess { failed } = &report.outcome {
            return Err(Scan2PdfError::PartialFailure {
                failed: failed.len(),
                total: report.stats.scanned,
            });
        }
        Ok(report)
    }
}

/// The ledger for one run.
#[derive(Debug)]
pub struct Job {
    pages: Vec<PageReport>,
    scan_error: Option<String>,
    ocr_unavailable: Option<String>,
    assemble_error: Option<String>,
    internal_error: Option<String>,
    cancelled: bool,
    output: Option<(PathBuf, u64)>,
    started: Instant,
}

impl Default for Job {
    fn default() -> Self {
        Self::new()
    }
}

impl Job {
    pub fn new() -> Self {
        Self {
            pages: Vec::new(),
            scan_error: None,
            ocr_unavailable: None,
            assemble_error: None,
            internal_error: None,
            cancelled: false,
            output: None,
            started: Instant::now(),
        }
    }

    pub fn pages(&self) -> &[PageReport] {
        &self.pages
    }

    pub fn page(&self, index: usize) -> Option<&PageReport> {
        index.checked_sub(1).and_then(|i| self.pages.get(i))
    }

    fn page_mut(&mut self, index: usize) -> Result<&mut PageReport, LedgerError> {
        index
            .checked_sub(1)
            .and_then(|i| self.pages.get_mut(i))
            .ok_or(LedgerError::UnknownPage(index))
    }

    /// Whether every recorded page has reached a terminal state.
    pub fn is_settled(&self) -> bool {
        self.pages.iter().all(|p| p.state.is_terminal())
    }

    /// Record one event.
    pub fn apply(&mut self, event: JobEvent) -> Result<(), LedgerError> {
        match event {
            JobEvent::Scanned { index } => {
                let expected = self.pages.len() + 1;
                if index != expected {
                    return Err(LedgerError::OutOfOrder {
                        expected,
                        got: index,
                    });
                }
                self.pages.push(PageReport::new(index));
            }
            JobEvent::Classified {
                index,
                classification,
                density,
            } => {
                let page = self.page_mut(index)?;
                let next = match classification {
                    Classification::Blank => PageState::Excluded,
                    _ => PageState::Classified,
                };
                page.advance(next)?;
                page.classification = classification;
                page.density = density;
            }
            JobEvent::OcrDone { index, words } => {
                let page = self.page_mut(index)?;
                page.advance(PageState::OcrDone)?;
                page.words = words;
            }
            JobEvent::Ready { index } => {
                self.page_mut(index)?.advance(PageState::Ready)?;
            }
            JobEvent::PageFailed(error) => {
                let page = self.page_mut(error.page())?;
                page.advance(PageState::Failed)?;
                page.error = Some(error);
            }
            JobEvent::OcrUnavailable(detail) => self.ocr_unavailable = Some(detail),
            JobEvent::ScanFailed(e) => self.scan_error = Some(e.to_string()),
            JobEvent::AssembleFailed(e) => self.assemble_error = Some(e.to_string()),
            JobEvent::Written { path, bytes } => self.output = Some((path, bytes)),
            JobEvent::Cancelled => self.cancelled = true,
            JobEvent::Internal(detail) => {
                self.internal_error.get_or_insert(detail);
            }
        }
        Ok(())
    }

    /// Derive the outcome. Meaningful once the pipeline has drained.
    pub fn outcome(&self) -> JobOutcome {
        let fail = |reason| JobOutcome::Failure { reason };

        if let Some(ref detail) = self.scan_error {
            return fail(FailureReason::Scan {
                detail: detail.clone(),
            });
        }
        if self.cancelled {
            return fail(FailureReason::Cancelled);
        }
        if let Some(ref detail) = self.ocr_unavailable {
            return fail(FailureReason::OcrUnavailable {
                detail: detail.clone(),
            });
        }
        if let Some(ref detail) = self.internal_error {
            return fail(FailureReason::Internal {
                detail: detail.clone(),
            });
        }
        if let Some(ref detail) = self.assemble_error {
            return fail(FailureReason::Assemble {
                detail: detail.clone(),
            });
        }
        if let Some(unsettled) = self.pages.iter().find(|p| !p.state.is_terminal()) {
            return fail(FailureReason::Internal {
                detail: format!(
                    "page {} never settled (left in state {})",
                    unsettled.index, unsettled.state
                ),
            });
        }
        if self.pages.is_empty() {
            return fail(FailureReason::NoPagesScanned);
        }

        let count = |state| self.pages.iter().filter(|p| p.state == state).count();
        let ready = count(PageState::Ready);
        let failed: Vec<usize> = self
            .pages
            .iter()
            .filter(|p| p.state == PageState::Failed)
            .map(|p| p.index)
            .collect();

        if ready == 0 {
            return if failed.is_empty() {
                fail(FailureReason::NoContentPages)
            } else {
                fail(FailureReason::AllPagesFailed)
            };
        }
        if failed.is_empty() {
            JobOutcome::Success
        } else {
            JobOutcome::PartialSuccess { failed }
        }
    }

    /// Freeze the ledger into a report.
    pub fn into_report(self) -> JobReport {
        let outcome = self.outcome();
        let count = |state| self.pages.iter().filter(|p| p.state == state).count();
        let (output, pdf_bytes) = match (&outcome, self.output) {
            (o, Some((path, bytes))) if o.is_success() => (Some(path), bytes),
            _ => (None, 0),
        };
        let stats = JobStats {
            scanned: self.pages.len(),
            included: count(PageState::Ready),
            excluded: count(PageState::Excluded),
            failed: count(PageState::Failed),
            duration_ms: self.started.elapsed().as_millis() as u64,
            pdf_bytes,
        };
        JobReport {
            outcome,
            pages: self.pages,
            output,
            stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanned(job: &mut Job, n: usize) {
        for index in 1..=n {
            job.apply(JobEvent::Scanned { index }).unwrap();
        }
    }

    fn content(job: &mut Job, index: usize) {
        job.apply(JobEvent::Classified {
            index,
            classification: Classification::Content,
            density: Some(0.1),
        })
        .unwrap();
    }

    fn blank(job: &mut Job, index: usize) {
        job.apply(JobEvent::Classified {
            index,
            classification: Classification::Blank,
            density: Some(0.0),
        })
        .unwrap();
    }

    fn ready(job: &mut Job, index: usize) {
        content(job, index);
        job.apply(JobEvent::OcrDone { index, words: 10 }).unwrap();
        job.apply(JobEvent::Ready { index }).unwrap();
    }

    fn ocr_failed(job: &mut Job, index: usize) {
        content(job, index);
        job.apply(JobEvent::PageFailed(PageError::OcrFailed {
            page: index,
            attempts: 1,
            detail: "segfault".into(),
        }))
        .unwrap();
    }

    #[test]
    fn scanned_pages_must_arrive_in_order() {
        let mut job = Job::new();
        job.apply(JobEvent::Scanned { index: 1 }).unwrap();
        let err = job.apply(JobEvent::Scanned { index: 3 }).unwrap_err();
        assert_eq!(
            err,
            LedgerError::OutOfOrder {
                expected: 2,
                got: 3
            }
        );
    }

    #[test]
    fn events_for_unknown_pages_are_rejected() {
        let mut job = Job::new();
        let err = job.apply(JobEvent::Ready { index: 1 }).unwrap_err();
        assert_eq!(err, LedgerError::UnknownPage(1));
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let mut job = Job::new();
        scanned(&mut job, 1);
        blank(&mut job, 1);
        let err = job.apply(JobEvent::OcrDone { index: 1, words: 3 }).unwrap_err();
        assert!(matches!(err, LedgerError::Transition(_)));
    }

    #[test]
    fn all_ready_is_success() {
        let mut job = Job::new();
        scanned(&mut job, 3);
        for i in 1..=3 {
            ready(&mut job, i);
        }
        assert!(job.is_settled());
        assert_eq!(job.outcome(), JobOutcome::Success);
    }

    #[test]
    fn blank_pages_do_not_spoil_success() {
        let mut job = Job::new();
        scanned(&mut job, 3);
        ready(&mut job, 1);
        blank(&mut job, 2);
        ready(&mut job, 3);
        assert_eq!(job.outcome(), JobOutcome::Success);
    }

    #[test]
    fn one_failure_among_ready_pages_is_partial_success() {
        let mut job = Job::new();
        scanned(&mut job, 3);
        ready(&mut job, 1);
        ocr_failed(&mut job, 2);
        ready(&mut job, 3);
        assert_eq!(
            job.outcome(),
            JobOutcome::PartialSuccess { failed: vec![2] }
        );
    }

    #[test]
    fn all_blank_is_no_content_pages() {
        let mut job = Job::new();
        scanned(&mut job, 2);
        blank(&mut job, 1);
        blank(&mut job, 2);
        assert_eq!(
            job.outcome(),
            JobOutcome::Failure {
                reason: FailureReason::NoContentPages
            }
        );
    }

    #[test]
    fn failures_without_ready_pages_are_all_failed() {
        let mut job = Job::new();
        scanned(&mut job, 2);
        blank(&mut job, 1);
        ocr_failed(&mut job, 2);
        assert_eq!(
            job.outcome(),
            JobOutcome::Failure {
                reason: FailureReason::AllPagesFailed
            }
        );
    }

    #[test]
    fn empty_feeder_is_no_pages_scanned() {
        assert_eq!(
            Job::new().outcome(),
            JobOutcome::Failure {
                reason: FailureReason::NoPagesScanned
            }
        );
    }

    #[test]
    fn scan_error_wins_over_everything() {
        let mut job = Job::new();
        scanned(&mut job, 2);
        ready(&mut job, 1);
        job.apply(JobEvent::ScanFailed(ScanError::Decode {
            frame: 3,
            detail: "truncated".into(),
        }))
        .unwrap();
        match job.outcome() {
            JobOutcome::Failure {
                reason: FailureReason::Scan { detail },
            } => assert!(detail.contains("truncated")),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn unsettled_page_without_cancellation_is_internal_error() {
        let mut job = Job::new();
        scanned(&mut job, 1);
        content(&mut job, 1);
        assert!(!job.is_settled());
        assert!(matches!(
            job.outcome(),
            JobOutcome::Failure {
                reason: FailureReason::Internal { .. }
            }
        ));
    }

    #[test]
    fn report_summary_lists_excluded_and_failed() {
        let mut job = Job::new();
        scanned(&mut job, 4);
        ready(&mut job, 1);
        blank(&mut job, 2);
        ocr_failed(&mut job, 3);
        ready(&mut job, 4);
        job.apply(JobEvent::Written {
            path: PathBuf::from("/tmp/out.pdf"),
            bytes: 1234,
        })
        .unwrap();

        let report = job.into_report();
        assert_eq!(
            report.summary(),
            "4 pages scanned: 2 included, 1 excluded as blank [2], 1 failed [3]"
        );
        assert_eq!(report.output, Some(PathBuf::from("/tmp/out.pdf")));
        assert_eq!(report.stats.pdf_bytes, 1234);
        assert_eq!(report.included_pages(), vec![1, 4]);
        assert!(report.pages[2].describe().contains("failed"));
        assert!(report.pages[1].describe().contains("excluded"));
    }

    #[test]
    fn failed_job_never_reports_an_output() {
        let mut job = Job::new();
        scanned(&mut job, 1);
        blank(&mut job, 1);
        job.apply(JobEvent::Written {
            path: PathBuf::from("/tmp/out.pdf"),
            bytes: 10,
        })
        .unwrap();
        let report = job.into_report();
        assert!(report.output.is_none());
        assert!(matches!(
            report.into_result(),
            Err(Scan2PdfError::NoContentPages { excluded: 1 })
        ));
    }

    #[test]
    fn strict_result_rejects_partial_success() {
        let mut job = Job::new();
        scanned(&mut job, 2);
        ready(&mut job, 1);
        ocr_failed(&mut job, 2);
        let err = job.into_report().into_strict_result().unwrap_err();
        assert!(matches!(
            err,
            Scan2PdfError::PartialFailure {
                failed: 1,
                total: 2
            }
        ));
    }

    #[test]
    fn report_serialises_to_json() {
        let mut job = Job::new();
        scanned(&mut job, 1);
        ready(&mut job, 1);
        let report = job.into_report();
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains(r#""status":"success""#), "got {json}");
        let back: JobReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.pages, report.pages);
    }
}
