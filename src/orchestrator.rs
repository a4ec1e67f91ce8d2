//! Pipeline orchestrator: run the stages concurrently and keep the ledger.
//!
//! ```text
//!            queue_depth          queue_depth            queue_depth
//! scanner ──────────────▶ classifier ──────────▶ OCR pool ──────────▶ assembler
//!    │                        │              (ocr_workers)               │
//!    └────────────── JobEvent ┴──────────────────┴───────────────────────┘
//!                                    │
//!                                    ▼
//!                       ledger loop (single writer of Job)
//! ```
//!
//! Every stage is its own tokio task. Pages move between them by value on
//! bounded `mpsc` queues. The queues alone do not bound memory: finished
//! OCR pages wait in the assembler for a slow lower index. So the scanner
//! also takes one permit per frame from a look-ahead [`Semaphore`]
//! ([`PipelineConfig::look_ahead`] permits), and the assembler returns
//! permits as its cursor moves past pages. A stalled page therefore stops
//! the feeder after a bounded number of sheets. Stages report state changes as
//! [`JobEvent`]s on an unbounded channel; [`Pipeline::run`] drains that
//! channel, applies each event to the [`Job`] and fires progress callbacks.
//!
//! A fatal scan failure, a crashed stage or an external
//! [`CancelHandle::cancel`] flips a `watch` flag that every stage `select!`s
//! on. In-flight futures are dropped, which kills any running child process.
//!
//! The PDF is written only after the outcome is known, so a failed or
//! cancelled job never leaves a file behind.

use crate::config::PipelineConfig;
use crate::error::{AssembleError, PageError, Scan2PdfError};
use crate::job::{Job, JobEvent, JobOutcome, JobReport};
use crate::page::{Classification, InvalidTransition, Page, PageState};
use crate::pipeline::assemble::{self, Assembler, LopdfEncoder, PageEncoder};
use crate::pipeline::classify::{Classifier, DensityClassifier};
use crate::pipeline::ocr::{self, Recognizer, TesseractRecognizer};
use crate::pipeline::scan::{Frame, ScanSource, ScanimageSource};
use crate::pipeline::Flow;
use crate::progress::{NoopProgressCallback, ProgressCallback};
use futures::StreamExt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

type Events = mpsc::UnboundedSender<JobEvent>;

/// Cancels the jobs of one [`Pipeline`].
///
/// Cancellation is sticky: once cancelled, the pipeline refuses to start
/// further jobs.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// A configured scan-to-PDF pipeline.
///
/// The collaborators default to the production implementations derived
/// from the config and can be swapped with the `with_*` methods.
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    classifier: Arc<dyn Classifier>,
    recognizer: Arc<dyn Recognizer>,
    encoder: Arc<dyn PageEncoder>,
    cancel: Arc<watch::Sender<bool>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            classifier: Arc::new(DensityClassifier::from_config(&config)),
            recognizer: Arc::new(TesseractRecognizer::from_config(&config)),
            encoder: Arc::new(LopdfEncoder::from_config(&config)),
            config: Arc::new(config),
            cancel: Arc::new(cancel),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_recognizer(mut self, recognizer: Arc<dyn Recognizer>) -> Self {
        self.recognizer = recognizer;
        self
    }

    pub fn with_encoder(mut self, encoder: Arc<dyn PageEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: Arc::clone(&self.cancel),
        }
    }

    /// The `scanimage` source described by the config.
    pub fn scanner(&self) -> ScanimageSource {
        ScanimageSource::from_config(&self.config)
    }

    /// Scan everything `source` yields and write the PDF to `output`.
    ///
    /// Always returns a report; check [`JobReport::outcome`] or call
    /// [`JobReport::into_result`]. Nothing is written to `output` unless the
    /// outcome is `Success` or `PartialSuccess`.
    pub async fn run(&self, source: Box<dyn ScanSource>, output: impl AsRef<Path>) -> JobReport {
        let output = output.as_ref();
        let progress: ProgressCallback = self
            .config
            .progress_callback
            .clone()
            .unwrap_or_else(|| Arc::new(NoopProgressCallback));
        let mut job = Job::new();

        info!("Starting job → {}", output.display());
        debug!("Config: {:?}", self.config);
        progress.on_job_start();

        if let Err(e) = self.recognizer.preflight().await {
            error!("OCR engine unusable: {}", e);
            record(&mut job, JobEvent::OcrUnavailable(e.to_string()), &progress);
            return finish(job, &progress);
        }
        if *self.cancel.borrow() {
            record(&mut job, JobEvent::Cancelled, &progress);
            return finish(job, &progress);
        }

        let (abort_tx, abort_rx) = watch::channel(false);
        let abort = Arc::new(abort_tx);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let depth = self.config.queue_depth;
        let (scan_tx, scan_rx) = mpsc::channel::<Page>(depth);
        let (class_tx, class_rx) = mpsc::channel::<Flow>(depth);
        let (ocr_tx, ocr_rx) = mpsc::channel::<Flow>(depth);
        let window = Arc::new(Semaphore::new(self.config.look_ahead()));

        let stages: Vec<(&'static str, JoinHandle<()>)> = vec![
            (
                "scanner",
                spawn_stage(
                    scan_stage(
                        source,
                        self.config.max_pages,
                        Arc::clone(&window),
                        scan_tx,
                        events_tx.clone(),
                        Arc::clone(&abort),
                        abort_rx.clone(),
                    ),
                    events_tx.clone(),
                    Arc::clone(&abort),
                ),
            ),
            (
                "classifier",
                spawn_stage(
                    classify_stage(
                        Arc::clone(&self.classifier),
                        scan_rx,
                        class_tx,
                        events_tx.clone(),
                        abort_rx.clone(),
                    ),
                    events_tx.clone(),
                    Arc::clone(&abort),
                ),
            ),
            (
                "ocr",
                spawn_stage(
                    ocr_stage(
                        Arc::clone(&self.recognizer),
                        Arc::clone(&self.config),
                        class_rx,
                        ocr_tx,
                        events_tx.clone(),
                        abort_rx.clone(),
                    ),
                    events_tx.clone(),
                    Arc::clone(&abort),
                ),
            ),
        ];
        let assembler = tokio::spawn(assemble_stage(
            Arc::clone(&self.encoder),
            ocr_rx,
            window,
            events_tx.clone(),
            Arc::clone(&abort),
            abort_rx.clone(),
        ));
        drop(events_tx);

        // ── Ledger loop ──────────────────────────────────────────────────
        let mut external = self.cancel.subscribe();
        let mut cancel_seen = false;
        loop {
            tokio::select! {
                event = events_rx.recv() => match event {
                    Some(event) => record(&mut job, event, &progress),
                    None => break,
                },
                _ = aborted(&mut external), if !cancel_seen => {
                    cancel_seen = true;
                    warn!("Cancellation requested, stopping all stages");
                    record(&mut job, JobEvent::Cancelled, &progress);
                    abort.send_replace(true);
                }
            }
        }

        for (name, handle) in stages {
            if let Err(e) = handle.await {
                record(
                    &mut job,
                    JobEvent::Internal(format!("{name} stage crashed: {e}")),
                    &progress,
                );
            }
        }
        let document = match assembler.await {
            Ok(document) => document,
            Err(e) => {
                record(
                    &mut job,
                    JobEvent::Internal(format!("assembler stage crashed: {e}")),
                    &progress,
                );
                None
            }
        };

        // ── Commit ───────────────────────────────────────────────────────
        if job.outcome().is_success() {
            if let Some(bytes) = document {
                let event = match assemble::write_pdf(output, &bytes).await {
                    Ok(written) => JobEvent::Written {
                        path: output.to_path_buf(),
                        bytes: written,
                    },
                    Err(e) => JobEvent::AssembleFailed(e),
                };
                record(&mut job, event, &progress);
            }
        }

        finish(job, &progress)
    }

    /// Run a job on a private runtime, for callers without one.
    pub fn run_blocking(
        &self,
        source: Box<dyn ScanSource>,
        output: impl AsRef<Path>,
    ) -> Result<JobReport, Scan2PdfError> {
        let runtime = tokio::runtime::Runtime::new()
            .map_err(|e| Scan2PdfError::Internal(format!("Failed to create tokio runtime: {e}")))?;
        Ok(runtime.block_on(self.run(source, output)))
    }
}

/// Progress notifications derived from an event, fired once the ledger
/// has accepted it.
enum Notice {
    Scanned(usize),
    Excluded(usize, f32),
    Ready(usize),
    Failed(usize, String),
}

/// Apply one event to the ledger and tell the progress callback.
fn record(job: &mut Job, event: JobEvent, progress: &ProgressCallback) {
    let notice = match &event {
        JobEvent::Scanned { index } => Some(Notice::Scanned(*index)),
        JobEvent::Classified {
            index,
            classification: Classification::Blank,
            density,
        } => {
            let density = density.unwrap_or(0.0);
            info!("Page {}: blank (density {:.5}), excluded", index, density);
            Some(Notice::Excluded(*index, density))
        }
        JobEvent::Ready { index } => Some(Notice::Ready(*index)),
        JobEvent::PageFailed(e) => {
            warn!("{}", e);
            Some(Notice::Failed(e.page(), e.to_string()))
        }
        _ => None,
    };

    if let Err(e) = job.apply(event) {
        error!("Ledger rejected event: {}", e);
        let _ = job.apply(JobEvent::Internal(e.to_string()));
        return;
    }
    match notice {
        Some(Notice::Scanned(index)) => progress.on_page_scanned(index),
        Some(Notice::Excluded(index, density)) => progress.on_page_excluded(index, density),
        Some(Notice::Ready(index)) => {
            let words = job.page(index).map_or(0, |p| p.words);
            progress.on_page_ready(index, words);
        }
        Some(Notice::Failed(index, msg)) => progress.on_page_failed(index, &msg),
        None => {}
    }
}

fn finish(job: Job, progress: &ProgressCallback) -> JobReport {
    let report = job.into_report();
    match &report.outcome {
        JobOutcome::Failure { reason } => error!("Job failed: {}", reason),
        _ => info!("Job complete: {}", report.summary()),
    }
    progress.on_job_complete(&report);
    report
}

// ── Stage tasks ──────────────────────────────────────────────────────────

/// Resolves once the abort flag is raised. Never resolves if the sender is
/// gone without raising it.
async fn aborted(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|v| *v).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Spawn a stage. A stage that trips over the page state machine reports
/// it and stops the whole job.
fn spawn_stage<F>(stage: F, events: Events, abort: Arc<watch::Sender<bool>>) -> JoinHandle<()>
where
    F: Future<Output = Result<(), InvalidTransition>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = stage.await {
            error!("{}", e);
            let _ = events.send(JobEvent::Internal(e.to_string()));
            abort.send_replace(true);
        }
    })
}

/// Send `item` downstream unless the job is aborted first. `false` means stop.
async fn forward<T>(tx: &mpsc::Sender<T>, item: T, abort: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;
        _ = aborted(abort) => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

async fn scan_stage(
    mut source: Box<dyn ScanSource>,
    max_pages: Option<usize>,
    window: Arc<Semaphore>,
    tx: mpsc::Sender<Page>,
    events: Events,
    abort_tx: Arc<watch::Sender<bool>>,
    mut abort: watch::Receiver<bool>,
) -> Result<(), InvalidTransition> {
    let mut index = 1;
    loop {
        if max_pages.is_some_and(|max| index > max) {
            info!("Reached page limit of {}", index - 1);
            break;
        }
        // Returned by the assembler once it moves past this page.
        let permit = tokio::select! {
            biased;
            _ = aborted(&mut abort) => break,
            permit = window.acquire() => permit,
        };
        match permit {
            Ok(permit) => permit.forget(),
            Err(_) => break,
        }
        let frame = tokio::select! {
            biased;
            _ = aborted(&mut abort) => break,
            frame = source.next_frame(index) => frame,
        };
        match frame {
            Ok(Frame::Image(image)) => {
                debug!("Page {}: scanned", index);
                let _ = events.send(JobEvent::Scanned { index });
                if !forward(&tx, Page::scanned(index, image), &mut abort).await {
                    break;
                }
                index += 1;
            }
            Ok(Frame::EndOfFeeder) => break,
            Err(e) => {
                error!("{}", e);
                let _ = events.send(JobEvent::ScanFailed(e));
                abort_tx.send_replace(true);
                break;
            }
        }
    }
    Ok(())
}

async fn classify_stage(
    classifier: Arc<dyn Classifier>,
    mut rx: mpsc::Receiver<Page>,
    tx: mpsc::Sender<Flow>,
    events: Events,
    mut abort: watch::Receiver<bool>,
) -> Result<(), InvalidTransition> {
    loop {
        let mut page = tokio::select! {
            biased;
            _ = aborted(&mut abort) => return Ok(()),
            page = rx.recv() => match page {
                Some(page) => page,
                None => return Ok(()),
            },
        };
        let index = page.index();
        let verdict = tokio::select! {
            biased;
            _ = aborted(&mut abort) => return Ok(()),
            verdict = classifier.classify(&page.image) => verdict,
        };

        let flow = match verdict {
            Ok(verdict) => {
                page.classification = verdict.classification;
                page.density = verdict.density;
                let _ = events.send(JobEvent::Classified {
                    index,
                    classification: verdict.classification,
                    density: verdict.density,
                });
                if verdict.is_blank() {
                    page.advance(PageState::Excluded)?;
                    Flow::Skip(index)
                } else {
                    page.advance(PageState::Classified)?;
                    Flow::Page(page)
                }
            }
            Err(e) => {
                page.advance(PageState::Failed)?;
                let _ = events.send(JobEvent::PageFailed(PageError::ClassifyFailed {
                    page: index,
                    detail: e.to_string(),
                }));
                Flow::Skip(index)
            }
        };
        if !forward(&tx, flow, &mut abort).await {
            return Ok(());
        }
    }
}

async fn ocr_stage(
    recognizer: Arc<dyn Recognizer>,
    config: Arc<PipelineConfig>,
    rx: mpsc::Receiver<Flow>,
    tx: mpsc::Sender<Flow>,
    events: Events,
    mut abort: watch::Receiver<bool>,
) -> Result<(), InvalidTransition> {
    let mut results = ReceiverStream::new(rx)
        .map(|flow| ocr_page(Arc::clone(&recognizer), Arc::clone(&config), flow, events.clone()))
        .buffer_unordered(config.ocr_workers);

    loop {
        let flow = tokio::select! {
            biased;
            _ = aborted(&mut abort) => return Ok(()),
            flow = results.next() => match flow {
                Some(flow) => flow?,
                None => return Ok(()),
            },
        };
        if !forward(&tx, flow, &mut abort).await {
            return Ok(());
        }
    }
}

/// OCR one page. Skip markers pass straight through.
async fn ocr_page(
    recognizer: Arc<dyn Recognizer>,
    config: Arc<PipelineConfig>,
    flow: Flow,
    events: Events,
) -> Result<Flow, InvalidTransition> {
    let mut page = match flow {
        Flow::Page(page) => page,
        skip @ Flow::Skip(_) => return Ok(skip),
    };
    let index = page.index();
    let result = ocr::recognize_with_retry(
        &*recognizer,
        index,
        &page.image,
        config.ocr_retries,
        config.retry_backoff_ms,
    )
    .await;

    match result {
        Ok(layer) => {
            page.advance(PageState::OcrDone)?;
            let _ = events.send(JobEvent::OcrDone {
                index,
                words: layer.words.len(),
            });
            page.text_layer = Some(layer);
            Ok(Flow::Page(page))
        }
        Err(e) => {
            page.advance(PageState::Failed)?;
            let _ = events.send(JobEvent::PageFailed(e));
            Ok(Flow::Skip(index))
        }
    }
}

/// Returns the finished document, or `None` when there is nothing to write.
///
/// Every page the cursor moves past, encoded or skipped, hands its
/// look-ahead permit back to the scanner. The window is closed on exit so a
/// scanner waiting for a permit stops.
async fn assemble_stage(
    encoder: Arc<dyn PageEncoder>,
    rx: mpsc::Receiver<Flow>,
    window: Arc<Semaphore>,
    events: Events,
    abort_tx: Arc<watch::Sender<bool>>,
    abort: watch::Receiver<bool>,
) -> Option<Vec<u8>> {
    let document = assemble_in_order(encoder, rx, &window, events, abort_tx, abort).await;
    window.close();
    document
}

async fn assemble_in_order(
    encoder: Arc<dyn PageEncoder>,
    mut rx: mpsc::Receiver<Flow>,
    window: &Semaphore,
    events: Events,
    abort_tx: Arc<watch::Sender<bool>>,
    mut abort: watch::Receiver<bool>,
) -> Option<Vec<u8>> {
    let mut assembler = Assembler::new(encoder);
    let fail = |e: AssembleError| {
        error!("{}", e);
        let _ = events.send(JobEvent::AssembleFailed(e));
        abort_tx.send_replace(true);
        None
    };

    loop {
        let flow = tokio::select! {
            biased;
            _ = aborted(&mut abort) => return None,
            flow = rx.recv() => match flow {
                Some(flow) => flow,
                None => break,
            },
        };
        let cursor = assembler.next_expected();
        match assembler.accept(flow).await {
            Ok(released) => {
                for index in released {
                    let _ = events.send(JobEvent::Ready { index });
                }
            }
            Err(e) => return fail(e),
        }
        window.add_permits(assembler.next_expected() - cursor);
    }

    if *abort.borrow() {
        return None;
    }
    assembler.finish().await.unwrap_or_else(fail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::FailureReason;

    fn noop() -> ProgressCallback {
        Arc::new(NoopProgressCallback)
    }

    #[test]
    fn rejected_event_becomes_internal_failure() {
        let mut job = Job::new();
        record(&mut job, JobEvent::Scanned { index: 2 }, &noop());
        assert!(matches!(
            job.outcome(),
            JobOutcome::Failure {
                reason: FailureReason::Internal { .. }
            }
        ));
    }

    #[test]
    fn cancel_handles_share_one_flag() {
        let pipeline = Pipeline::new(PipelineConfig::default());
        let a = pipeline.cancel_handle();
        let b = pipeline.cancel_handle();
        assert!(!b.is_cancelled());
        a.cancel();
        assert!(b.is_cancelled());
    }

    /// Stand-in encoder that never touches lopdf.
    struct CountingEncoder;

    impl PageEncoder for CountingEncoder {
        fn encode_page(&self, page: &Page) -> Result<assemble::EncodedPage, AssembleError> {
            Ok(assemble::EncodedPage {
                index: page.index(),
                width_pt: 1.0,
                height_pt: 1.0,
                image: lopdf::Stream::new(lopdf::Dictionary::new(), Vec::new()),
                content: lopdf::Stream::new(lopdf::Dictionary::new(), Vec::new()),
            })
        }

        fn concatenate(&self, pages: Vec<assemble::EncodedPage>) -> Result<Vec<u8>, AssembleError> {
            Ok(vec![pages.len() as u8])
        }
    }

    fn ocr_done(index: usize) -> Flow {
        let mut page = Page::scanned(index, image::DynamicImage::new_luma8(2, 2));
        page.advance(PageState::Classified).unwrap();
        page.advance(PageState::OcrDone).unwrap();
        Flow::Page(page)
    }

    #[tokio::test]
    async fn assembler_returns_permits_only_when_the_cursor_moves() {
        let window = Arc::new(Semaphore::new(0));
        let (tx, rx) = mpsc::channel(8);
        let (events, mut events_rx) = mpsc::unbounded_channel();
        let (abort_tx, abort_rx) = watch::channel(false);
        let stage = tokio::spawn(assemble_stage(
            Arc::new(CountingEncoder),
            rx,
            Arc::clone(&window),
            events,
            Arc::new(abort_tx),
            abort_rx,
        ));

        // Pages 2 and 3 wait for page 1; nothing is handed back yet.
        tx.send(ocr_done(3)).await.unwrap();
        tx.send(Flow::Skip(2)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(window.available_permits(), 0);

        tx.send(ocr_done(1)).await.unwrap();
        let mut ready = Vec::new();
        while ready.len() < 2 {
            if let Some(JobEvent::Ready { index }) = events_rx.recv().await {
                ready.push(index);
            }
        }
        assert_eq!(ready, vec![1, 3]);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(window.available_permits(), 3);

        drop(tx);
        assert_eq!(stage.await.unwrap(), Some(vec![2]));
        assert!(window.is_closed());
    }

    #[tokio::test]
    async fn aborted_resolves_once_raised() {
        let (tx, mut rx) = watch::channel(false);
        tx.send_replace(true);
        tokio::time::timeout(std::time::Duration::from_secs(1), aborted(&mut rx))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn aborted_never_resolves_when_sender_goes_quietly() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        let waited =
            tokio::time::timeout(std::time::Duration::from_millis(50), aborted(&mut rx)).await;
        assert!(waited.is_err());
    }
}
