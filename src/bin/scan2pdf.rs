//! CLI binary for scan2pdf.
//!
//! A thin shim over the library crate that layers CLI flags, environment
//! variables and config files into a `PipelineConfig`, runs one job and
//! prints the report.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use scan2pdf::{
    DirectorySource, FileConfig, JobOutcome, JobReport, Pipeline, PipelineConfig,
    PipelineProgressCallback, ProgressCallback, ScanMode, ScanSource,
};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: a spinner at the bottom of the terminal plus
/// one line per settled page. The total is unknown until the feeder runs
/// dry, so there is no bar, only counters.
struct CliProgressCallback {
    bar: ProgressBar,
    scanned: AtomicUsize,
    settled: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  {msg}  ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        bar.set_style(style);
        bar.set_prefix("Preparing");
        bar.set_message("Checking OCR engine…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            scanned: AtomicUsize::new(0),
            settled: AtomicUsize::new(0),
        })
    }

    fn refresh(&self) {
        let scanned = self.scanned.load(Ordering::SeqCst);
        let settled = self.settled.load(Ordering::SeqCst);
        self.bar
            .set_message(format!("{scanned} scanned, {settled} done"));
    }

    fn settle(&self) {
        self.settled.fetch_add(1, Ordering::SeqCst);
        self.refresh();
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_job_start(&self) {
        self.bar.set_prefix("Scanning");
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold("Feeding pages…")
        ));
    }

    fn on_page_scanned(&self, _index: usize) {
        self.scanned.fetch_add(1, Ordering::SeqCst);
        self.refresh();
    }

    fn on_page_excluded(&self, index: usize, density: f32) {
        self.bar.println(format!(
            "  {} Page {:>3}  {}",
            dim("○"),
            index,
            dim(&format!("blank (density {density:.5})")),
        ));
        self.settle();
    }

    fn on_page_ready(&self, index: usize, words: usize) {
        self.bar.println(format!(
            "  {} Page {:>3}  {}",
            green("✓"),
            index,
            dim(&format!("{words:>5} words")),
        ));
        self.settle();
    }

    fn on_page_failed(&self, index: usize, error: &str) {
        // Truncate very long error messages to keep output tidy.
        let msg = match error.char_indices().nth(79) {
            Some((cut, _)) => format!("{}\u{2026}", &error[..cut]),
            None => error.to_string(),
        };
        self.bar.println(format!(
            "  {} Page {:>3}  {}",
            red("✗"),
            index,
            red(&msg),
        ));
        self.settle();
    }

    fn on_job_complete(&self, _report: &JobReport) {
        self.bar.finish_and_clear();
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Duplex scan into a searchable PDF, dropping blank back sides
  scan2pdf letter.pdf

  # German text, colour, at most 10 sheets
  scan2pdf -l deu --color --max-pages 10 invoice.pdf

  # Keep the raw frames, then rebuild the PDF from them later
  scan2pdf --work frames/ contract.pdf
  scan2pdf --from-dir frames/ --lang deu+eng contract.pdf

  # Machine-readable report
  scan2pdf --json --no-progress scan.pdf > report.json

CONFIG FILES:
  /etc/scan2pdf.toml, then $XDG_CONFIG_HOME/scan2pdf.toml (or
  ~/.config/scan2pdf.toml). Keys match the long flag names with
  underscores, e.g.:

    device = "fujitsu:ScanSnap S1500:53095"
    ocr_lang = "deu"
    blank_threshold = 0.003

  Precedence: flag > environment variable > config file > default.

ENVIRONMENT VARIABLES:
  SCAN2PDF_DEVICE          SANE device name
  SCAN2PDF_LANG            Tesseract language(s)
  SCAN2PDF_CONFIG          Config file path
  RUST_LOG                 Log filter (overrides --verbose)

EXIT STATUS:
  0  PDF written (some pages may have failed, see the summary)
  1  no PDF written
  2  invalid arguments
"#;

/// Scan a stack of paper through the document feeder into one searchable PDF.
#[derive(Parser, Debug)]
#[command(
    name = "scan2pdf",
    version,
    about = "Scan a stack of paper through the document feeder into one searchable PDF",
    long_about = "Drive a SANE document feeder page by page, drop blank pages, OCR the rest \
with Tesseract and write a single compressed PDF with an invisible text layer. Scanning, \
blank detection and OCR overlap, so the job takes about as long as the slowest stage.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Output PDF path.
    output: PathBuf,

    /// Read settings from this TOML file instead of the default locations.
    #[arg(long, env = "SCAN2PDF_CONFIG")]
    config: Option<PathBuf>,

    /// SANE device name (see `scanimage -L`).
    #[arg(short, long, env = "SCAN2PDF_DEVICE")]
    device: Option<String>,

    /// Scan mode.
    #[arg(long, env = "SCAN2PDF_MODE", value_enum, conflicts_with = "color")]
    mode: Option<ModeArg>,

    /// Shorthand for `--mode color`.
    #[arg(long)]
    color: bool,

    /// Scan resolution in DPI (75–1200).
    #[arg(long, env = "SCAN2PDF_RESOLUTION",
          value_parser = clap::value_parser!(u32).range(75..=1200))]
    resolution: Option<u32>,

    /// Stop after this many frames.
    #[arg(long, env = "SCAN2PDF_MAX_PAGES",
          value_parser = clap::value_parser!(u64).range(1..))]
    max_pages: Option<u64>,

    /// Do not scan; read previously saved frames from this directory.
    #[arg(long, value_name = "DIR")]
    from_dir: Option<PathBuf>,

    /// Also keep every raw frame in this directory.
    #[arg(long, value_name = "DIR", env = "SCAN2PDF_WORK")]
    work: Option<PathBuf>,

    /// Keep blank pages instead of dropping them.
    #[arg(long, env = "SCAN2PDF_KEEP_EMPTY")]
    keep_empty: bool,

    /// Dark-pixel fraction below which a page counts as blank.
    #[arg(long, env = "SCAN2PDF_BLANK_THRESHOLD")]
    blank_threshold: Option<f32>,

    /// Tesseract language(s), e.g. `eng` or `deu+eng`.
    #[arg(short, long, env = "SCAN2PDF_LANG")]
    lang: Option<String>,

    /// Tesseract OCR engine mode.
    #[arg(long, env = "SCAN2PDF_OEM")]
    oem: Option<String>,

    /// Tesseract page segmentation mode.
    #[arg(long, env = "SCAN2PDF_PSM")]
    psm: Option<u8>,

    /// Accept Tesseract 3.x.
    #[arg(long)]
    old_tesseract: bool,

    /// Extra OCR attempts per page.
    #[arg(long, env = "SCAN2PDF_OCR_RETRIES")]
    ocr_retries: Option<u32>,

    /// Delay before the first OCR retry in milliseconds, doubled each time.
    #[arg(long, env = "SCAN2PDF_RETRY_BACKOFF_MS")]
    retry_backoff_ms: Option<u64>,

    /// Pages OCR'd concurrently.
    #[arg(long, env = "SCAN2PDF_OCR_WORKERS")]
    ocr_workers: Option<usize>,

    /// Capacity of each queue between stages.
    #[arg(long, env = "SCAN2PDF_QUEUE_DEPTH")]
    queue_depth: Option<usize>,

    /// Print the job report as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Disable the progress spinner.
    #[arg(long, env = "SCAN2PDF_NO_PROGRESS")]
    no_progress: bool,

    /// Also write DEBUG-level logs to this file.
    #[arg(long, value_name = "FILE")]
    log: Option<PathBuf>,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "SCAN2PDF_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "SCAN2PDF_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Lineart,
    Gray,
    Color,
}

impl From<ModeArg> for ScanMode {
    fn from(v: ModeArg) -> Self {
        match v {
            ModeArg::Lineart => ScanMode::Lineart,
            ModeArg::Gray => ScanMode::Gray,
            ModeArg::Color => ScanMode::Color,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The spinner already shows what matters; keep library INFO lines from
    // tearing it up unless asked for.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else if show_progress {
        "warn"
    } else {
        "info"
    };
    let stderr_layer = fmt::layer().with_writer(io::stderr).with_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
    );
    let file_layer = match cli.log {
        Some(ref path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(LevelFilter::DEBUG),
            )
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    // ── Build config ─────────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn PipelineProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb)?;

    // ── Pick the frame source ────────────────────────────────────────────
    let pipeline = Pipeline::new(config);
    let source: Box<dyn ScanSource> = match cli.from_dir {
        Some(ref dir) => Box::new(
            DirectorySource::open(dir)
                .with_context(|| format!("Failed to read frames from {}", dir.display()))?,
        ),
        None => Box::new(pipeline.scanner()),
    };

    let cancel = pipeline.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    // ── Run ──────────────────────────────────────────────────────────────
    let report = pipeline.run(source, &cli.output).await;

    if cli.json {
        let json = serde_json::to_string_pretty(&report).context("Failed to serialise report")?;
        println!("{json}");
    }
    if !cli.quiet {
        print_summary(&report, show_progress);
    }

    Ok(if report.outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Defaults, then config file, then environment and flags.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let file = match cli.config {
        Some(ref path) => FileConfig::load(path).context("Failed to load config file")?,
        None => FileConfig::discover().context("Failed to load config file")?,
    };

    let mut builder = PipelineConfig::builder().apply_file(&file);

    if let Some(ref device) = cli.device {
        builder = builder.device(device.clone());
    }
    if cli.color {
        builder = builder.scan_mode(ScanMode::Color);
    } else if let Some(mode) = cli.mode {
        builder = builder.scan_mode(mode.into());
    }
    if let Some(dpi) = cli.resolution {
        builder = builder.resolution(dpi);
    }
    if let Some(n) = cli.max_pages {
        builder = builder.max_pages(usize::try_from(n).context("--max-pages is too large")?);
    }
    if let Some(ref dir) = cli.work {
        builder = builder.frames_dir(dir.clone());
    }
    if cli.keep_empty {
        builder = builder.keep_blank(true);
    }
    if let Some(t) = cli.blank_threshold {
        builder = builder.blank_threshold(t);
    }
    if let Some(ref lang) = cli.lang {
        builder = builder.ocr_lang(lang.clone());
    }
    if let Some(ref oem) = cli.oem {
        builder = builder.ocr_oem(oem.clone());
    }
    if let Some(psm) = cli.psm {
        builder = builder.ocr_psm(psm);
    }
    if cli.old_tesseract {
        builder = builder.allow_old_tesseract(true);
    }
    if let Some(n) = cli.ocr_retries {
        builder = builder.ocr_retries(n);
    }
    if let Some(ms) = cli.retry_backoff_ms {
        builder = builder.retry_backoff_ms(ms);
    }
    if let Some(n) = cli.ocr_workers {
        builder = builder.ocr_workers(n);
    }
    if let Some(n) = cli.queue_depth {
        builder = builder.queue_depth(n);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

fn print_summary(report: &JobReport, progress_shown: bool) {
    // Without the spinner nobody has seen the per-page lines yet.
    if !progress_shown {
        for page in &report.pages {
            eprintln!("  {}", page.describe());
        }
    }

    match report.outcome {
        JobOutcome::Success | JobOutcome::PartialSuccess { .. } => {
            let mark = if report.stats.failed == 0 {
                green("✔")
            } else {
                cyan("⚠")
            };
            eprintln!("{mark} {}", report.summary());
            if let Some(ref path) = report.output {
                eprintln!(
                    "   {}  →  {}  {}",
                    dim(&format!("{} bytes", report.stats.pdf_bytes)),
                    bold(&path.display().to_string()),
                    dim(&format!("{}ms", report.stats.duration_ms)),
                );
            }
        }
        JobOutcome::Failure { .. } => {
            let message = match report.clone().into_result() {
                Err(e) => e.to_string(),
                Ok(_) => report.summary(),
            };
            eprintln!("{} {}", red("✘"), red(&message));
            if !report.pages.is_empty() {
                eprintln!("   {}", dim(&report.summary()));
            }
        }
    }
}
