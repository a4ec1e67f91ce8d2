//! Configuration types for a scan job.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`]. One struct holding every knob makes it easy
//! to share a config across the stage tasks and to log exactly what a run
//! used.
//!
//! Values can also come from a TOML file ([`FileConfig`]); the CLI layers
//! flags and environment variables on top of it.

use crate::error::Scan2PdfError;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Configuration for one scan-to-PDF job.
///
/// Built via [`PipelineConfig::builder()`] or [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use scan2pdf::{PipelineConfig, ScanMode};
///
/// let config = PipelineConfig::builder()
///     .device("fujitsu:ScanSnap S1500:53095")
///     .scan_mode(ScanMode::Color)
///     .ocr_lang("deu")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    // ── Scanner ───────────────────────────────────────────────────────────
    /// Scanner front-end program. Default: `scanimage`.
    pub scan_program: String,

    /// SANE device name. `None` lets the front-end pick its default device.
    pub device: Option<String>,

    /// Lineart, Gray or Color. Default: Lineart.
    ///
    /// Also decides how page images are compressed in the output PDF.
    pub scan_mode: ScanMode,

    /// SANE source option selecting the feeder. Default: `ADF Duplex`.
    pub feeder_source: String,

    /// Scan resolution in DPI. Range: 75–1200. Default: 600.
    ///
    /// The PDF page size is derived from the image size and this value.
    pub resolution: u32,

    /// Physical page width in millimetres. Default: 210 (A4).
    pub page_width_mm: u32,

    /// Physical page height in millimetres. Default: 297 (A4).
    pub page_height_mm: u32,

    /// Stop after this many frames even if the feeder has more. Default: unlimited.
    pub max_pages: Option<usize>,

    /// Per-frame scanner timeout in seconds. Default: 120.
    pub scan_timeout_secs: u64,

    /// Exit codes of the scan program meaning "feeder is empty". Default: `[7]`.
    ///
    /// 7 is SANE_STATUS_NO_DOCS, which `scanimage` returns as its exit status.
    pub end_of_feeder_codes: Vec<i32>,

    /// Also save every raw frame into this directory as `image-NNNN.png`.
    pub frames_dir: Option<PathBuf>,

    // ── Blank detection ───────────────────────────────────────────────────
    /// Pages whose dark-pixel density is below this fraction are blank. Default: 0.002.
    pub blank_threshold: f32,

    /// Luma value (0–255) below which a pixel counts as ink. Default: 128.
    pub dark_level: u8,

    /// Fraction of the width ignored on each side when scoring. Default: 0.06.
    ///
    /// Feeder edges and punched holes show up as dark bands along the
    /// sides of an otherwise empty sheet.
    pub margin_fraction: f32,

    /// Keep every page, skipping blank detection entirely. Default: false.
    pub keep_blank: bool,

    // ── OCR ───────────────────────────────────────────────────────────────
    /// OCR program. Default: `tesseract`.
    pub ocr_program: String,

    /// Tesseract language(s), e.g. `eng` or `deu+eng`. Default: `eng`.
    pub ocr_lang: String,

    /// Tesseract engine mode (0 = legacy, 1 = neural). Default: `1`.
    pub ocr_oem: String,

    /// Tesseract page segmentation mode. Default: engine default.
    pub ocr_psm: Option<u8>,

    /// Accept Tesseract versions older than 4. Default: false.
    pub allow_old_tesseract: bool,

    /// Per-page OCR timeout in seconds. Default: 300.
    pub ocr_timeout_secs: u64,

    /// Extra OCR attempts after a failure. Default: 1.
    pub ocr_retries: u32,

    /// Initial retry delay in milliseconds, doubled on each attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Number of pages OCR'd concurrently. Default: available CPU cores (max 8).
    ///
    /// Tesseract is single-threaded per page in practice, so one worker
    /// per core keeps the machine busy while the feeder runs.
    pub ocr_workers: usize,

    // ── Pipeline ──────────────────────────────────────────────────────────
    /// Capacity of each inter-stage queue. Default: 4.
    ///
    /// Small enough to cap the number of full-resolution images held in
    /// memory, large enough that OCR starts while the feeder is still
    /// running.
    pub queue_depth: usize,

    /// JPEG quality for Gray and Color pages. Range: 1–100. Default: 75.
    pub jpeg_quality: u8,

    /// Optional progress callback for per-page events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scan_program: "scanimage".to_string(),
            device: None,
            scan_mode: ScanMode::default(),
            feeder_source: "ADF Duplex".to_string(),
            resolution: 600,
            page_width_mm: 210,
            page_height_mm: 297,
            max_pages: None,
            scan_timeout_secs: 120,
            end_of_feeder_codes: vec![7],
            frames_dir: None,
            blank_threshold: 0.002,
            dark_level: 128,
            margin_fraction: 0.06,
            keep_blank: false,
            ocr_program: "tesseract".to_string(),
            ocr_lang: "eng".to_string(),
            ocr_oem: "1".to_string(),
            ocr_psm: None,
            allow_old_tesseract: false,
            ocr_timeout_secs: 300,
            ocr_retries: 1,
            retry_backoff_ms: 500,
            ocr_workers: default_ocr_workers(),
            queue_depth: 4,
            jpeg_quality: 75,
            progress_callback: None,
        }
    }
}

fn default_ocr_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().min(8))
        .unwrap_or(2)
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("scan_program", &self.scan_program)
            .field("device", &self.device)
            .field("scan_mode", &self.scan_mode)
            .field("feeder_source", &self.feeder_source)
            .field("resolution", &self.resolution)
            .field("max_pages", &self.max_pages)
            .field("frames_dir", &self.frames_dir)
            .field("blank_threshold", &self.blank_threshold)
            .field("keep_blank", &self.keep_blank)
            .field("ocr_program", &self.ocr_program)
            .field("ocr_lang", &self.ocr_lang)
            .field("ocr_oem", &self.ocr_oem)
            .field("ocr_retries", &self.ocr_retries)
            .field("ocr_workers", &self.ocr_workers)
            .field("queue_depth", &self.queue_depth)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn PipelineProgressCallback>"),
            )
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Most pages the scanner may run ahead of the assembler: one full
    /// queue plus one page per OCR worker.
    pub fn look_ahead(&self) -> usize {
        self.queue_depth + self.ocr_workers
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn scan_program(mut self, program: impl Into<String>) -> Self {
        self.config.scan_program = program.into();
        self
    }

    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.config.device = Some(device.into());
        self
    }

    pub fn scan_mode(mut self, mode: ScanMode) -> Self {
        self.config.scan_mode = mode;
        self
    }

    pub fn feeder_source(mut self, source: impl Into<String>) -> Self {
        self.config.feeder_source = source.into();
        self
    }

    pub fn resolution(mut self, dpi: u32) -> Self {
        self.config.resolution = dpi.clamp(75, 1200);
        self
    }

    pub fn page_size_mm(mut self, width: u32, height: u32) -> Self {
        self.config.page_width_mm = width;
        self.config.page_height_mm = height;
        self
    }

    pub fn max_pages(mut self, n: usize) -> Self {
        self.config.max_pages = Some(n);
        self
    }

    pub fn scan_timeout_secs(mut self, secs: u64) -> Self {
        self.config.scan_timeout_secs = secs;
        self
    }

    pub fn end_of_feeder_codes(mut self, codes: Vec<i32>) -> Self {
        self.config.end_of_feeder_codes = codes;
        self
    }

    pub fn frames_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.frames_dir = Some(dir.into());
        self
    }

    pub fn blank_threshold(mut self, t: f32) -> Self {
        self.config.blank_threshold = t.clamp(0.0, 1.0);
        self
    }

    pub fn dark_level(mut self, level: u8) -> Self {
        self.config.dark_level = level;
        self
    }

    pub fn margin_fraction(mut self, f: f32) -> Self {
        self.config.margin_fraction = f.clamp(0.0, 0.45);
        self
    }

    pub fn keep_blank(mut self, v: bool) -> Self {
        self.config.keep_blank = v;
        self
    }

    pub fn ocr_program(mut self, program: impl Into<String>) -> Self {
        self.config.ocr_program = program.into();
        self
    }

    pub fn ocr_lang(mut self, lang: impl Into<String>) -> Self {
        self.config.ocr_lang = lang.into();
        self
    }

    pub fn ocr_oem(mut self, oem: impl Into<String>) -> Self {
        self.config.ocr_oem = oem.into();
        self
    }

    pub fn ocr_psm(mut self, psm: u8) -> Self {
        self.config.ocr_psm = Some(psm);
        self
    }

    pub fn allow_old_tesseract(mut self, v: bool) -> Self {
        self.config.allow_old_tesseract = v;
        self
    }

    pub fn ocr_timeout_secs(mut self, secs: u64) -> Self {
        self.config.ocr_timeout_secs = secs;
        self
    }

    pub fn ocr_retries(mut self, n: u32) -> Self {
        self.config.ocr_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn ocr_workers(mut self, n: usize) -> Self {
        self.config.ocr_workers = n.max(1);
        self
    }

    pub fn queue_depth(mut self, n: usize) -> Self {
        self.config.queue_depth = n.max(1);
        self
    }

    pub fn jpeg_quality(mut self, q: u8) -> Self {
        self.config.jpeg_quality = q.clamp(1, 100);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Apply every value present in `file` on top of the current settings.
    pub fn apply_file(mut self, file: &FileConfig) -> Self {
        if let Some(ref v) = file.scan_program {
            self = self.scan_program(v.clone());
        }
        if let Some(ref v) = file.device {
            self = self.device(v.clone());
        }
        if let Some(v) = file.scan_mode {
            self = self.scan_mode(v);
        }
        if let Some(ref v) = file.feeder_source {
            self = self.feeder_source(v.clone());
        }
        if let Some(v) = file.resolution {
            self = self.resolution(v);
        }
        if file.page_width_mm.is_some() || file.page_height_mm.is_some() {
            let width = file.page_width_mm.unwrap_or(self.config.page_width_mm);
            let height = file.page_height_mm.unwrap_or(self.config.page_height_mm);
            self = self.page_size_mm(width, height);
        }
        if let Some(v) = file.max_pages {
            self = self.max_pages(v);
        }
        if let Some(v) = file.scan_timeout_secs {
            self = self.scan_timeout_secs(v);
        }
        if let Some(ref v) = file.end_of_feeder_codes {
            self = self.end_of_feeder_codes(v.clone());
        }
        if let Some(ref v) = file.frames_dir {
            self = self.frames_dir(v.clone());
        }
        if let Some(v) = file.blank_threshold {
            self = self.blank_threshold(v);
        }
        if let Some(v) = file.dark_level {
            self = self.dark_level(v);
        }
        if let Some(v) = file.margin_fraction {
            self = self.margin_fraction(v);
        }
        if let Some(v) = file.keep_blank {
            self = self.keep_blank(v);
        }
        if let Some(ref v) = file.ocr_program {
            self = self.ocr_program(v.clone());
        }
        if let Some(ref v) = file.ocr_lang {
            self = self.ocr_lang(v.clone());
        }
        if let Some(ref v) = file.ocr_oem {
            self = self.ocr_oem(v.clone());
        }
        if let Some(v) = file.ocr_psm {
            self = self.ocr_psm(v);
        }
        if let Some(v) = file.allow_old_tesseract {
            self = self.allow_old_tesseract(v);
        }
        if let Some(v) = file.ocr_timeout_secs {
            self = self.ocr_timeout_secs(v);
        }
        if let Some(v) = file.ocr_retries {
            self = self.ocr_retries(v);
        }
        if let Some(v) = file.retry_backoff_ms {
            self = self.retry_backoff_ms(v);
        }
        if let Some(v) = file.ocr_workers {
            self = self.ocr_workers(v);
        }
        if let Some(v) = file.queue_depth {
            self = self.queue_depth(v);
        }
        if let Some(v) = file.jpeg_quality {
            self = self.jpeg_quality(v);
        }
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, Scan2PdfError> {
        let c = &self.config;
        if c.resolution < 75 || c.resolution > 1200 {
            return Err(Scan2PdfError::InvalidConfig(format!(
                "Resolution must be 75–1200 DPI, got {}",
                c.resolution
            )));
        }
        if c.ocr_workers == 0 || c.queue_depth == 0 {
            return Err(Scan2PdfError::InvalidConfig(
                "OCR workers and queue depth must be ≥ 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&c.blank_threshold) {
            return Err(Scan2PdfError::InvalidConfig(format!(
                "Blank threshold must be within 0.0–1.0, got {}",
                c.blank_threshold
            )));
        }
        if c.max_pages == Some(0) {
            return Err(Scan2PdfError::InvalidConfig(
                "max_pages must be ≥ 1 when set".into(),
            ));
        }
        if c.ocr_lang.trim().is_empty() {
            return Err(Scan2PdfError::InvalidConfig(
                "OCR language must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Scanner colour mode.
///
/// Lineart is by far the smallest output for ordinary text documents: the
/// page is stored as a 1-bit bitmap. Gray and Color pages are stored as JPEG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// Black and white, 1 bit per pixel. (default)
    #[default]
    Lineart,
    /// 8-bit grayscale.
    Gray,
    /// 24-bit colour.
    Color,
}

impl ScanMode {
    /// The value SANE backends expect for `--mode`.
    pub fn sane_name(self) -> &'static str {
        match self {
            ScanMode::Lineart => "Lineart",
            ScanMode::Gray => "Gray",
            ScanMode::Color => "Color",
        }
    }
}

// ── Config file ──────────────────────────────────────────────────────────

/// Optional settings read from a TOML config file.
///
/// Every key is optional; missing keys keep the built-in default.
///
/// ```toml
/// device = "fujitsu:ScanSnap S1500:53095"
/// scan_mode = "lineart"
/// ocr_lang = "deu"
/// blank_threshold = 0.003
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub scan_program: Option<String>,
    pub device: Option<String>,
    pub scan_mode: Option<ScanMode>,
    pub feeder_source: Option<String>,
    pub resolution: Option<u32>,
    pub page_width_mm: Option<u32>,
    pub page_height_mm: Option<u32>,
    pub max_pages: Option<usize>,
    pub scan_timeout_secs: Option<u64>,
    pub end_of_feeder_codes: Option<Vec<i32>>,
    pub frames_dir: Option<PathBuf>,
    pub blank_threshold: Option<f32>,
    pub dark_level: Option<u8>,
    pub margin_fraction: Option<f32>,
    pub keep_blank: Option<bool>,
    pub ocr_program: Option<String>,
    pub ocr_lang: Option<String>,
    pub ocr_oem: Option<String>,
    pub ocr_psm: Option<u8>,
    pub allow_old_tesseract: Option<bool>,
    pub ocr_timeout_secs: Option<u64>,
    pub ocr_retries: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
    pub ocr_workers: Option<usize>,
    pub queue_depth: Option<usize>,
    pub jpeg_quality: Option<u8>,
}

impl FileConfig {
    /// Parse a config file from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, Scan2PdfError> {
        toml::from_str(text).map_err(|e| Scan2PdfError::InvalidConfig(e.to_string()))
    }

    /// Read and parse the config file at `path`.
    pub fn load(path: &Path) -> Result<Self, Scan2PdfError> {
        let text = std::fs::read_to_string(path).map_err(|e| Scan2PdfError::ConfigRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&text).map_err(|e| match e {
            Scan2PdfError::InvalidConfig(msg) => {
                Scan2PdfError::InvalidConfig(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    /// Load the system and user config files that exist, user values winning.
    ///
    /// Looks at `/etc/scan2pdf.toml`, then `$XDG_CONFIG_HOME/scan2pdf.toml`
    /// (falling back to `~/.config/scan2pdf.toml`).
    pub fn discover() -> Result<Self, Scan2PdfError> {
        let mut merged = FileConfig::default();
        for path in default_config_paths() {
            if path.is_file() {
                merged = merged.merged_with(Self::load(&path)?);
            }
        }
        Ok(merged)
    }

    /// Overlay `other` on `self`: keys set in `other` win.
    pub fn merged_with(self, other: FileConfig) -> FileConfig {
        FileConfig {
            scan_program: other.scan_program.or(self.scan_program),
            device: other.device.or(self.device),
            scan_mode: other.scan_mode.or(self.scan_mode),
            feeder_source: other.feeder_source.or(self.feeder_source),
            resolution: other.resolution.or(self.resolution),
            page_width_mm: other.page_width_mm.or(self.page_width_mm),
            page_height_mm: other.page_height_mm.or(self.page_height_mm),
            max_pages: other.max_pages.or(self.max_pages),
            scan_timeout_secs: other.scan_timeout_secs.or(self.scan_timeout_secs),
            end_of_feeder_codes: other.end_of_feeder_codes.or(self.end_of_feeder_codes),
            frames_dir: other.frames_dir.or(self.frames_dir),
            blank_threshold: other.blank_threshold.or(self.blank_threshold),
            dark_level: other.dark_level.or(self.dark_level),
            margin_fraction: other.margin_fraction.or(self.margin_fraction),
            keep_blank: other.keep_blank.or(self.keep_blank),
            ocr_program: other.ocr_program.or(self.ocr_program),
            ocr_lang: other.ocr_lang.or(self.ocr_lang),
            ocr_oem: other.ocr_oem.or(self.ocr_oem),
            ocr_psm: other.ocr_psm.or(self.ocr_psm),
            allow_old_tesseract: other.allow_old_tesseract.or(self.allow_old_tesseract),
            ocr_timeout_secs: other.ocr_timeout_secs.or(self.ocr_timeout_secs),
            ocr_retries: other.ocr_retries.or(self.ocr_retries),
            retry_backoff_ms: other.retry_backoff_ms.or(self.retry_backoff_ms),
            ocr_workers: other.ocr_workers.or(self.ocr_workers),
            queue_depth: other.queue_depth.or(self.queue_depth),
            jpeg_quality: other.jpeg_quality.or(self.jpeg_quality),
        }
    }
}

fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("/etc/scan2pdf.toml")];
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            paths.push(PathBuf::from(xdg).join("scan2pdf.toml"));
            return paths;
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        paths.push(PathBuf::from(home).join(".config").join("scan2pdf.toml"));
    }
    paths
}
