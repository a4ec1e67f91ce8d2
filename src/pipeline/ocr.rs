//! OCR: turn a content page into positioned words.
//!
//! ## Retry Strategy
//!
//! Tesseract occasionally dies on a page (out of memory on a 600 DPI colour
//! scan, a killed process after a timeout). A second attempt usually works,
//! so [`recognize_with_retry`] retries with exponential backoff
//! (`retry_backoff_ms * 2^(attempt-1)`) before marking the page failed. With
//! a 500 ms base and 2 retries the waits are 500 ms → 1 s.

use crate::config::PipelineConfig;
use crate::error::{OcrError, PageError};
use crate::page::{BBox, PageImage, TextLayer, Word};
use crate::tool::{self, ToolCommand};
use async_trait::async_trait;
use image::ImageFormat;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Recognises the text on one page image.
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Check the engine is usable before any page is scanned.
    async fn preflight(&self) -> Result<(), OcrError> {
        Ok(())
    }

    /// OCR page `index`. The returned layer is in the image's pixel space.
    async fn recognize(&self, index: usize, image: &PageImage) -> Result<TextLayer, OcrError>;
}

/// Run `recognizer` on one page, retrying up to `retries` extra times.
///
/// Never returns the raw [`OcrError`]: after the last attempt the failure is
/// wrapped into a [`PageError`] for the job report.
pub async fn recognize_with_retry(
    recognizer: &dyn Recognizer,
    index: usize,
    image: &PageImage,
    retries: u32,
    retry_backoff_ms: u64,
) -> Result<TextLayer, PageError> {
    let start = Instant::now();
    let mut last_err: Option<String> = None;

    for attempt in 0..=retries {
        if attempt > 0 {
            let backoff = retry_backoff_ms.saturating_mul(2u64.saturating_pow(attempt - 1));
            warn!(
                "Page {}: OCR retry {}/{} after {}ms",
                index, attempt, retries, backoff
            );
            sleep(Duration::from_millis(backoff)).await;
        }

        match recognizer.recognize(index, image).await {
            Ok(layer) => {
                debug!(
                    "Page {}: {} words in {:?}",
                    index,
                    layer.words.len(),
                    start.elapsed()
                );
                return Ok(layer);
            }
            Err(e) => {
                let err_msg = e.to_string();
                warn!("Page {}: OCR attempt {} failed: {}", index, attempt + 1, err_msg);
                last_err = Some(err_msg);
            }
        }
    }

    Err(PageError::OcrFailed {
        page: index,
        attempts: retries + 1,
        detail: last_err.unwrap_or_else(|| "Unknown error".to_string()),
    })
}

// ── Tesseract ────────────────────────────────────────────────────────────

/// Runs the `tesseract` CLI and parses its TSV output.
#[derive(Debug, Clone)]
pub struct TesseractRecognizer {
    pub program: String,
    pub lang: String,
    pub oem: String,
    pub psm: Option<u8>,
    pub timeout: Duration,
    pub allow_old: bool,
}

impl TesseractRecognizer {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            program: config.ocr_program.clone(),
            lang: config.ocr_lang.clone(),
            oem: config.ocr_oem.clone(),
            psm: config.ocr_psm,
            timeout: Duration::from_secs(config.ocr_timeout_secs),
            allow_old: config.allow_old_tesseract,
        }
    }

    /// Command line for recognising the image at `path`.
    pub fn command(&self, path: &str) -> ToolCommand {
        let mut cmd = ToolCommand::new(&self.program)
            .arg(path)
            .arg("stdout")
            .arg("-l")
            .arg(&self.lang)
            .arg("--oem")
            .arg(&self.oem);
        if let Some(psm) = self.psm {
            cmd = cmd.arg("--psm").arg(psm.to_string());
        }
        cmd.arg("tsv")
    }
}

#[async_trait]
impl Recognizer for TesseractRecognizer {
    async fn preflight(&self) -> Result<(), OcrError> {
        let cmd = ToolCommand::new(&self.program).arg("--version");
        let out = tool::invoke(&cmd, None, Duration::from_secs(30)).await?;
        // Tesseract 3 prints its version on stderr.
        let text = format!("{}\n{}", out.stdout_text(), out.stderr);
        let (major, minor) = parse_tesseract_version(&text)
            .ok_or_else(|| OcrError::Parse(format!("no version in: {}", text.trim())))?;
        info!("Using tesseract {}.{}", major, minor);
        if major < 4 && !self.allow_old {
            return Err(OcrError::Unsupported {
                found: format!("{major}.{minor}"),
            });
        }
        Ok(())
    }

    async fn recognize(&self, index: usize, image: &PageImage) -> Result<TextLayer, OcrError> {
        let (width, height) = (image.width(), image.height());
        let image = Arc::clone(image);
        // The temp file lives until `scratch` is dropped at the end of this call.
        let scratch = tokio::task::spawn_blocking(move || {
            let file = tempfile::Builder::new()
                .prefix("scan2pdf-ocr-")
                .suffix(".png")
                .tempfile()?;
            image
                .save_with_format(file.path(), ImageFormat::Png)
                .map_err(|e| OcrError::Image(e.to_string()))?;
            Ok::<_, OcrError>(file)
        })
        .await
        .map_err(|e| OcrError::Image(format!("page {index}: encode task panicked: {e}")))??;

        let path = scratch.path().to_string_lossy().into_owned();
        let out = tool::invoke(&self.command(&path), None, self.timeout).await?;
        parse_tsv(&out.stdout_text(), width, height)
    }
}

static VERSION_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?m)^\s*tesseract\s+v?(\d+)(?:\.(\d+))?").ok());

/// Extract `(major, minor)` from `tesseract --version` output.
pub fn parse_tesseract_version(text: &str) -> Option<(u32, u32)> {
    let caps = VERSION_RE.as_ref()?.captures(text)?;
    let major = caps.get(1)?.as_str().parse().ok()?;
    let minor = caps
        .get(2)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0);
    Some((major, minor))
}

/// Parse Tesseract's TSV output into a text layer.
///
/// Columns: `level page_num block_num par_num line_num word_num left top
/// width height conf text`. Only word rows (level 5) with text and a
/// non-negative confidence become [`Word`]s.
pub fn parse_tsv(tsv: &str, width: u32, height: u32) -> Result<TextLayer, OcrError> {
    let mut layer = TextLayer::new(width, height);

    for (lineno, line) in tsv.lines().enumerate() {
        if line.trim().is_empty() || line.starts_with("level") {
            continue;
        }
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() < 11 {
            return Err(OcrError::Parse(format!(
                "line {}: expected 12 columns, got {}",
                lineno + 1,
                cols.len()
            )));
        }
        if cols[0] != "5" {
            continue;
        }
        let text = cols.get(11).map(|t| t.trim()).unwrap_or("");
        if text.is_empty() {
            continue;
        }

        let num = |i: usize| -> Result<u32, OcrError> {
            cols[i].trim().parse().map_err(|_| {
                OcrError::Parse(format!("line {}: bad number '{}'", lineno + 1, cols[i]))
            })
        };
        let conf: f32 = cols[10].trim().parse().map_err(|_| {
            OcrError::Parse(format!("line {}: bad confidence '{}'", lineno + 1, cols[10]))
        })?;
        if conf < 0.0 {
            continue;
        }

        layer.words.push(Word {
            text: text.to_string(),
            bbox: BBox {
                left: num(6)?,
                top: num(7)?,
                width: num(8)?,
                height: num(9)?,
            },
            confidence: (conf / 100.0).clamp(0.0, 1.0),
        });
    }

    Ok(layer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::DynamicImage;
    use std::sync::atomic::{AtomicU32, Ordering};

    const TSV: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext
1\t1\t0\t0\t0\t0\t0\t0\t2480\t3508\t-1\t
2\t1\t1\t0\t0\t0\t300\t400\t900\t60\t-1\t
5\t1\t1\t1\t1\t1\t300\t400\t200\t60\t96.5\tInvoice
5\t1\t1\t1\t1\t2\t520\t402\t180\t58\t91\tNo.
5\t1\t1\t1\t1\t3\t720\t400\t40\t60\t-1\t
5\t1\t1\t1\t1\t4\t780\t400\t60\t60\t12\t
";

    #[test]
    fn parses_word_rows_only() {
        let layer = parse_tsv(TSV, 2480, 3508).unwrap();
        assert_eq!(layer.width, 2480);
        assert_eq!(layer.words.len(), 2);
        assert_eq!(layer.plain_text(), "Invoice No.");
        let w = &layer.words[0];
        assert_eq!(
            w.bbox,
            BBox {
                left: 300,
                top: 400,
                width: 200,
                height: 60
            }
        );
        assert!((w.confidence - 0.965).abs() < 1e-6);
    }

    #[test]
    fn empty_output_is_an_empty_layer() {
        let layer = parse_tsv("", 10, 10).unwrap();
        assert!(layer.is_empty());
    }

    #[test]
    fn malformed_rows_are_rejected() {
        let err = parse_tsv("5\t1\t1", 10, 10).unwrap_err();
        assert!(matches!(err, OcrError::Parse(_)));

        let err = parse_tsv("5\t1\t1\t1\t1\t1\tx\t0\t1\t1\t90\tword", 10, 10).unwrap_err();
        assert!(err.to_string().contains("bad number"));
    }

    #[test]
    fn parses_version_lines() {
        assert_eq!(parse_tesseract_version("tesseract 4.1.1\n leptonica-1.79.0"), Some((4, 1)));
        assert_eq!(parse_tesseract_version("tesseract v5.3.0.20221214"), Some((5, 3)));
        assert_eq!(parse_tesseract_version("tesseract 3.05.02"), Some((3, 5)));
        assert_eq!(parse_tesseract_version("something else"), None);
    }

    #[test]
    fn command_includes_language_and_engine() {
        let config = PipelineConfig::builder()
            .ocr_lang("deu+eng")
            .ocr_psm(6)
            .build()
            .unwrap();
        let r = TesseractRecognizer::from_config(&config);
        assert_eq!(
            r.command("/tmp/p.png").to_string(),
            "tesseract /tmp/p.png stdout -l deu+eng --oem 1 --psm 6 tsv"
        );
    }

    #[tokio::test]
    async fn preflight_reports_missing_engine() {
        let r = TesseractRecognizer {
            program: "definitely-not-tesseract".into(),
            ..TesseractRecognizer::from_config(&PipelineConfig::default())
        };
        let err = r.preflight().await.unwrap_err();
        assert!(matches!(err, OcrError::Tool(_)), "got {err:?}");
    }

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Recognizer for Flaky {
        async fn recognize(&self, _index: usize, image: &PageImage) -> Result<TextLayer, OcrError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(OcrError::Parse(format!("flake {n}")))
            } else {
                Ok(TextLayer::new(image.width(), image.height()))
            }
        }
    }

    fn page() -> PageImage {
        Arc::new(DynamicImage::new_luma8(8, 8))
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failure() {
        let r = Flaky {
            failures: 1,
            calls: AtomicU32::new(0),
        };
        let layer = recognize_with_retry(&r, 3, &page(), 2, 1).await.unwrap();
        assert_eq!(layer.width, 8);
        assert_eq!(r.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_gives_up_with_page_error() {
        let r = Flaky {
            failures: 10,
            calls: AtomicU32::new(0),
        };
        let err = recognize_with_retry(&r, 4, &page(), 1, 1).await.unwrap_err();
        assert_eq!(
            err,
            PageError::OcrFailed {
                page: 4,
                attempts: 2,
                detail: "Unexpected OCR output: flake 1".into()
            }
        );
        assert_eq!(r.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn default_preflight_succeeds() {
        let r = Flaky {
            failures: 0,
            calls: AtomicU32::new(0),
        };
        r.preflight().await.unwrap();
    }
}
