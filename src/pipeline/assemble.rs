//! Assembler: restore feeder order and build the searchable PDF.
//!
//! OCR finishes pages in whatever order the worker pool gets to them. The
//! [`ReorderBuffer`] holds early arrivals until every lower index has either
//! arrived or been reported as skipped, so pages are encoded strictly in
//! ascending index order. Each page is encoded the moment it is released
//! (its full-resolution bitmap is dropped right after), and the encoded
//! pages are stitched into one document once the queue closes.

use crate::config::{PipelineConfig, ScanMode};
use crate::error::AssembleError;
use crate::page::{Page, PageState, TextLayer};
use crate::pipeline::encode::{encode_image, ImageFilter};
use crate::pipeline::Flow;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream, StringFormat};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One page, compressed and ready to be linked into a document.
#[derive(Debug, Clone)]
pub struct EncodedPage {
    pub index: usize,
    pub width_pt: f32,
    pub height_pt: f32,
    /// The page bitmap as an image XObject stream.
    pub image: Stream,
    /// Page content: draws the image, then the invisible text.
    pub content: Stream,
}

/// Turns pages into PDF fragments and fragments into a document.
///
/// Both methods are CPU-bound and are called from `spawn_blocking`.
pub trait PageEncoder: Send + Sync {
    fn encode_page(&self, page: &Page) -> Result<EncodedPage, AssembleError>;

    /// Build the final document from pages already in output order.
    fn concatenate(&self, pages: Vec<EncodedPage>) -> Result<Vec<u8>, AssembleError>;
}

/// [`PageEncoder`] backed by `lopdf`: an image XObject per page with an
/// invisible Helvetica text layer on top.
#[derive(Debug, Clone)]
pub struct LopdfEncoder {
    pub scan_mode: ScanMode,
    pub resolution: u32,
    pub jpeg_quality: u8,
}

impl LopdfEncoder {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            scan_mode: config.scan_mode,
            resolution: config.resolution,
            jpeg_quality: config.jpeg_quality,
        }
    }

    fn points_per_pixel(&self) -> f32 {
        72.0 / self.resolution.max(1) as f32
    }
}

impl PageEncoder for LopdfEncoder {
    fn encode_page(&self, page: &Page) -> Result<EncodedPage, AssembleError> {
        let index = page.index();
        let encoded = encode_image(&page.image, self.scan_mode, self.jpeg_quality).map_err(|e| {
            AssembleError::Encode {
                page: index,
                detail: e.to_string(),
            }
        })?;

        let scale = self.points_per_pixel();
        let width_pt = encoded.width as f32 * scale;
        let height_pt = encoded.height as f32 * scale;

        let image_dict = dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => Object::Integer(encoded.width as i64),
            "Height" => Object::Integer(encoded.height as i64),
            "ColorSpace" => encoded.color_space,
            "BitsPerComponent" => Object::Integer(encoded.bits_per_component as i64),
        };
        let image = match encoded.filter {
            ImageFilter::Raw => {
                let mut s = Stream::new(image_dict, encoded.data);
                if let Err(e) = s.compress() {
                    warn!("Page {}: image left uncompressed: {}", index, e);
                }
                s
            }
            ImageFilter::Dct => {
                let mut dict = image_dict;
                dict.set("Filter", "DCTDecode");
                Stream::new(dict, encoded.data).with_compression(false)
            }
        };

        let mut operations = vec![
            Operation::new("q", vec![]),
            Operation::new(
                "cm",
                vec![
                    Object::Real(width_pt),
                    Object::Integer(0),
                    Object::Integer(0),
                    Object::Real(height_pt),
                    Object::Integer(0),
                    Object::Integer(0),
                ],
            ),
            Operation::new("Do", vec!["Im0".into()]),
            Operation::new("Q", vec![]),
        ];
        if let Some(ref layer) = page.text_layer {
            operations.extend(text_operations(layer, scale));
        }
        let content_bytes = Content { operations }
            .encode()
            .map_err(|e| AssembleError::Encode {
                page: index,
                detail: e.to_string(),
            })?;
        let mut content = Stream::new(dictionary! {}, content_bytes);
        if let Err(e) = content.compress() {
            warn!("Page {}: content stream left uncompressed: {}", index, e);
        }

        debug!(
            "Page {}: {:.0}x{:.0} pt, {} words",
            index,
            width_pt,
            height_pt,
            page.text_layer.as_ref().map_or(0, |l| l.words.len())
        );

        Ok(EncodedPage {
            index,
            width_pt,
            height_pt,
            image,
            content,
        })
    }

    fn concatenate(&self, pages: Vec<EncodedPage>) -> Result<Vec<u8>, AssembleError> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
            "Encoding" => "WinAnsiEncoding",
        });

        let mut kids = Vec::with_capacity(pages.len());
        for page in pages {
            let image_id = doc.add_object(page.image);
            let content_id = doc.add_object(page.content);
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "MediaBox" => vec![
                    Object::Integer(0),
                    Object::Integer(0),
                    Object::Real(page.width_pt),
                    Object::Real(page.height_pt),
                ],
                "Resources" => dictionary! {
                    "XObject" => dictionary! { "Im0" => image_id },
                    "Font" => dictionary! { "F1" => font_id },
                },
                "Contents" => content_id,
            });
            kids.push(Object::Reference(page_id));
        }

        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => Object::Integer(count),
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        let info_id = doc.add_object(dictionary! {
            "Producer" => Object::string_literal(concat!("scan2pdf ", env!("CARGO_PKG_VERSION"))),
        });
        doc.trailer.set("Root", catalog_id);
        doc.trailer.set("Info", info_id);

        let mut buf = Vec::new();
        doc.save_to(&mut buf)
            .map_err(|e| AssembleError::Pdf(e.to_string()))?;
        Ok(buf)
    }
}

/// Invisible text (render mode 3) placing every word over its bounding box.
///
/// PDF space has its origin bottom-left, so `y` is flipped against the page
/// height. The font size is the box height; horizontal scaling stretches
/// the run to the box width assuming Helvetica's average 0.5 em advance.
fn text_operations(layer: &TextLayer, scale: f32) -> Vec<Operation> {
    if layer.is_empty() {
        return Vec::new();
    }
    let page_height = layer.height as f32;
    let mut ops = vec![
        Operation::new("BT", vec![]),
        Operation::new("Tr", vec![Object::Integer(3)]),
    ];
    for word in &layer.words {
        let bbox = word.bbox;
        let size = (bbox.height.max(1) as f32 * scale).max(1.0);
        let chars = word.text.chars().count().max(1) as f32;
        let natural = chars * 0.5 * size;
        let stretch = (bbox.width as f32 * scale / natural * 100.0).clamp(1.0, 1000.0);
        let x = bbox.left as f32 * scale;
        let y = (page_height - bbox.top.saturating_add(bbox.height) as f32).max(0.0) * scale;

        ops.push(Operation::new("Tf", vec!["F1".into(), Object::Real(size)]));
        ops.push(Operation::new("Tz", vec![Object::Real(stretch)]));
        ops.push(Operation::new(
            "Tm",
            vec![
                Object::Integer(1),
                Object::Integer(0),
                Object::Integer(0),
                Object::Integer(1),
                Object::Real(x),
                Object::Real(y),
            ],
        ));
        ops.push(Operation::new(
            "Tj",
            vec![Object::String(to_win_ansi(&word.text), StringFormat::Literal)],
        ));
    }
    ops.push(Operation::new("ET", vec![]));
    ops
}

/// Latin-1 bytes for the standard font; anything else becomes `?`.
fn to_win_ansi(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}

// ── Reordering ───────────────────────────────────────────────────────────

/// Releases items strictly in ascending index order, starting at 1.
///
/// A slot holding `None` stands for a page that will never arrive (excluded
/// or failed); it advances the cursor without producing anything.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next: usize,
    pending: BTreeMap<usize, Option<T>>,
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReorderBuffer<T> {
    pub fn new() -> Self {
        Self {
            next: 1,
            pending: BTreeMap::new(),
        }
    }

    /// Park `item` under `index`. Returns `false` for an index that was
    /// already released or is already parked.
    pub fn insert(&mut self, index: usize, item: Option<T>) -> bool {
        if index < self.next || self.pending.contains_key(&index) {
            return false;
        }
        self.pending.insert(index, item);
        true
    }

    /// Remove and return every item now contiguous with the cursor.
    pub fn release(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(slot) = self.pending.remove(&self.next) {
            self.next += 1;
            if let Some(item) = slot {
                out.push(item);
            }
        }
        out
    }

    /// The index the buffer is waiting for.
    pub fn next_expected(&self) -> usize {
        self.next
    }

    /// Parked items waiting for a lower index.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

// ── Assembler ────────────────────────────────────────────────────────────

/// Orders incoming pages and encodes them on release.
pub struct Assembler {
    encoder: Arc<dyn PageEncoder>,
    buffer: ReorderBuffer<Page>,
    encoded: Vec<EncodedPage>,
}

impl Assembler {
    pub fn new(encoder: Arc<dyn PageEncoder>) -> Self {
        Self {
            encoder,
            buffer: ReorderBuffer::new(),
            encoded: Vec::new(),
        }
    }

    /// Take one item off the OCR queue. Returns the indices of the pages
    /// that were encoded as a result, in order.
    pub async fn accept(&mut self, flow: Flow) -> Result<Vec<usize>, AssembleError> {
        let index = flow.index();
        let slot = match flow {
            Flow::Page(page) => Some(page),
            Flow::Skip(_) => None,
        };
        if !self.buffer.insert(index, slot) {
            warn!("Page {}: duplicate delivery to assembler, ignored", index);
            return Ok(Vec::new());
        }

        let mut released = Vec::new();
        for page in self.buffer.release() {
            let index = page.index();
            let encoder = Arc::clone(&self.encoder);
            let (mut page, result) = tokio::task::spawn_blocking(move || {
                let result = encoder.encode_page(&page);
                (page, result)
            })
            .await
            .map_err(|e| AssembleError::Internal(format!("page {index}: {e}")))?;
            let encoded = result?;
            page.advance(PageState::Ready)
                .map_err(|e| AssembleError::Internal(e.to_string()))?;
            self.encoded.push(encoded);
            released.push(index);
        }
        Ok(released)
    }

    /// The lowest index not yet released. Everything below it has been
    /// encoded or skipped.
    pub fn next_expected(&self) -> usize {
        self.buffer.next_expected()
    }

    /// Pages encoded so far.
    pub fn encoded(&self) -> usize {
        self.encoded.len()
    }

    /// Build the document. `None` when no page made it through.
    pub async fn finish(self) -> Result<Option<Vec<u8>>, AssembleError> {
        if self.buffer.pending() > 0 {
            return Err(AssembleError::Internal(format!(
                "{} page(s) still waiting for page {}",
                self.buffer.pending(),
                self.buffer.next_expected()
            )));
        }
        if self.encoded.is_empty() {
            return Ok(None);
        }
        let encoder = self.encoder;
        let pages = self.encoded;
        let count = pages.len();
        let bytes = tokio::task::spawn_blocking(move || encoder.concatenate(pages))
            .await
            .map_err(|e| AssembleError::Internal(e.to_string()))??;
        info!("Assembled {} page(s) into {} bytes", count, bytes.len());
        Ok(Some(bytes))
    }
}

/// Write the finished PDF atomically (temp file + rename).
pub async fn write_pdf(path: &Path, bytes: &[u8]) -> Result<u64, AssembleError> {
    let write_err = |source| AssembleError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }
    let tmp_path = path.with_extension("pdf.tmp");
    tokio::fs::write(&tmp_path, bytes).await.map_err(write_err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(write_err)?;
    info!("Wrote {} ({} bytes)", path.display(), bytes.len());
    Ok(bytes.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{BBox, Word};
    use image::{DynamicImage, GrayImage, Luma};

    fn ocr_done_page(index: usize, text: &str) -> Page {
        let mut page = Page::scanned(
            index,
            DynamicImage::ImageLuma8(GrayImage::from_pixel(120, 170, Luma([255]))),
        );
        page.advance(PageState::Classified).unwrap();
        let mut layer = TextLayer::new(120, 170);
        layer.words.push(Word {
            text: text.into(),
            bbox: BBox {
                left: 10,
                top: 20,
                width: 60,
                height: 12,
            },
            confidence: 0.9,
        });
        page.text_layer = Some(layer);
        page.advance(PageState::OcrDone).unwrap();
        page
    }

    fn encoder(mode: ScanMode) -> LopdfEncoder {
        LopdfEncoder {
            scan_mode: mode,
            resolution: 72,
            jpeg_quality: 75,
        }
    }

    #[test]
    fn reorder_buffer_releases_contiguous_runs() {
        let mut buf = ReorderBuffer::new();
        assert!(buf.insert(3, Some("c")));
        assert!(buf.release().is_empty());
        assert!(buf.insert(1, Some("a")));
        assert_eq!(buf.release(), vec!["a"]);
        assert_eq!(buf.next_expected(), 2);
        assert!(buf.insert(2, None));
        assert_eq!(buf.release(), vec!["c"]);
        assert_eq!(buf.pending(), 0);
    }

    #[test]
    fn reorder_buffer_rejects_duplicates_and_stale_indices() {
        let mut buf = ReorderBuffer::new();
        assert!(buf.insert(1, Some(1)));
        buf.release();
        assert!(!buf.insert(1, Some(1)));
        assert!(buf.insert(5, Some(5)));
        assert!(!buf.insert(5, Some(5)));
    }

    #[test]
    fn win_ansi_replaces_non_latin1() {
        assert_eq!(to_win_ansi("Grüße"), b"Gr\xfc\xdfe".to_vec());
        assert_eq!(to_win_ansi("a→b"), b"a?b".to_vec());
    }

    #[test]
    fn page_size_follows_resolution() {
        let enc = LopdfEncoder {
            resolution: 144,
            ..encoder(ScanMode::Lineart)
        };
        let page = enc.encode_page(&ocr_done_page(1, "x")).unwrap();
        assert!((page.width_pt - 60.0).abs() < 1e-3);
        assert!((page.height_pt - 85.0).abs() < 1e-3);
    }

    #[test]
    fn text_layer_is_invisible_and_positioned() {
        let ops = text_operations(&ocr_done_page(1, "Hello").text_layer.unwrap(), 1.0);
        let names: Vec<&str> = ops.iter().map(|o| o.operator.as_str()).collect();
        assert_eq!(names, vec!["BT", "Tr", "Tf", "Tz", "Tm", "Tj", "ET"]);
        assert!(matches!(ops[1].operands[..], [Object::Integer(3)]));
        // Box bottom is 32 px from the top of a 170 px page.
        assert!(matches!(ops[4].operands[5], Object::Real(y) if (y - 138.0).abs() < 1e-3));
    }

    #[test]
    fn absurd_word_boxes_stay_on_the_page() {
        let mut layer = TextLayer::new(120, 170);
        layer.words.push(Word {
            text: "junk".into(),
            bbox: BBox {
                left: 5,
                top: u32::MAX - 3,
                width: 40,
                height: u32::MAX,
            },
            confidence: 0.1,
        });
        let ops = text_operations(&layer, 1.0);
        assert!(matches!(ops[4].operands[5], Object::Real(y) if y == 0.0));

        let mut page = ocr_done_page(1, "x");
        page.text_layer = Some(layer);
        let encoded = encoder(ScanMode::Gray).encode_page(&page).unwrap();
        assert_eq!(encoded.index, 1);
    }

    #[test]
    fn concatenated_document_keeps_page_order() {
        let enc = encoder(ScanMode::Gray);
        let pages: Vec<EncodedPage> = [1, 2, 3]
            .iter()
            .map(|&i| enc.encode_page(&ocr_done_page(i, &format!("page-{i}"))).unwrap())
            .collect();
        let bytes = enc.concatenate(pages).unwrap();

        let doc = Document::load_mem(&bytes).unwrap();
        let page_ids = doc.get_pages();
        assert_eq!(page_ids.len(), 3);
        for (n, id) in page_ids {
            let content = doc.get_page_content(id).unwrap();
            let text = String::from_utf8_lossy(&content);
            assert!(text.contains(&format!("(page-{n})")), "page {n}: {text}");
        }
    }

    #[tokio::test]
    async fn assembler_encodes_in_index_order() {
        let enc: Arc<dyn PageEncoder> = Arc::new(encoder(ScanMode::Lineart));
        let mut asm = Assembler::new(enc);

        assert!(asm.accept(Flow::Page(ocr_done_page(3, "page-3"))).await.unwrap().is_empty());
        assert_eq!(asm.accept(Flow::Page(ocr_done_page(1, "page-1"))).await.unwrap(), vec![1]);
        assert_eq!(asm.accept(Flow::Skip(2)).await.unwrap(), vec![3]);
        assert_eq!(asm.encoded(), 2);

        let bytes = asm.finish().await.unwrap().unwrap();
        let doc = Document::load_mem(&bytes).unwrap();
        assert_eq!(doc.get_pages().len(), 2);
    }

    #[tokio::test]
    async fn assembler_with_only_skips_produces_nothing() {
        let mut asm = Assembler::new(Arc::new(encoder(ScanMode::Lineart)));
        asm.accept(Flow::Skip(1)).await.unwrap();
        asm.accept(Flow::Skip(2)).await.unwrap();
        assert!(asm.finish().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn assembler_reports_gaps() {
        let mut asm = Assembler::new(Arc::new(encoder(ScanMode::Lineart)));
        asm.accept(Flow::Page(ocr_done_page(2, "x"))).await.unwrap();
        let err = asm.finish().await.unwrap_err();
        assert!(err.to_string().contains("waiting for page 1"));
    }

    #[tokio::test]
    async fn write_pdf_is_atomic_and_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.pdf");
        let n = write_pdf(&path, b"%PDF-1.5 test").await.unwrap();
        assert_eq!(n, 13);
        assert_eq!(std::fs::read(&path).unwrap(), b"%PDF-1.5 test");
        assert!(!path.with_extension("pdf.tmp").exists());
    }
}
