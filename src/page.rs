//! Page model and the per-page state machine.
//!
//! ```text
//! Scanned ──classify──▶ Classified ──ocr──▶ OcrDone ──assemble──▶ Ready
//!    │                      │
//!    ├──blank──▶ Excluded   └──error──▶ Failed
//!    └──error──▶ Failed
//! ```
//!
//! `Excluded`, `Failed` and `Ready` are terminal. A [`Page`] value carries
//! the image and text layer while it moves between stages; only one stage
//! owns it at a time.

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A page bitmap, shared read-only between a stage and the blocking task it
/// offloads CPU work to.
pub type PageImage = Arc<DynamicImage>;

/// Outcome of blank detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    #[default]
    Unknown,
    Blank,
    Content,
}

/// Where a page is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageState {
    Scanned,
    Classified,
    OcrDone,
    Failed,
    Excluded,
    Ready,
}

impl PageState {
    /// Whether the page has left the pipeline for good.
    pub fn is_terminal(self) -> bool {
        matches!(self, PageState::Failed | PageState::Excluded | PageState::Ready)
    }

    /// Whether `self → next` is an edge of the state machine.
    pub fn can_transition_to(self, next: PageState) -> bool {
        use PageState::*;
        matches!(
            (self, next),
            (Scanned, Classified)
                | (Scanned, Excluded)
                | (Scanned, Failed)
                | (Classified, OcrDone)
                | (Classified, Failed)
                | (OcrDone, Ready)
        )
    }

    /// Step to `next` if the state machine allows it; `index` labels the error.
    pub fn advance(&mut self, index: usize, next: PageState) -> Result<(), InvalidTransition> {
        if !self.can_transition_to(next) {
            return Err(InvalidTransition {
                index,
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }
}

impl fmt::Display for PageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PageState::Scanned => "scanned",
            PageState::Classified => "classified",
            PageState::OcrDone => "ocr-done",
            PageState::Failed => "failed",
            PageState::Excluded => "excluded",
            PageState::Ready => "ready",
        };
        f.write_str(s)
    }
}

/// Rejected state change. Indicates a bug in a stage, never bad input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("page {index}: illegal transition {from} → {to}")]
pub struct InvalidTransition {
    pub index: usize,
    pub from: PageState,
    pub to: PageState,
}

/// Pixel-space rectangle (origin top-left, y grows downward).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BBox {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

/// One recognised word and where it sits on the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
    pub text: String,
    pub bbox: BBox,
    /// Recogniser confidence in `0.0..=1.0`.
    pub confidence: f32,
}

/// Positioned text for one page, in the pixel space of the page image.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TextLayer {
    pub width: u32,
    pub height: u32,
    pub words: Vec<Word>,
}

impl TextLayer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            words: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Words joined by spaces, in recognition order.
    pub fn plain_text(&self) -> String {
        self.words
            .iter()
            .map(|w| w.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// One scanned sheet in flight.
#[derive(Debug, Clone)]
pub struct Page {
    index: usize,
    pub image: PageImage,
    pub classification: Classification,
    /// Dark-pixel density computed by the classifier, if it ran.
    pub density: Option<f32>,
    pub text_layer: Option<TextLayer>,
    state: PageState,
}

impl Page {
    /// A freshly scanned page. Only the Scanner Source creates pages.
    pub fn scanned(index: usize, image: DynamicImage) -> Self {
        Self {
            index,
            image: Arc::new(image),
            classification: Classification::Unknown,
            density: None,
            text_layer: None,
            state: PageState::Scanned,
        }
    }

    /// 1-based position in the feeder order. Immutable.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> PageState {
        self.state
    }

    /// Move the page along the state machine.
    pub fn advance(&mut self, next: PageState) -> Result<(), InvalidTransition> {
        self.state.advance(self.index, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> Page {
        Page::scanned(1, DynamicImage::new_luma8(4, 4))
    }

    #[test]
    fn happy_path_reaches_ready() {
        let mut p = page();
        p.advance(PageState::Classified).unwrap();
        p.advance(PageState::OcrDone).unwrap();
        p.advance(PageState::Ready).unwrap();
        assert!(p.state().is_terminal());
    }

    #[test]
    fn blank_page_goes_straight_to_excluded() {
        let mut p = page();
        p.advance(PageState::Excluded).unwrap();
        assert_eq!(p.state(), PageState::Excluded);
    }

    #[test]
    fn terminal_states_do_not_move() {
        for terminal in [PageState::Failed, PageState::Excluded, PageState::Ready] {
            for next in [
                PageState::Scanned,
                PageState::Classified,
                PageState::OcrDone,
                PageState::Failed,
                PageState::Excluded,
                PageState::Ready,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal} → {next}");
            }
        }
    }

    #[test]
    fn state_advance_labels_rejections_with_the_page() {
        let mut state = PageState::Excluded;
        let err = state.advance(7, PageState::Classified).unwrap_err();
        assert_eq!(
            err,
            InvalidTransition {
                index: 7,
                from: PageState::Excluded,
                to: PageState::Classified,
            }
        );
        assert_eq!(state, PageState::Excluded);

        let mut state = PageState::Scanned;
        state.advance(7, PageState::Failed).unwrap();
        assert_eq!(state, PageState::Failed);
    }

    #[test]
    fn skipping_ocr_is_rejected() {
        let mut p = page();
        p.advance(PageState::Classified).unwrap();
        let err = p.advance(PageState::Ready).unwrap_err();
        assert_eq!(err.from, PageState::Classified);
        assert_eq!(err.to, PageState::Ready);
        assert_eq!(p.state(), PageState::Classified);
    }

    #[test]
    fn excluded_pages_cannot_be_ocrd() {
        assert!(!PageState::Scanned.can_transition_to(PageState::OcrDone));
    }

    #[test]
    fn plain_text_joins_words() {
        let mut layer = TextLayer::new(100, 100);
        for t in ["Dear", "Sir"] {
            layer.words.push(Word {
                text: t.into(),
                bbox: BBox::default(),
                confidence: 0.9,
            });
        }
        assert_eq!(layer.plain_text(), "Dear Sir");
        assert!(!layer.is_empty());
    }
}
