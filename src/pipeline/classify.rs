//! Blank-page detection.
//!
//! Duplex scanning produces an empty back side for every single-sided sheet.
//! The classifier scores how much ink a page carries and drops pages below
//! a threshold before they cost an OCR run.

use crate::config::PipelineConfig;
use crate::error::ClassifyError;
use crate::page::{Classification, PageImage};
use async_trait::async_trait;
use image::DynamicImage;
use std::borrow::Cow;
use std::sync::Arc;

/// A classifier decision plus the score behind it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub classification: Classification,
    /// Dark-pixel fraction in `0.0..=1.0`; `None` when no scoring happened.
    pub density: Option<f32>,
}

impl Verdict {
    pub fn blank(density: f32) -> Self {
        Self {
            classification: Classification::Blank,
            density: Some(density),
        }
    }

    pub fn content(density: Option<f32>) -> Self {
        Self {
            classification: Classification::Content,
            density,
        }
    }

    pub fn is_blank(&self) -> bool {
        self.classification == Classification::Blank
    }
}

/// Decides whether a page is blank.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, image: &PageImage) -> Result<Verdict, ClassifyError>;
}

/// Scores pages by the fraction of dark pixels inside the side margins.
#[derive(Debug, Clone)]
pub struct DensityClassifier {
    pub blank_threshold: f32,
    pub dark_level: u8,
    pub margin_fraction: f32,
    pub keep_blank: bool,
}

impl DensityClassifier {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            blank_threshold: config.blank_threshold,
            dark_level: config.dark_level,
            margin_fraction: config.margin_fraction,
            keep_blank: config.keep_blank,
        }
    }
}

#[async_trait]
impl Classifier for DensityClassifier {
    async fn classify(&self, image: &PageImage) -> Result<Verdict, ClassifyError> {
        if self.keep_blank {
            return Ok(Verdict::content(None));
        }
        let image = Arc::clone(image);
        let (dark_level, margin) = (self.dark_level, self.margin_fraction);
        let density =
            tokio::task::spawn_blocking(move || content_density(&image, dark_level, margin))
                .await
                .map_err(|e| ClassifyError::Internal(e.to_string()))??;

        Ok(if density < self.blank_threshold {
            Verdict::blank(density)
        } else {
            Verdict::content(Some(density))
        })
    }
}

/// Fraction of pixels darker than `dark_level`, ignoring `margin_fraction`
/// of the width on the left and on the right.
pub fn content_density(
    image: &DynamicImage,
    dark_level: u8,
    margin_fraction: f32,
) -> Result<f32, ClassifyError> {
    let (width, height) = (image.width(), image.height());
    let shave = (width as f32 * margin_fraction.clamp(0.0, 0.5)) as u32;
    let inner = width.saturating_sub(2 * shave);
    if inner == 0 || height == 0 {
        return Err(ClassifyError::TooSmall { width, height });
    }

    let gray = match image.as_luma8() {
        Some(g) => Cow::Borrowed(g),
        None => Cow::Owned(image.to_luma8()),
    };

    let mut dark: u64 = 0;
    for y in 0..height {
        for x in shave..shave + inner {
            if gray.get_pixel(x, y)[0] < dark_level {
                dark += 1;
            }
        }
    }
    Ok(dark as f32 / (inner as u64 * height as u64) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage};

    fn white(w: u32, h: u32) -> GrayImage {
        GrayImage::from_pixel(w, h, Luma([255]))
    }

    fn classifier(threshold: f32) -> DensityClassifier {
        DensityClassifier {
            blank_threshold: threshold,
            dark_level: 128,
            margin_fraction: 0.1,
            keep_blank: false,
        }
    }

    #[test]
    fn white_page_has_zero_density() {
        let img = DynamicImage::ImageLuma8(white(100, 100));
        assert_eq!(content_density(&img, 128, 0.1).unwrap(), 0.0);
    }

    #[test]
    fn dark_margins_are_ignored() {
        let mut img = white(100, 10);
        for y in 0..10 {
            for x in (0..5).chain(95..100) {
                img.put_pixel(x, y, Luma([0]));
            }
        }
        let d = content_density(&DynamicImage::ImageLuma8(img), 128, 0.1).unwrap();
        assert_eq!(d, 0.0);
    }

    #[test]
    fn counts_ink_inside_the_margins() {
        let mut img = white(100, 10);
        // 8 of the 80×10 scored pixels are dark.
        for x in 40..48 {
            img.put_pixel(x, 5, Luma([10]));
        }
        let d = content_density(&DynamicImage::ImageLuma8(img), 128, 0.1).unwrap();
        assert!((d - 0.01).abs() < 1e-6, "got {d}");
    }

    #[test]
    fn color_pages_are_scored_on_luma() {
        let mut img = RgbImage::from_pixel(10, 10, Rgb([250, 250, 250]));
        img.put_pixel(5, 5, Rgb([0, 0, 0]));
        let d = content_density(&DynamicImage::ImageRgb8(img), 128, 0.0).unwrap();
        assert!((d - 0.01).abs() < 1e-6, "got {d}");
    }

    #[test]
    fn fully_shaved_image_is_too_small() {
        let img = DynamicImage::ImageLuma8(white(2, 10));
        let err = content_density(&img, 128, 0.5).unwrap_err();
        assert!(matches!(err, ClassifyError::TooSmall { width: 2, height: 10 }));
    }

    #[tokio::test]
    async fn blank_below_threshold() {
        let page: PageImage = Arc::new(DynamicImage::ImageLuma8(white(50, 50)));
        let verdict = classifier(0.002).classify(&page).await.unwrap();
        assert!(verdict.is_blank());
        assert_eq!(verdict.density, Some(0.0));
    }

    #[tokio::test]
    async fn content_at_or_above_threshold() {
        let mut img = white(50, 50);
        for x in 10..40 {
            for y in 20..25 {
                img.put_pixel(x, y, Luma([0]));
            }
        }
        let page: PageImage = Arc::new(DynamicImage::ImageLuma8(img));
        let verdict = classifier(0.002).classify(&page).await.unwrap();
        assert_eq!(verdict.classification, Classification::Content);
        assert!(verdict.density.unwrap() > 0.002);
    }

    #[tokio::test]
    async fn keep_blank_skips_scoring() {
        let mut c = classifier(0.5);
        c.keep_blank = true;
        let page: PageImage = Arc::new(DynamicImage::ImageLuma8(white(1, 1)));
        let verdict = c.classify(&page).await.unwrap();
        assert_eq!(verdict, Verdict::content(None));
    }

    #[test]
    fn from_config_copies_thresholds() {
        let config = PipelineConfig::builder()
            .blank_threshold(0.01)
            .keep_blank(true)
            .build()
            .unwrap();
        let c = DensityClassifier::from_config(&config);
        assert_eq!(c.blank_threshold, 0.01);
        assert!(c.keep_blank);
    }
}
