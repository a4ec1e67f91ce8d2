//! Scanner Source: one frame per call from the document feeder.
//!
//! The source is a lazy, finite, non-restartable sequence. The orchestrator
//! asks for frame `index` (1-based, assigned by the orchestrator's scanner
//! task in feeder order) and gets back an image or [`Frame::EndOfFeeder`].
//! Any error is fatal to the job.
//!
//! ## Why one tool call per frame?
//!
//! Batch scanning writes every sheet to disk before anything else can start.
//! Asking `scanimage` for one sheet at a time lets classification and OCR of
//! page N overlap with the feeder pulling page N+1, and a full downstream
//! queue naturally pauses the feeder.

use crate::config::PipelineConfig;
use crate::error::{ScanError, ToolError};
use crate::tool::{self, ToolCommand};
use async_trait::async_trait;
use image::{DynamicImage, ImageFormat};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Result of asking the feeder for the next sheet.
#[derive(Debug)]
pub enum Frame {
    Image(DynamicImage),
    EndOfFeeder,
}

/// Produces raw page images in feeder order.
#[async_trait]
pub trait ScanSource: Send {
    /// Fetch frame `index`. After `EndOfFeeder` or an error the source is
    /// not called again.
    async fn next_frame(&mut self, index: usize) -> Result<Frame, ScanError>;
}

/// File extensions [`DirectorySource`] picks up.
pub const FRAME_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "pnm", "pbm", "pgm", "ppm"];

// ── scanimage ────────────────────────────────────────────────────────────

/// Drives SANE's `scanimage` front-end, one sheet per invocation.
#[derive(Debug, Clone)]
pub struct ScanimageSource {
    command: ToolCommand,
    timeout: Duration,
    end_of_feeder_codes: Vec<i32>,
    frames_dir: Option<PathBuf>,
}

impl ScanimageSource {
    pub fn from_config(config: &PipelineConfig) -> Self {
        let mut command = ToolCommand::new(&config.scan_program);
        if let Some(ref device) = config.device {
            command = command.arg("-d").arg(device);
        }
        command = command
            .arg(format!("--source={}", config.feeder_source))
            .arg(format!("--mode={}", config.scan_mode.sane_name()))
            .arg(format!("--resolution={}", config.resolution))
            .arg(format!("--page-width={}", config.page_width_mm))
            .arg(format!("--page-height={}", config.page_height_mm))
            .arg("-x")
            .arg(config.page_width_mm.to_string())
            .arg("-y")
            .arg(config.page_height_mm.to_string())
            .arg("--format=pnm");

        Self {
            command,
            timeout: Duration::from_secs(config.scan_timeout_secs),
            end_of_feeder_codes: config.end_of_feeder_codes.clone(),
            frames_dir: config.frames_dir.clone(),
        }
    }

    /// The command run for every frame.
    pub fn command(&self) -> &ToolCommand {
        &self.command
    }

    /// Whether a tool failure just means the feeder ran dry.
    pub fn is_end_of_feeder(&self, err: &ToolError) -> bool {
        match err {
            ToolError::NonZeroExit { code, stderr, .. } => {
                code.is_some_and(|c| self.end_of_feeder_codes.contains(&c))
                    || stderr.to_ascii_lowercase().contains("out of documents")
            }
            _ => false,
        }
    }
}

#[async_trait]
impl ScanSource for ScanimageSource {
    async fn next_frame(&mut self, index: usize) -> Result<Frame, ScanError> {
        let output = match tool::invoke(&self.command, None, self.timeout).await {
            Ok(output) => output,
            Err(e) if self.is_end_of_feeder(&e) => {
                info!("Feeder empty after {} frame(s)", index - 1);
                return Ok(Frame::EndOfFeeder);
            }
            Err(e) => return Err(ScanError::Tool { frame: index, source: e }),
        };

        let frames_dir = self.frames_dir.clone();
        let image = tokio::task::spawn_blocking(move || {
            let image = decode_frame(index, &output.stdout)?;
            if let Some(dir) = frames_dir {
                save_frame(&dir, index, &image)?;
            }
            Ok::<_, ScanError>(image)
        })
        .await
        .map_err(|e| ScanError::Decode {
            frame: index,
            detail: format!("decode task panicked: {e}"),
        })??;

        debug!(
            "Frame {}: {}x{} px",
            index,
            image.width(),
            image.height()
        );
        Ok(Frame::Image(image))
    }
}

/// Decode the PNM bytes `scanimage` writes to stdout.
pub fn decode_frame(index: usize, bytes: &[u8]) -> Result<DynamicImage, ScanError> {
    if bytes.is_empty() {
        return Err(ScanError::Decode {
            frame: index,
            detail: "scanner produced no image data".into(),
        });
    }
    image::load_from_memory_with_format(bytes, ImageFormat::Pnm).map_err(|e| ScanError::Decode {
        frame: index,
        detail: e.to_string(),
    })
}

/// File name a frame is kept under, e.g. `image-0007.png`.
pub fn frame_file_name(index: usize) -> String {
    format!("image-{index:04}.png")
}

/// Keep a copy of a raw frame so it can be reprocessed with [`DirectorySource`].
pub fn save_frame(dir: &Path, index: usize, image: &DynamicImage) -> Result<PathBuf, ScanError> {
    std::fs::create_dir_all(dir).map_err(|e| ScanError::Io {
        path: dir.to_path_buf(),
        source: e,
    })?;
    let path = dir.join(frame_file_name(index));
    image
        .save_with_format(&path, ImageFormat::Png)
        .map_err(|e| ScanError::Io {
            path: path.clone(),
            source: std::io::Error::other(e.to_string()),
        })?;
    debug!("Saved frame {} to {}", index, path.display());
    Ok(path)
}

// ── Directory ────────────────────────────────────────────────────────────

/// Replays previously scanned frames from a directory, sorted by file name.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    files: VecDeque<PathBuf>,
}

impl DirectorySource {
    /// List the image files in `dir`. Other files are ignored.
    pub fn open(dir: &Path) -> Result<Self, ScanError> {
        let io_err = |source| ScanError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            let is_frame = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| FRAME_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if is_frame && path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        info!("Found {} frame(s) in {}", files.len(), dir.display());
        Ok(Self {
            files: files.into(),
        })
    }

    /// Frames not yet handed out.
    pub fn remaining(&self) -> usize {
        self.files.len()
    }
}

#[async_trait]
impl ScanSource for DirectorySource {
    async fn next_frame(&mut self, index: usize) -> Result<Frame, ScanError> {
        let Some(path) = self.files.pop_front() else {
            return Ok(Frame::EndOfFeeder);
        };
        debug!("Frame {}: reading {}", index, path.display());
        let image = tokio::task::spawn_blocking(move || {
            image::open(&path).map_err(|e| ScanError::Decode {
                frame: index,
                detail: format!("{}: {e}", path.display()),
            })
        })
        .await
        .map_err(|e| ScanError::Decode {
            frame: index,
            detail: format!("decode task panicked: {e}"),
        })??;
        Ok(Frame::Image(image))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanMode;
    use image::{GrayImage, Luma};

    fn source() -> ScanimageSource {
        let config = PipelineConfig::builder()
            .device("fujitsu:ScanSnap S1500:53095")
            .scan_mode(ScanMode::Color)
            .resolution(300)
            .build()
            .unwrap();
        ScanimageSource::from_config(&config)
    }

    fn exit(code: Option<i32>, stderr: &str) -> ToolError {
        ToolError::NonZeroExit {
            program: "scanimage".into(),
            code,
            stderr: stderr.into(),
        }
    }

    #[test]
    fn command_carries_device_mode_and_resolution() {
        let line = source().command().to_string();
        assert!(line.starts_with("scanimage -d 'fujitsu:ScanSnap S1500:53095'"), "{line}");
        assert!(line.contains("'--source=ADF Duplex'"), "{line}");
        assert!(line.contains("--mode=Color"), "{line}");
        assert!(line.contains("--resolution=300"), "{line}");
        assert!(line.ends_with("--format=pnm"), "{line}");
    }

    #[test]
    fn no_device_means_no_dash_d() {
        let s = ScanimageSource::from_config(&PipelineConfig::default());
        assert!(!s.command().args.contains(&"-d".to_string()));
    }

    #[test]
    fn exit_seven_is_end_of_feeder() {
        assert!(source().is_end_of_feeder(&exit(Some(7), "")));
    }

    #[test]
    fn out_of_documents_message_is_end_of_feeder() {
        let err = exit(
            Some(1),
            "scanimage: sane_start: Document feeder out of documents",
        );
        assert!(source().is_end_of_feeder(&err));
    }

    #[test]
    fn other_failures_are_not_end_of_feeder() {
        let s = source();
        assert!(!s.is_end_of_feeder(&exit(Some(1), "Error during device I/O")));
        assert!(!s.is_end_of_feeder(&exit(None, "")));
        assert!(!s.is_end_of_feeder(&ToolError::TimedOut {
            program: "scanimage".into(),
            secs: 120
        }));
    }

    #[test]
    fn decodes_pgm_frame() {
        let mut bytes = b"P5\n3 2\n255\n".to_vec();
        bytes.extend_from_slice(&[0, 128, 255, 255, 128, 0]);
        let img = decode_frame(1, &bytes).unwrap();
        assert_eq!((img.width(), img.height()), (3, 2));
    }

    #[test]
    fn empty_output_is_a_decode_error() {
        let err = decode_frame(4, b"").unwrap_err();
        assert!(matches!(err, ScanError::Decode { frame: 4, .. }));
    }

    #[test]
    fn garbage_output_is_a_decode_error() {
        let err = decode_frame(2, b"not an image").unwrap_err();
        assert!(err.to_string().contains("Frame 2"));
    }

    #[test]
    fn frame_names_sort_in_scan_order() {
        assert_eq!(frame_file_name(7), "image-0007.png");
        assert!(frame_file_name(9) < frame_file_name(10));
    }

    fn write_frame(dir: &Path, name: &str, shade: u8) {
        GrayImage::from_pixel(4, 4, Luma([shade]))
            .save(dir.join(name))
            .unwrap();
    }

    #[tokio::test]
    async fn directory_source_yields_frames_sorted_by_name() {
        let dir = tempfile::tempdir().unwrap();
        write_frame(dir.path(), "image-0002.png", 20);
        write_frame(dir.path(), "image-0001.png", 10);
        std::fs::write(dir.path().join("notes.txt"), "ignore me").unwrap();

        let mut src = DirectorySource::open(dir.path()).unwrap();
        assert_eq!(src.remaining(), 2);

        let Frame::Image(first) = src.next_frame(1).await.unwrap() else {
            panic!("expected a frame");
        };
        assert_eq!(first.to_luma8().get_pixel(0, 0)[0], 10);
        assert!(matches!(src.next_frame(2).await.unwrap(), Frame::Image(_)));
        assert!(matches!(src.next_frame(3).await.unwrap(), Frame::EndOfFeeder));
    }

    #[tokio::test]
    async fn directory_source_reports_undecodable_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("image-0001.png"), b"truncated").unwrap();
        let mut src = DirectorySource::open(dir.path()).unwrap();
        let err = src.next_frame(1).await.unwrap_err();
        assert!(matches!(err, ScanError::Decode { frame: 1, .. }));
    }

    #[test]
    fn directory_source_reports_missing_directory() {
        let err = DirectorySource::open(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, ScanError::Io { .. }));
    }

    #[tokio::test]
    async fn saved_frames_replay_through_directory_source() {
        let dir = tempfile::tempdir().unwrap();
        let frames = dir.path().join("frames");
        for index in 1..=3 {
            let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(2, 2, Luma([index as u8])));
            save_frame(&frames, index, &img).unwrap();
        }
        let mut src = DirectorySource::open(&frames).unwrap();
        for index in 1..=3 {
            match src.next_frame(index).await.unwrap() {
                Frame::Image(img) => assert_eq!(img.to_luma8().get_pixel(0, 0)[0], index as u8),
                Frame::EndOfFeeder => panic!("ran out early"),
            }
        }
    }
}
