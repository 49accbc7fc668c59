//! Media Processor: a pure transformation from an input file to one
//! thumbnail artifact on disk, reporting progress as it goes.

pub mod image_path;
pub mod video_path;

use std::path::{Path, PathBuf};

use crate::domain::FileKind;
use crate::error::ProcessorError;

/// Result of a successful `Process` call.
#[derive(Debug, Clone)]
pub struct ProcessedThumbnail {
    pub thumbnail_path: PathBuf,
    pub width: u32,
    pub height: u32,
}

/// Parameters that stay constant across a processing call.
#[derive(Debug, Clone, Copy)]
pub struct ProcessorParams<'a> {
    pub thumbnail_size: u32,
    pub jpeg_quality: u8,
    pub video_capture_time: &'a str,
}

/// A progress callback invoked by the processor at fixed checkpoints along
/// each path. The worker wires this to `Queue::update_progress`.
pub type ProgressFn<'a> = dyn Fn(u8) + Send + Sync + 'a;

/// `Process(input, kind, outputDir, progress) -> {thumbnailPath, width, height}`.
pub async fn process(
    input: &Path,
    kind: FileKind,
    output_dir: &Path,
    params: &ProcessorParams<'_>,
    video_timeout: std::time::Duration,
    ffmpeg_binary: &str,
    progress: &ProgressFn<'_>,
) -> Result<ProcessedThumbnail, ProcessorError> {
    if !tokio::fs::try_exists(input).await.unwrap_or(false) {
        return Err(ProcessorError::InputMissing(input.display().to_string()));
    }

    match kind {
        FileKind::Image => {
            let data = tokio::fs::read(input).await?;
            image_path::process_image_bytes(&data, output_dir, params, progress).await
        }
        FileKind::Video => {
            video_path::process_video(
                input,
                output_dir,
                params,
                video_timeout,
                ffmpeg_binary,
                progress,
            )
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_input_fails_with_input_missing() {
        let params = ProcessorParams {
            thumbnail_size: 128,
            jpeg_quality: 80,
            video_capture_time: "00:00:01",
        };
        let result = process(
            Path::new("/nonexistent/path/does-not-exist.jpg"),
            FileKind::Image,
            Path::new("/tmp"),
            &params,
            std::time::Duration::from_secs(1),
            "ffmpeg",
            &|_p| {},
        )
        .await;
        assert!(matches!(result, Err(ProcessorError::InputMissing(_))));
    }
}
