//! Video frame extraction path: a single `ffmpeg` subprocess invocation with
//! seek/frame-count/format flags, reading the result back off disk. There is
//! no seek-then-retry fallback here — one deterministic attempt per call,
//! with the worker's own retry/backoff covering a failed extraction.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use uuid::Uuid;

use crate::error::ProcessorError;

use super::{ProcessedThumbnail, ProcessorParams, ProgressFn, image_path};

pub async fn process_video(
    input: &Path,
    output_dir: &Path,
    params: &ProcessorParams<'_>,
    timeout: Duration,
    ffmpeg_binary: &str,
    progress: &ProgressFn<'_>,
) -> Result<ProcessedThumbnail, ProcessorError> {
    progress(40);

    tokio::fs::create_dir_all(output_dir).await?;
    let frame_path = output_dir.join(format!("temp_{}.jpg", Uuid::new_v4()));

    let run = Command::new(ffmpeg_binary)
        .args(["-hide_banner", "-loglevel", "error", "-nostdin", "-y"])
        .args(["-ss", params.video_capture_time])
        .arg("-i")
        .arg(input)
        .args(["-frames:v", "1"])
        .args(["-f", "image2"])
        .arg(&frame_path)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let child = run?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(ProcessorError::VideoExtractionTimeout(timeout));
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let _ = tokio::fs::remove_file(&frame_path).await;
        return Err(ProcessorError::VideoExtractionFailed(stderr));
    }

    if !tokio::fs::try_exists(&frame_path).await.unwrap_or(false) {
        return Err(ProcessorError::VideoExtractionFailed(
            "ffmpeg exited successfully but produced no frame".to_string(),
        ));
    }

    progress(60);

    let result = image_path::process_frame_file(&frame_path, output_dir, params).await;

    if let Err(e) = tokio::fs::remove_file(&frame_path).await {
        tracing::warn!(path = %frame_path.display(), error = %e, "failed to remove temp frame");
    }

    let thumbnail = result?;
    progress(80);
    Ok(thumbnail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_ffmpeg_binary_surfaces_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let params = ProcessorParams {
            thumbnail_size: 128,
            jpeg_quality: 80,
            video_capture_time: "00:00:01",
        };
        let input = dir.path().join("input.mp4");
        tokio::fs::write(&input, b"not a real video").await.unwrap();

        let result = process_video(
            &input,
            dir.path(),
            &params,
            Duration::from_secs(5),
            "definitely-not-a-real-binary-xyz",
            &|_p| {},
        )
        .await;

        assert!(matches!(result, Err(ProcessorError::Io(_))));
    }
}
