//! Pipeline configuration, loaded once at startup into an immutable value —
//! no hidden globals read from the environment mid-run.
//!
//! Each field is read with a per-setting `env::var("X").ok().and_then(...)`
//! idiom, gathered into one constructor instead of scattered free
//! functions.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub thumbnail_size: u32,
    pub thumbnail_quality: u8,
    pub video_capture_time: String,
    pub worker_concurrency: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub job_timeout: Duration,
    pub video_extraction_timeout: Duration,
    pub shutdown_drain: Duration,
    pub upload_dir: PathBuf,
    pub output_dir: PathBuf,
    pub ffmpeg_binary: String,
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T, valid: impl Fn(&T) -> bool) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(valid)
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            thumbnail_size: 128,
            thumbnail_quality: 80,
            video_capture_time: "00:00:01".to_string(),
            worker_concurrency: 1,
            max_attempts: 3,
            backoff_base_ms: 2000,
            job_timeout: Duration::from_millis(300_000),
            video_extraction_timeout: Duration::from_millis(60_000),
            shutdown_drain: Duration::from_millis(30_000),
            upload_dir: PathBuf::from("uploads"),
            output_dir: PathBuf::from("uploads/thumbnails"),
            ffmpeg_binary: "ffmpeg".to_string(),
        }
    }
}

impl Config {
    /// Build configuration from environment variables, falling back to the
    /// compiled-in defaults for anything unset or out of range.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let upload_dir =
            PathBuf::from(env_string("UPLOAD_DIR", defaults.upload_dir.to_str().unwrap()));
        let output_dir = std::env::var("OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| upload_dir.join("thumbnails"));

        Self {
            thumbnail_size: env_parsed("THUMBNAIL_SIZE", defaults.thumbnail_size, |v| *v > 0),
            thumbnail_quality: env_parsed(
                "THUMBNAIL_QUALITY",
                defaults.thumbnail_quality,
                |v| *v > 0 && *v <= 100,
            ),
            video_capture_time: env_string("VIDEO_CAPTURE_TIME", &defaults.video_capture_time),
            worker_concurrency: env_parsed(
                "WORKER_CONCURRENCY",
                defaults.worker_concurrency,
                |v| *v > 0,
            ),
            max_attempts: env_parsed("MAX_ATTEMPTS", defaults.max_attempts, |v| *v > 0),
            backoff_base_ms: env_parsed("BACKOFF_BASE_MS", defaults.backoff_base_ms, |v| *v > 0),
            job_timeout: Duration::from_millis(env_parsed(
                "JOB_TIMEOUT_MS",
                defaults.job_timeout.as_millis() as u64,
                |v| *v > 0,
            )),
            video_extraction_timeout: Duration::from_millis(env_parsed(
                "VIDEO_EXTRACTION_TIMEOUT_MS",
                defaults.video_extraction_timeout.as_millis() as u64,
                |v| *v > 0,
            )),
            shutdown_drain: Duration::from_millis(env_parsed(
                "SHUTDOWN_DRAIN_MS",
                defaults.shutdown_drain.as_millis() as u64,
                |v| *v > 0,
            )),
            upload_dir,
            output_dir,
            ffmpeg_binary: env_string("FFMPEG_BINARY", &defaults.ffmpeg_binary),
        }
    }

    /// Stall window: the queue treats a reserved entry with no keep-alive
    /// within this window as stalled. Defaults to the job timeout.
    pub fn stall_window(&self) -> Duration {
        self.job_timeout
    }

    pub fn thumbnail_size_label(&self) -> String {
        format!("{}x{}", self.thumbnail_size, self.thumbnail_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = Config::default();
        assert_eq!(cfg.thumbnail_size, 128);
        assert_eq!(cfg.thumbnail_quality, 80);
        assert_eq!(cfg.video_capture_time, "00:00:01");
        assert_eq!(cfg.worker_concurrency, 1);
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.backoff_base_ms, 2000);
        assert_eq!(cfg.job_timeout, Duration::from_secs(300));
        assert_eq!(cfg.video_extraction_timeout, Duration::from_secs(60));
        assert_eq!(cfg.shutdown_drain, Duration::from_secs(30));
    }

    #[test]
    fn thumbnail_size_label_is_square() {
        let cfg = Config::default();
        assert_eq!(cfg.thumbnail_size_label(), "128x128");
    }
}
