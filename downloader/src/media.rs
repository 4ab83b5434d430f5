/// ffmpeg / ffprobe wrappers: compression, duration probing and segmenting.
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tracing::{error, info};

use vidbot_shared::errors::{excerpt, PipelineError};

use crate::runner::ToolRunner;

/// x264 constant-quality factor used for the single compression pass.
pub const COMPRESS_CRF: &str = "28";
pub const COMPRESS_PRESET: &str = "fast";
pub const COMPRESS_AUDIO_BITRATE: &str = "128k";

/// Transcoding operations the delivery pipeline depends on.
#[async_trait]
pub trait MediaToolkit: Send + Sync {
    /// Re-encode `src` to an H.264/AAC MP4 at `dst`.
    async fn compress(&self, src: &Path, dst: &Path) -> Result<(), PipelineError>;

    /// Container duration in seconds.
    async fn probe_duration(&self, src: &Path) -> Result<f64, PipelineError>;

    /// Remux `src` into segments of `segment_secs` without re-encoding.
    /// `pattern` contains a `%03d` placeholder for the segment number.
    async fn split(&self, src: &Path, segment_secs: f64, pattern: &Path) -> Result<(), PipelineError>;
}

pub struct FfmpegToolkit {
    runner: Arc<dyn ToolRunner>,
    ffmpeg_bin: String,
    ffprobe_bin: String,
    timeout: Duration,
}

impl FfmpegToolkit {
    pub fn new(
        runner: Arc<dyn ToolRunner>,
        ffmpeg_bin: impl Into<String>,
        ffprobe_bin: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            ffmpeg_bin: ffmpeg_bin.into(),
            ffprobe_bin: ffprobe_bin.into(),
            timeout,
        }
    }
}

pub fn compress_args(src: &Path, dst: &Path) -> Vec<String> {
    vec![
        "-hide_banner".into(),
        "-y".into(),
        "-i".into(),
        src.display().to_string(),
        "-c:v".into(),
        "libx264".into(),
        "-crf".into(),
        COMPRESS_CRF.into(),
        "-preset".into(),
        COMPRESS_PRESET.into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        COMPRESS_AUDIO_BITRATE.into(),
        "-movflags".into(),
        "+faststart".into(),
        dst.display().to_string(),
    ]
}

pub fn probe_args(src: &Path) -> Vec<String> {
    vec![
        "-v".into(),
        "error".into(),
        "-show_entries".into(),
        "format=duration".into(),
        "-of".into(),
        "default=noprint_wrappers=1:nokey=1".into(),
        src.display().to_string(),
    ]
}

pub fn split_args(src: &Path, segment_secs: f64, pattern: &Path) -> Vec<String> {
    vec![
        "-hide_banner".into(),
        "-y".into(),
        "-i".into(),
        src.display().to_string(),
        "-c".into(),
        "copy".into(),
        "-map".into(),
        "0".into(),
        "-f".into(),
        "segment".into(),
        "-segment_time".into(),
        segment_secs.to_string(),
        "-reset_timestamps".into(),
        "1".into(),
        pattern.display().to_string(),
    ]
}

/// Parse ffprobe's duration output. Anything but a positive finite number is an error.
pub fn parse_duration(stdout: &str) -> Result<f64, PipelineError> {
    let text = stdout.trim();
    let value: f64 = text
        .lines()
        .next()
        .unwrap_or("")
        .trim()
        .parse()
        .map_err(|_| PipelineError::Probe(format!("unexpected ffprobe output {:?}", excerpt(text, 80))))?;
    if !value.is_finite() || value <= 0.0 {
        return Err(PipelineError::Probe(format!("invalid duration {}", value)));
    }
    Ok(value)
}

#[async_trait]
impl MediaToolkit for FfmpegToolkit {
    async fn compress(&self, src: &Path, dst: &Path) -> Result<(), PipelineError> {
        info!("Compressing {:?} -> {:?}", src, dst);
        let output = self
            .runner
            .run(&self.ffmpeg_bin, &compress_args(src, dst), self.timeout)
            .await
            .map_err(|e| PipelineError::Transcode(e.to_string()))?;
        if !output.success {
            error!("ffmpeg compression failed for {:?}:\n{}", src, output.stderr);
            return Err(PipelineError::Transcode(excerpt(&output.stderr, 300)));
        }
        Ok(())
    }

    async fn probe_duration(&self, src: &Path) -> Result<f64, PipelineError> {
        let output = self
            .runner
            .run(&self.ffprobe_bin, &probe_args(src), self.timeout)
            .await
            .map_err(|e| PipelineError::Probe(e.to_string()))?;
        if !output.success {
            error!("ffprobe failed for {:?}:\n{}", src, output.stderr);
            return Err(PipelineError::Probe(excerpt(&output.stderr, 300)));
        }
        parse_duration(&output.stdout)
    }

    async fn split(&self, src: &Path, segment_secs: f64, pattern: &Path) -> Result<(), PipelineError> {
        info!("Splitting {:?} into {:.3}s segments", src, segment_secs);
        let output = self
            .runner
            .run(&self.ffmpeg_bin, &split_args(src, segment_secs, pattern), self.timeout)
            .await
            .map_err(|e| PipelineError::Split(e.to_string()))?;
        if !output.success {
            error!("ffmpeg segmenting failed for {:?}:\n{}", src, output.stderr);
            return Err(PipelineError::Split(excerpt(&output.stderr, 300)));
        }
        Ok(())
    }
}
