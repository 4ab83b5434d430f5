/// Size-constrained delivery of one downloaded file.
///
/// Decision order for a file over the upload limit: compress (if enabled),
/// then split (if enabled), then send the original anyway. Split parts are
/// sent independently; one failed part never stops the others. The original
/// file is removed exactly once when the run ends, whatever the outcome.
use std::path::{Path, PathBuf};
use async_trait::async_trait;
use tracing::{error, info, warn};

use vidbot_shared::config::{Config, MB_IN_BYTES};
use vidbot_shared::errors::{excerpt, DeliveryError, PipelineError};
use vidbot_shared::models::{AttachmentKind, Chunk, FetchedArtifact, UserPreferences};

use crate::media::MediaToolkit;

/// Where files and progress messages go.
#[async_trait]
pub trait ChatSink: Send + Sync {
    /// Upload one file. No internal retries.
    async fn send_file(&self, path: &Path, kind: AttachmentKind) -> Result<(), DeliveryError>;

    /// Best-effort status message to the requesting chat.
    async fn notify(&self, text: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineLimits {
    pub upload_limit_bytes: u64,
    pub split_chunk_limit_bytes: u64,
}

impl PipelineLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            upload_limit_bytes: config.upload_limit_bytes(),
            split_chunk_limit_bytes: config.split_chunk_limit_bytes(),
        }
    }
}

/// The two preference switches the pipeline consults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryPolicy {
    pub compress: bool,
    pub split: bool,
}

impl From<&UserPreferences> for DeliveryPolicy {
    fn from(prefs: &UserPreferences) -> Self {
        Self {
            compress: prefs.compress_video,
            split: prefs.split_large_files,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentFile {
    /// Within the limit, sent untouched.
    Original,
    /// Re-encoded copy that fit under the limit.
    Compressed,
    /// Over the limit and nothing else applied; the transport may still reject it.
    OriginalOverLimit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitReport {
    pub parts: usize,
    pub succeeded: usize,
    /// 1-based part numbers that failed to send.
    pub failed: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent(SentFile),
    Split(SplitReport),
}

/// Equal-duration slicing of a file into parts of roughly `chunk_limit` bytes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitPlan {
    pub num_parts: u64,
    pub segment_secs: f64,
}

/// `num_parts = ceil(size / chunk_limit)`, `segment_secs = duration / num_parts`.
///
/// Assumes a roughly constant bitrate; resulting part sizes are not re-checked.
pub fn plan_split(size_bytes: u64, chunk_limit_bytes: u64, duration_secs: f64) -> Result<SplitPlan, PipelineError> {
    if chunk_limit_bytes == 0 {
        return Err(PipelineError::Split("chunk limit is zero".into()));
    }
    if !duration_secs.is_finite() || duration_secs <= 0.0 {
        return Err(PipelineError::Probe(format!("invalid duration {}", duration_secs)));
    }
    let num_parts = size_bytes.div_ceil(chunk_limit_bytes).max(1);
    Ok(SplitPlan {
        num_parts,
        segment_secs: duration_secs / num_parts as f64,
    })
}

pub struct DeliveryPipeline<'a> {
    tools: &'a dyn MediaToolkit,
    sink: &'a dyn ChatSink,
    limits: PipelineLimits,
}

impl<'a> DeliveryPipeline<'a> {
    pub fn new(tools: &'a dyn MediaToolkit, sink: &'a dyn ChatSink, limits: PipelineLimits) -> Self {
        Self { tools, sink, limits }
    }

    /// Deliver `artifact` and remove it afterwards, on success and failure alike.
    pub async fn deliver(
        &self,
        artifact: FetchedArtifact,
        policy: DeliveryPolicy,
    ) -> Result<DeliveryOutcome, PipelineError> {
        let path = artifact.path.clone();
        let result = self.run(artifact, policy).await;
        remove_quietly(&path).await;
        match &result {
            Ok(outcome) => info!("Delivery of {:?} finished: {:?}", path, outcome),
            Err(e) => error!("Delivery of {:?} failed: {}", path, e),
        }
        result
    }

    async fn run(
        &self,
        mut artifact: FetchedArtifact,
        policy: DeliveryPolicy,
    ) -> Result<DeliveryOutcome, PipelineError> {
        let limit = self.limits.upload_limit_bytes;
        if artifact.size_bytes <= limit {
            self.send_single(&artifact.path).await?;
            return Ok(DeliveryOutcome::Sent(SentFile::Original));
        }

        info!(
            "{:?} is {} bytes, over the {} byte limit (compress={}, split={})",
            artifact.path, artifact.size_bytes, limit, policy.compress, policy.split
        );
        self.sink
            .notify(&format!(
                "The file is {}, larger than the {} upload limit.",
                format_mb(artifact.size_bytes),
                format_mb(limit)
            ))
            .await;

        if policy.compress {
            match self.try_compress(&artifact).await {
                Ok(Some(compressed)) => {
                    let sent = self.send_single(&compressed).await;
                    remove_quietly(&compressed).await;
                    sent?;
                    return Ok(DeliveryOutcome::Sent(SentFile::Compressed));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Compression of {:?} failed, falling back: {}", artifact.path, e);
                    self.sink.notify(&e.user_message()).await;
                }
            }
        }

        if policy.split {
            let report = self.split_and_send(&mut artifact).await?;
            return Ok(DeliveryOutcome::Split(report));
        }

        self.sink
            .notify("Sending the original file anyway; Telegram may reject it.")
            .await;
        self.send_single(&artifact.path).await?;
        Ok(DeliveryOutcome::Sent(SentFile::OriginalOverLimit))
    }

    /// Compressed copy path if it fits under the limit, `None` if it is still too large.
    async fn try_compress(&self, artifact: &FetchedArtifact) -> Result<Option<PathBuf>, PipelineError> {
        let dst = sibling_path(&artifact.path, "_compressed", ".mp4");
        self.sink.notify("Compressing the video...").await;

        if let Err(e) = self.tools.compress(&artifact.path, &dst).await {
            remove_quietly(&dst).await;
            return Err(e);
        }
        let size = match tokio::fs::metadata(&dst).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                return Err(PipelineError::Transcode(format!("compressed file missing: {}", e)));
            }
        };

        if size <= self.limits.upload_limit_bytes {
            info!("Compressed {:?} to {} bytes", artifact.path, size);
            return Ok(Some(dst));
        }

        remove_quietly(&dst).await;
        self.sink
            .notify(&format!("Compressed file is still {}, too large.", format_mb(size)))
            .await;
        Ok(None)
    }

    async fn split_and_send(&self, artifact: &mut FetchedArtifact) -> Result<SplitReport, PipelineError> {
        let duration = match artifact.duration_secs {
            Some(d) => d,
            None => {
                let d = self.tools.probe_duration(&artifact.path).await?;
                artifact.duration_secs = Some(d);
                d
            }
        };
        let plan = plan_split(artifact.size_bytes, self.limits.split_chunk_limit_bytes, duration)?;
        let parts = plan.num_parts as usize;

        let naming = SegmentNaming::for_path(&artifact.path);
        info!(
            "Splitting {:?} ({:.1}s) into {} parts of {:.3}s",
            artifact.path, duration, parts, plan.segment_secs
        );
        self.sink
            .notify(&format!("Splitting into {} parts...", parts))
            .await;

        if let Err(e) = self
            .tools
            .split(&artifact.path, plan.segment_secs, &naming.pattern())
            .await
        {
            naming.remove_segments_from(0).await;
            return Err(e);
        }

        let chunks: Vec<Chunk> = (0..parts)
            .map(|index| Chunk {
                index,
                path: naming.segment(index),
            })
            .collect();

        let mut succeeded = 0usize;
        let mut failed = Vec::new();
        for chunk in &chunks {
            let number = chunk.display_index();
            self.sink
                .notify(&format!("Sending part {} of {}...", number, parts))
                .await;

            match self.send_chunk(chunk).await {
                Ok(()) => succeeded += 1,
                Err(e) => {
                    error!("Failed to send part {} of {:?}: {}", number, artifact.path, e);
                    self.sink
                        .notify(&format!("Failed to send part {}: {}", number, excerpt(&e.0, 200)))
                        .await;
                    failed.push(number);
                }
            }
            remove_quietly(&chunk.path).await;
        }

        let stray = naming.remove_segments_from(parts).await;
        if stray > 0 {
            warn!("Segmenter produced {} extra part(s) for {:?}, removed", stray, artifact.path);
        }

        let summary = if failed.is_empty() {
            format!("All {} parts sent.", parts)
        } else {
            let list: Vec<String> = failed.iter().map(|n| n.to_string()).collect();
            format!("Sent {} of {} parts. Failed parts: {}", succeeded, parts, list.join(", "))
        };
        self.sink.notify(&summary).await;

        Ok(SplitReport {
            parts,
            succeeded,
            failed,
        })
    }

    async fn send_chunk(&self, chunk: &Chunk) -> Result<(), DeliveryError> {
        if tokio::fs::metadata(&chunk.path).await.is_err() {
            return Err(DeliveryError(format!(
                "segment {:?} was not produced",
                chunk.path.file_name().unwrap_or_default()
            )));
        }
        self.sink
            .send_file(&chunk.path, AttachmentKind::for_path(&chunk.path))
            .await
    }

    async fn send_single(&self, path: &Path) -> Result<(), PipelineError> {
        self.sink
            .send_file(path, AttachmentKind::for_path(path))
            .await
            .map_err(PipelineError::Delivery)
    }
}

/// `<dir>/<stem>_NNN<ext>` names shared by the segmenter pattern and the send loop.
struct SegmentNaming {
    dir: PathBuf,
    stem: String,
    ext: String,
}

impl SegmentNaming {
    fn for_path(path: &Path) -> Self {
        Self {
            dir: path.parent().map(Path::to_path_buf).unwrap_or_default(),
            stem: path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default(),
            ext: path
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default(),
        }
    }

    fn pattern(&self) -> PathBuf {
        self.dir.join(format!("{}_%03d{}", self.stem, self.ext))
    }

    fn segment(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}_{:03}{}", self.stem, index, self.ext))
    }

    fn index_of(&self, file_name: &str) -> Option<usize> {
        let digits = file_name
            .strip_prefix(&self.stem)?
            .strip_prefix('_')?
            .strip_suffix(self.ext.as_str())?;
        if digits.len() < 3 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    /// Remove segment files numbered `from` and above. Returns how many were removed.
    async fn remove_segments_from(&self, from: usize) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if matches!(self.index_of(&name), Some(i) if i >= from) {
                remove_quietly(&entry.path()).await;
                removed += 1;
            }
        }
        removed
    }
}

/// `<dir>/<stem><suffix><ext>` next to `path`.
fn sibling_path(path: &Path, suffix: &str, ext: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!("{}{}{}", stem, suffix, ext))
}

/// Delete a file; already-absent files are fine.
pub async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {:?}: {}", path, e),
    }
}

pub fn format_mb(bytes: u64) -> String {
    format!("{:.1} MB", bytes as f64 / MB_IN_BYTES as f64)
}
