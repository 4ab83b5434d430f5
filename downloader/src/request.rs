/// One chat request end to end.
///
/// Runs every fetch mode the preferences ask for (video, then the audio
/// companion), each followed by a delivery run, inside a working directory
/// private to the request. A failed fetch stops the remaining modes; a failed
/// delivery does not. The directory is removed when the request ends.
use std::path::Path;
use tracing::{error, info, warn};

use vidbot_shared::models::{FetchMode, MediaRequest, UserPreferences};
use vidbot_shared::task_queue::{RequestStage, TaskQueue};

use crate::fetch::FetchInvoker;
use crate::media::MediaToolkit;
use crate::pipeline::{ChatSink, DeliveryOutcome, DeliveryPipeline, DeliveryPolicy, PipelineLimits};

/// Collaborators shared by every request.
pub struct RequestContext<'a> {
    pub fetcher: &'a FetchInvoker,
    pub tools: &'a dyn MediaToolkit,
    pub sink: &'a dyn ChatSink,
    pub limits: PipelineLimits,
    pub queue: &'a TaskQueue,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestSummary {
    pub delivered: Vec<(FetchMode, DeliveryOutcome)>,
    /// Mode whose fetch failed. Later modes were skipped.
    pub fetch_failed: Option<FetchMode>,
    pub delivery_failures: usize,
}

impl RequestSummary {
    pub fn is_success(&self) -> bool {
        self.fetch_failed.is_none() && self.delivery_failures == 0
    }
}

fn fetch_notice(mode: FetchMode) -> &'static str {
    match mode {
        FetchMode::Video => "Downloading video...",
        FetchMode::AudioOnly => "Downloading audio...",
    }
}

/// Fetch and deliver `request` under `dir`, then remove `dir`.
///
/// Stages are reported to `ctx.queue`; the final stage is `Done` only if every
/// mode was fetched and delivered.
pub async fn run_request(
    ctx: &RequestContext<'_>,
    request_id: &str,
    request: &MediaRequest,
    prefs: &UserPreferences,
    dir: &Path,
) -> RequestSummary {
    let policy = DeliveryPolicy::from(prefs);
    let mut summary = RequestSummary::default();

    for mode in prefs.fetch_modes() {
        ctx.queue.set_stage(request_id, RequestStage::Fetching).await;
        ctx.sink.notify(fetch_notice(mode)).await;

        let artifact = match ctx
            .fetcher
            .download(request, &dir.join(mode.as_str()), prefs, mode)
            .await
        {
            Ok(a) => a,
            Err(e) => {
                error!("Request {} ({}) fetch failed: {}", request_id, mode.as_str(), e);
                ctx.sink.notify(&format!("❌ {}", e.user_message())).await;
                summary.fetch_failed = Some(mode);
                break;
            }
        };

        ctx.queue.set_stage(request_id, RequestStage::Delivering).await;
        let pipeline = DeliveryPipeline::new(ctx.tools, ctx.sink, ctx.limits);
        match pipeline.deliver(artifact, policy).await {
            Ok(outcome) => summary.delivered.push((mode, outcome)),
            Err(e) => {
                ctx.sink.notify(&format!("❌ {}", e.user_message())).await;
                summary.delivery_failures += 1;
            }
        }
    }

    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {:?}: {}", dir, e);
        }
    }

    let stage = if summary.is_success() {
        RequestStage::Done
    } else {
        RequestStage::Failed
    };
    ctx.queue.set_stage(request_id, stage).await;
    info!("Request {} finished: {}", request_id, stage.as_str());
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use async_trait::async_trait;

    use vidbot_shared::errors::{DeliveryError, PipelineError, ToolError};
    use vidbot_shared::models::AttachmentKind;

    use crate::pipeline::SentFile;
    use crate::runner::{ToolOutput, ToolRunner};

    /// Acts like yt-dlp: writes `<template>.mp4` or `.mp3`, or fails on a chosen call.
    struct ScriptedYtDlp {
        fail_on_call: Option<usize>,
        stderr: String,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedYtDlp {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                fail_on_call: None,
                stderr: String::new(),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn failing_on(call: usize, stderr: &str) -> Arc<Self> {
            Arc::new(Self {
                fail_on_call: Some(call),
                stderr: stderr.to_string(),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn audio_flags(&self) -> Vec<bool> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|args| args.contains(&"-x".to_string()))
                .collect()
        }
    }

    #[async_trait]
    impl ToolRunner for ScriptedYtDlp {
        async fn run(&self, _program: &str, args: &[String], _timeout: Duration) -> Result<ToolOutput, ToolError> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(args.to_vec());
                calls.len()
            };
            let pos = args.iter().position(|a| a == "-o").unwrap();
            let template = &args[pos + 1];

            if self.fail_on_call == Some(call) {
                // Leftover fragment, as an interrupted download leaves behind.
                std::fs::write(template.replace("%(ext)s", "mp4.part"), b"partial").unwrap();
                return Ok(ToolOutput {
                    success: false,
                    exit_code: Some(1),
                    stdout: String::new(),
                    stderr: self.stderr.clone(),
                });
            }

            let ext = if args.contains(&"-x".to_string()) { "mp3" } else { "mp4" };
            std::fs::write(template.replace("%(ext)s", ext), vec![0u8; 1024]).unwrap();
            Ok(ToolOutput {
                success: true,
                exit_code: Some(0),
                ..Default::default()
            })
        }
    }

    /// Small files never reach the media tools.
    struct UnusedTools;

    #[async_trait]
    impl MediaToolkit for UnusedTools {
        async fn compress(&self, _src: &Path, _dst: &Path) -> Result<(), PipelineError> {
            panic!("compress called for a small file");
        }

        async fn probe_duration(&self, _src: &Path) -> Result<f64, PipelineError> {
            panic!("probe called for a small file");
        }

        async fn split(&self, _src: &Path, _segment_secs: f64, _pattern: &Path) -> Result<(), PipelineError> {
            panic!("split called for a small file");
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        fail_calls: Vec<usize>,
        sends: Mutex<Vec<(PathBuf, AttachmentKind)>>,
        notes: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChatSink for RecordingSink {
        async fn send_file(&self, path: &Path, kind: AttachmentKind) -> Result<(), DeliveryError> {
            let mut sends = self.sends.lock().unwrap();
            sends.push((path.to_path_buf(), kind));
            if self.fail_calls.contains(&sends.len()) {
                return Err(DeliveryError("Request Entity Too Large".into()));
            }
            Ok(())
        }

        async fn notify(&self, text: &str) {
            self.notes.lock().unwrap().push(text.to_string());
        }
    }

    fn request() -> MediaRequest {
        MediaRequest {
            source_url: "https://example.com/clip?t=1".into(),
            normalized_url: "https://example.com/clip".into(),
            base_name: "clip".into(),
        }
    }

    fn limits() -> PipelineLimits {
        PipelineLimits {
            upload_limit_bytes: 50 * 1024 * 1024,
            split_chunk_limit_bytes: 40 * 1024 * 1024,
        }
    }

    struct Harness {
        _root: tempfile::TempDir,
        dir: PathBuf,
        queue: TaskQueue,
        request_id: String,
    }

    async fn harness() -> Harness {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("42").join("req");
        let queue = TaskQueue::new(1);
        let request_id = queue.enqueue(42, "https://example.com/clip").await;
        Harness {
            _root: root,
            dir,
            queue,
            request_id,
        }
    }

    async fn run(
        h: &Harness,
        runner: Arc<ScriptedYtDlp>,
        sink: &RecordingSink,
        prefs: &UserPreferences,
    ) -> RequestSummary {
        let fetcher = FetchInvoker::new(runner, "yt-dlp", Duration::from_secs(600));
        let ctx = RequestContext {
            fetcher: &fetcher,
            tools: &UnusedTools,
            sink,
            limits: limits(),
            queue: &h.queue,
        };
        run_request(&ctx, &h.request_id, &request(), prefs, &h.dir).await
    }

    #[tokio::test]
    async fn test_video_then_audio_companion() {
        let h = harness().await;
        let runner = ScriptedYtDlp::ok();
        let sink = RecordingSink::default();
        let prefs = UserPreferences {
            download_audio: true,
            ..Default::default()
        };

        let summary = run(&h, runner.clone(), &sink, &prefs).await;

        assert_eq!(runner.audio_flags(), vec![false, true]);
        assert_eq!(
            *sink.sends.lock().unwrap(),
            vec![
                (h.dir.join("video").join("clip.mp4"), AttachmentKind::Document),
                (h.dir.join("audio").join("clip.mp3"), AttachmentKind::Audio),
            ]
        );
        assert_eq!(
            summary.delivered,
            vec![
                (FetchMode::Video, DeliveryOutcome::Sent(SentFile::Original)),
                (FetchMode::AudioOnly, DeliveryOutcome::Sent(SentFile::Original)),
            ]
        );
        assert!(summary.is_success());
        assert!(!h.dir.exists());
        assert_eq!(h.queue.stats().await.done, 1);
    }

    #[tokio::test]
    async fn test_audio_only_runs_single_extraction() {
        let h = harness().await;
        let runner = ScriptedYtDlp::ok();
        let sink = RecordingSink::default();
        let prefs = UserPreferences {
            download_audio: true,
            audio_only: true,
            ..Default::default()
        };

        let summary = run(&h, runner.clone(), &sink, &prefs).await;

        assert_eq!(runner.audio_flags(), vec![true]);
        assert_eq!(summary.delivered.len(), 1);
        assert_eq!(summary.delivered[0].0, FetchMode::AudioOnly);
        assert!(!h.dir.exists());
    }

    #[tokio::test]
    async fn test_fetch_failure_stops_remaining_modes() {
        let h = harness().await;
        let runner = ScriptedYtDlp::failing_on(1, "ERROR: [generic] clip: Video unavailable");
        let sink = RecordingSink::default();
        let prefs = UserPreferences {
            download_audio: true,
            ..Default::default()
        };

        let summary = run(&h, runner.clone(), &sink, &prefs).await;

        assert_eq!(runner.audio_flags(), vec![false]);
        assert!(sink.sends.lock().unwrap().is_empty());
        assert_eq!(summary.fetch_failed, Some(FetchMode::Video));
        let notes = sink.notes.lock().unwrap().clone();
        assert!(notes
            .last()
            .unwrap()
            .ends_with("ERROR: [generic] clip: Video unavailable"));
        assert!(!h.dir.exists());
        assert_eq!(h.queue.stats().await.failed, 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_message_keeps_stderr_tail() {
        let h = harness().await;
        let noise = "[debug] retrying fragment\n".repeat(200);
        let stderr = format!("{}ERROR: [youtube] clip: Private video", noise);
        let runner = ScriptedYtDlp::failing_on(1, &stderr);
        let sink = RecordingSink::default();

        run(&h, runner, &sink, &UserPreferences::default()).await;

        let notes = sink.notes.lock().unwrap().clone();
        let message = notes.last().unwrap();
        assert!(message.ends_with("ERROR: [youtube] clip: Private video"));
        assert!(message.chars().count() < stderr.chars().count());
    }

    #[tokio::test]
    async fn test_delivery_failure_does_not_stop_audio_companion() {
        let h = harness().await;
        let runner = ScriptedYtDlp::ok();
        let sink = RecordingSink {
            fail_calls: vec![1],
            ..Default::default()
        };
        let prefs = UserPreferences {
            download_audio: true,
            ..Default::default()
        };

        let summary = run(&h, runner.clone(), &sink, &prefs).await;

        assert_eq!(runner.audio_flags(), vec![false, true]);
        assert_eq!(summary.delivery_failures, 1);
        assert_eq!(
            summary.delivered,
            vec![(FetchMode::AudioOnly, DeliveryOutcome::Sent(SentFile::Original))]
        );
        assert!(sink.notes.lock().unwrap().iter().any(|n| n.starts_with("❌ Upload failed")));
        assert!(!h.dir.exists());
        assert_eq!(h.queue.stats().await.failed, 1);
    }
}
