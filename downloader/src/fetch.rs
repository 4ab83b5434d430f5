/// yt-dlp invocation and artifact discovery.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use vidbot_shared::errors::{PipelineError, ToolError};
use vidbot_shared::models::{FetchMode, FetchResult, FetchedArtifact, MediaRequest, UserPreferences};

use crate::runner::ToolRunner;

/// Format preference chain: H.264+AAC up to 1080p first, best available last.
pub const VIDEO_FORMAT_SELECTOR: &str = "bv*[vcodec^=avc1][height<=1080]+ba[acodec^=mp4a]\
/bv*[vcodec^=avc1]+ba\
/bv*[height<=1080]+ba\
/bv*+ba\
/b[height<=1080]\
/b";

pub const AUDIO_FORMAT: &str = "mp3";

/// Extensions of files yt-dlp is still writing.
const PARTIAL_SUFFIXES: [&str; 3] = [".part", ".ytdl", ".temp"];

pub struct FetchInvoker {
    runner: Arc<dyn ToolRunner>,
    ytdlp_bin: String,
    timeout: Duration,
}

impl FetchInvoker {
    pub fn new(runner: Arc<dyn ToolRunner>, ytdlp_bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner,
            ytdlp_bin: ytdlp_bin.into(),
            timeout,
        }
    }

    /// Run yt-dlp once. Never fails: timeouts and spawn errors become `success == false`.
    pub async fn fetch(
        &self,
        url: &str,
        output_base: &Path,
        prefs: &UserPreferences,
        mode: FetchMode,
    ) -> FetchResult {
        let args = build_args(url, output_base, prefs, mode);
        info!("Fetching {} ({}) into {:?}", url, mode.as_str(), output_base);

        match self.runner.run(&self.ytdlp_bin, &args, self.timeout).await {
            Ok(output) => {
                if output.success {
                    debug!("yt-dlp output:\n{}", output.stdout);
                } else {
                    error!(
                        "yt-dlp exited with {:?} for {}:\n{}",
                        output.exit_code, url, output.stderr
                    );
                }
                FetchResult {
                    success: output.success,
                    stdout: output.stdout,
                    stderr: output.stderr,
                }
            }
            Err(ToolError::Timeout { secs, .. }) => {
                error!("yt-dlp timed out after {}s for {}", secs, url);
                FetchResult {
                    success: false,
                    stdout: String::new(),
                    stderr: format!("Download timed out after {} seconds", secs),
                }
            }
            Err(e) => {
                error!("yt-dlp could not run for {}: {}", url, e);
                FetchResult {
                    success: false,
                    stdout: String::new(),
                    stderr: e.to_string(),
                }
            }
        }
    }

    /// Fetch `request` into `dir` and return the file the downloader produced.
    pub async fn download(
        &self,
        request: &MediaRequest,
        dir: &Path,
        prefs: &UserPreferences,
        mode: FetchMode,
    ) -> Result<FetchedArtifact, PipelineError> {
        tokio::fs::create_dir_all(dir).await?;
        let output_base = dir.join(&request.base_name);
        let result = self
            .fetch(&request.normalized_url, &output_base, prefs, mode)
            .await;
        if !result.success {
            let detail = if result.stderr.trim().is_empty() {
                "downloader exited with an error".to_string()
            } else {
                result.stderr
            };
            return Err(PipelineError::Fetch(detail));
        }
        locate_artifact(dir, &request.base_name).await
    }
}

/// Argument vector for one yt-dlp run. `output_base` gets the extension appended by the tool.
pub fn build_args(
    url: &str,
    output_base: &Path,
    prefs: &UserPreferences,
    mode: FetchMode,
) -> Vec<String> {
    let mut args: Vec<String> = [
        "--retries",
        "10",
        "--fragment-retries",
        "10",
        "--sleep-requests",
        "1",
        "--concurrent-fragments",
        "4",
        "--no-playlist",
        "--no-overwrites",
        "--no-progress",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    args.push("-o".into());
    args.push(format!("{}.%(ext)s", output_base.display()));

    if let Some(proxy) = &prefs.proxy_url {
        args.push("--proxy".into());
        args.push(proxy.clone());
    }
    if let Some(browser) = &prefs.cookies_browser {
        args.push("--cookies-from-browser".into());
        args.push(browser.clone());
    }
    if prefs.force_ipv4 {
        args.push("--force-ipv4".into());
    }
    if prefs.use_faster_downloader {
        args.push("--downloader".into());
        args.push("aria2c".into());
        args.push("--downloader-args".into());
        args.push("aria2c:-x 16 -s 16 -k 1M".into());
    }

    match mode {
        FetchMode::Video => {
            args.push("-f".into());
            args.push(VIDEO_FORMAT_SELECTOR.into());
            args.push("--merge-output-format".into());
            args.push("mp4".into());
        }
        FetchMode::AudioOnly => {
            args.push("-x".into());
            args.push("--audio-format".into());
            args.push(AUDIO_FORMAT.into());
            args.push("--audio-quality".into());
            args.push("0".into());
        }
    }

    // End of options: the URL can never be read as a flag.
    args.push("--".into());
    args.push(url.to_string());
    args
}

/// First file in `dir` (lexicographic order) whose name starts with `base_name`.
pub async fn locate_artifact(dir: &Path, base_name: &str) -> Result<FetchedArtifact, PipelineError> {
    let not_found = || PipelineError::ArtifactNotFound {
        base_name: base_name.to_string(),
        dir: dir.to_path_buf(),
    };

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
        Err(e) => return Err(e.into()),
    };

    let mut candidates: Vec<PathBuf> = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(base_name) || PARTIAL_SUFFIXES.iter().any(|s| name.ends_with(s)) {
            continue;
        }
        if entry.file_type().await?.is_file() {
            candidates.push(entry.path());
        }
    }
    candidates.sort();

    let path = candidates.into_iter().next().ok_or_else(not_found)?;
    let size = tokio::fs::metadata(&path).await?.len();
    info!("Located artifact {:?} ({} bytes)", path, size);
    Ok(FetchedArtifact::new(path, size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ToolOutput;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted runner that records arguments and optionally drops a file like yt-dlp would.
    struct FakeYtDlp {
        calls: Mutex<Vec<Vec<String>>>,
        outcome: Result<ToolOutput, fn() -> ToolError>,
        produce_ext: Option<&'static str>,
    }

    impl FakeYtDlp {
        fn ok(produce_ext: Option<&'static str>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                outcome: Ok(ToolOutput { success: true, exit_code: Some(0), ..Default::default() }),
                produce_ext,
            }
        }

        fn failing(stderr: &str) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                outcome: Ok(ToolOutput {
                    success: false,
                    exit_code: Some(1),
                    stdout: "[generic] partial output".into(),
                    stderr: stderr.into(),
                }),
                produce_ext: None,
            }
        }
    }

    #[async_trait]
    impl ToolRunner for FakeYtDlp {
        async fn run(&self, _program: &str, args: &[String], _timeout: Duration) -> Result<ToolOutput, ToolError> {
            self.calls.lock().unwrap().push(args.to_vec());
            if let (Some(ext), Some(pos)) = (self.produce_ext, args.iter().position(|a| a == "-o")) {
                let template = &args[pos + 1];
                let path = template.replace("%(ext)s", ext);
                std::fs::write(path, b"media").unwrap();
            }
            match &self.outcome {
                Ok(out) => Ok(out.clone()),
                Err(make) => Err(make()),
            }
        }
    }

    fn request(base: &str) -> MediaRequest {
        MediaRequest {
            source_url: format!("https://example.com/{}?x=1", base),
            normalized_url: format!("https://example.com/{}", base),
            base_name: base.to_string(),
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter().position(|a| a == flag).map(|i| args[i + 1].as_str())
    }

    #[test]
    fn test_video_args_always_include_resilience_flags() {
        let args = build_args("https://x/v", Path::new("dl/clip"), &UserPreferences::default(), FetchMode::Video);
        assert_eq!(value_after(&args, "--retries"), Some("10"));
        assert_eq!(value_after(&args, "--fragment-retries"), Some("10"));
        assert_eq!(value_after(&args, "--sleep-requests"), Some("1"));
        assert_eq!(value_after(&args, "--concurrent-fragments"), Some("4"));
        assert!(args.contains(&"--no-playlist".to_string()));
        assert!(args.contains(&"--no-overwrites".to_string()));
        assert_eq!(value_after(&args, "-o"), Some("dl/clip.%(ext)s"));
        assert_eq!(value_after(&args, "-f"), Some(VIDEO_FORMAT_SELECTOR));
        assert_eq!(value_after(&args, "--merge-output-format"), Some("mp4"));
        assert_eq!(args[args.len() - 2], "--");
        assert_eq!(args.last().unwrap(), "https://x/v");
        assert!(!args.contains(&"--proxy".to_string()));
        assert!(!args.contains(&"--force-ipv4".to_string()));
        assert!(!args.contains(&"-x".to_string()));
    }

    #[test]
    fn test_format_selector_order() {
        let chain: Vec<&str> = VIDEO_FORMAT_SELECTOR.split('/').collect();
        assert_eq!(chain.len(), 6);
        assert!(chain[0].contains("avc1") && chain[0].contains("mp4a") && chain[0].contains("1080"));
        assert_eq!(chain[5], "b");
    }

    #[test]
    fn test_audio_args() {
        let args = build_args("https://x/v", Path::new("clip"), &UserPreferences::default(), FetchMode::AudioOnly);
        assert!(args.contains(&"-x".to_string()));
        assert_eq!(value_after(&args, "--audio-format"), Some("mp3"));
        assert_eq!(value_after(&args, "--audio-quality"), Some("0"));
        assert!(!args.contains(&"-f".to_string()));
    }

    #[test]
    fn test_optional_flags_from_preferences() {
        let prefs = UserPreferences {
            proxy_url: Some("socks5://127.0.0.1:9050".into()),
            cookies_browser: Some("firefox".into()),
            force_ipv4: true,
            use_faster_downloader: true,
            ..Default::default()
        };
        let args = build_args("https://x/v", Path::new("clip"), &prefs, FetchMode::Video);
        assert_eq!(value_after(&args, "--proxy"), Some("socks5://127.0.0.1:9050"));
        assert_eq!(value_after(&args, "--cookies-from-browser"), Some("firefox"));
        assert!(args.contains(&"--force-ipv4".to_string()));
        assert_eq!(value_after(&args, "--downloader"), Some("aria2c"));
        assert_eq!(value_after(&args, "--downloader-args"), Some("aria2c:-x 16 -s 16 -k 1M"));
    }

    #[test]
    fn test_hostile_url_stays_one_argument() {
        let url = "https://x/v';rm -rf ~;'";
        let args = build_args(url, Path::new("clip"), &UserPreferences::default(), FetchMode::Video);
        assert_eq!(args.last().unwrap(), url);
    }

    #[tokio::test]
    async fn test_fetch_nonzero_exit_is_failure() {
        let runner = Arc::new(FakeYtDlp::failing("ERROR: [youtube] abc: Private video"));
        let invoker = FetchInvoker::new(runner, "yt-dlp", Duration::from_secs(600));
        let result = invoker
            .fetch("https://x/v", Path::new("clip"), &UserPreferences::default(), FetchMode::Video)
            .await;
        assert!(!result.success);
        assert!(result.stderr.contains("Private video"));
        assert!(!result.stdout.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_timeout_becomes_synthetic_failure() {
        let runner = Arc::new(FakeYtDlp {
            calls: Mutex::new(Vec::new()),
            outcome: Err(|| ToolError::Timeout { program: "yt-dlp".into(), secs: 600 }),
            produce_ext: None,
        });
        let invoker = FetchInvoker::new(runner, "yt-dlp", Duration::from_secs(600));
        let result = invoker
            .fetch("https://x/v", Path::new("clip"), &UserPreferences::default(), FetchMode::Video)
            .await;
        assert!(!result.success);
        assert_eq!(result.stderr, "Download timed out after 600 seconds");
    }

    #[tokio::test]
    async fn test_download_locates_produced_file() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeYtDlp::ok(Some("mp4")));
        let invoker = FetchInvoker::new(runner.clone(), "yt-dlp", Duration::from_secs(600));

        let artifact = invoker
            .download(&request("clip"), dir.path(), &UserPreferences::default(), FetchMode::Video)
            .await
            .unwrap();

        assert_eq!(artifact.path, dir.path().join("clip.mp4"));
        assert_eq!(artifact.size_bytes, 5);
        assert_eq!(artifact.duration_secs, None);
        assert_eq!(runner.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_download_success_without_file_is_artifact_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = FetchInvoker::new(Arc::new(FakeYtDlp::ok(None)), "yt-dlp", Duration::from_secs(600));
        let err = invoker
            .download(&request("clip"), dir.path(), &UserPreferences::default(), FetchMode::Video)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ArtifactNotFound { ref base_name, .. } if base_name == "clip"));
    }

    #[tokio::test]
    async fn test_download_failure_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = FetchInvoker::new(
            Arc::new(FakeYtDlp::failing("ERROR: Unsupported URL")),
            "yt-dlp",
            Duration::from_secs(600),
        );
        let err = invoker
            .download(&request("clip"), dir.path(), &UserPreferences::default(), FetchMode::Video)
            .await
            .unwrap_err();
        match err {
            PipelineError::Fetch(detail) => assert!(detail.contains("Unsupported URL")),
            other => panic!("unexpected {:?}", other),
        }
        // Nothing was created beyond the request directory.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_locate_prefers_lexicographic_first_and_skips_partials() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clip.mp4.part"), b"x").unwrap();
        std::fs::write(dir.path().join("clip.webm"), b"xx").unwrap();
        std::fs::write(dir.path().join("clip.mkv"), b"xxx").unwrap();
        std::fs::write(dir.path().join("other.mp4"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("clip_dir")).unwrap();

        let artifact = locate_artifact(dir.path(), "clip").await.unwrap();
        assert_eq!(artifact.path, dir.path().join("clip.mkv"));
        assert_eq!(artifact.size_bytes, 3);
    }

    #[tokio::test]
    async fn test_locate_in_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let err = locate_artifact(&dir.path().join("nope"), "clip").await.unwrap_err();
        assert!(matches!(err, PipelineError::ArtifactNotFound { .. }));
    }
}
