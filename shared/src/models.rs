/// Data model shared across all Vidbot crates.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One incoming link after normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRequest {
    pub source_url: String,
    pub normalized_url: String,
    /// Filesystem-safe stem for every artifact of this request.
    pub base_name: String,
}

/// Per-user behaviour, persisted in the settings document.
///
/// Missing keys in an older document are filled from `Default`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserPreferences {
    pub download_audio: bool,
    pub audio_only: bool,
    pub compress_video: bool,
    pub split_large_files: bool,
    pub proxy_url: Option<String>,
    pub cookies_browser: Option<String>,
    pub use_faster_downloader: bool,
    pub force_ipv4: bool,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            download_audio: false,
            audio_only: false,
            compress_video: false,
            split_large_files: true,
            proxy_url: None,
            cookies_browser: None,
            use_faster_downloader: false,
            force_ipv4: false,
        }
    }
}

impl UserPreferences {
    /// Every key a current record carries. Used to detect records written by older versions.
    pub const KEYS: [&'static str; 8] = [
        "download_audio",
        "audio_only",
        "compress_video",
        "split_large_files",
        "proxy_url",
        "cookies_browser",
        "use_faster_downloader",
        "force_ipv4",
    ];

    /// Flip one boolean preference.
    ///
    /// `audio_only` always implies `download_audio`, in both directions.
    pub fn toggle(&mut self, toggle: PreferenceToggle) {
        match toggle {
            PreferenceToggle::DownloadAudio => {
                self.download_audio = !self.download_audio;
                if !self.download_audio {
                    self.audio_only = false;
                }
            }
            PreferenceToggle::AudioOnly => {
                self.audio_only = !self.audio_only;
                if self.audio_only {
                    self.download_audio = true;
                }
            }
            PreferenceToggle::CompressVideo => self.compress_video = !self.compress_video,
            PreferenceToggle::SplitLargeFiles => self.split_large_files = !self.split_large_files,
            PreferenceToggle::FasterDownloader => {
                self.use_faster_downloader = !self.use_faster_downloader
            }
            PreferenceToggle::ForceIpv4 => self.force_ipv4 = !self.force_ipv4,
        }
    }

    /// Restore `audio_only => download_audio` on a record that came from disk.
    /// Returns true if the record was changed.
    pub fn repair(&mut self) -> bool {
        if self.audio_only && !self.download_audio {
            self.download_audio = true;
            return true;
        }
        false
    }

    pub fn is_enabled(&self, toggle: PreferenceToggle) -> bool {
        match toggle {
            PreferenceToggle::DownloadAudio => self.download_audio,
            PreferenceToggle::AudioOnly => self.audio_only,
            PreferenceToggle::CompressVideo => self.compress_video,
            PreferenceToggle::SplitLargeFiles => self.split_large_files,
            PreferenceToggle::FasterDownloader => self.use_faster_downloader,
            PreferenceToggle::ForceIpv4 => self.force_ipv4,
        }
    }

    /// Which fetch runs a request performs, in order.
    pub fn fetch_modes(&self) -> Vec<FetchMode> {
        if self.audio_only {
            vec![FetchMode::AudioOnly]
        } else if self.download_audio {
            vec![FetchMode::Video, FetchMode::AudioOnly]
        } else {
            vec![FetchMode::Video]
        }
    }
}

/// Boolean preferences a settings button can flip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PreferenceToggle {
    DownloadAudio,
    AudioOnly,
    CompressVideo,
    SplitLargeFiles,
    FasterDownloader,
    ForceIpv4,
}

impl PreferenceToggle {
    pub const ALL: [PreferenceToggle; 6] = [
        PreferenceToggle::DownloadAudio,
        PreferenceToggle::AudioOnly,
        PreferenceToggle::CompressVideo,
        PreferenceToggle::SplitLargeFiles,
        PreferenceToggle::FasterDownloader,
        PreferenceToggle::ForceIpv4,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            PreferenceToggle::DownloadAudio => "audio",
            PreferenceToggle::AudioOnly => "audio_only",
            PreferenceToggle::CompressVideo => "compress",
            PreferenceToggle::SplitLargeFiles => "split",
            PreferenceToggle::FasterDownloader => "fast",
            PreferenceToggle::ForceIpv4 => "ipv4",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.key() == key)
    }

    pub fn label(&self) -> &'static str {
        match self {
            PreferenceToggle::DownloadAudio => "Download audio",
            PreferenceToggle::AudioOnly => "Audio only",
            PreferenceToggle::CompressVideo => "Compress large videos",
            PreferenceToggle::SplitLargeFiles => "Split large files",
            PreferenceToggle::FasterDownloader => "Faster downloader (aria2c)",
            PreferenceToggle::ForceIpv4 => "Force IPv4",
        }
    }
}

/// Parse the argument of `/set_proxy` or `/set_cookies`. Empty or `none` clears the value.
pub fn parse_optional_setting(arg: &str) -> Option<String> {
    let value = arg.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("none") {
        None
    } else {
        Some(value.to_string())
    }
}

/// Download variant requested from the external downloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Video,
    AudioOnly,
}

impl FetchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchMode::Video => "video",
            FetchMode::AudioOnly => "audio",
        }
    }
}

/// Outcome of one downloader invocation. `success` comes from the exit code only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// A downloaded file owned by one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedArtifact {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Filled in only when the split path needs it.
    pub duration_secs: Option<f64>,
}

impl FetchedArtifact {
    pub fn new(path: PathBuf, size_bytes: u64) -> Self {
        Self {
            path,
            size_bytes,
            duration_secs: None,
        }
    }
}

/// One segment produced by the splitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 0-based, matches the number in the file name.
    pub index: usize,
    pub path: PathBuf,
}

impl Chunk {
    /// 1-based index for chat messages.
    pub fn display_index(&self) -> usize {
        self.index + 1
    }
}

/// How a file is attached to the chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Document,
    Audio,
}

const AUDIO_EXTENSIONS: [&str; 7] = ["mp3", "m4a", "aac", "opus", "ogg", "flac", "wav"];

impl AttachmentKind {
    pub fn for_path(path: &Path) -> Self {
        let is_audio = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| AUDIO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_audio {
            AttachmentKind::Audio
        } else {
            AttachmentKind::Document
        }
    }
}
