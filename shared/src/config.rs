/// Runtime configuration read from the environment.
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::ConfigError;

pub const MB_IN_BYTES: u64 = 1024 * 1024;

/// Bot configuration. Every field except the token has a default.
#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub upload_limit_mb: u64,
    pub split_chunk_limit_mb: u64,
    pub download_dir: PathBuf,
    pub settings_path: PathBuf,
    pub ytdlp_bin: String,
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
    pub fetch_timeout: Duration,
    pub media_timeout: Duration,
    pub upload_connect_timeout: Duration,
    pub upload_timeout: Duration,
    pub max_concurrent: usize,
}

impl Config {
    /// Read configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bot_token = lookup("TELOXIDE_TOKEN")
            .or_else(|| lookup("BOT_TOKEN"))
            .filter(|t| !t.trim().is_empty())
            .ok_or(ConfigError::Missing("TELOXIDE_TOKEN"))?;

        let upload_limit_mb = number(&lookup, "UPLOAD_LIMIT_MB", 50)?;
        let split_chunk_limit_mb = number(&lookup, "SPLIT_CHUNK_LIMIT_MB", 40)?;
        if upload_limit_mb == 0 {
            return Err(ConfigError::Zero("UPLOAD_LIMIT_MB"));
        }
        if split_chunk_limit_mb == 0 {
            return Err(ConfigError::Zero("SPLIT_CHUNK_LIMIT_MB"));
        }
        if split_chunk_limit_mb > upload_limit_mb {
            return Err(ConfigError::ChunkAboveUploadLimit {
                split_mb: split_chunk_limit_mb,
                upload_mb: upload_limit_mb,
            });
        }

        let max_concurrent = number(&lookup, "MAX_CONCURRENT_TASKS", 3)? as usize;
        if max_concurrent == 0 {
            return Err(ConfigError::Zero("MAX_CONCURRENT_TASKS"));
        }

        Ok(Self {
            bot_token,
            upload_limit_mb,
            split_chunk_limit_mb,
            download_dir: PathBuf::from(
                lookup("DOWNLOAD_DIR").unwrap_or_else(|| "./downloads".to_string()),
            ),
            settings_path: PathBuf::from(
                lookup("SETTINGS_PATH").unwrap_or_else(|| "./user_settings.json".to_string()),
            ),
            ytdlp_bin: lookup("YTDLP_BIN").unwrap_or_else(|| "yt-dlp".to_string()),
            ffmpeg_bin: lookup("FFMPEG_BIN").unwrap_or_else(|| "ffmpeg".to_string()),
            ffprobe_bin: lookup("FFPROBE_BIN").unwrap_or_else(|| "ffprobe".to_string()),
            fetch_timeout: Duration::from_secs(number(&lookup, "FETCH_TIMEOUT_SECS", 600)?),
            media_timeout: Duration::from_secs(number(&lookup, "MEDIA_TIMEOUT_SECS", 1800)?),
            upload_connect_timeout: Duration::from_secs(number(
                &lookup,
                "UPLOAD_CONNECT_TIMEOUT_SECS",
                30,
            )?),
            upload_timeout: Duration::from_secs(number(&lookup, "UPLOAD_TIMEOUT_SECS", 300)?),
            max_concurrent,
        })
    }

    pub fn upload_limit_bytes(&self) -> u64 {
        self.upload_limit_mb * MB_IN_BYTES
    }

    pub fn split_chunk_limit_bytes(&self) -> u64 {
        self.split_chunk_limit_mb * MB_IN_BYTES
    }
}

fn number<F>(lookup: &F, key: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidNumber {
            key,
            value: value.clone(),
        }),
        None => Ok(default),
    }
}
