/// Vidbot - Main Entry Point
///
/// Telegram bot built with teloxide that downloads media with yt-dlp and
/// delivers it within the upload limit, compressing or splitting with ffmpeg.
mod commands;
mod keyboard;
mod transport;

use std::sync::Arc;
use std::time::Duration;
use anyhow::Context;
use teloxide::prelude::*;
use teloxide::types::CallbackQuery;
use teloxide::utils::command::BotCommands;
use tracing::{error, info, warn};

use vidbot_downloader::{FetchInvoker, FfmpegToolkit, ProcessRunner, ToolRunner};
use vidbot_shared::config::Config;
use vidbot_shared::settings::SettingsStore;
use vidbot_shared::task_queue::TaskQueue;
use commands::{AppState, Command};

/// Finished requests stay visible in /status this long.
const FINISHED_REQUEST_TTL_SECS: i64 = 3600;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vidbot_bot=info".parse()?)
                .add_directive("vidbot_downloader=info".parse()?)
                .add_directive("vidbot_shared=info".parse()?),
        )
        .init();

    info!("=== Vidbot Starting ===");

    let config = Config::from_env().context("invalid configuration")?;
    info!(
        "Upload limit {} MB, split chunks {} MB, {} concurrent requests",
        config.upload_limit_mb, config.split_chunk_limit_mb, config.max_concurrent
    );

    tokio::fs::create_dir_all(&config.download_dir)
        .await
        .with_context(|| format!("failed to create download directory {:?}", config.download_dir))?;

    let settings = SettingsStore::load(&config.settings_path)
        .await
        .with_context(|| format!("failed to load settings from {:?}", config.settings_path))?;

    let runner: Arc<dyn ToolRunner> = Arc::new(ProcessRunner);
    let fetcher = FetchInvoker::new(runner.clone(), config.ytdlp_bin.clone(), config.fetch_timeout);
    let toolkit = FfmpegToolkit::new(
        runner,
        config.ffmpeg_bin.clone(),
        config.ffprobe_bin.clone(),
        config.media_timeout,
    );

    // Uploads of large files need far more than teloxide's default timeouts.
    let client = teloxide::net::default_reqwest_settings()
        .connect_timeout(config.upload_connect_timeout)
        .timeout(config.upload_timeout)
        .build()
        .context("failed to build HTTP client")?;
    let bot = Bot::with_client(config.bot_token.clone(), client);

    let state = Arc::new(AppState {
        queue: TaskQueue::new(config.max_concurrent),
        config,
        settings,
        fetcher,
        toolkit,
    });

    // Explicitly delete any existing webhook before polling
    // (prevents 409 Conflict if a webhook was previously set)
    match bot.delete_webhook().send().await {
        Ok(_) => info!("Webhook cleared (ready for polling)"),
        Err(e) => warn!("Failed to delete webhook: {} (continuing anyway)", e),
    }

    // Sync commands with Telegram (enables autocomplete menu)
    match bot.set_my_commands(Command::bot_commands()).await {
        Ok(_) => info!("Bot commands synced with Telegram"),
        Err(e) => error!("Failed to sync bot commands: {}", e),
    }

    let handler = dptree::entry()
        .branch(
            Update::filter_message()
                .filter_command::<Command>()
                .endpoint({
                    let state = state.clone();
                    move |bot: Bot, msg: Message, cmd: Command| {
                        let state = state.clone();
                        async move { commands::handle_command(bot, msg, cmd, state).await }
                    }
                }),
        )
        .branch(
            Update::filter_message()
                .endpoint({
                    let state = state.clone();
                    move |bot: Bot, msg: Message| {
                        let state = state.clone();
                        async move { commands::handle_message(bot, msg, state).await }
                    }
                }),
        )
        .branch(
            Update::filter_callback_query()
                .endpoint({
                    let state = state.clone();
                    move |bot: Bot, q: CallbackQuery| {
                        let state = state.clone();
                        async move { commands::handle_callback_query(bot, q, state).await }
                    }
                }),
        );

    // Prune finished requests from the tracker
    let cleanup_state = state.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(300)).await;
            let removed = cleanup_state.queue.cleanup_finished(FINISHED_REQUEST_TTL_SECS).await;
            if removed > 0 {
                info!("Pruned {} finished requests", removed);
            }
        }
    });

    info!("Bot initialized, starting dispatcher...");

    Dispatcher::builder(bot, handler)
        .default_handler(|upd| async move {
            warn!("Unhandled update: {:?}", upd.kind);
        })
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    if let Err(e) = state.settings.save().await {
        error!("Failed to save settings on shutdown: {}", e);
    }
    info!("Vidbot stopped.");
    Ok(())
}
