/// Telegram bot command handlers.
///
/// Handles /start, /help, /settings, /set_proxy, /set_cookies, /status,
/// plain links and settings keyboard callbacks.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::CallbackQuery;
use teloxide::utils::command::BotCommands;
use tracing::{error, info, warn};

use vidbot_downloader::{
    normalize, run_request, FetchInvoker, FfmpegToolkit, PipelineLimits, RequestContext,
};
use vidbot_shared::config::Config;
use vidbot_shared::models::{parse_optional_setting, MediaRequest, UserPreferences};
use vidbot_shared::settings::SettingsStore;
use vidbot_shared::task_queue::{RequestStage, TaskQueue};

use crate::keyboard::{decode_toggle, settings_keyboard, settings_summary};
use crate::transport::TelegramSink;

/// Build the per-request working directory path.
/// Structure: <download_dir>/<chat_id>/<request_id>/
pub fn request_dir(base: &Path, chat_id: i64, request_id: &str) -> PathBuf {
    base.join(chat_id.to_string()).join(request_id)
}

/// Bot command definitions.
#[derive(BotCommands, Clone, Debug, PartialEq)]
#[command(rename_rule = "snake_case", description = "Vidbot commands:")]
pub enum Command {
    #[command(description = "Start the bot")]
    Start,
    #[command(description = "Show help")]
    Help,
    #[command(description = "Show and toggle your settings")]
    Settings,
    #[command(description = "Set a proxy URL for downloads (or 'none')")]
    SetProxy(String),
    #[command(description = "Use cookies from a browser (or 'none')")]
    SetCookies(String),
    #[command(description = "Show queue status")]
    Status,
}

/// Shared application state passed to handlers.
pub struct AppState {
    pub config: Config,
    pub settings: SettingsStore,
    pub queue: TaskQueue,
    pub fetcher: FetchInvoker,
    pub toolkit: FfmpegToolkit,
}

impl AppState {
    fn limits(&self) -> PipelineLimits {
        PipelineLimits::from_config(&self.config)
    }
}

/// Settings are keyed by the sender; channel posts without a sender fall back to the chat.
fn user_key(msg: &Message) -> String {
    msg.from()
        .map(|u| u.id.0.to_string())
        .unwrap_or_else(|| msg.chat.id.0.to_string())
}

fn short_id(request_id: &str) -> &str {
    request_id.get(..8).unwrap_or(request_id)
}

/// Handle incoming commands.
pub async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    match cmd {
        Command::Start | Command::Help => cmd_help(bot, msg, state).await,
        Command::Settings => cmd_settings(bot, msg, state).await,
        Command::SetProxy(arg) => cmd_set_proxy(bot, msg, arg, state).await,
        Command::SetCookies(arg) => cmd_set_cookies(bot, msg, arg, state).await,
        Command::Status => cmd_status(bot, msg, state).await,
    }
}

/// /start, /help - Welcome message
async fn cmd_help(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let text = format!(
        "Send me a link and I'll download it with yt-dlp and send the file back.\n\n\
         Files over {} MB are compressed or split into parts, depending on /settings.\n\n\
         {}",
        state.config.upload_limit_mb,
        Command::descriptions()
    );
    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}

/// /settings - Show the toggle keyboard
async fn cmd_settings(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let prefs = match state.settings.get(&user_key(&msg)).await {
        Ok(p) => p,
        Err(e) => {
            error!("Failed to load settings for chat {}: {}", msg.chat.id, e);
            bot.send_message(msg.chat.id, "Could not load your settings. Please try again later.")
                .await?;
            return Ok(());
        }
    };
    bot.send_message(msg.chat.id, settings_summary(&prefs))
        .reply_markup(settings_keyboard(&prefs))
        .await?;
    Ok(())
}

/// /set_proxy <url|none>
async fn cmd_set_proxy(
    bot: Bot,
    msg: Message,
    arg: String,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    let value = parse_optional_setting(&arg);
    let reply = match &value {
        Some(v) => format!("Proxy set to {}", v),
        None => "Proxy cleared.".to_string(),
    };
    update_and_reply(bot, msg, state, reply, move |p| p.proxy_url = value).await
}

/// /set_cookies <browser|none>
async fn cmd_set_cookies(
    bot: Bot,
    msg: Message,
    arg: String,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    let value = parse_optional_setting(&arg);
    let reply = match &value {
        Some(v) => format!("Cookies will be read from {}", v),
        None => "Browser cookies disabled.".to_string(),
    };
    update_and_reply(bot, msg, state, reply, move |p| p.cookies_browser = value).await
}

async fn update_and_reply<F>(
    bot: Bot,
    msg: Message,
    state: Arc<AppState>,
    reply: String,
    mutation: F,
) -> ResponseResult<()>
where
    F: FnOnce(&mut UserPreferences),
{
    match state.settings.update(&user_key(&msg), mutation).await {
        Ok(_) => {
            bot.send_message(msg.chat.id, reply).await?;
        }
        Err(e) => {
            error!("Failed to save settings for chat {}: {}", msg.chat.id, e);
            bot.send_message(msg.chat.id, "Could not save your settings. Please try again later.")
                .await?;
        }
    }
    Ok(())
}

/// /status - Queue slots and this chat's requests
async fn cmd_status(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let stats = state.queue.stats().await;
    let active = state.queue.active_for_chat(msg.chat.id.0).await;

    let mut text = format!(
        "Queue Status:\n\
         Running: {}/{}\n\
         Queued: {}\n\
         Completed: {}\n\
         Failed: {}\n",
        stats.running, stats.max_concurrent, stats.queued, stats.done, stats.failed,
    );

    if active.is_empty() {
        text.push_str("\nNo active requests.");
    } else {
        text.push_str("\nYour requests:\n");
        let now = chrono::Utc::now();
        for req in active.iter().take(10) {
            let elapsed = match req.running_secs(now) {
                Some(secs) => format!(" ({}m{:02}s)", secs / 60, secs % 60),
                None => String::new(),
            };
            text.push_str(&format!(
                "  {} {}{} {}\n",
                short_id(&req.request_id),
                req.stage.as_str(),
                elapsed,
                req.url
            ));
        }
    }

    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}

/// Handle plain text: anything that normalizes to a link starts a request.
pub async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let text = match msg.text() {
        Some(t) => t.trim().to_string(),
        None => return Ok(()),
    };

    if text.starts_with('/') {
        bot.send_message(msg.chat.id, "Unknown command. See /help.").await?;
        return Ok(());
    }

    let request = match normalize(&text) {
        Ok(r) => r,
        Err(e) => {
            info!("Ignoring non-link message in chat {}: {}", msg.chat.id, e);
            bot.send_message(msg.chat.id, format!("{}\nPlease send an http(s) link.", e))
                .await?;
            return Ok(());
        }
    };

    let prefs = match state.settings.get(&user_key(&msg)).await {
        Ok(p) => p,
        Err(e) => {
            error!("Failed to load settings for chat {}: {}", msg.chat.id, e);
            bot.send_message(msg.chat.id, "Could not load your settings. Please try again later.")
                .await?;
            return Ok(());
        }
    };

    let chat_id = msg.chat.id;
    let request_id = state.queue.enqueue(chat_id.0, &request.normalized_url).await;
    bot.send_message(
        chat_id,
        format!("Queued [{}]\n{}", short_id(&request_id), request.normalized_url),
    )
    .await?;

    // Run in the background so the handler returns immediately.
    tokio::spawn(async move {
        process_request(bot, chat_id, request, prefs, request_id, state).await;
    });

    Ok(())
}

/// Wait for a slot, then run the request to completion.
async fn process_request(
    bot: Bot,
    chat_id: ChatId,
    request: MediaRequest,
    prefs: UserPreferences,
    request_id: String,
    state: Arc<AppState>,
) {
    let _slot = match state.queue.acquire(&request_id).await {
        Some(slot) => slot,
        None => {
            state.queue.set_stage(&request_id, RequestStage::Failed).await;
            return;
        }
    };

    let dir = request_dir(&state.config.download_dir, chat_id.0, &request_id);
    let sink = TelegramSink::new(bot, chat_id);
    let ctx = RequestContext {
        fetcher: &state.fetcher,
        tools: &state.toolkit,
        sink: &sink,
        limits: state.limits(),
        queue: &state.queue,
    };
    run_request(&ctx, &request_id, &request, &prefs, &dir).await;
}

/// Handle callback query from a settings keyboard button.
pub async fn handle_callback_query(
    bot: Bot,
    q: CallbackQuery,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    let toggle = match q.data.as_deref().and_then(decode_toggle) {
        Some(t) => t,
        None => {
            warn!("Unknown callback data: {:?}", q.data);
            let _ = bot.answer_callback_query(&q.id).await;
            return Ok(());
        }
    };

    let user_id = q.from.id.0.to_string();
    let prefs = match state.settings.toggle(&user_id, toggle).await {
        Ok(p) => p,
        Err(e) => {
            error!("Failed to toggle {} for user {}: {}", toggle.key(), user_id, e);
            let _ = bot
                .answer_callback_query(&q.id)
                .text("Could not save your settings.")
                .await;
            return Ok(());
        }
    };

    let state_text = if prefs.is_enabled(toggle) { "on" } else { "off" };
    let _ = bot
        .answer_callback_query(&q.id)
        .text(format!("{}: {}", toggle.label(), state_text))
        .await;

    if let Some(ref m) = q.message {
        let _ = bot
            .edit_message_text(m.chat.id, m.id, settings_summary(&prefs))
            .reply_markup(settings_keyboard(&prefs))
            .await;
    }
    Ok(())
}
