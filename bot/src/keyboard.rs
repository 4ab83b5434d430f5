/// Inline keyboard for `/settings`.
///
/// Every boolean preference gets one button. Pressing it sends callback data
/// `tg:<key>`, the handler flips that preference and re-renders the keyboard.
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};

use vidbot_shared::models::{PreferenceToggle, UserPreferences};

const TOGGLE_PREFIX: &str = "tg";

/// Encode callback data for a toggle button. Format: "tg:key" e.g. "tg:compress"
pub fn encode_toggle(toggle: PreferenceToggle) -> String {
    format!("{}:{}", TOGGLE_PREFIX, toggle.key())
}

pub fn decode_toggle(data: &str) -> Option<PreferenceToggle> {
    let (prefix, key) = data.split_once(':')?;
    if prefix != TOGGLE_PREFIX {
        return None;
    }
    PreferenceToggle::from_key(key)
}

fn mark(enabled: bool) -> &'static str {
    if enabled {
        "✅"
    } else {
        "❌"
    }
}

pub fn settings_keyboard(prefs: &UserPreferences) -> InlineKeyboardMarkup {
    let rows: Vec<Vec<InlineKeyboardButton>> = PreferenceToggle::ALL
        .iter()
        .map(|toggle| {
            vec![InlineKeyboardButton::callback(
                format!("{} {}", mark(prefs.is_enabled(*toggle)), toggle.label()),
                encode_toggle(*toggle),
            )]
        })
        .collect();
    InlineKeyboardMarkup::new(rows)
}

/// Text shown above the keyboard, including the free-form settings.
pub fn settings_summary(prefs: &UserPreferences) -> String {
    format!(
        "Your settings\n\n\
         Proxy: {}\n\
         Cookies from browser: {}\n\n\
         Tap a button to toggle. Use /set_proxy and /set_cookies to change the rest.",
        prefs.proxy_url.as_deref().unwrap_or("none"),
        prefs.cookies_browser.as_deref().unwrap_or("none"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use teloxide::types::InlineKeyboardButtonKind;

    #[test]
    fn test_encode_decode_every_toggle() {
        for toggle in PreferenceToggle::ALL {
            assert_eq!(decode_toggle(&encode_toggle(toggle)), Some(toggle));
        }
        assert_eq!(encode_toggle(PreferenceToggle::AudioOnly), "tg:audio_only");
    }

    #[test]
    fn test_decode_rejects_foreign_data() {
        assert_eq!(decode_toggle("tg:nope"), None);
        assert_eq!(decode_toggle("dv:compress"), None);
        assert_eq!(decode_toggle("compress"), None);
        assert_eq!(decode_toggle(""), None);
    }

    #[test]
    fn test_keyboard_reflects_state() {
        let prefs = UserPreferences {
            compress_video: true,
            ..Default::default()
        };
        let markup = settings_keyboard(&prefs);
        assert_eq!(markup.inline_keyboard.len(), PreferenceToggle::ALL.len());

        let button = |toggle: PreferenceToggle| {
            markup
                .inline_keyboard
                .iter()
                .flatten()
                .find(|b| matches!(&b.kind, InlineKeyboardButtonKind::CallbackData(d) if *d == encode_toggle(toggle)))
                .map(|b| b.text.clone())
                .unwrap()
        };
        assert_eq!(button(PreferenceToggle::CompressVideo), "✅ Compress large videos");
        assert_eq!(button(PreferenceToggle::SplitLargeFiles), "✅ Split large files");
        assert_eq!(button(PreferenceToggle::AudioOnly), "❌ Audio only");
    }

    #[test]
    fn test_summary_shows_free_form_settings() {
        let prefs = UserPreferences {
            proxy_url: Some("socks5://127.0.0.1:9050".into()),
            ..Default::default()
        };
        let text = settings_summary(&prefs);
        assert!(text.contains("Proxy: socks5://127.0.0.1:9050"));
        assert!(text.contains("Cookies from browser: none"));
    }
}
