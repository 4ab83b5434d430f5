/// Per-user preference storage backed by a single JSON document.
///
/// The whole document is read once at startup and rewritten after every
/// mutation. All writes go through one lock, so concurrent updates cannot
/// lose each other when the document is persisted.
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::SettingsError;
use crate::models::{PreferenceToggle, UserPreferences};

pub struct SettingsStore {
    path: PathBuf,
    users: Mutex<HashMap<String, UserPreferences>>,
}

impl SettingsStore {
    /// Load the document at `path`. A missing or empty file yields an empty store.
    ///
    /// Records written by an older version get the missing keys filled with
    /// defaults, and the upgraded document is written back before returning.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No settings document at {:?}, starting empty", path);
                String::new()
            }
            Err(source) => return Err(SettingsError::Io { path, source }),
        };

        let mut users = HashMap::new();
        let mut backfilled = 0usize;

        if !raw.trim().is_empty() {
            let document: HashMap<String, serde_json::Value> = serde_json::from_str(&raw)?;
            for (user_id, value) in document {
                let mut complete = value
                    .as_object()
                    .map(|obj| UserPreferences::KEYS.iter().all(|k| obj.contains_key(*k)))
                    .unwrap_or(false);
                let mut prefs = match serde_json::from_value::<UserPreferences>(value) {
                    Ok(prefs) => prefs,
                    Err(e) => {
                        warn!("Unreadable preferences for user {}, resetting: {}", user_id, e);
                        complete = false;
                        UserPreferences::default()
                    }
                };
                if prefs.repair() {
                    warn!("Preferences for user {} had audio_only without download_audio, fixed", user_id);
                    complete = false;
                }
                if !complete {
                    backfilled += 1;
                }
                users.insert(user_id, prefs);
            }
        }

        if backfilled > 0 {
            info!("Backfilled missing preference keys for {} user(s)", backfilled);
            write_document(&path, &users).await?;
        }

        info!("Loaded settings for {} user(s) from {:?}", users.len(), path);
        Ok(Self {
            path,
            users: Mutex::new(users),
        })
    }

    /// Preferences for `user_id`, creating and persisting defaults on first contact.
    pub async fn get(&self, user_id: &str) -> Result<UserPreferences, SettingsError> {
        let mut users = self.users.lock().await;
        if let Some(prefs) = users.get(user_id) {
            return Ok(prefs.clone());
        }
        debug!("Creating default preferences for user {}", user_id);
        let prefs = UserPreferences::default();
        users.insert(user_id.to_string(), prefs.clone());
        write_document(&self.path, &users).await?;
        Ok(prefs)
    }

    /// Apply `mutation` to the user's record and persist the document.
    pub async fn update<F>(&self, user_id: &str, mutation: F) -> Result<UserPreferences, SettingsError>
    where
        F: FnOnce(&mut UserPreferences),
    {
        let mut users = self.users.lock().await;
        let prefs = users.entry(user_id.to_string()).or_default();
        mutation(prefs);
        let updated = prefs.clone();
        write_document(&self.path, &users).await?;
        Ok(updated)
    }

    pub async fn toggle(
        &self,
        user_id: &str,
        toggle: PreferenceToggle,
    ) -> Result<UserPreferences, SettingsError> {
        self.update(user_id, |prefs| prefs.toggle(toggle)).await
    }

    /// Rewrite the document from memory.
    pub async fn save(&self) -> Result<(), SettingsError> {
        let users = self.users.lock().await;
        write_document(&self.path, &users).await
    }
}

/// Write to a sibling temp file and rename it over the document.
async fn write_document(
    path: &Path,
    users: &HashMap<String, UserPreferences>,
) -> Result<(), SettingsError> {
    let sorted: BTreeMap<&String, &UserPreferences> = users.iter().collect();
    let json = serde_json::to_string_pretty(&sorted)?;

    let io_err = |source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, json).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
    Ok(())
}
