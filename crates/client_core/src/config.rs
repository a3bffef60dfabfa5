use std::{collections::HashMap, fs, time::Duration};

/// Client settings with built-in defaults, overridable by `client.toml`
/// and then by environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Base http(s) URL of the backend; the push channel URL is derived
    /// from it (`http` -> `ws`, `https` -> `wss`).
    pub server_url: String,
    /// Sent as `Accept-Language` on history fetches.
    pub language: String,
    pub handshake_timeout: Duration,
    pub reconnect_max_attempts: u32,
    pub reconnect_initial_delay: Duration,
    pub history_page_size: u32,
    /// Fallbacks used until the AI config service has been consulted.
    pub ai_max_prompt_chars: usize,
    pub ai_cost_per_message: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            language: "en".into(),
            handshake_timeout: Duration::from_secs(20),
            reconnect_max_attempts: 5,
            reconnect_initial_delay: Duration::from_secs(1),
            history_page_size: 20,
            ai_max_prompt_chars: 4000,
            ai_cost_per_message: 1,
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("client.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("server_url") {
                settings.server_url = v.clone();
            }
            if let Some(v) = file_cfg.get("language") {
                settings.language = v.clone();
            }
            if let Some(v) = file_cfg.get("history_page_size") {
                if let Ok(parsed) = v.parse::<u32>() {
                    settings.history_page_size = parsed;
                }
            }
        }
    }

    if let Ok(v) = std::env::var("CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    if let Ok(v) = std::env::var("CHAT_LANGUAGE") {
        settings.language = v;
    }
    if let Ok(v) = std::env::var("CHAT_HANDSHAKE_TIMEOUT_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.handshake_timeout = Duration::from_secs(parsed);
        }
    }
    if let Ok(v) = std::env::var("CHAT_RECONNECT_MAX_ATTEMPTS") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.reconnect_max_attempts = parsed;
        }
    }
    if let Ok(v) = std::env::var("CHAT_HISTORY_PAGE_SIZE") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.history_page_size = parsed;
        }
    }

    settings
}
