use std::{collections::HashMap, fs, time::Duration};

use anyhow::{anyhow, Result};
use url::Url;

pub const DEFAULT_STUN_URLS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub server_url: String,
    pub api_key: String,
    pub storage_bucket: String,
    pub stun_urls: Vec<String>,
    pub heartbeat_interval: Duration,
    pub typing_expiry: Duration,
    pub profile_search_limit: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:54321".into(),
            api_key: String::new(),
            storage_bucket: "chat-files".into(),
            stun_urls: DEFAULT_STUN_URLS.iter().map(|s| s.to_string()).collect(),
            heartbeat_interval: Duration::from_secs(30),
            typing_expiry: Duration::from_secs(3),
            profile_search_limit: 10,
        }
    }
}

impl ClientSettings {
    pub fn from_sources(
        file_contents: Option<&str>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let mut settings = Self::default();

        if let Some(raw) = file_contents {
            if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(raw) {
                settings.apply(|key| file_cfg.get(key).cloned());
            }
        }

        settings.apply(|key| env(&format!("APP__{}", key.to_ascii_uppercase())));
        settings
    }

    fn apply(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("server_url") {
            self.server_url = v;
        }
        if let Some(v) = lookup("api_key") {
            self.api_key = v;
        }
        if let Some(v) = lookup("storage_bucket") {
            self.storage_bucket = v;
        }
        if let Some(v) = lookup("stun_urls") {
            let urls: Vec<String> = v
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect();
            if !urls.is_empty() {
                self.stun_urls = urls;
            }
        }
        if let Some(Ok(secs)) = lookup("heartbeat_seconds").map(|v| v.parse::<u64>()) {
            self.heartbeat_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(Ok(millis)) = lookup("typing_expiry_ms").map(|v| v.parse::<u64>()) {
            self.typing_expiry = Duration::from_millis(millis);
        }
    }

    pub fn realtime_url(&self) -> Result<Url> {
        let ws_base = if let Some(rest) = self.server_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.server_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(anyhow!("server_url must start with http:// or https://"));
        };
        let mut url = Url::parse(&format!(
            "{}/realtime/v1/websocket",
            ws_base.trim_end_matches('/')
        ))?;
        url.query_pairs_mut()
            .append_pair("apikey", &self.api_key)
            .append_pair("vsn", "1.0.0");
        Ok(url)
    }
}

pub fn load_settings() -> ClientSettings {
    let file_contents = fs::read_to_string("client.toml").ok();
    ClientSettings::from_sources(file_contents.as_deref(), |key| std::env::var(key).ok())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
