use std::env;
use std::time::Duration;

pub const SOURCE_STEP_NAME: &str = "FindDocs";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: String,
    pub api_base_url: String,
    pub source_step_name: String,
    pub request_timeout_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env::var("STREAMCHAT_BIND")
                .unwrap_or_else(|_| "127.0.0.1:3000".to_string()),
            api_base_url: env::var("CHAT_API_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string()),
            source_step_name: SOURCE_STEP_NAME.to_string(),
            request_timeout_secs: env::var("CHAT_REQUEST_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stream_log_url(&self) -> String {
        format!("{}/chat/stream_log", self.api_base_url)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            api_base_url: "http://127.0.0.1:8080".to_string(),
            source_step_name: SOURCE_STEP_NAME.to_string(),
            request_timeout_secs: 60,
        }
    }
}
