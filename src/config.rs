//! Configuration file support for planttexts
//!
//! Reads `planttexts.toml` from the current directory or the nearest parent
//! that has one, then applies environment overrides. Every field has a
//! default, so an empty or missing file yields a working demo setup.

use crate::care::Urgency;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "planttexts.toml";

/// Placeholder key shipped in sample env files; treated as "no key"
pub const PLACEHOLDER_API_KEY: &str = "your-openai-api-key-here";

/// Configuration structure
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub sms: SmsConfig,

    #[serde(default)]
    pub reminders: ReminderConfig,

    #[serde(default)]
    pub admin: AdminConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub pool_size: u32,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("planttexts.db"),
            pool_size: 5,
            busy_timeout_ms: 5000,
        }
    }
}

/// HTTP listener settings
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Threads pulling requests off the shared listener
    pub workers: usize,
    /// Allowed CORS origins; `"*"` allows any
    pub cors_origins: Vec<String>,
    pub api_prefix: String,
}

fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:3000".to_string(),
        "http://localhost:5173".to_string(),
    ]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            workers: 4,
            cors_origins: default_cors_origins(),
            api_prefix: "/api/v1".to_string(),
        }
    }
}

/// OpenAI-compatible chat completions
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            max_tokens: 100,
            temperature: 0.8,
            timeout_secs: 20,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SmsProvider {
    /// Write outbound messages to the SMS log only
    Log,
    Twilio,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SmsConfig {
    pub provider: SmsProvider,
    pub account_sid: Option<String>,
    pub auth_token: Option<String>,
    pub from_number: Option<String>,
    pub default_country_code: String,
    pub snooze_hours: i64,
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            provider: SmsProvider::Log,
            account_sid: None,
            auth_token: None,
            from_number: None,
            default_country_code: "+1".to_string(),
            snooze_hours: 4,
        }
    }
}

/// Reminder worker settings
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ReminderConfig {
    pub tick_secs: u64,
    pub workers: usize,
    pub max_retries: u32,
    pub backoff_base_secs: u64,
    pub min_urgency: Urgency,
    /// Minimum gap between two reminders for the same schedule
    pub repeat_hours: i64,
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            tick_secs: 86_400,
            workers: 2,
            max_retries: 3,
            backoff_base_secs: 60,
            min_urgency: Urgency::Low,
            repeat_hours: 24,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
#[serde(default)]
pub struct AdminConfig {
    pub api_key: Option<String>,
}

/// Error loading an explicit config file
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config: {}", e),
            ConfigError::Parse(e) => write!(f, "Invalid config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl Config {
    /// Load config from the nearest planttexts.toml plus environment.
    /// Falls back to defaults if the file is missing or unreadable.
    pub fn load() -> Self {
        let mut config: Config = Self::find_config_path()
            .and_then(|path| std::fs::read_to_string(path).ok())
            .and_then(|contents| toml::from_str(&contents).ok())
            .unwrap_or_default();
        config.apply_env();
        config
    }

    /// Load an explicit file, reporting read and parse errors
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env();
        Ok(config)
    }

    /// Find planttexts.toml by walking up directory tree
    fn find_config_path() -> Option<PathBuf> {
        let current_dir = std::env::current_dir().ok()?;
        let mut dir = current_dir.as_path();

        loop {
            let config_path = dir.join(CONFIG_FILE);
            if config_path.exists() {
                return Some(config_path);
            }

            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
        None
    }

    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup (the process env in production)
    pub fn apply_env_with<F: Fn(&str) -> Option<String>>(&mut self, lookup: F) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = get("PLANTTEXTS_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(host) = get("PLANTTEXTS_HOST") {
            self.server.host = host;
        }
        if let Some(port) = get("PLANTTEXTS_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Some(key) = get("OPENAI_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Some(model) = get("OPENAI_MODEL") {
            self.llm.model = model;
        }
        if let Some(sid) = get("TWILIO_ACCOUNT_SID") {
            self.sms.account_sid = Some(sid);
        }
        if let Some(token) = get("TWILIO_AUTH_TOKEN") {
            self.sms.auth_token = Some(token);
        }
        if let Some(from) = get("TWILIO_PHONE_NUMBER") {
            self.sms.from_number = Some(from);
        }
        match get("SMS_PROVIDER").map(|p| p.to_lowercase()).as_deref() {
            Some("twilio") => self.sms.provider = SmsProvider::Twilio,
            Some("log") | Some("demo") => self.sms.provider = SmsProvider::Log,
            _ => {}
        }
        if let Some(key) = get("ADMIN_API_KEY") {
            self.admin.api_key = Some(key);
        }
    }

    /// False in demo mode: no key, or the sample placeholder
    pub fn llm_enabled(&self) -> bool {
        match self.llm.api_key.as_deref().map(str::trim) {
            Some(key) => !key.is_empty() && key != PLACEHOLDER_API_KEY,
            None => false,
        }
    }

    pub fn twilio_ready(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        present(&self.sms.account_sid) && present(&self.sms.auth_token) && present(&self.sms.from_number)
    }

    /// Human-readable warnings about risky or incomplete settings
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.cors_origins.iter().any(|o| o == "*") {
            warnings.push("CORS allows any origin (\"*\"); restrict server.cors_origins in production".to_string());
        }
        if self.sms.provider == SmsProvider::Twilio && !self.twilio_ready() {
            warnings.push("SMS provider is twilio but account_sid, auth_token or from_number is missing".to_string());
        }
        match self.admin.api_key.as_deref() {
            Some(key) if key.len() < 32 => {
                warnings.push("Admin API key is shorter than 32 characters".to_string());
            }
            None => warnings.push("No admin API key set; admin endpoints are disabled".to_string()),
            _ => {}
        }
        if !self.llm_enabled() {
            warnings.push("No OpenAI API key; running in demo mode with canned messages".to_string());
        }
        warnings
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.api_prefix, "/api/v1");
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert_eq!(config.llm.max_tokens, 100);
        assert_eq!(config.sms.provider, SmsProvider::Log);
        assert_eq!(config.reminders.max_retries, 3);
        assert_eq!(config.reminders.min_urgency, Urgency::Low);
        assert!(!config.llm_enabled());
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r#"
[server]
port = 9100
cors_origins = ["https://planttexts.app"]

[reminders]
min_urgency = "high"
backoff_base_secs = 5
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.reminders.min_urgency, Urgency::High);
        assert_eq!(config.reminders.backoff_base_secs, 5);
        assert_eq!(config.reminders.workers, 2);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env_with(env(&[
            ("PLANTTEXTS_DB_PATH", "/tmp/plants.db"),
            ("PLANTTEXTS_PORT", "9000"),
            ("OPENAI_API_KEY", "sk-test"),
            ("SMS_PROVIDER", "Twilio"),
            ("ADMIN_API_KEY", "short"),
        ]));
        assert_eq!(config.database.path, PathBuf::from("/tmp/plants.db"));
        assert_eq!(config.server.port, 9000);
        assert!(config.llm_enabled());
        assert_eq!(config.sms.provider, SmsProvider::Twilio);
        assert_eq!(config.admin.api_key.as_deref(), Some("short"));
    }

    #[test]
    fn test_bad_port_env_is_ignored() {
        let mut config = Config::default();
        config.apply_env_with(env(&[("PLANTTEXTS_PORT", "not-a-port")]));
        assert_eq!(config.server.port, 8000);
    }

    #[test]
    fn test_placeholder_key_is_demo_mode() {
        let mut config = Config::default();
        config.llm.api_key = Some(PLACEHOLDER_API_KEY.to_string());
        assert!(!config.llm_enabled());
        config.llm.api_key = Some("   ".to_string());
        assert!(!config.llm_enabled());
    }

    #[test]
    fn test_validate_warnings() {
        let mut config = Config::default();
        config.server.cors_origins = vec!["*".to_string()];
        config.sms.provider = SmsProvider::Twilio;
        config.admin.api_key = Some("too-short".to_string());

        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("CORS")));
        assert!(warnings.iter().any(|w| w.contains("twilio")));
        assert!(warnings.iter().any(|w| w.contains("32 characters")));
    }

    #[test]
    fn test_load_from_reports_parse_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[server\nport = ").unwrap();
        assert!(matches!(Config::load_from(&path), Err(ConfigError::Parse(_))));
    }
}
