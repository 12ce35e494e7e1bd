//! relaybot configuration loader.
//!
//! TOML file (optional when everything comes from the environment), then
//! environment overrides, then validation.

use relay_queue::FailurePolicy;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub relay: RelayStepConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
    #[serde(default)]
    pub conversations: ConversationsConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeneralConfig {
    /// Assistants API id (`asst_...`) every message is routed to.
    #[serde(default)]
    pub assistant_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysConfig {
    pub openai_api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantConfig {
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_run_timeout_seconds")]
    pub run_timeout_seconds: u64,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_run_timeout_seconds() -> u64 {
    120
}

fn default_request_timeout_seconds() -> u64 {
    60
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            api_base_url: None,
            poll_interval_ms: default_poll_interval_ms(),
            run_timeout_seconds: default_run_timeout_seconds(),
            request_timeout_seconds: default_request_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub whatsapp: WhatsAppConfig,
    #[serde(default)]
    pub webchat: WebChatConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WhatsAppConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub phone_number_id: String,
    /// Token Meta must echo back when subscribing the webhook.
    #[serde(default)]
    pub webhook_verify_token: String,
    /// When set, inbound webhook bodies must carry a valid `x-hub-signature-256`.
    #[serde(default)]
    pub app_secret: Option<String>,
    #[serde(default)]
    pub api_base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebChatConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Listen address; `127.0.0.1:3008` when unset.
    #[serde(default)]
    pub bind_addr: Option<String>,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
    /// Capacity of the channel-to-gateway inbound queue.
    #[serde(default = "default_inbound_buffer")]
    pub inbound_buffer: usize,
    /// How long shutdown waits for running drain loops to finish.
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
}

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3008";

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_http_max_in_flight() -> usize {
    256
}

fn default_inbound_buffer() -> usize {
    1024
}

fn default_shutdown_grace_seconds() -> u64 {
    10
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bind_addr: None,
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
            inbound_buffer: default_inbound_buffer(),
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,
}

fn default_dead_letter_capacity() -> usize {
    100
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            dead_letter_capacity: default_dead_letter_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayStepConfig {
    #[serde(default = "default_typing_indicator")]
    pub typing_indicator: bool,
}

fn default_typing_indicator() -> bool {
    true
}

impl Default for RelayStepConfig {
    fn default() -> Self {
        Self {
            typing_indicator: default_typing_indicator(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandsConfig {
    #[serde(default = "default_search_keyword")]
    pub search_keyword: String,
    /// Titles the search command matches against.
    #[serde(default)]
    pub catalog: Vec<String>,
}

fn default_search_keyword() -> String {
    "search".to_string()
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            search_keyword: default_search_keyword(),
            catalog: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationsConfig {
    /// Conversations idle this long are forgotten; 0 keeps them forever.
    #[serde(default = "default_idle_ttl_seconds")]
    pub idle_ttl_seconds: u64,
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
}

fn default_idle_ttl_seconds() -> u64 {
    6 * 60 * 60
}

fn default_sweep_interval_seconds() -> u64 {
    300
}

impl Default for ConversationsConfig {
    fn default() -> Self {
        Self {
            idle_ttl_seconds: default_idle_ttl_seconds(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
        }
    }
}

impl RelayConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        Ok(Self::load_with_path(path).await?.0)
    }

    /// Loads `path`, or the default location when `None`. A missing default
    /// file is fine (env-only setups); a missing explicit file is an error.
    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let explicit = path.is_some();
        let path = path.unwrap_or_else(default_config_path);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(config_path = %path.display(), "no config file; using defaults and environment");
                String::new()
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        let mut cfg = Self::parse(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok((cfg, path))
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("ASSISTANT_ID") {
            self.general.assistant_id = v.trim().to_string();
        }
        if let Some(v) = var("OPENAI_API_KEY") {
            self.keys.openai_api_key = Some(v);
        }
        if let Some(v) = var("OPENAI_BASE_URL") {
            self.assistant.api_base_url = Some(v);
        }
        if let Some(v) = var("PORT") {
            // A bare PORT means a hosted deployment: listen on every interface.
            let host = self
                .runtime
                .bind_addr
                .as_deref()
                .and_then(|addr| addr.rsplit_once(':'))
                .map(|(host, _)| host.to_string())
                .unwrap_or_else(|| "0.0.0.0".to_string());
            self.runtime.bind_addr = Some(format!("{host}:{}", v.trim()));
        }
        if let Some(v) = var("WHATSAPP_ACCESS_TOKEN") {
            self.channels.whatsapp.access_token = v;
            self.channels.whatsapp.enabled = true;
        }
        if let Some(v) = var("WHATSAPP_PHONE_NUMBER_ID") {
            self.channels.whatsapp.phone_number_id = v;
        }
        if let Some(v) = var("WHATSAPP_VERIFY_TOKEN") {
            self.channels.whatsapp.webhook_verify_token = v;
        }
        if let Some(v) = var("WHATSAPP_APP_SECRET") {
            self.channels.whatsapp.app_secret = Some(v);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.general.assistant_id.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "general.assistant_id is required (or set ASSISTANT_ID)"
            ));
        }
        if self.openai_api_key().is_none() {
            return Err(anyhow::anyhow!(
                "keys.openai_api_key is required (or set OPENAI_API_KEY)"
            ));
        }
        if self.assistant.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("assistant.poll_interval_ms must be > 0"));
        }
        if self.assistant.run_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("assistant.run_timeout_seconds must be > 0"));
        }
        if self.assistant.request_timeout_seconds == 0 {
            return Err(anyhow::anyhow!(
                "assistant.request_timeout_seconds must be > 0"
            ));
        }
        self.bind_addr()?;
        if self.runtime.http_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("runtime.http_timeout_seconds must be > 0"));
        }
        if self.runtime.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("runtime.http_max_in_flight must be > 0"));
        }
        if self.runtime.inbound_buffer == 0 {
            return Err(anyhow::anyhow!("runtime.inbound_buffer must be > 0"));
        }
        let conversations = &self.conversations;
        if conversations.idle_ttl_seconds > 0 && conversations.sweep_interval_seconds == 0 {
            return Err(anyhow::anyhow!(
                "conversations.sweep_interval_seconds must be > 0 when idle_ttl_seconds is set"
            ));
        }
        if self.queue.failure_policy == FailurePolicy::DeadLetter
            && self.queue.dead_letter_capacity == 0
        {
            return Err(anyhow::anyhow!(
                "queue.dead_letter_capacity must be > 0 with failure_policy = \"dead_letter\""
            ));
        }
        let keyword = self.commands.search_keyword.trim();
        if keyword.is_empty() || keyword.contains(char::is_whitespace) {
            return Err(anyhow::anyhow!(
                "commands.search_keyword must be a single non-empty word"
            ));
        }
        let whatsapp = &self.channels.whatsapp;
        if whatsapp.enabled {
            if whatsapp.access_token.trim().is_empty() {
                return Err(anyhow::anyhow!("channels.whatsapp.access_token is required"));
            }
            if whatsapp.phone_number_id.trim().is_empty() {
                return Err(anyhow::anyhow!(
                    "channels.whatsapp.phone_number_id is required"
                ));
            }
            if whatsapp.webhook_verify_token.trim().is_empty() {
                return Err(anyhow::anyhow!(
                    "channels.whatsapp.webhook_verify_token is required"
                ));
            }
        }
        if !whatsapp.enabled && !self.channels.webchat.enabled {
            return Err(anyhow::anyhow!(
                "no channel enabled; enable channels.whatsapp or channels.webchat"
            ));
        }
        Ok(())
    }

    pub fn openai_api_key(&self) -> Option<&str> {
        self.keys
            .openai_api_key
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = self.runtime.bind_addr.as_deref().unwrap_or(DEFAULT_BIND_ADDR);
        addr.trim().parse().map_err(|e| {
            anyhow::anyhow!("runtime.bind_addr {addr:?} is not a socket address: {e}")
        })
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".relaybot").join("config.toml")
}
