use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable that overrides `upstream.api_key` at startup.
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub chat: ChatConfig,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub errors: ErrorsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default)]
    pub allow_lan_access: bool,

    #[serde(default = "default_body_limit_mb")]
    pub body_limit_mb: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            allow_lan_access: false,
            body_limit_mb: default_body_limit_mb(),
        }
    }
}

impl ServerConfig {
    pub fn get_bind_address(&self) -> &str {
        if self.allow_lan_access {
            "0.0.0.0"
        } else {
            &self.host
        }
    }

    /// Address a local client should use to reach the server.
    pub fn get_connect_address(&self) -> &str {
        match self.get_bind_address() {
            "0.0.0.0" => "127.0.0.1",
            "::" => "::1",
            host => host,
        }
    }
}

/// Generative Language API endpoint version.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApiVersion {
    V1,
    #[default]
    V1beta,
}

impl ApiVersion {
    pub fn path_segment(self) -> &'static str {
        match self {
            Self::V1 => "v1",
            Self::V1beta => "v1beta",
        }
    }

    /// Whether the version accepts a top-level `systemInstruction` field.
    pub fn supports_system_instruction(self) -> bool {
        matches!(self, Self::V1beta)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub api_version: ApiVersion,

    #[serde(default)]
    pub api_key: String,

    /// Explicit model tried before the fallbacks.
    #[serde(default)]
    pub model: Option<String>,

    #[serde(default = "default_fallback_models")]
    pub fallback_models: Vec<String>,

    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_version: ApiVersion::default(),
            api_key: String::new(),
            model: None,
            fallback_models: default_fallback_models(),
            attempt_timeout_secs: default_attempt_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// Where the persona prompt goes in the outgoing request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SystemPlacement {
    /// Dedicated field when the API version supports one, primed turns otherwise.
    #[default]
    Auto,
    Dedicated,
    PrimedTurns,
}

impl SystemPlacement {
    pub fn resolve(self, version: ApiVersion) -> SystemPlacement {
        match self {
            Self::Auto if version.supports_system_instruction() => Self::Dedicated,
            Self::Auto => Self::PrimedTurns,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    #[serde(default)]
    pub system_placement: SystemPlacement,

    #[serde(default = "default_primer_ack")]
    pub primer_ack: String,

    #[serde(default = "default_history_window")]
    pub history_window: usize,

    #[serde(default = "default_image_prompt")]
    pub default_image_prompt: String,

    #[serde(default = "default_greeting")]
    pub default_greeting: String,

    #[serde(default = "default_safety_reply")]
    pub safety_reply: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            system_placement: SystemPlacement::default(),
            primer_ack: default_primer_ack(),
            history_window: default_history_window(),
            default_image_prompt: default_image_prompt(),
            default_greeting: default_greeting(),
            safety_reply: default_safety_reply(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationConfig {
    #[serde(default = "default_temperature")]
    pub temperature: Option<f64>,

    #[serde(default = "default_top_p")]
    pub top_p: Option<f64>,

    #[serde(default = "default_top_k")]
    pub top_k: Option<u32>,

    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: Option<u32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

impl GenerationConfig {
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none()
            && self.top_p.is_none()
            && self.top_k.is_none()
            && self.max_output_tokens.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorsConfig {
    /// Attach the last upstream error message to 500 responses.
    #[serde(default = "default_true")]
    pub expose_details: bool,
}

impl Default for ErrorsConfig {
    fn default() -> Self {
        Self { expose_details: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default value functions
fn default_port() -> u16 { 3000 }
fn default_host() -> String { "127.0.0.1".to_string() }
fn default_body_limit_mb() -> usize { 50 }
fn default_base_url() -> String { "https://generativelanguage.googleapis.com".to_string() }
fn default_attempt_timeout() -> u64 { 60 }
fn default_connect_timeout() -> u64 { 20 }
fn default_history_window() -> usize { 4 }
fn default_temperature() -> Option<f64> { Some(0.4) }
fn default_top_p() -> Option<f64> { Some(0.8) }
fn default_top_k() -> Option<u32> { Some(40) }
fn default_max_output_tokens() -> Option<u32> { Some(1024) }
fn default_true() -> bool { true }
fn default_log_level() -> String { "info".to_string() }

fn default_fallback_models() -> Vec<String> {
    vec![
        "gemini-2.5-flash".to_string(),
        "gemini-2.0-flash".to_string(),
        "gemini-1.5-flash".to_string(),
    ]
}

fn default_system_prompt() -> String {
    "Você é o Nutrik.IA, um assistente nutricional amigável, ágil e técnico. \
     Identifique os alimentos em fotos, estime as gramas de cada item e informe os \
     macronutrientes (proteínas, carboidratos, gorduras e calorias) usando <strong> \
     para destacar os números. Se o usuário informar peso, altura, idade e objetivo, \
     calcule a taxa metabólica basal e a faixa calórica diária ideal. \
     Responda como uma conversa natural."
        .to_string()
}

fn default_primer_ack() -> String {
    "Entendido. Sou o Nutrik.IA e estou pronto para analisar sua alimentação com precisão técnica."
        .to_string()
}

fn default_image_prompt() -> String {
    "Analise esta refeição detalhadamente, dando gramas estimadas de cada item e o total de \
     macronutrientes (proteína, carboidrato, gordura) e calorias."
        .to_string()
}

fn default_greeting() -> String { "Olá!".to_string() }

fn default_safety_reply() -> String {
    "Desculpe, não posso responder a essa mensagem. Tente reformular sua pergunta.".to_string()
}

/// Get default config file path
/// Uses ~/.config/nutrik/config.toml for Unix-like CLI experience
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("nutrik")
        .join("config.toml")
}

/// Load config from file, or return defaults if not found. Also returns the
/// file the config came from (`None` when defaults were used).
///
/// Loading order:
/// 1. Specified path (if provided)
/// 2. ./config.toml (if exists)
/// 3. default_config_path() (usually ~/.config/nutrik/config.toml)
pub fn load_config_with_source(path: Option<PathBuf>) -> anyhow::Result<(Config, Option<PathBuf>)> {
    if let Some(config_path) = path {
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Config = toml::from_str(&content)?;
            tracing::info!("Loaded config from specified path {:?}", config_path);
            return Ok((config, Some(config_path)));
        } else {
            anyhow::bail!("Specified config file not found: {:?}", config_path);
        }
    }

    let local_config = PathBuf::from("config.toml");
    if local_config.exists() {
        match std::fs::read_to_string(&local_config) {
            Ok(content) => match toml::from_str::<Config>(&content) {
                Ok(config) => {
                    tracing::info!("Loaded config from current directory {:?}", local_config);
                    return Ok((config, Some(local_config)));
                }
                Err(e) => {
                    tracing::error!("Failed to parse ./config.toml: {}. Falling back to default path.", e);
                }
            },
            Err(e) => {
                tracing::error!("Failed to read ./config.toml: {}. Falling back to default path.", e);
            }
        }
    }

    let default_path = default_config_path();
    if default_path.exists() {
        let content = std::fs::read_to_string(&default_path)?;
        let config: Config = toml::from_str(&content)?;
        tracing::info!("Loaded config from default path {:?}", default_path);
        Ok((config, Some(default_path)))
    } else {
        tracing::info!("No config file found, using defaults");
        Ok((Config::default(), None))
    }
}

impl Config {
    /// Apply startup-only environment overrides. Called once by the binary;
    /// the request path never reads the environment.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.trim().is_empty() {
                self.upstream.api_key = key.trim().to_string();
            }
        }
    }
}
