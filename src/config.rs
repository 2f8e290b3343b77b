//! Configuration file support for tandem
//!
//! Config is loaded from `~/.tandem/config.toml` (or `$TANDEM_HOME/config.toml`).
//! Environment variables override config file settings.

use crate::provider::ProviderId;
use crate::storage::tandem_dir;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Get the global config instance (loaded once on first access)
pub fn config() -> &'static Config {
    CONFIG.get_or_init(Config::load)
}

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Per-provider credentials and model choices
    pub providers: ProvidersConfig,

    /// Context window overrides
    pub context: ContextConfig,

    /// Compaction tuning
    pub compaction: CompactionConfig,

    /// Conversation/session behavior
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProvidersConfig {
    pub anthropic: ProviderConfig,
    pub openai: ProviderConfig,
    pub gemini: ProviderConfig,
}

impl ProvidersConfig {
    pub fn for_provider(&self, id: ProviderId) -> &ProviderConfig {
        match id {
            ProviderId::Anthropic => &self.anthropic,
            ProviderId::OpenAI => &self.openai,
            ProviderId::Gemini => &self.gemini,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProviderConfig {
    /// API key; the provider's usual environment variable takes precedence
    pub api_key: Option<String>,
    /// Model override
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ContextConfig {
    /// Context window ceiling overrides, keyed by provider name
    /// (e.g. `[context.ceilings] anthropic = 200000`)
    pub ceilings: BTreeMap<String, usize>,
}

impl ContextConfig {
    pub fn ceiling_override(&self, id: ProviderId) -> Option<usize> {
        self.ceilings.get(id.as_str()).copied()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Fraction of the context window at which compaction is suggested
    pub threshold: f32,
    /// Output budget for the summarization call
    pub max_summary_tokens: u32,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            threshold: 0.75,
            max_summary_tokens: 2048,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Persist the conversation every N committed turns
    pub autosave_every: usize,
    /// Output budget for chat replies
    pub max_reply_tokens: u32,
    /// Sampling temperature passed through to backends
    pub temperature: Option<f32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            autosave_every: 10,
            max_reply_tokens: 16384,
            temperature: None,
        }
    }
}

impl Config {
    pub fn path() -> Option<PathBuf> {
        tandem_dir().ok().map(|dir| dir.join("config.toml"))
    }

    pub fn load() -> Self {
        let mut config = Self::path()
            .and_then(|path| std::fs::read_to_string(path).ok())
            .and_then(|raw| match toml::from_str::<Config>(&raw) {
                Ok(parsed) => Some(parsed),
                Err(err) => {
                    crate::logging::warn(&format!("config.toml parse error: {}", err));
                    None
                }
            })
            .unwrap_or_default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(raw) = std::env::var("TANDEM_COMPACTION_THRESHOLD") {
            if let Ok(threshold) = raw.parse::<f32>() {
                self.compaction.threshold = threshold;
            }
        }
        if let Ok(raw) = std::env::var("TANDEM_AUTOSAVE_EVERY") {
            if let Ok(every) = raw.parse::<usize>() {
                self.session.autosave_every = every;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.compaction.threshold, 0.75);
        assert_eq!(config.session.autosave_every, 10);
        assert!(config.providers.anthropic.api_key.is_none());
    }

    #[test]
    fn test_parse_partial_toml() {
        let raw = r#"
            [providers.gemini]
            model = "gemini-2.0-flash"

            [context.ceilings]
            openai = 200000
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(
            config.providers.gemini.model.as_deref(),
            Some("gemini-2.0-flash")
        );
        assert_eq!(
            config.context.ceiling_override(ProviderId::OpenAI),
            Some(200_000)
        );
        assert_eq!(config.context.ceiling_override(ProviderId::Anthropic), None);
        // Untouched sections keep their defaults
        assert_eq!(config.compaction.threshold, 0.75);
    }
}
