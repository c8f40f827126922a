//! Configuration for the voice core, loaded once at process startup from
//! environment variables.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{CoreError, Result};

/// `serde` has no built-in `Duration` representation; durations round-trip
/// through configuration as plain milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        (value.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Top-level configuration for the voice core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP/WebSocket bind address and port.
    pub server: ServerConfig,
    /// STT/LLM/TTS provider settings.
    pub provider: ProviderConfig,
    /// Turn controller timing and thresholds.
    pub turn: TurnConfig,
    /// Opener-phrase cache settings.
    pub opener_cache: OpenerCacheConfig,
    /// External scope-lookup collaborator.
    pub scope: ScopeConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            provider: ProviderConfig::default(),
            turn: TurnConfig::default(),
            opener_cache: OpenerCacheConfig::default(),
            scope: ScopeConfig::default(),
        }
    }
}

impl AppConfig {
    /// Build configuration from environment variables, failing fast on a
    /// missing provider API key rather than surfacing it on first call.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("GARSON_BIND_ADDR") {
            config.server.bind_addr = addr;
        }

        config.provider.api_key = std::env::var("GARSON_PROVIDER_API_KEY").map_err(|_| {
            CoreError::Config("GARSON_PROVIDER_API_KEY is required but not set".into())
        })?;

        if let Ok(url) = std::env::var("GARSON_PROVIDER_BASE_URL") {
            config.provider.base_url = url;
        }
        if let Ok(model) = std::env::var("GARSON_LLM_MODEL") {
            config.provider.llm_model = model;
        }
        if let Ok(voice) = std::env::var("GARSON_TTS_VOICE") {
            config.provider.tts_voice = voice;
        }
        if let Ok(dir) = std::env::var("GARSON_OPENER_CACHE_DIR") {
            config.opener_cache.dir = PathBuf::from(dir);
        }
        if let Ok(url) = std::env::var("GARSON_SCOPE_BASE_URL") {
            config.scope.base_url = url;
        }

        Ok(config)
    }
}

/// HTTP/WebSocket listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the axum listener binds to, e.g. "0.0.0.0:8080".
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_owned(),
        }
    }
}

/// Inference provider configuration shared by the STT, LLM, and TTS clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Base URL for the OpenAI-compatible / provider HTTP API.
    pub base_url: String,
    /// API key sent as a bearer token on every request.
    pub api_key: String,
    /// Chat completion model id.
    pub llm_model: String,
    /// Sampling temperature for the LLM.
    pub llm_temperature: f32,
    /// Maximum tokens the LLM may generate for one turn.
    pub llm_max_tokens: u32,
    /// TTS voice id.
    pub tts_voice: String,
    /// TTS speaking rate multiplier.
    pub tts_speed: f32,
    /// Per-request timeout.
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,
    /// Maximum retries for a retryable provider failure.
    pub max_retries: u32,
    /// Base backoff delay before the first retry.
    #[serde(with = "duration_millis")]
    pub retry_base_delay: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_owned(),
            api_key: String::new(),
            llm_model: "gpt-4o-mini".to_owned(),
            llm_temperature: 0.4,
            llm_max_tokens: 400,
            tts_voice: "alloy".to_owned(),
            tts_speed: 1.0,
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(1500),
        }
    }
}

/// Turn controller timing and decision thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// Minimum interval between consecutive partial-STT calls.
    #[serde(with = "duration_millis")]
    pub partial_stt_min_interval: Duration,
    /// Minimum number of audio frames buffered before a partial STT is
    /// attempted.
    pub min_chunks_for_partial: u32,
    /// Token-overlap ratio at or above which a speculative turn is adopted.
    pub speculation_overlap_threshold: f32,
    /// How often the keep-warm pinger calls the STT and TTS endpoints.
    #[serde(with = "duration_millis")]
    pub keep_warm_interval: Duration,
    /// Silence duration after which an in-progress utterance may trigger an
    /// early speculative turn even without an explicit end-of-utterance
    /// signal.
    #[serde(with = "duration_millis")]
    pub silence_before_early_llm: Duration,
    /// Maximum size of a session's inbound audio buffer before the oldest
    /// bytes are dropped.
    pub max_audio_buffer_bytes: usize,
    /// Minimum audio size worth sending to the STT provider at all.
    pub min_audio_bytes: usize,
    /// Number of trailing `{user, assistant}` pairs kept as LLM context.
    pub max_history_turns: usize,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            partial_stt_min_interval: Duration::from_millis(600),
            min_chunks_for_partial: 2,
            speculation_overlap_threshold: 0.7,
            keep_warm_interval: Duration::from_secs(30),
            silence_before_early_llm: Duration::from_millis(300),
            max_audio_buffer_bytes: 1024 * 1024,
            min_audio_bytes: 500,
            max_history_turns: 4,
        }
    }
}

/// Opener-phrase cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenerCacheConfig {
    /// Directory the pre-synthesised opener audio is mirrored to on disk.
    pub dir: PathBuf,
    /// Fixed opener phrases the LLM is instructed to use verbatim when
    /// applicable. Order does not matter; lookup is by normalised prefix
    /// match.
    pub phrases: Vec<String>,
}

impl Default for OpenerCacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            phrases: vec![
                "Of course, I'll add that to your cart.".to_owned(),
                "Sure, coming right up.".to_owned(),
                "Great choice!".to_owned(),
                "Let me check that for you.".to_owned(),
                "Absolutely, I can help with that.".to_owned(),
                "Got it.".to_owned(),
                "Here's what I'd recommend.".to_owned(),
                "No problem at all.".to_owned(),
            ],
        }
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("garson-voice-core")
        .join("opener-cache")
}

/// External scope-lookup collaborator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    /// Base URL of the menu/scope service that resolves a table token.
    pub base_url: String,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:4000".to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_thresholds() {
        let turn = TurnConfig::default();
        assert_eq!(turn.partial_stt_min_interval, Duration::from_millis(600));
        assert_eq!(turn.min_chunks_for_partial, 2);
        assert!((turn.speculation_overlap_threshold - 0.7).abs() < f32::EPSILON);
        assert_eq!(turn.keep_warm_interval, Duration::from_secs(30));
        assert_eq!(turn.max_audio_buffer_bytes, 1024 * 1024);
        assert_eq!(turn.max_history_turns, 4);
    }

    #[test]
    fn from_env_requires_api_key() {
        // SAFETY: test runs single-threaded with respect to this var via
        // serial execution of the crate's default test harness.
        unsafe { std::env::remove_var("GARSON_PROVIDER_API_KEY") };
        assert!(AppConfig::from_env().is_err());
    }
}
