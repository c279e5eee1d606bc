//! Configuration management for the voice orchestrator
//!
//! Values resolve in priority order: environment > TOML file > defaults.

pub mod file;

use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;

use crate::Result;

pub use file::{VoiceConfigFile, WakePhraseFileEntry, default_config_path, load_config_file};

/// Default realtime WebSocket endpoint
pub const DEFAULT_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";

/// Default realtime model
pub const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-realtime-preview";

/// Hard limit for reaching the established state
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Backoff before the wake recognizer restarts after a spontaneous end
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_millis(250);

/// Orchestrator configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Realtime endpoint
    pub realtime: RealtimeConfig,

    /// Wake and termination phrases
    pub wake: WakeConfig,

    /// Filler speech
    pub speculative: SpeculativeConfig,

    /// Tool execution endpoint
    pub tools: ToolsConfig,

    /// Cart broadcast bridge
    pub bridge: BridgeConfig,

    /// Local speech services
    pub speech: SpeechConfig,

    /// Control API
    pub api: ApiConfig,
}

/// Realtime endpoint configuration
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// WebSocket URL of the conversational endpoint
    pub url: String,

    /// Model identifier appended as `?model=`
    pub model: String,

    /// Voice used for synthesized replies
    pub voice: String,

    /// Long-lived API key (used when no credential URL is set)
    pub api_key: Option<SecretString>,

    /// Endpoint minting short-lived session credentials
    pub credential_url: Option<String>,

    /// Time allowed to reach the established state
    pub connect_timeout: Duration,

    /// Server-side turn detection thresholds
    pub turn_detection: TurnDetection,

    /// Behavioral instructions override
    pub instructions: Option<String>,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_REALTIME_URL.to_string(),
            model: DEFAULT_REALTIME_MODEL.to_string(),
            voice: "alloy".to_string(),
            api_key: None,
            credential_url: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            turn_detection: TurnDetection::default(),
            instructions: None,
        }
    }
}

/// Server VAD thresholds sent in the session configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TurnDetection {
    /// Activation threshold (0.0 to 1.0)
    pub threshold: f32,

    /// Audio kept before detected speech
    pub prefix_padding_ms: u32,

    /// Silence that ends a user turn
    pub silence_duration_ms: u32,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
        }
    }
}

/// Wake listener configuration
#[derive(Debug, Clone)]
pub struct WakeConfig {
    /// Drop the built-in wake table and use only `phrases`
    pub replace_defaults: bool,

    /// Additional wake phrases with aliases
    pub phrases: Vec<WakePhraseFileEntry>,

    /// Additional termination phrases
    pub termination_phrases: Vec<String>,

    /// Backoff before restarting after a spontaneous recognizer end
    pub restart_delay: Duration,

    /// Delay before wake listening resumes after a failed connect
    pub connect_fallback_delay: Duration,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            replace_defaults: false,
            phrases: Vec::new(),
            termination_phrases: Vec::new(),
            restart_delay: DEFAULT_RESTART_DELAY,
            connect_fallback_delay: Duration::from_secs(1),
        }
    }
}

/// Filler speech configuration
#[derive(Debug, Clone)]
pub struct SpeculativeConfig {
    /// Play filler sentences while tool calls are in flight
    pub enabled: bool,

    /// Queue-wide timeout for informational calls
    pub informational_timeout: Duration,

    /// Queue-wide timeout for ordering calls
    pub ordering_timeout: Duration,

    /// Offsets at which follow-up fillers enqueue for ordering calls
    pub follow_up_offsets: Vec<Duration>,
}

impl Default for SpeculativeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            informational_timeout: Duration::from_millis(1500),
            ordering_timeout: Duration::from_secs(6),
            follow_up_offsets: vec![Duration::from_secs(2), Duration::from_secs(4)],
        }
    }
}

/// Tool execution endpoint configuration
#[derive(Debug, Clone)]
pub struct ToolsConfig {
    /// Base URL of the POS backend
    pub base_url: String,

    /// Per-request timeout
    pub request_timeout: Duration,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            request_timeout: Duration::from_secs(15),
        }
    }
}

/// Broadcast bridge configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Publish endpoint; `None` disables publishing
    pub url: Option<String>,

    /// Identifier of this client in cart notifications
    pub client_id: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: None,
            client_id: format!("voice-{}", uuid::Uuid::new_v4()),
        }
    }
}

/// Local speech configuration
#[derive(Debug, Clone)]
pub struct SpeechConfig {
    /// OpenAI-compatible API base URL
    pub api_url: String,

    /// API key for TTS/STT
    pub api_key: Option<SecretString>,

    /// TTS model for filler sentences
    pub tts_model: String,

    /// TTS voice for filler sentences
    pub tts_voice: String,

    /// TTS speed multiplier (0.25 to 4.0)
    pub tts_speed: f32,

    /// STT model used by the wake recognizer
    pub stt_model: String,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            tts_model: "tts-1".to_string(),
            tts_voice: "alloy".to_string(),
            tts_speed: 1.1,
            stt_model: "whisper-1".to_string(),
        }
    }
}

/// Control API configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Port to listen on
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 18790 }
    }
}

impl Config {
    /// Load configuration from the environment and an optional TOML file
    ///
    /// # Errors
    ///
    /// Returns error if an explicit config file cannot be read or a URL is invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc = load_config_file(path)?;
        let config = Self::from_file_and_env(fc, |key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Merge a parsed file with an environment lookup
    ///
    /// `env` is injected so tests can run without touching process state.
    #[must_use]
    pub fn from_file_and_env(fc: VoiceConfigFile, env: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let openai_key = env("OPENAI_API_KEY");

        let rt = fc.realtime;
        let realtime = RealtimeConfig {
            url: env("VENUE_REALTIME_URL")
                .or(rt.url)
                .unwrap_or(defaults.realtime.url),
            model: env("VENUE_REALTIME_MODEL")
                .or(rt.model)
                .unwrap_or(defaults.realtime.model),
            voice: env("VENUE_REALTIME_VOICE")
                .or(rt.voice)
                .unwrap_or(defaults.realtime.voice),
            api_key: openai_key.clone().or(rt.api_key).map(SecretString::from),
            credential_url: env("VENUE_CREDENTIAL_URL").or(rt.credential_url),
            connect_timeout: rt
                .connect_timeout_ms
                .map_or(defaults.realtime.connect_timeout, Duration::from_millis),
            turn_detection: TurnDetection {
                threshold: rt
                    .vad_threshold
                    .unwrap_or(defaults.realtime.turn_detection.threshold),
                prefix_padding_ms: rt
                    .prefix_padding_ms
                    .unwrap_or(defaults.realtime.turn_detection.prefix_padding_ms),
                silence_duration_ms: rt
                    .silence_duration_ms
                    .unwrap_or(defaults.realtime.turn_detection.silence_duration_ms),
            },
            instructions: rt.instructions,
        };

        let wake = WakeConfig {
            replace_defaults: fc.wake.replace_defaults.unwrap_or(false),
            phrases: fc.wake.phrases,
            termination_phrases: fc.wake.termination_phrases,
            restart_delay: fc
                .wake
                .restart_delay_ms
                .map_or(defaults.wake.restart_delay, Duration::from_millis),
            connect_fallback_delay: fc
                .wake
                .connect_fallback_delay_ms
                .map_or(defaults.wake.connect_fallback_delay, Duration::from_millis),
        };

        let speculative = SpeculativeConfig {
            enabled: fc.speculative.enabled.unwrap_or(true),
            informational_timeout: fc
                .speculative
                .informational_timeout_ms
                .map_or(defaults.speculative.informational_timeout, Duration::from_millis),
            ordering_timeout: fc
                .speculative
                .ordering_timeout_ms
                .map_or(defaults.speculative.ordering_timeout, Duration::from_millis),
            follow_up_offsets: defaults.speculative.follow_up_offsets,
        };

        let tools = ToolsConfig {
            base_url: env("VENUE_TOOLS_URL")
                .or(fc.tools.base_url)
                .unwrap_or(defaults.tools.base_url),
            request_timeout: fc
                .tools
                .request_timeout_ms
                .map_or(defaults.tools.request_timeout, Duration::from_millis),
        };

        let bridge = BridgeConfig {
            url: env("VENUE_BRIDGE_URL").or(fc.bridge.url),
            client_id: env("VENUE_CLIENT_ID")
                .or(fc.bridge.client_id)
                .unwrap_or(defaults.bridge.client_id),
        };

        let sp = fc.speech;
        let speech = SpeechConfig {
            api_url: sp.api_url.unwrap_or(defaults.speech.api_url),
            api_key: openai_key.or(sp.api_key).map(SecretString::from),
            tts_model: sp.tts_model.unwrap_or(defaults.speech.tts_model),
            tts_voice: sp.tts_voice.unwrap_or(defaults.speech.tts_voice),
            tts_speed: sp.tts_speed.unwrap_or(defaults.speech.tts_speed),
            stt_model: sp.stt_model.unwrap_or(defaults.speech.stt_model),
        };

        let api = ApiConfig {
            port: env("VENUE_API_PORT")
                .and_then(|p| p.parse().ok())
                .or(fc.api.port)
                .unwrap_or(defaults.api.port),
        };

        Self {
            realtime,
            wake,
            speculative,
            tools,
            bridge,
            speech,
            api,
        }
    }

    /// Check URLs and ranges
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first invalid field
    pub fn validate(&self) -> Result<()> {
        let check = |field: &str, raw: &str| {
            url::Url::parse(raw)
                .map(|_| ())
                .map_err(|e| crate::Error::Config(format!("{field}: invalid url {raw:?}: {e}")))
        };

        check("realtime.url", &self.realtime.url)?;
        check("tools.base_url", &self.tools.base_url)?;
        check("speech.api_url", &self.speech.api_url)?;
        if let Some(u) = &self.realtime.credential_url {
            check("realtime.credential_url", u)?;
        }
        if let Some(u) = &self.bridge.url {
            check("bridge.url", u)?;
        }

        if !(0.25..=4.0).contains(&self.speech.tts_speed) {
            return Err(crate::Error::Config(format!(
                "speech.tts_speed must be within 0.25..=4.0, got {}",
                self.speech.tts_speed
            )));
        }

        Ok(())
    }
}
