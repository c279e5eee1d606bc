//! TOML configuration file loading
//!
//! Supports `~/.config/venue/voice.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct VoiceConfigFile {
    /// Realtime endpoint configuration
    #[serde(default)]
    pub realtime: RealtimeFileConfig,

    /// Wake phrase and termination phrase configuration
    #[serde(default)]
    pub wake: WakeFileConfig,

    /// Filler speech configuration
    #[serde(default)]
    pub speculative: SpeculativeFileConfig,

    /// Tool execution endpoint configuration
    #[serde(default)]
    pub tools: ToolsFileConfig,

    /// Cart broadcast configuration
    #[serde(default)]
    pub bridge: BridgeFileConfig,

    /// Local speech (filler TTS, wake STT) configuration
    #[serde(default)]
    pub speech: SpeechFileConfig,

    /// Control API configuration
    #[serde(default)]
    pub api: ApiFileConfig,
}

/// Realtime endpoint configuration
#[derive(Debug, Default, Deserialize)]
pub struct RealtimeFileConfig {
    pub url: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub api_key: Option<String>,
    pub credential_url: Option<String>,
    pub connect_timeout_ms: Option<u64>,
    pub vad_threshold: Option<f32>,
    pub prefix_padding_ms: Option<u32>,
    pub silence_duration_ms: Option<u32>,
    pub instructions: Option<String>,
}

/// Extra wake phrase with its misheard variants
#[derive(Debug, Clone, Deserialize)]
pub struct WakePhraseFileEntry {
    pub phrase: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Wake listener configuration
#[derive(Debug, Default, Deserialize)]
pub struct WakeFileConfig {
    /// Replace the built-in wake table instead of extending it
    pub replace_defaults: Option<bool>,
    #[serde(default)]
    pub phrases: Vec<WakePhraseFileEntry>,
    #[serde(default)]
    pub termination_phrases: Vec<String>,
    pub restart_delay_ms: Option<u64>,
    pub connect_fallback_delay_ms: Option<u64>,
}

/// Speculative filler configuration
#[derive(Debug, Default, Deserialize)]
pub struct SpeculativeFileConfig {
    pub enabled: Option<bool>,
    pub informational_timeout_ms: Option<u64>,
    pub ordering_timeout_ms: Option<u64>,
}

/// Tool execution configuration
#[derive(Debug, Default, Deserialize)]
pub struct ToolsFileConfig {
    pub base_url: Option<String>,
    pub request_timeout_ms: Option<u64>,
}

/// Broadcast bridge configuration
#[derive(Debug, Default, Deserialize)]
pub struct BridgeFileConfig {
    pub url: Option<String>,
    pub client_id: Option<String>,
}

/// Local speech configuration
#[derive(Debug, Default, Deserialize)]
pub struct SpeechFileConfig {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub tts_model: Option<String>,
    pub tts_voice: Option<String>,
    pub tts_speed: Option<f32>,
    pub stt_model: Option<String>,
}

/// Control API configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiFileConfig {
    pub port: Option<u16>,
}

/// Default config file location: `~/.config/venue/voice.toml`
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("venue").join("voice.toml"))
}

/// Load the config file, falling back to an empty overlay
///
/// A missing file yields defaults. An explicitly given path that fails to
/// parse is an error; a broken default file is logged and ignored.
///
/// # Errors
///
/// Returns error if an explicit path cannot be read or parsed
pub fn load_config_file(explicit: Option<&Path>) -> Result<VoiceConfigFile> {
    if let Some(path) = explicit {
        let raw = std::fs::read_to_string(path)?;
        return Ok(toml::from_str(&raw)?);
    }

    let Some(path) = default_config_path() else {
        return Ok(VoiceConfigFile::default());
    };

    if !path.exists() {
        return Ok(VoiceConfigFile::default());
    }

    match std::fs::read_to_string(&path)
        .map_err(crate::Error::from)
        .and_then(|raw| toml::from_str(&raw).map_err(crate::Error::from))
    {
        Ok(fc) => {
            tracing::debug!(path = %path.display(), "loaded config file");
            Ok(fc)
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable config file");
            Ok(VoiceConfigFile::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_file() {
        let fc: VoiceConfigFile = toml::from_str(
            r#"
            [realtime]
            model = "gpt-realtime"

            [[wake.phrases]]
            phrase = "hey barkeep"
            aliases = ["hey bar keep"]
            "#,
        )
        .unwrap();

        assert_eq!(fc.realtime.model.as_deref(), Some("gpt-realtime"));
        assert!(fc.realtime.url.is_none());
        assert_eq!(fc.wake.phrases.len(), 1);
        assert_eq!(fc.wake.phrases[0].aliases, vec!["hey bar keep"]);
    }

    #[test]
    fn empty_file_is_default() {
        let fc: VoiceConfigFile = toml::from_str("").unwrap();
        assert!(fc.tools.base_url.is_none());
        assert!(fc.wake.termination_phrases.is_empty());
    }

    #[test]
    fn explicit_missing_path_errors() {
        let result = load_config_file(Some(Path::new("/nonexistent/venue/voice.toml")));
        assert!(result.is_err());
    }
}
