//! TOML configuration file loading
//!
//! Supports `~/.config/arc/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ArcConfigFile {
    /// Data directory override (database, key file)
    pub data_dir: Option<String>,

    /// Reasoning provider configuration
    #[serde(default)]
    pub llm: LlmFileConfig,

    /// Orchestrator limits
    #[serde(default)]
    pub agent: AgentFileConfig,

    /// Memory store configuration
    #[serde(default)]
    pub memory: MemoryFileConfig,

    /// Voice/audio configuration
    #[serde(default)]
    pub voice: VoiceFileConfig,

    /// Native tool configuration
    #[serde(default)]
    pub tools: ToolsFileConfig,

    /// Context protocol servers
    #[serde(default)]
    pub mcp: McpFileConfig,
}

/// LLM-related configuration
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    /// OpenAI-compatible base URL (e.g. `http://localhost:11434/v1`)
    pub base_url: Option<String>,
    /// Model identifier (e.g. "llama3.1")
    pub model: Option<String>,
    /// API key, if the server requires one
    pub api_key: Option<String>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Max tokens per completion
    pub max_tokens: Option<u32>,
    /// Request timeout in seconds
    pub timeout_secs: Option<u64>,
    /// Extra system prompt text
    pub system_prompt: Option<String>,
}

/// Orchestrator configuration
#[derive(Debug, Default, Deserialize)]
pub struct AgentFileConfig {
    /// Assistant display name
    pub name: Option<String>,
    /// Max reasoning steps per user turn
    pub max_steps: Option<usize>,
    /// Per-call tool timeout in seconds
    pub tool_timeout_secs: Option<u64>,
    /// Max concurrent independent tool calls
    pub max_parallel_tools: Option<usize>,
    /// Facts injected per turn
    pub memory_context_items: Option<usize>,
}

/// Memory store configuration
#[derive(Debug, Default, Deserialize)]
pub struct MemoryFileConfig {
    /// Database file path
    pub db_path: Option<String>,
    /// Encryption key file path
    pub key_path: Option<String>,
    /// Remove facts untouched for this many days (0 disables)
    pub decay_days: Option<u32>,
}

/// Voice processing configuration
#[derive(Debug, Default, Deserialize)]
pub struct VoiceFileConfig {
    /// Enable voice input/output
    pub enabled: Option<bool>,
    /// OpenAI-compatible STT base URL
    pub stt_base_url: Option<String>,
    /// STT model (e.g. "whisper-1")
    pub stt_model: Option<String>,
    /// OpenAI-compatible TTS base URL
    pub tts_base_url: Option<String>,
    /// TTS model (e.g. "tts-1")
    pub tts_model: Option<String>,
    /// TTS voice identifier
    pub tts_voice: Option<String>,
    /// TTS speed multiplier
    pub tts_speed: Option<f32>,
    /// API key for the speech servers
    pub api_key: Option<String>,
    /// Optional wake word (e.g. "arc")
    pub wake_word: Option<String>,
    /// Seconds after a reply during which no wake word is needed
    pub follow_up_secs: Option<u64>,
}

/// Native tool configuration
#[derive(Debug, Default, Deserialize)]
pub struct ToolsFileConfig {
    /// Directories the filesystem tools may read below
    pub allowed_roots: Option<Vec<String>>,
    /// Max bytes returned by `read_file`
    pub max_read_bytes: Option<usize>,
}

/// Context protocol configuration
#[derive(Debug, Default, Deserialize)]
pub struct McpFileConfig {
    /// Master switch
    pub enabled: Option<bool>,
    /// Servers keyed by name
    #[serde(default)]
    pub servers: BTreeMap<String, McpServerFileConfig>,
}

/// One context protocol server launched over stdio
#[derive(Debug, Clone, Deserialize)]
pub struct McpServerFileConfig {
    /// Executable to spawn
    pub command: String,
    /// Arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Whether to start this server
    #[serde(default = "default_true")]
    pub enabled: bool,
}

const fn default_true() -> bool {
    true
}

/// Parse config file content
///
/// # Errors
///
/// Returns error if the TOML is malformed
pub fn parse_config(content: &str) -> crate::Result<ArcConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Load the TOML config file from the standard path
///
/// Returns `ArcConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> ArcConfigFile {
    config_file_path().map_or_else(ArcConfigFile::default, |path| load_config_from(&path))
}

/// Load a config file from an explicit path, falling back to defaults
pub fn load_config_from(path: &Path) -> ArcConfigFile {
    if !path.exists() {
        return ArcConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match parse_config(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ArcConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ArcConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/arc/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("arc").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_file() {
        let fc = parse_config(
            r#"
            [llm]
            model = "qwen2.5"

            [agent]
            max_steps = 4

            [mcp.servers.git]
            command = "npx"
            args = ["-y", "@modelcontextprotocol/server-git"]
            "#,
        )
        .unwrap();

        assert_eq!(fc.llm.model.as_deref(), Some("qwen2.5"));
        assert_eq!(fc.agent.max_steps, Some(4));
        let git = &fc.mcp.servers["git"];
        assert_eq!(git.command, "npx");
        assert!(git.enabled);
        assert!(fc.voice.enabled.is_none());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let fc = load_config_from(Path::new("/nonexistent/arc/config.toml"));
        assert!(fc.llm.model.is_none());
        assert!(fc.mcp.servers.is_empty());
    }
}
