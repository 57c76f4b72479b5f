//! Configuration management for the ARC agent
//!
//! Values resolve as env > TOML file > default.

pub mod file;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use self::file::ArcConfigFile;

/// ARC agent configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to data directory (database, key file)
    pub data_dir: PathBuf,

    /// Reasoning provider configuration
    pub llm: LlmConfig,

    /// Orchestrator limits
    pub agent: AgentConfig,

    /// Memory store configuration
    pub memory: MemoryConfig,

    /// Voice processing configuration
    pub voice: VoiceConfig,

    /// Native tool configuration
    pub tools: ToolsConfig,

    /// Context protocol servers
    pub mcp: McpConfig,
}

/// OpenAI-compatible reasoning provider configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Base URL, e.g. `http://localhost:11434/v1`
    pub base_url: String,
    /// Model identifier
    pub model: String,
    /// Optional bearer token
    pub api_key: Option<SecretString>,
    /// Sampling temperature
    pub temperature: f32,
    /// Max tokens per completion
    pub max_tokens: u32,
    /// Time bound for one reasoning call
    pub timeout: Duration,
    /// Extra system prompt text appended to the default
    pub system_prompt: Option<String>,
}

/// Orchestrator limits
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Assistant display name
    pub name: String,
    /// Max reasoning steps per user turn
    pub max_steps: usize,
    /// Default per-call tool timeout
    pub tool_timeout: Duration,
    /// Max concurrent independent tool calls
    pub max_parallel_tools: usize,
    /// Facts injected into each reasoning call
    pub memory_context_items: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "ARC".to_string(),
            max_steps: 6,
            tool_timeout: Duration::from_secs(30),
            max_parallel_tools: 4,
            memory_context_items: 5,
        }
    }
}

/// Memory store configuration
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Database file
    pub db_path: PathBuf,
    /// Key file (created on first use)
    pub key_path: PathBuf,
    /// Passphrase overriding the key file (`ARC_MEMORY_PASSPHRASE`)
    pub passphrase: Option<SecretString>,
    /// Remove facts untouched for this many days (0 disables)
    pub decay_days: u32,
}

/// Voice processing configuration
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Enable voice input
    pub enabled: bool,
    /// OpenAI-compatible STT base URL
    pub stt_base_url: String,
    /// STT model
    pub stt_model: String,
    /// OpenAI-compatible TTS base URL
    pub tts_base_url: String,
    /// TTS model
    pub tts_model: String,
    /// TTS voice identifier
    pub tts_voice: String,
    /// TTS speed multiplier (0.25 to 4.0)
    pub tts_speed: f32,
    /// Bearer token for the speech servers
    pub api_key: Option<SecretString>,
    /// Optional wake word
    pub wake_word: Option<String>,
    /// Window after a reply in which follow-ups skip the wake word
    pub follow_up: Duration,
    /// Time bound for one transcription
    pub transcribe_timeout: Duration,
}

/// Native tool configuration
#[derive(Debug, Clone)]
pub struct ToolsConfig {
    /// Directories the filesystem tools may read below
    pub allowed_roots: Vec<PathBuf>,
    /// Max bytes returned by `read_file`
    pub max_read_bytes: usize,
}

/// Context protocol configuration
#[derive(Debug, Clone, Default)]
pub struct McpConfig {
    /// Master switch
    pub enabled: bool,
    /// Servers keyed by name
    pub servers: BTreeMap<String, McpServerConfig>,
}

/// One stdio context protocol server
#[derive(Debug, Clone)]
pub struct McpServerConfig {
    /// Executable to spawn
    pub command: String,
    /// Arguments
    pub args: Vec<String>,
    /// Extra environment
    pub env: BTreeMap<String, String>,
    /// Whether to start this server
    pub enabled: bool,
}

impl Config {
    /// Load configuration from the standard config file and process env
    ///
    /// # Errors
    ///
    /// Returns error if the data directory cannot be created
    pub fn load() -> crate::Result<Self> {
        let fc = file::load_config_file();
        let config = Self::resolve(fc, |key| std::env::var(key).ok());
        std::fs::create_dir_all(&config.data_dir)?;
        Ok(config)
    }

    /// Resolve a config file overlay against an environment lookup
    #[allow(clippy::too_many_lines)]
    pub fn resolve(fc: ArcConfigFile, env: impl Fn(&str) -> Option<String>) -> Self {
        let parse_u64 = |key: &str| env(key).and_then(|s| s.parse::<u64>().ok());
        let parse_usize = |key: &str| env(key).and_then(|s| s.parse::<usize>().ok());

        // Data directory (~/.local/share/arc on Linux)
        let data_dir = env("ARC_DATA_DIR")
            .or(fc.data_dir)
            .map_or_else(default_data_dir, PathBuf::from);

        let llm = LlmConfig {
            base_url: env("ARC_LLM_BASE_URL")
                .or(fc.llm.base_url)
                .unwrap_or_else(|| "http://localhost:11434/v1".to_string()),
            model: env("ARC_LLM_MODEL")
                .or(fc.llm.model)
                .unwrap_or_else(|| "llama3.1".to_string()),
            api_key: env("ARC_LLM_API_KEY")
                .or(fc.llm.api_key)
                .map(SecretString::from),
            temperature: fc.llm.temperature.unwrap_or(0.2),
            max_tokens: fc.llm.max_tokens.unwrap_or(1024),
            timeout: Duration::from_secs(
                parse_u64("ARC_LLM_TIMEOUT_SECS")
                    .or(fc.llm.timeout_secs)
                    .unwrap_or(60),
            ),
            system_prompt: fc.llm.system_prompt,
        };

        let defaults = AgentConfig::default();
        let agent = AgentConfig {
            name: fc.agent.name.unwrap_or(defaults.name),
            max_steps: parse_usize("ARC_MAX_STEPS")
                .or(fc.agent.max_steps)
                .unwrap_or(defaults.max_steps)
                .max(1),
            tool_timeout: parse_u64("ARC_TOOL_TIMEOUT_SECS")
                .or(fc.agent.tool_timeout_secs)
                .map_or(defaults.tool_timeout, Duration::from_secs),
            max_parallel_tools: fc
                .agent
                .max_parallel_tools
                .unwrap_or(defaults.max_parallel_tools)
                .max(1),
            memory_context_items: fc
                .agent
                .memory_context_items
                .unwrap_or(defaults.memory_context_items),
        };

        let memory = MemoryConfig {
            db_path: env("ARC_MEMORY_DB")
                .or(fc.memory.db_path)
                .map_or_else(|| data_dir.join("memory.db"), PathBuf::from),
            key_path: env("ARC_MEMORY_KEY_FILE")
                .or(fc.memory.key_path)
                .map_or_else(|| data_dir.join("memory.key"), PathBuf::from),
            passphrase: env("ARC_MEMORY_PASSPHRASE").map(SecretString::from),
            decay_days: fc.memory.decay_days.unwrap_or(30),
        };

        let voice = VoiceConfig {
            enabled: env("ARC_VOICE_ENABLED")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .or(fc.voice.enabled)
                .unwrap_or(true),
            stt_base_url: env("ARC_STT_BASE_URL")
                .or(fc.voice.stt_base_url)
                .unwrap_or_else(|| "http://localhost:8000/v1".to_string()),
            stt_model: env("ARC_STT_MODEL")
                .or(fc.voice.stt_model)
                .unwrap_or_else(|| "whisper-1".to_string()),
            tts_base_url: env("ARC_TTS_BASE_URL")
                .or(fc.voice.tts_base_url)
                .unwrap_or_else(|| "http://localhost:8880/v1".to_string()),
            tts_model: env("ARC_TTS_MODEL")
                .or(fc.voice.tts_model)
                .unwrap_or_else(|| "tts-1".to_string()),
            tts_voice: fc.voice.tts_voice.unwrap_or_else(|| "alloy".to_string()),
            tts_speed: fc.voice.tts_speed.unwrap_or(1.0).clamp(0.25, 4.0),
            api_key: env("ARC_SPEECH_API_KEY")
                .or(fc.voice.api_key)
                .map(SecretString::from),
            wake_word: env("ARC_WAKE_WORD")
                .or(fc.voice.wake_word)
                .filter(|w| !w.trim().is_empty()),
            follow_up: Duration::from_secs(fc.voice.follow_up_secs.unwrap_or(30)),
            transcribe_timeout: Duration::from_secs(30),
        };

        let tools = ToolsConfig {
            allowed_roots: fc.tools.allowed_roots.map_or_else(
                || {
                    directories::BaseDirs::new()
                        .map(|d| vec![d.home_dir().to_path_buf()])
                        .unwrap_or_default()
                },
                |roots| roots.into_iter().map(PathBuf::from).collect(),
            ),
            max_read_bytes: fc.tools.max_read_bytes.unwrap_or(64 * 1024),
        };

        let mcp = McpConfig {
            enabled: fc.mcp.enabled.unwrap_or(true),
            servers: fc
                .mcp
                .servers
                .into_iter()
                .map(|(name, s)| {
                    (
                        name,
                        McpServerConfig {
                            command: s.command,
                            args: s.args,
                            env: s.env,
                            enabled: s.enabled,
                        },
                    )
                })
                .collect(),
        };

        Self {
            data_dir,
            llm,
            agent,
            memory,
            voice,
            tools,
            mcp,
        }
    }
}

/// Default data directory: `~/.local/share/arc`
fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".local/share/arc"),
        |d| d.data_dir().join("arc"),
    )
}
