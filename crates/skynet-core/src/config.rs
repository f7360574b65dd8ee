use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Protocol constants — must match OpenClaw wire protocol exactly
pub const PROTOCOL_VERSION: u32 = 3;
pub const DEFAULT_PORT: u16 = 18789;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const MAX_PAYLOAD_BYTES: usize = 128 * 1024; // 128 KB hard cap per frame
pub const MAX_BUFFERED_BYTES: usize = 1024 * 1024; // 1 MB: slow consumer threshold
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000; // close if client doesn't auth in 10s
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30; // tick event cadence

/// Top-level config (skynet.toml + SKYNET_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkynetConfig {
    pub gateway: GatewayConfig,
    pub agent: AgentConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub webhooks: WebhooksConfig,
    #[serde(default)]
    pub update: UpdateConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub lanes: LanesConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub ipc: IpcConfig,
}

/// C1 durable message queue tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// How long a chat's batch window stays open waiting for more messages.
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,
    /// Hard cap on messages drained into a single batch.
    #[serde(default = "default_max_batch")]
    pub max_batch: u32,
    /// A chat is considered stalled if its oldest `processing` row is older
    /// than this and gets reclaimed by `resetStalled`.
    #[serde(default = "default_stalled_ms")]
    pub stalled_threshold_ms: u64,
    /// Stalled threshold used right after a wake-from-sleep jump is detected.
    #[serde(default = "default_stalled_wake_ms")]
    pub stalled_threshold_wake_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_window_ms: default_batch_window_ms(),
            max_batch: default_max_batch(),
            stalled_threshold_ms: default_stalled_ms(),
            stalled_threshold_wake_ms: default_stalled_wake_ms(),
        }
    }
}

fn default_batch_window_ms() -> u64 {
    2_000
}
fn default_max_batch() -> u32 {
    50
}
fn default_stalled_ms() -> u64 {
    5 * 60 * 1_000
}
fn default_stalled_wake_ms() -> u64 {
    1_000
}

/// C4 lane-aware worker pool tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanesConfig {
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    /// A waiting lower-priority task is promoted after waiting this long.
    #[serde(default = "default_starvation_ms")]
    pub starvation_ms: u64,
    /// Interactive tasks admitted back-to-back before a lower lane is forced in.
    #[serde(default = "default_max_consecutive_interactive")]
    pub max_consecutive_interactive: u32,
}

impl Default for LanesConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            starvation_ms: default_starvation_ms(),
            max_consecutive_interactive: default_max_consecutive_interactive(),
        }
    }
}

fn default_pool_size() -> u32 {
    4
}
fn default_starvation_ms() -> u64 {
    60_000
}
fn default_max_consecutive_interactive() -> u32 {
    6
}

/// C5 sandbox orchestrator tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_sandbox_mode")]
    pub mode: String,
    #[serde(default = "default_heartbeat_grace_ms")]
    pub heartbeat_grace_ms: u64,
    /// Grace period applied to a daemon immediately after a detected
    /// wake-from-sleep time jump (`>20s`), before reverting to the normal grace.
    #[serde(default = "default_heartbeat_grace_suspended_ms")]
    pub heartbeat_grace_suspended_ms: u64,
    /// Wall-clock jump between heartbeat polls that is treated as a suspend/resume.
    #[serde(default = "default_wake_jump_threshold_ms")]
    pub wake_jump_threshold_ms: u64,
    /// Minimum spacing between successive streamed-edit updates to a platform message.
    #[serde(default = "default_edit_interval_ms")]
    pub edit_interval_ms: u64,
    /// Hard cap on characters sent in a single streamed edit.
    #[serde(default = "default_max_edit_length")]
    pub max_edit_length: usize,
    /// Executable used to launch an ephemeral sandbox run.
    #[serde(default = "default_sandbox_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Ceiling on tool invocations the sandbox may perform in one run.
    #[serde(default = "default_max_tool_steps")]
    pub max_tool_steps: u32,
    /// Overall deadline for one run, ephemeral or daemon.
    #[serde(default = "default_sandbox_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            mode: default_sandbox_mode(),
            heartbeat_grace_ms: default_heartbeat_grace_ms(),
            heartbeat_grace_suspended_ms: default_heartbeat_grace_suspended_ms(),
            wake_jump_threshold_ms: default_wake_jump_threshold_ms(),
            edit_interval_ms: default_edit_interval_ms(),
            max_edit_length: default_max_edit_length(),
            command: default_sandbox_command(),
            args: Vec::new(),
            max_tool_steps: default_max_tool_steps(),
            timeout_ms: default_sandbox_timeout_ms(),
        }
    }
}

fn default_max_edit_length() -> usize {
    1900
}
fn default_sandbox_command() -> String {
    "skynet-sandbox".to_string()
}
fn default_max_tool_steps() -> u32 {
    50
}
fn default_sandbox_timeout_ms() -> u64 {
    300_000
}

fn default_sandbox_mode() -> String {
    "ephemeral".to_string()
}
fn default_heartbeat_grace_ms() -> u64 {
    5_000
}
fn default_heartbeat_grace_suspended_ms() -> u64 {
    60_000
}
fn default_wake_jump_threshold_ms() -> u64 {
    20_000
}
fn default_edit_interval_ms() -> u64 {
    1_000
}

/// C6 scheduler tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_poll_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_stale_lease_ms")]
    pub stale_lease_ms: u64,
    #[serde(default = "default_task_max_retries")]
    pub task_max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_scheduler_poll_ms(),
            stale_lease_ms: default_stale_lease_ms(),
            task_max_retries: default_task_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
        }
    }
}

fn default_scheduler_poll_ms() -> u64 {
    5_000
}
fn default_stale_lease_ms() -> u64 {
    15 * 60 * 1_000
}
fn default_task_max_retries() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    1_000
}
fn default_retry_max_ms() -> u64 {
    5 * 60 * 1_000
}

/// C8 file-based IPC dispatcher tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcConfig {
    #[serde(default = "default_ipc_poll_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_ipc_base_dir")]
    pub base_dir: String,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_ipc_poll_ms(),
            base_dir: default_ipc_base_dir(),
        }
    }
}

fn default_ipc_poll_ms() -> u64 {
    500
}
fn default_ipc_base_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.skynet/ipc")
}

/// Update subsystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Check for updates on server start (default: true).
    /// Override with env var: SKYNET_UPDATE_CHECK_ON_START=false
    #[serde(default = "bool_true")]
    pub check_on_start: bool,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            check_on_start: true,
        }
    }
}

impl Default for SkynetConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            gateway: GatewayConfig {
                port: DEFAULT_PORT,
                bind: DEFAULT_BIND.to_string(),
                auth: AuthConfig {
                    mode: AuthMode::Token,
                    token: Some("change-me".to_string()),
                    password: None,
                },
            },
            agent: AgentConfig {
                model: "claude-sonnet-4-6".to_string(),
                soul_path: None,
            },
            providers: ProvidersConfig::default(),
            channels: ChannelsConfig::default(),
            webhooks: WebhooksConfig::default(),
            update: UpdateConfig::default(),
            queue: QueueConfig::default(),
            lanes: LanesConfig::default(),
            sandbox: SandboxConfig::default(),
            scheduler: SchedulerConfig::default(),
            ipc: IpcConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub mode: AuthMode,
    pub token: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    Token,
    Password,
    Tailscale,
    DeviceToken,
    TrustedProxy,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_model")]
    pub model: String,
    pub soul_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    pub anthropic: Option<AnthropicConfig>,
    pub openai: Option<OpenAiProviderConfig>,
    pub ollama: Option<OllamaConfig>,
    pub copilot: Option<CopilotConfig>,
    pub qwen_oauth: Option<QwenOAuthConfig>,
    pub bedrock: Option<BedrockConfig>,
    pub vertex: Option<VertexConfig>,
    pub claude_cli: Option<ClaudeCliConfig>,
    /// Additional OpenAI-compatible providers. Each entry can reference a
    /// well-known provider ID (e.g. "groq", "deepseek") or define a fully
    /// custom endpoint. Providers are tried in order after the primary slots.
    #[serde(default)]
    pub openai_compat: Vec<OpenAiCompatEntry>,
}

/// Claude Code CLI provider — delegates chat turns to `claude -p`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeCliConfig {
    /// Binary name or path. Defaults to `"claude"` on PATH.
    #[serde(default = "default_claude_cli_command")]
    pub command: String,
    /// Explicit path to the `skynet-gateway` binary for MCP bridge registration.
    /// Auto-detected from `~/.skynet/skynet-gateway` when unset.
    pub mcp_bridge: Option<String>,
    /// Tools allowed in pipe mode. Empty means no `--allowedTools` flag.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
}

fn default_claude_cli_command() -> String {
    "claude".to_string()
}

/// A single OpenAI-compatible provider entry.
///
/// Well-known provider IDs are resolved automatically:
/// `groq`, `deepseek`, `openrouter`, `xai`, `mistral`, `perplexity`,
/// `together`, `fireworks`, `cerebras`, `sambanova`, `hyperbolic`,
/// `novita`, `lepton`, `corethink`, `featherless`, `requesty`, `glama`,
/// `chutes`, `cohere`, `moonshot`, `glm`, `doubao`, `qwen`, `zai`,
/// `yi`, `minimax`, `hunyuan`, `stepfun`, `lmstudio`, `llamacpp`,
/// `localai`, `litellm`.
///
/// For unknown IDs, `base_url` is required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiCompatEntry {
    /// Provider identifier — matches a known ID or a custom label.
    pub id: String,
    /// API key for this provider.
    pub api_key: String,
    /// Base URL (without trailing slash). Auto-filled from registry for known IDs.
    /// Required for custom/unknown providers.
    pub base_url: Option<String>,
    /// Override the chat completions path. Auto-filled from registry.
    /// Defaults to "/v1/chat/completions" when not in registry.
    pub chat_path: Option<String>,
    /// Override the model for requests routed to this provider.
    /// Falls back to `agent.model` when not set.
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiProviderConfig {
    pub api_key: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicConfig {
    pub api_key: String,
    #[serde(default = "default_anthropic_base_url")]
    pub base_url: String,
}

/// GitHub Copilot provider — reads a long-lived GitHub access token from file.
/// The token is exchanged for short-lived Copilot API keys at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopilotConfig {
    /// Path to file containing the GitHub access token (written by setup.sh).
    pub token_path: String,
}

/// Qwen OAuth provider — reads OAuth credentials (access + refresh token) from file.
/// Tokens are auto-refreshed at runtime when expired.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QwenOAuthConfig {
    /// Path to JSON credentials file (written by setup.sh).
    pub credentials_path: String,
}

/// AWS Bedrock provider — uses SigV4 authentication.
/// Credentials from AWS_ACCESS_KEY_ID/AWS_SECRET_ACCESS_KEY env vars
/// or ~/.aws/credentials file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BedrockConfig {
    /// AWS region (e.g. "us-east-1").
    pub region: String,
    /// Optional AWS credentials profile name (default: "default").
    pub profile: Option<String>,
}

/// Google Vertex AI provider — uses service account JWT authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VertexConfig {
    /// Path to GCP service account JSON key file.
    pub key_file: String,
    /// GCP project ID. Auto-detected from key file if not set.
    pub project_id: Option<String>,
    /// GCP region (default: "us-central1").
    pub location: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelsConfig {
    pub telegram: Option<TelegramConfig>,
    pub discord: Option<DiscordConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    pub bot_token: String,
    /// When true, guild messages are only processed when the bot is @mentioned.
    /// Defaults to false (respond to all messages in channels).
    #[serde(default)]
    pub require_mention: bool,
    /// When true, direct messages (DMs) are accepted.
    /// Defaults to true.
    #[serde(default = "bool_true")]
    pub dm_allowed: bool,
}

fn bool_true() -> bool {
    true
}

/// Authentication mode for an incoming webhook source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WebhookAuthMode {
    /// HMAC-SHA256 over the raw request body (GitHub-style X-Hub-Signature-256).
    HmacSha256,
    /// Static bearer token in the Authorization header.
    BearerToken,
    /// No authentication — use only for internal/trusted networks.
    None,
}

/// Configuration for a single webhook source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSourceConfig {
    /// Identifier used in the route, e.g. "github" → POST /webhooks/github.
    pub name: String,
    /// HMAC signing secret or bearer token value.
    pub secret: Option<String>,
    /// How the incoming request should be authenticated.
    pub auth_mode: WebhookAuthMode,
}

/// Top-level webhooks subsystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WebhooksConfig {
    /// When false the /webhooks/:source route returns 404.
    #[serde(default)]
    pub enabled: bool,
    /// List of allowed webhook sources and their auth settings.
    #[serde(default)]
    pub sources: Vec<WebhookSourceConfig>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_model() -> String {
    "claude-sonnet-4-6".to_string()
}
fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_ollama_base_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.skynet/skynet.db", home)
}

impl SkynetConfig {
    /// Load config from a TOML file with SKYNET_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.skynet/skynet.toml  (native)
    ///   3. ~/.openclaw/openclaw.json  (migration path — Phase 2)
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: SkynetConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("SKYNET_").split("_"))
            .extract()
            .map_err(|e| crate::error::SkynetError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.skynet/skynet.toml", home)
}
