//! Resolves `providers` config into a live [`ProviderRouter`].
//!
//! Priority order mirrors [`crate::mcp_lifecycle::ensure_mcp_registration`]:
//! explicit primary providers first (anthropic, openai, ollama, copilot,
//! qwen-oauth, bedrock, vertex), then any `openai_compat` entries, then
//! `claude-cli` explicit config, then env-var auto-detect, then `claude-cli`
//! on PATH as a last resort. Every configured slot is added to the router so
//! a failing primary falls over to the next one (C3).

use std::path::Path;
use std::sync::Arc;

use skynet_agent::bedrock::{AwsCredentials, BedrockProvider};
use skynet_agent::claude_cli::ClaudeCliProvider;
use skynet_agent::cooldown::CooldownStore;
use skynet_agent::copilot::CopilotProvider;
use skynet_agent::ollama::OllamaProvider;
use skynet_agent::openai::OpenAiProvider;
use skynet_agent::qwen_oauth::QwenCredentials;
use skynet_agent::registry;
use skynet_agent::router::{ProviderRouter, ProviderSlot};
use skynet_agent::anthropic::AnthropicProvider;
use skynet_agent::vertex::VertexProvider;
use skynet_core::config::SkynetConfig;

const DEFAULT_MAX_RETRIES: u32 = 2;

/// Build the provider router for this process, wiring every configured
/// slot plus a persisted cooldown tracker.
pub fn build_router(config: &SkynetConfig) -> anyhow::Result<ProviderRouter> {
    let mut slots: Vec<ProviderSlot> = Vec::new();

    if let Some(ref cfg) = config.providers.anthropic {
        slots.push(ProviderSlot::new(
            Box::new(AnthropicProvider::new(cfg.api_key.clone(), Some(cfg.base_url.clone()))),
            DEFAULT_MAX_RETRIES,
        ));
    }
    if let Some(ref cfg) = config.providers.openai {
        slots.push(ProviderSlot::new(
            Box::new(OpenAiProvider::new(cfg.api_key.clone(), Some(cfg.base_url.clone()))),
            DEFAULT_MAX_RETRIES,
        ));
    }
    if let Some(ref cfg) = config.providers.ollama {
        slots.push(ProviderSlot::new(
            Box::new(OllamaProvider::new(Some(cfg.base_url.clone()))),
            DEFAULT_MAX_RETRIES,
        ));
    }
    if let Some(ref cfg) = config.providers.copilot {
        match std::fs::read_to_string(&cfg.token_path) {
            Ok(token) => slots.push(ProviderSlot::new(
                Box::new(CopilotProvider::new(token.trim().to_string())),
                DEFAULT_MAX_RETRIES,
            )),
            Err(e) => tracing::warn!(path = %cfg.token_path, error = %e, "skipping copilot provider, token unreadable"),
        }
    }
    if let Some(ref cfg) = config.providers.qwen_oauth {
        match std::fs::read_to_string(&cfg.credentials_path) {
            Ok(raw) => match serde_json::from_str::<QwenCredentials>(&raw) {
                Ok(creds) => slots.push(ProviderSlot::new(
                    Box::new(skynet_agent::qwen_oauth::QwenOAuthProvider::new(
                        creds,
                        cfg.credentials_path.clone(),
                    )),
                    DEFAULT_MAX_RETRIES,
                )),
                Err(e) => tracing::warn!(error = %e, "skipping qwen-oauth provider, malformed credentials"),
            },
            Err(e) => tracing::warn!(path = %cfg.credentials_path, error = %e, "skipping qwen-oauth provider, credentials unreadable"),
        }
    }
    if let Some(ref cfg) = config.providers.bedrock {
        match AwsCredentials::from_env(cfg.region.clone(), cfg.profile.as_deref()) {
            Ok(creds) => slots.push(ProviderSlot::new(
                Box::new(BedrockProvider::new(creds, cfg.region.clone())),
                DEFAULT_MAX_RETRIES,
            )),
            Err(e) => tracing::warn!(error = %e, "skipping bedrock provider, credential resolution failed"),
        }
    }
    if let Some(ref cfg) = config.providers.vertex {
        match VertexProvider::from_file(
            &cfg.key_file,
            cfg.project_id.clone(),
            cfg.location.clone(),
        ) {
            Ok(p) => slots.push(ProviderSlot::new(Box::new(p), DEFAULT_MAX_RETRIES)),
            Err(e) => tracing::warn!(error = %e, "skipping vertex provider, key file load failed"),
        }
    }

    for entry in &config.providers.openai_compat {
        let known = registry::lookup(&entry.id);
        let base_url = entry
            .base_url
            .clone()
            .or_else(|| known.map(|k| k.base_url.to_string()));
        let Some(base_url) = base_url else {
            tracing::warn!(id = %entry.id, "skipping openai-compat provider, no base_url and unknown id");
            continue;
        };
        let chat_path = entry
            .chat_path
            .clone()
            .or_else(|| known.map(|k| k.chat_path.to_string()))
            .unwrap_or_else(|| "/v1/chat/completions".to_string());
        slots.push(ProviderSlot::new(
            Box::new(OpenAiProvider::with_path(
                &entry.id,
                entry.api_key.clone(),
                base_url,
                chat_path,
            )),
            DEFAULT_MAX_RETRIES,
        ));
    }

    if let Some(ref cfg) = config.providers.claude_cli {
        slots.push(ProviderSlot::new(
            Box::new(
                ClaudeCliProvider::new(cfg.command.clone())
                    .with_allowed_tools(cfg.allowed_tools.clone()),
            ),
            DEFAULT_MAX_RETRIES,
        ));
    }

    if slots.is_empty() {
        if let Ok(key) = std::env::var("ANTHROPIC_OAUTH_TOKEN").or_else(|_| std::env::var("ANTHROPIC_API_KEY")) {
            slots.push(ProviderSlot::new(
                Box::new(AnthropicProvider::new(key, None)),
                DEFAULT_MAX_RETRIES,
            ));
        } else if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            slots.push(ProviderSlot::new(
                Box::new(OpenAiProvider::new(key, None)),
                DEFAULT_MAX_RETRIES,
            ));
        } else if claude_on_path() {
            slots.push(ProviderSlot::new(
                Box::new(ClaudeCliProvider::new("claude".to_string())),
                DEFAULT_MAX_RETRIES,
            ));
        }
    }

    if slots.is_empty() {
        anyhow::bail!(
            "no LLM provider configured — set providers.anthropic/openai/etc in skynet.toml, \
             ANTHROPIC_API_KEY/OPENAI_API_KEY, or install the claude CLI"
        );
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let cooldown_path = Path::new(&home).join(".skynet/cooldowns.json");
    let cooldowns = Arc::new(CooldownStore::load(cooldown_path));

    Ok(ProviderRouter::new(slots).with_cooldowns(cooldowns))
}

fn claude_on_path() -> bool {
    which::which("claude").is_ok()
}
