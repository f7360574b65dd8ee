use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a user (UUIDv7 — time-sortable for easier log correlation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new() -> Self {
        // UUIDv7 includes timestamp — sortable and traceable in logs
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifies which agent instance handles a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(name: &str) -> Self {
        Self(name.to_string())
    }

    /// The default single-agent setup uses "main".
    pub fn main() -> Self {
        Self("main".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// User-centric session key.
///
/// Breaking change from OpenClaw: sessions belong to users, not channels.
/// Format: `user:{user_id}:agent:{agent_id}:{session_name}`
///
/// Alice on Telegram + Alice on Discord = same session `user:u2:agent:main:main`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey(pub String);

impl SessionKey {
    pub fn for_user(user_id: &UserId, agent_id: &AgentId, session: &str) -> Self {
        Self(format!("user:{}:agent:{}:{}", user_id, agent_id, session))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a chat/conversation with a remote platform.
///
/// Canonical string form is `"<platform>:<native_id>"`, e.g. `"telegram:8821"`
/// or `"discord:913482"`. Used as the primary key for queued messages,
/// sandbox instances, and per-chat pipeline state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatId(pub String);

impl ChatId {
    pub fn new(platform: &str, native_id: &str) -> Self {
        Self(format!("{platform}:{native_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits the canonical form back into `(platform, native_id)`.
    pub fn parse(s: &str) -> Option<(&str, &str)> {
        s.split_once(':')
    }

    pub fn platform(&self) -> Option<&str> {
        Self::parse(&self.0).map(|(p, _)| p)
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ChatId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A message to deliver on a connected channel adapter, independent of
/// who originated it (another channel, the IPC dispatcher, a scheduled
/// job). Carried over each adapter's registered outbound mpsc sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelOutbound {
    /// Platform-native recipient id (e.g. a Telegram chat id, a Discord
    /// channel id) — adapter-specific parsing happens on the receiving end.
    pub recipient: String,
    pub message: String,
}

/// A group (workspace) folder name — the unit of sandbox/memory isolation.
///
/// Must match `^[a-z0-9][a-z0-9_-]{0,63}$`. The group named `"main"` carries
/// elevated, admin-like privileges (mirrors [`UserRole::Admin`] at the group
/// level rather than the user level).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupFolder(pub String);

impl GroupFolder {
    pub const MAIN: &'static str = "main";

    pub fn parse(s: &str) -> std::result::Result<Self, String> {
        let valid_len = !s.is_empty() && s.len() <= 64;
        let mut chars = s.chars();
        let first_ok = chars
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
        let rest_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
        if valid_len && first_ok && rest_ok {
            Ok(Self(s.to_string()))
        } else {
            Err(format!("invalid group folder name: {s:?}"))
        }
    }

    pub fn main() -> Self {
        Self(Self::MAIN.to_string())
    }

    pub fn is_main(&self) -> bool {
        self.0 == Self::MAIN
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupFolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-connection identifier (random UUID, not persisted).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnId(pub String);

impl ConnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// User role hierarchy: admin > user > child.
///
/// Controls which permissions are available without a DB lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    #[default]
    User,
    Child,
}

impl UserRole {
    pub fn is_admin(&self) -> bool {
        matches!(self, UserRole::Admin)
    }

    pub fn is_child(&self) -> bool {
        matches!(self, UserRole::Child)
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserRole::Admin => write!(f, "admin"),
            UserRole::User => write!(f, "user"),
            UserRole::Child => write!(f, "child"),
        }
    }
}

impl std::str::FromStr for UserRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "admin" => Ok(UserRole::Admin),
            "user" => Ok(UserRole::User),
            "child" => Ok(UserRole::Child),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

#[cfg(test)]
mod folder_tests {
    use super::*;

    #[test]
    fn group_folder_accepts_simple_names() {
        assert!(GroupFolder::parse("main").is_ok());
        assert!(GroupFolder::parse("team-2_b").is_ok());
    }

    #[test]
    fn group_folder_rejects_uppercase_and_empty() {
        assert!(GroupFolder::parse("Main").is_err());
        assert!(GroupFolder::parse("").is_err());
        assert!(GroupFolder::parse("-leads").is_err());
    }

    #[test]
    fn chat_id_roundtrips_platform_and_native_id() {
        let id = ChatId::new("telegram", "8821");
        assert_eq!(id.as_str(), "telegram:8821");
        assert_eq!(id.platform(), Some("telegram"));
        assert_eq!(ChatId::parse("discord:913482"), Some(("discord", "913482")));
    }
}
