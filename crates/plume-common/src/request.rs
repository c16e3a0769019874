use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// An inference request as submitted by a caller (chat graph, search
/// pipeline, HTTP handler). The pool never mutates the caller's copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiRequest {
    /// Logical request category (e.g. "chat", "summarize"), for logging.
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<ChatMessage>>,

    /// Provider-specific options (max_tokens, temperature, ...), passed
    /// through to the executor untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    #[serde(default)]
    pub use_privacy_mode: bool,
}

impl AiRequest {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            system_prompt: None,
            messages: None,
            options: None,
            provider: None,
            use_privacy_mode: false,
        }
    }

    pub fn with_prompt(mut self, role: &str, content: &str) -> Self {
        self.messages.get_or_insert_with(Vec::new).push(ChatMessage {
            role: role.to_string(),
            content: content.to_string(),
        });
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }
}

/// Identity of the caller submitting a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallerContext {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

impl CallerContext {
    /// Stable identity for privacy routing: authenticated user id first,
    /// session id as fallback.
    pub fn identity(&self) -> Option<&str> {
        self.user_id.as_deref().or(self.session_id.as_deref())
    }
}

/// Enrichment attached by the pool when a request completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub worker_index: usize,
    pub request_id: String,
    pub processed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiResponse {
    pub content: Option<String>,
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<Value>>,

    pub metadata: ResponseMetadata,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_prefers_user_id() {
        let ctx = CallerContext {
            user_id: Some("u1".to_string()),
            session_id: Some("s1".to_string()),
        };
        assert_eq!(ctx.identity(), Some("u1"));
    }

    #[test]
    fn identity_falls_back_to_session() {
        let ctx = CallerContext {
            user_id: None,
            session_id: Some("s1".to_string()),
        };
        assert_eq!(ctx.identity(), Some("s1"));
    }

    #[test]
    fn identity_absent_when_anonymous() {
        assert_eq!(CallerContext::default().identity(), None);
    }

    #[test]
    fn request_roundtrips_through_json() {
        let req = AiRequest::new("chat")
            .with_prompt("user", "hello")
            .with_provider("anthropic");
        let json = serde_json::to_string(&req).unwrap();
        let back: AiRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, "chat");
        assert_eq!(back.provider.as_deref(), Some("anthropic"));
        assert!(!back.use_privacy_mode);
    }
}
