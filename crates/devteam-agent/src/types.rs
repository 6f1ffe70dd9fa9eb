//! Messages emitted by `claude --output-format=stream-json`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Top-level message from Claude Code CLI stdout.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeMessage {
    /// System initialization message.
    System {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },

    /// Assistant turn.
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: Option<String>,
    },

    /// User turn (tool results echoed back).
    User {
        #[serde(default)]
        session_id: Option<String>,
    },

    /// Final execution result.
    Result {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default, alias = "isError")]
        is_error: Option<bool>,
        #[serde(default, alias = "durationMs")]
        duration_ms: Option<u64>,
        #[serde(default)]
        num_turns: Option<u32>,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default, alias = "sessionId")]
        session_id: Option<String>,
    },

    /// Unknown message type (fallback).
    #[serde(untagged)]
    Unknown(Value),
}

impl ClaudeMessage {
    /// Extract session ID from any message type.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::System { session_id, .. }
            | Self::Assistant { session_id, .. }
            | Self::User { session_id }
            | Self::Result { session_id, .. } => session_id.as_deref(),
            Self::Unknown(_) => None,
        }
    }
}

/// Assistant message content.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentItem>,
}

impl AssistantMessage {
    /// Concatenated text blocks of this turn.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|item| match item {
                ContentItem::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Content item in an assistant message.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentItem {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    /// Any block type this crate does not inspect.
    #[serde(other)]
    Other,
}

/// Permission mode for Claude Code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    /// Asks for permission; non-interactive runs will be denied edits.
    #[default]
    Default,
    /// Accept file edits automatically.
    AcceptEdits,
    /// Plan mode.
    Plan,
    /// Bypass all permissions (dangerous).
    BypassPermissions,
}

impl PermissionMode {
    /// Value for the CLI's `--permission-mode` flag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::Plan => "plan",
            Self::BypassPermissions => "bypassPermissions",
        }
    }
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PermissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "acceptEdits" | "accept-edits" => Ok(Self::AcceptEdits),
            "plan" => Ok(Self::Plan),
            "bypassPermissions" | "bypass-permissions" => Ok(Self::BypassPermissions),
            other => Err(format!("unknown permission mode '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_message_parsing() {
        let json = r#"{"type":"system","subtype":"init","session_id":"abc","model":"sonnet","tools":[]}"#;
        let msg: ClaudeMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.session_id(), Some("abc"));
        assert!(matches!(msg, ClaudeMessage::System { .. }));
    }

    #[test]
    fn test_assistant_text_skips_tool_blocks() {
        let json = r#"{"type":"assistant","session_id":"abc","message":{"role":"assistant","content":[
            {"type":"text","text":"Plan: "},
            {"type":"tool_use","id":"t1","name":"Bash","input":{"command":"ls"}},
            {"type":"server_tool_use","id":"t2"},
            {"type":"text","text":"done"}
        ]}}"#;
        let msg: ClaudeMessage = serde_json::from_str(json).unwrap();
        let ClaudeMessage::Assistant { message, .. } = msg else {
            panic!("expected assistant message");
        };
        assert_eq!(message.text(), "Plan: done");
        assert_eq!(message.content.len(), 4);
    }

    #[test]
    fn test_result_message_parsing() {
        let json = r#"{"type":"result","subtype":"success","is_error":false,"duration_ms":1200,"num_turns":3,"result":"All tests pass","session_id":"abc"}"#;
        let msg: ClaudeMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClaudeMessage::Result {
                is_error,
                result,
                num_turns,
                ..
            } => {
                assert_eq!(is_error, Some(false));
                assert_eq!(result, Some(Value::String("All tests pass".into())));
                assert_eq!(num_turns, Some(3));
            }
            other => panic!("expected result, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_message_falls_back() {
        let msg: ClaudeMessage = serde_json::from_str(r#"{"type":"rate_limit","retry":5}"#).unwrap();
        assert!(matches!(msg, ClaudeMessage::Unknown(_)));
        assert_eq!(msg.session_id(), None);
    }

    #[test]
    fn test_permission_mode_round_trip() {
        assert_eq!(PermissionMode::AcceptEdits.to_string(), "acceptEdits");
        assert_eq!(
            "bypass-permissions".parse::<PermissionMode>().unwrap(),
            PermissionMode::BypassPermissions
        );
        assert!("yolo".parse::<PermissionMode>().is_err());
    }
}
