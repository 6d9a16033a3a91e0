//! Conversation data model (spec §3): `Message`, `Part`, `Conversation`.

use serde::{Deserialize, Serialize};

/// Role of a participant in a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One part of a message. A message with tool calls and a message carrying
/// their results are distinct `Message`s (see `Conversation` invariants);
/// `Part` only models what can appear *within* one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text { text: String },
    ToolCall {
        id: String,
        name: String,
        arguments_json: String,
    },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        content: String,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Message {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self { role, parts }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![Part::text(text)])
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::text(text)])
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![Part::text(text)])
    }

    pub fn assistant_tool_calls(calls: Vec<Part>) -> Self {
        debug_assert!(calls.iter().all(|p| matches!(p, Part::ToolCall { .. })));
        Self::new(Role::Assistant, calls)
    }

    pub fn tool_result(tool_call_id: String, tool_name: String, content: String) -> Self {
        Self::new(
            Role::Tool,
            vec![Part::ToolResult {
                tool_call_id,
                tool_name,
                content,
            }],
        )
    }

    /// Concatenated text content of all `Text` parts, for callers that only
    /// care about the prose (e.g. the driver's final-answer return value).
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(Part::as_text)
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_calls(&self) -> Vec<(&str, &str, &str)> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::ToolCall {
                    id,
                    name,
                    arguments_json,
                } => Some((id.as_str(), name.as_str(), arguments_json.as_str())),
                _ => None,
            })
            .collect()
    }

    pub fn has_tool_calls(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, Part::ToolCall { .. }))
    }
}

/// Ordered sequence of messages with the invariants from spec §3: at most one
/// leading system message, and every `ToolResult` part trails a prior
/// `ToolCall` part with a matching id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Conversation {
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensures a system message is present, inserting `system_prompt` at the
    /// front if none exists yet. No-op if a system message already leads.
    pub fn ensure_system(&mut self, system_prompt: impl Into<String>) {
        let has_system = self
            .messages
            .first()
            .is_some_and(|m| m.role == Role::System);
        if !has_system {
            self.messages.insert(0, Message::system(system_prompt));
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn push_all(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.messages.extend(messages);
    }

    /// All outstanding `ToolCallPart` ids emitted by the most recent assistant
    /// turn that have not yet been matched by a `ToolResultPart`.
    pub fn unanswered_tool_calls(&self) -> Vec<String> {
        let mut pending: Vec<String> = Vec::new();
        for message in &self.messages {
            match message.role {
                Role::Assistant => {
                    for (id, _, _) in message.tool_calls() {
                        pending.push(id.to_string());
                    }
                }
                Role::Tool => {
                    for part in &message.parts {
                        if let Part::ToolResult { tool_call_id, .. } = part {
                            pending.retain(|id| id != tool_call_id);
                        }
                    }
                }
                _ => {}
            }
        }
        pending
    }

    pub fn last_assistant_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant && !m.text().is_empty())
            .map(|m| m.text())
    }
}
