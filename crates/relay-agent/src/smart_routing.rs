//! Smart-routing filter (C10, spec §4.10).
//!
//! No teacher file implements a tool-shortlisting pass; grounded in
//! `relay_core::llm::dispatch::Dispatcher::generate_with_retry` for issuing
//! the shortlisting call itself (a low-temperature, tool-free `generate`),
//! reusing the same adapter/model the conversation is already using.

use relay_core::llm::dispatch::Dispatcher;
use relay_core::message::{Conversation, Message};
use relay_core::{GenerateOptions, ToolDescriptor};

const RECENT_MESSAGE_COUNT: usize = 6;
const MESSAGE_CHAR_LIMIT: usize = 400;
const SHORTLIST_TEMPERATURE: f32 = 0.0;

#[derive(Debug, Clone)]
pub struct SmartRoutingConfig {
    pub enabled: bool,
    pub max_tools: usize,
    pub max_servers: usize,
}

impl Default for SmartRoutingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_tools: 40,
            max_servers: 8,
        }
    }
}

impl SmartRoutingConfig {
    /// Spec §4.10: activated only if all three conditions hold.
    pub fn should_activate(&self, tool_count: usize, server_count: usize) -> bool {
        self.enabled && tool_count > self.max_tools && server_count > self.max_servers
    }
}

/// Asks a cheap, low-temperature LLM call to shortlist which of `tools` are
/// relevant to the recent conversation. Falls back to the full tool set on
/// any LLM failure — smart routing must never strand the driver.
pub async fn shortlist_tools(
    dispatcher: &Dispatcher,
    recent: &Conversation,
    tools: &[ToolDescriptor],
    model: &str,
) -> Vec<ToolDescriptor> {
    let prompt = build_shortlist_prompt(recent, tools);
    let mut conversation = Conversation::new();
    conversation.push(Message::user(prompt));

    let options = GenerateOptions {
        model: model.to_string(),
        temperature: Some(SHORTLIST_TEMPERATURE),
        max_tokens: Some(512),
        json_mode: true,
        ..Default::default()
    };

    let cancel_token = tokio_util::sync::CancellationToken::new();
    let response = match dispatcher
        .generate_with_retry(&conversation, &options, &cancel_token)
        .await
    {
        Ok(resp) => resp,
        Err(_) => return tools.to_vec(),
    };

    let Some(kept_names) = parse_shortlist(&response.message.text()) else {
        return tools.to_vec();
    };

    let shortlisted: Vec<ToolDescriptor> = tools
        .iter()
        .filter(|t| kept_names.iter().any(|name| name == &t.name))
        .cloned()
        .collect();

    if shortlisted.is_empty() {
        tools.to_vec()
    } else {
        shortlisted
    }
}

fn build_shortlist_prompt(recent: &Conversation, tools: &[ToolDescriptor]) -> String {
    let recent_summary: Vec<String> = recent
        .messages
        .iter()
        .rev()
        .take(RECENT_MESSAGE_COUNT)
        .map(|m| {
            let text = m.text();
            let truncated: String = text.chars().take(MESSAGE_CHAR_LIMIT).collect();
            format!("{:?}: {truncated}", m.role)
        })
        .collect();

    let tool_list: Vec<String> = tools
        .iter()
        .map(|t| format!("- {}: {}", t.name, t.description))
        .collect();

    format!(
        "Given this recent conversation:\n{}\n\nAnd these available tools:\n{}\n\n\
         Respond with a JSON object {{\"tools\": [\"tool_name\", ...]}} listing only the \
         tool names relevant to continuing this conversation.",
        recent_summary.join("\n"),
        tool_list.join("\n"),
    )
}

fn parse_shortlist(text: &str) -> Option<Vec<String>> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let names = value.get("tools")?.as_array()?;
    Some(
        names
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activates_only_when_all_three_conditions_hold() {
        let cfg = SmartRoutingConfig {
            enabled: true,
            max_tools: 10,
            max_servers: 2,
        };
        assert!(cfg.should_activate(11, 3));
        assert!(!cfg.should_activate(5, 3));
        assert!(!cfg.should_activate(11, 1));
        assert!(!SmartRoutingConfig::default().should_activate(1000, 1000));
    }

    #[test]
    fn parses_well_formed_shortlist_response() {
        let parsed = parse_shortlist(r#"{"tools": ["list_files", "read_file"]}"#).unwrap();
        assert_eq!(parsed, vec!["list_files".to_string(), "read_file".to_string()]);
    }

    #[test]
    fn malformed_shortlist_response_yields_none() {
        assert!(parse_shortlist("not json").is_none());
        assert!(parse_shortlist(r#"{"other": []}"#).is_none());
    }
}
