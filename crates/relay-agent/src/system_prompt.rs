//! System-prompt builder (C8, spec §4.8).
//!
//! No teacher file assembles a prompt from discovered prompts/resources this
//! way; grounded in the teacher's `mcp::cache`-adjacent `derive_system_prompt_fragment`
//! idiom (one line per server, reused here as an optional/build-up Builder)
//! and composed over `relay_core::mcp::cache::GetOrBuildResult`.

use relay_core::mcp::cache::GetOrBuildResult;

/// Behavioural mode the assembled prompt instructs the model to follow
/// (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMode {
    Simple,
    ReAct,
}

#[derive(Debug, Clone)]
pub struct DiscoveryToggles {
    pub discover_resource: bool,
    pub discover_prompt: bool,
}

impl Default for DiscoveryToggles {
    fn default() -> Self {
        Self {
            discover_resource: true,
            discover_prompt: true,
        }
    }
}

const VIRTUAL_TOOLS: &[(&str, &str)] = &[
    ("get_prompt", "Fetch a named prompt discovered from a tool server."),
    ("get_resource", "Fetch a named resource discovered from a tool server."),
    ("read_large_output", "Read a slice of a tool result that was too large to inline."),
    ("search_large_output", "Search a spilled tool result by regex pattern."),
    ("query_large_output", "Query a spilled JSON tool result by dot-path."),
];

/// Builds the system prompt from discovered servers and behavioural
/// settings, or passes through a caller-supplied custom prompt unchanged
/// (spec §4.8: "the custom flag disables regeneration").
pub fn build_system_prompt(
    discovered: &GetOrBuildResult,
    mode: AgentMode,
    toggles: &DiscoveryToggles,
    custom_system_prompt: Option<&str>,
) -> String {
    if let Some(custom) = custom_system_prompt {
        return custom.to_string();
    }

    let mut sections = Vec::new();

    sections.push(base_instructions(mode));
    sections.push(virtual_tools_section());

    if toggles.discover_prompt {
        if let Some(section) = prompts_section(discovered) {
            sections.push(section);
        }
    }
    if toggles.discover_resource {
        if let Some(section) = resources_section(discovered) {
            sections.push(section);
        }
    }

    sections.join("\n\n")
}

fn base_instructions(mode: AgentMode) -> String {
    match mode {
        AgentMode::Simple => {
            "You are a helpful assistant. Call tools when they help answer the user's \
             question, then respond directly once you have what you need."
                .to_string()
        }
        AgentMode::ReAct => {
            "You are a helpful assistant that reasons step by step. Before each tool \
             call, briefly state what you intend to learn from it; after observing the \
             result, decide whether another tool call is needed or you can answer."
                .to_string()
        }
    }
}

fn virtual_tools_section() -> String {
    let lines: Vec<String> = VIRTUAL_TOOLS
        .iter()
        .map(|(name, desc)| format!("- `{name}`: {desc}"))
        .collect();
    format!("Available virtual tools:\n{}", lines.join("\n"))
}

fn prompts_section(discovered: &GetOrBuildResult) -> Option<String> {
    let mut lines = Vec::new();
    for (server, entry) in &discovered.entries {
        for name in &entry.prompts {
            lines.push(format!("- ({server}, {name})"));
        }
    }
    if lines.is_empty() {
        return None;
    }
    Some(format!("Discovered prompts:\n{}", lines.join("\n")))
}

fn resources_section(discovered: &GetOrBuildResult) -> Option<String> {
    let mut lines = Vec::new();
    for (server, entry) in &discovered.entries {
        for uri in &entry.resources {
            lines.push(format!("- ({server}, {uri})"));
        }
    }
    if lines.is_empty() {
        return None;
    }
    Some(format!("Discovered resources:\n{}", lines.join("\n")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn empty_discovery() -> GetOrBuildResult {
        GetOrBuildResult {
            entries: HashMap::new(),
            failures: Vec::new(),
        }
    }

    #[test]
    fn custom_prompt_disables_regeneration() {
        let prompt = build_system_prompt(
            &empty_discovery(),
            AgentMode::Simple,
            &DiscoveryToggles::default(),
            Some("be terse"),
        );
        assert_eq!(prompt, "be terse");
    }

    #[test]
    fn generated_prompt_lists_virtual_tools() {
        let prompt = build_system_prompt(&empty_discovery(), AgentMode::Simple, &DiscoveryToggles::default(), None);
        assert!(prompt.contains("read_large_output"));
    }

    #[test]
    fn suppresses_sections_when_toggles_are_off() {
        let toggles = DiscoveryToggles {
            discover_resource: false,
            discover_prompt: false,
        };
        let prompt = build_system_prompt(&empty_discovery(), AgentMode::ReAct, &toggles, None);
        assert!(!prompt.contains("Discovered prompts"));
        assert!(!prompt.contains("Discovered resources"));
    }
}
