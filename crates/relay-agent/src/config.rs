//! Environment-driven runtime configuration (spec §6's closed env-var set).
//!
//! Grounded in the teacher's `interpolate_env_vars`/`Config::load` pattern of
//! reading a handful of named environment variables with sane defaults,
//! trimmed to exactly the inputs this core consumes — provider credentials
//! are read by each adapter directly (spec §6), not funneled through here.

use std::time::Duration;

const DEFAULT_TOOL_EXECUTION_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DEFAULT_MCP_CACHE_TTL_MINUTES: u64 = 30;
const DEFAULT_MAIN_LLM_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// `TOOL_EXECUTION_TIMEOUT` — per-call dispatch timeout (C6).
    pub tool_execution_timeout: Duration,
    /// `MCP_CACHE_TTL_MINUTES` — cache-entry freshness horizon (C2).
    pub mcp_cache_ttl_minutes: u64,
    /// `ORCHESTRATOR_MAIN_LLM_MAX_TOKENS` — default `max_tokens` for
    /// non-structured calls (C9).
    pub orchestrator_main_llm_max_tokens: u32,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self {
            tool_execution_timeout: std::env::var("TOOL_EXECUTION_TIMEOUT")
                .ok()
                .and_then(|s| parse_duration(&s))
                .unwrap_or(DEFAULT_TOOL_EXECUTION_TIMEOUT),
            mcp_cache_ttl_minutes: std::env::var("MCP_CACHE_TTL_MINUTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MCP_CACHE_TTL_MINUTES),
            orchestrator_main_llm_max_tokens: std::env::var("ORCHESTRATOR_MAIN_LLM_MAX_TOKENS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAIN_LLM_MAX_TOKENS),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tool_execution_timeout: DEFAULT_TOOL_EXECUTION_TIMEOUT,
            mcp_cache_ttl_minutes: DEFAULT_MCP_CACHE_TTL_MINUTES,
            orchestrator_main_llm_max_tokens: DEFAULT_MAIN_LLM_MAX_TOKENS,
        }
    }
}

/// Parses Go-style duration strings (`"5m"`, `"30s"`, `"1h30m"`) as used by
/// `TOOL_EXECUTION_TIMEOUT`. Falls back to treating a bare number as seconds.
fn parse_duration(raw: &str) -> Option<Duration> {
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();
    for ch in raw.chars() {
        if ch.is_ascii_digit() || ch == '.' {
            digits.push(ch);
            continue;
        }
        let value: f64 = digits.parse().ok()?;
        digits.clear();
        let unit_secs = match ch {
            'h' => 3600.0,
            'm' => 60.0,
            's' => 1.0,
            _ => return None,
        };
        total += Duration::from_secs_f64(value * unit_secs);
    }
    if !digits.is_empty() {
        return None;
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_seconds() {
        assert_eq!(parse_duration("45"), Some(Duration::from_secs(45)));
    }

    #[test]
    fn parses_minute_suffix() {
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
    }

    #[test]
    fn parses_compound_duration() {
        assert_eq!(parse_duration("1h30m"), Some(Duration::from_secs(5400)));
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert_eq!(parse_duration("5mx"), None);
    }

    #[test]
    fn defaults_are_applied_without_env() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.mcp_cache_ttl_minutes, DEFAULT_MCP_CACHE_TTL_MINUTES);
    }
}
