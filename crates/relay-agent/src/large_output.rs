//! Large-output handler (C7, spec §4.7).
//!
//! No teacher file implements this — `querymt`'s tool surface has no
//! spill-to-disk/virtual-tool layer at all. Built from the spec's prose,
//! grounded on the teacher's sandboxed-path idiom (`index/` canonicalizes
//! paths under a root before touching disk) and on `relay_core::llm::infer_provider`
//! for the model-family lookup.
//!
//! `query_large_output`'s "JSON query language (e.g. jq)" is implemented as a
//! small dot-path/array-index query directly over `serde_json::Value` rather
//! than embedding a jq engine: no crate in this workspace's dependency corpus
//! (teacher or siblings) reaches for `jaq`/`gjson`/`jql`/etc. for this, so
//! pulling one in now would be invention, not imitation. See DESIGN.md.

use crate::event_bus::EventBus;
use crate::events::EventPayload;
use regex::RegexBuilder;
use std::path::{Path, PathBuf};
use thiserror::Error;
use time::OffsetDateTime;

const DEFAULT_THRESHOLD: usize = 4_000;
const PREVIEW_LEN: usize = 100;
const TOOL_PREFIX: &str = "tool_output";

#[derive(Debug, Error)]
pub enum LargeOutputError {
    #[error("path escapes the output root: {0}")]
    PathEscape(String),
    #[error("argument contains a null byte or path traversal sequence")]
    UnsafeArgument,
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("invalid regex pattern: {0}")]
    InvalidPattern(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Per-model-family character threshold above which a tool result is spilled
/// to disk (spec §4.7). Unenumerated families fall back to `DEFAULT_THRESHOLD`.
fn threshold_for_model(model: &str) -> usize {
    match relay_core::llm::infer_provider(model) {
        "anthropic" => 8_000,
        "openai" => 6_000,
        "bedrock" => 8_000,
        "openrouter" => 4_000,
        _ => DEFAULT_THRESHOLD,
    }
}

/// Rejects null bytes and `..` path-traversal components unconditionally
/// (spec §4.7's "Argument validation" rule), independent of the sandbox
/// check that follows resolution.
fn validate_argument(raw: &str) -> Result<(), LargeOutputError> {
    if raw.contains('\0') || raw.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(LargeOutputError::UnsafeArgument);
    }
    Ok(())
}

/// Resolves `relative` (bare filename or full relative path) against
/// `output_root`, rejecting any result whose canonical form escapes the root.
fn resolve_in_root(output_root: &Path, session_id: &str, relative: &str) -> Result<PathBuf, LargeOutputError> {
    validate_argument(relative)?;
    let candidate = if relative.contains('/') || relative.contains('\\') {
        output_root.join(relative)
    } else {
        output_root.join(session_id).join(relative)
    };

    let canonical_root = output_root
        .canonicalize()
        .unwrap_or_else(|_| output_root.to_path_buf());
    let canonical = candidate
        .canonicalize()
        .map_err(|_| LargeOutputError::NotFound(candidate.display().to_string()))?;
    if !canonical.starts_with(&canonical_root) {
        return Err(LargeOutputError::PathEscape(canonical.display().to_string()));
    }
    Ok(canonical)
}

pub struct LargeOutputHandler {
    output_root: PathBuf,
}

impl LargeOutputHandler {
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
        }
    }

    /// If `result` exceeds `threshold_for_model(model)`, spills it to a
    /// sandboxed session file and returns the short replacement message.
    /// Returns `result` unchanged if it's within budget.
    pub fn maybe_spill_for_model(
        &self,
        model: &str,
        session_id: &str,
        tool: &str,
        result: &str,
        bus: &EventBus,
    ) -> Result<String, LargeOutputError> {
        if result.len() <= threshold_for_model(model) {
            return Ok(result.to_string());
        }

        let ext = if serde_json::from_str::<serde_json::Value>(result).is_ok() {
            "json"
        } else {
            "txt"
        };
        let timestamp = Self::timestamp_suffix();
        let safe_tool = sanitize_component(tool);
        let filename = format!("{TOOL_PREFIX}_{timestamp}_{safe_tool}.{ext}");

        let session_dir = self.output_root.join(session_id);
        std::fs::create_dir_all(&session_dir)?;
        let path = session_dir.join(&filename);
        std::fs::write(&path, result)?;

        let canonical_root = self
            .output_root
            .canonicalize()
            .unwrap_or_else(|_| self.output_root.clone());
        let canonical = path.canonicalize()?;
        if !canonical.starts_with(&canonical_root) {
            return Err(LargeOutputError::PathEscape(canonical.display().to_string()));
        }

        let preview: String = result.chars().take(PREVIEW_LEN).collect();
        let file_path = format!("{session_id}/{filename}");

        bus.emit(EventPayload::LargeOutputFileWritten {
            tool: tool.to_string(),
            file_path: file_path.clone(),
            size: result.len(),
            preview: preview.clone(),
        });

        Ok(format!(
            "Tool result was too large to inline ({} chars) and was written to `{file_path}`.\n\
             Preview: {preview}\n\n\
             Use `read_large_output{{filename: \"{file_path}\", start, end}}` to read a slice, \
             `search_large_output{{filename: \"{file_path}\", pattern}}` to search it, or \
             `query_large_output{{filename: \"{file_path}\", query}}` to query it as JSON.",
            result.len(),
        ))
    }

    /// `read_large_output` virtual tool: 1-based inclusive char slice.
    pub fn read(
        &self,
        session_id: &str,
        filename: &str,
        start: usize,
        end: usize,
    ) -> Result<String, LargeOutputError> {
        let path = resolve_in_root(&self.output_root, session_id, filename)?;
        let content = std::fs::read_to_string(&path)?;
        if start == 0 || end < start {
            return Ok(String::new());
        }
        let chars: Vec<char> = content.chars().collect();
        let start_idx = start - 1;
        let end_idx = end.min(chars.len());
        if start_idx >= chars.len() {
            return Ok(String::new());
        }
        Ok(chars[start_idx..end_idx].iter().collect())
    }

    /// `search_large_output` virtual tool: regex search with a small context
    /// window. "No matches" is a normal (non-error) empty result.
    pub fn search(
        &self,
        session_id: &str,
        filename: &str,
        pattern: &str,
        case_sensitive: bool,
        max_results: usize,
    ) -> Result<String, LargeOutputError> {
        validate_argument(pattern)?;
        let path = resolve_in_root(&self.output_root, session_id, filename)?;
        let content = std::fs::read_to_string(&path)?;
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(!case_sensitive)
            .build()
            .map_err(|e| LargeOutputError::InvalidPattern(e.to_string()))?;

        let lines: Vec<&str> = content.lines().collect();
        let mut hits = Vec::new();
        for (idx, line) in lines.iter().enumerate() {
            if regex.is_match(line) {
                let context_start = idx.saturating_sub(1);
                let context_end = (idx + 2).min(lines.len());
                let context = lines[context_start..context_end].join("\n");
                hits.push(format!("L{}: {}", idx + 1, context));
                if hits.len() >= max_results.max(1) {
                    break;
                }
            }
        }

        if hits.is_empty() {
            Ok("no matches".to_string())
        } else {
            Ok(hits.join("\n---\n"))
        }
    }

    /// `query_large_output` virtual tool: a minimal dot-path/array-index
    /// query over the file parsed as JSON (`.foo.bar[0].baz`). Invalid
    /// queries or non-JSON files return an error, never panic.
    pub fn query(
        &self,
        session_id: &str,
        filename: &str,
        query: &str,
        compact: bool,
    ) -> Result<String, LargeOutputError> {
        validate_argument(query)?;
        let path = resolve_in_root(&self.output_root, session_id, filename)?;
        let content = std::fs::read_to_string(&path)?;
        let value: serde_json::Value = serde_json::from_str(&content)
            .map_err(|e| LargeOutputError::InvalidQuery(format!("file is not valid JSON: {e}")))?;

        let result = query_json_path(&value, query)
            .ok_or_else(|| LargeOutputError::InvalidQuery(format!("no match for query `{query}`")))?;

        if compact {
            serde_json::to_string(result)
        } else {
            serde_json::to_string_pretty(result)
        }
        .map_err(|e| LargeOutputError::InvalidQuery(e.to_string()))
    }

    /// `YYYYMMDD_HHMMSS`, the stable file-layout contract (spec §4.7/§6).
    fn timestamp_suffix() -> String {
        let now = OffsetDateTime::now_utc();
        format!(
            "{:04}{:02}{:02}_{:02}{:02}{:02}",
            now.year(),
            now.month() as u8,
            now.day(),
            now.hour(),
            now.minute(),
            now.second()
        )
    }
}

fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

/// Resolves a dot-path query like `.items[0].name` or bare `.` (identity)
/// against a JSON value. Returns `None` on any segment that doesn't resolve.
fn query_json_path<'a>(root: &'a serde_json::Value, query: &str) -> Option<&'a serde_json::Value> {
    let trimmed = query.trim();
    if trimmed.is_empty() || trimmed == "." {
        return Some(root);
    }
    let mut current = root;
    for segment in trimmed.trim_start_matches('.').split('.') {
        if segment.is_empty() {
            continue;
        }
        let (key, indices) = parse_segment(segment);
        if !key.is_empty() {
            current = current.get(key)?;
        }
        for index in indices {
            current = current.get(index)?;
        }
    }
    Some(current)
}

/// Splits `foo[0][1]` into `("foo", [0, 1])`; a bare `[0]` yields `("", [0])`.
fn parse_segment(segment: &str) -> (&str, Vec<usize>) {
    let bracket_start = segment.find('[');
    let (key, rest) = match bracket_start {
        Some(pos) => (&segment[..pos], &segment[pos..]),
        None => (segment, ""),
    };
    let indices = rest
        .split('[')
        .filter_map(|part| part.strip_suffix(']'))
        .filter_map(|num| num.parse::<usize>().ok())
        .collect();
    (key, indices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sink::NoopTracer;
    use std::sync::Arc;

    fn handler() -> (LargeOutputHandler, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (LargeOutputHandler::new(dir.path()), dir)
    }

    #[test]
    fn small_results_pass_through_unchanged() {
        let (handler, _dir) = handler();
        let bus = EventBus::new("t", "dispatcher");
        bus.add_tracer(Arc::new(NoopTracer));
        let out = handler
            .maybe_spill_for_model("gpt-4o", "session-1", "list_files", "short", &bus)
            .unwrap();
        assert_eq!(out, "short");
    }

    #[test]
    fn oversized_results_spill_and_are_readable() {
        let (handler, _dir) = handler();
        let bus = EventBus::new("t", "dispatcher");
        bus.add_tracer(Arc::new(NoopTracer));
        let big = "x".repeat(10_000);
        let message = handler
            .maybe_spill_for_model("gpt-4o", "session-1", "list_files", &big, &bus)
            .unwrap();
        assert!(message.contains("written to"));
        assert!(message.contains("xxxx"));

        let filename = message
            .lines()
            .next()
            .unwrap()
            .split('`')
            .nth(1)
            .unwrap()
            .to_string();
        let slice = handler.read("session-1", &filename, 1, 5).unwrap();
        assert_eq!(slice, "xxxxx");

        // `tool_output_<YYYYMMDD>_<HHMMSS>_list_files.txt`
        let timestamp = filename
            .strip_prefix("tool_output_")
            .and_then(|s| s.strip_suffix("_list_files.txt"))
            .expect("filename carries the documented prefix/suffix");
        let (date, time) = timestamp.split_once('_').expect("timestamp has a date_time shape");
        assert_eq!(date.len(), 8);
        assert_eq!(time.len(), 6);
        assert!(date.chars().all(|c| c.is_ascii_digit()));
        assert!(time.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn path_traversal_is_rejected() {
        let (handler, _dir) = handler();
        let err = handler.read("session-1", "../../etc/passwd", 1, 10);
        assert!(matches!(err, Err(LargeOutputError::UnsafeArgument)));
    }

    #[test]
    fn null_byte_argument_is_rejected() {
        let (handler, _dir) = handler();
        let err = handler.read("session-1", "file\0.txt", 1, 10);
        assert!(matches!(err, Err(LargeOutputError::UnsafeArgument)));
    }

    #[test]
    fn search_with_no_matches_is_not_an_error() {
        let (handler, dir) = handler();
        let session_dir = dir.path().join("session-1");
        std::fs::create_dir_all(&session_dir).unwrap();
        std::fs::write(session_dir.join("out.txt"), "alpha\nbeta\ngamma\n").unwrap();
        let result = handler
            .search("session-1", "out.txt", "zzz_not_present", false, 10)
            .unwrap();
        assert_eq!(result, "no matches");
    }

    #[test]
    fn query_resolves_dot_path_and_index() {
        let (handler, dir) = handler();
        let session_dir = dir.path().join("session-1");
        std::fs::create_dir_all(&session_dir).unwrap();
        std::fs::write(
            session_dir.join("out.json"),
            r#"{"items": [{"name": "a"}, {"name": "b"}]}"#,
        )
        .unwrap();
        let result = handler
            .query("session-1", "out.json", ".items[1].name", true)
            .unwrap();
        assert_eq!(result, "\"b\"");
    }

    #[test]
    fn query_on_non_json_file_is_an_error_not_a_panic() {
        let (handler, dir) = handler();
        let session_dir = dir.path().join("session-1");
        std::fs::create_dir_all(&session_dir).unwrap();
        std::fs::write(session_dir.join("out.txt"), "not json").unwrap();
        let result = handler.query("session-1", "out.txt", ".foo", false);
        assert!(matches!(result, Err(LargeOutputError::InvalidQuery(_))));
    }
}
