//! Hook payloads: JSON in on stdin, JSON out on stdout
//!
//! Reads fail open (malformed input gives `[]` and exit 0); writes fail
//! closed with a non-zero exit code.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use tracing::{error, warn};

use crate::config::Config;
use crate::ingest::MemoryWriter;
use crate::memory::{timestamp, NewMemory};
use crate::retrieval::{ContextAssembler, RetrievedMemory};

/// Exit code for a successful hook
pub const EXIT_OK: u8 = 0;
/// Exit code when the write failed downstream
pub const EXIT_FAILURE: u8 = 1;
/// Exit code when the write payload was unusable
pub const EXIT_INVALID_INPUT: u8 = 2;

/// What the process should print and return
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookResponse {
    pub stdout: String,
    pub exit_code: u8,
}

impl HookResponse {
    fn ok(stdout: String) -> Self {
        Self {
            stdout,
            exit_code: EXIT_OK,
        }
    }

    fn empty() -> Self {
        Self::ok("[]".to_string())
    }
}

/// Payload of the retrieval hook
#[derive(Debug, Default, Deserialize)]
pub struct ReadHookInput {
    #[serde(default, alias = "user_prompt", alias = "query", alias = "task")]
    pub prompt: Option<String>,

    #[serde(default)]
    pub agent_id: Option<String>,

    #[serde(default, deserialize_with = "lenient")]
    pub max_memories: Option<usize>,

    #[serde(default, deserialize_with = "lenient")]
    pub include_recent: Option<bool>,

    #[serde(default, deserialize_with = "lenient")]
    pub recent_hours: Option<u32>,
}

/// Read an optional setting, accepting values quoted as strings. A value
/// that still does not fit is dropped so the default applies.
fn lenient<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    if value.is_null() {
        return Ok(None);
    }

    let parsed = match &value {
        serde_json::Value::String(s) => serde_json::from_str(s.trim()).ok(),
        other => serde_json::from_value(other.clone()).ok(),
    };
    if parsed.is_none() {
        warn!(value = %value, "Ignoring invalid hook setting");
    }
    Ok(parsed)
}

/// Payload of the ingestion hook
#[derive(Debug, Default, Deserialize)]
pub struct WriteHookInput {
    #[serde(default)]
    pub agent_id: Option<String>,

    #[serde(default)]
    pub task_type: Option<String>,

    #[serde(default, alias = "content", alias = "output", alias = "summary")]
    pub context_content: Option<String>,

    #[serde(default)]
    pub raw_data: serde_json::Value,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub task_timestamp: Option<String>,
}

/// Retrieval parameters used when the hook input leaves them out
#[derive(Debug, Clone)]
pub struct HookDefaults {
    pub agent_id: String,
    pub task_type: String,
    pub max_memories: usize,
    pub include_recent: bool,
    pub recent_hours: u32,
}

impl From<&Config> for HookDefaults {
    fn from(config: &Config) -> Self {
        Self {
            agent_id: config.default_agent_id.clone(),
            task_type: "task_output".to_string(),
            max_memories: config.max_memories,
            include_recent: config.include_recent,
            recent_hours: config.recent_hours,
        }
    }
}

#[derive(Serialize)]
struct ContextOutput<'a> {
    context: &'a str,
    memories: &'a [RetrievedMemory],
}

/// Parse the whole input as one JSON object, or failing that the first line
/// that is one
pub fn parse_input<T: DeserializeOwned>(raw: &str) -> Option<T> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    trimmed
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .find_map(|line| serde_json::from_str(line).ok())
}

/// Run the retrieval hook on raw stdin content
pub async fn read_hook(
    assembler: &ContextAssembler,
    defaults: &HookDefaults,
    raw_input: &str,
    with_context: bool,
) -> HookResponse {
    let Some(input) = parse_input::<ReadHookInput>(raw_input) else {
        warn!("Missing or malformed hook input");
        return HookResponse::empty();
    };

    let prompt = match input.prompt.as_deref().map(str::trim) {
        Some(p) if !p.is_empty() => p,
        _ => return HookResponse::empty(),
    };

    let agent_id = input.agent_id.as_deref().unwrap_or(&defaults.agent_id);
    let bundle = assembler
        .assemble(
            prompt,
            agent_id,
            input.max_memories.unwrap_or(defaults.max_memories),
            input.include_recent.unwrap_or(defaults.include_recent),
            input.recent_hours.unwrap_or(defaults.recent_hours),
        )
        .await;

    let rendered = if with_context {
        serde_json::to_string(&ContextOutput {
            context: &bundle.formatted,
            memories: &bundle.memories,
        })
    } else {
        serde_json::to_string(&bundle.memories)
    };

    match rendered {
        Ok(stdout) => HookResponse::ok(stdout),
        Err(e) => {
            error!(error = %e, "Failed to serialize memories");
            HookResponse::empty()
        }
    }
}

/// Error payload for a failed write, logged to stderr as well
pub fn failure(exit_code: u8, message: &str) -> HookResponse {
    error!(exit_code, "{}", message);
    HookResponse {
        stdout: json!({ "status": "error", "error": message }).to_string(),
        exit_code,
    }
}

/// Run the ingestion hook on raw stdin content
pub async fn write_hook(
    writer: &MemoryWriter,
    defaults: &HookDefaults,
    raw_input: &str,
) -> HookResponse {
    let Some(input) = parse_input::<WriteHookInput>(raw_input) else {
        return failure(EXIT_INVALID_INPUT, "Missing or malformed hook input");
    };

    let Some(content) = input.context_content.filter(|c| !c.trim().is_empty()) else {
        return failure(EXIT_INVALID_INPUT, "Hook input has no content to store");
    };

    let mut memory = NewMemory::new(
        input.agent_id.unwrap_or_else(|| defaults.agent_id.clone()),
        input.task_type.unwrap_or_else(|| defaults.task_type.clone()),
        content,
    )
    .with_tags(input.tags)
    .with_raw_data(input.raw_data);

    if let Some(ts) = input.task_timestamp {
        match timestamp::parse(&ts) {
            Some(parsed) => memory = memory.with_timestamp(parsed),
            None => return failure(EXIT_INVALID_INPUT, &format!("Invalid task_timestamp: {}", ts)),
        }
    }

    match writer.ingest(&memory).await {
        Ok(outcome) => match serde_json::to_string(&outcome) {
            Ok(stdout) => HookResponse::ok(stdout),
            Err(e) => failure(EXIT_FAILURE, &format!("Failed to serialize result: {}", e)),
        },
        Err(e) if e.is_invalid_input() => failure(EXIT_INVALID_INPUT, &e.to_string()),
        Err(e) => failure(EXIT_FAILURE, &e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_whole_stream_or_first_json_line() {
        let whole: ReadHookInput = parse_input("{\"prompt\": \"fix auth\"}").unwrap();
        assert_eq!(whole.prompt.as_deref(), Some("fix auth"));

        let raw = "garbage\n{\"user_prompt\": \"tune queries\", \"agent_id\": \"x\"}\n";
        let lines: ReadHookInput = parse_input(raw).unwrap();
        assert_eq!(lines.prompt.as_deref(), Some("tune queries"));
        assert_eq!(lines.agent_id.as_deref(), Some("x"));

        assert!(parse_input::<ReadHookInput>("   ").is_none());
        assert!(parse_input::<ReadHookInput>("not json at all").is_none());
    }

    #[test]
    fn invalid_settings_are_dropped_individually() {
        let raw = r#"{"prompt": "auth", "max_memories": "3", "recent_hours": -1,
                      "include_recent": "no"}"#;
        let input: ReadHookInput = parse_input(raw).unwrap();
        assert_eq!(input.prompt.as_deref(), Some("auth"));
        assert_eq!(input.max_memories, Some(3));
        assert_eq!(input.recent_hours, None);
        assert_eq!(input.include_recent, None);

        let input: ReadHookInput =
            parse_input(r#"{"prompt": "auth", "include_recent": "false", "max_memories": null}"#)
                .unwrap();
        assert_eq!(input.include_recent, Some(false));
        assert_eq!(input.max_memories, None);
    }

    #[test]
    fn write_input_accepts_content_aliases() {
        let raw = r#"{"output": "done", "tags": ["db"], "raw_data": {"k": 1}}"#;
        let input: WriteHookInput = parse_input(raw).unwrap();
        assert_eq!(input.context_content.as_deref(), Some("done"));
        assert_eq!(input.tags, vec!["db".to_string()]);
        assert_eq!(input.raw_data["k"], 1);
    }
}
