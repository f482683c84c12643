use serde::Deserialize;
use serde_json::Value;

/// One NDJSON message from an agent run with `--output-format stream-json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    System(SystemEvent),
    Assistant(AssistantEvent),
    User(UserEvent),
    /// Emitted once at the very end.
    Result(ResultEvent),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemEvent {
    pub subtype: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantEvent {
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserEvent {
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub content: Option<Vec<ContentBlock>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolUse { name: String, input: Value },
    ToolResult { is_error: Option<bool> },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultEvent {
    pub subtype: Option<String>,
    pub result: Option<String>,
    pub is_error: Option<bool>,
    pub num_turns: Option<u64>,
    pub duration_ms: Option<u64>,
}

const MAX_LOG_CHARS: usize = 300;

fn clip(s: &str) -> String {
    let s = s.trim();
    if s.chars().count() <= MAX_LOG_CHARS {
        return s.replace('\n', " ");
    }
    let mut out: String = s.chars().take(MAX_LOG_CHARS).collect::<String>().replace('\n', " ");
    out.push('…');
    out
}

/// Summarise a tool call by its most telling argument.
fn tool_summary(name: &str, input: &Value) -> String {
    let arg = ["command", "file_path", "pattern", "path"]
        .iter()
        .find_map(|k| input.get(*k).and_then(Value::as_str));
    match arg {
        Some(a) => format!("tool {name}: {}", clip(a)),
        None => format!("tool {name}"),
    }
}

/// Render one raw output line for the per-entity log. Plain-text lines pass
/// through; JSON events become one short line each; events with nothing
/// worth logging (tool results, unknown types) yield `None`.
pub fn describe_line(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Ok(event) = serde_json::from_str::<AgentEvent>(line) else {
        return Some(clip(line));
    };
    match event {
        AgentEvent::System(e) => Some(format!(
            "session {} ({})",
            e.session_id.as_deref().unwrap_or("?"),
            e.subtype.as_deref().unwrap_or("system")
        )),
        AgentEvent::Assistant(e) => {
            let parts: Vec<String> = e
                .message
                .and_then(|m| m.content)
                .unwrap_or_default()
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } if !text.trim().is_empty() => Some(clip(text)),
                    ContentBlock::ToolUse { name, input } => Some(tool_summary(name, input)),
                    _ => None,
                })
                .collect();
            (!parts.is_empty()).then(|| parts.join(" | "))
        }
        AgentEvent::User(e) => {
            let errors = e
                .message
                .and_then(|m| m.content)
                .unwrap_or_default()
                .iter()
                .filter(|b| matches!(b, ContentBlock::ToolResult { is_error: Some(true) }))
                .count();
            (errors > 0).then(|| format!("{errors} tool error(s)"))
        }
        AgentEvent::Result(e) => Some(format!(
            "result ({}, {} turns): {}",
            e.subtype.as_deref().unwrap_or("done"),
            e.num_turns.unwrap_or(0),
            clip(e.result.as_deref().unwrap_or_default())
        )),
        AgentEvent::Unknown => None,
    }
}

/// Final output text of a stream: the result event's text, falling back to
/// the concatenated assistant text when the result was empty.
pub fn final_output(stream: &str) -> String {
    let mut output = String::new();
    let mut assistant_text = String::new();

    for line in stream.lines() {
        let Ok(event) = serde_json::from_str::<AgentEvent>(line) else {
            continue;
        };
        match event {
            AgentEvent::Assistant(e) => {
                for block in e.message.and_then(|m| m.content).unwrap_or_default() {
                    if let ContentBlock::Text { text } = block {
                        if !assistant_text.is_empty() {
                            assistant_text.push('\n');
                        }
                        assistant_text.push_str(&text);
                    }
                }
            }
            AgentEvent::Result(e) => {
                if let Some(text) = e.result {
                    output = text;
                }
            }
            _ => {}
        }
    }

    if output.is_empty() {
        output = assistant_text;
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(describe_line("  hello world  ").as_deref(), Some("hello world"));
        assert_eq!(describe_line("   "), None);
    }

    #[test]
    fn tool_use_is_summarised() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"Bash","input":{"command":"cargo test"}}]}}"#;
        assert_eq!(describe_line(line).as_deref(), Some("tool Bash: cargo test"));
    }

    #[test]
    fn tool_errors_are_counted_and_successes_skipped() {
        let err = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","is_error":true}]}}"#;
        assert_eq!(describe_line(err).as_deref(), Some("1 tool error(s)"));
        let ok = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1"}]}}"#;
        assert_eq!(describe_line(ok), None);
    }

    #[test]
    fn result_line_and_final_output() {
        let stream = concat!(
            r#"{"type":"system","subtype":"init","session_id":"s1"}"#,
            "\n",
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Looking"}]}}"#,
            "\n",
            r#"{"type":"result","subtype":"success","result":"Fixed the flaky test","num_turns":4}"#,
        );
        assert_eq!(final_output(stream), "Fixed the flaky test");
        let last = stream.lines().last().unwrap();
        assert_eq!(
            describe_line(last).as_deref(),
            Some("result (success, 4 turns): Fixed the flaky test")
        );
    }

    #[test]
    fn final_output_falls_back_to_assistant_text() {
        let stream = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"partial"}]}}"#;
        assert_eq!(final_output(stream), "partial");
    }

    #[test]
    fn unknown_event_types_are_ignored() {
        assert_eq!(describe_line(r#"{"type":"rate_limit","x":1}"#), None);
    }
}
