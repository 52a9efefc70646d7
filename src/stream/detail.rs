//! Short, human-readable summaries of tool call inputs.

use serde_json::Value;

/// Maximum characters of a shell command kept in a detail line.
pub const SHELL_DETAIL_CHARS: usize = 80;
/// Maximum characters of a fallback detail line.
pub const FALLBACK_DETAIL_CHARS: usize = 60;

const SHELL_TOOLS: &[&str] = &["Bash", "bash", "shell", "exec", "run_shell_command", "command"];
const PATH_TOOLS: &[&str] = &[
    "Read",
    "Write",
    "Edit",
    "MultiEdit",
    "NotebookEdit",
    "LS",
    "read_file",
    "write_file",
    "edit_file",
    "list_directory",
];
const SEARCH_TOOLS: &[&str] = &["Grep", "Glob", "grep", "glob", "search_file_content"];

/// Summarize a tool call for display.
///
/// Shell commands are cut to [`SHELL_DETAIL_CHARS`] plus `...`, so a detail
/// is never longer than 83 characters for shell tools.
pub fn tool_detail(name: &str, input: &Value) -> String {
    if SHELL_TOOLS.contains(&name) {
        return truncate_chars(&shell_command(input), SHELL_DETAIL_CHARS);
    }
    if PATH_TOOLS.contains(&name) {
        if let Some(path) = first_str(input, &["file_path", "path", "notebook_path"]) {
            return path.to_string();
        }
    }
    if SEARCH_TOOLS.contains(&name) {
        if let Some(pattern) = first_str(input, &["pattern", "query"]) {
            return match first_str(input, &["path"]) {
                Some(path) => format!("pattern=\"{}\" in {}", pattern, path),
                None => format!("pattern=\"{}\"", pattern),
            };
        }
    }
    if let Some(description) = first_str(input, &["description"]) {
        return description.to_string();
    }
    fallback(input)
}

fn shell_command(input: &Value) -> String {
    let command = match input {
        Value::String(s) => return s.clone(),
        Value::Object(map) => map.get("command").or_else(|| map.get("cmd")),
        _ => None,
    };
    match command {
        Some(Value::String(s)) => s.clone(),
        // argv form, e.g. ["bash", "-lc", "ls"]
        Some(Value::Array(parts)) => parts
            .iter()
            .map(|p| p.as_str().map(String::from).unwrap_or_else(|| p.to_string()))
            .collect::<Vec<_>>()
            .join(" "),
        Some(other) => other.to_string(),
        None => fallback(input),
    }
}

fn first_str<'a>(input: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| input.get(*k).and_then(Value::as_str))
        .find(|s| !s.is_empty())
}

fn fallback(input: &Value) -> String {
    match input {
        Value::Null => String::new(),
        Value::String(s) => truncate_chars(s, FALLBACK_DETAIL_CHARS),
        other => truncate_chars(&other.to_string(), FALLBACK_DETAIL_CHARS),
    }
}

/// Cut `s` to `max` characters, appending `...` when anything was removed.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &s[..cut]),
        None => s.to_string(),
    }
}
