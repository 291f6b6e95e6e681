//! Prompt context record, the `act` function schema and argument repair
//!
//! Every prompt section is a named field of [`PromptContext`]; the record is
//! serialized once, at the boundary, in field order.

use crate::completion::{FunctionDef, ToolCall};
use crate::types::{Action, ActionKind};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const ACT_FUNCTION: &str = "act";

/// An action as shown to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionView {
    pub kind: ActionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub result: String,
}

impl From<&Action> for ActionView {
    fn from(action: &Action) -> Self {
        Self {
            kind: action.payload.kind,
            query: action.payload.query.clone(),
            note: action.payload.note.clone(),
            result: action.payload.result.clone(),
        }
    }
}

/// Everything one loop iteration shows the model
#[derive(Debug, Clone, Default, Serialize)]
pub struct PromptContext {
    /// Knowledge lookups and search snippets (recursive calls only)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub knowledge: Vec<String>,
    /// Persisted actions at this recursion level, oldest first
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub action_history: Vec<ActionView>,
    /// Results gathered in this loop, most recent first
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub action_results: Vec<ActionView>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub long_term_memory: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub short_term_memory: Vec<String>,
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recursed_query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recursed_note: Option<String>,
}

const PREAMBLE: &str = "You are the reasoning core of a conversational assistant with a layered memory \
of past conversations. Long-term memory holds summaries and reflections; short-term memory holds \
recent exchanges.";

impl PromptContext {
    /// Render the single system message for one iteration
    pub fn render(&self, final_turn: bool) -> String {
        let mut out = String::from(PREAMBLE);
        out.push_str("\n\n");

        if self.recursed_query.is_some() {
            out.push_str(
                "You are working on a sub-question raised while answering the user's query. \
                 Answer the sub-question concisely; it will be used by the caller, not shown to the user.\n",
            );
        }

        if final_turn {
            out.push_str("Write your final answer now as plain text. Do not call any function.\n");
        } else {
            out.push_str(&format!(
                "Answer directly as plain text when you can. Otherwise call `{ACT_FUNCTION}`: \
                 `think` to reason about a sub-question, `research` to look something up, \
                 or `reply` with the answer in `note` when you are done. \
                 Do not repeat actions listed in the context.\n"
            ));
        }

        out.push_str("\nContext:\n");
        // Struct serialization cannot fail: every field is a string, list or enum
        out.push_str(&serde_json::to_string_pretty(self).unwrap_or_default());
        out
    }
}

/// Schema of the single `act` function
pub fn act_function() -> FunctionDef {
    let kinds: Vec<&str> = ActionKind::ALL.iter().map(|k| k.as_str()).collect();
    FunctionDef {
        name: ACT_FUNCTION.to_string(),
        description: "Take one internal step before answering.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "kind": {
                    "type": "string",
                    "enum": kinds,
                    "description": "think: reason about `query`; research: look up `query`; reply: answer with `note`"
                },
                "query": {
                    "type": "string",
                    "description": "Sub-question for think or research"
                },
                "note": {
                    "type": "string",
                    "description": "Context for the sub-question, or the answer for reply"
                }
            },
            "required": ["kind"]
        }),
    }
}

/// A function call after repair and validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionCall {
    pub kind: ActionKind,
    pub query: Option<String>,
    pub note: Option<String>,
    /// Names of the repair rules that changed the arguments
    pub repairs: Vec<&'static str>,
}

impl ActionCall {
    /// Identity used for de-duplication
    pub fn signature(&self) -> (ActionKind, String, String) {
        (
            self.kind,
            normalize(self.query.as_deref().unwrap_or_default()),
            normalize(self.note.as_deref().unwrap_or_default()),
        )
    }
}

pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// A named fix for malformed arguments
pub struct RepairRule {
    pub name: &'static str,
    apply: fn(&str, &mut Map<String, Value>) -> bool,
}

/// Applied in order; each sees the output of the previous one
pub const REPAIR_RULES: &[RepairRule] = &[
    RepairRule {
        name: "tool-name-as-kind",
        apply: tool_name_as_kind,
    },
    RepairRule {
        name: "query-suffix",
        apply: query_suffix,
    },
    RepairRule {
        name: "note-alias",
        apply: note_alias,
    },
];

/// `{"name": "think", "arguments": {...}}` without `kind`: the tool name is the kind
fn tool_name_as_kind(tool_name: &str, args: &mut Map<String, Value>) -> bool {
    if args.get("kind").and_then(Value::as_str).and_then(ActionKind::parse).is_some() {
        return false;
    }
    match ActionKind::parse(tool_name) {
        Some(kind) => {
            args.insert("kind".into(), json!(kind.as_str()));
            true
        }
        None => false,
    }
}

/// No `query`, but a key like `subQuery` or `search_query`: take the first such key
/// in sorted key order
fn query_suffix(_: &str, args: &mut Map<String, Value>) -> bool {
    if args.get("query").and_then(Value::as_str).is_some() {
        return false;
    }
    let mut keys: Vec<&String> = args
        .keys()
        .filter(|k| k.as_str() != "query" && (k.ends_with("Query") || k.ends_with("_query")))
        .collect();
    keys.sort();
    let Some(key) = keys.first().map(|k| k.to_string()) else {
        return false;
    };
    match args.remove(&key) {
        Some(Value::String(query)) => {
            args.insert("query".into(), Value::String(query));
            true
        }
        Some(other) => {
            args.insert(key, other);
            false
        }
        None => false,
    }
}

const NOTE_ALIASES: &[&str] = &["reply", "answer", "content", "text", "message"];

/// No `note`, but one of the common aliases
fn note_alias(_: &str, args: &mut Map<String, Value>) -> bool {
    if args.get("note").and_then(Value::as_str).is_some() {
        return false;
    }
    for alias in NOTE_ALIASES {
        if let Some(Value::String(note)) = args.get(*alias) {
            let note = note.clone();
            args.insert("note".into(), Value::String(note));
            return true;
        }
    }
    false
}

fn non_empty(args: &Map<String, Value>, key: &str) -> Option<String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Repair and validate one tool call. `Err` explains why it was dropped.
pub fn parse_action_call(call: &ToolCall) -> Result<ActionCall, String> {
    let mut args = if call.arguments.trim().is_empty() {
        Map::new()
    } else {
        match serde_json::from_str::<Value>(&call.arguments) {
            Ok(Value::Object(map)) => map,
            Ok(other) => return Err(format!("arguments are not an object: {other}")),
            Err(e) => return Err(format!("arguments are not JSON: {e}")),
        }
    };

    let repairs: Vec<&'static str> = REPAIR_RULES
        .iter()
        .filter_map(|rule| (rule.apply)(&call.name, &mut args).then_some(rule.name))
        .collect();

    let kind = args
        .get("kind")
        .and_then(Value::as_str)
        .and_then(ActionKind::parse)
        .ok_or_else(|| format!("call `{}` has no valid kind", call.name))?;
    let query = non_empty(&args, "query");
    let note = non_empty(&args, "note");

    match kind {
        ActionKind::Think | ActionKind::Research if query.is_none() => {
            Err(format!("{kind} call is missing query"))
        }
        ActionKind::Reply if note.is_none() => Err("reply call is missing note".to_string()),
        _ => Ok(ActionCall {
            kind,
            query,
            note,
            repairs,
        }),
    }
}
