//! Event schema shipped to the ingestion API
//!
//! Every fact the tracker records is an [`Event`]. Events serialise to camelCase
//! JSON (`runId`, `parentRunId`, `tokensUsage`, ...) and are immutable once queued.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::fmt;

/// Payload marker used in place of `input`/`output` for redacted runs
pub const NOT_INGESTED: &str = "__NOT_INGESTED__";

/// What happened to a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Start,
    End,
    Error,
    Feedback,
    Chat,
    CustomEvent,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::End => "end",
            EventKind::Error => "error",
            EventKind::Feedback => "feedback",
            EventKind::Chat => "chat",
            EventKind::CustomEvent => "custom-event",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of traced work
///
/// This is an open tag rather than a closed enum: integrations may introduce new
/// run types with [`RunType::new`] without touching the core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunType(Cow<'static, str>);

impl RunType {
    pub const LLM: RunType = RunType(Cow::Borrowed("llm"));
    pub const TOOL: RunType = RunType(Cow::Borrowed("tool"));
    pub const CHAIN: RunType = RunType(Cow::Borrowed("chain"));
    pub const AGENT: RunType = RunType(Cow::Borrowed("agent"));
    pub const RETRIEVER: RunType = RunType(Cow::Borrowed("retriever"));
    pub const EMBED: RunType = RunType(Cow::Borrowed("embed"));
    pub const THREAD: RunType = RunType(Cow::Borrowed("thread"));

    pub fn new(name: impl Into<String>) -> Self {
        RunType(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Agents are tracked as a flavour of chain, so the two names match each other
    pub fn matches(&self, other: &RunType) -> bool {
        let is_chain_like = |t: &RunType| t.as_str() == "agent" || t.as_str() == "chain";
        self == other || (is_chain_like(self) && is_chain_like(other))
    }
}

impl fmt::Display for RunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunType {
    fn from(value: &str) -> Self {
        RunType::new(value)
    }
}

/// Token accounting attached to `end` events
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_cached: Option<u64>,
}

/// Error payload of an `error` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl EventError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    /// Build an error payload, capturing the current backtrace
    pub fn capture(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: Some(std::backtrace::Backtrace::force_capture().to_string()),
        }
    }
}

/// One queued tracking event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event: EventKind,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub run_type: Option<RunType>,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
    /// UTC, ISO-8601
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<EventError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_usage: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_props: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    /// Only set when the event was recorded with an explicit app id override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
}

impl Event {
    /// Create an event with the current UTC timestamp and no payload
    pub fn new(event: EventKind, run_type: Option<RunType>, run_id: impl Into<String>) -> Self {
        Self {
            event,
            run_type,
            run_id: run_id.into(),
            parent_run_id: None,
            timestamp: Utc::now().to_rfc3339(),
            name: None,
            input: None,
            output: None,
            error: None,
            metadata: None,
            params: None,
            tokens_usage: None,
            tags: None,
            thread_tags: None,
            user_id: None,
            user_props: None,
            message: None,
            feedback: None,
            runtime: None,
            template_id: None,
            app_id: None,
        }
    }

    /// Replace input, output and any error message with the redaction marker
    pub fn redact(&mut self) {
        self.input = Some(Value::String(NOT_INGESTED.to_string()));
        self.output = Some(Value::String(NOT_INGESTED.to_string()));
        if let Some(error) = &mut self.error {
            error.message = NOT_INGESTED.to_string();
            error.stack = None;
        }
    }

    /// True when the payload was replaced by the redaction marker
    pub fn is_redacted(&self) -> bool {
        let redacted = |v: &Option<Value>| v.as_ref().and_then(Value::as_str) == Some(NOT_INGESTED);
        redacted(&self.input) || redacted(&self.output)
    }

    /// Get a formatted string summary of the event
    pub fn printable_summary(&self) -> String {
        let time_str = DateTime::parse_from_rfc3339(&self.timestamp)
            .map(|dt| dt.with_timezone(&Utc).format("%H:%M:%S%.3f").to_string())
            .unwrap_or_else(|_| self.timestamp.clone());

        let run_type = self.run_type.as_ref().map(RunType::as_str).unwrap_or("-");
        let mut summary =
            format!("[{}] {} {} (run_id: {})", time_str, run_type, self.event, self.run_id);

        if let Some(name) = &self.name {
            summary.push_str(&format!("\n   Name: {}", name));
        }

        if let Some(parent) = &self.parent_run_id {
            summary.push_str(&format!("\n   Parent: {}", parent));
        }

        if self.is_redacted() {
            summary.push_str("\n   Payload: redacted");
        }

        if let Some(error) = &self.error {
            summary.push_str(&format!("\n   Error: {}", error.message));
        }

        if let Some(usage) = &self.tokens_usage {
            summary.push_str(&format!(
                "\n   Tokens: prompt={:?} completion={:?}",
                usage.prompt, usage.completion
            ));
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serializes_camel_case() {
        let mut event = Event::new(EventKind::End, Some(RunType::LLM), "run-1");
        event.parent_run_id = Some("parent-1".to_string());
        event.tokens_usage = Some(TokenUsage {
            completion: Some(3),
            prompt: Some(10),
            prompt_cached: None,
        });

        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["event"], "end");
        assert_eq!(value["type"], "llm");
        assert_eq!(value["runId"], "run-1");
        assert_eq!(value["parentRunId"], "parent-1");
        assert_eq!(value["tokensUsage"]["completion"], 3);
        assert!(value.get("input").is_none());
        assert!(value["tokensUsage"].get("promptCached").is_none());
    }

    #[test]
    fn test_event_kind_names() {
        assert_eq!(serde_json::to_value(EventKind::CustomEvent).unwrap(), json!("custom-event"));
        assert_eq!(EventKind::Start.to_string(), "start");
        assert_eq!(EventKind::Chat.as_str(), "chat");
    }

    #[test]
    fn test_run_type_is_open() {
        let custom = RunType::new("reranker");
        assert_eq!(serde_json::to_value(&custom).unwrap(), json!("reranker"));

        let parsed: RunType = serde_json::from_value(json!("tool")).unwrap();
        assert_eq!(parsed, RunType::TOOL);
    }

    #[test]
    fn test_agent_and_chain_alias() {
        assert!(RunType::AGENT.matches(&RunType::CHAIN));
        assert!(RunType::CHAIN.matches(&RunType::AGENT));
        assert!(RunType::TOOL.matches(&RunType::TOOL));
        assert!(!RunType::TOOL.matches(&RunType::LLM));
    }

    #[test]
    fn test_redaction_marker() {
        let mut event = Event::new(EventKind::Start, Some(RunType::TOOL), "run-1");
        assert!(!event.is_redacted());

        event.input = Some(json!(NOT_INGESTED));
        assert!(event.is_redacted());
    }

    #[test]
    fn test_redact_hides_error_details() {
        let mut event = Event::new(EventKind::Error, Some(RunType::TOOL), "run-2");
        event.error = Some(EventError::capture("token abc leaked"));
        event.redact();

        assert_eq!(event.input, Some(json!(NOT_INGESTED)));
        assert_eq!(event.output, Some(json!(NOT_INGESTED)));
        assert_eq!(event.error, Some(EventError::new(NOT_INGESTED)));
    }

    #[test]
    fn test_printable_summary() {
        let mut event = Event::new(EventKind::Error, Some(RunType::TOOL), "run-9");
        event.name = Some("lookup".to_string());
        event.error = Some(EventError::new("boom"));

        let summary = event.printable_summary();
        assert!(summary.contains("tool error"));
        assert!(summary.contains("run-9"));
        assert!(summary.contains("lookup"));
        assert!(summary.contains("boom"));
    }

    #[test]
    fn test_captured_error_has_stack() {
        let error = EventError::capture("failed");
        assert_eq!(error.message, "failed");
        assert!(error.stack.is_some());
    }
}
