//! Input, output and chunk parsers
//!
//! Parsers turn call arguments, results and stream chunks into the payloads
//! the tracker records. The wrapper never looks at provider payloads itself.
//! Plain closures work as parsers:
//!
//! ```rust,ignore
//! let wrapper = tracker.tool("lookup").with_parsers(
//!     |query: &String| -> Result<ParsedInput> { Ok(ParsedInput::new(json!({"q": query}))) },
//!     |rows: &Vec<Row>| -> Result<ParsedOutput> {
//!         Ok(ParsedOutput::new(json!(rows.len())))
//!     },
//! );
//! ```

use super::stream::{ChoiceDelta, FunctionCallDelta, ParsedChunk, ToolCallDelta};
use crate::error::{Result, TraceError};
use crate::tracer::TokenUsage;
use serde::Serialize;
use serde_json::{Map, Value};

/// Request keys copied into `params` by OpenAI-style adapters
pub const MONITORED_PARAMS: &[&str] = &[
    "temperature",
    "top_p",
    "top_k",
    "max_tokens",
    "max_completion_tokens",
    "frequency_penalty",
    "presence_penalty",
    "repetition_penalty",
    "stop",
    "functions",
    "function_call",
    "tools",
    "tool_choice",
    "response_format",
    "seed",
    "logit_bias",
    "logprobs",
    "top_logprobs",
    "n",
    "parallel_tool_calls",
];

/// Keep only the monitored keys of a request object
pub fn filter_params(request: &Map<String, Value>) -> Option<Value> {
    let params: Map<String, Value> = request
        .iter()
        .filter(|(key, _)| MONITORED_PARAMS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    if params.is_empty() {
        None
    } else {
        Some(Value::Object(params))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedInput {
    /// Run name when the wrapper has none, e.g. the model of an LLM request
    pub name: Option<String>,
    pub input: Value,
    pub params: Option<Value>,
}

impl ParsedInput {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_params(mut self, params: Option<Value>) -> Self {
        self.params = params;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedOutput {
    pub output: Value,
    pub token_usage: Option<TokenUsage>,
}

impl ParsedOutput {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            token_usage: None,
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.token_usage = Some(usage);
        self
    }
}

/// Shapes call arguments of type `A`
pub trait InputParser<A: ?Sized>: Send + Sync {
    fn parse_input(&self, args: &A) -> Result<ParsedInput>;
}

impl<A, F> InputParser<A> for F
where
    A: ?Sized,
    F: Fn(&A) -> Result<ParsedInput> + Send + Sync,
{
    fn parse_input(&self, args: &A) -> Result<ParsedInput> {
        self(args)
    }
}

/// Shapes the result of a non-streamed call of type `T`
///
/// Streamed calls never reach it: their output is rebuilt from chunks and
/// finished by [`ChunkParser::parse_aggregate`].
pub trait OutputParser<T: ?Sized>: Send + Sync {
    fn parse_output(&self, output: &T) -> Result<ParsedOutput>;
}

impl<T, F> OutputParser<T> for F
where
    T: ?Sized,
    F: Fn(&T) -> Result<ParsedOutput> + Send + Sync,
{
    fn parse_output(&self, output: &T) -> Result<ParsedOutput> {
        self(output)
    }
}

/// Extracts the deltas carried by one stream chunk of type `C`
pub trait ChunkParser<C: ?Sized>: Send + Sync {
    fn parse_chunk(&self, chunk: &C) -> Result<ParsedChunk>;

    /// Reshape the output rebuilt from the whole stream before `end` is recorded
    fn parse_aggregate(&self, aggregated: &ParsedOutput) -> Result<ParsedOutput> {
        Ok(aggregated.clone())
    }
}

impl<C, F> ChunkParser<C> for F
where
    C: ?Sized,
    F: Fn(&C) -> Result<ParsedChunk> + Send + Sync,
{
    fn parse_chunk(&self, chunk: &C) -> Result<ParsedChunk> {
        self(chunk)
    }
}

/// Records the serialized arguments as input
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonInput;

impl<A: Serialize + ?Sized> InputParser<A> for JsonInput {
    fn parse_input(&self, args: &A) -> Result<ParsedInput> {
        Ok(ParsedInput::new(serde_json::to_value(args)?))
    }
}

/// Records the serialized result as output, without token usage
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonOutput;

impl<T: Serialize + ?Sized> OutputParser<T> for JsonOutput {
    fn parse_output(&self, output: &T) -> Result<ParsedOutput> {
        Ok(ParsedOutput::new(serde_json::to_value(output)?))
    }
}

/// Reads chunks shaped like OpenAI chat completion deltas
///
/// A chunk that serializes to a plain string is taken as content for choice 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonChunks;

impl<C: Serialize + ?Sized> ChunkParser<C> for JsonChunks {
    fn parse_chunk(&self, chunk: &C) -> Result<ParsedChunk> {
        match serde_json::to_value(chunk)? {
            Value::String(content) => Ok(ParsedChunk::content(0, content)),
            Value::Object(object) => Ok(parse_delta_chunk(&object)),
            other => Err(TraceError::ParseError(format!("Unsupported stream chunk: {}", other))),
        }
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn index_field(value: &Value) -> usize {
    value
        .get("index")
        .and_then(Value::as_u64)
        .map_or(0, |index| usize::try_from(index).unwrap_or(usize::MAX))
}

fn parse_delta_chunk(chunk: &Map<String, Value>) -> ParsedChunk {
    let choices = chunk
        .get("choices")
        .and_then(Value::as_array)
        .map(|choices| choices.iter().map(parse_choice).collect())
        .unwrap_or_default();

    let usage = chunk.get("usage").filter(|u| u.is_object()).map(|usage| TokenUsage {
        completion: usage.get("completion_tokens").and_then(Value::as_u64),
        prompt: usage.get("prompt_tokens").and_then(Value::as_u64),
        prompt_cached: usage
            .pointer("/prompt_tokens_details/cached_tokens")
            .and_then(Value::as_u64),
    });

    ParsedChunk { choices, usage }
}

fn parse_choice(choice: &Value) -> ChoiceDelta {
    let delta = choice.get("delta").cloned().unwrap_or(Value::Null);

    let function_call = delta.get("function_call").filter(|f| f.is_object()).map(|call| FunctionCallDelta {
        name: str_field(call, "name"),
        arguments: str_field(call, "arguments"),
    });

    let tool_calls = delta
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .map(|call| {
                    let function = call.get("function").cloned().unwrap_or(Value::Null);
                    ToolCallDelta {
                        index: index_field(call),
                        id: str_field(call, "id"),
                        kind: str_field(call, "type"),
                        name: str_field(&function, "name"),
                        arguments: str_field(&function, "arguments"),
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    ChoiceDelta {
        index: index_field(choice),
        role: str_field(&delta, "role"),
        content: str_field(&delta, "content"),
        function_call,
        tool_calls,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_params_keeps_monitored_keys() {
        let request = json!({
            "model": "gpt-4o",
            "messages": [],
            "temperature": 0.2,
            "tools": [{"type": "function"}]
        });

        let params = filter_params(request.as_object().unwrap()).unwrap();
        assert_eq!(params, json!({"temperature": 0.2, "tools": [{"type": "function"}]}));
    }

    #[test]
    fn test_filter_params_empty() {
        let request = json!({"model": "gpt-4o"});
        assert_eq!(filter_params(request.as_object().unwrap()), None);
    }

    #[test]
    fn test_json_parsers() {
        let input = JsonInput.parse_input(&("a", 1)).unwrap();
        assert_eq!(input.input, json!(["a", 1]));
        assert_eq!(input.name, None);

        let output = JsonOutput.parse_output(&vec![1, 2]).unwrap();
        assert_eq!(output.output, json!([1, 2]));
        assert_eq!(output.token_usage, None);
    }

    #[test]
    fn test_closure_parsers() {
        let input_parser =
            |q: &String| -> Result<ParsedInput> { Ok(ParsedInput::new(json!({ "q": q })).with_name("search")) };
        let parsed = input_parser.parse_input(&"rust".to_string()).unwrap();

        assert_eq!(parsed.name.as_deref(), Some("search"));
        assert_eq!(parsed.input, json!({"q": "rust"}));
    }

    #[test]
    fn test_json_chunks_reads_openai_delta() {
        let chunk = json!({
            "choices": [{
                "index": 0,
                "delta": {
                    "role": "assistant",
                    "content": "Hi",
                    "tool_calls": [{"index": 1, "id": "call_1", "type": "function", "function": {"name": "lookup", "arguments": "{\"q\""}}]
                }
            }],
            "usage": {"completion_tokens": 4, "prompt_tokens": 9}
        });

        let parsed = JsonChunks.parse_chunk(&chunk).unwrap();
        let choice = &parsed.choices[0];

        assert_eq!(choice.role.as_deref(), Some("assistant"));
        assert_eq!(choice.content.as_deref(), Some("Hi"));
        assert_eq!(choice.tool_calls[0].index, 1);
        assert_eq!(choice.tool_calls[0].name.as_deref(), Some("lookup"));
        assert_eq!(parsed.usage.unwrap().completion, Some(4));
    }

    #[test]
    fn test_json_chunks_plain_string() {
        let parsed = JsonChunks.parse_chunk("Hel").unwrap();
        assert_eq!(parsed.choices[0].content.as_deref(), Some("Hel"));
    }

    #[test]
    fn test_json_chunks_rejects_numbers() {
        assert!(matches!(JsonChunks.parse_chunk(&42), Err(TraceError::ParseError(_))));
    }
}
