//! Streaming aggregation
//!
//! A streamed response arrives as chunks of partial deltas. [`TracedStream`] and
//! [`TracedIter`] hand every chunk to the caller unchanged while a
//! [`StreamAggregator`] rebuilds the complete message. The `end` event is only
//! emitted once the source is exhausted.

use super::parsers::{ChunkParser, ParsedOutput};
use super::wrapper::RunGuard;
use crate::tracer::{EventError, TokenUsage};
use futures::Stream;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionCallDelta {
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// A fragment of one tool call; fragments with the same `index` belong together
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub kind: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// Delta for one output slot (choice)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChoiceDelta {
    pub index: usize,
    pub role: Option<String>,
    pub content: Option<String>,
    pub function_call: Option<FunctionCallDelta>,
    pub tool_calls: Vec<ToolCallDelta>,
}

/// Everything a chunk parser extracts from one chunk
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedChunk {
    pub choices: Vec<ChoiceDelta>,
    /// Usage reported by the provider, usually only on the last chunk
    pub usage: Option<TokenUsage>,
}

impl ParsedChunk {
    /// A chunk carrying only text for one slot
    pub fn content(index: usize, content: impl Into<String>) -> Self {
        Self {
            choices: vec![ChoiceDelta {
                index,
                content: Some(content.into()),
                ..Default::default()
            }],
            usage: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregatedFunction {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregatedToolCall {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub function: AggregatedFunction,
    #[serde(skip)]
    index: usize,
}

/// Message rebuilt from the deltas of one slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregatedMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_call: Option<AggregatedFunction>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<AggregatedToolCall>,
}

impl Default for AggregatedMessage {
    fn default() -> Self {
        Self {
            role: "assistant".to_string(),
            content: String::new(),
            function_call: None,
            tool_calls: Vec::new(),
        }
    }
}

impl AggregatedMessage {
    fn apply(&mut self, delta: ChoiceDelta) {
        if let Some(role) = delta.role {
            self.role = role;
        }
        if let Some(content) = delta.content {
            self.content.push_str(&content);
        }

        if let Some(call) = delta.function_call {
            let function = self.function_call.get_or_insert_with(AggregatedFunction::default);
            if let Some(name) = call.name {
                function.name = name;
            }
            if let Some(arguments) = call.arguments {
                function.arguments.push_str(&arguments);
            }
        }

        for fragment in delta.tool_calls {
            match self.tool_calls.iter_mut().find(|tc| tc.index == fragment.index) {
                Some(existing) => {
                    if let Some(arguments) = fragment.arguments {
                        existing.function.arguments.push_str(&arguments);
                    }
                    if existing.id.is_none() {
                        existing.id = fragment.id;
                    }
                    if let Some(name) = fragment.name {
                        existing.function.name = name;
                    }
                }
                None => self.tool_calls.push(AggregatedToolCall {
                    id: fragment.id,
                    kind: fragment.kind,
                    function: AggregatedFunction {
                        name: fragment.name.unwrap_or_default(),
                        arguments: fragment.arguments.unwrap_or_default(),
                    },
                    index: fragment.index,
                }),
            }
        }
    }
}

/// Highest number of output slots a stream may use; deltas beyond it are dropped
pub const MAX_CHOICES: usize = 128;

/// Accumulates chunks into the final output of a streamed call
#[derive(Debug, Default)]
pub struct StreamAggregator {
    choices: BTreeMap<usize, AggregatedMessage>,
    chunks: u64,
    usage: Option<TokenUsage>,
}

impl StreamAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a chunk; chunks that could not be parsed still count
    pub fn record_chunk(&mut self) {
        self.chunks += 1;
    }

    pub fn push(&mut self, chunk: ParsedChunk) {
        for delta in chunk.choices {
            if delta.index >= MAX_CHOICES {
                warn!(index = delta.index, "Ignoring stream delta for out-of-range choice");
                continue;
            }
            self.choices.entry(delta.index).or_default().apply(delta);
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunks
    }

    pub fn message(&self, index: usize) -> Option<&AggregatedMessage> {
        self.choices.get(&index)
    }

    /// Output of slot 0 plus usage
    ///
    /// Without provider usage, completion tokens are the number of chunks seen.
    pub fn finish(self) -> ParsedOutput {
        let output = self
            .choices
            .get(&0)
            .and_then(|message| serde_json::to_value(message).ok())
            .unwrap_or(Value::Null);

        let usage = self.usage.unwrap_or(TokenUsage {
            completion: Some(self.chunks),
            prompt: None,
            prompt_cached: None,
        });

        ParsedOutput::new(output).with_usage(usage)
    }
}

struct Tap<C, K> {
    parser: Arc<K>,
    aggregator: StreamAggregator,
    guard: Option<RunGuard>,
    _chunk: PhantomData<fn(&C)>,
}

impl<C, K: ChunkParser<C>> Tap<C, K> {
    fn new(parser: Arc<K>, guard: Option<RunGuard>) -> Self {
        Self {
            parser,
            aggregator: StreamAggregator::new(),
            guard,
            _chunk: PhantomData,
        }
    }

    fn observe(&mut self, chunk: &C) {
        if self.guard.is_none() {
            return;
        }
        self.aggregator.record_chunk();
        match (*self.parser).parse_chunk(chunk) {
            Ok(parsed) => self.aggregator.push(parsed),
            Err(e) => warn!(error = %e, "Could not parse stream chunk"),
        }
    }

    fn fail(&mut self, message: String) {
        if let Some(guard) = self.guard.take() {
            guard.fail(EventError::capture(message));
        }
    }

    fn finish(&mut self) {
        if let Some(guard) = self.guard.take() {
            let aggregated = std::mem::take(&mut self.aggregator).finish();
            let parsed = (*self.parser).parse_aggregate(&aggregated).unwrap_or_else(|e| {
                warn!(error = %e, "Could not parse aggregated stream output");
                aggregated
            });
            guard.complete(parsed);
        }
    }
}

/// A traced `Stream` of fallible chunks
///
/// Dropping it before the end closes the run with a `cancelled` error.
pub struct TracedStream<S, C, K> {
    inner: Pin<Box<S>>,
    tap: Tap<C, K>,
}

impl<S, C, K: ChunkParser<C>> TracedStream<S, C, K> {
    pub(crate) fn new(inner: S, parser: Arc<K>, guard: Option<RunGuard>) -> Self {
        Self {
            inner: Box::pin(inner),
            tap: Tap::new(parser, guard),
        }
    }
}

impl<S, C, E, K> Stream for TracedStream<S, C, K>
where
    S: Stream<Item = std::result::Result<C, E>>,
    E: Display,
    K: ChunkParser<C>,
{
    type Item = std::result::Result<C, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                this.tap.observe(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.tap.fail(e.to_string());
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.tap.finish();
                Poll::Ready(None)
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// A traced blocking iterator of fallible chunks
pub struct TracedIter<It, C, K> {
    inner: It,
    tap: Tap<C, K>,
}

impl<It, C, K: ChunkParser<C>> TracedIter<It, C, K> {
    pub(crate) fn new(inner: It, parser: Arc<K>, guard: Option<RunGuard>) -> Self {
        Self {
            inner,
            tap: Tap::new(parser, guard),
        }
    }
}

impl<It, C, E, K> Iterator for TracedIter<It, C, K>
where
    It: Iterator<Item = std::result::Result<C, E>>,
    E: Display,
    K: ChunkParser<C>,
{
    type Item = std::result::Result<C, E>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.next() {
            Some(Ok(chunk)) => {
                self.tap.observe(&chunk);
                Some(Ok(chunk))
            }
            Some(Err(e)) => {
                self.tap.fail(e.to_string());
                Some(Err(e))
            }
            None => {
                self.tap.finish();
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool_fragment(index: usize, name: Option<&str>, arguments: &str) -> ChoiceDelta {
        ChoiceDelta {
            index: 0,
            tool_calls: vec![ToolCallDelta {
                index,
                id: name.map(|n| format!("call_{}", n)),
                kind: name.map(|_| "function".to_string()),
                name: name.map(str::to_string),
                arguments: Some(arguments.to_string()),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_content_is_concatenated() {
        let mut aggregator = StreamAggregator::new();
        for part in ["Hel", "lo ", "world"] {
            aggregator.record_chunk();
            aggregator.push(ParsedChunk::content(0, part));
        }

        let parsed = aggregator.finish();
        assert_eq!(parsed.output["content"], "Hello world");
        assert_eq!(parsed.output["role"], "assistant");
        assert_eq!(parsed.token_usage.unwrap().completion, Some(3));
    }

    #[test]
    fn test_tool_call_fragments_merge_by_index() {
        let mut aggregator = StreamAggregator::new();
        aggregator.push(ParsedChunk {
            choices: vec![tool_fragment(0, Some("lookup"), "{\"q\":")],
            usage: None,
        });
        aggregator.push(ParsedChunk {
            choices: vec![tool_fragment(1, Some("fetch"), "{}")],
            usage: None,
        });
        aggregator.push(ParsedChunk {
            choices: vec![tool_fragment(0, None, "\"rust\"}")],
            usage: None,
        });

        let message = aggregator.message(0).unwrap();
        assert_eq!(message.tool_calls.len(), 2);
        assert_eq!(message.tool_calls[0].function.name, "lookup");
        assert_eq!(message.tool_calls[0].function.arguments, "{\"q\":\"rust\"}");
        assert_eq!(message.tool_calls[1].id.as_deref(), Some("call_fetch"));

        let output = aggregator.finish().output;
        assert_eq!(output["tool_calls"][0]["type"], "function");
        assert!(output["tool_calls"][0].get("index").is_none());
    }

    #[test]
    fn test_function_call_arguments_accumulate() {
        let mut aggregator = StreamAggregator::new();
        for (name, arguments) in [(Some("weather"), "{\"city\""), (None, ":\"Oslo\"}")] {
            aggregator.push(ParsedChunk {
                choices: vec![ChoiceDelta {
                    function_call: Some(FunctionCallDelta {
                        name: name.map(str::to_string),
                        arguments: Some(arguments.to_string()),
                    }),
                    ..Default::default()
                }],
                usage: None,
            });
        }

        let output = aggregator.finish().output;
        assert_eq!(output["function_call"], json!({"name": "weather", "arguments": "{\"city\":\"Oslo\"}"}));
    }

    #[test]
    fn test_slots_are_kept_apart() {
        let mut aggregator = StreamAggregator::new();
        aggregator.push(ParsedChunk::content(1, "second"));
        aggregator.push(ParsedChunk::content(0, "first"));

        assert_eq!(aggregator.message(0).unwrap().content, "first");
        assert_eq!(aggregator.message(1).unwrap().content, "second");
    }

    #[test]
    fn test_out_of_range_choice_is_dropped() {
        let mut aggregator = StreamAggregator::new();
        aggregator.record_chunk();
        aggregator.push(ParsedChunk::content(usize::MAX, "lost"));
        aggregator.record_chunk();
        aggregator.push(ParsedChunk::content(MAX_CHOICES, "lost"));
        aggregator.record_chunk();
        aggregator.push(ParsedChunk::content(0, "kept"));

        assert!(aggregator.message(usize::MAX).is_none());
        assert!(aggregator.message(MAX_CHOICES).is_none());

        let parsed = aggregator.finish();
        assert_eq!(parsed.output["content"], "kept");
        assert_eq!(parsed.token_usage.unwrap().completion, Some(3));
    }

    #[test]
    fn test_reported_usage_wins_and_empty_chunks_count() {
        let mut aggregator = StreamAggregator::new();
        aggregator.record_chunk();
        aggregator.push(ParsedChunk::content(0, "hi"));
        aggregator.record_chunk();
        aggregator.push(ParsedChunk::default());
        assert_eq!(aggregator.chunk_count(), 2);

        aggregator.push(ParsedChunk {
            choices: Vec::new(),
            usage: Some(TokenUsage {
                completion: Some(12),
                prompt: Some(30),
                prompt_cached: None,
            }),
        });

        let usage = aggregator.finish().token_usage.unwrap();
        assert_eq!(usage.completion, Some(12));
        assert_eq!(usage.prompt, Some(30));
    }

    #[test]
    fn test_empty_stream_has_null_output() {
        let parsed = StreamAggregator::new().finish();
        assert_eq!(parsed.output, Value::Null);
        assert_eq!(parsed.token_usage.unwrap().completion, Some(0));
    }
}
