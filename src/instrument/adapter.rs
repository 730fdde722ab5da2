//! Provider adapters
//!
//! Each model provider integration implements [`ProviderAdapter`] once. The
//! tracker's [`monitor`](crate::tracer::Tracker::monitor) turns an adapter into
//! an `llm` wrapper whose parsers all come from it.

use super::parsers::{ChunkParser, InputParser, OutputParser, ParsedInput, ParsedOutput};
use super::stream::ParsedChunk;
use crate::error::Result;

/// Request/response shaping for one provider API
pub trait ProviderAdapter: Send + Sync + 'static {
    type Request: ?Sized;
    type Response: ?Sized;
    type Chunk: ?Sized;

    /// Name (usually the model), input messages and monitored params of a request
    fn parse_input(&self, request: &Self::Request) -> Result<ParsedInput>;

    fn parse_output(&self, response: &Self::Response) -> Result<ParsedOutput>;

    fn parse_chunk(&self, chunk: &Self::Chunk) -> Result<ParsedChunk>;

    /// Final shape of a streamed response, rebuilt from its chunks
    fn parse_stream_output(&self, aggregated: &ParsedOutput) -> Result<ParsedOutput> {
        Ok(aggregated.clone())
    }
}

/// Exposes a [`ProviderAdapter`] through the parser traits
pub struct Adapted<P>(P);

impl<P: ProviderAdapter> Adapted<P> {
    pub fn new(adapter: P) -> Self {
        Self(adapter)
    }

    pub fn adapter(&self) -> &P {
        &self.0
    }
}

impl<P: ProviderAdapter> InputParser<P::Request> for Adapted<P> {
    fn parse_input(&self, args: &P::Request) -> Result<ParsedInput> {
        self.0.parse_input(args)
    }
}

impl<P: ProviderAdapter> OutputParser<P::Response> for Adapted<P> {
    fn parse_output(&self, output: &P::Response) -> Result<ParsedOutput> {
        self.0.parse_output(output)
    }
}

impl<P: ProviderAdapter> ChunkParser<P::Chunk> for Adapted<P> {
    fn parse_chunk(&self, chunk: &P::Chunk) -> Result<ParsedChunk> {
        self.0.parse_chunk(chunk)
    }

    fn parse_aggregate(&self, aggregated: &ParsedOutput) -> Result<ParsedOutput> {
        self.0.parse_stream_output(aggregated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TraceError;
    use crate::instrument::parsers::filter_params;
    use crate::instrument::JsonChunks;
    use crate::tracer::tracker::tests::tracker;
    use crate::tracer::{EventKind, RunType, TokenUsage};
    use futures::StreamExt;
    use serde_json::{json, Value};

    struct Completion {
        text: String,
        prompt_tokens: u64,
        completion_tokens: u64,
    }

    /// Chat-completions shaped adapter over JSON requests
    struct ChatAdapter;

    impl ProviderAdapter for ChatAdapter {
        type Request = Value;
        type Response = Completion;
        type Chunk = Value;

        fn parse_input(&self, request: &Value) -> Result<ParsedInput> {
            let object = request
                .as_object()
                .ok_or_else(|| TraceError::ParseError("request must be an object".to_string()))?;
            let model = object.get("model").and_then(Value::as_str).unwrap_or("unknown");

            Ok(ParsedInput::new(object.get("messages").cloned().unwrap_or(Value::Null))
                .with_name(model)
                .with_params(filter_params(object)))
        }

        fn parse_output(&self, response: &Completion) -> Result<ParsedOutput> {
            Ok(ParsedOutput::new(json!({"role": "assistant", "content": response.text})).with_usage(
                TokenUsage {
                    completion: Some(response.completion_tokens),
                    prompt: Some(response.prompt_tokens),
                    prompt_cached: None,
                },
            ))
        }

        fn parse_chunk(&self, chunk: &Value) -> Result<ParsedChunk> {
            JsonChunks.parse_chunk(chunk)
        }
    }

    /// Same wire shape, but streamed responses are recorded as a list of choices
    struct ChoiceListAdapter;

    impl ProviderAdapter for ChoiceListAdapter {
        type Request = Value;
        type Response = Completion;
        type Chunk = Value;

        fn parse_input(&self, request: &Value) -> Result<ParsedInput> {
            ChatAdapter.parse_input(request)
        }

        fn parse_output(&self, response: &Completion) -> Result<ParsedOutput> {
            ChatAdapter.parse_output(response)
        }

        fn parse_chunk(&self, chunk: &Value) -> Result<ParsedChunk> {
            ChatAdapter.parse_chunk(chunk)
        }

        fn parse_stream_output(&self, aggregated: &ParsedOutput) -> Result<ParsedOutput> {
            Ok(ParsedOutput {
                output: json!([aggregated.output]),
                token_usage: aggregated.token_usage.clone(),
            })
        }
    }

    fn request() -> Value {
        json!({
            "model": "gpt-4o-mini",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.3
        })
    }

    #[test]
    fn test_monitor_uses_adapter_parsers() {
        let tracker = tracker();
        let llm = tracker.monitor(ChatAdapter);

        let response: std::result::Result<Completion, String> = llm.call(request(), |_| {
            Ok(Completion {
                text: "hello".to_string(),
                prompt_tokens: 8,
                completion_tokens: 2,
            })
        });
        assert!(response.is_ok());

        let events = tracker.buffer().pending();
        let start = &events[0];
        assert_eq!(start.run_type, Some(RunType::LLM));
        assert_eq!(start.name.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(start.params, Some(json!({"temperature": 0.3})));
        assert_eq!(start.input, Some(json!([{"role": "user", "content": "hi"}])));

        let end = &events[1];
        assert_eq!(end.event, EventKind::End);
        assert_eq!(end.output, Some(json!({"role": "assistant", "content": "hello"})));
        assert_eq!(end.tokens_usage.as_ref().unwrap().prompt, Some(8));
    }

    #[tokio::test]
    async fn test_monitor_streams_openai_chunks() {
        let tracker = tracker();
        let llm = tracker.monitor(ChatAdapter);

        let chunks = vec![
            json!({"choices": [{"index": 0, "delta": {"role": "assistant", "content": "Hel"}}]}),
            json!({"choices": []}),
            json!({"choices": [{"index": 0, "delta": {"content": "lo"}}]}),
        ];

        let stream = llm
            .call_stream(request(), |_| {
                Ok::<_, String>(futures::stream::iter(chunks.into_iter().map(Ok::<_, String>)))
            })
            .unwrap();
        let seen: Vec<_> = stream.collect().await;
        assert_eq!(seen.len(), 3);

        let events = tracker.buffer().pending();
        let end = &events[1];
        assert_eq!(end.output.as_ref().unwrap()["content"], "Hello");
        assert_eq!(end.tokens_usage.as_ref().unwrap().completion, Some(3));
    }

    #[test]
    fn test_monitor_applies_stream_output_hook() {
        let tracker = tracker();
        let llm = tracker.monitor(ChoiceListAdapter);

        let chunks = vec![json!({"choices": [{"index": 0, "delta": {"content": "Hi"}}]})];
        let iter = llm
            .call_iter(request(), |_| Ok::<_, String>(chunks.into_iter().map(Ok::<_, String>)))
            .unwrap();
        assert_eq!(iter.count(), 1);

        let end = &tracker.buffer().pending()[1];
        assert_eq!(end.output.as_ref().unwrap()[0]["content"], "Hi");
        assert_eq!(end.tokens_usage.as_ref().unwrap().completion, Some(1));
    }

    #[test]
    fn test_adapter_input_error_does_not_break_call() {
        let tracker = tracker();
        let llm = tracker.monitor(ChatAdapter);

        let response: std::result::Result<Completion, String> = llm.call(json!("not an object"), |_| {
            Ok(Completion {
                text: "ok".to_string(),
                prompt_tokens: 1,
                completion_tokens: 1,
            })
        });

        assert!(response.is_ok());
        assert_eq!(tracker.buffer().pending()[0].name, None);
    }
}
