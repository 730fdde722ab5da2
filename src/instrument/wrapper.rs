//! Instrumented calls
//!
//! [`Instrumented`] turns a synchronous, asynchronous or streaming call into a
//! run: `start` before the call, then `end` with the parsed output or `error`
//! with the application error, and the run is closed on every exit path.
//! Application errors are handed back unchanged. Failures inside tracing
//! (parsers, serialization) are logged and never reach the caller.

use super::parsers::{ChunkParser, InputParser, OutputParser, ParsedInput, ParsedOutput};
use super::stream::{TracedIter, TracedStream};
use crate::tracer::{context, Event, EventError, EventKind, RunType, Tracker};
use futures::Stream;
use serde_json::Value;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Overrides for a single invocation
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Explicit parent run; defaults to the current run of the calling context
    pub parent: Option<String>,
    /// Explicit local run id; generated when absent
    pub run_id: Option<String>,
    pub user_id: Option<String>,
    pub user_props: Option<Value>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<Value>,
    pub template_id: Option<String>,
    pub app_id: Option<String>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn user_props(mut self, props: Value) -> Self {
        self.user_props = Some(props);
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = Some(tags);
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn template_id(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }

    pub fn app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }
}

/// Keeps a run open until it completes, fails or is dropped
///
/// Dropping an unfinished guard (panic, cancelled future, abandoned stream)
/// records a `cancelled` error and closes the run.
pub(crate) struct RunGuard {
    tracker: Tracker,
    run_id: String,
    run_type: RunType,
    name: Option<String>,
    redacted: bool,
    app_id: Option<String>,
    finished: bool,
}

impl RunGuard {
    fn event(&self, kind: EventKind) -> Event {
        let mut event = Event::new(kind, Some(self.run_type.clone()), self.run_id.clone());
        event.name = self.name.clone();
        event.app_id = self.app_id.clone();
        event
    }

    fn detach(&self) {
        self.tracker.runs().detach(&self.run_id);
    }

    fn track(&self, mut event: Event) {
        if self.redacted {
            event.redact();
        }
        self.tracker.track_event(event);
    }

    pub(crate) fn complete(mut self, parsed: ParsedOutput) {
        let mut event = self.event(EventKind::End);
        event.output = Some(parsed.output);
        event.tokens_usage = parsed.token_usage;
        self.track(event);
        self.close();
    }

    pub(crate) fn fail(mut self, error: EventError) {
        let mut event = self.event(EventKind::Error);
        event.error = Some(error);
        self.track(event);
        self.close();
    }

    fn close(&mut self) {
        self.finished = true;
        self.tracker.end_run(&self.run_id);
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        debug!(run_id = %self.run_id, "Run abandoned before completion");
        let mut event = self.event(EventKind::Error);
        if self.redacted {
            event.redact();
        }
        event.error = Some(EventError::new("cancelled"));
        self.tracker.track_event(event);
        self.close();
    }
}

/// A call site wrapped for tracing
///
/// `I` shapes arguments, `O` shapes results and `K` reads stream chunks.
///
/// ```rust,ignore
/// let lookup = tracker.tool("lookup");
/// let rows = lookup.call(query, |q| db.search(&q))?;
/// ```
pub struct Instrumented<I, O, K> {
    tracker: Tracker,
    run_type: RunType,
    name: Option<String>,
    user_id: Option<String>,
    user_props: Option<Value>,
    tags: Option<Vec<String>>,
    app_id: Option<String>,
    inputs: Arc<I>,
    outputs: Arc<O>,
    chunks: Arc<K>,
}

impl<I, O, K> Clone for Instrumented<I, O, K> {
    fn clone(&self) -> Self {
        Self {
            tracker: self.tracker.clone(),
            run_type: self.run_type.clone(),
            name: self.name.clone(),
            user_id: self.user_id.clone(),
            user_props: self.user_props.clone(),
            tags: self.tags.clone(),
            app_id: self.app_id.clone(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            chunks: self.chunks.clone(),
        }
    }
}

impl Instrumented<super::JsonInput, super::JsonOutput, super::JsonChunks> {
    /// Wrapper with JSON parsers for the given run type
    pub fn new(tracker: Tracker, run_type: RunType) -> Self {
        Self {
            tracker,
            run_type,
            name: None,
            user_id: None,
            user_props: None,
            tags: None,
            app_id: None,
            inputs: Arc::new(super::JsonInput),
            outputs: Arc::new(super::JsonOutput),
            chunks: Arc::new(super::JsonChunks),
        }
    }
}

impl<I, O, K> Instrumented<I, O, K> {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_user_props(mut self, props: Value) -> Self {
        self.user_props = Some(props);
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = Some(tags);
        self
    }

    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    /// Replace the input and output parsers
    pub fn with_parsers<I2, O2>(self, inputs: I2, outputs: O2) -> Instrumented<I2, O2, K> {
        let chunks = self.chunks.clone();
        self.with_all_parsers(Arc::new(inputs), Arc::new(outputs), chunks)
    }

    pub fn with_chunk_parser<K2>(self, chunks: K2) -> Instrumented<I, O, K2> {
        let inputs = self.inputs.clone();
        let outputs = self.outputs.clone();
        self.with_all_parsers(inputs, outputs, Arc::new(chunks))
    }

    pub(crate) fn with_all_parsers<I2, O2, K2>(
        self,
        inputs: Arc<I2>,
        outputs: Arc<O2>,
        chunks: Arc<K2>,
    ) -> Instrumented<I2, O2, K2> {
        Instrumented {
            tracker: self.tracker,
            run_type: self.run_type,
            name: self.name,
            user_id: self.user_id,
            user_props: self.user_props,
            tags: self.tags,
            app_id: self.app_id,
            inputs,
            outputs,
            chunks,
        }
    }

    pub fn run_type(&self) -> &RunType {
        &self.run_type
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Per-call overrides for the next invocation
    pub fn invoke(&self, options: CallOptions) -> Invocation<'_, I, O, K> {
        Invocation {
            wrapper: self,
            options,
        }
    }

    /// Open the run and record `start`
    ///
    /// Returns `None` when the run could not be opened; the call then runs untraced.
    fn open<A>(&self, options: CallOptions, args: &A) -> Option<RunGuard>
    where
        A: ?Sized,
        I: InputParser<A>,
    {
        let parent = options.parent.or_else(|| self.tracker.current_run_id());
        let run = self.tracker.start_run(options.run_id.as_deref(), parent.as_deref())?;

        let parsed = (*self.inputs).parse_input(args).unwrap_or_else(|e| {
            warn!(error = %e, run_type = %self.run_type, "Could not parse call input");
            ParsedInput::default()
        });

        let name = self.name.clone().or(parsed.name);
        let redacted = self.tracker.should_ignore(&run.id, Some(&self.run_type), name.as_deref());
        let ambient = context::ambient();
        let app_id = options.app_id.or_else(|| self.app_id.clone());

        let mut event = Event::new(EventKind::Start, Some(self.run_type.clone()), run.id.clone());
        event.parent_run_id = parent;
        event.name = name.clone();
        event.input = Some(parsed.input);
        event.params = parsed.params;
        event.metadata = options.metadata;
        event.user_id = options.user_id.or(ambient.user_id).or_else(|| self.user_id.clone());
        event.user_props = options
            .user_props
            .or_else(|| self.user_props.clone())
            .or(ambient.user_props);
        event.tags = options.tags.or_else(|| self.tags.clone()).or(ambient.tags);
        event.template_id = options.template_id;
        event.app_id = app_id.clone();
        if redacted {
            event.redact();
        }
        self.tracker.track_event(event);

        Some(RunGuard {
            tracker: self.tracker.clone(),
            run_id: run.id,
            run_type: self.run_type.clone(),
            name,
            redacted,
            app_id,
            finished: false,
        })
    }

    fn parsed_output<T>(&self, output: &T) -> ParsedOutput
    where
        O: OutputParser<T>,
    {
        (*self.outputs).parse_output(output).unwrap_or_else(|e| {
            warn!(error = %e, run_type = %self.run_type, "Could not parse call output");
            ParsedOutput::default()
        })
    }

    /// Trace a synchronous call
    pub fn call<A, T, E, F>(&self, args: A, f: F) -> Result<T, E>
    where
        I: InputParser<A>,
        O: OutputParser<T>,
        E: Display,
        F: FnOnce(A) -> Result<T, E>,
    {
        self.invoke(CallOptions::default()).call(args, f)
    }

    /// Trace an asynchronous call
    pub async fn call_async<A, T, E, F, Fut>(&self, args: A, f: F) -> Result<T, E>
    where
        I: InputParser<A>,
        O: OutputParser<T>,
        E: Display,
        F: FnOnce(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.invoke(CallOptions::default()).call_async(args, f).await
    }

    /// Trace a call returning a `Stream` of chunks
    pub fn call_stream<A, S, C, E, F>(&self, args: A, f: F) -> Result<TracedStream<S, C, K>, E>
    where
        I: InputParser<A>,
        K: ChunkParser<C>,
        S: Stream<Item = Result<C, E>>,
        E: Display,
        F: FnOnce(A) -> Result<S, E>,
    {
        self.invoke(CallOptions::default()).call_stream(args, f)
    }

    /// Trace an async call resolving to a `Stream` of chunks
    pub async fn call_stream_async<A, S, C, E, F, Fut>(
        &self,
        args: A,
        f: F,
    ) -> Result<TracedStream<S, C, K>, E>
    where
        I: InputParser<A>,
        K: ChunkParser<C>,
        S: Stream<Item = Result<C, E>>,
        E: Display,
        F: FnOnce(A) -> Fut,
        Fut: Future<Output = Result<S, E>>,
    {
        self.invoke(CallOptions::default()).call_stream_async(args, f).await
    }

    /// Trace a call returning a blocking iterator of chunks
    pub fn call_iter<A, It, C, E, F>(&self, args: A, f: F) -> Result<TracedIter<It, C, K>, E>
    where
        I: InputParser<A>,
        K: ChunkParser<C>,
        It: Iterator<Item = Result<C, E>>,
        E: Display,
        F: FnOnce(A) -> Result<It, E>,
    {
        self.invoke(CallOptions::default()).call_iter(args, f)
    }
}

/// One call through an [`Instrumented`] wrapper, with [`CallOptions`] applied
pub struct Invocation<'a, I, O, K> {
    wrapper: &'a Instrumented<I, O, K>,
    options: CallOptions,
}

impl<'a, I, O, K> Invocation<'a, I, O, K> {
    pub fn call<A, T, E, F>(self, args: A, f: F) -> Result<T, E>
    where
        I: InputParser<A>,
        O: OutputParser<T>,
        E: Display,
        F: FnOnce(A) -> Result<T, E>,
    {
        let guard = self.wrapper.open(self.options, &args);
        let result = f(args);

        if let Some(guard) = guard {
            match &result {
                Ok(output) => guard.complete(self.wrapper.parsed_output(output)),
                Err(e) => guard.fail(EventError::capture(e.to_string())),
            }
        }
        result
    }

    pub async fn call_async<A, T, E, F, Fut>(self, args: A, f: F) -> Result<T, E>
    where
        I: InputParser<A>,
        O: OutputParser<T>,
        E: Display,
        F: FnOnce(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let wrapper = self.wrapper;
        let options = self.options;

        context::propagate(async move {
            let guard = wrapper.open(options, &args);
            let result = f(args).await;

            if let Some(guard) = guard {
                match &result {
                    Ok(output) => guard.complete(wrapper.parsed_output(output)),
                    Err(e) => guard.fail(EventError::capture(e.to_string())),
                }
            }
            result
        })
        .await
    }

    pub fn call_stream<A, S, C, E, F>(self, args: A, f: F) -> Result<TracedStream<S, C, K>, E>
    where
        I: InputParser<A>,
        K: ChunkParser<C>,
        S: Stream<Item = Result<C, E>>,
        E: Display,
        F: FnOnce(A) -> Result<S, E>,
    {
        let guard = self.wrapper.open(self.options, &args);

        match f(args) {
            Ok(stream) => {
                if let Some(guard) = &guard {
                    guard.detach();
                }
                Ok(TracedStream::new(stream, self.wrapper.chunks.clone(), guard))
            }
            Err(e) => {
                if let Some(guard) = guard {
                    guard.fail(EventError::capture(e.to_string()));
                }
                Err(e)
            }
        }
    }

    pub async fn call_stream_async<A, S, C, E, F, Fut>(
        self,
        args: A,
        f: F,
    ) -> Result<TracedStream<S, C, K>, E>
    where
        I: InputParser<A>,
        K: ChunkParser<C>,
        S: Stream<Item = Result<C, E>>,
        E: Display,
        F: FnOnce(A) -> Fut,
        Fut: Future<Output = Result<S, E>>,
    {
        let wrapper = self.wrapper;
        let options = self.options;

        context::propagate(async move {
            let guard = wrapper.open(options, &args);

            match f(args).await {
                Ok(stream) => {
                    if let Some(guard) = &guard {
                        guard.detach();
                    }
                    Ok(TracedStream::new(stream, wrapper.chunks.clone(), guard))
                }
                Err(e) => {
                    if let Some(guard) = guard {
                        guard.fail(EventError::capture(e.to_string()));
                    }
                    Err(e)
                }
            }
        })
        .await
    }

    pub fn call_iter<A, It, C, E, F>(self, args: A, f: F) -> Result<TracedIter<It, C, K>, E>
    where
        I: InputParser<A>,
        K: ChunkParser<C>,
        It: Iterator<Item = Result<C, E>>,
        E: Display,
        F: FnOnce(A) -> Result<It, E>,
    {
        let guard = self.wrapper.open(self.options, &args);

        match f(args) {
            Ok(iter) => {
                if let Some(guard) = &guard {
                    guard.detach();
                }
                Ok(TracedIter::new(iter, self.wrapper.chunks.clone(), guard))
            }
            Err(e) => {
                if let Some(guard) = guard {
                    guard.fail(EventError::capture(e.to_string()));
                }
                Err(e)
            }
        }
    }
}
