//! The tracker instance
//!
//! A [`Tracker`] owns the run manager, the event buffer, the ignore filter and
//! the consumer for one configuration. It is cheap to clone; clones share state.
//! There is no global instance: build one and pass it to whatever needs it.

use super::consumer::{Consumer, FlushReport};
use super::context;
use super::event_buffer::{EventBuffer, EventCallback};
use super::events::{Event, EventKind, RunType};
use super::id::scoped_id;
use super::ignore::{IgnoreFilter, IgnoreRule};
use super::run_manager::{Run, RunManager};
use super::transport::{HttpTransport, Transport};
use crate::config::TrackerConfig;
use crate::error::{Result, TraceError};
use crate::instrument::{Adapted, Instrumented, JsonChunks, JsonInput, JsonOutput, ProviderAdapter};
use crate::thread::{Thread, ThreadOptions};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

struct TrackerInner {
    config: TrackerConfig,
    runs: RunManager,
    buffer: Arc<EventBuffer>,
    filter: IgnoreFilter,
    enabled: AtomicBool,
    consumer: Mutex<Consumer>,
}

/// Entry point for recording runs and events
///
/// # Examples
///
/// ```rust,ignore
/// let tracker = Tracker::new(TrackerConfig::from_env())?;
/// tracker.start().await?;
///
/// let answer = tracker
///     .agent("support-bot")
///     .call_async(question, |q| async move { bot.answer(q).await })
///     .await?;
///
/// tracker.shutdown().await?;
/// ```
#[derive(Clone)]
pub struct Tracker {
    inner: Arc<TrackerInner>,
}

/// Builder for a [`Tracker`] with a custom transport, ignore rules or buffer hook
pub struct TrackerBuilder {
    config: TrackerConfig,
    transport: Option<Arc<dyn Transport>>,
    ignore_rules: Vec<IgnoreRule>,
    on_append: Option<EventCallback>,
    enabled: bool,
}

impl TrackerBuilder {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            transport: None,
            ignore_rules: Vec::new(),
            on_append: None,
            enabled: true,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn ignore_rules(mut self, rules: Vec<IgnoreRule>) -> Self {
        self.ignore_rules = rules;
        self
    }

    pub fn ignore(mut self, rule: IgnoreRule) -> Self {
        self.ignore_rules.push(rule);
        self
    }

    /// Hook invoked for every event entering the buffer
    pub fn on_append(mut self, callback: EventCallback) -> Self {
        self.on_append = Some(callback);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Build the tracker; the HTTP transport is used when none was supplied
    pub fn build(self) -> Result<Tracker> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&self.config)?),
        };

        let buffer = Arc::new(EventBuffer::new(self.on_append));
        let consumer = Consumer::new(buffer.clone(), transport, &self.config);

        Ok(Tracker {
            inner: Arc::new(TrackerInner {
                filter: IgnoreFilter::new(&self.ignore_rules),
                config: self.config,
                runs: RunManager::new(),
                buffer,
                enabled: AtomicBool::new(self.enabled),
                consumer: Mutex::new(consumer),
            }),
        })
    }
}

impl Tracker {
    /// Build a tracker that ships events over HTTP
    pub fn new(config: TrackerConfig) -> Result<Self> {
        TrackerBuilder::new(config).build()
    }

    pub fn builder(config: TrackerConfig) -> TrackerBuilder {
        TrackerBuilder::new(config)
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.inner.config
    }

    pub fn runs(&self) -> &RunManager {
        &self.inner.runs
    }

    pub fn buffer(&self) -> &EventBuffer {
        &self.inner.buffer
    }

    /// Number of events waiting to be shipped
    pub fn pending(&self) -> usize {
        self.inner.buffer.len()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Resume queueing events
    pub fn enable(&self) {
        self.inner.enabled.store(true, Ordering::SeqCst);
    }

    /// Stop queueing events; runs are still opened and closed
    pub fn disable(&self) {
        self.inner.enabled.store(false, Ordering::SeqCst);
    }

    pub fn start_run(&self, run_id: Option<&str>, parent_run_id: Option<&str>) -> Option<Run> {
        self.inner.runs.start_run(run_id, parent_run_id)
    }

    pub fn end_run(&self, run_id: &str) -> String {
        self.inner.runs.end_run(run_id)
    }

    pub fn current_run_id(&self) -> Option<String> {
        self.inner.runs.current_run_id()
    }

    /// Evaluate the ignore rules for an open run
    pub fn should_ignore(&self, run_id: &str, run_type: Option<&RunType>, name: Option<&str>) -> bool {
        self.inner.filter.should_ignore(&self.inner.runs, run_id, run_type, name)
    }

    /// Queue an event whose `run_id` and `parent_run_id` are local ids
    ///
    /// Ids are rewritten to their wire form for the event's scope. Missing user,
    /// user props and tags are taken from the active [`TraceScope`](super::TraceScope).
    /// A root event other than a thread event is parented to the scope's parent
    /// message, if one is set.
    pub fn track_event(&self, mut event: Event) {
        if !self.is_enabled() {
            return;
        }

        let ambient = context::ambient();
        let scope = event
            .app_id
            .clone()
            .unwrap_or_else(|| self.inner.config.default_scope().to_string());

        let is_thread = event.run_type.as_ref() == Some(&RunType::THREAD);
        event.parent_run_id = match event.parent_run_id.take() {
            Some(parent) => Some(scoped_id(&parent, &scope)),
            None if !is_thread => ambient.parent_message.as_deref().map(|m| scoped_id(m, &scope)),
            None => None,
        };
        event.run_id = scoped_id(&event.run_id, &scope);

        if event.user_id.is_none() {
            event.user_id = ambient.user_id;
        }
        if event.user_props.is_none() {
            event.user_props = ambient.user_props;
        }
        if event.tags.is_none() {
            event.tags = ambient.tags;
        }
        if event.runtime.is_none() {
            event.runtime = Some(self.inner.config.runtime.clone());
        }

        if self.inner.config.verbose {
            match serde_json::to_string_pretty(&event) {
                Ok(json) => info!("Add event: {}", json),
                Err(e) => warn!(error = %e, "Could not serialize event"),
            }
        }

        self.inner.buffer.append(event);
    }

    /// Attach feedback (thumbs, rating, comment...) to a run
    pub fn track_feedback(&self, run_id: &str, feedback: Value) -> Result<()> {
        if run_id.is_empty() {
            return Err(TraceError::FeedbackError("No run id provided".to_string()));
        }
        if !feedback.is_object() {
            return Err(TraceError::FeedbackError("Invalid feedback, must be an object".to_string()));
        }

        let mut event = Event::new(EventKind::Feedback, None, run_id);
        event.feedback = Some(feedback);
        self.track_event(event);

        Ok(())
    }

    /// Open a conversation thread
    pub fn open_thread(&self, options: ThreadOptions) -> Result<Thread> {
        Thread::open(self.clone(), options)
    }

    /// Start the background consumer on the current tokio runtime
    pub async fn start(&self) -> Result<()> {
        self.inner.consumer.lock().await.start()
    }

    /// Send everything buffered right now
    pub async fn flush(&self) -> FlushReport {
        self.inner.consumer.lock().await.flush().await
    }

    /// Stop the consumer after a final, time-bounded flush
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.consumer.lock().await.shutdown().await
    }

    fn instrumented(&self, run_type: RunType, name: &str) -> Instrumented<JsonInput, JsonOutput, JsonChunks> {
        Instrumented::new(self.clone(), run_type).with_name(name)
    }

    pub fn agent(&self, name: &str) -> Instrumented<JsonInput, JsonOutput, JsonChunks> {
        self.instrumented(RunType::AGENT, name)
    }

    pub fn tool(&self, name: &str) -> Instrumented<JsonInput, JsonOutput, JsonChunks> {
        self.instrumented(RunType::TOOL, name)
    }

    pub fn chain(&self, name: &str) -> Instrumented<JsonInput, JsonOutput, JsonChunks> {
        self.instrumented(RunType::CHAIN, name)
    }

    pub fn retriever(&self, name: &str) -> Instrumented<JsonInput, JsonOutput, JsonChunks> {
        self.instrumented(RunType::RETRIEVER, name)
    }

    pub fn llm(&self, name: &str) -> Instrumented<JsonInput, JsonOutput, JsonChunks> {
        self.instrumented(RunType::LLM, name)
    }

    /// Wrap calls to a model provider through its adapter
    ///
    /// The run name comes from the adapter's parsed input (usually the model).
    pub fn monitor<P: ProviderAdapter>(&self, adapter: P) -> Instrumented<Adapted<P>, Adapted<P>, Adapted<P>> {
        let adapted = Arc::new(Adapted::new(adapter));
        Instrumented::new(self.clone(), RunType::LLM).with_all_parsers(adapted.clone(), adapted.clone(), adapted)
    }
}
