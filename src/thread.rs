//! Conversation threads
//!
//! A [`Thread`] groups the messages of one conversation. Every message is a
//! `chat` event of run type `thread`, parented to the thread id, so the
//! backend can rebuild the conversation and attach model runs to it.

use crate::error::{Result, TraceError};
use crate::tracer::{Event, EventKind, RunType, Tracker};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One conversation message as recorded in a `chat` event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_retry: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Options for [`Tracker::open_thread`]
#[derive(Debug, Clone, Default)]
pub struct ThreadOptions {
    /// Reconnect to an existing thread; a new id is generated when absent
    pub id: Option<String>,
    pub tags: Option<Vec<String>>,
    pub user_id: Option<String>,
    pub user_props: Option<Value>,
    pub app_id: Option<String>,
}

pub struct Thread {
    tracker: Tracker,
    id: String,
    tags: Option<Vec<String>>,
    user_id: Option<String>,
    user_props: Option<Value>,
    app_id: String,
}

impl Thread {
    pub(crate) fn open(tracker: Tracker, options: ThreadOptions) -> Result<Self> {
        let app_id = options
            .app_id
            .or_else(|| tracker.config().app_id.clone())
            .ok_or_else(|| TraceError::ThreadError("API token is required".to_string()))?;

        Ok(Self {
            tracker,
            id: options.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            tags: options.tags,
            user_id: options.user_id,
            user_props: options.user_props,
            app_id,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn event(&self, kind: EventKind, run_id: String, user_id: Option<String>, user_props: Option<Value>) -> Event {
        let mut event = Event::new(kind, Some(RunType::THREAD), run_id);
        event.parent_run_id = Some(self.id.clone());
        event.thread_tags = self.tags.clone();
        event.user_id = user_id.or_else(|| self.user_id.clone());
        event.user_props = user_props.or_else(|| self.user_props.clone());
        event.app_id = Some(self.app_id.clone());
        event
    }

    /// Record a message; returns its local id, generated when the message has none
    ///
    /// Pass the id to [`Tracker::track_feedback`] or as the parent message of the
    /// model run that answers it.
    pub fn track_message(
        &self,
        message: Message,
        user_id: Option<String>,
        user_props: Option<Value>,
        feedback: Option<Value>,
    ) -> String {
        let run_id = message.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut event = self.event(EventKind::Chat, run_id.clone(), user_id, user_props);
        event.feedback = feedback;
        match serde_json::to_value(&message) {
            Ok(value) => event.message = Some(value),
            Err(e) => tracing::warn!(error = %e, "Could not serialize thread message"),
        }
        self.tracker.track_event(event);

        run_id
    }

    /// Record a named custom event in the thread
    pub fn track_event(
        &self,
        name: impl Into<String>,
        user_id: Option<String>,
        user_props: Option<Value>,
        metadata: Option<Value>,
    ) {
        let mut event = self.event(
            EventKind::CustomEvent,
            Uuid::new_v4().to_string(),
            user_id,
            user_props,
        );
        event.name = Some(name.into());
        event.metadata = metadata;
        self.tracker.track_event(event);
    }
}
