//! Per-execution-context state
//!
//! Each execution context owns a [`ContextFrame`]: the stack of currently open runs
//! (one stack per [`RunManager`](super::RunManager) instance) plus the ambient
//! user/tags/parent-message values. Synchronous code uses a thread-local frame.
//! Async code gets a tokio task-local frame installed by [`propagate`], which
//! follows the future across worker threads.

use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use tracing::debug;

/// Values applied to every event recorded inside a [`TraceScope`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ambient {
    pub user_id: Option<String>,
    pub user_props: Option<Value>,
    pub tags: Option<Vec<String>>,
    /// External message id used as parent for root runs
    pub parent_message: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ContextFrame {
    pub(crate) runs: HashMap<u64, Vec<String>>,
    pub(crate) ambient: Ambient,
}

thread_local! {
    static THREAD_FRAME: RefCell<ContextFrame> = RefCell::new(ContextFrame::default());
}

tokio::task_local! {
    static TASK_FRAME: RefCell<ContextFrame>;
}

/// Run `f` against the frame of the active execution context
pub(crate) fn with_frame<R>(f: impl FnOnce(&mut ContextFrame) -> R) -> R {
    if TASK_FRAME.try_with(|_| ()).is_ok() {
        TASK_FRAME.with(|frame| f(&mut frame.borrow_mut()))
    } else {
        THREAD_FRAME.with(|frame| f(&mut frame.borrow_mut()))
    }
}

pub(crate) fn snapshot() -> ContextFrame {
    with_frame(|frame| frame.clone())
}

/// Ambient values of the active execution context
pub fn ambient() -> Ambient {
    with_frame(|frame| frame.ambient.clone())
}

/// Run a future in its own execution context, inheriting the caller's open runs
///
/// The snapshot is taken when `propagate` is called, so wrapping a future before
/// handing it to `tokio::spawn` links runs opened inside the spawned task to the
/// spawner's current run.
pub fn propagate<F>(future: F) -> impl Future<Output = F::Output>
where
    F: Future,
{
    TASK_FRAME.scope(RefCell::new(snapshot()), future)
}

/// Sets ambient user, tags and parent message for a closure or future
///
/// ```rust,ignore
/// TraceScope::new()
///     .user("user-42")
///     .tags(vec!["beta".to_string()])
///     .run(|| agent.call(question, answer));
/// ```
#[derive(Debug, Clone, Default)]
pub struct TraceScope {
    ambient: Ambient,
}

impl TraceScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.ambient.user_id = Some(user_id.into());
        self
    }

    pub fn user_props(mut self, props: Value) -> Self {
        self.ambient.user_props = Some(props);
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.ambient.tags = Some(tags);
        self
    }

    pub fn parent_message(mut self, message_id: impl Into<String>) -> Self {
        self.ambient.parent_message = Some(message_id.into());
        self
    }

    /// Values set on this scope override the enclosing ones; unset values are inherited
    fn merged_with(&self, outer: &Ambient) -> Ambient {
        Ambient {
            user_id: self.ambient.user_id.clone().or_else(|| outer.user_id.clone()),
            user_props: self.ambient.user_props.clone().or_else(|| outer.user_props.clone()),
            tags: self.ambient.tags.clone().or_else(|| outer.tags.clone()),
            parent_message: self
                .ambient
                .parent_message
                .clone()
                .or_else(|| outer.parent_message.clone()),
        }
    }

    /// Run a closure with this scope applied to the current execution context
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let previous = with_frame(|frame| {
            let merged = self.merged_with(&frame.ambient);
            std::mem::replace(&mut frame.ambient, merged)
        });
        debug!("Entered trace scope");
        let _restore = RestoreAmbient {
            previous: Some(previous),
        };
        f()
    }

    /// Run a future in a new execution context with this scope applied
    pub fn run_async<F>(&self, future: F) -> impl Future<Output = F::Output>
    where
        F: Future,
    {
        let mut frame = snapshot();
        frame.ambient = self.merged_with(&frame.ambient);
        TASK_FRAME.scope(RefCell::new(frame), future)
    }
}

struct RestoreAmbient {
    previous: Option<Ambient>,
}

impl Drop for RestoreAmbient {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            with_frame(|frame| frame.ambient = previous);
        }
    }
}
