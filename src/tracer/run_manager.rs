//! Tracking of in-flight runs
//!
//! The [`RunManager`] owns every open [`Run`] and links nested runs to their
//! parents. The "current run" is kept per execution context (see
//! [`context`](super::context)), so parallel call stacks never cross-link.

use super::context;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, error};
use uuid::Uuid;

static NEXT_MANAGER_KEY: AtomicU64 = AtomicU64::new(1);

/// One traced unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Run {
    pub id: String,
    /// Enclosing run, `None` for roots
    pub parent_run_id: Option<String>,
    /// Ids of runs opened directly under this one
    pub children: Vec<String>,
    /// Matched an ignore rule directly
    pub ignored: bool,
    /// Matched an ignore rule that also redacts descendants
    pub suppress_descendants: bool,
}

impl Run {
    fn new(id: String, parent_run_id: Option<String>) -> Self {
        Self {
            id,
            parent_run_id,
            children: Vec::new(),
            ignored: false,
            suppress_descendants: false,
        }
    }
}

/// Hierarchy of open runs plus per-context current-run stacks
pub struct RunManager {
    key: u64,
    runs: Mutex<HashMap<String, Run>>,
}

impl RunManager {
    pub fn new() -> Self {
        Self {
            key: NEXT_MANAGER_KEY.fetch_add(1, Ordering::Relaxed),
            runs: Mutex::new(HashMap::new()),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Run>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a run
    ///
    /// A missing `run_id` is generated. A missing `parent_run_id` defaults to the
    /// current run of the calling execution context. A parent that is not tracked
    /// here is dropped and the run becomes a root. Returns `None` when the run
    /// would be its own parent.
    pub fn start_run(&self, run_id: Option<&str>, parent_run_id: Option<&str>) -> Option<Run> {
        let run_id = run_id.map(str::to_string).unwrap_or_else(|| Uuid::new_v4().to_string());
        let parent = parent_run_id.map(str::to_string).or_else(|| self.current_run_id());

        if parent.as_deref() == Some(run_id.as_str()) {
            error!(run_id = %run_id, "A run cannot be its own parent");
            return None;
        }

        let run = {
            let mut runs = self.table();
            let parent = parent.filter(|p| runs.contains_key(p));
            let run = Run::new(run_id.clone(), parent);

            if let Some(parent_run) = run.parent_run_id.as_ref().and_then(|p| runs.get_mut(p)) {
                parent_run.children.push(run_id.clone());
            }
            runs.insert(run_id.clone(), run.clone());
            run
        };

        context::with_frame(|frame| frame.runs.entry(self.key).or_default().push(run_id));
        debug!(run_id = %run.id, parent_run_id = ?run.parent_run_id, "Started run");

        Some(run)
    }

    /// Close a run and every run nested under it
    ///
    /// Ending an unknown id is a no-op. The id is returned unchanged.
    ///
    /// Only the calling context's run stack is cleaned here. When the run was
    /// opened in another context, its stale stack entry stays there until that
    /// context next asks for [`current_run_id`](Self::current_run_id), which
    /// skips ids no longer in the table.
    pub fn end_run(&self, run_id: &str) -> String {
        let removed = {
            let mut runs = self.table();
            let Some(run) = runs.get(run_id) else {
                return run_id.to_string();
            };

            if let Some(parent) = run.parent_run_id.clone() {
                if let Some(parent_run) = runs.get_mut(&parent) {
                    parent_run.children.retain(|child| child != run_id);
                }
            }

            let mut removed = HashSet::new();
            let mut pending = vec![run_id.to_string()];
            while let Some(id) = pending.pop() {
                if let Some(run) = runs.remove(&id) {
                    pending.extend(run.children);
                    removed.insert(id);
                }
            }
            removed
        };

        self.forget_in_context(|id| removed.contains(id));
        debug!(run_id = %run_id, closed = removed.len(), "Ended run");

        run_id.to_string()
    }

    /// Release a run from the current context without closing it
    ///
    /// Used for runs whose lifetime continues outside the call that opened them,
    /// such as streamed responses consumed later.
    pub fn detach(&self, run_id: &str) {
        self.forget_in_context(|id| id == run_id);
    }

    fn forget_in_context(&self, should_forget: impl Fn(&str) -> bool) {
        context::with_frame(|frame| {
            if let Some(stack) = frame.runs.get_mut(&self.key) {
                stack.retain(|id| !should_forget(id));
                if stack.is_empty() {
                    frame.runs.remove(&self.key);
                }
            }
        });
    }

    /// Most recently opened, still open run of the calling execution context
    pub fn current_run_id(&self) -> Option<String> {
        let runs = self.table();
        context::with_frame(|frame| {
            let stack = frame.runs.get_mut(&self.key)?;
            // Runs closed from another context leave stale ids behind
            while let Some(top) = stack.last() {
                if runs.contains_key(top) {
                    return Some(top.clone());
                }
                stack.pop();
            }
            None
        })
    }

    pub fn get(&self, run_id: &str) -> Option<Run> {
        self.table().get(run_id).cloned()
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.table().contains_key(run_id)
    }

    /// Number of open runs
    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    /// Flag a run as matched by an ignore rule
    pub fn mark_ignored(&self, run_id: &str, suppress_descendants: bool) {
        if let Some(run) = self.table().get_mut(run_id) {
            run.ignored = true;
            run.suppress_descendants |= suppress_descendants;
        }
    }

    /// True when the run is flagged, or an ancestor is flagged with descendant suppression
    ///
    /// Runs that disappear during the walk count as not ignored.
    pub fn is_suppressed(&self, run_id: &str) -> bool {
        let runs = self.table();
        let Some(run) = runs.get(run_id) else {
            return false;
        };
        if run.ignored {
            return true;
        }

        let mut hops = 0;
        let mut parent = run.parent_run_id.as_ref();
        while let Some(ancestor) = parent.and_then(|id| runs.get(id)) {
            if ancestor.ignored && ancestor.suppress_descendants {
                return true;
            }
            hops += 1;
            if hops > runs.len() {
                break;
            }
            parent = ancestor.parent_run_id.as_ref();
        }

        false
    }
}

impl Default for RunManager {
    fn default() -> Self {
        Self::new()
    }
}
