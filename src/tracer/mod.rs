//! Run tracking and event delivery
//!
//! The tracer turns instrumented work into a tree of runs and ships the
//! resulting events to the ingestion API in the background.
//!
//! # Architecture
//!
//! - **Tracker**: the instance applications build and pass around
//! - **RunManager**: open runs, parent/child links, current run per execution context
//! - **EventBuffer**: pending events, drained without blocking producers
//! - **Consumer**: background loop that ships batches through a **Transport**
//! - **IgnoreFilter**: redacts payloads of matching runs and their subtrees
//!
//! # Run ids
//!
//! Local run ids never leave the process as-is. On the wire a run id is
//! `derive_id(local_id + scope)`, where the scope is the app id the event
//! belongs to. The same local id in two scopes gives two unrelated wire ids,
//! and the same pair always gives the same one.
//!
//! # Usage Example
//!
//! ```rust,ignore
//! use runtrace::tracer::{Tracker, TraceScope};
//! use runtrace::config::TrackerConfig;
//!
//! let tracker = Tracker::new(TrackerConfig::from_env())?;
//! tracker.start().await?;
//!
//! TraceScope::new()
//!     .user("user-42")
//!     .run_async(answer_question(&tracker, question))
//!     .await?;
//!
//! tracker.shutdown().await?;
//! ```

pub mod consumer;
pub mod context;
pub mod event_buffer;
pub mod events;
pub mod id;
pub mod ignore;
pub mod run_manager;
pub mod tracker;
pub mod transport;

pub use consumer::{Consumer, FlushReport};
pub use context::{ambient, propagate, Ambient, TraceScope};
pub use event_buffer::{EventBuffer, EventCallback};
pub use events::{Event, EventError, EventKind, RunType, TokenUsage, NOT_INGESTED};
pub use id::{derive_id, scoped_id};
pub use ignore::{IgnoreFilter, IgnoreRule};
pub use run_manager::{Run, RunManager};
pub use tracker::{Tracker, TrackerBuilder};
pub use transport::{HttpTransport, NullTransport, Transport};
