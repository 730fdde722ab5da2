//! # runtrace
//!
//! Run tracing core for LLM applications: instrumented calls become a tree of
//! correlated runs whose events are buffered locally and shipped in the
//! background to an ingestion API.
//!
//! - [`tracer`]: the [`Tracker`](tracer::Tracker), run hierarchy, buffer, consumer and ignore rules
//! - [`instrument`]: wrappers for sync, async and streaming calls
//! - [`thread`]: conversation threads and their messages
//! - [`config`]: injected configuration with an optional environment loader

pub mod config;
pub mod error;
pub mod instrument;
pub mod thread;
pub mod tracer;

pub use error::{Result, TraceError};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::config::TrackerConfig;
    pub use crate::error::{Result, TraceError};
    pub use crate::instrument::{
        CallOptions, InputParser, Instrumented, OutputParser, ParsedChunk, ParsedInput,
        ParsedOutput, ProviderAdapter,
    };
    pub use crate::thread::{Message, Thread, ThreadOptions};
    pub use crate::tracer::{
        IgnoreRule, RunType, TraceScope, Tracker, TrackerBuilder, Transport,
    };
}
