//! Instrumentation of application calls
//!
//! Wrap agents, tools, chains, retrievers and model calls so each invocation
//! becomes a run in the tracker:
//!
//! - [`Instrumented`] wraps sync, async and streaming call shapes
//! - [`InputParser`], [`OutputParser`] and [`ChunkParser`] shape what is recorded
//! - [`StreamAggregator`] rebuilds a complete message from streamed deltas
//! - [`ProviderAdapter`] packages the parsers of one model provider
//!
//! # Usage Example
//!
//! ```rust,ignore
//! use runtrace::prelude::*;
//!
//! let tracker = Tracker::new(TrackerConfig::from_env())?;
//! let search = tracker.tool("search");
//!
//! let hits = search.call(query, |q| index.search(&q))?;
//! ```

pub mod adapter;
pub mod parsers;
pub mod stream;
pub mod wrapper;

pub use adapter::{Adapted, ProviderAdapter};
pub use parsers::{
    filter_params, ChunkParser, InputParser, JsonChunks, JsonInput, JsonOutput, OutputParser,
    ParsedInput, ParsedOutput, MONITORED_PARAMS,
};
pub use stream::{
    AggregatedMessage, ChoiceDelta, FunctionCallDelta, ParsedChunk, StreamAggregator,
    ToolCallDelta, TracedIter, TracedStream,
};
pub use wrapper::{CallOptions, Instrumented, Invocation};
