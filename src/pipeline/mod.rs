//! Forwarding pipeline.
//!
//! Every inbound event flows through:
//! 1. `EventSink::deliver()`: non-blocking enqueue from the provider
//! 2. `ForwardWorker`: dequeues, one event per worker at a time
//! 3. `ForwardProcessor::process()`: rule match, guard, throttle, publish
//! 4. `Republisher`: text, structured render, or the media tier chain
//!
//! `ForwardingController` owns the lifecycle around all of it.

pub mod controller;
pub mod guard;
pub mod processor;
pub mod queue;
pub mod republisher;
pub mod rules;
pub mod ruleset;
pub mod throttle;
pub mod types;
pub mod worker;

pub use controller::{EngineDeps, EngineState, EngineStats, ForwardingController};
pub use processor::{ForwardProcessor, ProcessOutcome};
pub use queue::{EnqueueOutcome, EventSink, IngestionQueue};
pub use republisher::{Delivery, Republisher};
pub use types::{
    Content, ForwardingRule, InboundEvent, Media, MediaKind, MediaSource, NewRule, RuleFilters,
};
