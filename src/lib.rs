//! tributary is a lightweight stream-processing library over a partitioned,
//! replicated, append-only log.
//!
//! A [TopicProcessor] consumes messages from one or more input topics,
//! applies a user-supplied [MessageProcessor](processor::MessageProcessor)
//! that may emit output messages, and produces those outputs with
//! at-least-once delivery: an input offset is only marked committed once
//! every output derived from it has been acknowledged by the log. Work is
//! pipelined across the partitions statically assigned to this container,
//! bounded by a single in-flight cap.
//!
//! The log itself sits behind the capability traits in [client];
//! [mem::MemLog] is the bundled in-memory implementation, used by the test
//! suite and for unit-testing processors without a broker.

pub mod client;
pub mod config;
mod error;
pub mod mem;
pub mod message;
pub mod metrics;
mod partition_processor;
pub mod processor;
pub mod serdes;
mod topic_processor;

pub use crate::error::{Error, Result};
pub use crate::topic_processor::TopicProcessor;
