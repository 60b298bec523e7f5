//! Decode orchestration core for a memory-mapped transformer inference
//! runtime.
//!
//! This crate implements the six components that turn a batch of token
//! ids into one decode step's worth of logits: the [`allocator`] that
//! places tensors in aligned storage chunks, the [`splitter`] that
//! carves an input batch into micro-batches, the [`kv_cache`] that
//! tracks per-stream occupancy, the [`memory_coordinator`] that adapts
//! backend memory requests to one pipeline, the [`executor`] that drives
//! one micro-batch through compute, and the [`decoder`] that ties all of
//! the above into one top-level `decode` call.
//!
//! Compute and memory backends are supplied by the caller as trait
//! objects ([`callbacks::ComputeBackend`], [`memory_coordinator::MemoryBackend`],
//! [`callbacks::OwnerDispatch`]) — this crate owns no threads, no async
//! runtime, and no GPU device state (see [`config`] and the module-level
//! docs below for what is and is not in scope).

pub mod allocator;
pub mod callbacks;
pub mod config;
pub mod decoder;
pub mod error;
pub mod executor;
pub mod kv_cache;
pub mod memory_coordinator;
pub mod splitter;
pub mod types;

pub use config::PipelineConfig;
pub use decoder::{DecodeOutcome, DecodeRequest, Decoder};
pub use error::{ErrorDetail, ErrorDomain, ErrorKind, Result};
