//! Memory Coordinator (spec §4.4): single entry point adapting three
//! request kinds (`prepare_update`, `prepare_batch`, `prepare_full`) to a
//! common `validating → preparing → applying (update only) → publishing`
//! pipeline, delegating to a caller-supplied backend.
//!
//! Grounded on `original_source/src/emel/decoder/actions.hpp`'s two call
//! sites: `run_update_memory` (non-optimizing `prepare_update`, `no_update`
//! treated as success) and `run_prepare_memory_batch`
//! (`classify_prepare_failure_from_memory_status`, `no_update` treated as
//! permanent failure). This crate keeps that distinction rather than
//! unifying it — see DESIGN.md.

use tracing::{instrument, warn};

use crate::error::{ErrorDetail, ErrorDomain, ErrorKind, Phase, Reason};

/// Outcome of one coordinator request (mirrors
/// `emel::memory::coordinator::event::memory_status`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryStatus {
    Success,
    NoUpdate,
    FailedPrepare,
    FailedCompute,
}

/// Classification of a `prepare_batch` outcome at the decoder boundary
/// (spec §4.4 status mapping).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareFailure {
    None,
    Retryable,
    Permanent,
}

/// `prepare_batch`'s classification: `Success` proceeds, `FailedPrepare`
/// is retryable, and **both** `NoUpdate` and `FailedCompute` are
/// permanent — a batch prepare that reports "nothing to update" is a
/// backend contract violation, not a benign no-op (spec §4.4, resolved
/// Open Question).
pub fn classify_prepare_failure(status: MemoryStatus) -> PrepareFailure {
    match status {
        MemoryStatus::Success => PrepareFailure::None,
        MemoryStatus::FailedPrepare => PrepareFailure::Retryable,
        MemoryStatus::NoUpdate | MemoryStatus::FailedCompute => PrepareFailure::Permanent,
    }
}

/// `update_memory`'s classification: `Success` and `NoUpdate` both count
/// as non-error (spec §4.4, resolved Open Question).
pub fn update_status_is_error(status: MemoryStatus) -> bool {
    !matches!(status, MemoryStatus::Success | MemoryStatus::NoUpdate)
}

/// The three request kinds the coordinator adapts to one pipeline.
#[derive(Debug, Clone, Copy)]
pub enum MemoryRequest {
    Update { optimize: bool },
    Batch { n_ubatch: i32, n_ubatches_total: i32 },
    Full,
}

/// Caller-supplied backend hooks, replacing the original's
/// validate/prepare/apply/publish function pointers. `apply` is only
/// invoked for `Update` requests (spec §4.4 pipeline note).
pub trait MemoryBackend {
    fn validate(&mut self, request: &MemoryRequest) -> bool;
    fn prepare(&mut self, request: &MemoryRequest) -> bool;
    fn apply(&mut self, request: &MemoryRequest) -> bool;
    fn publish(&mut self, request: &MemoryRequest) -> MemoryStatus;
}

/// Ordering-only coordinator state: prepare strictly before apply, apply
/// strictly before publish (spec §4.4 contribution (c)).
#[derive(Default)]
pub struct MemoryCoordinator {
    last_error: Option<ErrorDetail>,
}

fn err(phase: Phase, reason: Reason) -> (ErrorKind, ErrorDetail) {
    let detail = ErrorDetail::new(ErrorKind::Backend, ErrorDomain::MemoryCoordinator, phase, reason, -1, -1);
    (detail.status, detail)
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_error(&self) -> Option<ErrorDetail> {
        self.last_error
    }

    #[instrument(skip(self, backend))]
    pub fn prepare_update(
        &mut self,
        optimize: bool,
        backend: &mut dyn MemoryBackend,
    ) -> std::result::Result<MemoryStatus, (ErrorKind, ErrorDetail)> {
        self.run(MemoryRequest::Update { optimize }, Phase::PrepareUpdate, backend)
    }

    #[instrument(skip(self, backend))]
    pub fn prepare_batch(
        &mut self,
        n_ubatch: i32,
        n_ubatches_total: i32,
        backend: &mut dyn MemoryBackend,
    ) -> std::result::Result<MemoryStatus, (ErrorKind, ErrorDetail)> {
        self.run(MemoryRequest::Batch { n_ubatch, n_ubatches_total }, Phase::PrepareBatch, backend)
    }

    #[instrument(skip(self, backend))]
    pub fn prepare_full(
        &mut self,
        backend: &mut dyn MemoryBackend,
    ) -> std::result::Result<MemoryStatus, (ErrorKind, ErrorDetail)> {
        self.run(MemoryRequest::Full, Phase::PrepareFull, backend)
    }

    fn run(
        &mut self,
        request: MemoryRequest,
        phase: Phase,
        backend: &mut dyn MemoryBackend,
    ) -> std::result::Result<MemoryStatus, (ErrorKind, ErrorDetail)> {
        if !backend.validate(&request) {
            let e = err(phase, Reason::InvalidArgument);
            self.last_error = Some(e.1);
            warn!(?phase, "memory coordinator validate rejected request");
            return Err(e);
        }
        if !backend.prepare(&request) {
            let e = err(phase, Reason::Unknown);
            self.last_error = Some(e.1);
            return Err(e);
        }
        if matches!(request, MemoryRequest::Update { .. }) && !backend.apply(&request) {
            let e = err(phase, Reason::Unknown);
            self.last_error = Some(e.1);
            return Err(e);
        }
        let status = backend.publish(&request);
        self.last_error = None;
        Ok(status)
    }
}
