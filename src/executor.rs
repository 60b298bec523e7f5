//! Micro-batch Executor (spec §4.5): drives one micro-batch through
//! `validate → prepare_memory → prepare_kv → run_compute → extract_outputs
//! → publish`.
//!
//! Grounded on
//! `original_source/tests/decoder/ubatch_executor_sm_transition_tests.cpp`:
//! a failure at `prepare_memory`/`prepare_kv` needs no rollback (no cells
//! were applied yet — the KV cache validates before mutating), while a
//! failure at `run_compute` or `extract_outputs` triggers exactly one KV
//! rollback attempt, reported back via `rollback_attempted` so the caller
//! does not double-rollback (spec I7).

use tracing::{instrument, warn};

use crate::callbacks::ComputeBackend;
use crate::error::{ErrorDetail, ErrorDomain, ErrorKind, Phase, Reason};
use crate::kv_cache::KvCache;
use crate::memory_coordinator::{MemoryBackend, MemoryCoordinator, MemoryRequest};
use crate::types::Position;

/// Request to execute one planned micro-batch.
pub struct ExecuteRequest {
    pub ubatch_index: i32,
    pub ubatch_size: i32,
    pub stream_id: i32,
    pub positions: Option<Vec<Position>>,
    /// Output slots the batch splitter assigned to this micro-batch; the
    /// compute backend's `extract_outputs` must return exactly this many.
    pub expected_outputs: i32,
}

/// Result of a successful [`execute`] call.
#[derive(Debug, Clone, Copy)]
pub struct ExecuteOutcome {
    pub outputs_produced: i32,
    pub kv_tokens: i32,
    pub rollback_attempted: bool,
}

/// Failure from [`execute`]; `rollback_attempted` tells the decoder
/// whether it still needs to roll the KV cache back itself.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorError {
    pub status: ErrorKind,
    pub detail: ErrorDetail,
    pub rollback_attempted: bool,
}

fn fail(phase: Phase, reason: Reason, rollback_attempted: bool) -> ExecutorError {
    let detail = ErrorDetail::new(ErrorKind::Backend, ErrorDomain::Executor, phase, reason, -1, -1);
    ExecutorError { status: detail.status, detail, rollback_attempted }
}

/// Remaps a compute-stage error per spec §4.5: `Ok` normalizes to `Ok`;
/// an `InvalidArgument` surfacing from the compute stage is itself a
/// backend contract bug (the executor already validated its inputs) and
/// is remapped to `Backend`; any other error passes through unchanged.
pub fn normalize_ubatch_error(result: &std::result::Result<(), ErrorKind>) -> Option<ErrorKind> {
    match result {
        Ok(()) => None,
        Err(ErrorKind::InvalidArgument) => Some(ErrorKind::Backend),
        Err(other) => Some(*other),
    }
}

#[instrument(skip(req, memory, memory_backend, kv, compute))]
pub fn execute(
    req: &ExecuteRequest,
    memory: &mut MemoryCoordinator,
    memory_backend: &mut dyn MemoryBackend,
    kv: &mut KvCache,
    compute: &mut dyn ComputeBackend,
) -> std::result::Result<ExecuteOutcome, ExecutorError> {
    if req.ubatch_index < 0 || req.ubatch_size <= 0 || req.expected_outputs < 0 {
        return Err(fail(Phase::Validate, Reason::InvalidArgument, false));
    }
    if !compute.validate(req.ubatch_index, req.ubatch_size) {
        return Err(fail(Phase::Validate, Reason::InvalidArgument, false));
    }

    let memory_status = memory
        .prepare_batch(req.ubatch_size, req.ubatch_size, memory_backend)
        .map_err(|_| fail(Phase::PrepareMemory, Reason::Unknown, false))?;
    if crate::memory_coordinator::update_status_is_error(memory_status) {
        return Err(fail(Phase::PrepareMemory, Reason::Unknown, false));
    }

    if kv.apply_ubatch(req.ubatch_index, req.positions.as_deref()).is_err() {
        return Err(fail(Phase::PrepareKv, Reason::Unknown, false));
    }

    if !compute.prepare_graph(req.ubatch_index)
        || !compute.alloc_graph(req.ubatch_index)
        || !compute.bind_inputs(req.ubatch_index)
    {
        let rollback_attempted = attempt_rollback(kv, req.ubatch_index);
        return Err(fail(Phase::RunCompute, Reason::Unknown, rollback_attempted));
    }

    let compute_result = compute.run_backend(req.ubatch_index);
    if let Some(err_kind) = normalize_ubatch_error(&compute_result) {
        let rollback_attempted = attempt_rollback(kv, req.ubatch_index);
        warn!(?err_kind, "micro-batch executor run_backend failed");
        let detail = ErrorDetail::new(err_kind, ErrorDomain::Executor, Phase::RunCompute, Reason::Unknown, -1, -1);
        return Err(ExecutorError { status: err_kind, detail, rollback_attempted });
    }

    let extract_result = compute.extract_outputs(req.ubatch_index, req.expected_outputs);
    let outputs_produced = match normalize_ubatch_error(&extract_result.map(|_| ())) {
        Some(err_kind) => {
            let rollback_attempted = attempt_rollback(kv, req.ubatch_index);
            let detail =
                ErrorDetail::new(err_kind, ErrorDomain::Executor, Phase::ExtractOutputs, Reason::Unknown, -1, -1);
            return Err(ExecutorError { status: err_kind, detail, rollback_attempted });
        }
        None => extract_result.unwrap(),
    };

    // A ubatch with no assigned output slots (e.g. every ubatch but the
    // last under a last-token-only selector) legitimately produces zero
    // outputs; any other mismatch against the splitter's assignment is a
    // backend contract violation.
    if outputs_produced != req.expected_outputs {
        let rollback_attempted = attempt_rollback(kv, req.ubatch_index);
        return Err(fail(Phase::ExtractOutputs, Reason::Unknown, rollback_attempted));
    }

    Ok(ExecuteOutcome { outputs_produced, kv_tokens: req.ubatch_size, rollback_attempted: false })
}

fn attempt_rollback(kv: &mut KvCache, ubatch_index: i32) -> bool {
    kv.rollback(ubatch_index).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_coordinator::MemoryStatus;

    struct OkCompute {
        kv_tokens: i32,
        fail_run: bool,
        fail_extract: bool,
    }

    impl ComputeBackend for OkCompute {
        fn validate(&mut self, index: i32, size: i32) -> bool {
            index >= 0 && size > 0
        }
        fn prepare_graph(&mut self, _index: i32) -> bool {
            true
        }
        fn alloc_graph(&mut self, _index: i32) -> bool {
            true
        }
        fn bind_inputs(&mut self, _index: i32) -> bool {
            true
        }
        fn run_backend(&mut self, _index: i32) -> std::result::Result<(), ErrorKind> {
            if self.fail_run {
                Err(ErrorKind::Backend)
            } else {
                Ok(())
            }
        }
        fn extract_outputs(&mut self, _index: i32, _expected_outputs: i32) -> std::result::Result<i32, ErrorKind> {
            if self.fail_extract {
                Err(ErrorKind::Backend)
            } else {
                Ok(self.kv_tokens)
            }
        }
    }

    struct OkMemoryBackend;
    impl MemoryBackend for OkMemoryBackend {
        fn validate(&mut self, _request: &MemoryRequest) -> bool {
            true
        }
        fn prepare(&mut self, _request: &MemoryRequest) -> bool {
            true
        }
        fn apply(&mut self, _request: &MemoryRequest) -> bool {
            true
        }
        fn publish(&mut self, _request: &MemoryRequest) -> MemoryStatus {
            MemoryStatus::Success
        }
    }

    fn fresh_kv() -> KvCache {
        let mut kv = KvCache::new(16, 1);
        kv.bind_seq_to_stream(0, 0);
        kv.prepare(&[1, 1, 1], &[0, 0, 0], &[0, 0, 0], 0).unwrap();
        kv
    }

    #[test]
    fn successful_execute_advances_kv_cache() {
        let mut memory = MemoryCoordinator::new();
        let mut memory_backend = OkMemoryBackend;
        let mut kv = fresh_kv();
        let mut compute = OkCompute { kv_tokens: 1, fail_run: false, fail_extract: false };
        let req = ExecuteRequest { ubatch_index: 0, ubatch_size: 1, stream_id: 0, positions: None, expected_outputs: 1 };
        let outcome = execute(&req, &mut memory, &mut memory_backend, &mut kv, &mut compute).unwrap();
        assert_eq!(outcome.outputs_produced, 1);
        assert!(!outcome.rollback_attempted);
        assert_eq!(kv.applied_ubatches(), 1);
    }

    #[test]
    fn run_backend_failure_triggers_single_rollback() {
        let mut memory = MemoryCoordinator::new();
        let mut memory_backend = OkMemoryBackend;
        let mut kv = fresh_kv();
        let mut compute = OkCompute { kv_tokens: 1, fail_run: true, fail_extract: false };
        let req = ExecuteRequest { ubatch_index: 0, ubatch_size: 1, stream_id: 0, positions: None, expected_outputs: 1 };
        let err = execute(&req, &mut memory, &mut memory_backend, &mut kv, &mut compute).unwrap_err();
        assert!(err.rollback_attempted);
        assert_eq!(kv.applied_ubatches(), 0);
    }

    #[test]
    fn extract_outputs_failure_triggers_rollback() {
        let mut memory = MemoryCoordinator::new();
        let mut memory_backend = OkMemoryBackend;
        let mut kv = fresh_kv();
        let mut compute = OkCompute { kv_tokens: 1, fail_run: false, fail_extract: true };
        let req = ExecuteRequest { ubatch_index: 0, ubatch_size: 1, stream_id: 0, positions: None, expected_outputs: 1 };
        let err = execute(&req, &mut memory, &mut memory_backend, &mut kv, &mut compute).unwrap_err();
        assert!(err.rollback_attempted);
        assert_eq!(kv.applied_ubatches(), 0);
    }

    #[test]
    fn invalid_argument_from_run_backend_remapped_to_backend() {
        let result: std::result::Result<(), ErrorKind> = Err(ErrorKind::InvalidArgument);
        assert_eq!(normalize_ubatch_error(&result), Some(ErrorKind::Backend));
    }

    #[test]
    fn validate_failure_needs_no_rollback() {
        let mut memory = MemoryCoordinator::new();
        let mut memory_backend = OkMemoryBackend;
        let mut kv = fresh_kv();
        let mut compute = OkCompute { kv_tokens: 1, fail_run: false, fail_extract: false };
        let req = ExecuteRequest { ubatch_index: -1, ubatch_size: 1, stream_id: 0, positions: None, expected_outputs: 1 };
        let err = execute(&req, &mut memory, &mut memory_backend, &mut kv, &mut compute).unwrap_err();
        assert!(!err.rollback_attempted);
    }
}
