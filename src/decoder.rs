//! Decoder (spec §4.6): top-level pipeline driving one decode request
//! through the splitter, memory coordinator, KV cache, and micro-batch
//! executor, then dispatching `done`/`error` to the owner exactly once.
//!
//! Grounded step-by-step on
//! `original_source/src/emel/decoder/actions.hpp`. Nothing survives
//! across `decode` calls except the KV cache — every counter here is
//! local to one call, matching `begin_decode`'s full reset.

use tracing::{debug, instrument, warn};

use crate::callbacks::{ComputeBackend, OwnerDispatch};
use crate::config::PipelineConfig;
use crate::error::{ErrorDetail, ErrorDomain, ErrorKind, Phase, Reason};
use crate::executor::{self, ExecuteRequest};
use crate::kv_cache::KvCache;
use crate::memory_coordinator::{self, MemoryBackend, MemoryCoordinator, PrepareFailure};
use crate::splitter::{self, OutputSelector, SplitMode, SplitRequest};
use crate::types::TokenId;

/// A single decode call (spec §3 "Decode request").
pub struct DecodeRequest<'a> {
    pub token_ids: &'a [TokenId],
    /// `0` is replaced with `n_tokens` (single ubatch), per spec §4.6 step 2.
    pub n_ubatch: i32,
}

/// Result of a fully successful [`Decoder::decode`] call.
#[derive(Debug, Clone, Copy)]
pub struct DecodeOutcome {
    pub outputs_processed: i32,
    pub ubatches_processed: i32,
}

fn err(phase: Phase, reason: Reason, status: ErrorKind) -> (ErrorKind, ErrorDetail) {
    let detail = ErrorDetail::new(status, ErrorDomain::Decoder, phase, reason, -1, -1);
    (detail.status, detail)
}

/// Owns the KV cache across decode calls; every other piece of state is
/// scoped to a single `decode` invocation.
pub struct Decoder {
    kv_cache: KvCache,
    memory_coordinator: MemoryCoordinator,
    config: PipelineConfig,
}

impl Decoder {
    pub fn new(config: PipelineConfig) -> Self {
        Decoder {
            kv_cache: KvCache::new(config.kv_size, config.n_stream),
            memory_coordinator: MemoryCoordinator::new(),
            config,
        }
    }

    pub fn kv_cache_mut(&mut self) -> &mut KvCache {
        &mut self.kv_cache
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs one decode request to completion (or to its first permanent
    /// failure), dispatching `done`/`error` to `owner` exactly once.
    #[instrument(skip(self, req, memory_backend, compute, owner), fields(n_tokens = req.token_ids.len()))]
    pub fn decode(
        &mut self,
        req: &DecodeRequest<'_>,
        memory_backend: &mut dyn MemoryBackend,
        compute: &mut dyn ComputeBackend,
        owner: &mut dyn OwnerDispatch,
    ) -> std::result::Result<DecodeOutcome, (ErrorKind, ErrorDetail)> {
        let mut outputs_processed = 0i32;
        let mut ubatches_processed = 0i32;

        if req.token_ids.is_empty() {
            let e = err(Phase::Validate, Reason::InvalidArgument, ErrorKind::InvalidArgument);
            owner.on_error(e.0, e.1);
            return Err(e);
        }
        if req.n_ubatch < 0 {
            let e = err(Phase::Validate, Reason::InvalidArgument, ErrorKind::InvalidArgument);
            owner.on_error(e.0, e.1);
            return Err(e);
        }

        let n_tokens = req.token_ids.len() as i32;
        let n_ubatch = if req.n_ubatch <= 0 { n_tokens } else { req.n_ubatch };

        let split_request = SplitRequest {
            token_ids: req.token_ids,
            n_ubatch,
            mode: SplitMode::Simple,
            seq_primary_ids: None,
            seq_masks: None,
            equal_sequential: false,
            output: OutputSelector::LastOnly,
        };
        let split_result = match splitter::split(&split_request) {
            Ok(r) if r.ubatch_count() > 0 && r.total_outputs > 0 => r,
            _ => {
                let e = err(Phase::InitializeBatch, Reason::Unknown, ErrorKind::Backend);
                owner.on_error(e.0, e.1);
                return Err(e);
            }
        };
        let outputs_total = split_result.total_outputs;
        let ubatches_total = split_result.ubatch_count();
        debug!(ubatches_total, outputs_total, "decoder initialized batch");

        match self.memory_coordinator.prepare_update(false, memory_backend) {
            Ok(status) if !memory_coordinator::update_status_is_error(status) => {}
            _ => {
                let e = err(Phase::UpdateMemory, Reason::Unknown, ErrorKind::Backend);
                owner.on_error(e.0, e.1);
                return Err(e);
            }
        }

        if let Err(e) = self.prepare_memory_batch_with_retry(n_ubatch, ubatches_total, memory_backend) {
            owner.on_error(e.0, e.1);
            return Err(e);
        }

        if let Err(e) = self.kv_cache.prepare(
            &split_result.ubatch_sizes,
            &vec![0i32; ubatches_total as usize],
            &vec![0i32; ubatches_total as usize],
            n_tokens,
        ) {
            owner.on_error(e.0, e.1);
            return Err(e);
        }

        for ubatch_index in 0..ubatches_total {
            let size = split_result.ubatch_sizes[ubatch_index as usize];
            let expected_outputs = split_result.ubatch_output_counts[ubatch_index as usize];
            let request =
                ExecuteRequest { ubatch_index, ubatch_size: size, stream_id: 0, positions: None, expected_outputs };
            match executor::execute(
                &request,
                &mut self.memory_coordinator,
                memory_backend,
                &mut self.kv_cache,
                compute,
            ) {
                Ok(outcome) => {
                    outputs_processed += outcome.outputs_produced;
                    ubatches_processed += 1;
                }
                Err(exec_err) => {
                    if !exec_err.rollback_attempted {
                        let rollback_to = (ubatches_processed - 1).max(0);
                        if let Err(kv_err) = self.kv_cache.rollback(rollback_to) {
                            warn!(?kv_err, "decoder rollback itself failed");
                        }
                    }
                    let e = (exec_err.status, exec_err.detail);
                    owner.on_error(e.0, e.1);
                    return Err(e);
                }
            }
        }

        if outputs_processed != outputs_total {
            let e = err(Phase::FinalizeOutputs, Reason::Unknown, ErrorKind::Backend);
            owner.on_error(e.0, e.1);
            return Err(e);
        }

        // Best-effort optimizing update; a failure here does not fail an
        // otherwise-successful decode (spec §4.6 step 8).
        if let Err(opt_err) = self.memory_coordinator.prepare_update(true, memory_backend) {
            warn!(?opt_err, "decoder best-effort memory optimization failed");
        }

        let outcome = DecodeOutcome { outputs_processed, ubatches_processed };
        owner.on_done(outputs_processed, ubatches_processed);
        Ok(outcome)
    }

    fn prepare_memory_batch_with_retry(
        &mut self,
        n_ubatch: i32,
        n_ubatches_total: i32,
        memory_backend: &mut dyn MemoryBackend,
    ) -> std::result::Result<(), (ErrorKind, ErrorDetail)> {
        for attempt in 0..2 {
            let status = self
                .memory_coordinator
                .prepare_batch(n_ubatch, n_ubatches_total, memory_backend)
                .map_err(|_| err(Phase::PrepareMemoryBatch, Reason::Unknown, ErrorKind::Backend))?;
            match memory_coordinator::classify_prepare_failure(status) {
                PrepareFailure::None => return Ok(()),
                PrepareFailure::Retryable if attempt == 0 => continue,
                _ => {
                    return Err(err(Phase::PrepareMemoryBatch, Reason::Unknown, ErrorKind::Backend));
                }
            }
        }
        Err(err(Phase::PrepareMemoryBatch, Reason::Unknown, ErrorKind::Backend))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_coordinator::{MemoryRequest, MemoryStatus};

    struct AlwaysOkMemory;
    impl MemoryBackend for AlwaysOkMemory {
        fn validate(&mut self, _r: &MemoryRequest) -> bool {
            true
        }
        fn prepare(&mut self, _r: &MemoryRequest) -> bool {
            true
        }
        fn apply(&mut self, _r: &MemoryRequest) -> bool {
            true
        }
        fn publish(&mut self, _r: &MemoryRequest) -> MemoryStatus {
            MemoryStatus::Success
        }
    }

    struct AlwaysOkCompute;
    impl ComputeBackend for AlwaysOkCompute {
        fn validate(&mut self, _i: i32, _s: i32) -> bool {
            true
        }
        fn prepare_graph(&mut self, _i: i32) -> bool {
            true
        }
        fn alloc_graph(&mut self, _i: i32) -> bool {
            true
        }
        fn bind_inputs(&mut self, _i: i32) -> bool {
            true
        }
        fn run_backend(&mut self, _i: i32) -> std::result::Result<(), ErrorKind> {
            Ok(())
        }
        fn extract_outputs(&mut self, _i: i32, expected_outputs: i32) -> std::result::Result<i32, ErrorKind> {
            Ok(expected_outputs)
        }
    }

    #[derive(Default)]
    struct RecordingOwner {
        done_calls: i32,
        error_calls: i32,
    }
    impl OwnerDispatch for RecordingOwner {
        fn on_done(&mut self, _outputs: i32, _ubatches: i32) {
            self.done_calls += 1;
        }
        fn on_error(&mut self, _error: ErrorKind, _detail: ErrorDetail) {
            self.error_calls += 1;
        }
    }

    #[test]
    fn three_single_token_ubatches() {
        let mut decoder = Decoder::new(PipelineConfig::default().with_n_stream(1));
        let tokens = [1, 2, 3];
        let req = DecodeRequest { token_ids: &tokens, n_ubatch: 1 };
        let mut memory = AlwaysOkMemory;
        let mut compute = AlwaysOkCompute;
        let mut owner = RecordingOwner::default();
        let outcome = decoder.decode(&req, &mut memory, &mut compute, &mut owner).unwrap();
        assert_eq!(outcome.ubatches_processed, 3);
        assert_eq!(owner.done_calls, 1);
        assert_eq!(owner.error_calls, 0);
    }

    #[test]
    fn zero_n_ubatch_is_single_ubatch() {
        let mut decoder = Decoder::new(PipelineConfig::default().with_n_stream(1));
        let tokens = [1, 2, 3, 4];
        let req = DecodeRequest { token_ids: &tokens, n_ubatch: 0 };
        let mut memory = AlwaysOkMemory;
        let mut compute = AlwaysOkCompute;
        let mut owner = RecordingOwner::default();
        let outcome = decoder.decode(&req, &mut memory, &mut compute, &mut owner).unwrap();
        assert_eq!(outcome.ubatches_processed, 1);
    }

    #[test]
    fn empty_request_rejected_and_dispatches_error() {
        let mut decoder = Decoder::new(PipelineConfig::default());
        let tokens: [TokenId; 0] = [];
        let req = DecodeRequest { token_ids: &tokens, n_ubatch: 1 };
        let mut memory = AlwaysOkMemory;
        let mut compute = AlwaysOkCompute;
        let mut owner = RecordingOwner::default();
        assert!(decoder.decode(&req, &mut memory, &mut compute, &mut owner).is_err());
        assert_eq!(owner.error_calls, 1);
    }

    #[test]
    fn compute_failure_triggers_rollback_and_error_dispatch() {
        struct FailingCompute {
            calls: std::cell::Cell<i32>,
        }
        impl ComputeBackend for FailingCompute {
            fn validate(&mut self, _i: i32, _s: i32) -> bool {
                true
            }
            fn prepare_graph(&mut self, _i: i32) -> bool {
                true
            }
            fn alloc_graph(&mut self, _i: i32) -> bool {
                true
            }
            fn bind_inputs(&mut self, _i: i32) -> bool {
                true
            }
            fn run_backend(&mut self, _i: i32) -> std::result::Result<(), ErrorKind> {
                let n = self.calls.get();
                self.calls.set(n + 1);
                if n == 1 {
                    Err(ErrorKind::Backend)
                } else {
                    Ok(())
                }
            }
            fn extract_outputs(&mut self, _i: i32, expected_outputs: i32) -> std::result::Result<i32, ErrorKind> {
                Ok(expected_outputs)
            }
        }

        let mut decoder = Decoder::new(PipelineConfig::default().with_n_stream(1));
        let tokens = [1, 2, 3];
        let req = DecodeRequest { token_ids: &tokens, n_ubatch: 1 };
        let mut memory = AlwaysOkMemory;
        let mut compute = FailingCompute { calls: std::cell::Cell::new(0) };
        let mut owner = RecordingOwner::default();
        let result = decoder.decode(&req, &mut memory, &mut compute, &mut owner);
        assert!(result.is_err());
        assert_eq!(owner.error_calls, 1);
        assert_eq!(decoder.kv_cache_mut().applied_ubatches(), 1);
    }
}
