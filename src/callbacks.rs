//! Trait-object seams the executor and decoder call out through.
//!
//! The original source threads C function-pointer callbacks
//! (`emel::callback<Signature>`, see `include/emel/callback.hpp`) through
//! every state machine so that compute/memory backends and owning state
//! machines stay decoupled from the core. A Rust port has no need for
//! type-erased function-pointer thunks: plain trait objects give the same
//! decoupling with static dispatch at the call site and no `unsafe`.

use crate::error::{ErrorDetail, ErrorKind};

/// Compute backend hooks driven by the micro-batch executor (spec §4.5).
/// Each stage maps to one step of the original's ubatch-executor pipeline.
pub trait ComputeBackend {
    fn validate(&mut self, ubatch_index: i32, ubatch_size: i32) -> bool;
    fn prepare_graph(&mut self, ubatch_index: i32) -> bool;
    fn alloc_graph(&mut self, ubatch_index: i32) -> bool;
    fn bind_inputs(&mut self, ubatch_index: i32) -> bool;
    /// Runs the compute graph. An `Err(ErrorKind::InvalidArgument)` here is
    /// itself a backend contract bug (the executor already validated its
    /// inputs) and is remapped to `Backend` by the executor — see
    /// `normalize_ubatch_error` grounding in `executor.rs`.
    fn run_backend(&mut self, ubatch_index: i32) -> std::result::Result<(), ErrorKind>;
    /// Extracts this micro-batch's output slots. `expected_outputs` is how
    /// many the batch splitter assigned to this micro-batch (0 for a
    /// micro-batch that contributes no output, e.g. every ubatch but the
    /// last under a last-token-only selector) — the backend must produce
    /// exactly that many.
    fn extract_outputs(
        &mut self,
        ubatch_index: i32,
        expected_outputs: i32,
    ) -> std::result::Result<i32, ErrorKind>;
}

/// Dispatch target for the decoder's terminal `done`/`error` event (spec
/// §4.6 step 9), replacing the original's `dispatch_event` function
/// pointer plus `owner_sm` opaque pointer pair.
pub trait OwnerDispatch {
    fn on_done(&mut self, outputs_processed: i32, ubatches_processed: i32);
    fn on_error(&mut self, error: ErrorKind, detail: ErrorDetail);
}
