//! Unified error handling for the decode core.
//!
//! Mirrors the fixed integer error taxonomy of the external interface (spec
//! §6/§7): a small closed set of error kinds plus a richer, component-local
//! `ErrorDetail` for diagnostics. Callers that only need the wire-level code
//! can match on [`ErrorKind`]; callers that want to know which phase of
//! which component failed can inspect the accompanying [`ErrorDetail`].

use std::fmt;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ErrorKind>;

/// Fixed small integer error codes shared across every component.
///
/// Unknown values on the wire must be treated as fatal by callers; this
/// enum is intentionally closed (no `Other(i32)` catch-all) so that adding
/// a new kind is a deliberate, reviewed change.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input: null/missing required data, out-of-range indices,
    /// unaligned sizes, unsupported mode. Never retried.
    #[error("invalid argument")]
    InvalidArgument,

    /// Compute or memory backend callback failure, unexpected state-machine
    /// event, or internal capacity exhaustion that is not a hard invariant
    /// violation.
    #[error("backend error")]
    Backend,

    /// Low-level I/O failure surfaced unchanged from an external
    /// collaborator (GGUF loader, tokenizer).
    #[error("I/O error")]
    Io,

    /// An external collaborator reported a format it does not understand.
    #[error("unsupported format")]
    FormatUnsupported,

    /// An external collaborator reported a structurally invalid model.
    #[error("invalid model")]
    ModelInvalid,

    /// An external collaborator failed to parse its input.
    #[error("parse failed")]
    ParseFailed,
}

impl ErrorKind {
    /// Stable wire code, matching the `EMEL_ERR_*` constants of spec §6.
    pub const fn code(self) -> i32 {
        match self {
            ErrorKind::InvalidArgument => 1,
            ErrorKind::Backend => 2,
            ErrorKind::Io => 3,
            ErrorKind::FormatUnsupported => 4,
            ErrorKind::ModelInvalid => 5,
            ErrorKind::ParseFailed => 6,
        }
    }
}

/// Which of the six core components raised an [`ErrorDetail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDomain {
    TensorAllocator,
    BatchSplitter,
    KvCache,
    MemoryCoordinator,
    Executor,
    Decoder,
}

/// Which internal phase of a component's state machine raised the error.
///
/// The variant set is a superset across all components; a given component
/// only ever produces the phases relevant to its own pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    None,
    Validate,
    ScanTensors,
    PartitionRanges,
    AllocateRanges,
    InitializeTensors,
    Assemble,
    Release,
    Split,
    PrepareSlots,
    Apply,
    Rollback,
    SeqRemove,
    SeqCopy,
    SeqKeep,
    SeqAdd,
    SeqDiv,
    ApplyUpdates,
    Publish,
    PrepareUpdate,
    PrepareBatch,
    PrepareFull,
    PrepareMemory,
    PrepareKv,
    RunCompute,
    ExtractOutputs,
    InitializeBatch,
    UpdateMemory,
    PrepareMemoryBatch,
    ReserveOutput,
    ProcessUbatch,
    RollbackUbatch,
    FinalizeOutputs,
    OptimizeMemory,
}

/// Why a phase failed, independent of which phase it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    None,
    InvalidArgument,
    DuplicateTensorId,
    InvalidViewSource,
    AlignmentOverflow,
    AllocationFailed,
    OffsetOutOfRange,
    AssembleFailed,
    CapacityExceeded,
    NotMonotonic,
    MissingCallback,
    PositionOverflow,
    Unknown,
}

/// Rich, component-local diagnostic accompanying an [`ErrorKind`].
///
/// Mirrors `emel_error_detail` from the original source: every phase of
/// every component's state machine writes one of these on any non-OK exit,
/// and it survives until the next successful call to that component clears
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorDetail {
    pub status: ErrorKind,
    pub domain: ErrorDomain,
    pub phase: Phase,
    pub reason: Reason,
    /// Index of the offending element (tensor, ubatch, ...), or `-1`.
    pub index: i32,
    /// Extra context: an offset, a tensor id, a chunk id, ...
    pub aux: i32,
}

impl ErrorDetail {
    pub const fn new(
        status: ErrorKind,
        domain: ErrorDomain,
        phase: Phase,
        reason: Reason,
        index: i32,
        aux: i32,
    ) -> Self {
        ErrorDetail { status, domain, phase, reason, index, aux }
    }

}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} in {:?}::{:?} (reason={:?}, index={}, aux={})",
            self.status, self.domain, self.phase, self.reason, self.index, self.aux
        )
    }
}
