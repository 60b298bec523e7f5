//! Pipeline-wide numeric constants and runtime configuration (spec §6).
//!
//! These are compile-time defaults matching the original source's typical
//! values; [`PipelineConfig`] lets a caller override the per-run knobs
//! (stream count, kv size, alignment, max buffer size) that are not
//! compile-time constants in the original either.

/// Maximum number of sequences live at once.
pub const MAX_SEQ: usize = 64;
/// Number of 64-bit words needed to cover `MAX_SEQ` bits.
pub const SEQ_WORDS: usize = (MAX_SEQ + 63) / 64;
/// Maximum number of micro-batches planned for one decode call.
pub const MAX_UBATCHES: usize = 512;
/// Maximum number of KV cells across all streams.
pub const MAX_KV_CELLS: i32 = 262_144;
/// Maximum number of distinct streams.
pub const MAX_STREAMS: usize = 32;
/// Maximum number of distinct pending cross-stream copy pairs.
pub const MAX_STREAM_COPY: usize = 32;
/// Maximum number of tensors in one allocator call.
pub const MAX_TENSORS: usize = 2048;
/// Maximum number of chunks the allocator will open.
pub const MAX_CHUNKS: usize = 64;
/// Minimum tensor alignment the allocator will honor.
pub const MIN_ALIGNMENT: i32 = 16;

/// Per-run configuration for the KV cache and memory coordinator.
///
/// Distinct from the compile-time constants above: this is the "requested
/// capacity"/"number of streams" knobs a caller picks per model, not a
/// config file — the core has no persisted configuration (spec §6).
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    /// Number of cells in each stream's ring.
    pub kv_size: i32,
    /// Number of streams available to bind sequences to.
    pub n_stream: i32,
    /// Tensor alignment in bytes; must be a positive power of two.
    pub alignment: i32,
    /// Maximum bytes per allocator chunk.
    pub max_buffer_size: i32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            kv_size: 4096,
            n_stream: 1,
            alignment: MIN_ALIGNMENT,
            max_buffer_size: 1 << 30,
        }
    }
}

impl PipelineConfig {
    pub fn with_kv_size(mut self, kv_size: i32) -> Self {
        self.kv_size = kv_size;
        self
    }

    pub fn with_n_stream(mut self, n_stream: i32) -> Self {
        self.n_stream = n_stream;
        self
    }

    pub fn with_alignment(mut self, alignment: i32) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn with_max_buffer_size(mut self, max_buffer_size: i32) -> Self {
        self.max_buffer_size = max_buffer_size;
        self
    }
}
