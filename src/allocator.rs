//! Tensor Allocator (spec §4.1): partitions tensor descriptors into aligned
//! storage chunks, allocates backing memory, and binds placements.
//!
//! Grounded on `original_source/src/emel/tensor/allocator/actions.hpp` and
//! `sm.hpp`: the five-phase pipeline (`validate → scan_tensors →
//! partition_ranges → allocate_ranges → initialize_tensors → assemble`) is
//! carried over as five private methods driven by one public entry point,
//! since the Rust port has no need for a template-driven transition table
//! (see spec §9, "Template-driven compile-time state machines").

use tracing::{debug, instrument, warn};

use crate::config::{MAX_CHUNKS, MAX_TENSORS};
use crate::error::{ErrorDetail, ErrorDomain, ErrorKind, Phase, Reason};
use crate::types::{TensorFlags, TensorId};

/// A tensor descriptor submitted to the allocator (spec §3).
#[derive(Debug, Clone)]
pub struct TensorDesc {
    pub tensor_id: TensorId,
    pub alloc_size: i32,
    /// Up to four source-tensor ids (graph edges); carried for descriptor
    /// completeness but not consumed by the placement algorithm itself —
    /// scheduling by dependency order is a caller concern (spec §1
    /// Non-goals: "does not own a scheduler").
    pub src_tensor_ids: [Option<TensorId>; 4],
    pub flags: TensorFlags,
    pub view_src_id: Option<TensorId>,
}

impl TensorDesc {
    pub fn new(tensor_id: TensorId, alloc_size: i32) -> Self {
        TensorDesc {
            tensor_id,
            alloc_size,
            src_tensor_ids: [None; 4],
            flags: TensorFlags::default(),
            view_src_id: None,
        }
    }

    pub fn as_view_of(mut self, src: TensorId) -> Self {
        self.flags.is_view = true;
        self.view_src_id = Some(src);
        self
    }

    pub fn with_external_data(mut self) -> Self {
        self.flags.has_external_data = true;
        self
    }
}

/// The `(chunk_id, offset, aligned_size)` triple assigned to a tensor
/// (spec §3 "Tensor placement"). View tensors and zero-size tensors never
/// receive a placement entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorPlacement {
    pub chunk_id: i32,
    pub offset: i32,
    pub aligned_size: i32,
}

/// Successful result of [`TensorAllocator::allocate_tensors`].
#[derive(Debug, Clone)]
pub struct AllocationResult {
    pub total_bytes: i64,
    pub chunk_count: i32,
    pub chunk_sizes: Vec<i32>,
    /// Placements in descriptor input order; `None` for view/zero-size
    /// tensors which receive no placement.
    pub placements: Vec<Option<TensorPlacement>>,
}

fn is_power_of_two(v: i32) -> bool {
    v > 0 && (v & (v - 1)) == 0
}

fn sat_add(lhs: i64, rhs: i64) -> i64 {
    lhs.saturating_add(rhs)
}

fn align_up(value: i32, alignment: i32) -> Option<i32> {
    if value <= 0 {
        return Some(0);
    }
    let v = value as i64;
    let a = alignment as i64;
    let aligned = ((v + a - 1) / a) * a;
    if aligned > i32::MAX as i64 {
        None
    } else {
        Some(aligned as i32)
    }
}

/// Observable phase of the allocator, mirroring spec §4.1's state machine.
/// Exposed for introspection/testing; every public operation is
/// synchronous and returns in one of `Idle` (after `release`), `Done`
/// (after a successful `allocate_tensors`) or `Failed` (after a rejected
/// or aborted call).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorState {
    Idle,
    Done,
    Failed,
}

/// The tensor allocator. Owns every chunk buffer it allocates; `release`
/// is the only path to free them (spec §5 "Shared resources").
pub struct TensorAllocator {
    state: AllocatorState,
    chunks: Vec<Vec<u8>>,
    last_result: Option<AllocationResult>,
}

impl Default for TensorAllocator {
    fn default() -> Self {
        TensorAllocator { state: AllocatorState::Idle, chunks: Vec::new(), last_result: None }
    }
}

impl TensorAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> AllocatorState {
        self.state
    }

    /// `true` once `release()` would be a no-op: no chunks outstanding.
    pub fn is_idle(&self) -> bool {
        self.chunks.is_empty() && self.last_result.is_none()
    }

    /// Read-only view of chunk `chunk_id`'s backing bytes, if allocated
    /// (empty when the call used `no_alloc`).
    pub fn chunk_bytes(&self, chunk_id: usize) -> Option<&[u8]> {
        self.chunks.get(chunk_id).map(|v| v.as_slice())
    }

    pub fn last_result(&self) -> Option<&AllocationResult> {
        self.last_result.as_ref()
    }

    /// Partition `descs` into chunks of at most `max_buffer_size` bytes,
    /// allocate backing storage unless `no_alloc`, and bind placements.
    ///
    /// On any failure the allocator releases everything it allocated
    /// during this call and returns to `Idle`-equivalent (no chunks held).
    #[instrument(skip(self, descs), fields(tensor_count = descs.len()))]
    pub fn allocate_tensors(
        &mut self,
        descs: &[TensorDesc],
        alignment: i32,
        max_buffer_size: i32,
        no_alloc: bool,
    ) -> std::result::Result<AllocationResult, (ErrorKind, ErrorDetail)> {
        self.release();

        if let Err(detail) = self.validate(descs, alignment, max_buffer_size) {
            self.state = AllocatorState::Failed;
            warn!(?detail, "tensor allocator validation failed");
            return Err((detail.status, detail));
        }

        let effective_sizes = match self.scan_tensors(descs, alignment) {
            Ok(sizes) => sizes,
            Err(detail) => {
                self.state = AllocatorState::Failed;
                warn!(?detail, "tensor allocator scan failed");
                return Err((detail.status, detail));
            }
        };

        let (chunk_sizes, tensor_chunk_ids, tensor_offsets, total_bytes) =
            self.partition_ranges(&effective_sizes, max_buffer_size);

        if !no_alloc {
            if let Err(detail) = self.allocate_ranges(&chunk_sizes) {
                self.state = AllocatorState::Failed;
                warn!(?detail, "tensor allocator allocation failed");
                return Err((detail.status, detail));
            }
        }

        if let Err(detail) = self.initialize_tensors(
            descs,
            &effective_sizes,
            &tensor_chunk_ids,
            &tensor_offsets,
            &chunk_sizes,
            no_alloc,
        ) {
            self.release();
            self.state = AllocatorState::Failed;
            warn!(?detail, "tensor allocator initialization failed");
            return Err((detail.status, detail));
        }

        let placements = descs
            .iter()
            .enumerate()
            .map(|(i, _)| {
                if effective_sizes[i] <= 0 {
                    None
                } else {
                    Some(TensorPlacement {
                        chunk_id: tensor_chunk_ids[i],
                        offset: tensor_offsets[i],
                        aligned_size: effective_sizes[i],
                    })
                }
            })
            .collect();

        let result = AllocationResult {
            total_bytes,
            chunk_count: chunk_sizes.len() as i32,
            chunk_sizes,
            placements,
        };

        debug!(
            chunk_count = result.chunk_count,
            total_bytes = result.total_bytes,
            "tensor allocator assembled result"
        );

        self.state = AllocatorState::Done;
        self.last_result = Some(result.clone());
        Ok(result)
    }

    /// Free every chunk this allocator currently owns. Idempotent.
    pub fn release(&mut self) {
        self.chunks.clear();
        self.last_result = None;
        self.state = AllocatorState::Idle;
    }

    fn validate(
        &self,
        descs: &[TensorDesc],
        alignment: i32,
        max_buffer_size: i32,
    ) -> std::result::Result<(), ErrorDetail> {
        if descs.len() > MAX_TENSORS {
            return Err(self.err(Phase::Validate, Reason::InvalidArgument, -1, descs.len() as i32));
        }
        if !is_power_of_two(alignment) {
            return Err(self.err(Phase::Validate, Reason::InvalidArgument, -1, alignment));
        }
        if max_buffer_size <= 0 {
            return Err(self.err(Phase::Validate, Reason::InvalidArgument, -1, max_buffer_size));
        }
        Ok(())
    }

    fn scan_tensors(
        &self,
        descs: &[TensorDesc],
        alignment: i32,
    ) -> std::result::Result<Vec<i32>, ErrorDetail> {
        let mut seen = std::collections::HashSet::with_capacity(descs.len());
        let mut effective_sizes = vec![0i32; descs.len()];

        for (i, t) in descs.iter().enumerate() {
            if t.tensor_id < 0 || t.alloc_size < 0 || !seen.insert(t.tensor_id) {
                let reason = if seen.contains(&t.tensor_id) && t.tensor_id >= 0 {
                    Reason::DuplicateTensorId
                } else {
                    Reason::InvalidArgument
                };
                return Err(self.err(Phase::ScanTensors, reason, i as i32, t.tensor_id));
            }

            if t.flags.is_view && t.view_src_id.is_none() {
                return Err(self.err(Phase::ScanTensors, Reason::InvalidViewSource, i as i32, -1));
            }

            if t.flags.has_external_data || t.flags.is_view || t.alloc_size == 0 {
                effective_sizes[i] = 0;
                continue;
            }

            match align_up(t.alloc_size, alignment) {
                Some(aligned) => effective_sizes[i] = aligned,
                None => {
                    return Err(self.err(
                        Phase::ScanTensors,
                        Reason::AlignmentOverflow,
                        i as i32,
                        t.alloc_size,
                    ));
                }
            }
        }
        Ok(effective_sizes)
    }

    /// Walk descriptors in input order, opening a new chunk whenever the
    /// current one would exceed `max_buffer_size`. Never splits a single
    /// tensor across chunks.
    fn partition_ranges(
        &self,
        effective_sizes: &[i32],
        max_buffer_size: i32,
    ) -> (Vec<i32>, Vec<i32>, Vec<i32>, i64) {
        let mut chunk_sizes: Vec<i32> = Vec::new();
        let mut tensor_chunk_ids = vec![-1i32; effective_sizes.len()];
        let mut tensor_offsets = vec![-1i32; effective_sizes.len()];
        let mut total_bytes: i64 = 0;
        let mut current_chunk: i32 = -1;

        for (i, &sz) in effective_sizes.iter().enumerate() {
            if sz <= 0 {
                continue;
            }
            if current_chunk < 0 {
                chunk_sizes.push(0);
                current_chunk = (chunk_sizes.len() - 1) as i32;
            }
            let idx = current_chunk as usize;
            let cur_bytes = chunk_sizes[idx];
            let overflow = cur_bytes > 0
                && sat_add(cur_bytes as i64, sz as i64) > max_buffer_size as i64;
            if overflow {
                chunk_sizes.push(0);
                current_chunk = (chunk_sizes.len() - 1) as i32;
            }
            let idx = current_chunk as usize;
            tensor_chunk_ids[i] = current_chunk;
            tensor_offsets[i] = chunk_sizes[idx];
            chunk_sizes[idx] = sat_add(chunk_sizes[idx] as i64, sz as i64) as i32;
            total_bytes = sat_add(total_bytes, sz as i64);
        }

        (chunk_sizes, tensor_chunk_ids, tensor_offsets, total_bytes)
    }

    fn allocate_ranges(&mut self, chunk_sizes: &[i32]) -> std::result::Result<(), ErrorDetail> {
        if chunk_sizes.len() > MAX_CHUNKS {
            return Err(self.err(
                Phase::AllocateRanges,
                Reason::CapacityExceeded,
                -1,
                chunk_sizes.len() as i32,
            ));
        }
        let mut chunks = Vec::with_capacity(chunk_sizes.len());
        for (i, &size) in chunk_sizes.iter().enumerate() {
            if size <= 0 {
                return Err(self.err(Phase::AllocateRanges, Reason::InvalidArgument, i as i32, size));
            }
            chunks.push(vec![0u8; size as usize]);
        }
        self.chunks = chunks;
        Ok(())
    }

    fn initialize_tensors(
        &self,
        descs: &[TensorDesc],
        effective_sizes: &[i32],
        tensor_chunk_ids: &[i32],
        tensor_offsets: &[i32],
        chunk_sizes: &[i32],
        no_alloc: bool,
    ) -> std::result::Result<(), ErrorDetail> {
        let known_ids: std::collections::HashSet<TensorId> =
            descs.iter().map(|t| t.tensor_id).collect();

        for (i, t) in descs.iter().enumerate() {
            if t.flags.is_view {
                match t.view_src_id {
                    Some(src) if known_ids.contains(&src) => continue,
                    _ => {
                        return Err(self.err(
                            Phase::InitializeTensors,
                            Reason::InvalidViewSource,
                            i as i32,
                            t.view_src_id.unwrap_or(-1),
                        ));
                    }
                }
            }
            if effective_sizes[i] <= 0 {
                continue;
            }
            let chunk_id = tensor_chunk_ids[i];
            let offset = tensor_offsets[i];
            if chunk_id < 0 || chunk_id as usize >= chunk_sizes.len() || offset < 0 {
                return Err(self.err(
                    Phase::InitializeTensors,
                    Reason::OffsetOutOfRange,
                    i as i32,
                    offset,
                ));
            }
            if !no_alloc && self.chunks.get(chunk_id as usize).is_none() {
                return Err(self.err(
                    Phase::InitializeTensors,
                    Reason::AllocationFailed,
                    i as i32,
                    chunk_id,
                ));
            }
            let end_offset = sat_add(offset as i64, effective_sizes[i] as i64);
            if end_offset <= 0 || end_offset > chunk_sizes[chunk_id as usize] as i64 {
                return Err(self.err(
                    Phase::InitializeTensors,
                    Reason::OffsetOutOfRange,
                    i as i32,
                    end_offset as i32,
                ));
            }
        }
        Ok(())
    }

    fn err(&self, phase: Phase, reason: Reason, index: i32, aux: i32) -> ErrorDetail {
        let status = match reason {
            Reason::AllocationFailed | Reason::OffsetOutOfRange | Reason::AlignmentOverflow => {
                ErrorKind::Backend
            }
            _ => ErrorKind::InvalidArgument,
        };
        ErrorDetail::new(status, ErrorDomain::TensorAllocator, phase, reason, index, aux)
    }
}
