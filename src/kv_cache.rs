//! Key/Value Cache (spec §4.3): per-stream rings of cells that the
//! executor plans into, applies, and may later roll back.
//!
//! Validation predicates are grounded verbatim on
//! `original_source/src/emel/kv/cache/guards.hpp`; the per-request
//! validate/step/publish shape is grounded on `sm.hpp`'s state machine,
//! collapsed here into one method per operation since this port has no
//! need for a template-driven transition table.

use tracing::{debug, instrument, warn};

use crate::config::{MAX_KV_CELLS, MAX_STREAMS, MAX_STREAM_COPY, MAX_UBATCHES};
use crate::error::{ErrorDetail, ErrorDomain, ErrorKind, Phase, Reason};
use crate::types::{is_full_copy_range, valid_pos_range, Position, SeqId, StreamId, UbatchDesc};

type CacheResult<T> = std::result::Result<T, (ErrorKind, ErrorDetail)>;

fn err(phase: Phase, reason: Reason, index: i32, aux: i32) -> (ErrorKind, ErrorDetail) {
    let detail = ErrorDetail::new(ErrorKind::InvalidArgument, ErrorDomain::KvCache, phase, reason, index, aux);
    (detail.status, detail)
}

fn backend_err(phase: Phase, reason: Reason, index: i32, aux: i32) -> (ErrorKind, ErrorDetail) {
    let detail = ErrorDetail::new(ErrorKind::Backend, ErrorDomain::KvCache, phase, reason, index, aux);
    (detail.status, detail)
}

/// One occupied cell: the sequence owning it and its position.
#[derive(Debug, Clone, Copy)]
struct Cell {
    seq_id: SeqId,
    position: Position,
}

#[derive(Debug, Default)]
struct Stream {
    cells: Vec<Option<Cell>>,
    has_shift: bool,
}

/// A plan produced by [`KvCache::prepare`]: one slot offset per ubatch.
#[derive(Debug, Clone)]
pub struct PreparePlan {
    pub slot_offsets: Vec<i32>,
    pub planned_ubatch_count: i32,
}

/// Backend hooks for [`KvCache::apply_updates`] (spec §4.3 "Cross-stream
/// copy discipline"); replaces the original's function-pointer callbacks.
pub trait UpdatesBackend {
    fn stream_copy(&mut self, src_stream: StreamId, dst_stream: StreamId) -> bool;
    fn apply_shift(&mut self, stream_id: StreamId) -> bool;
}

/// Per-stream ring cache for one model's KV state.
pub struct KvCache {
    kv_size: i32,
    n_stream: i32,
    seq_to_stream: Vec<StreamId>,
    streams: Vec<Stream>,
    planned_ubatch_count: i32,
    applied_ubatches: i32,
    ubatch_sizes: Vec<i32>,
    ubatch_stream_ids: Vec<StreamId>,
    ubatch_seq_ids: Vec<SeqId>,
    slot_offsets: Vec<i32>,
    pending_copy: Vec<(StreamId, StreamId)>,
    last_error: Option<ErrorDetail>,
}

impl KvCache {
    pub fn new(kv_size: i32, n_stream: i32) -> Self {
        let n_stream_usize = n_stream.max(0) as usize;
        KvCache {
            kv_size,
            n_stream,
            seq_to_stream: vec![0; crate::config::MAX_SEQ],
            streams: (0..n_stream_usize)
                .map(|_| Stream { cells: vec![None; kv_size.max(0) as usize], has_shift: false })
                .collect(),
            planned_ubatch_count: 0,
            applied_ubatches: 0,
            ubatch_sizes: Vec::new(),
            ubatch_stream_ids: Vec::new(),
            ubatch_seq_ids: Vec::new(),
            slot_offsets: Vec::new(),
            pending_copy: Vec::new(),
            last_error: None,
        }
    }

    pub fn bind_seq_to_stream(&mut self, seq_id: SeqId, stream_id: StreamId) {
        if (seq_id as usize) < self.seq_to_stream.len() {
            self.seq_to_stream[seq_id as usize] = stream_id;
        }
    }

    pub fn last_error(&self) -> Option<ErrorDetail> {
        self.last_error
    }

    pub fn applied_ubatches(&self) -> i32 {
        self.applied_ubatches
    }

    pub fn planned_ubatch_count(&self) -> i32 {
        self.planned_ubatch_count
    }

    fn valid_stream_id(&self, stream_id: StreamId) -> bool {
        stream_id >= 0 && stream_id < self.n_stream
    }

    fn valid_seq_id(seq_id: SeqId) -> bool {
        seq_id >= 0 && (seq_id as usize) < crate::config::MAX_SEQ
    }

    /// Compute `slot_offsets[]` for every planned ubatch (spec §4.3
    /// `prepare`). Grounded on `guard::valid_prepare_request`.
    #[instrument(skip(self, sizes, stream_ids, seq_ids))]
    pub fn prepare(
        &mut self,
        sizes: &[i32],
        stream_ids: &[StreamId],
        seq_ids: &[SeqId],
        requested_capacity: i32,
    ) -> CacheResult<PreparePlan> {
        let ubatch_count = sizes.len();
        if ubatch_count == 0 || ubatch_count > MAX_UBATCHES {
            let e = err(Phase::Validate, Reason::InvalidArgument, -1, ubatch_count as i32);
            self.last_error = Some(e.1);
            return Err(e);
        }
        if requested_capacity > MAX_KV_CELLS {
            let e = err(Phase::Validate, Reason::CapacityExceeded, -1, requested_capacity);
            self.last_error = Some(e.1);
            return Err(e);
        }
        if self.n_stream <= 0 || self.n_stream as usize > MAX_STREAMS {
            let e = err(Phase::Validate, Reason::InvalidArgument, -1, self.n_stream);
            self.last_error = Some(e.1);
            return Err(e);
        }
        if stream_ids.len() != ubatch_count || seq_ids.len() != ubatch_count {
            let e = err(Phase::Validate, Reason::InvalidArgument, -1, -1);
            self.last_error = Some(e.1);
            return Err(e);
        }

        let kv_size = if requested_capacity > 0 { self.kv_size.max(requested_capacity) } else { self.kv_size };
        if kv_size <= 0 || kv_size > MAX_KV_CELLS {
            let e = err(Phase::Validate, Reason::InvalidArgument, -1, kv_size);
            self.last_error = Some(e.1);
            return Err(e);
        }

        let mut total = 0i32;
        for i in 0..ubatch_count {
            let size = sizes[i];
            if size <= 0 || size > kv_size {
                let e = err(Phase::Validate, Reason::InvalidArgument, i as i32, size);
                self.last_error = Some(e.1);
                return Err(e);
            }
            if !self.valid_stream_id(stream_ids[i]) {
                let e = err(Phase::Validate, Reason::InvalidArgument, i as i32, stream_ids[i]);
                self.last_error = Some(e.1);
                return Err(e);
            }
            if !Self::valid_seq_id(seq_ids[i]) {
                let e = err(Phase::Validate, Reason::InvalidArgument, i as i32, seq_ids[i]);
                self.last_error = Some(e.1);
                return Err(e);
            }
            if self.seq_to_stream[seq_ids[i] as usize] != stream_ids[i] {
                let e = err(Phase::Validate, Reason::InvalidArgument, i as i32, seq_ids[i]);
                self.last_error = Some(e.1);
                return Err(e);
            }
            total += size;
            if total > kv_size {
                let e = err(Phase::PrepareSlots, Reason::CapacityExceeded, i as i32, total);
                self.last_error = Some(e.1);
                return Err(e);
            }
        }

        let mut slot_offsets = vec![0i32; ubatch_count];
        let mut cursor = 0i32;
        for (i, &size) in sizes.iter().enumerate() {
            slot_offsets[i] = cursor;
            cursor += size;
        }

        self.ubatch_sizes = sizes.to_vec();
        self.ubatch_stream_ids = stream_ids.to_vec();
        self.ubatch_seq_ids = seq_ids.to_vec();
        self.slot_offsets = slot_offsets.clone();
        self.planned_ubatch_count = ubatch_count as i32;
        self.applied_ubatches = 0;
        self.last_error = None;

        debug!(ubatch_count, kv_size, "kv cache prepared slots");

        Ok(PreparePlan { slot_offsets, planned_ubatch_count: ubatch_count as i32 })
    }

    /// Mark the cells for ubatch `ubatch_index` as occupied (spec §4.3
    /// `apply_ubatch`). Grounded on `guard::valid_apply_step_request`.
    #[instrument(skip(self, positions))]
    pub fn apply_ubatch(&mut self, ubatch_index: i32, positions: Option<&[Position]>) -> CacheResult<()> {
        if ubatch_index != self.applied_ubatches {
            let e = err(Phase::Apply, Reason::NotMonotonic, ubatch_index, self.applied_ubatches);
            self.last_error = Some(e.1);
            return Err(e);
        }
        if ubatch_index < 0 || ubatch_index >= self.planned_ubatch_count {
            let e = err(Phase::Apply, Reason::InvalidArgument, ubatch_index, self.planned_ubatch_count);
            self.last_error = Some(e.1);
            return Err(e);
        }
        let idx = ubatch_index as usize;
        let size = self.ubatch_sizes[idx];
        let start = self.slot_offsets[idx];
        let stream_id = self.ubatch_stream_ids[idx];
        let seq_id = self.ubatch_seq_ids[idx];

        if size <= 0 || start < 0 || start + size > self.kv_size {
            let e = err(Phase::Apply, Reason::OffsetOutOfRange, ubatch_index, start);
            self.last_error = Some(e.1);
            return Err(e);
        }
        if !self.valid_stream_id(stream_id) || !Self::valid_seq_id(seq_id) {
            let e = err(Phase::Apply, Reason::InvalidArgument, ubatch_index, stream_id);
            self.last_error = Some(e.1);
            return Err(e);
        }
        if let Some(p) = positions {
            if (p.len() as i32) < size {
                let e = err(Phase::Apply, Reason::InvalidArgument, ubatch_index, p.len() as i32);
                self.last_error = Some(e.1);
                return Err(e);
            }
        }

        let stream = &mut self.streams[stream_id as usize];
        for i in 0..size {
            let pos = positions.map(|p| p[i as usize]).unwrap_or(i);
            stream.cells[(start + i) as usize] = Some(Cell { seq_id, position: pos });
        }
        self.applied_ubatches += 1;
        self.last_error = None;
        debug!(ubatch_index, size, "kv cache applied ubatch");
        Ok(())
    }

    /// Undo ubatches `[from_ubatch_index, applied_ubatches)` (spec §4.3
    /// `rollback`). Grounded on `guard::valid_rollback_step_request`.
    #[instrument(skip(self))]
    pub fn rollback(&mut self, from_ubatch_index: i32) -> CacheResult<()> {
        if from_ubatch_index < 0
            || from_ubatch_index > self.applied_ubatches
            || from_ubatch_index > self.planned_ubatch_count
        {
            let e = err(Phase::Rollback, Reason::InvalidArgument, from_ubatch_index, self.applied_ubatches);
            self.last_error = Some(e.1);
            return Err(e);
        }

        for i in from_ubatch_index..self.applied_ubatches {
            let idx = i as usize;
            let size = self.ubatch_sizes[idx];
            let start = self.slot_offsets[idx];
            let stream_id = self.ubatch_stream_ids[idx];
            if size <= 0 || start < 0 || start + size > self.kv_size || !self.valid_stream_id(stream_id) {
                let e = err(Phase::Rollback, Reason::InvalidArgument, i, start);
                self.last_error = Some(e.1);
                return Err(e);
            }
        }

        for i in from_ubatch_index..self.applied_ubatches {
            let idx = i as usize;
            let size = self.ubatch_sizes[idx];
            let start = self.slot_offsets[idx];
            let stream_id = self.ubatch_stream_ids[idx];
            let stream = &mut self.streams[stream_id as usize];
            for j in 0..size {
                stream.cells[(start + j) as usize] = None;
            }
        }

        self.applied_ubatches = from_ubatch_index;
        self.last_error = None;
        debug!(from_ubatch_index, "kv cache rolled back");
        Ok(())
    }

    /// Drop `seq_id`'s membership in `[pos_start, pos_end]`; `-1` means
    /// "all sequences" (spec §4.3 `seq_remove`).
    pub fn seq_remove(&mut self, seq_id: SeqId, pos_start: Position, pos_end: Position) -> CacheResult<()> {
        if seq_id != -1 {
            if !Self::valid_seq_id(seq_id) || !self.valid_stream_id(self.seq_to_stream[seq_id as usize]) {
                let e = err(Phase::SeqRemove, Reason::InvalidArgument, -1, seq_id);
                self.last_error = Some(e.1);
                return Err(e);
            }
        }
        if !valid_pos_range(pos_start, pos_end) {
            let e = err(Phase::SeqRemove, Reason::InvalidArgument, -1, pos_start);
            self.last_error = Some(e.1);
            return Err(e);
        }

        for stream in self.streams.iter_mut() {
            for cell in stream.cells.iter_mut() {
                if let Some(c) = cell {
                    let in_seq = seq_id == -1 || c.seq_id == seq_id;
                    let in_range = pos_start < 0 || pos_end < 0 || (c.position >= pos_start && c.position <= pos_end);
                    if in_seq && in_range {
                        *cell = None;
                    }
                }
            }
        }
        self.last_error = None;
        Ok(())
    }

    /// Copy `src`'s membership onto `dst` over `[pos_start, pos_end]`
    /// (spec §4.3 `seq_copy`). Cross-stream copies require the full ring
    /// range and are deferred until [`KvCache::apply_updates`].
    pub fn seq_copy(&mut self, src: SeqId, dst: SeqId, pos_start: Position, pos_end: Position) -> CacheResult<()> {
        if !Self::valid_seq_id(src) || !Self::valid_seq_id(dst) {
            let e = err(Phase::SeqCopy, Reason::InvalidArgument, -1, src);
            self.last_error = Some(e.1);
            return Err(e);
        }
        let src_stream = self.seq_to_stream[src as usize];
        let dst_stream = self.seq_to_stream[dst as usize];
        if !self.valid_stream_id(src_stream) || !self.valid_stream_id(dst_stream) {
            let e = err(Phase::SeqCopy, Reason::InvalidArgument, -1, src_stream);
            self.last_error = Some(e.1);
            return Err(e);
        }
        if !valid_pos_range(pos_start, pos_end) {
            let e = err(Phase::SeqCopy, Reason::InvalidArgument, -1, pos_start);
            self.last_error = Some(e.1);
            return Err(e);
        }

        if src_stream == dst_stream {
            let kv_size = self.kv_size;
            let stream = &mut self.streams[src_stream as usize];
            let copies: Vec<(usize, Cell)> = stream
                .cells
                .iter()
                .enumerate()
                .filter_map(|(i, c)| c.map(|cell| (i, cell)))
                .filter(|(_, cell)| {
                    cell.seq_id == src
                        && (pos_start < 0 || pos_end < 0 || (cell.position >= pos_start && cell.position <= pos_end))
                })
                .collect();
            for (i, cell) in copies {
                if i < kv_size as usize {
                    stream.cells[i] = Some(Cell { seq_id: dst, position: cell.position });
                }
            }
            self.last_error = None;
            return Ok(());
        }

        if !is_full_copy_range(pos_start, pos_end, self.kv_size) {
            let e = err(Phase::SeqCopy, Reason::InvalidArgument, -1, pos_start);
            self.last_error = Some(e.1);
            return Err(e);
        }
        let has_pair = self.pending_copy.iter().any(|&(s, d)| s == src_stream && d == dst_stream);
        if !has_pair && self.pending_copy.len() >= MAX_STREAM_COPY {
            let e = err(Phase::SeqCopy, Reason::CapacityExceeded, -1, self.pending_copy.len() as i32);
            self.last_error = Some(e.1);
            return Err(e);
        }
        if !has_pair {
            self.pending_copy.push((src_stream, dst_stream));
        }
        self.last_error = None;
        Ok(())
    }

    /// Drop every sequence except `seq_id` from every cell (spec §4.3
    /// `seq_keep`).
    pub fn seq_keep(&mut self, seq_id: SeqId) -> CacheResult<()> {
        if !Self::valid_seq_id(seq_id) || !self.valid_stream_id(self.seq_to_stream[seq_id as usize]) {
            let e = err(Phase::SeqKeep, Reason::InvalidArgument, -1, seq_id);
            self.last_error = Some(e.1);
            return Err(e);
        }
        for stream in self.streams.iter_mut() {
            for cell in stream.cells.iter_mut() {
                if let Some(c) = cell {
                    if c.seq_id != seq_id {
                        *cell = None;
                    }
                }
            }
        }
        self.last_error = None;
        Ok(())
    }

    /// Add `delta` to positions of `seq_id` in `[pos_start, pos_end]`
    /// (spec §4.3 `seq_add`), checked against overflow.
    pub fn seq_add(&mut self, seq_id: SeqId, pos_start: Position, pos_end: Position, delta: i32) -> CacheResult<()> {
        if !Self::valid_seq_id(seq_id) || !self.valid_stream_id(self.seq_to_stream[seq_id as usize]) {
            let e = err(Phase::SeqAdd, Reason::InvalidArgument, -1, seq_id);
            self.last_error = Some(e.1);
            return Err(e);
        }
        if !valid_pos_range(pos_start, pos_end) {
            let e = err(Phase::SeqAdd, Reason::InvalidArgument, -1, pos_start);
            self.last_error = Some(e.1);
            return Err(e);
        }
        let stream_id = self.seq_to_stream[seq_id as usize];
        let stream = &mut self.streams[stream_id as usize];
        for cell in stream.cells.iter_mut() {
            if let Some(c) = cell {
                let in_range = pos_start < 0 || pos_end < 0 || (c.position >= pos_start && c.position <= pos_end);
                if c.seq_id == seq_id && in_range {
                    match c.position.checked_add(delta) {
                        Some(p) if p >= 0 => c.position = p,
                        _ => {
                            let e = backend_err(Phase::SeqAdd, Reason::PositionOverflow, -1, delta);
                            self.last_error = Some(e.1);
                            return Err(e);
                        }
                    }
                }
            }
        }
        self.last_error = None;
        Ok(())
    }

    /// Divide positions of `seq_id` in `[pos_start, pos_end]` by
    /// `divisor` (spec §4.3 `seq_div`).
    pub fn seq_div(&mut self, seq_id: SeqId, pos_start: Position, pos_end: Position, divisor: i32) -> CacheResult<()> {
        if divisor <= 0 {
            let e = err(Phase::SeqDiv, Reason::InvalidArgument, -1, divisor);
            self.last_error = Some(e.1);
            return Err(e);
        }
        if !Self::valid_seq_id(seq_id) || !self.valid_stream_id(self.seq_to_stream[seq_id as usize]) {
            let e = err(Phase::SeqDiv, Reason::InvalidArgument, -1, seq_id);
            self.last_error = Some(e.1);
            return Err(e);
        }
        if !valid_pos_range(pos_start, pos_end) {
            let e = err(Phase::SeqDiv, Reason::InvalidArgument, -1, pos_start);
            self.last_error = Some(e.1);
            return Err(e);
        }
        let stream_id = self.seq_to_stream[seq_id as usize];
        let stream = &mut self.streams[stream_id as usize];
        for cell in stream.cells.iter_mut() {
            if let Some(c) = cell {
                let in_range = pos_start < 0 || pos_end < 0 || (c.position >= pos_start && c.position <= pos_end);
                if c.seq_id == seq_id && in_range {
                    c.position /= divisor;
                }
            }
        }
        self.last_error = None;
        Ok(())
    }

    /// Drain pending cross-stream copies and per-cell shift flags via
    /// backend callbacks (spec §4.3 `apply_updates`). Requires a copy
    /// callback whenever copies are pending and a shift callback whenever
    /// any stream reports a pending shift, checked at both validate and
    /// step (mirrors the original's two-guard structure).
    pub fn apply_updates(&mut self, backend: &mut dyn UpdatesBackend) -> CacheResult<()> {
        let shift_streams: Vec<StreamId> = self
            .streams
            .iter()
            .enumerate()
            .filter(|(_, s)| s.has_shift)
            .map(|(i, _)| i as StreamId)
            .collect();

        for &(src, dst) in &self.pending_copy.clone() {
            if !backend.stream_copy(src, dst) {
                let e = backend_err(Phase::ApplyUpdates, Reason::MissingCallback, -1, src);
                self.last_error = Some(e.1);
                return Err(e);
            }
        }
        for stream_id in shift_streams {
            if !backend.apply_shift(stream_id) {
                let e = backend_err(Phase::ApplyUpdates, Reason::MissingCallback, -1, stream_id);
                self.last_error = Some(e.1);
                return Err(e);
            }
            self.streams[stream_id as usize].has_shift = false;
        }
        self.pending_copy.clear();
        self.last_error = None;
        Ok(())
    }

    pub fn mark_shift(&mut self, stream_id: StreamId) {
        if self.valid_stream_id(stream_id) {
            self.streams[stream_id as usize].has_shift = true;
        }
    }

    pub fn occupied_count(&self, stream_id: StreamId) -> usize {
        self.streams
            .get(stream_id as usize)
            .map(|s| s.cells.iter().filter(|c| c.is_some()).count())
            .unwrap_or(0)
    }
}

/// Convenience wrapper turning planned ubatches into the parallel arrays
/// `prepare` expects.
pub fn plan_arrays(ubatches: &[UbatchDesc]) -> (Vec<i32>, Vec<StreamId>, Vec<SeqId>) {
    let sizes = ubatches.iter().map(|u| u.size).collect();
    let streams = ubatches.iter().map(|u| u.stream_id).collect();
    let seqs = ubatches.iter().map(|u| u.seq_id).collect();
    (sizes, streams, seqs)
}
