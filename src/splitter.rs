//! Batch Splitter (spec §4.2): carves one input batch into micro-batches
//! honoring a requested maximum size, a partition mode, optional sequence
//! grouping, and an optional output mask.
//!
//! Grounded on the field set used by
//! `original_source/tools/bench/batch_splitter_bench.cpp` (no direct
//! splitter source file was retrieved for this component, so the request
//! shape below follows that benchmark's fixture and spec §4.2 directly).

use tracing::{debug, instrument};

use crate::config::MAX_UBATCHES;
use crate::error::{ErrorDetail, ErrorDomain, ErrorKind, Phase, Reason};
use crate::types::{SeqId, TokenId};

/// Partition strategy (spec §4.2 "Modes").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitMode {
    /// Contiguous groups of at most `n_ubatch` tokens.
    Simple,
    /// Like `Simple`, but every micro-batch shares one primary sequence id.
    Equal,
    /// One micro-batch per distinct sequence mask, in input order.
    Seq,
}

/// Which tokens contribute an output slot (spec §4.2 "Output counting").
#[derive(Debug, Clone)]
pub enum OutputSelector {
    All,
    Mask(Vec<bool>),
    LastOnly,
}

/// A split request. `seq_primary_ids` and `seq_masks` are parallel to
/// `token_ids` when present; `equal_sequential` only affects `Equal` mode.
pub struct SplitRequest<'a> {
    pub token_ids: &'a [TokenId],
    pub n_ubatch: i32,
    pub mode: SplitMode,
    pub seq_primary_ids: Option<&'a [SeqId]>,
    pub seq_masks: Option<&'a [Vec<u64>]>,
    /// `Equal` mode only: when `true`, primary sequence ids must already be
    /// non-decreasing and groups form contiguous runs (order preserved);
    /// when `false`, tokens are grouped by first-seen sequence id order
    /// (stable grouping, resolving spec §9's Open Question — see
    /// DESIGN.md).
    pub equal_sequential: bool,
    pub output: OutputSelector,
}

/// Result of a successful [`split`] call.
#[derive(Debug, Clone)]
pub struct SplitResult {
    pub ubatch_sizes: Vec<i32>,
    pub total_outputs: i32,
    /// Present for `Equal`/`Seq` modes: permutation mapping emitted-order
    /// positions back to original input indices.
    pub token_indices: Option<Vec<usize>>,
    /// Prefix sums over `ubatch_sizes`, one longer than `ubatch_sizes`.
    pub ubatch_token_offsets: Vec<i32>,
    /// How many output slots each micro-batch contributes, parallel to
    /// `ubatch_sizes`; sums to `total_outputs`. Lets the executor hold the
    /// compute backend to an honest per-ubatch output count instead of
    /// assuming every ubatch produces one (spec §4.2 "Output counting").
    pub ubatch_output_counts: Vec<i32>,
}

impl SplitResult {
    pub fn ubatch_count(&self) -> i32 {
        self.ubatch_sizes.len() as i32
    }
}

fn err(phase: Phase, reason: Reason, index: i32, aux: i32) -> (ErrorKind, ErrorDetail) {
    let detail = ErrorDetail::new(ErrorKind::InvalidArgument, ErrorDomain::BatchSplitter, phase, reason, index, aux);
    (detail.status, detail)
}

#[instrument(skip(req), fields(n_tokens = req.token_ids.len(), mode = ?req.mode))]
pub fn split(req: &SplitRequest<'_>) -> std::result::Result<SplitResult, (ErrorKind, ErrorDetail)> {
    let n_tokens = req.token_ids.len();
    if n_tokens == 0 {
        return Err(err(Phase::Validate, Reason::InvalidArgument, -1, 0));
    }
    let n_ubatch = if req.n_ubatch <= 0 { n_tokens as i32 } else { req.n_ubatch };
    if n_ubatch < 1 {
        return Err(err(Phase::Validate, Reason::InvalidArgument, -1, n_ubatch));
    }
    if let Some(ids) = req.seq_primary_ids {
        if ids.len() != n_tokens {
            return Err(err(Phase::Validate, Reason::InvalidArgument, -1, ids.len() as i32));
        }
    }
    if let Some(masks) = req.seq_masks {
        if masks.len() != n_tokens {
            return Err(err(Phase::Validate, Reason::InvalidArgument, -1, masks.len() as i32));
        }
    }
    if let OutputSelector::Mask(mask) = &req.output {
        if mask.len() != n_tokens {
            return Err(err(Phase::Validate, Reason::InvalidArgument, -1, mask.len() as i32));
        }
    }

    let (groups, token_indices) = match req.mode {
        SplitMode::Simple => (split_simple(n_tokens, n_ubatch as usize), None),
        SplitMode::Equal => {
            let ids = req
                .seq_primary_ids
                .ok_or_else(|| err(Phase::Validate, Reason::InvalidArgument, -1, -1))?;
            split_equal(ids, n_ubatch as usize, req.equal_sequential)?
        }
        SplitMode::Seq => {
            let masks = req
                .seq_masks
                .ok_or_else(|| err(Phase::Validate, Reason::InvalidArgument, -1, -1))?;
            split_seq(masks)
        }
    };

    if groups.len() > MAX_UBATCHES {
        return Err(err(Phase::Split, Reason::CapacityExceeded, -1, groups.len() as i32));
    }

    let ubatch_sizes: Vec<i32> = groups.iter().map(|g| g.len() as i32).collect();
    let total: i32 = ubatch_sizes.iter().sum();
    if total as usize != n_tokens {
        return Err(err(Phase::Split, Reason::InvalidArgument, -1, total));
    }
    for &size in &ubatch_sizes {
        if size < 1 || size > n_ubatch {
            return Err(err(Phase::Split, Reason::InvalidArgument, -1, size));
        }
    }

    let mut ubatch_token_offsets = Vec::with_capacity(ubatch_sizes.len() + 1);
    let mut acc = 0i32;
    ubatch_token_offsets.push(0);
    for &s in &ubatch_sizes {
        acc += s;
        ubatch_token_offsets.push(acc);
    }

    let flat_order: Vec<usize> = match &token_indices {
        Some(_) => groups.iter().flatten().copied().collect(),
        None => (0..n_tokens).collect(),
    };

    let total_outputs = count_outputs(&req.output, &flat_order, n_tokens);
    let ubatch_output_counts = per_ubatch_output_counts(&req.output, &flat_order, &ubatch_token_offsets, n_tokens);

    debug!(ubatch_count = ubatch_sizes.len(), total_outputs, "batch splitter produced plan");

    Ok(SplitResult {
        ubatch_sizes,
        total_outputs,
        token_indices: token_indices.map(|_| flat_order),
        ubatch_token_offsets,
        ubatch_output_counts,
    })
}

fn split_simple(n_tokens: usize, n_ubatch: usize) -> Vec<Vec<usize>> {
    (0..n_tokens)
        .collect::<Vec<_>>()
        .chunks(n_ubatch)
        .map(|c| c.to_vec())
        .collect()
}

fn split_equal(
    ids: &[SeqId],
    n_ubatch: usize,
    sequential: bool,
) -> std::result::Result<(Vec<Vec<usize>>, Option<Vec<usize>>), (ErrorKind, ErrorDetail)> {
    if sequential {
        for w in ids.windows(2) {
            if w[1] < w[0] {
                return Err(err(Phase::Split, Reason::NotMonotonic, -1, -1));
            }
        }
        let mut groups: Vec<Vec<usize>> = Vec::new();
        for (i, &id) in ids.iter().enumerate() {
            let open_new = match groups.last() {
                Some(g) if !g.is_empty() && ids[g[0]] == id && g.len() < n_ubatch => false,
                _ => true,
            };
            if open_new {
                groups.push(vec![i]);
            } else {
                groups.last_mut().unwrap().push(i);
            }
        }
        Ok((groups, None))
    } else {
        let mut order: Vec<SeqId> = Vec::new();
        for &id in ids {
            if !order.contains(&id) {
                order.push(id);
            }
        }
        let mut groups: Vec<Vec<usize>> = Vec::new();
        for id in order {
            let indices: Vec<usize> =
                ids.iter().enumerate().filter(|(_, &v)| v == id).map(|(i, _)| i).collect();
            for chunk in indices.chunks(n_ubatch) {
                groups.push(chunk.to_vec());
            }
        }
        Ok((groups, Some(Vec::new())))
    }
}

fn split_seq(masks: &[Vec<u64>]) -> (Vec<Vec<usize>>, Option<Vec<usize>>) {
    let mut order: Vec<&Vec<u64>> = Vec::new();
    for m in masks {
        if !order.iter().any(|o| *o == m) {
            order.push(m);
        }
    }
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for mask in order {
        let indices: Vec<usize> =
            masks.iter().enumerate().filter(|(_, m)| *m == mask).map(|(i, _)| i).collect();
        groups.push(indices);
    }
    (groups, Some(Vec::new()))
}

/// Per-ubatch companion to [`count_outputs`]: how many output slots each
/// ubatch (indexed by its range into `flat_order`, per `ubatch_token_offsets`)
/// contributes under `selector`.
fn per_ubatch_output_counts(
    selector: &OutputSelector,
    flat_order: &[usize],
    ubatch_token_offsets: &[i32],
    n_tokens: usize,
) -> Vec<i32> {
    let num_ubatches = ubatch_token_offsets.len() - 1;
    let mut counts = vec![0i32; num_ubatches];
    match selector {
        OutputSelector::All => {
            for i in 0..num_ubatches {
                counts[i] = ubatch_token_offsets[i + 1] - ubatch_token_offsets[i];
            }
        }
        OutputSelector::Mask(mask) => {
            for i in 0..num_ubatches {
                let start = ubatch_token_offsets[i] as usize;
                let end = ubatch_token_offsets[i + 1] as usize;
                counts[i] = flat_order[start..end].iter().filter(|&&orig| mask[orig]).count() as i32;
            }
        }
        OutputSelector::LastOnly => {
            if n_tokens == 0 {
                return counts;
            }
            let last_orig = n_tokens - 1;
            let pos = flat_order.iter().position(|&orig| orig == last_orig).unwrap_or(n_tokens - 1);
            for i in 0..num_ubatches {
                let start = ubatch_token_offsets[i] as usize;
                let end = ubatch_token_offsets[i + 1] as usize;
                if pos >= start && pos < end {
                    counts[i] = 1;
                }
            }
        }
    }
    counts
}

fn count_outputs(selector: &OutputSelector, flat_order: &[usize], n_tokens: usize) -> i32 {
    match selector {
        OutputSelector::All => n_tokens as i32,
        OutputSelector::Mask(mask) => flat_order.iter().filter(|&&i| mask[i]).count() as i32,
        OutputSelector::LastOnly => {
            if n_tokens == 0 {
                0
            } else {
                1
            }
        }
    }
}
