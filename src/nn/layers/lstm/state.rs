//! Matching persistent recurrent state to the batch count of a new call.
//!
//! Each adaptation reports what it did so the backward pass can fold the
//! gradient back onto the state's source layout.

use crate::{
    error::{Result, TensorustError},
    tensor::Scalar,
};

/// How a hidden state was matched to the requested batch count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HiddenAdaptation {
    Unchanged,
    /// A single sample replicated into every batch slot.
    Broadcast { to: usize },
    /// Only the last of `from` batch slots kept.
    ReducedToLast { from: usize },
}

/// How the cell state buffer was matched to `output_size * batch_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellAdaptation {
    /// No previous cell state; zero-filled.
    Fresh,
    Unchanged,
    /// A shorter state of length `from` repeated to fill the target.
    Tiled { from: usize },
    /// A longer state of length `from` cut down to its tail.
    TailKept { from: usize },
    /// Lengths not aligned to the output size; the overlapping prefix of
    /// the `from` old values kept, the rest zero.
    PrefixKept { from: usize },
}

/// Writes `hidden` (batch count `from`, `sample_len` values per slot) adapted
/// to batch count `to` into `dst`.
///
/// Batch 1 is broadcast to any batch count, any batch count reduces to 1 by
/// keeping the last slot; every other mismatch is an error and leaves `dst`
/// untouched.
pub fn adapt_hidden<T: Scalar>(
    hidden: &[T],
    sample_len: usize,
    from: usize,
    to: usize,
    dst: &mut Vec<T>,
) -> Result<HiddenAdaptation> {
    let adaptation = if from == to {
        HiddenAdaptation::Unchanged
    } else if from == 1 {
        HiddenAdaptation::Broadcast { to }
    } else if to == 1 {
        HiddenAdaptation::ReducedToLast { from }
    } else {
        return Err(TensorustError::BatchMismatch {
            previous: from,
            requested: to,
        });
    };

    dst.clear();
    match adaptation {
        HiddenAdaptation::Unchanged => dst.extend_from_slice(hidden),
        HiddenAdaptation::Broadcast { to } => {
            log::debug!("broadcasting hidden state to batch count {to}");
            for _ in 0..to {
                dst.extend_from_slice(&hidden[..sample_len]);
            }
        }
        HiddenAdaptation::ReducedToLast { from } => {
            log::debug!("reducing hidden state from batch count {from} to its last slot");
            dst.extend_from_slice(&hidden[(from - 1) * sample_len..from * sample_len]);
        }
    }
    Ok(adaptation)
}

/// Folds a gradient over the adapted hidden state back onto the source
/// layout, writing it into `dst`.
pub fn fold_hidden_grad<T: Scalar>(
    grad: &[T],
    sample_len: usize,
    adaptation: HiddenAdaptation,
    dst: &mut Vec<T>,
) {
    dst.clear();
    match adaptation {
        HiddenAdaptation::Unchanged => dst.extend_from_slice(grad),
        HiddenAdaptation::Broadcast { .. } => {
            dst.resize(sample_len, T::zero());
            for slot in grad.chunks(sample_len) {
                for (d, &g) in dst.iter_mut().zip(slot) {
                    *d = *d + g;
                }
            }
        }
        HiddenAdaptation::ReducedToLast { from } => {
            dst.resize((from - 1) * sample_len, T::zero());
            dst.extend_from_slice(grad);
        }
    }
}

/// Resizes `cell` in place to `output_size * batch_count` values.
pub fn adapt_cell<T: Scalar>(cell: &mut Vec<T>, output_size: usize, batch_count: usize) -> CellAdaptation {
    let expected = output_size * batch_count;
    let len = cell.len();

    if len == 0 {
        cell.resize(expected, T::zero());
        return CellAdaptation::Fresh;
    }
    if len == expected {
        return CellAdaptation::Unchanged;
    }
    if len % output_size == 0 {
        if len > expected {
            cell.drain(..len - expected);
            return CellAdaptation::TailKept { from: len };
        }
        for i in len..expected {
            let v = cell[i - len];
            cell.push(v);
        }
        return CellAdaptation::Tiled { from: len };
    }

    log::warn!(
        "cell state of length {len} does not align with output size {output_size}; \
         keeping the first {} values and zero-filling",
        len.min(expected)
    );
    cell.resize(expected, T::zero());
    CellAdaptation::PrefixKept { from: len }
}

/// Folds a gradient over the adapted cell state back onto the source
/// layout, writing it into `dst`.
pub fn fold_cell_grad<T: Scalar>(grad: &[T], adaptation: CellAdaptation, dst: &mut Vec<T>) {
    dst.clear();
    match adaptation {
        CellAdaptation::Fresh | CellAdaptation::Unchanged => dst.extend_from_slice(grad),
        CellAdaptation::Tiled { from } => {
            dst.resize(from, T::zero());
            for (i, &g) in grad.iter().enumerate() {
                dst[i % from] = dst[i % from] + g;
            }
        }
        CellAdaptation::TailKept { from } => {
            dst.resize(from - grad.len(), T::zero());
            dst.extend_from_slice(grad);
        }
        CellAdaptation::PrefixKept { from } => {
            let kept = from.min(grad.len());
            dst.extend_from_slice(&grad[..kept]);
            dst.resize(from, T::zero());
        }
    }
}
