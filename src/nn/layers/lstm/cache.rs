//! Per-step caches for truncated backpropagation through time.
//!
//! Records live in one arena and move between three index lists: `pending`
//! (forward done, backward not yet), `used` (consumed by backward while the
//! window is still open) and `free` (reusable). The `used` list is only
//! returned to `free` once the window drains, so the arena grows to the
//! deepest window seen and stays there.

use super::state::{CellAdaptation, HiddenAdaptation};
use crate::{autodiff::Producer, tensor::Scalar};

/// Where the hidden state fed to the lateral transform came from.
#[derive(Debug, Clone)]
pub struct LateralSource<T> {
    /// Batch count of the hidden state before adaptation.
    pub batch_count: usize,
    pub producer: Option<Producer<T>>,
    pub adaptation: HiddenAdaptation,
    /// Serial of the forward step that produced it, if one did.
    pub origin: Option<u64>,
}

/// Everything one forward step recorded for its backward.
#[derive(Debug)]
pub struct StepCache<T> {
    pub serial: u64,
    pub batch_count: usize,
    pub c_prev: Vec<T>,
    pub a: Vec<T>,
    pub i: Vec<T>,
    pub f: Vec<T>,
    pub o: Vec<T>,
    pub c: Vec<T>,
    /// Hidden state before adaptation; only meaningful when `lateral` is set.
    pub h_prev: Vec<T>,
    pub lateral: Option<LateralSource<T>>,
    pub cell_adaptation: CellAdaptation,
    pub cell_origin: Option<u64>,
}

impl<T: Scalar> StepCache<T> {
    fn empty() -> Self {
        Self {
            serial: 0,
            batch_count: 0,
            c_prev: Vec::new(),
            a: Vec::new(),
            i: Vec::new(),
            f: Vec::new(),
            o: Vec::new(),
            c: Vec::new(),
            h_prev: Vec::new(),
            lateral: None,
            cell_adaptation: CellAdaptation::Fresh,
            cell_origin: None,
        }
    }

    fn resize(&mut self, len: usize) {
        for buf in [
            &mut self.c_prev,
            &mut self.a,
            &mut self.i,
            &mut self.f,
            &mut self.o,
            &mut self.c,
        ] {
            buf.clear();
            buf.resize(len, T::zero());
        }
        self.h_prev.clear();
        self.lateral = None;
    }
}

#[derive(Debug)]
pub struct CachePool<T> {
    records: Vec<StepCache<T>>,
    pending: Vec<usize>,
    used: Vec<usize>,
    free: Vec<usize>,
}

impl<T: Scalar> CachePool<T> {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            pending: Vec::new(),
            used: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Takes a record sized for `len` values per buffer and pushes it as the
    /// most recent pending step.
    pub fn acquire(&mut self, len: usize) -> &mut StepCache<T> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.records.push(StepCache::empty());
                log::debug!("step cache pool grew to {}", self.records.len());
                self.records.len() - 1
            }
        };
        self.pending.push(index);
        let record = &mut self.records[index];
        record.resize(len);
        record
    }

    /// The most recent pending step.
    pub fn last(&self) -> Option<&StepCache<T>> {
        self.pending.last().map(|&index| &self.records[index])
    }

    /// Marks the most recent pending step consumed and returns it.
    ///
    /// The record stays readable until the next `acquire`.
    pub fn consume(&mut self) -> Option<&StepCache<T>> {
        let index = self.pending.pop()?;
        self.used.push(index);
        if self.pending.is_empty() {
            self.free.append(&mut self.used);
        }
        Some(&self.records[index])
    }

    /// Drops every pending step.
    pub fn clear(&mut self) {
        self.free.append(&mut self.pending);
        self.free.append(&mut self.used);
    }

    pub fn depth(&self) -> usize {
        self.pending.len()
    }

    /// Records allocated so far.
    pub fn capacity(&self) -> usize {
        self.records.len()
    }
}
