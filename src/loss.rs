//! Training loss bookkeeping.
//!
//! Each launched group owns one numerator/denominator slot; the host sums the
//! slots once the launch has returned.

use std::ops::AddAssign;

use crate::device::DeviceBuffer;
use crate::error::Result;

/// Loss totals of one or more batches.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BatchLoss {
    pub numerator: f64,
    pub denominator: f64,
}

impl BatchLoss {
    pub fn into_pair(self) -> (f64, f64) {
        (self.numerator, self.denominator)
    }

    /// `numerator / denominator`, or `None` while nothing was accumulated.
    pub fn ratio(&self) -> Option<f64> {
        (self.denominator != 0.0).then(|| self.numerator / self.denominator)
    }
}

impl AddAssign for BatchLoss {
    fn add_assign(&mut self, rhs: Self) {
        self.numerator += rhs.numerator;
        self.denominator += rhs.denominator;
    }
}

/// Per-group partial sums written by the kernel.
pub struct LossAccumulator {
    nume: DeviceBuffer<f64>,
    deno: DeviceBuffer<f64>,
}

/// The slot of one group.
pub struct LossSlot<'a> {
    pub nume: &'a mut f64,
    pub deno: &'a mut f64,
}

impl LossAccumulator {
    /// Allocates `groups` zeroed slots.
    pub fn zeroed(groups: usize) -> Result<Self> {
        Ok(Self {
            nume: DeviceBuffer::zeroed(groups)?,
            deno: DeviceBuffer::zeroed(groups)?,
        })
    }

    pub fn groups(&self) -> usize {
        self.nume.len()
    }

    pub fn slots_mut(&mut self) -> impl Iterator<Item = LossSlot<'_>> {
        self.nume
            .as_mut_slice()
            .iter_mut()
            .zip(self.deno.as_mut_slice().iter_mut())
            .map(|(nume, deno)| LossSlot { nume, deno })
    }

    /// Host-side reduction over all groups.
    pub fn reduce(&self) -> BatchLoss {
        BatchLoss {
            numerator: self.nume.as_slice().iter().sum(),
            denominator: self.deno.as_slice().iter().sum(),
        }
    }
}
