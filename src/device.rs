//! The compute device and the memory it owns.
//!
//! A `Device` is a dedicated worker pool with a fixed number of parallel
//! units; the lane width only shapes the padded row width (see
//! `AlsOptions::vdim`). Launches block until every group has
//! finished, and transfers are plain synchronous copies, so the host never
//! observes a buffer while a kernel is writing it.

use std::mem::size_of;

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::config::AlsOptions;
use crate::error::{Error, Result};
use crate::solver::Axis;

pub struct Device {
    pool: ThreadPool,
    groups_per_unit: usize,
}

impl Device {
    pub fn new(opts: &AlsOptions) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(opts.num_workers)
            .thread_name(|i| format!("cgals-unit-{i}"))
            .build()?;
        log::debug!(
            "device started with {} units, lane width {}",
            pool.current_num_threads(),
            opts.lane_width
        );
        Ok(Self {
            pool,
            groups_per_unit: opts.groups_per_unit,
        })
    }

    pub fn units(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Groups in one launch grid. Fixed per device, independent of the batch.
    pub fn num_groups(&self) -> usize {
        self.units() * self.groups_per_unit
    }

    /// Runs `f` on the device and returns once all work spawned by it is done.
    pub fn launch<R, F>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(f)
    }
}

/// Memory owned by the device.
#[derive(Debug)]
pub struct DeviceBuffer<T> {
    data: Vec<T>,
}

impl<T: Copy + Default> DeviceBuffer<T> {
    pub fn zeroed(len: usize) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|_| Error::OutOfMemory {
            bytes: len.saturating_mul(size_of::<T>()),
        })?;
        data.resize(len, T::default());
        Ok(Self { data })
    }

    pub fn from_host(src: &[T]) -> Result<Self> {
        let mut buf = Self::zeroed(src.len())?;
        buf.data.copy_from_slice(src);
        Ok(buf)
    }

    /// Host to device copy of the whole buffer.
    pub fn upload(&mut self, src: &[T], what: &'static str) -> Result<()> {
        if src.len() != self.data.len() {
            return Err(Error::TransferMismatch {
                what,
                expected: self.data.len(),
                got: src.len(),
            });
        }
        self.data.copy_from_slice(src);
        Ok(())
    }

    /// Device to host copy of the whole buffer.
    pub fn download(&self, dst: &mut [T], what: &'static str) -> Result<()> {
        if dst.len() != self.data.len() {
            return Err(Error::TransferMismatch {
                what,
                expected: self.data.len(),
                got: dst.len(),
            });
        }
        dst.copy_from_slice(&self.data);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }
}

/// Device-resident factor matrices and the Gram matrix of the fixed side.
#[derive(Debug)]
pub struct DeviceModel {
    p: DeviceBuffer<f32>,
    q: DeviceBuffer<f32>,
    ff: DeviceBuffer<f32>,
    p_rows: usize,
    q_rows: usize,
    vdim: usize,
}

/// Borrowed buffers for one solve: the rows being solved, the fixed side
/// and its Gram matrix.
pub struct SolveBuffers<'a> {
    pub target: &'a mut [f32],
    pub fixed: &'a [f32],
    pub ff: &'a [f32],
}

impl DeviceModel {
    pub fn new(p: &[f32], p_rows: usize, q: &[f32], q_rows: usize, vdim: usize) -> Result<Self> {
        check_shape("P", p, p_rows, vdim)?;
        check_shape("Q", q, q_rows, vdim)?;
        Ok(Self {
            p: DeviceBuffer::from_host(p)?,
            q: DeviceBuffer::from_host(q)?,
            ff: DeviceBuffer::zeroed(vdim * vdim)?,
            p_rows,
            q_rows,
            vdim,
        })
    }

    pub fn vdim(&self) -> usize {
        self.vdim
    }

    pub fn rows(&self, axis: Axis) -> usize {
        match axis {
            Axis::User => self.p_rows,
            Axis::Item => self.q_rows,
        }
    }

    pub fn factors(&self, axis: Axis) -> &DeviceBuffer<f32> {
        match axis {
            Axis::User => &self.p,
            Axis::Item => &self.q,
        }
    }

    pub fn factors_mut(&mut self, axis: Axis) -> &mut DeviceBuffer<f32> {
        match axis {
            Axis::User => &mut self.p,
            Axis::Item => &mut self.q,
        }
    }

    /// The fixed side for solving `axis` together with the Gram buffer.
    pub fn gram_inputs(&mut self, axis: Axis) -> (&[f32], usize, &mut [f32]) {
        let (fixed, rows) = match axis {
            Axis::User => (&self.q, self.q_rows),
            Axis::Item => (&self.p, self.p_rows),
        };
        (fixed.as_slice(), rows, self.ff.as_mut_slice())
    }

    pub fn solve_buffers(&mut self, axis: Axis) -> SolveBuffers<'_> {
        let (target, fixed) = match axis {
            Axis::User => (&mut self.p, &self.q),
            Axis::Item => (&mut self.q, &self.p),
        };
        SolveBuffers {
            target: target.as_mut_slice(),
            fixed: fixed.as_slice(),
            ff: self.ff.as_slice(),
        }
    }
}

fn check_shape(what: &'static str, data: &[f32], rows: usize, vdim: usize) -> Result<()> {
    let mismatch = |expected| Error::ShapeMismatch {
        what,
        expected,
        got: data.len(),
    };
    let expected = rows.checked_mul(vdim).ok_or_else(|| mismatch(usize::MAX))?;
    if data.len() != expected {
        return Err(mismatch(expected));
    }
    Ok(())
}

/// Host view of a CSR interaction block for rows `[start_x, next_x)`.
///
/// `indptr` may be a window of a larger offsets array; offsets are taken
/// relative to `indptr[0]`.
#[derive(Debug, Clone, Copy)]
pub struct CsrBatch<'a> {
    pub indptr: &'a [i64],
    pub keys: &'a [i32],
    pub vals: &'a [f32],
}

impl<'a> CsrBatch<'a> {
    pub fn new(indptr: &'a [i64], keys: &'a [i32], vals: &'a [f32]) -> Self {
        Self { indptr, keys, vals }
    }

    pub fn rows(&self) -> usize {
        self.indptr.len().saturating_sub(1)
    }

    /// Checks that the block covers `rows` rows and that every key addresses
    /// one of `key_space` opposite-axis rows.
    pub fn validate(&self, rows: usize, key_space: usize) -> Result<()> {
        if self.indptr.len() != rows + 1 {
            return Err(Error::InvalidBatch(format!(
                "indptr has {} entries, expected {} for {} rows",
                self.indptr.len(),
                rows + 1,
                rows
            )));
        }
        if self.keys.len() != self.vals.len() {
            return Err(Error::InvalidBatch(format!(
                "{} keys but {} values",
                self.keys.len(),
                self.vals.len()
            )));
        }
        let base = self.indptr[0];
        if base < 0 {
            return Err(Error::InvalidBatch(format!("negative offset {base}")));
        }
        if let Some(w) = self.indptr.windows(2).position(|w| w[1] < w[0]) {
            return Err(Error::InvalidBatch(format!(
                "offsets decrease at row {w}: {} > {}",
                self.indptr[w],
                self.indptr[w + 1]
            )));
        }
        let nnz = (self.indptr[rows] - base) as usize;
        if nnz != self.keys.len() {
            return Err(Error::InvalidBatch(format!(
                "offsets span {nnz} interactions but {} keys were given",
                self.keys.len()
            )));
        }
        if let Some(&bad) = self
            .keys
            .iter()
            .find(|&&k| k < 0 || k as usize >= key_space)
        {
            return Err(Error::InvalidBatch(format!(
                "key {bad} outside [0, {key_space})"
            )));
        }
        Ok(())
    }
}

/// Device copy of one interaction batch with offsets rebased to zero.
/// Dropping it releases the device memory.
pub struct StagedBatch {
    indptr: DeviceBuffer<usize>,
    keys: DeviceBuffer<u32>,
    vals: DeviceBuffer<f32>,
}

impl StagedBatch {
    /// Copies a validated batch to the device.
    pub fn stage(batch: &CsrBatch<'_>) -> Result<Self> {
        let base = batch.indptr.first().copied().unwrap_or(0);
        let mut indptr = DeviceBuffer::zeroed(batch.indptr.len())?;
        for (dst, &src) in indptr.as_mut_slice().iter_mut().zip(batch.indptr) {
            *dst = (src - base) as usize;
        }
        let mut keys = DeviceBuffer::zeroed(batch.keys.len())?;
        for (dst, &src) in keys.as_mut_slice().iter_mut().zip(batch.keys) {
            *dst = src as u32;
        }
        let vals = DeviceBuffer::from_host(batch.vals)?;
        Ok(Self { indptr, keys, vals })
    }

    pub fn rows(&self) -> usize {
        self.indptr.len().saturating_sub(1)
    }

    pub fn nnz(&self) -> usize {
        self.keys.len()
    }

    /// Keys and weights of local row `i`.
    pub fn row(&self, i: usize) -> (&[u32], &[f32]) {
        let offsets = self.indptr.as_slice();
        let (beg, end) = (offsets[i], offsets[i + 1]);
        (&self.keys.as_slice()[beg..end], &self.vals.as_slice()[beg..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfers_reject_size_mismatch() {
        let mut buf = DeviceBuffer::<f32>::zeroed(4).unwrap();
        assert!(matches!(
            buf.upload(&[1.0; 3], "P"),
            Err(Error::TransferMismatch { expected: 4, got: 3, .. })
        ));
        buf.upload(&[1.0, 2.0, 3.0, 4.0], "P").unwrap();
        let mut host = [0.0f32; 4];
        buf.download(&mut host, "P").unwrap();
        assert_eq!(host, [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn oversized_allocation_reports_out_of_memory() {
        let err = DeviceBuffer::<f32>::zeroed(usize::MAX / 2).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory { .. }));
    }

    #[test]
    fn group_count_scales_with_units() {
        let mut opts = AlsOptions::default();
        opts.num_workers = 3;
        opts.groups_per_unit = 5;
        let device = Device::new(&opts).unwrap();
        assert_eq!(device.units(), 3);
        assert_eq!(device.num_groups(), 15);
        assert_eq!(device.launch(rayon::current_num_threads), 3);
    }

    #[test]
    fn model_rejects_unpadded_factors() {
        let err = DeviceModel::new(&[0.0; 6], 2, &[0.0; 8], 2, 4).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { what: "P", expected: 8, got: 6 }));
    }

    #[test]
    fn model_rejects_overflowing_row_count() {
        let err = DeviceModel::new(&[], usize::MAX, &[], 0, 4).unwrap_err();
        assert!(matches!(
            err,
            Error::ShapeMismatch { what: "P", expected: usize::MAX, got: 0 }
        ));
    }

    #[test]
    fn staging_rebases_windowed_offsets() {
        // rows 2..4 of a larger matrix: offsets start at 5
        let indptr = [5i64, 7, 7, 8];
        let keys = [0i32, 2, 1];
        let vals = [1.0f32, 2.0, 3.0];
        let batch = CsrBatch::new(&indptr, &keys, &vals);
        batch.validate(3, 3).unwrap();
        let staged = StagedBatch::stage(&batch).unwrap();
        assert_eq!(staged.rows(), 3);
        assert_eq!(staged.nnz(), 3);
        assert_eq!(staged.row(0), (&[0u32, 2][..], &[1.0f32, 2.0][..]));
        assert_eq!(staged.row(1).0.len(), 0);
        assert_eq!(staged.row(2), (&[1u32][..], &[3.0f32][..]));
    }

    #[test]
    fn validation_catches_malformed_batches() {
        let vals = [1.0f32, 1.0];
        let wrong_rows = CsrBatch::new(&[0, 1, 2], &[0, 1], &vals);
        assert!(wrong_rows.validate(3, 4).is_err());

        let decreasing = CsrBatch::new(&[0, 2, 1], &[0, 1], &vals);
        assert!(decreasing.validate(2, 4).is_err());

        let bad_key = CsrBatch::new(&[0, 1, 2], &[0, 4], &vals);
        assert!(bad_key.validate(2, 4).is_err());

        let short_keys = CsrBatch::new(&[0, 1, 3], &[0, 1], &vals);
        assert!(short_keys.validate(2, 4).is_err());

        let ok = CsrBatch::new(&[0, 1, 2], &[0, 3], &vals);
        ok.validate(2, 4).unwrap();
    }
}
