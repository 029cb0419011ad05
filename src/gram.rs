use faer::{linalg::matmul::matmul, Accum, MatMut, MatRef, Par};

use crate::error::{Error, Result};

/// Writes `FF = AᵗA` for the row-major `rows × vdim` matrix `factors` into the
/// row-major `vdim × vdim` buffer `ff`.
///
/// Runs on the rayon pool it is called from; the product is complete when
/// this returns.
pub fn gramian_into(factors: &[f32], rows: usize, vdim: usize, ff: &mut [f32]) -> Result<()> {
    if factors.len() != rows * vdim {
        return Err(Error::ShapeMismatch {
            what: "fixed factors",
            expected: rows * vdim,
            got: factors.len(),
        });
    }
    if ff.len() != vdim * vdim {
        return Err(Error::ShapeMismatch {
            what: "gram matrix",
            expected: vdim * vdim,
            got: ff.len(),
        });
    }

    let a = MatRef::from_row_major_slice(factors, rows, vdim);
    let out = MatMut::from_row_major_slice_mut(ff, vdim, vdim);
    matmul(out, Accum::Replace, a.transpose(), a, 1.0f32, Par::rayon(0));
    Ok(())
}
