//! Lane-wide vector primitives used by the solver kernel.
//!
//! Slices are the lanes of one group. `dot` is the group reduction: eight
//! partial sums folded pairwise, which keeps the summation order fixed for a
//! given length.

#[inline(always)]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut acc = [0.0f32; 8];
    let mut ca = a.chunks_exact(8);
    let mut cb = b.chunks_exact(8);
    for (xa, xb) in ca.by_ref().zip(cb.by_ref()) {
        acc[0] += xa[0] * xb[0];
        acc[1] += xa[1] * xb[1];
        acc[2] += xa[2] * xb[2];
        acc[3] += xa[3] * xb[3];
        acc[4] += xa[4] * xb[4];
        acc[5] += xa[5] * xb[5];
        acc[6] += xa[6] * xb[6];
        acc[7] += xa[7] * xb[7];
    }
    for (x, y) in ca.remainder().iter().zip(cb.remainder()) {
        acc[0] += x * y;
    }
    ((acc[0] + acc[1]) + (acc[2] + acc[3])) + ((acc[4] + acc[5]) + (acc[6] + acc[7]))
}

/// `y += alpha * x`
#[inline(always)]
pub fn axpy(alpha: f32, x: &[f32], y: &mut [f32]) {
    debug_assert_eq!(x.len(), y.len());
    let mut cx = x.chunks_exact(8);
    let mut cy = y.chunks_exact_mut(8);
    for (xs, ys) in cx.by_ref().zip(cy.by_ref()) {
        ys[0] += alpha * xs[0];
        ys[1] += alpha * xs[1];
        ys[2] += alpha * xs[2];
        ys[3] += alpha * xs[3];
        ys[4] += alpha * xs[4];
        ys[5] += alpha * xs[5];
        ys[6] += alpha * xs[6];
        ys[7] += alpha * xs[7];
    }
    for (xs, ys) in cx.remainder().iter().zip(cy.into_remainder()) {
        *ys += alpha * xs;
    }
}

/// `p = x + beta * p`
#[inline(always)]
pub fn xpay(x: &[f32], beta: f32, p: &mut [f32]) {
    debug_assert_eq!(x.len(), p.len());
    for (pi, &xi) in p.iter_mut().zip(x) {
        *pi = xi + beta * *pi;
    }
}

/// `out += Mᵗ v` for a row-major `m` with `v.len()` leading rows of width
/// `out.len()`.
#[inline]
pub fn gemv_t_acc(m: &[f32], v: &[f32], out: &mut [f32]) {
    let width = out.len();
    for (d, &vd) in v.iter().enumerate() {
        if vd != 0.0 {
            axpy(vd, &m[d * width..(d + 1) * width], out);
        }
    }
}
