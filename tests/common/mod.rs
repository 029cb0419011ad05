#![allow(dead_code)]

use cgals::{AlsOptions, AlsSolver};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Options with a small lane width so factor matrices stay readable.
pub fn options(d: usize, lane_width: usize) -> AlsOptions {
    AlsOptions {
        d,
        lane_width,
        num_workers: 2,
        groups_per_unit: 3,
        ..AlsOptions::default()
    }
}

pub fn solver(opts: AlsOptions) -> AlsSolver {
    AlsSolver::new(opts).expect("solver starts")
}

/// `rows × vdim` factors with the first `d` lanes drawn uniformly and the
/// padding lanes zero.
pub fn random_factors(rng: &mut StdRng, rows: usize, d: usize, vdim: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; rows * vdim];
    for row in out.chunks_mut(vdim) {
        for v in &mut row[..d] {
            *v = rng.random_range(-0.5f32..0.5);
        }
    }
    out
}

pub fn seeded(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// CSR arrays from per-row `(key, weight)` lists.
pub fn csr(rows: &[Vec<(i32, f32)>]) -> (Vec<i64>, Vec<i32>, Vec<f32>) {
    let mut indptr = vec![0i64];
    let mut keys = Vec::new();
    let mut vals = Vec::new();
    for row in rows {
        for &(k, w) in row {
            keys.push(k);
            vals.push(w);
        }
        indptr.push(keys.len() as i64);
    }
    (indptr, keys, vals)
}

pub fn row(factors: &[f32], vdim: usize, i: usize) -> &[f32] {
    &factors[i * vdim..(i + 1) * vdim]
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
