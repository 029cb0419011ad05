//! Conjugate-gradient least-squares kernel.
//!
//! For a row `x` of the matrix being solved, the normal equations of the
//! implicit-feedback objective are
//!
//! ```text
//! (FF + λ·I + Σ_k α·w_k·q_k·q_kᵗ) x = Σ_k (1 + α·w_k)·q_k
//! ```
//!
//! where `FF` is the Gram matrix of the fixed side and `q_k` are the fixed
//! rows the entity interacted with. The left-hand operator is never formed:
//! each CG step applies it as the dense Gram product plus one rank-one
//! correction per interaction.
//!
//! A launch spreads the batch over a fixed grid of groups. Row `i` of the
//! batch belongs to group `i % groups`; each group owns one scratch set and
//! one loss slot, and only writes its own rows.

use rayon::prelude::*;

use crate::blas::{axpy, dot, gemv_t_acc, xpay};
use crate::device::{Device, StagedBatch};
use crate::loss::{LossAccumulator, LossSlot};
use crate::solver::Axis;

#[derive(Debug, Clone, Copy)]
pub struct KernelParams {
    pub dim: usize,
    pub vdim: usize,
    pub alpha: f32,
    /// Regularization constant of the axis being solved.
    pub reg: f32,
    pub adaptive_reg: bool,
    pub cg_tolerance: f32,
    pub num_cg_max_iters: usize,
    pub compute_loss: bool,
    pub eps: f32,
    pub axis: Axis,
}

impl KernelParams {
    /// Regularization weight of a row with `nnz` interactions.
    pub fn regularization(&self, nnz: usize) -> f32 {
        let scale = if self.adaptive_reg { nnz as f32 } else { 1.0 };
        scale * self.reg
    }
}

/// Per-group working vectors, one `vdim` vector per role.
#[derive(Debug, Clone)]
pub struct SolverScratch {
    ap: Vec<f32>,
    r: Vec<f32>,
    p: Vec<f32>,
    gradient: Vec<f32>,
}

impl SolverScratch {
    pub fn new(vdim: usize) -> Self {
        Self {
            ap: vec![0.0; vdim],
            r: vec![0.0; vdim],
            p: vec![0.0; vdim],
            gradient: vec![0.0; vdim],
        }
    }

    fn reset(&mut self) {
        self.ap.fill(0.0);
        self.r.fill(0.0);
        self.p.fill(0.0);
        self.gradient.fill(0.0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowStatus {
    /// No interactions; the row was set to zero.
    Empty,
    /// The starting residual was already under tolerance.
    AlreadySolved,
    Converged,
    IterationLimit,
    /// The residual went non-finite; the row was set to zero.
    NonFinite,
}

#[derive(Debug, Clone, Copy)]
pub struct RowSolve {
    pub status: RowStatus,
    pub cg_steps: usize,
    /// Squared residual norm after the last step.
    pub residual: f32,
    pub loss_nume: f32,
    pub loss_deno: f32,
}

#[inline(always)]
fn fixed_row(fixed: &[f32], vdim: usize, key: u32) -> &[f32] {
    let k = key as usize;
    &fixed[k * vdim..(k + 1) * vdim]
}

/// `ap = reg·p + FFᵗ·p + Σ_k α·w_k·(p·q_k)·q_k`
#[allow(clippy::too_many_arguments)]
fn apply_normal_operator(
    params: &KernelParams,
    reg: f32,
    p: &[f32],
    keys: &[u32],
    vals: &[f32],
    fixed: &[f32],
    ff: &[f32],
    ap: &mut [f32],
) {
    for (a, &pi) in ap.iter_mut().zip(p) {
        *a = reg * pi;
    }
    gemv_t_acc(ff, &p[..params.dim], ap);
    for (&key, &w) in keys.iter().zip(vals) {
        let q = fixed_row(fixed, params.vdim, key);
        axpy(w * params.alpha * dot(p, q), q, ap);
    }
}

/// Solves one row in place, starting from its current value.
pub fn solve_row(
    params: &KernelParams,
    scratch: &mut SolverScratch,
    x: &mut [f32],
    keys: &[u32],
    vals: &[f32],
    fixed: &[f32],
    ff: &[f32],
) -> RowSolve {
    if keys.is_empty() {
        x.fill(0.0);
        return RowSolve {
            status: RowStatus::Empty,
            cg_steps: 0,
            residual: 0.0,
            loss_nume: 0.0,
            loss_deno: 0.0,
        };
    }

    scratch.reset();
    let SolverScratch { ap, r, p, gradient } = scratch;
    let reg = params.regularization(keys.len());
    let item_loss = params.compute_loss && params.axis == Axis::Item;
    let mut loss_nume = 0.0f32;
    let mut loss_deno = 0.0f32;

    // gradient = -FF·x - reg·x + Σ (1 + α·w·(1 - x·q))·q
    gemv_t_acc(ff, &x[..params.dim], gradient);
    if item_loss {
        loss_nume += dot(x, gradient);
    }
    for (g, &xi) in gradient.iter_mut().zip(x.iter()) {
        *g = -*g - reg * xi;
    }
    for (&key, &w) in keys.iter().zip(vals) {
        let q = fixed_row(fixed, params.vdim, key);
        let xq = dot(x, q);
        axpy(1.0 + params.alpha * w * (1.0 - xq), q, gradient);
        if item_loss {
            loss_nume += (1.0 + params.alpha * w) * (xq - 1.0) * (xq - 1.0) - xq * xq;
            loss_deno += params.alpha * w;
        }
    }

    r.copy_from_slice(gradient);
    p.copy_from_slice(gradient);
    let mut rr = dot(r, r);
    let mut cg_steps = 0;
    let mut status = RowStatus::AlreadySolved;
    // NaN must fall through to the iterations so it is caught below
    let already_solved = rr < params.cg_tolerance;

    if !already_solved {
        status = RowStatus::IterationLimit;
        for _ in 0..params.num_cg_max_iters {
            apply_normal_operator(params, reg, p, keys, vals, fixed, ff, ap);
            let step = rr / (dot(p, ap) + params.eps);
            axpy(step, p, x);
            axpy(-step, ap, r);
            let rr_new = dot(r, r);
            cg_steps += 1;
            if rr_new < params.cg_tolerance {
                rr = rr_new;
                status = RowStatus::Converged;
                break;
            }
            xpay(r, rr_new / (rr + params.eps), p);
            rr = rr_new;
        }
    }

    if params.compute_loss {
        loss_nume += reg * dot(x, x);
    }

    if !rr.is_finite() {
        x.fill(0.0);
        status = RowStatus::NonFinite;
    }

    RowSolve {
        status,
        cg_steps,
        residual: rr,
        loss_nume,
        loss_deno,
    }
}

/// Per-launch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaunchStats {
    pub rows: usize,
    pub empty_rows: usize,
    pub converged_rows: usize,
    pub neutralized_rows: usize,
    pub cg_steps: usize,
}

impl LaunchStats {
    fn record(&mut self, solve: &RowSolve) {
        self.rows += 1;
        self.cg_steps += solve.cg_steps;
        match solve.status {
            RowStatus::Empty => self.empty_rows += 1,
            RowStatus::AlreadySolved | RowStatus::Converged => self.converged_rows += 1,
            RowStatus::NonFinite => self.neutralized_rows += 1,
            RowStatus::IterationLimit => {}
        }
    }

    fn merge(self, other: Self) -> Self {
        Self {
            rows: self.rows + other.rows,
            empty_rows: self.empty_rows + other.empty_rows,
            converged_rows: self.converged_rows + other.converged_rows,
            neutralized_rows: self.neutralized_rows + other.neutralized_rows,
            cg_steps: self.cg_steps + other.cg_steps,
        }
    }
}

/// Rows of one batch handed to a single group.
type GroupRows<'a> = Vec<(usize, &'a mut [f32])>;

#[allow(clippy::too_many_arguments)]
fn run_group(
    params: &KernelParams,
    start_x: usize,
    rows: GroupRows<'_>,
    batch: &StagedBatch,
    fixed: &[f32],
    ff: &[f32],
    slot: Option<LossSlot<'_>>,
) -> LaunchStats {
    let mut scratch = SolverScratch::new(params.vdim);
    let mut stats = LaunchStats::default();
    let mut nume = 0.0f64;
    let mut deno = 0.0f64;

    for (i, x) in rows {
        let (keys, vals) = batch.row(i);
        let solve = solve_row(params, &mut scratch, x, keys, vals, fixed, ff);
        if solve.status == RowStatus::NonFinite {
            log::warn!(
                "non-finite residual ({}) at row {}, factors reset to zero",
                solve.residual,
                start_x + i
            );
        }
        nume += f64::from(solve.loss_nume);
        deno += f64::from(solve.loss_deno);
        stats.record(&solve);
    }

    if let Some(slot) = slot {
        *slot.nume += nume;
        *slot.deno += deno;
    }
    stats
}

/// Solves every row of `batch` in place.
///
/// `rows` holds the factor rows `[start_x, start_x + batch.rows())` of the
/// axis being solved. `loss`, when given, must have one slot per device
/// group.
#[allow(clippy::too_many_arguments)]
pub fn launch_cg(
    device: &Device,
    params: &KernelParams,
    start_x: usize,
    rows: &mut [f32],
    batch: &StagedBatch,
    fixed: &[f32],
    ff: &[f32],
    loss: Option<&mut LossAccumulator>,
) -> LaunchStats {
    let groups = device.num_groups();
    debug_assert_eq!(rows.len(), batch.rows() * params.vdim);

    let mut assigned: Vec<GroupRows<'_>> = (0..groups).map(|_| Vec::new()).collect();
    for (i, row) in rows.chunks_mut(params.vdim).enumerate() {
        assigned[i % groups].push((i, row));
    }
    let slots: Vec<Option<LossSlot<'_>>> = match loss {
        Some(acc) => {
            debug_assert_eq!(acc.groups(), groups);
            acc.slots_mut().map(Some).collect()
        }
        None => (0..groups).map(|_| None).collect(),
    };

    device.launch(|| {
        assigned
            .into_par_iter()
            .zip(slots)
            .map(|(rows, slot)| run_group(params, start_x, rows, batch, fixed, ff, slot))
            .reduce(LaunchStats::default, LaunchStats::merge)
    })
}
