//! Host-side lifecycle of the solver.
//!
//! The outer training loop drives one `AlsSolver` per model:
//!
//! 1. `AlsSolver::new` / `from_config_path` starts the device,
//! 2. `initialize_model` uploads P and Q,
//! 3. per axis and epoch, `precompute(axis)` refreshes the Gram matrix of the
//!    fixed side and `partial_update` solves the axis batch by batch,
//! 4. `synchronize(axis, DeviceToHost)` brings the solved factors back.

use std::path::Path;

use crate::config::AlsOptions;
use crate::device::{CsrBatch, Device, DeviceModel, SolveBuffers, StagedBatch};
use crate::error::{Error, Result};
use crate::gram::gramian_into;
use crate::kernel::{launch_cg, KernelParams, LaunchStats};
use crate::loss::{BatchLoss, LossAccumulator};

/// Side of the interaction matrix being solved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    /// Rows of P, with Q fixed.
    User,
    /// Rows of Q, with P fixed.
    Item,
}

impl Axis {
    /// 0 for users, 1 for items.
    pub fn from_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(Axis::User),
            1 => Some(Axis::Item),
            _ => None,
        }
    }

    pub fn other(self) -> Self {
        match self {
            Axis::User => Axis::Item,
            Axis::Item => Axis::User,
        }
    }

    fn factors_name(self) -> &'static str {
        match self {
            Axis::User => "P",
            Axis::Item => "Q",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToDevice,
    DeviceToHost,
}

struct ModelState {
    host_p: Vec<f32>,
    host_q: Vec<f32>,
    device: DeviceModel,
}

impl ModelState {
    fn host(&self, axis: Axis) -> &[f32] {
        match axis {
            Axis::User => &self.host_p,
            Axis::Item => &self.host_q,
        }
    }

    fn host_mut(&mut self, axis: Axis) -> &mut [f32] {
        match axis {
            Axis::User => &mut self.host_p,
            Axis::Item => &mut self.host_q,
        }
    }
}

pub struct AlsSolver {
    opts: AlsOptions,
    device: Device,
    model: Option<ModelState>,
    /// Axis the current Gram matrix was built for.
    gram_axis: Option<Axis>,
    last_launch: LaunchStats,
}

impl AlsSolver {
    pub fn new(opts: AlsOptions) -> Result<Self> {
        opts.validate()?;
        let device = Device::new(&opts)?;
        Ok(Self {
            opts,
            device,
            model: None,
            gram_axis: None,
            last_launch: LaunchStats::default(),
        })
    }

    /// Reads the options file and starts the device. Nothing is allocated on
    /// the device if the options cannot be loaded.
    pub fn from_config_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(AlsOptions::from_json_path(path)?)
    }

    pub fn options(&self) -> &AlsOptions {
        &self.opts
    }

    /// Padded latent dimension, the row width of P and Q.
    pub fn latent_dim(&self) -> usize {
        self.opts.vdim()
    }

    pub fn rows(&self, axis: Axis) -> Result<usize> {
        Ok(self.state()?.device.rows(axis))
    }

    /// Counters of the most recent `partial_update`.
    pub fn last_launch(&self) -> LaunchStats {
        self.last_launch
    }

    /// Uploads P (`p_rows × latent_dim()`) and Q (`q_rows × latent_dim()`),
    /// replacing any previous model.
    pub fn initialize_model(
        &mut self,
        p: &[f32],
        p_rows: usize,
        q: &[f32],
        q_rows: usize,
    ) -> Result<()> {
        let device = DeviceModel::new(p, p_rows, q, q_rows, self.latent_dim())?;
        self.model = Some(ModelState {
            host_p: p.to_vec(),
            host_q: q.to_vec(),
            device,
        });
        self.gram_axis = None;
        log::info!(
            "model initialized: {} users, {} items, dim {} (padded to {})",
            p_rows,
            q_rows,
            self.opts.d,
            self.latent_dim()
        );
        Ok(())
    }

    /// Builds the Gram matrix of the side that stays fixed while `axis` is
    /// solved.
    pub fn precompute(&mut self, axis: Axis) -> Result<()> {
        let vdim = self.latent_dim();
        let state = self.model.as_mut().ok_or(Error::ModelNotInitialized)?;
        let (fixed, rows, ff) = state.device.gram_inputs(axis);
        self.device.launch(|| gramian_into(fixed, rows, vdim, ff))?;
        self.gram_axis = Some(axis);
        log::debug!("gram matrix ready for {:?} axis ({} fixed rows)", axis, rows);
        Ok(())
    }

    /// Solves rows `[start_x, next_x)` of `axis` in place on the device and
    /// returns the loss accumulated over them.
    pub fn partial_update(
        &mut self,
        start_x: usize,
        next_x: usize,
        batch: &CsrBatch<'_>,
        axis: Axis,
    ) -> Result<BatchLoss> {
        let params = self.kernel_params(axis);
        let state = self.model.as_mut().ok_or(Error::ModelNotInitialized)?;
        let rows = state.device.rows(axis);
        if start_x >= next_x || next_x > rows {
            return Err(Error::InvalidRange {
                start: start_x,
                next: next_x,
                rows,
            });
        }
        if self.gram_axis != Some(axis) {
            return Err(Error::GramNotReady(axis));
        }
        batch.validate(next_x - start_x, state.device.rows(axis.other()))?;

        let staged = StagedBatch::stage(batch)?;
        let mut loss = if self.opts.compute_loss_on_training {
            Some(LossAccumulator::zeroed(self.device.num_groups())?)
        } else {
            None
        };

        let vdim = params.vdim;
        let SolveBuffers { target, fixed, ff } = state.device.solve_buffers(axis);
        let stats = launch_cg(
            &self.device,
            &params,
            start_x,
            &mut target[start_x * vdim..next_x * vdim],
            &staged,
            fixed,
            ff,
            loss.as_mut(),
        );
        drop(staged);

        let total = loss.map(|acc| acc.reduce()).unwrap_or_default();
        log::debug!(
            "{:?} rows [{}, {}): {} solved, {} empty, {} neutralized, {} cg steps",
            axis,
            start_x,
            next_x,
            stats.converged_rows,
            stats.empty_rows,
            stats.neutralized_rows,
            stats.cg_steps
        );
        self.last_launch = stats;
        Ok(total)
    }

    /// Copies the factors of `axis` between the host mirror and the device.
    pub fn synchronize(&mut self, axis: Axis, direction: Direction) -> Result<()> {
        let state = self.model.as_mut().ok_or(Error::ModelNotInitialized)?;
        let what = axis.factors_name();
        let ModelState {
            host_p,
            host_q,
            device,
        } = state;
        let host = match axis {
            Axis::User => host_p,
            Axis::Item => host_q,
        };
        match direction {
            Direction::HostToDevice => {
                device.factors_mut(axis).upload(host, what)?;
                // the Gram matrix of the other axis was built from the old values
                if self.gram_axis == Some(axis.other()) {
                    self.gram_axis = None;
                }
            }
            Direction::DeviceToHost => device.factors(axis).download(host, what)?,
        }
        Ok(())
    }

    /// Host mirror of the factors of `axis`, as of the last synchronize.
    pub fn host_factors(&self, axis: Axis) -> Result<&[f32]> {
        Ok(self.state()?.host(axis))
    }

    /// Writable host mirror; push edits with `synchronize(axis, HostToDevice)`.
    pub fn host_factors_mut(&mut self, axis: Axis) -> Result<&mut [f32]> {
        let state = self.model.as_mut().ok_or(Error::ModelNotInitialized)?;
        Ok(state.host_mut(axis))
    }

    fn state(&self) -> Result<&ModelState> {
        self.model.as_ref().ok_or(Error::ModelNotInitialized)
    }

    fn kernel_params(&self, axis: Axis) -> KernelParams {
        KernelParams {
            dim: self.opts.d,
            vdim: self.latent_dim(),
            alpha: self.opts.alpha,
            reg: match axis {
                Axis::User => self.opts.reg_u,
                Axis::Item => self.opts.reg_i,
            },
            adaptive_reg: self.opts.adaptive_reg,
            cg_tolerance: self.opts.cg_tolerance,
            num_cg_max_iters: self.opts.num_cg_max_iters,
            compute_loss: self.opts.compute_loss_on_training,
            eps: self.opts.eps,
            axis,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_solver() -> AlsSolver {
        let opts = AlsOptions {
            d: 3,
            lane_width: 4,
            num_workers: 2,
            groups_per_unit: 2,
            ..AlsOptions::default()
        };
        AlsSolver::new(opts).unwrap()
    }

    #[test]
    fn axis_indices() {
        assert_eq!(Axis::from_index(0), Some(Axis::User));
        assert_eq!(Axis::from_index(1), Some(Axis::Item));
        assert_eq!(Axis::from_index(2), None);
        assert_eq!(Axis::User.other(), Axis::Item);
    }

    #[test]
    fn calls_before_model_fail() {
        let mut solver = small_solver();
        assert_eq!(solver.latent_dim(), 4);
        assert!(matches!(solver.precompute(Axis::User), Err(Error::ModelNotInitialized)));
        assert!(matches!(
            solver.synchronize(Axis::User, Direction::DeviceToHost),
            Err(Error::ModelNotInitialized)
        ));
        let batch = CsrBatch::new(&[0, 0], &[], &[]);
        assert!(matches!(
            solver.partial_update(0, 1, &batch, Axis::User),
            Err(Error::ModelNotInitialized)
        ));
    }

    #[test]
    fn host_upload_invalidates_dependent_gram() {
        let mut solver = small_solver();
        solver.initialize_model(&[0.5; 8], 2, &[0.25; 12], 3).unwrap();
        solver.precompute(Axis::Item).unwrap();

        // the item-axis Gram is built from P, so re-uploading P makes it stale
        solver.synchronize(Axis::User, Direction::HostToDevice).unwrap();
        let batch = CsrBatch::new(&[0, 1], &[0], &[1.0]);
        assert!(matches!(
            solver.partial_update(0, 1, &batch, Axis::Item),
            Err(Error::GramNotReady(Axis::Item))
        ));

        solver.precompute(Axis::Item).unwrap();
        solver.partial_update(0, 1, &batch, Axis::Item).unwrap();
    }

    #[test]
    fn gram_axis_must_match() {
        let mut solver = small_solver();
        solver.initialize_model(&[0.5; 8], 2, &[0.25; 12], 3).unwrap();
        solver.precompute(Axis::User).unwrap();
        let batch = CsrBatch::new(&[0, 1], &[0], &[1.0]);
        assert!(matches!(
            solver.partial_update(0, 1, &batch, Axis::Item),
            Err(Error::GramNotReady(Axis::Item))
        ));
    }
}
