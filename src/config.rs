//! Training options read from a flat JSON object.
//!
//! Keys this crate does not know are ignored so one options file can be
//! shared with the rest of the training pipeline. Missing keys fall back to
//! the defaults below.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AlsOptions {
    /// Accumulate the training loss while solving.
    pub compute_loss_on_training: bool,
    /// Scale the regularization of each row by its interaction count.
    pub adaptive_reg: bool,
    /// Latent dimension before lane padding.
    pub d: usize,
    pub num_cg_max_iters: usize,
    /// Confidence scale applied to interaction weights.
    pub alpha: f32,
    pub reg_u: f32,
    pub reg_i: f32,
    /// Squared residual norm under which a row counts as solved.
    pub cg_tolerance: f32,
    /// Added to CG denominators.
    pub eps: f32,
    /// Worker threads backing the device, 0 means one per core.
    pub num_workers: usize,
    /// Native lane width; `d` is padded up to a multiple of it.
    pub lane_width: usize,
    /// Groups launched per parallel unit.
    pub groups_per_unit: usize,
}

impl Default for AlsOptions {
    fn default() -> Self {
        Self {
            compute_loss_on_training: true,
            adaptive_reg: false,
            d: 20,
            num_cg_max_iters: 3,
            alpha: 8.0,
            reg_u: 0.1,
            reg_i: 0.1,
            cg_tolerance: 1e-10,
            eps: 1e-10,
            num_workers: 0,
            lane_width: 32,
            groups_per_unit: 4,
        }
    }
}

impl AlsOptions {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let opts: AlsOptions = serde_json::from_str(text)?;
        opts.validate()?;
        Ok(opts)
    }

    pub fn from_json_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| Error::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.d == 0 {
            return Err(invalid("d", "latent dimension must be positive"));
        }
        if self.lane_width == 0 {
            return Err(invalid("lane_width", "lane width must be positive"));
        }
        if self.groups_per_unit == 0 {
            return Err(invalid("groups_per_unit", "at least one group per unit is required"));
        }
        for (name, value) in [
            ("alpha", self.alpha),
            ("reg_u", self.reg_u),
            ("reg_i", self.reg_i),
            ("cg_tolerance", self.cg_tolerance),
            ("eps", self.eps),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(
                    name,
                    format!("expected a finite non-negative value, got {value}"),
                ));
            }
        }
        Ok(())
    }

    /// `d` rounded up to the lane width.
    pub fn vdim(&self) -> usize {
        self.d.div_ceil(self.lane_width) * self.lane_width
    }
}

fn invalid(name: &'static str, reason: impl Into<String>) -> Error {
    Error::InvalidOption {
        name,
        reason: reason.into(),
    }
}
