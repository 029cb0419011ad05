//! Implicit-feedback ALS with per-row conjugate-gradient solves.
//!
//! See [`solver::AlsSolver`] for the training lifecycle.

pub mod blas;
pub mod config;
pub mod device;
pub mod error;
pub mod gram;
pub mod kernel;
pub mod loss;
pub mod solver;

#[cfg(feature = "python")]
mod python;

pub use config::AlsOptions;
pub use device::CsrBatch;
pub use error::{Error, Result};
pub use kernel::LaunchStats;
pub use loss::BatchLoss;
pub use solver::{AlsSolver, Axis, Direction};

#[cfg(feature = "python")]
use mimalloc::MiMalloc;
#[cfg(feature = "python")]
use pyo3::prelude::*;

#[cfg(feature = "python")]
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[cfg(feature = "python")]
#[pymodule]
fn _cgals(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<python::PyAlsSolver>()?;
    Ok(())
}
