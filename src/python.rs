use numpy::{PyArray2, PyArrayMethods, PyReadonlyArray1, PyUntypedArrayMethods};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;

use crate::device::CsrBatch;
use crate::error::Error;
use crate::solver::{AlsSolver, Axis, Direction};

fn to_py_err(err: Error) -> PyErr {
    match err {
        Error::InvalidRange { .. }
        | Error::InvalidBatch(_)
        | Error::ShapeMismatch { .. }
        | Error::TransferMismatch { .. } => PyValueError::new_err(err.to_string()),
        _ => PyRuntimeError::new_err(err.to_string()),
    }
}

fn axis_arg(axis: i64) -> PyResult<Axis> {
    Axis::from_index(axis).ok_or_else(|| {
        PyValueError::new_err(format!("axis must be 0 (users) or 1 (items), got {axis}"))
    })
}

fn resized() -> PyErr {
    PyValueError::new_err("factor array was resized after initialize_model")
}

fn not_initialized() -> PyErr {
    PyRuntimeError::new_err("solver is not initialized, call init() first")
}

/// Python handle on the solver. P and Q stay owned by the caller's numpy
/// arrays; `synchronize` copies between them and the device.
#[pyclass(name = "AlsSolver")]
pub struct PyAlsSolver {
    inner: Option<AlsSolver>,
    p: Option<Py<PyArray2<f32>>>,
    q: Option<Py<PyArray2<f32>>>,
}

#[pymethods]
impl PyAlsSolver {
    #[new]
    fn new() -> Self {
        Self {
            inner: None,
            p: None,
            q: None,
        }
    }

    /// Loads options from a JSON file and starts the device. Returns False
    /// and keeps the previous state when the options cannot be used.
    fn init(&mut self, opt_path: &str) -> bool {
        match AlsSolver::from_config_path(opt_path) {
            Ok(solver) => {
                self.inner = Some(solver);
                self.p = None;
                self.q = None;
                true
            }
            Err(err) => {
                log::warn!("cannot initialize solver from {opt_path}: {err}");
                false
            }
        }
    }

    /// Padded latent dimension, the column count P and Q must have.
    fn get_latent_dim(&self) -> PyResult<usize> {
        let solver = self.inner.as_ref().ok_or_else(not_initialized)?;
        Ok(solver.latent_dim())
    }

    fn get_vdim(&self) -> PyResult<usize> {
        self.get_latent_dim()
    }

    fn initialize_model(
        &mut self,
        p: Bound<'_, PyArray2<f32>>,
        q: Bound<'_, PyArray2<f32>>,
    ) -> PyResult<()> {
        let solver = self.inner.as_mut().ok_or_else(not_initialized)?;
        {
            let p_view = p.readonly();
            let q_view = q.readonly();
            let (p_rows, q_rows) = (p_view.shape()[0], q_view.shape()[0]);
            solver
                .initialize_model(p_view.as_slice()?, p_rows, q_view.as_slice()?, q_rows)
                .map_err(to_py_err)?;
        }
        self.p = Some(p.unbind());
        self.q = Some(q.unbind());
        Ok(())
    }

    fn precompute(&mut self, py: Python<'_>, axis: i64) -> PyResult<()> {
        let axis = axis_arg(axis)?;
        let solver = self.inner.as_mut().ok_or_else(not_initialized)?;
        py.detach(|| solver.precompute(axis)).map_err(to_py_err)
    }

    #[pyo3(signature = (start_x, next_x, indptr, keys, vals, axis))]
    #[allow(clippy::too_many_arguments)]
    fn partial_update(
        &mut self,
        py: Python<'_>,
        start_x: usize,
        next_x: usize,
        indptr: PyReadonlyArray1<i64>,
        keys: PyReadonlyArray1<i32>,
        vals: PyReadonlyArray1<f32>,
        axis: i64,
    ) -> PyResult<(f64, f64)> {
        let axis = axis_arg(axis)?;
        let solver = self.inner.as_mut().ok_or_else(not_initialized)?;
        let batch = CsrBatch::new(indptr.as_slice()?, keys.as_slice()?, vals.as_slice()?);
        let loss = py
            .detach(|| solver.partial_update(start_x, next_x, &batch, axis))
            .map_err(to_py_err)?;
        Ok(loss.into_pair())
    }

    /// Copies the factors of `axis` from the device into the numpy array
    /// given to `initialize_model`, or the other way round.
    fn synchronize(&mut self, py: Python<'_>, axis: i64, device_to_host: bool) -> PyResult<()> {
        let axis = axis_arg(axis)?;
        let solver = self.inner.as_mut().ok_or_else(not_initialized)?;
        let array = match axis {
            Axis::User => self.p.as_ref(),
            Axis::Item => self.q.as_ref(),
        }
        .ok_or_else(|| PyRuntimeError::new_err("model is not initialized"))?
        .bind(py);

        if device_to_host {
            solver.synchronize(axis, Direction::DeviceToHost).map_err(to_py_err)?;
            let mut view = array.readwrite();
            let dst = view.as_slice_mut()?;
            let src = solver.host_factors(axis).map_err(to_py_err)?;
            if dst.len() != src.len() {
                return Err(resized());
            }
            dst.copy_from_slice(src);
        } else {
            let view = array.readonly();
            let src = view.as_slice()?;
            let dst = solver.host_factors_mut(axis).map_err(to_py_err)?;
            if dst.len() != src.len() {
                return Err(resized());
            }
            dst.copy_from_slice(src);
            solver.synchronize(axis, Direction::HostToDevice).map_err(to_py_err)?;
        }
        Ok(())
    }
}
