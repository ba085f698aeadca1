use crate::error::{Error, Result};
use crate::utils;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// The two kinds of linearizations an investment oracle produces: a
/// diagonal linearization is a subgradient of the function at the current
/// point, while a vertical one is a separating hyperplane certifying the
/// infeasibility of the linear side constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinearizationKind {
    Diagonal,
    Vertical,
}

/// Pool of linearizations produced by past oracle evaluations, shared
/// with a bundle-style master solver. Names are indices into the pool;
/// removal sets a NaN sentinel in the constant rather than shifting
/// neighbors, so master-held names stay valid across other operations.
#[derive(Debug, Default)]
pub struct GlobalPool {
    constants: Vec<f64>,
    coefficients: Vec<Vec<f64>>,
    diagonal: Vec<bool>,
    important: Vec<(usize, f64)>,
}

impl GlobalPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_size(size: usize) -> Self {
        let mut pool = Self::new();
        pool.resize(size);
        pool
    }

    pub fn size(&self) -> usize {
        self.constants.len()
    }

    /// True iff the pool holds no linearization (every constant is NaN).
    pub fn is_empty(&self) -> bool {
        self.constants.iter().all(|constant| constant.is_nan())
    }

    /// Extends or truncates the pool to the given size. Truncation
    /// destroys every linearization whose name is greater than or equal
    /// to the new size.
    pub fn resize(&mut self, size: usize) {
        self.constants.resize(size, f64::NAN);
        self.coefficients.resize(size, vec![]);
        self.diagonal.resize(size, false);
    }

    /// Overwrites the slot `name` with the given linearization.
    pub fn store(
        &mut self,
        name: usize,
        constant: f64,
        coefficients: Vec<f64>,
        kind: LinearizationKind,
    ) -> Result<()> {
        self.check_name(name, "store")?;
        self.constants[name] = constant;
        self.coefficients[name] = coefficients;
        self.diagonal[name] = kind == LinearizationKind::Diagonal;
        Ok(())
    }

    /// True iff `name` currently holds a linearization. Invalid names are
    /// simply reported as absent.
    pub fn is_present(&self, name: usize) -> bool {
        name < self.size() && !self.constants[name].is_nan()
    }

    /// True iff `name` holds a vertical linearization.
    pub fn is_vertical(&self, name: usize) -> bool {
        self.is_present(name) && !self.diagonal[name]
    }

    pub fn kind(&self, name: usize) -> Result<LinearizationKind> {
        self.check_present(name, "kind")?;
        Ok(if self.diagonal[name] {
            LinearizationKind::Diagonal
        } else {
            LinearizationKind::Vertical
        })
    }

    pub fn constant(&self, name: usize) -> Result<f64> {
        self.check_name(name, "constant")?;
        Ok(self.constants[name])
    }

    pub fn coefficients(&self, name: usize) -> Result<&[f64]> {
        self.check_present(name, "coefficients")?;
        Ok(&self.coefficients[name])
    }

    /// Dense read of a contiguous range of coefficients of the
    /// linearization stored under `name`. The output slice must have the
    /// length of the range.
    pub fn copy_coefficients(&self, name: usize, range: Range<usize>, out: &mut [f64]) -> Result<()> {
        let coefficients = self.coefficients(name)?;
        if range.end > coefficients.len() || out.len() != range.len() {
            return Err(Error::OutOfRange(format!(
                "coefficient range {range:?} of linearization {name}"
            )));
        }
        out.copy_from_slice(&coefficients[range]);
        Ok(())
    }

    /// Sparse read of a subset of coefficients of the linearization
    /// stored under `name`, in the order of the subset.
    pub fn copy_coefficients_subset(
        &self,
        name: usize,
        subset: &[usize],
        out: &mut [f64],
    ) -> Result<()> {
        let coefficients = self.coefficients(name)?;
        if out.len() != subset.len() {
            return Err(Error::OutOfRange(format!(
                "output size {} for a subset of size {}",
                out.len(),
                subset.len()
            )));
        }
        for (slot, &index) in out.iter_mut().zip(subset.iter()) {
            if index >= coefficients.len() {
                return Err(Error::OutOfRange(format!(
                    "coefficient index {index} of linearization {name}"
                )));
            }
            *slot = coefficients[index];
        }
        Ok(())
    }

    /// Deletes the linearization stored under `name`: the constant is set
    /// to NaN and the coefficients are released.
    pub fn delete(&mut self, name: usize) -> Result<()> {
        self.check_name(name, "delete")?;
        self.constants[name] = f64::NAN;
        self.coefficients[name] = vec![];
        Ok(())
    }

    /// Deletes the linearizations with the given names. An empty list
    /// deletes every linearization currently in the pool.
    pub fn delete_many(&mut self, names: &[usize]) -> Result<()> {
        if names.is_empty() {
            for name in 0..self.size() {
                if self.is_present(name) {
                    self.delete(name)?;
                }
            }
            return Ok(());
        }
        if let Some(&invalid) = names.iter().find(|&&name| name >= self.size()) {
            return Err(Error::OutOfRange(format!(
                "linearization with name {invalid} does not exist"
            )));
        }
        for &name in names {
            if self.is_present(name) {
                self.delete(name)?;
            }
        }
        Ok(())
    }

    /// Sets every constant to NaN. The coefficients are retained only
    /// incidentally; no read of an invalidated entry is valid.
    pub fn invalidate_all(&mut self) {
        self.constants.iter_mut().for_each(|constant| *constant = f64::NAN);
    }

    /// Stores under `name` a weighted sum of the linearizations named in
    /// `combination`. Every multiplier must be at least `-tolerance`; if
    /// any summand is diagonal, the diagonal multipliers must sum to one
    /// within `tolerance * combination.len()` and the result is diagonal,
    /// otherwise the result is vertical.
    pub fn combine(
        &mut self,
        combination: &[(usize, f64)],
        name: usize,
        tolerance: f64,
    ) -> Result<()> {
        self.check_name(name, "combine")?;
        if combination.is_empty() {
            return Err(Error::InvalidCombination(
                "the linear combination is empty".to_string(),
            ));
        }

        let mut coefficients: Vec<f64> = vec![];
        let mut constant = 0.0;
        let mut any_diagonal = false;
        let mut diagonal_multiplier_sum = 0.0;

        for &(member, multiplier) in combination {
            self.check_present(member, "combine")?;
            if multiplier < -tolerance {
                return Err(Error::InvalidCombination(format!(
                    "multiplier {multiplier} of linearization {member} is negative"
                )));
            }
            if coefficients.is_empty() {
                coefficients = vec![0.0; self.coefficients[member].len()];
            }
            utils::axpy(&mut coefficients, &self.coefficients[member], multiplier);
            constant += multiplier * self.constants[member];
            if self.diagonal[member] {
                any_diagonal = true;
                diagonal_multiplier_sum += multiplier;
            }
        }

        let kind = if any_diagonal {
            let slack = tolerance * combination.len() as f64;
            if (1.0 - diagonal_multiplier_sum).abs() > slack {
                return Err(Error::InvalidCombination(format!(
                    "diagonal multipliers sum to {diagonal_multiplier_sum}, \
                     which is not 1 within {slack}"
                )));
            }
            LinearizationKind::Diagonal
        } else {
            LinearizationKind::Vertical
        };

        self.store(name, constant, coefficients, kind)
    }

    /// Declares which combination of pool entries the master currently
    /// considers "the important one".
    pub fn set_important_linearization(&mut self, combination: Vec<(usize, f64)>) {
        self.important = combination;
    }

    pub fn important_linearization(&self) -> &[(usize, f64)] {
        &self.important
    }

    /// Snapshot of the pool in its persisted form.
    pub fn state(&self) -> PoolState {
        let mut packed = vec![];
        for name in 0..self.size() {
            if self.is_present(name) {
                packed.extend_from_slice(&self.coefficients[name]);
            }
        }
        PoolState {
            max_glob: self.size(),
            constants: self.constants.clone(),
            kinds: self.diagonal.iter().map(|&diagonal| diagonal as u8).collect(),
            coefficients: packed,
            imp_coeff_ind: self.important.iter().map(|&(name, _)| name).collect(),
            imp_coeff_val: self.important.iter().map(|&(_, value)| value).collect(),
        }
    }

    /// Restores the pool from a previously taken snapshot.
    pub fn restore(&mut self, state: &PoolState) -> Result<()> {
        let present = state.constants.iter().filter(|c| !c.is_nan()).count();
        if present > 0 && state.coefficients.len() % present != 0 {
            return Err(Error::OutOfRange(format!(
                "{} packed coefficients cannot cover {present} linearizations",
                state.coefficients.len()
            )));
        }
        let num_var = if present > 0 {
            state.coefficients.len() / present
        } else {
            0
        };

        self.constants = state.constants.clone();
        self.constants.resize(state.max_glob, f64::NAN);
        self.diagonal = state.kinds.iter().map(|&kind| kind != 0).collect();
        self.diagonal.resize(state.max_glob, false);
        self.coefficients = vec![vec![]; state.max_glob];
        let mut start = 0;
        for name in 0..state.max_glob {
            if !self.constants[name].is_nan() {
                self.coefficients[name] =
                    state.coefficients[start..start + num_var].to_vec();
                start += num_var;
            }
        }
        self.important = state
            .imp_coeff_ind
            .iter()
            .copied()
            .zip(state.imp_coeff_val.iter().copied())
            .collect();
        Ok(())
    }

    fn check_name(&self, name: usize, operation: &str) -> Result<()> {
        if name >= self.size() {
            return Err(Error::OutOfRange(format!(
                "{operation}: linearization with name {name} does not exist"
            )));
        }
        Ok(())
    }

    fn check_present(&self, name: usize, operation: &str) -> Result<()> {
        self.check_name(name, operation)?;
        if self.constants[name].is_nan() {
            return Err(Error::OutOfRange(format!(
                "{operation}: linearization with name {name} is empty"
            )));
        }
        Ok(())
    }
}

/// The persisted form of a [`GlobalPool`]: dense constant and type
/// vectors, the non-NaN coefficient rows packed in ascending name order,
/// and the important linear combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolState {
    pub max_glob: usize,
    pub constants: Vec<f64>,
    pub kinds: Vec<u8>,
    pub coefficients: Vec<f64>,
    pub imp_coeff_ind: Vec<usize>,
    pub imp_coeff_val: Vec<f64>,
}
