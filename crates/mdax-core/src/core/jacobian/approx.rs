use crate::core::models::component::{Complex64, Component, ComponentError};
use crate::core::models::variable::VarSet;
use serde::{Deserialize, Serialize};
use std::ops::Deref;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FdForm {
    #[default]
    Forward,
    Backward,
    Central,
    ComplexStep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    #[default]
    Absolute,
    /// Step scaled by the magnitude of the perturbed value (absolute when the value is zero).
    Relative,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FdConfig {
    pub form: FdForm,
    pub step_size: f64,
    pub step_type: StepType,
}

impl Default for FdConfig {
    fn default() -> Self {
        Self {
            form: FdForm::Forward,
            step_size: 1e-6,
            step_type: StepType::Absolute,
        }
    }
}

impl FdConfig {
    fn step_for(&self, value: f64) -> f64 {
        match self.step_type {
            StepType::Absolute => self.step_size,
            StepType::Relative if value != 0.0 => self.step_size * value.abs(),
            StepType::Relative => self.step_size,
        }
    }
}

/// Which local variable a column perturbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WrtRef {
    Input(usize),
    /// Only meaningful for implicit components, whose residuals depend on their outputs.
    Output(usize),
}

/// One scalar perturbation: a variable and a flat index inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    pub wrt: WrtRef,
    pub index: usize,
}

/// Temporarily overwrites one entry of a [`VarSet`] and restores it on drop, including when the
/// evaluation in between fails.
struct Perturbation<'a, T: Copy + Default> {
    vars: &'a mut VarSet<T>,
    index: usize,
    original: T,
}

impl<'a, T: Copy + Default> Perturbation<'a, T> {
    fn apply(vars: &'a mut VarSet<T>, index: usize, value: T) -> Self {
        let original = vars.as_slice()[index];
        vars.as_mut_slice()[index] = value;
        Self {
            vars,
            index,
            original,
        }
    }
}

impl<T: Copy + Default> Deref for Perturbation<'_, T> {
    type Target = VarSet<T>;

    fn deref(&self) -> &VarSet<T> {
        self.vars
    }
}

impl<T: Copy + Default> Drop for Perturbation<'_, T> {
    fn drop(&mut self) {
        self.vars.as_mut_slice()[self.index] = self.original;
    }
}

fn perturbed<T, F>(
    inputs: &mut VarSet<T>,
    outputs: &mut VarSet<T>,
    flat: (WrtRef, usize),
    value: T,
    eval: F,
) -> Result<Vec<T>, ComponentError>
where
    T: Copy + Default,
    F: Fn(&VarSet<T>, &VarSet<T>) -> Result<Vec<T>, ComponentError>,
{
    match flat.0 {
        WrtRef::Input(_) => {
            let guard = Perturbation::apply(inputs, flat.1, value);
            eval(&guard, outputs)
        }
        WrtRef::Output(_) => {
            let guard = Perturbation::apply(outputs, flat.1, value);
            eval(inputs, &guard)
        }
    }
}

/// Approximates the columns of a component's local Jacobian one perturbation at a time.
///
/// For an explicit component a column is `d outputs / d wrt`; for an implicit one it is
/// `d residuals / d wrt`. The baseline evaluation is computed once and reused.
pub struct ColumnSweep<'a> {
    component: &'a dyn Component,
    implicit: bool,
    fd: FdConfig,
    inputs: VarSet<f64>,
    outputs: VarSet<f64>,
    baseline: Option<Vec<f64>>,
}

impl<'a> ColumnSweep<'a> {
    pub fn new(
        component: &'a dyn Component,
        implicit: bool,
        fd: FdConfig,
        inputs: VarSet<f64>,
        outputs: VarSet<f64>,
    ) -> Self {
        Self {
            component,
            implicit,
            fd,
            inputs,
            outputs,
            baseline: None,
        }
    }

    /// Every scalar column of the given variables, in order.
    pub fn columns(&self, wrt: &[WrtRef]) -> Vec<ColumnRef> {
        wrt.iter()
            .flat_map(|&w| {
                let len = self.range_of(w).len();
                (0..len).map(move |index| ColumnRef { wrt: w, index })
            })
            .collect()
    }

    fn range_of(&self, wrt: WrtRef) -> std::ops::Range<usize> {
        match wrt {
            WrtRef::Input(i) => self.inputs.range_at(i),
            WrtRef::Output(i) => self.outputs.range_at(i),
        }
    }

    fn current(&self, column: ColumnRef) -> (usize, f64) {
        let flat = self.range_of(column.wrt).start + column.index;
        let value = match column.wrt {
            WrtRef::Input(_) => self.inputs.as_slice()[flat],
            WrtRef::Output(_) => self.outputs.as_slice()[flat],
        };
        (flat, value)
    }

    fn eval_real(
        component: &dyn Component,
        implicit: bool,
        inputs: &VarSet<f64>,
        outputs: &VarSet<f64>,
    ) -> Result<Vec<f64>, ComponentError> {
        if implicit {
            let mut residuals = outputs.zeroed();
            component.apply_residual(inputs, outputs, &mut residuals)?;
            Ok(residuals.as_slice().to_vec())
        } else {
            let mut out = outputs.clone();
            component.compute(inputs, &mut out)?;
            Ok(out.as_slice().to_vec())
        }
    }

    fn eval_complex(
        component: &dyn Component,
        implicit: bool,
        inputs: &VarSet<Complex64>,
        outputs: &VarSet<Complex64>,
    ) -> Result<Vec<Complex64>, ComponentError> {
        if implicit {
            let mut residuals = outputs.zeroed();
            component.apply_residual_complex(inputs, outputs, &mut residuals)?;
            Ok(residuals.as_slice().to_vec())
        } else {
            let mut out = outputs.clone();
            component.compute_complex(inputs, &mut out)?;
            Ok(out.as_slice().to_vec())
        }
    }

    fn baseline(&mut self) -> Result<Vec<f64>, ComponentError> {
        if let Some(base) = &self.baseline {
            return Ok(base.clone());
        }
        let base = Self::eval_real(self.component, self.implicit, &self.inputs, &self.outputs)?;
        self.baseline = Some(base.clone());
        Ok(base)
    }

    fn shifted(&mut self, column: ColumnRef, delta: f64) -> Result<Vec<f64>, ComponentError> {
        let (flat, value) = self.current(column);
        let (component, implicit) = (self.component, self.implicit);
        perturbed(
            &mut self.inputs,
            &mut self.outputs,
            (column.wrt, flat),
            value + delta,
            |i, o| Self::eval_real(component, implicit, i, o),
        )
    }

    /// Evaluates one column.
    ///
    /// # Errors
    ///
    /// Propagates the component's error; the perturbed entry is restored either way.
    pub fn evaluate(&mut self, column: ColumnRef) -> Result<Vec<f64>, ComponentError> {
        let (flat, value) = self.current(column);
        let h = self.fd.step_for(value);
        match self.fd.form {
            FdForm::Forward => {
                let base = self.baseline()?;
                let plus = self.shifted(column, h)?;
                Ok(difference(&plus, &base, h))
            }
            FdForm::Backward => {
                let base = self.baseline()?;
                let minus = self.shifted(column, -h)?;
                Ok(difference(&base, &minus, h))
            }
            FdForm::Central => {
                let plus = self.shifted(column, h)?;
                let minus = self.shifted(column, -h)?;
                Ok(difference(&plus, &minus, 2.0 * h))
            }
            FdForm::ComplexStep => {
                let mut inputs = self.inputs.map(Complex64::from);
                let mut outputs = self.outputs.map(Complex64::from);
                let (component, implicit) = (self.component, self.implicit);
                let result = perturbed(
                    &mut inputs,
                    &mut outputs,
                    (column.wrt, flat),
                    Complex64::new(value, h),
                    |i, o| Self::eval_complex(component, implicit, i, o),
                )?;
                Ok(result.iter().map(|c| c.im / h).collect())
            }
        }
    }

    /// The (unperturbed) values seen by the sweep.
    pub fn inputs(&self) -> &VarSet<f64> {
        &self.inputs
    }

    pub fn outputs(&self) -> &VarSet<f64> {
        &self.outputs
    }
}

fn difference(a: &[f64], b: &[f64], denom: f64) -> Vec<f64> {
    a.iter().zip(b).map(|(x, y)| (x - y) / denom).collect()
}
