use super::variable::{Shape, VarSet};
use crate::core::jacobian::approx::FdConfig;
use crate::core::jacobian::block::{Partials, PartialPattern};
use nalgebra::Complex;
use thiserror::Error;

pub type Complex64 = Complex<f64>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ComponentError {
    #[error("Unknown local variable '{0}'")]
    UnknownVariable(String),

    #[error("Variable '{name}' expects {expected} values, got {actual}")]
    SizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("Partial derivative of '{of}' with respect to '{wrt}' was not declared")]
    UndeclaredPartial { of: String, wrt: String },

    #[error("Complex-step evaluation is not supported by this component")]
    ComplexStepUnsupported,

    #[error("Residual evaluation is not implemented by this component")]
    ResidualUnsupported,

    #[error("Computation failed: {0}")]
    Failed(String),
}

/// What a component's `linearize` call produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linearization {
    /// Every declared partial was written analytically.
    Analytic,
    /// No analytic partials; the engine approximates the declared ones.
    Unavailable,
}

/// The contract every leaf analysis fulfils.
///
/// Explicit components compute their outputs directly from their inputs, `u = f(p)`. Implicit
/// components instead expose a residual `R(p, u)` that vanishes at the solution, and must
/// override [`Component::is_implicit`] and [`Component::apply_residual`]. Their `compute`
/// converges the outputs until the residual vanishes.
///
/// Partials supplied through `linearize` follow the natural convention of each kind:
/// `df/dp` for explicit components and `dR/dp`, `dR/du` for implicit ones.
pub trait Component: Send + Sync {
    /// Declares inputs, outputs, partial sparsity and approximation options.
    fn declare(&self, decl: &mut Declarations);

    fn compute(
        &self,
        inputs: &VarSet<f64>,
        outputs: &mut VarSet<f64>,
    ) -> Result<(), ComponentError>;

    fn is_implicit(&self) -> bool {
        false
    }

    /// Design-variable sources: their outputs have no dependencies and may be set from outside.
    fn is_independent(&self) -> bool {
        false
    }

    fn apply_residual(
        &self,
        inputs: &VarSet<f64>,
        outputs: &VarSet<f64>,
        residuals: &mut VarSet<f64>,
    ) -> Result<(), ComponentError> {
        let _ = (inputs, outputs, residuals);
        Err(ComponentError::ResidualUnsupported)
    }

    fn linearize(
        &self,
        inputs: &VarSet<f64>,
        outputs: &VarSet<f64>,
        partials: &mut Partials,
    ) -> Result<Linearization, ComponentError> {
        let _ = (inputs, outputs, partials);
        Ok(Linearization::Unavailable)
    }

    fn compute_complex(
        &self,
        inputs: &VarSet<Complex64>,
        outputs: &mut VarSet<Complex64>,
    ) -> Result<(), ComponentError> {
        let _ = (inputs, outputs);
        Err(ComponentError::ComplexStepUnsupported)
    }

    fn apply_residual_complex(
        &self,
        inputs: &VarSet<Complex64>,
        outputs: &VarSet<Complex64>,
        residuals: &mut VarSet<Complex64>,
    ) -> Result<(), ComponentError> {
        let _ = (inputs, outputs, residuals);
        Err(ComponentError::ComplexStepUnsupported)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarDecl {
    pub name: String,
    pub shape: Shape,
    /// Initial value of an output. Outputs without one start uninitialized; inputs always
    /// take their value from the connected source.
    pub value: Option<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartialDecl {
    /// Output name or glob pattern.
    pub of: String,
    /// Input (or, for implicit components, output) name or glob pattern.
    pub wrt: String,
    pub pattern: PartialPattern,
}

/// Collected by [`Component::declare`] during setup.
#[derive(Debug, Clone, Default)]
pub struct Declarations {
    pub(crate) inputs: Vec<VarDecl>,
    pub(crate) outputs: Vec<VarDecl>,
    pub(crate) partials: Vec<PartialDecl>,
    pub(crate) fd: Option<FdConfig>,
    pub(crate) force_fd: bool,
}

impl Declarations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_input(&mut self, name: &str, shape: impl Into<Shape>) -> &mut Self {
        self.inputs.push(VarDecl {
            name: name.to_string(),
            shape: shape.into(),
            value: None,
        });
        self
    }

    pub fn add_output(&mut self, name: &str, shape: impl Into<Shape>) -> &mut Self {
        self.outputs.push(VarDecl {
            name: name.to_string(),
            shape: shape.into(),
            value: None,
        });
        self
    }

    pub fn add_output_with_value(
        &mut self,
        name: &str,
        shape: impl Into<Shape>,
        value: Vec<f64>,
    ) -> &mut Self {
        self.outputs.push(VarDecl {
            name: name.to_string(),
            shape: shape.into(),
            value: Some(value),
        });
        self
    }

    /// Declares a dense partial block. Both names accept `*` and `?` globs.
    pub fn declare_partials(&mut self, of: &str, wrt: &str) -> &mut Self {
        self.partials.push(PartialDecl {
            of: of.to_string(),
            wrt: wrt.to_string(),
            pattern: PartialPattern::Dense,
        });
        self
    }

    /// Declares a sparse partial block with the given nonzero coordinates.
    pub fn declare_sparse_partials(
        &mut self,
        of: &str,
        wrt: &str,
        rows: Vec<usize>,
        cols: Vec<usize>,
    ) -> &mut Self {
        self.partials.push(PartialDecl {
            of: of.to_string(),
            wrt: wrt.to_string(),
            pattern: PartialPattern::Sparse { rows, cols },
        });
        self
    }

    /// Overrides the finite-difference options for this component only.
    pub fn set_fd_options(&mut self, fd: FdConfig) -> &mut Self {
        self.fd = Some(fd);
        self
    }

    /// Approximates this component's partials even if it provides analytic ones.
    pub fn force_fd(&mut self) -> &mut Self {
        self.force_fd = true;
        self
    }

    pub fn inputs(&self) -> &[VarDecl] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[VarDecl] {
        &self.outputs
    }

    pub fn partials(&self) -> &[PartialDecl] {
        &self.partials
    }
}

/// Source of design variables: a component with outputs and no inputs.
#[derive(Debug, Clone, Default)]
pub struct IndepVarComp {
    outputs: Vec<(String, Shape, Vec<f64>)>,
}

impl IndepVarComp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scalar(name: &str, value: f64) -> Self {
        Self::new().with_output(name, vec![value])
    }

    pub fn with_output(self, name: &str, value: Vec<f64>) -> Self {
        let shape = Shape::vector(value.len());
        self.with_shaped_output(name, shape, value)
    }

    pub fn with_shaped_output(mut self, name: &str, shape: impl Into<Shape>, value: Vec<f64>) -> Self {
        self.outputs.push((name.to_string(), shape.into(), value));
        self
    }
}

impl Component for IndepVarComp {
    fn declare(&self, decl: &mut Declarations) {
        for (name, shape, value) in &self.outputs {
            decl.add_output_with_value(name, shape.clone(), value.clone());
        }
    }

    fn is_independent(&self) -> bool {
        true
    }

    fn compute(&self, _: &VarSet<f64>, _: &mut VarSet<f64>) -> Result<(), ComponentError> {
        Ok(())
    }

    fn linearize(
        &self,
        _: &VarSet<f64>,
        _: &VarSet<f64>,
        _: &mut Partials,
    ) -> Result<Linearization, ComponentError> {
        Ok(Linearization::Analytic)
    }

    fn compute_complex(
        &self,
        _: &VarSet<Complex64>,
        _: &mut VarSet<Complex64>,
    ) -> Result<(), ComponentError> {
        Ok(())
    }
}

/// Glob matching with `*` (any run) and `?` (any single character).
pub(crate) fn matches_pattern(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ni));
            pi += 1;
        } else if let Some((sp, sn)) = star {
            pi = sp + 1;
            ni = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
