//! Fixture components and models shared by the unit tests.

use crate::core::jacobian::approx::FdConfig;
use crate::core::jacobian::block::Partials;
use crate::core::models::component::{
    Complex64, Component, ComponentError, Declarations, IndepVarComp, Linearization,
};
use crate::core::models::system::{GroupKind, Model, NonlinearIteration};
use crate::core::models::variable::VarSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Routes `tracing` output to the test harness. Safe to call from every test.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// `output = factor * input`, scalars.
#[derive(Debug, Clone)]
pub(crate) struct Scale {
    input: String,
    output: String,
    factor: f64,
    fd: Option<FdConfig>,
}

impl Scale {
    pub(crate) fn new(input: &str, output: &str, factor: f64) -> Self {
        Self {
            input: input.to_string(),
            output: output.to_string(),
            factor,
            fd: None,
        }
    }

    pub(crate) fn with_fd_options(mut self, fd: FdConfig) -> Self {
        self.fd = Some(fd);
        self
    }
}

impl Component for Scale {
    fn declare(&self, decl: &mut Declarations) {
        decl.add_input(&self.input, 1)
            .add_output(&self.output, 1)
            .declare_partials(&self.output, &self.input);
        if let Some(fd) = self.fd {
            decl.set_fd_options(fd);
        }
    }

    fn compute(&self, inputs: &VarSet<f64>, outputs: &mut VarSet<f64>) -> Result<(), ComponentError> {
        outputs.set_scalar(&self.output, self.factor * inputs.scalar(&self.input)?)
    }

    fn linearize(
        &self,
        _: &VarSet<f64>,
        _: &VarSet<f64>,
        partials: &mut Partials,
    ) -> Result<Linearization, ComponentError> {
        partials.set(&self.output, &self.input, &[self.factor])?;
        Ok(Linearization::Analytic)
    }

    fn compute_complex(
        &self,
        inputs: &VarSet<Complex64>,
        outputs: &mut VarSet<Complex64>,
    ) -> Result<(), ComponentError> {
        outputs.set_scalar(&self.output, inputs.scalar(&self.input)? * self.factor)
    }
}

/// `f_xy = (x - 3)^2 + x y + (y + 4)^2 - 3`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Paraboloid;

impl Paraboloid {
    fn value<T>(x: T, y: T) -> T
    where
        T: Copy + std::ops::Add<Output = T> + std::ops::Sub<Output = T> + std::ops::Mul<Output = T>,
        T: From<f64>,
    {
        let three = T::from(3.0_f64);
        let four = T::from(4.0_f64);
        (x - three) * (x - three) + x * y + (y + four) * (y + four) - three
    }
}

impl Component for Paraboloid {
    fn declare(&self, decl: &mut Declarations) {
        decl.add_input("x", 1)
            .add_input("y", 1)
            .add_output("f_xy", 1)
            .declare_partials("f_xy", "*");
    }

    fn compute(&self, inputs: &VarSet<f64>, outputs: &mut VarSet<f64>) -> Result<(), ComponentError> {
        let f = Self::value(inputs.scalar("x")?, inputs.scalar("y")?);
        outputs.set_scalar("f_xy", f)
    }

    fn linearize(
        &self,
        inputs: &VarSet<f64>,
        _: &VarSet<f64>,
        partials: &mut Partials,
    ) -> Result<Linearization, ComponentError> {
        let x = inputs.scalar("x")?;
        let y = inputs.scalar("y")?;
        partials.set("f_xy", "x", &[2.0 * (x - 3.0) + y])?;
        partials.set("f_xy", "y", &[x + 2.0 * (y + 4.0)])?;
        Ok(Linearization::Analytic)
    }

    fn compute_complex(
        &self,
        inputs: &VarSet<Complex64>,
        outputs: &mut VarSet<Complex64>,
    ) -> Result<(), ComponentError> {
        let f = Self::value(inputs.scalar("x")?, inputs.scalar("y")?);
        outputs.set_scalar("f_xy", f)
    }
}

/// `y = 2 x`, failing once `x` exceeds `limit`. No analytic partials, no complex step.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Fragile {
    pub limit: f64,
}

impl Component for Fragile {
    fn declare(&self, decl: &mut Declarations) {
        decl.add_input("x", 1).add_output("y", 1).declare_partials("y", "x");
    }

    fn compute(&self, inputs: &VarSet<f64>, outputs: &mut VarSet<f64>) -> Result<(), ComponentError> {
        let x = inputs.scalar("x")?;
        if x > self.limit {
            return Err(ComponentError::Failed(format!("x = {x} is above {}", self.limit)));
        }
        outputs.set_scalar("y", 2.0 * x)
    }
}

/// `y = a + b` that only declares its dependency on `a`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IncompleteSum;

impl Component for IncompleteSum {
    fn declare(&self, decl: &mut Declarations) {
        decl.add_input("a", 1)
            .add_input("b", 1)
            .add_output("y", 1)
            .declare_partials("y", "a");
    }

    fn compute(&self, inputs: &VarSet<f64>, outputs: &mut VarSet<f64>) -> Result<(), ComponentError> {
        outputs.set_scalar("y", inputs.scalar("a")? + inputs.scalar("b")?)
    }

    fn linearize(
        &self,
        _: &VarSet<f64>,
        _: &VarSet<f64>,
        partials: &mut Partials,
    ) -> Result<Linearization, ComponentError> {
        partials.set("y", "a", &[1.0])?;
        Ok(Linearization::Analytic)
    }
}

/// `sq[i] = v[i]^2` with a diagonal sparsity pattern.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ElementwiseSquare {
    pub size: usize,
}

impl Component for ElementwiseSquare {
    fn declare(&self, decl: &mut Declarations) {
        let diag: Vec<usize> = (0..self.size).collect();
        decl.add_input("v", self.size)
            .add_output("sq", self.size)
            .declare_sparse_partials("sq", "v", diag.clone(), diag);
    }

    fn compute(&self, inputs: &VarSet<f64>, outputs: &mut VarSet<f64>) -> Result<(), ComponentError> {
        let squared: Vec<f64> = inputs.get("v")?.iter().map(|v| v * v).collect();
        outputs.set("sq", &squared)
    }

    fn linearize(
        &self,
        inputs: &VarSet<f64>,
        _: &VarSet<f64>,
        partials: &mut Partials,
    ) -> Result<Linearization, ComponentError> {
        let diag: Vec<f64> = inputs.get("v")?.iter().map(|v| 2.0 * v).collect();
        partials.set("sq", "v", &diag)?;
        Ok(Linearization::Analytic)
    }
}

/// Implicit state `x` with `R = a x^2 + b x + c`, converged to the larger root.
#[derive(Debug, Clone, Copy)]
pub(crate) struct QuadraticState;

impl Component for QuadraticState {
    fn declare(&self, decl: &mut Declarations) {
        decl.add_input("a", 1)
            .add_input("b", 1)
            .add_input("c", 1)
            .add_output("x", 1)
            .declare_partials("x", "*");
    }

    fn is_implicit(&self) -> bool {
        true
    }

    fn compute(&self, inputs: &VarSet<f64>, outputs: &mut VarSet<f64>) -> Result<(), ComponentError> {
        let (a, b, c) = (inputs.scalar("a")?, inputs.scalar("b")?, inputs.scalar("c")?);
        let disc = b * b - 4.0 * a * c;
        if a == 0.0 || disc < 0.0 {
            return Err(ComponentError::Failed("no real root".to_string()));
        }
        outputs.set_scalar("x", (-b + disc.sqrt()) / (2.0 * a))
    }

    fn apply_residual(
        &self,
        inputs: &VarSet<f64>,
        outputs: &VarSet<f64>,
        residuals: &mut VarSet<f64>,
    ) -> Result<(), ComponentError> {
        let (a, b, c) = (inputs.scalar("a")?, inputs.scalar("b")?, inputs.scalar("c")?);
        let x = outputs.scalar("x")?;
        residuals.set_scalar("x", a * x * x + b * x + c)
    }

    fn linearize(
        &self,
        inputs: &VarSet<f64>,
        outputs: &VarSet<f64>,
        partials: &mut Partials,
    ) -> Result<Linearization, ComponentError> {
        let (a, b) = (inputs.scalar("a")?, inputs.scalar("b")?);
        let x = outputs.scalar("x")?;
        partials.set("x", "a", &[x * x])?;
        partials.set("x", "b", &[x])?;
        partials.set("x", "c", &[1.0])?;
        partials.set("x", "x", &[2.0 * a * x + b])?;
        Ok(Linearization::Analytic)
    }
}

/// Counts `compute` calls, otherwise passes `x` through to `y`.
#[derive(Debug, Clone, Default)]
pub(crate) struct Counter {
    pub calls: Arc<AtomicUsize>,
}

impl Component for Counter {
    fn declare(&self, decl: &mut Declarations) {
        decl.add_input("x", 1).add_output("y", 1).declare_partials("y", "x");
    }

    fn compute(&self, inputs: &VarSet<f64>, outputs: &mut VarSet<f64>) -> Result<(), ComponentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        outputs.set_scalar("y", inputs.scalar("x")?)
    }
}

/// Sellar discipline 1: `y1 = z1^2 + z2 + x - 0.2 y2`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SellarDis1;

impl Component for SellarDis1 {
    fn declare(&self, decl: &mut Declarations) {
        decl.add_input("z", 2)
            .add_input("x", 1)
            .add_input("y2", 1)
            .add_output_with_value("y1", 1, vec![1.0])
            .declare_partials("y1", "*");
    }

    fn compute(&self, inputs: &VarSet<f64>, outputs: &mut VarSet<f64>) -> Result<(), ComponentError> {
        let z = inputs.get("z")?;
        let y1 = z[0] * z[0] + z[1] + inputs.scalar("x")? - 0.2 * inputs.scalar("y2")?;
        outputs.set_scalar("y1", y1)
    }

    fn linearize(
        &self,
        inputs: &VarSet<f64>,
        _: &VarSet<f64>,
        partials: &mut Partials,
    ) -> Result<Linearization, ComponentError> {
        let z = inputs.get("z")?;
        partials.set("y1", "z", &[2.0 * z[0], 1.0])?;
        partials.set("y1", "x", &[1.0])?;
        partials.set("y1", "y2", &[-0.2])?;
        Ok(Linearization::Analytic)
    }
}

/// Sellar discipline 2: `y2 = sqrt(|y1|) + z1 + z2`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SellarDis2;

impl Component for SellarDis2 {
    fn declare(&self, decl: &mut Declarations) {
        decl.add_input("z", 2)
            .add_input("y1", 1)
            .add_output_with_value("y2", 1, vec![1.0])
            .declare_partials("y2", "*");
    }

    fn compute(&self, inputs: &VarSet<f64>, outputs: &mut VarSet<f64>) -> Result<(), ComponentError> {
        let z = inputs.get("z")?;
        let y2 = inputs.scalar("y1")?.abs().sqrt() + z[0] + z[1];
        outputs.set_scalar("y2", y2)
    }

    fn linearize(
        &self,
        inputs: &VarSet<f64>,
        _: &VarSet<f64>,
        partials: &mut Partials,
    ) -> Result<Linearization, ComponentError> {
        let y1 = inputs.scalar("y1")?;
        partials.set("y2", "z", &[1.0, 1.0])?;
        partials.set("y2", "y1", &[0.5 * y1.signum() / y1.abs().sqrt()])?;
        Ok(Linearization::Analytic)
    }
}

/// `obj = x^2 + z2 + y1 + exp(-y2)`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SellarObjective;

impl Component for SellarObjective {
    fn declare(&self, decl: &mut Declarations) {
        decl.add_input("x", 1)
            .add_input("z", 2)
            .add_input("y1", 1)
            .add_input("y2", 1)
            .add_output("obj", 1)
            .declare_partials("obj", "*");
    }

    fn compute(&self, inputs: &VarSet<f64>, outputs: &mut VarSet<f64>) -> Result<(), ComponentError> {
        let x = inputs.scalar("x")?;
        let z = inputs.get("z")?;
        let obj = x * x + z[1] + inputs.scalar("y1")? + (-inputs.scalar("y2")?).exp();
        outputs.set_scalar("obj", obj)
    }

    fn linearize(
        &self,
        inputs: &VarSet<f64>,
        _: &VarSet<f64>,
        partials: &mut Partials,
    ) -> Result<Linearization, ComponentError> {
        partials.set("obj", "x", &[2.0 * inputs.scalar("x")?])?;
        partials.set("obj", "z", &[0.0, 1.0])?;
        partials.set("obj", "y1", &[1.0])?;
        partials.set("obj", "y2", &[-(-inputs.scalar("y2")?).exp()])?;
        Ok(Linearization::Analytic)
    }
}

/// `out = offset + sign * input`, the shape of both Sellar constraints.
#[derive(Debug, Clone)]
pub(crate) struct Affine {
    input: String,
    output: String,
    offset: f64,
    sign: f64,
}

impl Affine {
    pub(crate) fn new(input: &str, output: &str, offset: f64, sign: f64) -> Self {
        Self {
            input: input.to_string(),
            output: output.to_string(),
            offset,
            sign,
        }
    }
}

impl Component for Affine {
    fn declare(&self, decl: &mut Declarations) {
        decl.add_input(&self.input, 1)
            .add_output(&self.output, 1)
            .declare_partials(&self.output, &self.input);
    }

    fn compute(&self, inputs: &VarSet<f64>, outputs: &mut VarSet<f64>) -> Result<(), ComponentError> {
        outputs.set_scalar(&self.output, self.offset + self.sign * inputs.scalar(&self.input)?)
    }

    fn linearize(
        &self,
        _: &VarSet<f64>,
        _: &VarSet<f64>,
        partials: &mut Partials,
    ) -> Result<Linearization, ComponentError> {
        partials.set(&self.output, &self.input, &[self.sign])?;
        Ok(Linearization::Analytic)
    }
}

/// `x -> A (y = 2x) -> B (z = 3y)`, everything promoted.
pub(crate) fn chain_model() -> Model {
    let mut model = Model::new();
    let root = model.root();
    model
        .add_component(root, "p", IndepVarComp::scalar("x", 1.0), &["x"])
        .unwrap();
    model
        .add_component(root, "A", Scale::new("x", "y", 2.0), &["x", "y"])
        .unwrap();
    model
        .add_component(root, "B", Scale::new("y", "z", 3.0), &["y", "z"])
        .unwrap();
    model
}

/// The Sellar problem at `z = (5, 2)`, `x = 1`, with the two disciplines coupled inside an
/// iterated group named `cycle`.
pub(crate) fn sellar_model() -> Model {
    let mut model = Model::new();
    let root = model.root();
    model
        .add_component(root, "px", IndepVarComp::scalar("x", 1.0), &["*"])
        .unwrap();
    model
        .add_component(root, "pz", IndepVarComp::new().with_output("z", vec![5.0, 2.0]), &["*"])
        .unwrap();
    let cycle = model
        .add_group(root, "cycle", GroupKind::Serial, &["*"])
        .unwrap();
    model.add_component(cycle, "d1", SellarDis1, &["*"]).unwrap();
    model.add_component(cycle, "d2", SellarDis2, &["*"]).unwrap();
    model
        .set_nonlinear_iteration(cycle, NonlinearIteration::default())
        .unwrap();
    model
        .add_component(root, "obj_cmp", SellarObjective, &["*"])
        .unwrap();
    model
        .add_component(root, "con_cmp1", Affine::new("y1", "con1", 3.16, -1.0), &["*"])
        .unwrap();
    model
        .add_component(root, "con_cmp2", Affine::new("y2", "con2", -24.0, 1.0), &["*"])
        .unwrap();
    model
}

/// Two design variables feeding three independent children of a parallel group, followed by
/// a replicated post-processing component.
pub(crate) fn parallel_model() -> Model {
    let mut model = Model::new();
    let root = model.root();
    model
        .add_component(
            root,
            "p",
            IndepVarComp::new().with_output("a", vec![1.0]).with_output("b", vec![2.0]),
            &["*"],
        )
        .unwrap();
    let par = model
        .add_group(root, "par", GroupKind::Parallel, &["*"])
        .unwrap();
    model
        .add_component(par, "ca", Scale::new("a", "ya", 2.0), &["a", "ya"])
        .unwrap();
    model
        .add_component(par, "cb", Scale::new("b", "yb", 3.0), &["b", "yb"])
        .unwrap();
    model.add_component(par, "cc", Paraboloid, &[]).unwrap();
    model.connect(root, "a", "cc.x").unwrap();
    model.connect(root, "b", "cc.y").unwrap();
    model
        .add_component(root, "post", Scale::new("ya", "w", 0.5), &["ya", "w"])
        .unwrap();
    model
}

/// A parallel group whose second child fails for the default input.
pub(crate) fn fragile_parallel_model() -> Model {
    let mut model = Model::new();
    let root = model.root();
    model
        .add_component(root, "p", IndepVarComp::scalar("x", 5.0), &["*"])
        .unwrap();
    let par = model
        .add_group(root, "par", GroupKind::Parallel, &["*"])
        .unwrap();
    model
        .add_component(par, "ok", Scale::new("x", "y", 1.0), &["x", "y"])
        .unwrap();
    model
        .add_component(par, "bad", Fragile { limit: 1.0 }, &["x"])
        .unwrap();
    model
}
