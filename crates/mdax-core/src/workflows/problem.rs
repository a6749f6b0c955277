use crate::core::jacobian::operator::SystemOperator;
use crate::core::jacobian::store::JacobianStore;
use crate::core::models::system::{Model, SetupError};
use crate::core::registry::VariableRegistry;
use crate::engine::config::DerivativeConfig;
use crate::engine::distributed::collective::{Collective, SerialComm};
use crate::engine::error::MdoError;
use crate::engine::execution::{self, ApproxSettings, PartialCheck};
use crate::engine::orchestrator::{
    TotalJacobian, VariableSelection, compute_totals, resolve_design_var, resolve_design_vars,
    resolve_responses, select_mode,
};
use crate::engine::progress::{Progress, ProgressReporter};
use crate::engine::recording::{Recorder, Snapshot, SnapshotEvent};
use crate::engine::setup::{Assembly, assemble};
use crate::engine::solvers::{LinearSolver, build_solver};
use std::sync::Arc;
use tracing::{info, instrument};

/// Name used when the driver itself reads a variable.
const DRIVER: &str = "driver";

type SharedCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// An assembled model ready to be evaluated and differentiated on one rank of a collective.
///
/// Every rank of a collective builds its own `Problem` from an identical model and makes the
/// same sequence of calls; the collective keeps their state consistent.
pub struct Problem {
    assembly: Assembly,
    config: DerivativeConfig,
    comm: Arc<dyn Collective>,
    solver: Box<dyn LinearSolver>,
    trace: Vec<String>,
    recorders: Vec<Box<dyn Recorder>>,
    progress: Option<SharedCallback>,
    compute_passes: usize,
    linearize_passes: usize,
}

impl Problem {
    /// Assembles `model` for a single process.
    ///
    /// # Errors
    ///
    /// Returns the first structural problem found: an invalid configuration, a duplicate or
    /// unknown variable, or a connection error. No component is computed before this returns.
    pub fn setup(model: Model, config: DerivativeConfig) -> Result<Self, MdoError> {
        Self::setup_with_collective(model, config, Arc::new(SerialComm))
    }

    /// Assembles `model` as one rank of `comm`. Parallel groups are spread over the ranks.
    #[instrument(skip_all, name = "problem_setup")]
    pub fn setup_with_collective(
        model: Model,
        config: DerivativeConfig,
        comm: Arc<dyn Collective>,
    ) -> Result<Self, MdoError> {
        config.validate()?;
        let assembly = assemble(model, comm.size())?;
        let solver = build_solver(&config.linear_solver);
        info!(
            rank = comm.rank(),
            size = comm.size(),
            components = assembly.components.len(),
            unknowns = assembly.registry.n_unknowns(),
            solver = solver.name(),
            "Problem set up"
        );
        Ok(Self {
            assembly,
            config,
            comm,
            solver,
            trace: Vec::new(),
            recorders: Vec::new(),
            progress: None,
            compute_passes: 0,
            linearize_passes: 0,
        })
    }

    fn reporter(&self) -> ProgressReporter<'static> {
        match &self.progress {
            Some(callback) => {
                let callback = Arc::clone(callback);
                ProgressReporter::with_callback(Box::new(move |event| callback(event)))
            }
            None => ProgressReporter::new(),
        }
    }

    fn record(&mut self, event: SnapshotEvent, pass: usize) {
        if self.recorders.is_empty() {
            return;
        }
        let snapshot = Snapshot::capture(&self.assembly.registry, event, pass, self.comm.rank());
        for recorder in &mut self.recorders {
            recorder.record(&snapshot);
        }
    }

    /// Runs the whole model once, replacing the execution trace.
    pub fn run(&mut self) -> Result<(), MdoError> {
        let reporter = self.reporter();
        self.trace.clear();
        let Self {
            assembly,
            comm,
            trace,
            ..
        } = self;
        reporter.phase("run", || execution::run_model(assembly, &**comm, trace))?;
        self.compute_passes += 1;
        self.record(SnapshotEvent::Compute, self.compute_passes);
        Ok(())
    }

    /// Overwrites a design variable. Takes effect on the next [`Problem::run`].
    pub fn set_design_var(&mut self, name: &str, values: &[f64]) -> Result<(), MdoError> {
        let target = resolve_design_var(&self.assembly, &VariableSelection::new(name))?;
        let expected = self.assembly.registry.var(target.var).size();
        if values.len() != expected {
            return Err(SetupError::InvalidValue {
                name: name.to_string(),
                expected,
                actual: values.len(),
            }
            .into());
        }
        self.assembly.registry.write(target.var, values);
        Ok(())
    }

    /// Current value of any variable, by promoted name or absolute path.
    pub fn get_value(&self, name: &str) -> Result<Vec<f64>, MdoError> {
        let id = self.assembly.registry.resolve(name)?;
        Ok(self.assembly.registry.read(id, DRIVER)?.to_vec())
    }

    /// Current value of a response. An input name reads the output it is connected to.
    pub fn get_response(&self, name: &str) -> Result<Vec<f64>, MdoError> {
        let id = self.assembly.registry.resolve_output(name)?;
        Ok(self.assembly.registry.read(id, DRIVER)?.to_vec())
    }

    /// Recomputes every partial derivative block at the current state.
    pub fn linearize(&mut self) -> Result<(), MdoError> {
        let reporter = self.reporter();
        let settings = ApproxSettings {
            fd: self.config.fd,
            force_fd: self.config.force_fd,
        };
        let Self { assembly, comm, .. } = self;
        reporter.phase("linearize", || {
            execution::linearize_all(assembly, &**comm, settings)
        })?;
        self.linearize_passes += 1;
        self.record(SnapshotEvent::Linearize, self.linearize_passes);
        Ok(())
    }

    /// Total derivatives of `responses` with respect to `design_vars` at the current state.
    ///
    /// The model is linearized first; the mode follows the configured selection, with `Auto`
    /// comparing the number of selected scalar entries on each side.
    ///
    /// # Errors
    ///
    /// Fails on unknown names, design variables that are not independent outputs, any
    /// linearization failure, and any [`LinearSolveError`] from a single group's solve.
    ///
    /// [`LinearSolveError`]: crate::engine::solvers::LinearSolveError
    #[instrument(skip_all, name = "request_total_derivatives")]
    pub fn request_total_derivatives<I, J>(
        &mut self,
        design_vars: I,
        responses: J,
    ) -> Result<TotalJacobian, MdoError>
    where
        I: IntoIterator,
        I::Item: Into<VariableSelection>,
        J: IntoIterator,
        J::Item: Into<VariableSelection>,
    {
        let design_vars: Vec<VariableSelection> = design_vars.into_iter().map(Into::into).collect();
        let responses: Vec<VariableSelection> = responses.into_iter().map(Into::into).collect();
        let design_vars = resolve_design_vars(&self.assembly, &design_vars)?;
        let responses = resolve_responses(&self.assembly, &responses)?;

        self.linearize()?;

        let n_design = design_vars.iter().map(|t| t.indices.len()).sum();
        let n_responses = responses.iter().map(|t| t.indices.len()).sum();
        let mode = select_mode(n_design, n_responses, self.config.mode);
        let reporter = self.reporter();
        reporter.phase("total_derivatives", || {
            compute_totals(
                &self.assembly,
                &self.comm,
                self.solver.as_ref(),
                &design_vars,
                &responses,
                mode,
                &reporter,
            )
        })
    }

    /// Compares partials with finite differences at the current state.
    ///
    /// Only the components this rank runs are checked. Under a parallel group each rank
    /// reports its own children, so a complete report is the union over all ranks.
    pub fn check_partials(&self) -> Result<Vec<PartialCheck>, MdoError> {
        execution::check_partials(&self.assembly, self.comm.as_ref(), self.config.fd)
    }

    /// Component paths in the order the last [`Problem::run`] evaluated them on this rank.
    pub fn execution_trace(&self) -> &[String] {
        &self.trace
    }

    pub fn add_recorder(&mut self, recorder: impl Recorder + 'static) {
        self.recorders.push(Box::new(recorder));
    }

    pub fn set_progress_callback(&mut self, callback: impl Fn(Progress) + Send + Sync + 'static) {
        self.progress = Some(Arc::new(callback));
    }

    pub fn config(&self) -> &DerivativeConfig {
        &self.config
    }

    pub fn model(&self) -> &Model {
        &self.assembly.model
    }

    pub fn registry(&self) -> &VariableRegistry {
        &self.assembly.registry
    }

    pub fn jacobian(&self) -> &JacobianStore {
        &self.assembly.jacobian
    }

    /// The assembled residual Jacobian of the last linearization.
    pub fn operator(&self) -> SystemOperator {
        self.assembly
            .jacobian
            .get_operator(&self.assembly.registry, self.assembly.blocks.clone())
    }
}
