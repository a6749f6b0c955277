use super::config::ModeSelection;
use super::distributed::collective::Collective;
use super::error::MdoError;
use super::progress::{Progress, ProgressReporter};
use super::relevance::{RelevanceGraph, partition_seeds};
use super::setup::Assembly;
use super::solvers::{LinearSolver, SolveMode};
use crate::core::models::ids::VarId;
use crate::core::models::system::SetupError;
use nalgebra::{DMatrix, DVector};
use std::collections::{BTreeSet, HashMap};
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// A design variable or response named in a derivative request, optionally restricted to some
/// of its flattened entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableSelection {
    pub name: String,
    pub indices: Option<Vec<usize>>,
}

impl VariableSelection {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            indices: None,
        }
    }

    pub fn with_indices(name: &str, indices: Vec<usize>) -> Self {
        Self {
            name: name.to_string(),
            indices: Some(indices),
        }
    }
}

impl From<&str> for VariableSelection {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for VariableSelection {
    fn from(name: String) -> Self {
        Self {
            name,
            indices: None,
        }
    }
}

/// A resolved selection: the output holding the value and the flat entries involved.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Target {
    pub name: String,
    pub var: VarId,
    pub indices: Vec<usize>,
}

/// Total derivatives `d(responses)/d(design variables)`.
///
/// Rows follow the responses and columns the design variables, each in the order they were
/// requested, expanded to their selected flat entries.
#[derive(Debug, Clone, PartialEq)]
pub struct TotalJacobian {
    of: Vec<(String, Range<usize>)>,
    wrt: Vec<(String, Range<usize>)>,
    values: DMatrix<f64>,
    mode: SolveMode,
}

impl TotalJacobian {
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.values
    }

    pub fn mode(&self) -> SolveMode {
        self.mode
    }

    pub fn of(&self) -> impl Iterator<Item = &str> {
        self.of.iter().map(|(n, _)| n.as_str())
    }

    pub fn wrt(&self) -> impl Iterator<Item = &str> {
        self.wrt.iter().map(|(n, _)| n.as_str())
    }

    /// The block for one response and one design variable, by the names used in the request.
    pub fn get(&self, of: &str, wrt: &str) -> Option<DMatrix<f64>> {
        let (_, rows) = self.of.iter().find(|(n, _)| n == of)?;
        let (_, cols) = self.wrt.iter().find(|(n, _)| n == wrt)?;
        Some(
            self.values
                .view((rows.start, cols.start), (rows.len(), cols.len()))
                .into_owned(),
        )
    }
}

/// Direct mode costs one solve per design-variable entry and adjoint mode one per response
/// entry; `Auto` picks the cheaper one, preferring direct on a tie.
pub fn select_mode(n_design: usize, n_responses: usize, selection: ModeSelection) -> SolveMode {
    match selection {
        ModeSelection::Direct => SolveMode::Direct,
        ModeSelection::Adjoint => SolveMode::Adjoint,
        ModeSelection::Auto if n_design <= n_responses => SolveMode::Direct,
        ModeSelection::Auto => SolveMode::Adjoint,
    }
}

fn resolve_target(asm: &Assembly, selection: &VariableSelection) -> Result<Target, MdoError> {
    let var = asm.registry.resolve_output(&selection.name)?;
    let size = asm.registry.var(var).size();
    let indices = match &selection.indices {
        Some(ix) => {
            if let Some(&bad) = ix.iter().find(|&&i| i >= size) {
                return Err(SetupError::InvalidIndices {
                    name: selection.name.clone(),
                    index: bad,
                    size,
                }
                .into());
            }
            ix.clone()
        }
        None => (0..size).collect(),
    };
    Ok(Target {
        name: selection.name.clone(),
        var,
        indices,
    })
}

/// Resolves a design variable, which must be an output of an independent variable component.
pub(crate) fn resolve_design_var(
    asm: &Assembly,
    selection: &VariableSelection,
) -> Result<Target, MdoError> {
    let target = resolve_target(asm, selection)?;
    let independent = asm
        .components
        .iter()
        .any(|c| c.independent && c.outputs.contains(&target.var));
    if !independent {
        return Err(SetupError::InvalidDesignVariable {
            name: selection.name.clone(),
            reason: format!(
                "'{}' is not an output of an independent variable component",
                asm.registry.var(target.var).path
            ),
        }
        .into());
    }
    Ok(target)
}

pub(crate) fn resolve_design_vars(
    asm: &Assembly,
    selections: &[VariableSelection],
) -> Result<Vec<Target>, MdoError> {
    selections
        .iter()
        .map(|selection| resolve_design_var(asm, selection))
        .collect()
}

/// Resolves responses; an input name stands for the output it is connected to.
pub(crate) fn resolve_responses(
    asm: &Assembly,
    selections: &[VariableSelection],
) -> Result<Vec<Target>, MdoError> {
    selections.iter().map(|s| resolve_target(asm, s)).collect()
}

fn expand(asm: &Assembly, targets: &[Target]) -> (Vec<(String, Range<usize>)>, Vec<usize>) {
    let mut labels = Vec::with_capacity(targets.len());
    let mut globals = Vec::new();
    for target in targets {
        let start = globals.len();
        let base = asm.registry.range(target.var).start;
        globals.extend(target.indices.iter().map(|&i| base + i));
        labels.push((target.name.clone(), start..globals.len()));
    }
    (labels, globals)
}

/// Computes total derivatives from the current linearization.
///
/// The perturbation side (design variables in direct mode, responses in adjoint mode) is
/// split into groups with disjoint relevant unknowns; each group is solved on the operator
/// restricted to those unknowns. Any linear solve failure aborts the whole request.
#[instrument(skip_all, name = "total_derivatives")]
pub(crate) fn compute_totals(
    asm: &Assembly,
    comm: &Arc<dyn Collective>,
    solver: &dyn LinearSolver,
    design_vars: &[Target],
    responses: &[Target],
    mode: SolveMode,
    reporter: &ProgressReporter<'_>,
) -> Result<TotalJacobian, MdoError> {
    let (wrt, wrt_globals) = expand(asm, design_vars);
    let (of, of_globals) = expand(asm, responses);
    let mut values = DMatrix::zeros(of_globals.len(), wrt_globals.len());

    let operator = asm.jacobian.get_operator(&asm.registry, asm.blocks.clone());
    let graph = RelevanceGraph::new(
        asm.registry.outputs().len(),
        &asm.jacobian.dependency_edges(&asm.registry),
    );

    let position = |t: &Target| asm.registry.position(t.var);
    let (seeds, others) = match mode {
        SolveMode::Direct => (design_vars, responses),
        SolveMode::Adjoint => (responses, design_vars),
    };
    let other_positions: Vec<usize> = others.iter().map(position).collect();
    let reachable_others = match mode {
        SolveMode::Direct => graph.upstream(&other_positions),
        SolveMode::Adjoint => graph.downstream(&other_positions),
    };
    let relevant: Vec<BTreeSet<usize>> = seeds
        .iter()
        .map(|seed| {
            let from_seed = match mode {
                SolveMode::Direct => graph.downstream(&[position(seed)]),
                SolveMode::Adjoint => graph.upstream(&[position(seed)]),
            };
            from_seed.intersection(&reachable_others).copied().collect()
        })
        .collect();
    let groups = partition_seeds(&relevant);

    info!(%mode, groups = groups.len(), unknowns = operator.dim(), "Solving for total derivatives");
    reporter.report(Progress::ModeSelected {
        mode,
        groups: groups.len(),
    });
    reporter.report(Progress::TaskStart {
        total_steps: groups.len() as u64,
    });

    let (seed_labels, seed_globals, other_globals) = match mode {
        SolveMode::Direct => (&wrt, &wrt_globals, &of_globals),
        SolveMode::Adjoint => (&of, &of_globals, &wrt_globals),
    };

    for group in &groups {
        let mut indices: Vec<usize> = group
            .relevant
            .iter()
            .flat_map(|&p| asm.registry.range(asm.registry.outputs()[p]))
            .collect();
        indices.sort_unstable();
        let local: HashMap<usize, usize> = indices.iter().enumerate().map(|(l, &g)| (g, l)).collect();
        let restricted = operator.restrict(&indices);

        // One right-hand side per selected entry of each seed in the group.
        let mut slots = Vec::new();
        let mut rhs = Vec::new();
        for &seed in &group.seeds {
            for slot in seed_labels[seed].1.clone() {
                let mut b = DVector::zeros(indices.len());
                if let Some(&l) = local.get(&seed_globals[slot]) {
                    b[l] = 1.0;
                }
                slots.push(slot);
                rhs.push(b);
            }
        }

        debug!(
            seeds = ?group.seeds,
            rhs = rhs.len(),
            unknowns = indices.len(),
            "Solving VOI group"
        );
        let solved = solver.solve_many(&restricted, &rhs, mode, comm);
        if let Err(failed) = comm.all_agree(solved.is_ok()) {
            solved?;
            return Err(MdoError::RemoteFailure {
                rank: failed,
                phase: "linear solve",
            });
        }
        let solutions = solved?;

        for (slot, solution) in slots.into_iter().zip(solutions) {
            for (k, global) in other_globals.iter().enumerate() {
                let Some(&l) = local.get(global) else {
                    continue;
                };
                match mode {
                    SolveMode::Direct => values[(k, slot)] = solution.x[l],
                    SolveMode::Adjoint => values[(slot, k)] = solution.x[l],
                }
            }
        }
        reporter.report(Progress::TaskIncrement);
    }
    reporter.report(Progress::TaskFinish);

    Ok(TotalJacobian {
        of,
        wrt,
        values,
        mode,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::LinearSolverConfig;
    use crate::engine::distributed::collective::SerialComm;
    use crate::engine::execution::{ApproxSettings, linearize_all, run_model};
    use crate::engine::setup::assemble;
    use crate::engine::solvers::{LinearSolveFailure, build_solver};
    use crate::testing::{chain_model, parallel_model};
    use std::sync::Mutex;

    fn prepared(model: crate::core::models::system::Model) -> Assembly {
        let mut asm = assemble(model, 1).unwrap();
        let comm = SerialComm;
        run_model(&mut asm, &comm, &mut Vec::new()).unwrap();
        linearize_all(
            &mut asm,
            &comm,
            ApproxSettings {
                fd: Default::default(),
                force_fd: false,
            },
        )
        .unwrap();
        asm
    }

    fn totals(asm: &Assembly, dvs: &[&str], responses: &[&str], mode: SolveMode) -> TotalJacobian {
        let comm: Arc<dyn Collective> = Arc::new(SerialComm);
        let dvs: Vec<VariableSelection> = dvs.iter().map(|&d| d.into()).collect();
        let responses: Vec<VariableSelection> = responses.iter().map(|&r| r.into()).collect();
        compute_totals(
            asm,
            &comm,
            build_solver(&LinearSolverConfig::direct()).as_ref(),
            &resolve_design_vars(asm, &dvs).unwrap(),
            &resolve_responses(asm, &responses).unwrap(),
            mode,
            &ProgressReporter::new(),
        )
        .unwrap()
    }

    #[test]
    fn auto_mode_compares_sizes() {
        assert_eq!(select_mode(1, 3, ModeSelection::Auto), SolveMode::Direct);
        assert_eq!(select_mode(3, 3, ModeSelection::Auto), SolveMode::Direct);
        assert_eq!(select_mode(4, 3, ModeSelection::Auto), SolveMode::Adjoint);
        assert_eq!(select_mode(1, 3, ModeSelection::Adjoint), SolveMode::Adjoint);
    }

    #[test]
    fn chain_rule_holds_in_both_modes() {
        let asm = prepared(chain_model());
        for mode in [SolveMode::Direct, SolveMode::Adjoint] {
            let jac = totals(&asm, &["x"], &["z"], mode);
            assert!((jac.get("z", "x").unwrap()[(0, 0)] - 6.0).abs() < 1e-12, "{mode}");
            assert_eq!(jac.mode(), mode);
        }
    }

    #[test]
    fn input_names_resolve_to_their_source() {
        let asm = prepared(chain_model());
        let jac = totals(&asm, &["x"], &["B.y"], SolveMode::Direct);
        assert!((jac.matrix()[(0, 0)] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn design_variables_must_be_independent() {
        let asm = prepared(chain_model());
        let err = resolve_design_vars(&asm, &["y".into()]).unwrap_err();
        assert!(matches!(err, MdoError::Setup(SetupError::InvalidDesignVariable { .. })));
        let err = resolve_responses(&asm, &[VariableSelection::with_indices("z", vec![1])]).unwrap_err();
        assert!(matches!(err, MdoError::Setup(SetupError::InvalidIndices { index: 1, .. })));
    }

    #[test]
    fn independent_branches_are_solved_as_separate_groups() {
        let asm = prepared(parallel_model());
        let events = Mutex::new(Vec::new());
        let reporter = ProgressReporter::with_callback(Box::new(|e| {
            if let Ok(mut events) = events.lock() {
                events.push(e);
            }
        }));
        let comm: Arc<dyn Collective> = Arc::new(SerialComm);
        let dvs = resolve_design_vars(&asm, &["a".into(), "b".into()]).unwrap();
        let responses = resolve_responses(&asm, &["ya".into(), "yb".into()]).unwrap();
        let jac = compute_totals(
            &asm,
            &comm,
            build_solver(&LinearSolverConfig::direct()).as_ref(),
            &dvs,
            &responses,
            SolveMode::Direct,
            &reporter,
        )
        .unwrap();
        drop(reporter);

        let events = events.into_inner().unwrap();
        assert!(events.contains(&Progress::ModeSelected {
            mode: SolveMode::Direct,
            groups: 2
        }));
        // Cross terms are exact zeros, not solved values.
        assert_eq!(jac.get("ya", "b").unwrap()[(0, 0)], 0.0);
        assert_eq!(jac.get("yb", "a").unwrap()[(0, 0)], 0.0);
        assert!(jac.get("ya", "a").unwrap()[(0, 0)].abs() > 0.0);
    }

    #[test]
    fn a_failing_solve_aborts_the_request() {
        let asm = prepared(crate::testing::sellar_model());
        let comm: Arc<dyn Collective> = Arc::new(SerialComm);
        let starved = LinearSolverConfig::krylov().with_max_iterations(1).with_tolerance(1e-14);
        let err = compute_totals(
            &asm,
            &comm,
            build_solver(&starved).as_ref(),
            &resolve_design_vars(&asm, &["x".into(), "z".into()]).unwrap(),
            &resolve_responses(&asm, &["obj".into()]).unwrap(),
            SolveMode::Direct,
            &ProgressReporter::new(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            MdoError::LinearSolve(e) if e.reason == LinearSolveFailure::IterationLimit
        ));
    }
}
