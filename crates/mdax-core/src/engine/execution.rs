use super::distributed::collective::Collective;
use super::distributed::partition::{gather_with_status, partition_range};
use super::error::{ConnectionError, MdoError};
use super::setup::{Assembly, ComponentLayout, Step};
use crate::core::jacobian::approx::{ColumnRef, ColumnSweep, FdConfig, WrtRef};
use crate::core::jacobian::block::{JacobianBlock, PartialPattern, Partials};
use crate::core::models::component::{Component, ComponentError, Linearization};
use crate::core::models::ids::{SystemId, VarId};
use crate::core::models::system::NonlinearIteration;
use crate::core::models::variable::VarSet;
use nalgebra::DMatrix;
use std::collections::HashMap;
use tracing::{debug, instrument, trace, warn};

/// Derivative approximation defaults applied to components without their own options.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ApproxSettings {
    pub fd: FdConfig,
    pub force_fd: bool,
}

fn component_of<'a>(
    asm: &'a Assembly,
    layout: &ComponentLayout,
) -> Result<&'a dyn Component, MdoError> {
    asm.model
        .system(layout.id)
        .and_then(|n| n.component())
        .ok_or_else(|| {
            MdoError::component(
                &layout.path,
                ComponentError::Failed("system is not a component".to_string()),
            )
        })
}

/// Collects the current input values of a component from their sources.
///
/// # Errors
///
/// Fails with [`MdoError::UninitializedOutput`] naming the component if a source output has
/// never been computed or set.
fn gather_inputs(asm: &Assembly, layout: &ComponentLayout) -> Result<VarSet<f64>, MdoError> {
    let mut set = VarSet::new();
    for &input in &layout.inputs {
        let var = asm.registry.var(input);
        let source = asm.registry.source(input).ok_or_else(|| ConnectionError::Unconnected {
            input: var.path.clone(),
        })?;
        let src = asm.registry.read(source.output, &layout.path)?;
        let values: Vec<f64> = match &source.indices {
            Some(ix) => ix.iter().map(|&i| src[i]).collect(),
            None => src.to_vec(),
        };
        set.push(&var.local, var.shape.clone(), &values, true);
    }
    Ok(set)
}

fn output_set(asm: &Assembly, layout: &ComponentLayout, written: bool) -> VarSet<f64> {
    let mut set = VarSet::new();
    for &output in &layout.outputs {
        let var = asm.registry.var(output);
        set.push(&var.local, var.shape.clone(), asm.registry.value(output), written);
    }
    set
}

/// Runs the model schedule once on this rank.
#[instrument(skip_all, name = "run_model")]
pub(crate) fn run_model(
    asm: &mut Assembly,
    comm: &dyn Collective,
    trace_log: &mut Vec<String>,
) -> Result<(), MdoError> {
    let schedule = asm.schedule.clone();
    run_steps(asm, comm, &schedule, trace_log)?;

    if comm.size() > 1 {
        // Rank 0 is authoritative for the final state.
        let unknowns = comm.broadcast(0, asm.registry.unknowns().to_vec());
        if unknowns.len() == asm.registry.n_unknowns() {
            asm.registry.unknowns_mut().copy_from_slice(&unknowns);
        }
    }
    Ok(())
}

fn run_steps(
    asm: &mut Assembly,
    comm: &dyn Collective,
    steps: &[Step],
    trace_log: &mut Vec<String>,
) -> Result<(), MdoError> {
    for step in steps {
        match step {
            Step::Run(index) => run_component(asm, *index, trace_log)?,
            Step::Parallel { path, branches } => {
                run_parallel(asm, comm, path, branches, trace_log)?;
            }
            Step::Iterate {
                path,
                settings,
                body,
            } => iterate(asm, comm, path, *settings, body, trace_log)?,
        }
    }
    Ok(())
}

fn run_component(asm: &mut Assembly, index: usize, trace_log: &mut Vec<String>) -> Result<(), MdoError> {
    let layout = asm.components[index].clone();
    let inputs = gather_inputs(asm, &layout)?;
    let mut outputs = output_set(asm, &layout, false);

    let residuals = {
        let component = component_of(asm, &layout)?;
        component
            .compute(&inputs, &mut outputs)
            .map_err(|e| MdoError::component(&layout.path, e))?;
        if layout.implicit {
            let mut residuals = outputs.zeroed();
            component
                .apply_residual(&inputs, &outputs, &mut residuals)
                .map_err(|e| MdoError::component(&layout.path, e))?;
            Some(residuals)
        } else {
            None
        }
    };

    for (i, &input) in layout.inputs.iter().enumerate() {
        asm.registry.write(input, &inputs.as_slice()[inputs.range_at(i)]);
    }
    for (i, &output) in layout.outputs.iter().enumerate() {
        let range = outputs.range_at(i);
        if outputs.is_written(i) {
            asm.registry.write(output, &outputs.as_slice()[range.clone()]);
        }
        if let Some(res) = &residuals {
            asm.registry.write_residual(output, &res.as_slice()[range]);
        }
    }
    trace!(component = %layout.path, "Computed");
    trace_log.push(layout.path);
    Ok(())
}

/// Flat `[initialized, values...]` records for the outputs of the given components.
fn pack_outputs(asm: &Assembly, components: &[usize]) -> Vec<f64> {
    let mut data = Vec::new();
    for &c in components {
        for &output in &asm.components[c].outputs {
            data.push(if asm.registry.is_initialized(output) { 1.0 } else { 0.0 });
            data.extend_from_slice(asm.registry.value(output));
        }
    }
    data
}

fn unpack_outputs(asm: &mut Assembly, components: &[usize], data: &[f64]) {
    let mut cursor = 0;
    for &c in components {
        let outputs = asm.components[c].outputs.clone();
        for output in outputs {
            let size = asm.registry.var(output).size();
            let Some(record) = data.get(cursor..cursor + 1 + size) else {
                return;
            };
            if record[0] == 1.0 {
                asm.registry.write(output, &record[1..]);
            }
            cursor += 1 + size;
        }
    }
}

fn run_parallel(
    asm: &mut Assembly,
    comm: &dyn Collective,
    path: &str,
    branches: &[(usize, Vec<Step>)],
    trace_log: &mut Vec<String>,
) -> Result<(), MdoError> {
    let rank = comm.rank();
    let mut outcome = Ok(());
    for (owner, body) in branches {
        if *owner == rank {
            outcome = run_steps(asm, comm, body, trace_log);
            if outcome.is_err() {
                break;
            }
        }
    }
    if comm.size() == 1 {
        return outcome;
    }

    let owned_by = |r: usize| -> Vec<usize> {
        branches
            .iter()
            .filter(|(owner, _)| *owner == r)
            .flat_map(|(_, body)| Step::components(body))
            .collect()
    };
    let payload = if outcome.is_ok() {
        pack_outputs(asm, &owned_by(rank))
    } else {
        Vec::new()
    };
    match gather_with_status(comm, outcome.is_ok(), payload) {
        Ok(all) => {
            for (r, data) in all.iter().enumerate() {
                if r != rank {
                    unpack_outputs(asm, &owned_by(r), data);
                }
            }
            debug!(group = %path, "Synchronized parallel outputs");
            Ok(())
        }
        Err(failed) => {
            outcome?;
            Err(MdoError::RemoteFailure {
                rank: failed,
                phase: "compute",
            })
        }
    }
}

fn iterate(
    asm: &mut Assembly,
    comm: &dyn Collective,
    path: &str,
    settings: NonlinearIteration,
    body: &[Step],
    trace_log: &mut Vec<String>,
) -> Result<(), MdoError> {
    let outputs: Vec<VarId> = Step::components(body)
        .into_iter()
        .flat_map(|c| asm.components[c].outputs.clone())
        .collect();
    let snapshot = |asm: &Assembly| -> Vec<f64> {
        outputs
            .iter()
            .flat_map(|&o| asm.registry.value(o).to_vec())
            .collect()
    };

    let mut previous = snapshot(asm);
    let mut change = f64::INFINITY;
    for iteration in 1..=settings.max_iterations {
        run_steps(asm, comm, body, trace_log)?;
        let current = snapshot(asm);
        change = current
            .iter()
            .zip(&previous)
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>()
            .sqrt();
        previous = current;
        trace!(group = %path, iteration, change, "Nonlinear Gauss-Seidel iteration");
        if iteration > 1 && change <= settings.tolerance {
            debug!(group = %path, iterations = iteration, "Nonlinear iteration converged");
            return Ok(());
        }
    }
    warn!(
        group = %path,
        iterations = settings.max_iterations,
        change,
        "Nonlinear iteration did not converge"
    );
    Ok(())
}

fn partials_for(asm: &Assembly, layout: &ComponentLayout) -> Partials {
    let mut partials = Partials::new();
    for rp in &layout.partials {
        let of = asm.registry.var(layout.outputs[rp.of]);
        let wrt = asm.registry.var(layout.wrt_var(rp.wrt));
        partials.declare(
            &of.local,
            &wrt.local,
            JacobianBlock::zeros(&rp.pattern, of.size(), wrt.size()),
        );
    }
    partials
}

/// Analytic partials in the component's own convention, or `None` if it has none.
fn analytic_partials(
    asm: &Assembly,
    layout: &ComponentLayout,
    inputs: &VarSet<f64>,
    outputs: &VarSet<f64>,
) -> Result<Option<Vec<JacobianBlock>>, MdoError> {
    let component = component_of(asm, layout)?;
    let mut partials = partials_for(asm, layout);
    let produced = component
        .linearize(inputs, outputs, &mut partials)
        .map_err(|e| MdoError::component(&layout.path, e))?;
    if produced == Linearization::Unavailable {
        return Ok(None);
    }
    let blocks = partials
        .into_entries()
        .into_iter()
        .map(|(_, _, block)| block)
        .collect();
    Ok(Some(blocks))
}

fn distinct_wrt(layout: &ComponentLayout) -> Vec<WrtRef> {
    let mut wrts = Vec::new();
    for rp in &layout.partials {
        if !wrts.contains(&rp.wrt) {
            wrts.push(rp.wrt);
        }
    }
    wrts
}

/// Builds the declared blocks out of approximated columns.
/// Position of each perturbed column in a sweep's evaluation order.
fn column_index(columns: &[ColumnRef]) -> HashMap<ColumnRef, usize> {
    columns.iter().enumerate().map(|(k, &c)| (c, k)).collect()
}

fn blocks_from_columns(
    layout: &ComponentLayout,
    outputs: &VarSet<f64>,
    inputs: &VarSet<f64>,
    columns: &[ColumnRef],
    values: &[Vec<f64>],
) -> Vec<JacobianBlock> {
    let index = column_index(columns);
    layout
        .partials
        .iter()
        .map(|rp| {
            let rows = outputs.range_at(rp.of);
            let ncols = match rp.wrt {
                WrtRef::Input(i) => inputs.range_at(i).len(),
                WrtRef::Output(i) => outputs.range_at(i).len(),
            };
            let column_of = |j: usize| {
                index
                    .get(&ColumnRef { wrt: rp.wrt, index: j })
                    .and_then(|&k| values.get(k))
            };
            let entry = |r: usize, c: usize| {
                column_of(c)
                    .and_then(|col| col.get(rows.start + r))
                    .copied()
                    .unwrap_or(0.0)
            };
            match &rp.pattern {
                PartialPattern::Dense => {
                    JacobianBlock::Dense(DMatrix::from_fn(rows.len(), ncols, entry))
                }
                PartialPattern::Sparse { rows: r, cols: c } => JacobianBlock::Sparse {
                    nrows: rows.len(),
                    ncols,
                    rows: r.clone(),
                    cols: c.clone(),
                    values: r.iter().zip(c).map(|(&i, &j)| entry(i, j)).collect(),
                },
            }
        })
        .collect()
}

/// Approximates a component's declared partials column by column.
///
/// Replicated components split their columns over the ranks and gather the results; owned
/// components evaluate every column locally.
fn approximate_partials(
    asm: &Assembly,
    layout: &ComponentLayout,
    comm: &dyn Collective,
    fd: FdConfig,
    inputs: VarSet<f64>,
    outputs: VarSet<f64>,
) -> Result<Vec<JacobianBlock>, MdoError> {
    let component = component_of(asm, layout)?;
    let mut sweep = ColumnSweep::new(component, layout.implicit, fd, inputs, outputs);
    let columns = sweep.columns(&distinct_wrt(layout));
    let width = sweep.outputs().flat_len();

    let distribute = layout.owner.is_none() && comm.size() > 1;
    let share = if distribute {
        partition_range(columns.len(), comm.size(), comm.rank())
    } else {
        0..columns.len()
    };

    let mut local = Vec::with_capacity(share.len());
    let mut failure = None;
    for &column in &columns[share] {
        match sweep.evaluate(column) {
            Ok(values) => local.push(values),
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }

    let values = if distribute {
        let payload: Vec<f64> = local.iter().flatten().copied().collect();
        match gather_with_status(comm, failure.is_none(), payload) {
            Ok(parts) => parts
                .into_iter()
                .flat_map(|part| {
                    part.chunks(width.max(1))
                        .map(<[f64]>::to_vec)
                        .collect::<Vec<_>>()
                })
                .collect(),
            Err(rank) => {
                return Err(match failure {
                    Some(e) => MdoError::component(&layout.path, e),
                    None => MdoError::RemoteFailure {
                        rank,
                        phase: "linearize",
                    },
                });
            }
        }
    } else {
        if let Some(e) = failure {
            return Err(MdoError::component(&layout.path, e));
        }
        local
    };

    Ok(blocks_from_columns(
        layout,
        sweep.outputs(),
        sweep.inputs(),
        &columns,
        &values,
    ))
}

fn linearize_component(
    asm: &mut Assembly,
    layout: &ComponentLayout,
    comm: &dyn Collective,
    settings: ApproxSettings,
) -> Result<(), MdoError> {
    if layout.partials.is_empty() {
        return Ok(());
    }
    let inputs = gather_inputs(asm, layout)?;
    let outputs = output_set(asm, layout, true);

    let analytic = if layout.force_fd || settings.force_fd {
        None
    } else {
        analytic_partials(asm, layout, &inputs, &outputs)?
    };
    let blocks = match analytic {
        Some(blocks) => blocks,
        None => {
            let fd = layout.fd.unwrap_or(settings.fd);
            trace!(component = %layout.path, form = ?fd.form, "Approximating partials");
            approximate_partials(asm, layout, comm, fd, inputs, outputs)?
        }
    };

    for (rp, mut block) in layout.partials.iter().zip(blocks) {
        // Explicit outputs enter the residual form as u - f(p).
        if !layout.implicit {
            block.scale(-1.0);
        }
        let row = layout.outputs[rp.of];
        let col = layout.wrt_var(rp.wrt);
        asm.jacobian.set_block(&asm.registry, row, col, block)?;
    }
    Ok(())
}

/// Refreshes every partial block at the current point.
///
/// Components owned by one rank are linearized there and their blocks are then shared, so
/// every rank ends up with the same Jacobian.
#[instrument(skip_all, name = "linearize")]
pub(crate) fn linearize_all(
    asm: &mut Assembly,
    comm: &dyn Collective,
    settings: ApproxSettings,
) -> Result<(), MdoError> {
    let rank = comm.rank();
    let mut owned_failure = None;
    for index in 0..asm.components.len() {
        let layout = asm.components[index].clone();
        if !layout.runs_on(rank) {
            continue;
        }
        let result = linearize_component(asm, &layout, comm, settings);
        match (result, layout.owner) {
            (Ok(()), _) => {}
            // Owned failures are reported after the exchange so no rank is left waiting.
            (Err(e), Some(_)) if comm.size() > 1 => {
                owned_failure = Some(e);
                break;
            }
            (Err(e), _) => return Err(e),
        }
    }

    if comm.size() > 1 {
        let owners: HashMap<SystemId, usize> = asm
            .components
            .iter()
            .filter_map(|c| c.owner.map(|o| (c.id, o)))
            .collect();
        let payload = if owned_failure.is_none() {
            asm.jacobian
                .owned_values(|sys| owners.get(&sys) == Some(&rank))
        } else {
            Vec::new()
        };
        match gather_with_status(comm, owned_failure.is_none(), payload) {
            Ok(all) => {
                for (r, data) in all.iter().enumerate() {
                    if r != rank {
                        asm.jacobian
                            .load_owned_values(|sys| owners.get(&sys) == Some(&r), data);
                    }
                }
            }
            Err(failed) => {
                return Err(owned_failure.unwrap_or(MdoError::RemoteFailure {
                    rank: failed,
                    phase: "linearize",
                }));
            }
        }
    }
    debug!(blocks = asm.jacobian.len(), "Linearized model");
    Ok(())
}

/// Comparison of one partial block against its finite-difference approximation.
#[derive(Debug, Clone)]
pub struct PartialCheck {
    pub component: String,
    pub of: String,
    pub wrt: String,
    /// False for pairs the component treats as structural zeros.
    pub declared: bool,
    /// `None` when the component provides no analytic partials or the pair is undeclared.
    pub analytic: Option<DMatrix<f64>>,
    pub approximate: DMatrix<f64>,
    /// Frobenius norm of `analytic - approximate`; for an undeclared pair, the largest
    /// approximated magnitude.
    pub abs_error: Option<f64>,
    /// `abs_error` relative to the norm of the approximation.
    pub rel_error: Option<f64>,
}

/// Compares partials with finite differences for every component this rank runs. Results
/// are rank-local; nothing is exchanged with the other ranks.
///
/// Every (output, wrt) pair is approximated, declared or not, so a dependency missing from the
/// declared sparsity shows up as an undeclared pair with a nonzero error. Values are in the
/// component's own convention (`df/dp` for explicit components).
pub(crate) fn check_partials(
    asm: &Assembly,
    comm: &dyn Collective,
    fd: FdConfig,
) -> Result<Vec<PartialCheck>, MdoError> {
    let mut checks = Vec::new();
    for layout in asm.components.iter().filter(|c| c.runs_on(comm.rank())) {
        if layout.outputs.is_empty() || layout.independent {
            continue;
        }
        let inputs = gather_inputs(asm, layout)?;
        let outputs = output_set(asm, layout, true);
        let analytic = if layout.partials.is_empty() {
            None
        } else {
            analytic_partials(asm, layout, &inputs, &outputs)?
        };

        let mut wrts: Vec<WrtRef> = (0..layout.inputs.len()).map(WrtRef::Input).collect();
        if layout.implicit {
            wrts.extend((0..layout.outputs.len()).map(WrtRef::Output));
        }
        let component = component_of(asm, layout)?;
        let fd = layout.fd.unwrap_or(fd);
        let mut sweep = ColumnSweep::new(component, layout.implicit, fd, inputs, outputs);
        let columns = sweep.columns(&wrts);
        let index = column_index(&columns);
        let mut values = Vec::with_capacity(columns.len());
        for &column in &columns {
            values.push(
                sweep
                    .evaluate(column)
                    .map_err(|e| MdoError::component(&layout.path, e))?,
            );
        }

        let widths: Vec<usize> = wrts
            .iter()
            .map(|&wrt| columns.iter().filter(|c| c.wrt == wrt).count())
            .collect();
        for of in 0..layout.outputs.len() {
            let rows = sweep.outputs().range_at(of);
            for (&wrt, &ncols) in wrts.iter().zip(&widths) {
                let approximate = DMatrix::from_fn(rows.len(), ncols, |r, c| {
                    index
                        .get(&ColumnRef { wrt, index: c })
                        .and_then(|&k| values[k].get(rows.start + r))
                        .copied()
                        .unwrap_or(0.0)
                });
                let declared = layout.partials.iter().position(|p| p.of == of && p.wrt == wrt);
                let analytic = declared
                    .and_then(|k| analytic.as_ref().and_then(|blocks| blocks.get(k)))
                    .map(JacobianBlock::to_dense);
                let abs_error = match (&analytic, declared) {
                    (Some(a), _) => Some((a - &approximate).norm()),
                    (None, None) => Some(approximate.amax()),
                    (None, Some(_)) => None,
                };
                let rel_error = abs_error.map(|abs| {
                    let scale = approximate.norm();
                    if scale > 0.0 { abs / scale } else { abs }
                });
                checks.push(PartialCheck {
                    component: layout.path.clone(),
                    of: asm.registry.var(layout.outputs[of]).local.clone(),
                    wrt: asm.registry.var(layout.wrt_var(wrt)).local.clone(),
                    declared: declared.is_some(),
                    analytic,
                    approximate,
                    abs_error,
                    rel_error,
                });
            }
        }
    }
    Ok(checks)
}
